//! PostgreSQL-backed trial store and audit log.

use async_trait::async_trait;
use common::{ProtocolVersionId, SiteId, TrialId};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Result, TrialError,
    audit::{AuditEntry, AuditQuery, AuditSink},
    model::{
        LinkedSite, ProtocolVersion, Site, SiteRegistration, Trial, TrialFilter, TrialPage,
        TrialSiteLink, TrialSummary,
    },
    store::TrialStore,
};

const TRIAL_COLUMNS: &str = "id, name, phase, status, version, created_at, updated_at";

/// PostgreSQL trial store. Tables are created by the workspace migrations.
#[derive(Clone)]
pub struct PgTrialStore {
    pool: PgPool,
}

impl PgTrialStore {
    /// Creates a new store over a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_trial(row: &PgRow) -> Result<Trial> {
        let phase: String = row.try_get("phase")?;
        let status: String = row.try_get("status")?;
        Ok(Trial {
            id: TrialId::from_uuid(row.try_get("id")?),
            name: row.try_get("name")?,
            phase: phase.parse()?,
            status: status.parse()?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_protocol(row: &PgRow) -> Result<ProtocolVersion> {
        Ok(ProtocolVersion {
            id: ProtocolVersionId::from_uuid(row.try_get("id")?),
            trial_id: TrialId::from_uuid(row.try_get("trial_id")?),
            version: row.try_get("version")?,
            notes: row.try_get("notes")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn remembered(
        tx: &mut Transaction<'_, Postgres>,
        key: Option<&str>,
    ) -> Result<Option<Uuid>> {
        let Some(key) = key else {
            return Ok(None);
        };
        let id: Option<Uuid> =
            sqlx::query_scalar("SELECT entity_id FROM idempotency_keys WHERE key = $1")
                .bind(key)
                .fetch_optional(&mut **tx)
                .await?;
        Ok(id)
    }

    async fn remember(
        tx: &mut Transaction<'_, Postgres>,
        key: Option<&str>,
        entity: &str,
        id: Uuid,
    ) -> Result<()> {
        if let Some(key) = key {
            sqlx::query("INSERT INTO idempotency_keys (key, entity, entity_id) VALUES ($1, $2, $3)")
                .bind(key)
                .bind(entity)
                .bind(id)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    async fn trial_exists(tx: &mut Transaction<'_, Postgres>, trial_id: TrialId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM trials WHERE id = $1)")
            .bind(trial_id.as_uuid())
            .fetch_one(&mut **tx)
            .await?;
        Ok(exists)
    }

    async fn registration_for_link(
        tx: &mut Transaction<'_, Postgres>,
        link_id: Uuid,
    ) -> Result<Option<SiteRegistration>> {
        let row = sqlx::query(
            r#"
            SELECT ts.trial_id, ts.site_id, ts.status, s.name, s.country
            FROM trial_sites ts
            JOIN sites s ON s.id = ts.site_id
            WHERE ts.id = $1
            "#,
        )
        .bind(link_id)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let site_id = SiteId::from_uuid(row.try_get("site_id")?);
        let status: String = row.try_get("status")?;
        Ok(Some(SiteRegistration {
            site: Site {
                id: site_id,
                name: row.try_get("name")?,
                country: row.try_get("country")?,
            },
            link: TrialSiteLink {
                trial_id: TrialId::from_uuid(row.try_get("trial_id")?),
                site_id,
                status: status.parse()?,
            },
        }))
    }
}

#[async_trait]
impl TrialStore for PgTrialStore {
    async fn insert_trial(&self, trial: Trial, idempotency_key: Option<&str>) -> Result<Trial> {
        let mut tx = self.pool.begin().await?;

        if let Some(id) = Self::remembered(&mut tx, idempotency_key).await? {
            let row = sqlx::query(&format!("SELECT {TRIAL_COLUMNS} FROM trials WHERE id = $1"))
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
            if let Some(row) = row {
                return Self::row_to_trial(&row);
            }
        }

        sqlx::query(
            r#"
            INSERT INTO trials (id, name, phase, status, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(trial.id.as_uuid())
        .bind(&trial.name)
        .bind(trial.phase.as_str())
        .bind(trial.status.as_str())
        .bind(trial.version)
        .bind(trial.created_at)
        .bind(trial.updated_at)
        .execute(&mut *tx)
        .await?;
        Self::remember(&mut tx, idempotency_key, "trial", trial.id.as_uuid()).await?;

        tx.commit().await?;
        Ok(trial)
    }

    async fn get_trial(&self, trial_id: TrialId) -> Result<Option<Trial>> {
        let row = sqlx::query(&format!("SELECT {TRIAL_COLUMNS} FROM trials WHERE id = $1"))
            .bind(trial_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_trial).transpose()
    }

    async fn update_trial(&self, trial: Trial, expected_version: i64) -> Result<Trial> {
        let result = sqlx::query(
            r#"
            UPDATE trials
            SET name = $2, phase = $3, status = $4, version = $5, updated_at = $6
            WHERE id = $1 AND version = $7
            "#,
        )
        .bind(trial.id.as_uuid())
        .bind(&trial.name)
        .bind(trial.phase.as_str())
        .bind(trial.status.as_str())
        .bind(trial.version)
        .bind(trial.updated_at)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(trial);
        }

        match self.get_trial(trial.id).await? {
            Some(current) => Err(TrialError::StaleData {
                expected: expected_version,
                actual: current.version,
            }),
            None => Err(TrialError::trial_not_found(trial.id)),
        }
    }

    async fn delete_trial(&self, trial_id: TrialId) -> Result<bool> {
        // protocol_versions and trial_sites cascade
        let result = sqlx::query("DELETE FROM trials WHERE id = $1")
            .bind(trial_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_protocol_version(
        &self,
        protocol: ProtocolVersion,
        idempotency_key: Option<&str>,
    ) -> Result<ProtocolVersion> {
        let mut tx = self.pool.begin().await?;

        if let Some(id) = Self::remembered(&mut tx, idempotency_key).await? {
            let row = sqlx::query(
                "SELECT id, trial_id, version, notes, created_at FROM protocol_versions WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(row) = row {
                return Self::row_to_protocol(&row);
            }
        }

        if !Self::trial_exists(&mut tx, protocol.trial_id).await? {
            return Err(TrialError::trial_not_found(protocol.trial_id));
        }

        sqlx::query(
            r#"
            INSERT INTO protocol_versions (id, trial_id, version, notes, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(protocol.id.as_uuid())
        .bind(protocol.trial_id.as_uuid())
        .bind(&protocol.version)
        .bind(&protocol.notes)
        .bind(protocol.created_at)
        .execute(&mut *tx)
        .await?;
        Self::remember(
            &mut tx,
            idempotency_key,
            "protocol_version",
            protocol.id.as_uuid(),
        )
        .await?;

        tx.commit().await?;
        Ok(protocol)
    }

    async fn delete_protocol_version(&self, id: ProtocolVersionId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM protocol_versions WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn register_site(
        &self,
        trial_id: TrialId,
        site_name: &str,
        country: &str,
        idempotency_key: Option<&str>,
    ) -> Result<SiteRegistration> {
        let mut tx = self.pool.begin().await?;

        if let Some(link_id) = Self::remembered(&mut tx, idempotency_key).await?
            && let Some(existing) = Self::registration_for_link(&mut tx, link_id).await?
        {
            return Ok(existing);
        }

        if !Self::trial_exists(&mut tx, trial_id).await? {
            return Err(TrialError::trial_not_found(trial_id));
        }

        // Upsert; the no-op update makes RETURNING yield the existing row.
        let site_row = sqlx::query(
            r#"
            INSERT INTO sites (id, name, country)
            VALUES ($1, $2, $3)
            ON CONFLICT ON CONSTRAINT unique_site_name_country
            DO UPDATE SET name = EXCLUDED.name
            RETURNING id, name, country
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(site_name)
        .bind(country)
        .fetch_one(&mut *tx)
        .await?;

        let site = Site {
            id: SiteId::from_uuid(site_row.try_get("id")?),
            name: site_row.try_get("name")?,
            country: site_row.try_get("country")?,
        };

        let link_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO trial_sites (id, trial_id, site_id, status) VALUES ($1, $2, $3, 'pending')",
        )
        .bind(link_id)
        .bind(trial_id.as_uuid())
        .bind(site.id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("unique_trial_site")
            {
                return TrialError::DuplicateSiteLink {
                    trial_id,
                    site_id: site.id,
                };
            }
            TrialError::Database(e)
        })?;
        Self::remember(&mut tx, idempotency_key, "trial_site", link_id).await?;

        tx.commit().await?;
        Ok(SiteRegistration {
            link: TrialSiteLink {
                trial_id,
                site_id: site.id,
                status: crate::phase::LinkStatus::Pending,
            },
            site,
        })
    }

    async fn delete_site_link(&self, trial_id: TrialId, site_id: SiteId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM trial_sites WHERE trial_id = $1 AND site_id = $2")
            .bind(trial_id.as_uuid())
            .bind(site_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn protocol_versions(&self, trial_id: TrialId) -> Result<Vec<ProtocolVersion>> {
        let rows = sqlx::query(
            r#"
            SELECT id, trial_id, version, notes, created_at
            FROM protocol_versions
            WHERE trial_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(trial_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_protocol).collect()
    }

    async fn linked_sites(&self, trial_id: TrialId) -> Result<Vec<LinkedSite>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.name, s.country, ts.status
            FROM trial_sites ts
            JOIN sites s ON s.id = ts.site_id
            WHERE ts.trial_id = $1
            ORDER BY ts.created_at ASC
            "#,
        )
        .bind(trial_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(LinkedSite {
                    site: Site {
                        id: SiteId::from_uuid(row.try_get("id")?),
                        name: row.try_get("name")?,
                        country: row.try_get("country")?,
                    },
                    status: status.parse()?,
                })
            })
            .collect()
    }

    async fn list_trials(&self, filter: &TrialFilter) -> Result<TrialPage> {
        let search = filter.search.as_ref().map(|s| format!("%{s}%"));
        let phase = filter.phase.map(|p| p.as_str());
        let status = filter.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM trials
            WHERE ($1::text IS NULL OR phase = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR name ILIKE $3)
            "#,
        )
        .bind(phase)
        .bind(status)
        .bind(&search)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT t.id, t.name, t.phase, t.status, t.version, t.created_at, t.updated_at,
                   (SELECT COUNT(*) FROM trial_sites ts WHERE ts.trial_id = t.id) AS site_count
            FROM trials t
            WHERE ($1::text IS NULL OR t.phase = $1)
              AND ($2::text IS NULL OR t.status = $2)
              AND ($3::text IS NULL OR t.name ILIKE $3)
            ORDER BY t.created_at DESC, t.id DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(phase)
        .bind(status)
        .bind(&search)
        .bind(filter.limit() as i64)
        .bind(filter.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .iter()
            .map(|row| {
                let site_count: i64 = row.try_get("site_count")?;
                Ok(TrialSummary {
                    trial: Self::row_to_trial(row)?,
                    site_count: site_count as usize,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(TrialPage {
            items,
            total: total as usize,
        })
    }
}

/// PostgreSQL audit log.
#[derive(Clone)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    /// Creates a new audit log over a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditLog {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (id, actor, action, entity, entity_id, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.actor)
        .bind(&entry.action)
        .bind(&entry.entity)
        .bind(&entry.entity_id)
        .bind(&entry.payload)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn entries(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, actor, action, entity, entity_id, payload, created_at
            FROM audit_logs
            WHERE ($1::text IS NULL OR entity = $1)
              AND ($2::text IS NULL OR entity_id = $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(&query.entity)
        .bind(&query.entity_id)
        .bind(query.limit() as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(AuditEntry {
                    id: row.try_get("id")?,
                    actor: row.try_get("actor")?,
                    action: row.try_get("action")?,
                    entity: row.try_get("entity")?,
                    entity_id: row.try_get("entity_id")?,
                    payload: row.try_get("payload")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
