//! Trial service: audited commands, compensations and queries.

use chrono::Utc;
use common::{ProtocolVersionId, SiteId, TrialId};
use serde::Serialize;

use crate::{
    Result, TrialError,
    audit::{AuditEntry, AuditQuery, AuditSink},
    commands::{AddProtocolVersion, CreateTrial, RegisterSiteToTrial, UpdateTrialMetadata},
    model::{ProtocolVersion, SiteRegistration, Trial, TrialDetails, TrialFilter, TrialPage},
    phase::Phase,
    store::TrialStore,
};

/// Outcome of a metadata update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataUpdate {
    pub trial: Trial,
    /// Human readable summary, e.g. `name: 'a' -> 'b'`, or `no changes`.
    pub changes: String,
}

/// Service for the trial registry.
///
/// Every command writes one audit record: `{action}` on success, or
/// `{action}_failed` with the error on failure. A failing audit write is
/// logged and never fails the command.
pub struct TrialService<S: TrialStore, A: AuditSink> {
    store: S,
    audit: A,
}

impl<S: TrialStore, A: AuditSink> TrialService<S, A> {
    /// Creates a new service.
    pub fn new(store: S, audit: A) -> Self {
        Self { store, audit }
    }

    /// Returns a reference to the storage collaborator.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns a reference to the audit collaborator.
    pub fn audit(&self) -> &A {
        &self.audit
    }

    /// Creates a draft trial.
    #[tracing::instrument(skip(self), fields(name = %cmd.name))]
    pub async fn create_trial(&self, cmd: CreateTrial) -> Result<Trial> {
        let outcome = self.try_create_trial(&cmd).await;

        self.audit_outcome("create_trial", "trial", &outcome, |t| t.id.to_string())
            .await;
        outcome
    }

    /// Attaches a protocol version to a trial.
    #[tracing::instrument(skip(self), fields(trial_id = %cmd.trial_id))]
    pub async fn add_protocol_version(&self, cmd: AddProtocolVersion) -> Result<ProtocolVersion> {
        let outcome = self.try_add_protocol_version(&cmd).await;

        self.audit_outcome("add_protocol_version", "protocol_version", &outcome, |p| {
            p.id.to_string()
        })
        .await;
        outcome
    }

    /// Upserts a site by name and country and links it to a trial.
    #[tracing::instrument(skip(self), fields(trial_id = %cmd.trial_id, site = %cmd.site_name))]
    pub async fn register_site_to_trial(
        &self,
        cmd: RegisterSiteToTrial,
    ) -> Result<SiteRegistration> {
        let outcome = self.try_register_site(&cmd).await;

        self.audit_outcome("register_site_to_trial", "trial_site", &outcome, |r| {
            format!("{}_{}", r.link.trial_id, r.link.site_id)
        })
        .await;
        outcome
    }

    /// Changes a trial's name and/or phase.
    ///
    /// The phase must follow the allowed transitions. The version is bumped
    /// only when something actually changed.
    #[tracing::instrument(skip(self), fields(trial_id = %cmd.trial_id))]
    pub async fn update_trial_metadata(&self, cmd: UpdateTrialMetadata) -> Result<MetadataUpdate> {
        let outcome = self.try_update_trial_metadata(&cmd).await;

        self.audit_outcome("update_trial_metadata", "trial", &outcome, |u| {
            u.trial.id.to_string()
        })
        .await;
        outcome
    }

    /// Deletes a trial and everything attached to it. Returns false if it
    /// was already gone.
    #[tracing::instrument(skip(self))]
    pub async fn delete_trial(&self, trial_id: TrialId) -> Result<bool> {
        self.store.delete_trial(trial_id).await
    }

    /// Deletes a protocol version. Returns false if it was already gone.
    #[tracing::instrument(skip(self))]
    pub async fn delete_protocol_version(&self, id: ProtocolVersionId) -> Result<bool> {
        self.store.delete_protocol_version(id).await
    }

    /// Removes a site link. The site stays registered for other trials.
    #[tracing::instrument(skip(self))]
    pub async fn unregister_site(&self, trial_id: TrialId, site_id: SiteId) -> Result<bool> {
        self.store.delete_site_link(trial_id, site_id).await
    }

    /// Fetches a trial with its protocol versions and linked sites.
    pub async fn get_trial(&self, trial_id: TrialId) -> Result<TrialDetails> {
        let trial = self
            .store
            .get_trial(trial_id)
            .await?
            .ok_or_else(|| TrialError::trial_not_found(trial_id))?;
        let protocol_versions = self.store.protocol_versions(trial_id).await?;
        let sites = self.store.linked_sites(trial_id).await?;

        Ok(TrialDetails {
            trial,
            protocol_versions,
            sites,
        })
    }

    /// Lists trials, newest first.
    pub async fn list_trials(&self, filter: &TrialFilter) -> Result<TrialPage> {
        self.store.list_trials(filter).await
    }

    /// Reads the audit log, newest first.
    pub async fn audit_log(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        self.audit.entries(query).await
    }

    async fn try_create_trial(&self, cmd: &CreateTrial) -> Result<Trial> {
        let phase: Phase = cmd.phase.parse()?;
        let name = validate_name(&cmd.name)?;
        self.store
            .insert_trial(Trial::new(name, phase), cmd.idempotency_key.as_deref())
            .await
    }

    async fn try_add_protocol_version(&self, cmd: &AddProtocolVersion) -> Result<ProtocolVersion> {
        if cmd.version.trim().is_empty() {
            return Err(TrialError::Validation(
                "Protocol version must not be empty".to_string(),
            ));
        }
        let protocol = ProtocolVersion {
            id: ProtocolVersionId::new(),
            trial_id: cmd.trial_id,
            version: cmd.version.clone(),
            notes: cmd.notes.clone(),
            created_at: Utc::now(),
        };
        self.store
            .insert_protocol_version(protocol, cmd.idempotency_key.as_deref())
            .await
    }

    async fn try_register_site(&self, cmd: &RegisterSiteToTrial) -> Result<SiteRegistration> {
        let site_name = validate_name(&cmd.site_name)?;
        if cmd.country.trim().is_empty() {
            return Err(TrialError::Validation(
                "Country must not be empty".to_string(),
            ));
        }
        self.store
            .register_site(
                cmd.trial_id,
                site_name,
                cmd.country.trim(),
                cmd.idempotency_key.as_deref(),
            )
            .await
    }

    async fn try_update_trial_metadata(&self, cmd: &UpdateTrialMetadata) -> Result<MetadataUpdate> {
        let current = self
            .store
            .get_trial(cmd.trial_id)
            .await?
            .ok_or_else(|| TrialError::trial_not_found(cmd.trial_id))?;

        if let Some(expected) = cmd.expected_version
            && expected != current.version
        {
            return Err(TrialError::StaleData {
                expected,
                actual: current.version,
            });
        }

        let mut updated = current.clone();
        let mut changes = Vec::new();

        if let Some(name) = &cmd.name {
            let name = validate_name(name)?;
            if name != current.name {
                changes.push(format!("name: '{}' -> '{}'", current.name, name));
                updated.name = name.to_string();
            }
        }

        if let Some(phase) = &cmd.phase {
            let phase: Phase = phase.parse()?;
            if phase != current.phase {
                current.phase.validate_transition(phase)?;
                changes.push(format!("phase: '{}' -> '{}'", current.phase, phase));
                updated.phase = phase;
            }
        }

        if changes.is_empty() {
            return Ok(MetadataUpdate {
                trial: current,
                changes: "no changes".to_string(),
            });
        }

        updated.version = current.version + 1;
        updated.updated_at = Utc::now();
        let trial = self.store.update_trial(updated, current.version).await?;
        Ok(MetadataUpdate {
            trial,
            changes: changes.join("; "),
        })
    }

    /// Audits a command that was rejected before it reached the store, as
    /// `{action}_failed` with the error in the payload.
    pub async fn record_rejection(&self, action: &str, entity: &str, error: &TrialError) {
        count_command(action, "failed");
        self.write_audit(action, failure_entry(action, entity, error))
            .await;
    }

    async fn audit_outcome<T: Serialize>(
        &self,
        action: &str,
        entity: &str,
        outcome: &Result<T>,
        entity_id: impl FnOnce(&T) -> String,
    ) {
        let entry = match outcome {
            Ok(value) => {
                count_command(action, "ok");
                let payload = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
                AuditEntry::new(action, entity, entity_id(value), payload)
            }
            Err(e) => {
                count_command(action, "failed");
                failure_entry(action, entity, e)
            }
        };
        self.write_audit(action, entry).await;
    }

    async fn write_audit(&self, action: &str, entry: AuditEntry) {
        if let Err(e) = self.audit.record(entry).await {
            tracing::warn!(action, error = %e, "Failed to write audit record");
        }
    }
}

fn validate_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(TrialError::Validation("Name must not be empty".to_string()));
    }
    Ok(trimmed)
}

fn count_command(action: &str, result: &'static str) {
    metrics::counter!(
        "trial_commands_total",
        "action" => action.to_string(),
        "result" => result
    )
    .increment(1);
}

fn failure_entry(action: &str, entity: &str, error: &TrialError) -> AuditEntry {
    AuditEntry::new(
        format!("{action}_failed"),
        entity,
        "error",
        serde_json::json!({
            "error": error.to_string(),
            "error_type": error.error_type(),
        }),
    )
}
