//! Audit collaborator: an append-only record of every command outcome.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Result, TrialError};

/// Actor recorded when the caller does not identify itself.
pub const SYSTEM_ACTOR: &str = "system";

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor: String,
    pub action: String,
    pub entity: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Creates an entry stamped now, attributed to the system actor.
    pub fn new(
        action: impl Into<String>,
        entity: impl Into<String>,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor: SYSTEM_ACTOR.to_string(),
            action: action.into(),
            entity: entity.into(),
            entity_id: entity_id.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Overrides the actor.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }
}

/// Filters for reading the audit log.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub entity: Option<String>,
    pub entity_id: Option<String>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    /// Page size used when the caller does not set one.
    pub const DEFAULT_LIMIT: usize = 100;

    /// Returns the effective page size.
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT)
    }

    /// Returns true if the entry passes every set filter.
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.entity.as_ref().is_none_or(|e| *e == entry.entity)
            && self.entity_id.as_ref().is_none_or(|id| *id == entry.entity_id)
    }
}

/// Sink for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Records an entry.
    async fn record(&self, entry: AuditEntry) -> Result<()>;

    /// Reads entries matching a query, newest first.
    async fn entries(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>>;
}

#[async_trait]
impl<T: AuditSink + ?Sized> AuditSink for Arc<T> {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        (**self).record(entry).await
    }

    async fn entries(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        (**self).entries(query).await
    }
}

#[derive(Debug, Default)]
struct InMemoryAuditState {
    entries: Vec<AuditEntry>,
    fail_on_record: bool,
}

/// In-memory audit log for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAuditLog {
    state: Arc<RwLock<InMemoryAuditState>>,
}

impl InMemoryAuditLog {
    /// Creates a new empty audit log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent record call fail.
    pub fn set_fail_on_record(&self, fail: bool) {
        if let Ok(mut state) = self.state.write() {
            state.fail_on_record = fail;
        }
    }

    /// Returns every recorded entry in recording order.
    pub fn all(&self) -> Vec<AuditEntry> {
        self.state
            .read()
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }

    /// Returns the actions recorded, in recording order.
    pub fn actions(&self) -> Vec<String> {
        self.all().into_iter().map(|e| e.action).collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditLog {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| TrialError::Storage("audit log lock poisoned".to_string()))?;
        if state.fail_on_record {
            return Err(TrialError::Storage("audit write rejected".to_string()));
        }
        state.entries.push(entry);
        Ok(())
    }

    async fn entries(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let state = self
            .state
            .read()
            .map_err(|_| TrialError::Storage("audit log lock poisoned".to_string()))?;
        Ok(state
            .entries
            .iter()
            .rev()
            .filter(|e| query.matches(e))
            .take(query.limit())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(entity_id: &str) -> AuditEntry {
        AuditEntry::new("create_trial", "trial", entity_id, serde_json::json!({}))
    }

    #[tokio::test]
    async fn entries_are_newest_first_and_filtered() {
        let log = InMemoryAuditLog::new();
        log.record(created("1")).await.unwrap();
        log.record(created("2")).await.unwrap();
        log.record(AuditEntry::new(
            "register_site_to_trial",
            "trial_site",
            "1_9",
            serde_json::json!({}),
        ))
        .await
        .unwrap();

        let trials = log
            .entries(&AuditQuery {
                entity: Some("trial".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let ids: Vec<_> = trials.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1"]);

        let limited = log
            .entries(&AuditQuery {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited[0].action, "register_site_to_trial");
    }

    #[tokio::test]
    async fn default_actor_is_system() {
        let entry = created("1");
        assert_eq!(entry.actor, SYSTEM_ACTOR);
        assert_eq!(entry.with_actor("alice").actor, "alice");
    }

    #[tokio::test]
    async fn injected_failure_records_nothing() {
        let log = InMemoryAuditLog::new();
        log.set_fail_on_record(true);
        let result = log.record(created("1")).await;
        assert!(result.is_err());
        assert!(log.all().is_empty());
    }
}
