//! In-memory trial store for tests and database-less deployments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::{ProtocolVersionId, SiteId, TrialId};
use uuid::Uuid;

use crate::{
    Result, TrialError,
    model::{
        LinkedSite, ProtocolVersion, Site, SiteRegistration, Trial, TrialFilter, TrialPage,
        TrialSiteLink, TrialSummary,
    },
    phase::LinkStatus,
    store::TrialStore,
};

#[derive(Debug, Default)]
struct InMemoryTrialState {
    // Insertion order; listings reverse it for newest first.
    trials: Vec<Trial>,
    sites: Vec<Site>,
    links: Vec<(TrialSiteLink, Uuid)>,
    protocols: Vec<ProtocolVersion>,
    idempotency_keys: HashMap<String, Uuid>,
    fail_on_insert_trial: bool,
    fail_on_insert_protocol: bool,
    fail_on_site: Option<String>,
    fail_on_delete_link: bool,
    fail_on_delete_trial: bool,
}

impl InMemoryTrialState {
    fn trial_exists(&self, trial_id: TrialId) -> bool {
        self.trials.iter().any(|t| t.id == trial_id)
    }

    fn remembered(&self, key: Option<&str>) -> Option<Uuid> {
        key.and_then(|k| self.idempotency_keys.get(k).copied())
    }

    fn remember(&mut self, key: Option<&str>, id: Uuid) {
        if let Some(key) = key {
            self.idempotency_keys.insert(key.to_string(), id);
        }
    }

    fn registration_for_link(&self, link_id: Uuid) -> Option<SiteRegistration> {
        let (link, _) = self.links.iter().find(|(_, id)| *id == link_id)?;
        let site = self.sites.iter().find(|s| s.id == link.site_id)?;
        Some(SiteRegistration {
            site: site.clone(),
            link: link.clone(),
        })
    }
}

/// In-memory trial store with fault injection.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTrialStore {
    state: Arc<RwLock<InMemoryTrialState>>,
}

impl InMemoryTrialStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, InMemoryTrialState>> {
        self.state
            .read()
            .map_err(|_| TrialError::Storage("trial store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, InMemoryTrialState>> {
        self.state
            .write()
            .map_err(|_| TrialError::Storage("trial store lock poisoned".to_string()))
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut InMemoryTrialState) -> R) -> R {
        let mut state = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// Makes trial inserts fail.
    pub fn set_fail_on_insert_trial(&self, fail: bool) {
        self.with_state(|s| s.fail_on_insert_trial = fail);
    }

    /// Makes protocol version inserts fail.
    pub fn set_fail_on_insert_protocol(&self, fail: bool) {
        self.with_state(|s| s.fail_on_insert_protocol = fail);
    }

    /// Makes registration of the named site fail. `None` clears the fault.
    pub fn set_fail_on_site(&self, site_name: Option<&str>) {
        self.with_state(|s| s.fail_on_site = site_name.map(str::to_string));
    }

    /// Makes site link deletions fail.
    pub fn set_fail_on_delete_link(&self, fail: bool) {
        self.with_state(|s| s.fail_on_delete_link = fail);
    }

    /// Makes trial deletions fail.
    pub fn set_fail_on_delete_trial(&self, fail: bool) {
        self.with_state(|s| s.fail_on_delete_trial = fail);
    }

    /// Returns the number of trials.
    pub fn trial_count(&self) -> usize {
        self.with_state(|s| s.trials.len())
    }

    /// Returns the number of protocol versions across all trials.
    pub fn protocol_version_count(&self) -> usize {
        self.with_state(|s| s.protocols.len())
    }

    /// Returns the number of trial-site links.
    pub fn link_count(&self) -> usize {
        self.with_state(|s| s.links.len())
    }

    /// Returns the number of distinct sites.
    pub fn site_count(&self) -> usize {
        self.with_state(|s| s.sites.len())
    }
}

#[async_trait]
impl TrialStore for InMemoryTrialStore {
    async fn insert_trial(&self, trial: Trial, idempotency_key: Option<&str>) -> Result<Trial> {
        let mut state = self.write()?;

        if let Some(id) = state.remembered(idempotency_key)
            && let Some(existing) = state.trials.iter().find(|t| t.id.as_uuid() == id)
        {
            return Ok(existing.clone());
        }

        if state.fail_on_insert_trial {
            return Err(TrialError::Storage("trial insert rejected".to_string()));
        }

        state.remember(idempotency_key, trial.id.as_uuid());
        state.trials.push(trial.clone());
        Ok(trial)
    }

    async fn get_trial(&self, trial_id: TrialId) -> Result<Option<Trial>> {
        let state = self.read()?;
        Ok(state.trials.iter().find(|t| t.id == trial_id).cloned())
    }

    async fn update_trial(&self, trial: Trial, expected_version: i64) -> Result<Trial> {
        let mut state = self.write()?;
        let Some(stored) = state.trials.iter_mut().find(|t| t.id == trial.id) else {
            return Err(TrialError::trial_not_found(trial.id));
        };

        if stored.version != expected_version {
            return Err(TrialError::StaleData {
                expected: expected_version,
                actual: stored.version,
            });
        }

        *stored = trial.clone();
        Ok(trial)
    }

    async fn delete_trial(&self, trial_id: TrialId) -> Result<bool> {
        let mut state = self.write()?;
        if state.fail_on_delete_trial {
            return Err(TrialError::Storage("trial delete rejected".to_string()));
        }

        let before = state.trials.len();
        state.trials.retain(|t| t.id != trial_id);
        state.protocols.retain(|p| p.trial_id != trial_id);
        state.links.retain(|(l, _)| l.trial_id != trial_id);
        Ok(state.trials.len() != before)
    }

    async fn insert_protocol_version(
        &self,
        protocol: ProtocolVersion,
        idempotency_key: Option<&str>,
    ) -> Result<ProtocolVersion> {
        let mut state = self.write()?;

        if let Some(id) = state.remembered(idempotency_key)
            && let Some(existing) = state.protocols.iter().find(|p| p.id.as_uuid() == id)
        {
            return Ok(existing.clone());
        }

        if state.fail_on_insert_protocol {
            return Err(TrialError::Storage(
                "protocol version insert rejected".to_string(),
            ));
        }
        if !state.trial_exists(protocol.trial_id) {
            return Err(TrialError::trial_not_found(protocol.trial_id));
        }

        state.remember(idempotency_key, protocol.id.as_uuid());
        state.protocols.push(protocol.clone());
        Ok(protocol)
    }

    async fn delete_protocol_version(&self, id: ProtocolVersionId) -> Result<bool> {
        let mut state = self.write()?;
        let before = state.protocols.len();
        state.protocols.retain(|p| p.id != id);
        Ok(state.protocols.len() != before)
    }

    async fn register_site(
        &self,
        trial_id: TrialId,
        site_name: &str,
        country: &str,
        idempotency_key: Option<&str>,
    ) -> Result<SiteRegistration> {
        let mut state = self.write()?;

        if let Some(link_id) = state.remembered(idempotency_key)
            && let Some(existing) = state.registration_for_link(link_id)
        {
            return Ok(existing);
        }

        if state.fail_on_site.as_deref() == Some(site_name) {
            return Err(TrialError::Storage(format!(
                "site registration rejected for {site_name}"
            )));
        }
        if !state.trial_exists(trial_id) {
            return Err(TrialError::trial_not_found(trial_id));
        }

        let existing = state
            .sites
            .iter()
            .find(|s| s.name == site_name && s.country == country)
            .cloned();

        if let Some(site) = &existing
            && state
                .links
                .iter()
                .any(|(l, _)| l.trial_id == trial_id && l.site_id == site.id)
        {
            return Err(TrialError::DuplicateSiteLink {
                trial_id,
                site_id: site.id,
            });
        }

        let site = match existing {
            Some(site) => site,
            None => {
                let site = Site {
                    id: SiteId::new(),
                    name: site_name.to_string(),
                    country: country.to_string(),
                };
                state.sites.push(site.clone());
                site
            }
        };

        let link = TrialSiteLink {
            trial_id,
            site_id: site.id,
            status: LinkStatus::Pending,
        };
        let link_id = Uuid::new_v4();
        state.remember(idempotency_key, link_id);
        state.links.push((link.clone(), link_id));

        Ok(SiteRegistration { site, link })
    }

    async fn delete_site_link(&self, trial_id: TrialId, site_id: SiteId) -> Result<bool> {
        let mut state = self.write()?;
        if state.fail_on_delete_link {
            return Err(TrialError::Storage("site link delete rejected".to_string()));
        }

        let before = state.links.len();
        state
            .links
            .retain(|(l, _)| !(l.trial_id == trial_id && l.site_id == site_id));
        Ok(state.links.len() != before)
    }

    async fn protocol_versions(&self, trial_id: TrialId) -> Result<Vec<ProtocolVersion>> {
        let state = self.read()?;
        Ok(state
            .protocols
            .iter()
            .filter(|p| p.trial_id == trial_id)
            .cloned()
            .collect())
    }

    async fn linked_sites(&self, trial_id: TrialId) -> Result<Vec<LinkedSite>> {
        let state = self.read()?;
        Ok(state
            .links
            .iter()
            .filter(|(l, _)| l.trial_id == trial_id)
            .filter_map(|(l, _)| {
                state
                    .sites
                    .iter()
                    .find(|s| s.id == l.site_id)
                    .map(|site| LinkedSite {
                        site: site.clone(),
                        status: l.status,
                    })
            })
            .collect())
    }

    async fn list_trials(&self, filter: &TrialFilter) -> Result<TrialPage> {
        let state = self.read()?;
        let matching: Vec<&Trial> = state
            .trials
            .iter()
            .rev()
            .filter(|t| filter.matches(t))
            .collect();

        let items = matching
            .iter()
            .skip(filter.offset())
            .take(filter.limit())
            .map(|t| TrialSummary {
                trial: (*t).clone(),
                site_count: state
                    .links
                    .iter()
                    .filter(|(l, _)| l.trial_id == t.id)
                    .count(),
            })
            .collect();

        Ok(TrialPage {
            items,
            total: matching.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;

    fn protocol(trial_id: TrialId) -> ProtocolVersion {
        ProtocolVersion {
            id: ProtocolVersionId::new(),
            trial_id,
            version: "v1.0".into(),
            notes: None,
            created_at: chrono::Utc::now(),
        }
    }

    async fn trial(store: &InMemoryTrialStore, name: &str, phase: Phase) -> Trial {
        let trial = Trial::new(name, phase);
        store.insert_trial(trial, None).await.unwrap()
    }

    async fn link(store: &InMemoryTrialStore, trial_id: TrialId, site: &str) -> SiteRegistration {
        let registration = store.register_site(trial_id, site, "US", None).await;
        registration.unwrap()
    }

    #[tokio::test]
    async fn register_site_upserts_and_links() {
        let store = InMemoryTrialStore::new();
        let a = trial(&store, "A", Phase::PhaseI).await;
        let b = trial(&store, "B", Phase::PhaseI).await;

        let first = link(&store, a.id, "Mayo").await;
        let second = link(&store, b.id, "Mayo").await;

        assert_eq!(first.site.id, second.site.id);
        assert_eq!(first.link.status, LinkStatus::Pending);
        assert_eq!(store.site_count(), 1);
        assert_eq!(store.link_count(), 2);
    }

    #[tokio::test]
    async fn duplicate_link_is_rejected() {
        let store = InMemoryTrialStore::new();
        let trial = trial(&store, "A", Phase::PhaseI).await;
        link(&store, trial.id, "Mayo").await;

        let result = store.register_site(trial.id, "Mayo", "US", None).await;
        assert!(matches!(result, Err(TrialError::DuplicateSiteLink { .. })));
        assert_eq!(store.link_count(), 1);
    }

    #[tokio::test]
    async fn register_site_on_missing_trial_creates_nothing() {
        let store = InMemoryTrialStore::new();
        let missing = TrialId::new();
        let result = store.register_site(missing, "Mayo", "US", None).await;
        assert!(matches!(result, Err(TrialError::NotFound { .. })));
        assert_eq!(store.site_count(), 0);
    }

    #[tokio::test]
    async fn idempotency_keys_return_the_first_row() {
        let store = InMemoryTrialStore::new();
        let first = store
            .insert_trial(Trial::new("A", Phase::PhaseI), Some("wf:0"))
            .await
            .unwrap();
        let replay = store
            .insert_trial(Trial::new("A", Phase::PhaseI), Some("wf:0"))
            .await
            .unwrap();
        assert_eq!(first.id, replay.id);
        assert_eq!(store.trial_count(), 1);

        let p1 = store
            .insert_protocol_version(protocol(first.id), Some("wf:1"))
            .await
            .unwrap();
        let p2 = store
            .insert_protocol_version(protocol(first.id), Some("wf:1"))
            .await
            .unwrap();
        assert_eq!(p1.id, p2.id);
        assert_eq!(store.protocol_version_count(), 1);

        let s1 = store
            .register_site(first.id, "Mayo", "US", Some("wf:2"))
            .await
            .unwrap();
        let s2 = store
            .register_site(first.id, "Mayo", "US", Some("wf:2"))
            .await
            .unwrap();
        assert_eq!(s1, s2);
        assert_eq!(store.link_count(), 1);
    }

    #[tokio::test]
    async fn deletes_are_idempotent() {
        let store = InMemoryTrialStore::new();
        let trial = trial(&store, "A", Phase::PhaseI).await;
        let reg = link(&store, trial.id, "Mayo").await;

        assert!(store.delete_site_link(trial.id, reg.site.id).await.unwrap());
        let again = store.delete_site_link(trial.id, reg.site.id).await.unwrap();
        assert!(!again);
        assert!(store.delete_trial(trial.id).await.unwrap());
        assert!(!store.delete_trial(trial.id).await.unwrap());
    }

    #[tokio::test]
    async fn delete_trial_cascades() {
        let store = InMemoryTrialStore::new();
        let trial = trial(&store, "A", Phase::PhaseI).await;
        store
            .insert_protocol_version(protocol(trial.id), None)
            .await
            .unwrap();
        link(&store, trial.id, "Mayo").await;

        store.delete_trial(trial.id).await.unwrap();
        assert_eq!(store.protocol_version_count(), 0);
        assert_eq!(store.link_count(), 0);
        assert_eq!(store.site_count(), 1);
    }

    #[tokio::test]
    async fn update_checks_expected_version() {
        let store = InMemoryTrialStore::new();
        let trial = trial(&store, "A", Phase::PhaseI).await;

        let mut renamed = trial.clone();
        renamed.name = "B".into();
        renamed.version = 2;
        store.update_trial(renamed.clone(), 1).await.unwrap();

        let result = store.update_trial(renamed, 1).await;
        assert!(matches!(
            result,
            Err(TrialError::StaleData { expected: 1, actual: 2 })
        ));
    }

    #[tokio::test]
    async fn list_is_newest_first_with_total_and_site_counts() {
        let store = InMemoryTrialStore::new();
        let old = trial(&store, "Old", Phase::PhaseI).await;
        trial(&store, "Mid", Phase::PhaseII).await;
        let new = trial(&store, "New", Phase::PhaseI).await;
        link(&store, old.id, "Mayo").await;

        let page = store
            .list_trials(&TrialFilter {
                phase: Some(Phase::PhaseI),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].trial.id, new.id);
        assert_eq!(page.items[1].trial.id, old.id);
        assert_eq!(page.items[1].site_count, 1);

        let page = store
            .list_trials(&TrialFilter {
                limit: Some(1),
                offset: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].trial.name, "Mid");
    }

    #[tokio::test]
    async fn injected_site_failure_targets_one_site() {
        let store = InMemoryTrialStore::new();
        let trial = trial(&store, "A", Phase::PhaseI).await;
        store.set_fail_on_site(Some("Broken"));

        let mayo = store.register_site(trial.id, "Mayo", "US", None).await;
        assert!(mayo.is_ok());
        let err = store
            .register_site(trial.id, "Broken", "US", None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.site_count(), 1);
    }
}
