use async_trait::async_trait;
use common::{ProtocolVersionId, SiteId, TrialId};

use crate::{
    Result,
    model::{LinkedSite, ProtocolVersion, SiteRegistration, Trial, TrialFilter, TrialPage},
};

/// Storage collaborator for the trial registry.
///
/// Every method is atomic on its own: a call either applies all of its rows or
/// none of them. Inserts accept an optional idempotency key; a second insert
/// with a key that was already used returns the row created by the first call
/// instead of writing a new one.
///
/// Delete methods return `false` when there was nothing to delete, so that
/// compensations can be replayed safely.
#[async_trait]
pub trait TrialStore: Send + Sync {
    /// Inserts a new trial.
    async fn insert_trial(&self, trial: Trial, idempotency_key: Option<&str>) -> Result<Trial>;

    /// Fetches a trial by ID.
    async fn get_trial(&self, trial_id: TrialId) -> Result<Option<Trial>>;

    /// Replaces a trial if its stored version still equals `expected_version`.
    ///
    /// Fails with `StaleData` on a version mismatch and `NotFound` if the
    /// trial no longer exists.
    async fn update_trial(&self, trial: Trial, expected_version: i64) -> Result<Trial>;

    /// Deletes a trial together with its protocol versions and site links.
    async fn delete_trial(&self, trial_id: TrialId) -> Result<bool>;

    /// Inserts a protocol version. Fails with `NotFound` if the trial is gone.
    async fn insert_protocol_version(
        &self,
        protocol: ProtocolVersion,
        idempotency_key: Option<&str>,
    ) -> Result<ProtocolVersion>;

    /// Deletes a protocol version.
    async fn delete_protocol_version(&self, id: ProtocolVersionId) -> Result<bool>;

    /// Finds or creates the site identified by (name, country) and links it
    /// to the trial with status pending, as one unit.
    ///
    /// Fails with `NotFound` if the trial is missing and `DuplicateSiteLink`
    /// if the site is already linked. In both cases no site row is created.
    async fn register_site(
        &self,
        trial_id: TrialId,
        site_name: &str,
        country: &str,
        idempotency_key: Option<&str>,
    ) -> Result<SiteRegistration>;

    /// Removes the link between a trial and a site. The site itself stays.
    async fn delete_site_link(&self, trial_id: TrialId, site_id: SiteId) -> Result<bool>;

    /// Lists a trial's protocol versions, oldest first.
    async fn protocol_versions(&self, trial_id: TrialId) -> Result<Vec<ProtocolVersion>>;

    /// Lists the sites linked to a trial, in link order.
    async fn linked_sites(&self, trial_id: TrialId) -> Result<Vec<LinkedSite>>;

    /// Lists trials matching a filter, newest first.
    async fn list_trials(&self, filter: &TrialFilter) -> Result<TrialPage>;
}

#[async_trait]
impl<T: TrialStore + ?Sized> TrialStore for std::sync::Arc<T> {
    async fn insert_trial(&self, trial: Trial, idempotency_key: Option<&str>) -> Result<Trial> {
        (**self).insert_trial(trial, idempotency_key).await
    }

    async fn get_trial(&self, trial_id: TrialId) -> Result<Option<Trial>> {
        (**self).get_trial(trial_id).await
    }

    async fn update_trial(&self, trial: Trial, expected_version: i64) -> Result<Trial> {
        (**self).update_trial(trial, expected_version).await
    }

    async fn delete_trial(&self, trial_id: TrialId) -> Result<bool> {
        (**self).delete_trial(trial_id).await
    }

    async fn insert_protocol_version(
        &self,
        protocol: ProtocolVersion,
        idempotency_key: Option<&str>,
    ) -> Result<ProtocolVersion> {
        (**self)
            .insert_protocol_version(protocol, idempotency_key)
            .await
    }

    async fn delete_protocol_version(&self, id: ProtocolVersionId) -> Result<bool> {
        (**self).delete_protocol_version(id).await
    }

    async fn register_site(
        &self,
        trial_id: TrialId,
        site_name: &str,
        country: &str,
        idempotency_key: Option<&str>,
    ) -> Result<SiteRegistration> {
        (**self)
            .register_site(trial_id, site_name, country, idempotency_key)
            .await
    }

    async fn delete_site_link(&self, trial_id: TrialId, site_id: SiteId) -> Result<bool> {
        (**self).delete_site_link(trial_id, site_id).await
    }

    async fn protocol_versions(&self, trial_id: TrialId) -> Result<Vec<ProtocolVersion>> {
        (**self).protocol_versions(trial_id).await
    }

    async fn linked_sites(&self, trial_id: TrialId) -> Result<Vec<LinkedSite>> {
        (**self).linked_sites(trial_id).await
    }

    async fn list_trials(&self, filter: &TrialFilter) -> Result<TrialPage> {
        (**self).list_trials(filter).await
    }
}
