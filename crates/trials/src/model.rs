//! Trial registry records.

use chrono::{DateTime, Utc};
use common::{ProtocolVersionId, SiteId, TrialId};
use serde::{Deserialize, Serialize};

use crate::phase::{LinkStatus, Phase, TrialStatus};

/// A clinical trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    pub name: String,
    pub phase: Phase,
    pub status: TrialStatus,
    /// Incremented on every metadata change; used for optimistic checks.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trial {
    /// Creates a draft trial at version 1.
    pub fn new(name: impl Into<String>, phase: Phase) -> Self {
        let now = Utc::now();
        Self {
            id: TrialId::new(),
            name: name.into(),
            phase,
            status: TrialStatus::Draft,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A research site. Sites are shared between trials and identified by
/// name and country.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub name: String,
    pub country: String,
}

/// Association of a site with a trial. At most one per (trial, site).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialSiteLink {
    pub trial_id: TrialId,
    pub site_id: SiteId,
    pub status: LinkStatus,
}

/// A versioned protocol note attached to a trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub id: ProtocolVersionId,
    pub trial_id: TrialId,
    pub version: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of registering a site: the (possibly pre-existing) site and the
/// new link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteRegistration {
    pub site: Site,
    pub link: TrialSiteLink,
}

/// A linked site as seen from a trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedSite {
    pub site: Site,
    pub status: LinkStatus,
}

/// A trial with everything attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialDetails {
    #[serde(flatten)]
    pub trial: Trial,
    pub protocol_versions: Vec<ProtocolVersion>,
    pub sites: Vec<LinkedSite>,
}

/// One row of a trial listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSummary {
    #[serde(flatten)]
    pub trial: Trial,
    pub site_count: usize,
}

/// Filters for listing trials.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrialFilter {
    pub phase: Option<Phase>,
    pub status: Option<TrialStatus>,
    /// Case-insensitive substring match on the trial name.
    pub search: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl TrialFilter {
    /// Page size used when the caller does not set one.
    pub const DEFAULT_LIMIT: usize = 50;

    /// Returns the effective page size.
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT)
    }

    /// Returns the effective offset.
    pub fn offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }

    /// Returns true if the trial passes every set filter. Pagination is not
    /// applied here.
    pub fn matches(&self, trial: &Trial) -> bool {
        if let Some(phase) = self.phase
            && trial.phase != phase
        {
            return false;
        }
        if let Some(status) = self.status
            && trial.status != status
        {
            return false;
        }
        if let Some(search) = &self.search
            && !trial.name.to_lowercase().contains(&search.to_lowercase())
        {
            return false;
        }
        true
    }
}

/// A page of trials, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialPage {
    pub items: Vec<TrialSummary>,
    /// Number of trials matching the filter before pagination.
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_trials_start_as_draft_at_version_one() {
        let trial = Trial::new("Aspirin Study", Phase::PhaseI);
        assert_eq!(trial.status, TrialStatus::Draft);
        assert_eq!(trial.version, 1);
        assert_eq!(trial.created_at, trial.updated_at);
    }

    #[test]
    fn filter_matches_name_case_insensitively() {
        let trial = Trial::new("Aspirin Study", Phase::PhaseII);
        let filter = TrialFilter {
            search: Some("aspIRIN".into()),
            ..Default::default()
        };
        assert!(filter.matches(&trial));

        let filter = TrialFilter {
            search: Some("ibuprofen".into()),
            ..Default::default()
        };
        assert!(!filter.matches(&trial));
    }

    #[test]
    fn filter_combines_phase_and_status() {
        let trial = Trial::new("Study", Phase::PhaseII);
        let filter = TrialFilter {
            phase: Some(Phase::PhaseII),
            status: Some(TrialStatus::Active),
            ..Default::default()
        };
        assert!(!filter.matches(&trial));

        let filter = TrialFilter {
            phase: Some(Phase::PhaseII),
            status: Some(TrialStatus::Draft),
            ..Default::default()
        };
        assert!(filter.matches(&trial));
        assert_eq!(filter.limit(), TrialFilter::DEFAULT_LIMIT);
    }
}
