//! Trial registry commands.

use common::TrialId;
use serde::Deserialize;

/// Command to create a new draft trial.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTrial {
    pub name: String,
    /// Phase name, either canonical ("Phase I") or enum style ("PHASE_I").
    pub phase: String,
    #[serde(skip)]
    pub idempotency_key: Option<String>,
}

impl CreateTrial {
    /// Creates a new CreateTrial command.
    pub fn new(name: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: phase.into(),
            idempotency_key: None,
        }
    }

    /// Makes a replay of this command return the trial created the first time.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Command to attach a protocol version to a trial.
#[derive(Debug, Clone)]
pub struct AddProtocolVersion {
    pub trial_id: TrialId,
    pub version: String,
    pub notes: Option<String>,
    pub idempotency_key: Option<String>,
}

impl AddProtocolVersion {
    /// Creates a new AddProtocolVersion command.
    pub fn new(trial_id: TrialId, version: impl Into<String>) -> Self {
        Self {
            trial_id,
            version: version.into(),
            notes: None,
            idempotency_key: None,
        }
    }

    /// Sets the protocol notes.
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Makes a replay of this command return the version created the first time.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Command to register a site (by name and country) to a trial.
#[derive(Debug, Clone)]
pub struct RegisterSiteToTrial {
    pub trial_id: TrialId,
    pub site_name: String,
    pub country: String,
    pub idempotency_key: Option<String>,
}

impl RegisterSiteToTrial {
    /// Creates a new RegisterSiteToTrial command.
    pub fn new(
        trial_id: TrialId,
        site_name: impl Into<String>,
        country: impl Into<String>,
    ) -> Self {
        Self {
            trial_id,
            site_name: site_name.into(),
            country: country.into(),
            idempotency_key: None,
        }
    }

    /// Makes a replay of this command return the link created the first time.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Command to change a trial's name and/or phase.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTrialMetadata {
    #[serde(skip)]
    pub trial_id: TrialId,
    pub name: Option<String>,
    pub phase: Option<String>,
    /// When set, the update is rejected unless the trial is at this version.
    pub expected_version: Option<i64>,
}

impl UpdateTrialMetadata {
    /// Creates an update that changes nothing yet.
    pub fn new(trial_id: TrialId) -> Self {
        Self {
            trial_id,
            ..Default::default()
        }
    }

    /// Sets the new name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the new phase.
    pub fn phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    /// Requires the trial to be at the given version.
    pub fn expect_version(mut self, version: i64) -> Self {
        self.expected_version = Some(version);
        self
    }
}
