//! Trial phases, statuses and the rules for moving between them.

use serde::{Deserialize, Serialize};

use crate::error::TrialError;

/// The clinical phase of a trial.
///
/// Phase transitions:
/// ```text
/// Preclinical ──► Phase I ──► Phase II ──► Phase III ──► Phase IV ──► completed
///                    │           │             │             │
///                    └───────────┴─────────────┴─────────────┴──► terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Phase {
    Preclinical,
    PhaseI,
    PhaseII,
    PhaseIII,
    PhaseIV,
    /// Terminal pseudo-phase for trials that finished Phase IV.
    Completed,
    /// Terminal pseudo-phase for trials stopped early.
    Terminated,
}

impl Phase {
    /// Every valid phase.
    pub const ALL: [Phase; 7] = [
        Phase::Preclinical,
        Phase::PhaseI,
        Phase::PhaseII,
        Phase::PhaseIII,
        Phase::PhaseIV,
        Phase::Completed,
        Phase::Terminated,
    ];

    /// Returns the canonical phase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Preclinical => "Preclinical",
            Phase::PhaseI => "Phase I",
            Phase::PhaseII => "Phase II",
            Phase::PhaseIII => "Phase III",
            Phase::PhaseIV => "Phase IV",
            Phase::Completed => "completed",
            Phase::Terminated => "terminated",
        }
    }

    /// Phases reachable in one transition from this one.
    pub fn allowed_transitions(&self) -> &'static [Phase] {
        match self {
            Phase::Preclinical => &[Phase::PhaseI],
            Phase::PhaseI => &[Phase::PhaseII, Phase::Terminated],
            Phase::PhaseII => &[Phase::PhaseIII, Phase::Terminated],
            Phase::PhaseIII => &[Phase::PhaseIV, Phase::Terminated],
            Phase::PhaseIV => &[Phase::Completed, Phase::Terminated],
            Phase::Completed | Phase::Terminated => &[],
        }
    }

    /// Returns true if this is a terminal pseudo-phase.
    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// Checks that moving to `to` is allowed. Staying put is always allowed.
    pub fn validate_transition(&self, to: Phase) -> Result<(), TrialError> {
        if *self == to || self.allowed_transitions().contains(&to) {
            return Ok(());
        }

        let allowed = self.allowed_transitions();
        let allowed = if allowed.is_empty() {
            "none".to_string()
        } else {
            allowed
                .iter()
                .map(Phase::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        };
        Err(TrialError::Validation(format!(
            "Invalid phase transition from {self} to {to}. Allowed transitions: {allowed}"
        )))
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = TrialError;

    /// Accepts canonical names ("Phase II") and enum-style names ("PHASE_II").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Some(phase) = Phase::ALL.iter().find(|p| p.as_str() == trimmed) {
            return Ok(*phase);
        }

        let normalized = trimmed.to_ascii_uppercase().replace(' ', "_");
        match normalized.as_str() {
            "PRECLINICAL" => Ok(Phase::Preclinical),
            "PHASE_I" => Ok(Phase::PhaseI),
            "PHASE_II" => Ok(Phase::PhaseII),
            "PHASE_III" => Ok(Phase::PhaseIII),
            "PHASE_IV" => Ok(Phase::PhaseIV),
            "COMPLETED" => Ok(Phase::Completed),
            "TERMINATED" => Ok(Phase::Terminated),
            _ => {
                let mut valid: Vec<_> = Phase::ALL.iter().map(Phase::as_str).collect();
                valid.sort_unstable();
                Err(TrialError::Validation(format!(
                    "Invalid phase: {s}. Must be one of: {}",
                    valid.join(", ")
                )))
            }
        }
    }
}

impl TryFrom<String> for Phase {
    type Error = TrialError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Phase> for String {
    fn from(phase: Phase) -> Self {
        phase.as_str().to_string()
    }
}

/// The administrative status of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    #[default]
    Draft,
    Active,
    Paused,
    Completed,
    Terminated,
}

impl TrialStatus {
    /// Returns the status name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialStatus::Draft => "draft",
            TrialStatus::Active => "active",
            TrialStatus::Paused => "paused",
            TrialStatus::Completed => "completed",
            TrialStatus::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TrialStatus {
    type Err = TrialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(TrialStatus::Draft),
            "active" => Ok(TrialStatus::Active),
            "paused" => Ok(TrialStatus::Paused),
            "completed" => Ok(TrialStatus::Completed),
            "terminated" => Ok(TrialStatus::Terminated),
            other => Err(TrialError::Validation(format!(
                "Invalid status: {other}. Must be one of: active, completed, draft, paused, terminated"
            ))),
        }
    }
}

/// Status of a site's participation in a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    #[default]
    Pending,
    Active,
}

impl LinkStatus {
    /// Returns the status name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Pending => "pending",
            LinkStatus::Active => "active",
        }
    }
}

impl std::str::FromStr for LinkStatus {
    type Err = TrialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(LinkStatus::Pending),
            "active" => Ok(LinkStatus::Active),
            other => Err(TrialError::Validation(format!(
                "Invalid link status: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_and_enum_style_names() {
        assert_eq!("Phase I".parse::<Phase>().unwrap(), Phase::PhaseI);
        assert_eq!("PHASE_III".parse::<Phase>().unwrap(), Phase::PhaseIII);
        assert_eq!("preclinical".parse::<Phase>().unwrap(), Phase::Preclinical);
        assert_eq!("terminated".parse::<Phase>().unwrap(), Phase::Terminated);
    }

    #[test]
    fn rejects_unknown_phase_with_sorted_choices() {
        let err = "Phase V".parse::<Phase>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation error: Invalid phase: Phase V. Must be one of: Phase I, Phase II, Phase III, Phase IV, Preclinical, completed, terminated"
        );
    }

    fn allowed(from: Phase, to: Phase) -> bool {
        from.validate_transition(to).is_ok()
    }

    fn rejection(from: Phase, to: Phase) -> String {
        from.validate_transition(to).unwrap_err().to_string()
    }

    #[test]
    fn forward_transitions_are_allowed() {
        assert!(allowed(Phase::Preclinical, Phase::PhaseI));
        assert!(allowed(Phase::PhaseI, Phase::PhaseII));
        assert!(allowed(Phase::PhaseIV, Phase::Completed));
        assert!(allowed(Phase::PhaseII, Phase::Terminated));
    }

    #[test]
    fn same_phase_is_a_no_op() {
        assert!(allowed(Phase::Completed, Phase::Completed));
    }

    #[test]
    fn skipping_or_reversing_phases_is_rejected() {
        let err = rejection(Phase::PhaseI, Phase::PhaseIII);
        assert!(err.contains("Allowed transitions: Phase II, terminated"));

        assert!(!allowed(Phase::PhaseII, Phase::PhaseI));
        assert!(!allowed(Phase::Preclinical, Phase::Terminated));

        let err = rejection(Phase::Terminated, Phase::PhaseI);
        assert!(err.ends_with("Allowed transitions: none"));
    }

    #[test]
    fn phases_serialize_with_canonical_names() {
        let json = serde_json::to_string(&Phase::PhaseII).unwrap();
        assert_eq!(json, "\"Phase II\"");
        let parsed: Phase = serde_json::from_str("\"PHASE_IV\"").unwrap();
        assert_eq!(parsed, Phase::PhaseIV);
        assert!(serde_json::from_str::<Phase>("\"Phase 9\"").is_err());
    }

    #[test]
    fn statuses_round_trip_through_strings() {
        for status in [
            TrialStatus::Draft,
            TrialStatus::Active,
            TrialStatus::Paused,
            TrialStatus::Completed,
            TrialStatus::Terminated,
        ] {
            assert_eq!(status.as_str().parse::<TrialStatus>().unwrap(), status);
        }
        assert!("archived".parse::<TrialStatus>().is_err());
    }
}
