use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod evidence;
mod merge;
mod protocol;
mod routing;

pub use evidence::{
    evidence_fields, signal_fields, Approval, CommitmentDepth, DecisionEvidence,
    DesirabilityEvidence, DiscoveryEvidence, EvidenceState, FeasibilityEvidence,
    FeasibilityStatus, PhaseEvidence, PhaseSummary, PivotRecord, StateSummary, ViabilityEvidence,
};
pub use merge::{deep_merge, parse_patch, ControlSignal, ParsedPatch, APPEND_KEY, CONTROL_KEY};
pub use protocol::{apply_delta, completion_payload, Effect, RunSnapshot, Transition};
pub use routing::{
    extract_signal, route, Decision, Guard, PhaseRoutes, PivotKind, PivotRule, Predicate,
    ResetTarget, RouteOutcome, RoutingTable, Signal, SignalValue, TimeoutPolicy,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("routing error: {0}")]
    Routing(String),
}

macro_rules! ulid_id {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parses a ULID string.
            ///
            /// # Errors
            /// Returns [`KernelError::Validation`] when `raw` is not a ULID.
            pub fn parse(raw: &str) -> Result<Self, KernelError> {
                Ulid::from_string(raw.trim()).map(Self).map_err(|err| {
                    KernelError::Validation(format!("invalid {} `{raw}`: {err}", $label))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(RunId, "run_id");
ulid_id!(CheckpointId, "checkpoint_id");
ulid_id!(ItemId, "item_id");

/// The fixed phase graph. Declaration order is the forward order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Discovery,
    Desirability,
    Feasibility,
    Viability,
    Decision,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Self::Discovery,
        Self::Desirability,
        Self::Feasibility,
        Self::Viability,
        Self::Decision,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Desirability => "desirability",
            Self::Feasibility => "feasibility",
            Self::Viability => "viability",
            Self::Decision => "decision",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "discovery" => Some(Self::Discovery),
            "desirability" => Some(Self::Desirability),
            "feasibility" => Some(Self::Feasibility),
            "viability" => Some(Self::Viability),
            "decision" => Some(Self::Decision),
            _ => None,
        }
    }

    #[must_use]
    pub fn ordinal(self) -> usize {
        match self {
            Self::Discovery => 0,
            Self::Desirability => 1,
            Self::Feasibility => 2,
            Self::Viability => 3,
            Self::Decision => 4,
        }
    }

    #[must_use]
    pub fn next(self) -> Option<Self> {
        Self::ALL.get(self.ordinal() + 1).copied()
    }

    #[must_use]
    pub fn is_final(self) -> bool {
        self.next().is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    AwaitingHuman,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::AwaitingHuman => "awaiting_human",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "awaiting_human" => Some(Self::AwaitingHuman),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Decided,
    Expired,
}

impl CheckpointStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Decided => "decided",
            Self::Expired => "expired",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "decided" => Some(Self::Decided),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    DeadLetter,
}

impl QueueStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::DeadLetter => "dead_letter",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "dead_letter" => Some(Self::DeadLetter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HumanDecision {
    Approve,
    Reject,
}

impl HumanDecision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

/// Operational knobs shared by the store, the orchestrator and the binaries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub checkpoint_ttl_seconds: i64,
    pub lease_seconds: i64,
    pub max_attempts: u32,
    pub backoff_base_seconds: i64,
    pub backoff_max_seconds: i64,
    pub commit_retry_limit: u32,
    pub worker_max_steps: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            checkpoint_ttl_seconds: 72 * 60 * 60,
            lease_seconds: 60,
            max_attempts: 5,
            backoff_base_seconds: 30,
            backoff_max_seconds: 60 * 60,
            commit_retry_limit: 5,
            worker_max_steps: 32,
        }
    }
}

impl KernelConfig {
    /// Validates timing and retry bounds.
    ///
    /// # Errors
    /// Returns [`KernelError::Configuration`] when a field is out of range.
    pub fn validate(&self) -> Result<(), KernelError> {
        for (name, value) in [
            ("checkpoint_ttl_seconds", self.checkpoint_ttl_seconds),
            ("lease_seconds", self.lease_seconds),
            ("backoff_base_seconds", self.backoff_base_seconds),
            ("backoff_max_seconds", self.backoff_max_seconds),
        ] {
            if value <= 0 {
                return Err(KernelError::Configuration(format!("{name} MUST be > 0")));
            }
        }

        if self.backoff_base_seconds > self.backoff_max_seconds {
            return Err(KernelError::Configuration(
                "backoff_base_seconds cannot exceed backoff_max_seconds".to_string(),
            ));
        }

        for (name, value) in [
            ("max_attempts", self.max_attempts),
            ("worker_max_steps", self.worker_max_steps),
        ] {
            if value == 0 {
                return Err(KernelError::Configuration(format!("{name} MUST be >= 1")));
            }
        }

        Ok(())
    }

    /// Decodes and validates a config from JSON. Missing fields take defaults.
    ///
    /// # Errors
    /// Returns [`KernelError::Configuration`] when decoding or validation fails.
    pub fn from_json(value: &Value) -> Result<Self, KernelError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            KernelError::Configuration(format!("invalid kernel config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn checkpoint_ttl(&self) -> Duration {
        Duration::seconds(self.checkpoint_ttl_seconds)
    }

    #[must_use]
    pub fn lease(&self) -> Duration {
        Duration::seconds(self.lease_seconds)
    }

    /// Delay before the next attempt once `attempts` failures have been recorded.
    #[must_use]
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(30);
        let factor = 1_i64 << exponent;
        let seconds = self
            .backoff_base_seconds
            .saturating_mul(factor)
            .min(self.backoff_max_seconds);
        Duration::seconds(seconds)
    }
}

/// Parses an RFC3339 timestamp and requires a UTC offset.
///
/// # Errors
/// Returns [`KernelError::Validation`] when parsing fails or the offset is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, KernelError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| KernelError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(KernelError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`KernelError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, KernelError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| KernelError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 over the compact `serde_json` encoding of `value`.
///
/// # Errors
/// Returns [`KernelError::Validation`] if serialization fails.
pub fn hash_json(value: &Value) -> Result<String, KernelError> {
    let bytes = serde_json::to_vec(value)
        .map_err(|err| KernelError::Validation(format!("failed to encode JSON for hashing: {err}")))?;
    Ok(hash_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn phase_order_is_forward_only() {
        assert_eq!(Phase::Discovery.next(), Some(Phase::Desirability));
        assert_eq!(Phase::Viability.next(), Some(Phase::Decision));
        assert_eq!(Phase::Decision.next(), None);
        assert!(Phase::Decision.is_final());
        assert!(Phase::Discovery < Phase::Feasibility);
        for phase in Phase::ALL {
            assert_eq!(Phase::parse(phase.as_str()), Some(phase));
        }
    }

    #[test]
    fn run_id_parse_rejects_garbage() {
        let parsed = must_ok(RunId::parse("01J0SQQP7M70P6Y3R4T8D8G8M2"));
        assert_eq!(parsed.to_string(), "01J0SQQP7M70P6Y3R4T8D8G8M2");
        assert!(matches!(
            RunId::parse("not-a-ulid"),
            Err(KernelError::Validation(_))
        ));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = KernelConfig {
            backoff_base_seconds: 10,
            backoff_max_seconds: 45,
            ..KernelConfig::default()
        };
        assert_eq!(config.backoff_for(1), Duration::seconds(10));
        assert_eq!(config.backoff_for(2), Duration::seconds(20));
        assert_eq!(config.backoff_for(3), Duration::seconds(40));
        assert_eq!(config.backoff_for(4), Duration::seconds(45));
        assert_eq!(config.backoff_for(200), Duration::seconds(45));
    }

    #[test]
    fn kernel_config_from_json_fills_defaults_and_validates() {
        let config = must_ok(KernelConfig::from_json(&json!({"lease_seconds": 5})));
        assert_eq!(config.lease_seconds, 5);
        assert_eq!(config.max_attempts, KernelConfig::default().max_attempts);

        let invalid = KernelConfig::from_json(&json!({"max_attempts": 0}));
        assert!(matches!(invalid, Err(KernelError::Configuration(_))));

        let unknown = KernelConfig::from_json(&json!({"lease": 5}));
        assert!(matches!(unknown, Err(KernelError::Configuration(_))));
    }

    #[test]
    fn timestamps_require_utc() {
        let parsed = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z"));
        assert_eq!(must_ok(format_rfc3339(parsed)), "2026-02-07T12:00:00Z");
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
    }

    #[test]
    fn hash_json_is_stable_for_equal_values() {
        let lhs = must_ok(hash_json(&json!({"a": 1, "b": [1, 2]})));
        let rhs = must_ok(hash_json(&json!({"a": 1, "b": [1, 2]})));
        assert_eq!(lhs, rhs);
        assert_eq!(lhs.len(), 64);
    }
}
