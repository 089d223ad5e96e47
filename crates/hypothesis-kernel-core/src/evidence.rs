use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::routing::PivotKind;
use crate::{parse_rfc3339_utc, HumanDecision, KernelError, Phase, RunStatus};

const APPROVALS_KEY: &str = "approvals";
const PIVOTS_KEY: &str = "pivots";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentDepth {
    None,
    Verbal,
    Waitlist,
    Deposit,
    Preorder,
}

impl CommitmentDepth {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Verbal => "verbal",
            Self::Waitlist => "waitlist",
            Self::Deposit => "deposit",
            Self::Preorder => "preorder",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "verbal" => Some(Self::Verbal),
            "waitlist" => Some(Self::Waitlist),
            "deposit" => Some(Self::Deposit),
            "preorder" => Some(Self::Preorder),
            _ => None,
        }
    }

    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Verbal => 1,
            Self::Waitlist => 2,
            Self::Deposit => 3,
            Self::Preorder => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeasibilityStatus {
    Green,
    Orange,
    Red,
}

impl FeasibilityStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Green => "green",
            Self::Orange => "orange",
            Self::Red => "red",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "green" => Some(Self::Green),
            "orange" => Some(Self::Orange),
            "red" => Some(Self::Red),
            _ => None,
        }
    }

    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Red => 0,
            Self::Orange => 1,
            Self::Green => 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryEvidence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_statement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_segment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interviews_completed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_confirmed_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub artifacts: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DesirabilityEvidence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_resonance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_resonance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zombie_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commitment_depth: Option<CommitmentDepth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiments_run: Option<u32>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub artifacts: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FeasibilityEvidence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FeasibilityStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_cost_estimate: Option<f64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub artifacts: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ViabilityEvidence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cac: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ltv: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payback_months: Option<f64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub artifacts: Map<String, Value>,
}

impl ViabilityEvidence {
    /// LTV over CAC. Never stored; absent until both inputs exist and CAC is positive.
    #[must_use]
    pub fn ltv_cac_ratio(&self) -> Option<f64> {
        match (self.ltv, self.cac) {
            (Some(ltv), Some(cac)) if cac > 0.0 => Some(ltv / cac),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DecisionEvidence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub artifacts: Map<String, Value>,
}

/// One phase partition of the run state. The variant always matches the partition key.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum PhaseEvidence {
    Discovery(DiscoveryEvidence),
    Desirability(DesirabilityEvidence),
    Feasibility(FeasibilityEvidence),
    Viability(ViabilityEvidence),
    Decision(DecisionEvidence),
}

/// Every field a phase partition accepts.
#[must_use]
pub fn evidence_fields(phase: Phase) -> &'static [&'static str] {
    match phase {
        Phase::Discovery => &[
            "problem_statement",
            "customer_segment",
            "interviews_completed",
            "problem_confirmed_ratio",
            "artifacts",
        ],
        Phase::Desirability => &[
            "problem_resonance",
            "value_resonance",
            "zombie_ratio",
            "commitment_depth",
            "experiments_run",
            "artifacts",
        ],
        Phase::Feasibility => &["status", "constraints", "build_cost_estimate", "artifacts"],
        Phase::Viability => &["cac", "ltv", "payback_months", "artifacts"],
        Phase::Decision => &["recommendation", "rationale", "artifacts"],
    }
}

/// Fields counted toward a phase's evidence coverage.
#[must_use]
pub fn signal_fields(phase: Phase) -> &'static [&'static str] {
    match phase {
        Phase::Discovery => &[
            "problem_statement",
            "customer_segment",
            "interviews_completed",
            "problem_confirmed_ratio",
        ],
        Phase::Desirability => &[
            "problem_resonance",
            "value_resonance",
            "zombie_ratio",
            "commitment_depth",
        ],
        Phase::Feasibility => &["status", "build_cost_estimate"],
        Phase::Viability => &["cac", "ltv", "payback_months"],
        Phase::Decision => &["recommendation", "rationale"],
    }
}

impl PhaseEvidence {
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            Self::Discovery(_) => Phase::Discovery,
            Self::Desirability(_) => Phase::Desirability,
            Self::Feasibility(_) => Phase::Feasibility,
            Self::Viability(_) => Phase::Viability,
            Self::Decision(_) => Phase::Decision,
        }
    }

    /// Decodes the partition stored under `phase` and checks value ranges.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for unknown fields, wrong types or out-of-range values.
    pub fn decode(phase: Phase, value: &Value) -> Result<Self, KernelError> {
        let decoded = match phase {
            Phase::Discovery => serde_json::from_value(value.clone()).map(Self::Discovery),
            Phase::Desirability => serde_json::from_value(value.clone()).map(Self::Desirability),
            Phase::Feasibility => serde_json::from_value(value.clone()).map(Self::Feasibility),
            Phase::Viability => serde_json::from_value(value.clone()).map(Self::Viability),
            Phase::Decision => serde_json::from_value(value.clone()).map(Self::Decision),
        }
        .map_err(|err| {
            KernelError::Validation(format!("invalid {} evidence: {err}", phase.as_str()))
        })?;
        decoded.validate()?;
        Ok(decoded)
    }

    fn validate(&self) -> Result<(), KernelError> {
        let phase = self.phase();
        match self {
            Self::Discovery(inner) => {
                check_ratio(phase, "problem_confirmed_ratio", inner.problem_confirmed_ratio)?;
            }
            Self::Desirability(inner) => {
                check_ratio(phase, "problem_resonance", inner.problem_resonance)?;
                check_ratio(phase, "value_resonance", inner.value_resonance)?;
                check_ratio(phase, "zombie_ratio", inner.zombie_ratio)?;
            }
            Self::Feasibility(inner) => {
                check_non_negative(phase, "build_cost_estimate", inner.build_cost_estimate)?;
                if inner.constraints.iter().any(|item| item.trim().is_empty()) {
                    return Err(KernelError::Validation(
                        "feasibility.constraints entries MUST be non-empty".to_string(),
                    ));
                }
            }
            Self::Viability(inner) => {
                check_non_negative(phase, "cac", inner.cac)?;
                check_non_negative(phase, "ltv", inner.ltv)?;
                check_non_negative(phase, "payback_months", inner.payback_months)?;
            }
            Self::Decision(_) => {}
        }
        Ok(())
    }

    fn to_value(&self) -> Result<Value, KernelError> {
        serde_json::to_value(self).map_err(|err| {
            KernelError::Validation(format!(
                "failed to encode {} evidence: {err}",
                self.phase().as_str()
            ))
        })
    }

    /// Fraction of the phase's signal fields that carry a value, in `[0, 1]`.
    #[must_use]
    pub fn coverage(&self) -> f64 {
        let fields = signal_fields(self.phase());
        let Ok(Value::Object(map)) = self.to_value() else {
            return 0.0;
        };
        let present = fields.iter().filter(|field| map.contains_key(**field)).count();
        ratio(present, fields.len())
    }
}

fn check_ratio(phase: Phase, field: &str, value: Option<f64>) -> Result<(), KernelError> {
    match value {
        Some(inner) if !(inner.is_finite() && (0.0..=1.0).contains(&inner)) => {
            Err(KernelError::Validation(format!(
                "{}.{field} MUST be in [0.0, 1.0]",
                phase.as_str()
            )))
        }
        _ => Ok(()),
    }
}

fn check_non_negative(phase: Phase, field: &str, value: Option<f64>) -> Result<(), KernelError> {
    match value {
        Some(inner) if !(inner.is_finite() && inner >= 0.0) => Err(KernelError::Validation(
            format!("{}.{field} MUST be finite and >= 0", phase.as_str()),
        )),
        _ => Ok(()),
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64
}

/// A human decision folded into the run state under its checkpoint name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Approval {
    pub decision: HumanDecision,
    pub decided_by: String,
    pub decided_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Approval {
    fn validate(&self, checkpoint_name: &str) -> Result<(), KernelError> {
        if self.decided_by.trim().is_empty() {
            return Err(KernelError::Validation(format!(
                "approvals.{checkpoint_name}.decided_by MUST be non-empty"
            )));
        }
        parse_rfc3339_utc(&self.decided_at)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PivotRecord {
    pub kind: PivotKind,
    pub from_phase: Phase,
    pub to_phase: Phase,
    pub reason: String,
    pub at_version: u64,
}

/// Typed view of a run's structured state.
///
/// Serializes to the document form `{ <phase>: {...}, "approvals": {...}, "pivots": [...] }`
/// and only deserializes documents whose partitions decode into their phase's shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvidenceState {
    partitions: BTreeMap<Phase, PhaseEvidence>,
    approvals: BTreeMap<String, Approval>,
    pivots: Vec<PivotRecord>,
}

impl EvidenceState {
    /// Validates a merged document into the typed state.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for non-object documents, unknown partitions,
    /// or partitions that do not fit their phase shape.
    pub fn from_document(document: &Value) -> Result<Self, KernelError> {
        let Value::Object(map) = document else {
            return Err(KernelError::Validation(
                "structured_state MUST be a JSON object".to_string(),
            ));
        };

        let mut state = Self::default();
        for (key, value) in map {
            if let Some(phase) = Phase::parse(key) {
                state
                    .partitions
                    .insert(phase, PhaseEvidence::decode(phase, value)?);
                continue;
            }

            match key.as_str() {
                APPROVALS_KEY => {
                    let approvals: BTreeMap<String, Approval> =
                        serde_json::from_value(value.clone()).map_err(|err| {
                            KernelError::Validation(format!("invalid approvals: {err}"))
                        })?;
                    for (name, approval) in &approvals {
                        approval.validate(name)?;
                    }
                    state.approvals = approvals;
                }
                PIVOTS_KEY => {
                    state.pivots = serde_json::from_value(value.clone()).map_err(|err| {
                        KernelError::Validation(format!("invalid pivots log: {err}"))
                    })?;
                }
                other => {
                    return Err(KernelError::Validation(format!(
                        "unknown structured_state partition `{other}`"
                    )));
                }
            }
        }

        Ok(state)
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] if encoding fails.
    pub fn to_document(&self) -> Result<Value, KernelError> {
        serde_json::to_value(self)
            .map_err(|err| KernelError::Validation(format!("failed to encode state: {err}")))
    }

    #[must_use]
    pub fn partition(&self, phase: Phase) -> Option<&PhaseEvidence> {
        self.partitions.get(&phase)
    }

    /// The partition as a JSON object, empty when the phase has no evidence yet.
    #[must_use]
    pub fn partition_document(&self, phase: Phase) -> Value {
        self.partition(phase)
            .and_then(|evidence| evidence.to_value().ok())
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    #[must_use]
    pub fn discovery(&self) -> Option<&DiscoveryEvidence> {
        match self.partitions.get(&Phase::Discovery) {
            Some(PhaseEvidence::Discovery(inner)) => Some(inner),
            _ => None,
        }
    }

    #[must_use]
    pub fn desirability(&self) -> Option<&DesirabilityEvidence> {
        match self.partitions.get(&Phase::Desirability) {
            Some(PhaseEvidence::Desirability(inner)) => Some(inner),
            _ => None,
        }
    }

    #[must_use]
    pub fn feasibility(&self) -> Option<&FeasibilityEvidence> {
        match self.partitions.get(&Phase::Feasibility) {
            Some(PhaseEvidence::Feasibility(inner)) => Some(inner),
            _ => None,
        }
    }

    #[must_use]
    pub fn viability(&self) -> Option<&ViabilityEvidence> {
        match self.partitions.get(&Phase::Viability) {
            Some(PhaseEvidence::Viability(inner)) => Some(inner),
            _ => None,
        }
    }

    #[must_use]
    pub fn decision(&self) -> Option<&DecisionEvidence> {
        match self.partitions.get(&Phase::Decision) {
            Some(PhaseEvidence::Decision(inner)) => Some(inner),
            _ => None,
        }
    }

    #[must_use]
    pub fn approval(&self, checkpoint_name: &str) -> Option<&Approval> {
        self.approvals.get(checkpoint_name)
    }

    #[must_use]
    pub fn approvals(&self) -> &BTreeMap<String, Approval> {
        &self.approvals
    }

    #[must_use]
    pub fn pivots(&self) -> &[PivotRecord] {
        &self.pivots
    }

    pub(crate) fn remove_partition(&mut self, phase: Phase) {
        self.partitions.remove(&phase);
    }

    pub(crate) fn remove_approval(&mut self, checkpoint_name: &str) {
        self.approvals.remove(checkpoint_name);
    }

    pub(crate) fn push_pivot(&mut self, record: PivotRecord) {
        self.pivots.push(record);
    }

    /// Clears one field of a partition, leaving its siblings intact.
    pub(crate) fn reset_field(&mut self, phase: Phase, field: &str) -> Result<(), KernelError> {
        let Some(evidence) = self.partitions.get(&phase) else {
            return Ok(());
        };
        let mut value = evidence.to_value()?;
        if let Value::Object(map) = &mut value {
            map.remove(field);
        }
        let rebuilt = PhaseEvidence::decode(phase, &value)?;
        self.partitions.insert(phase, rebuilt);
        Ok(())
    }

    /// Derived progress view. Recomputed on every read.
    #[must_use]
    pub fn summarize(&self, current_phase: Phase, status: RunStatus) -> StateSummary {
        let phases: Vec<PhaseSummary> = Phase::ALL
            .iter()
            .map(|phase| {
                let coverage = self.partition(*phase).map_or(0.0, PhaseEvidence::coverage);
                PhaseSummary {
                    phase: *phase,
                    coverage_pct: to_pct(coverage),
                    signals_present: self.partition(*phase).map_or(0, |evidence| {
                        signal_count(evidence, signal_fields(*phase))
                    }),
                    signals_total: signal_fields(*phase).len(),
                }
            })
            .collect();

        let progress_pct = if status == RunStatus::Completed {
            100
        } else {
            to_pct(ratio(current_phase.ordinal(), Phase::ALL.len()))
        };

        StateSummary {
            progress_pct,
            phases,
            pivot_count: self.pivots.len(),
            approvals: self
                .approvals
                .iter()
                .map(|(name, approval)| (name.clone(), approval.decision))
                .collect(),
        }
    }
}

fn signal_count(evidence: &PhaseEvidence, fields: &[&str]) -> usize {
    match evidence.to_value() {
        Ok(Value::Object(map)) => fields.iter().filter(|field| map.contains_key(**field)).count(),
        _ => 0,
    }
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn to_pct(fraction: f64) -> u8 {
    (fraction.clamp(0.0, 1.0) * 100.0).round() as u8
}

impl Serialize for EvidenceState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for (phase, evidence) in &self.partitions {
            map.serialize_entry(phase.as_str(), evidence)?;
        }
        if !self.approvals.is_empty() {
            map.serialize_entry(APPROVALS_KEY, &self.approvals)?;
        }
        if !self.pivots.is_empty() {
            map.serialize_entry(PIVOTS_KEY, &self.pivots)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for EvidenceState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_document(&value).map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseSummary {
    pub phase: Phase,
    pub coverage_pct: u8,
    pub signals_present: usize,
    pub signals_total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateSummary {
    pub progress_pct: u8,
    pub phases: Vec<PhaseSummary>,
    pub pivot_count: usize,
    pub approvals: BTreeMap<String, HumanDecision>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must<T>(result: Result<T, KernelError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn document_decodes_into_phase_variants() {
        let state = must(EvidenceState::from_document(&json!({
            "discovery": {"problem_statement": "invoices are slow", "interviews_completed": 7},
            "desirability": {"problem_resonance": 0.42, "commitment_depth": "waitlist"},
        })));

        assert_eq!(
            state.discovery().and_then(|d| d.interviews_completed),
            Some(7)
        );
        assert_eq!(
            state.desirability().and_then(|d| d.commitment_depth),
            Some(CommitmentDepth::Waitlist)
        );
        assert!(state.feasibility().is_none());
        assert_eq!(
            state.partition(Phase::Discovery).map(PhaseEvidence::phase),
            Some(Phase::Discovery)
        );
    }

    #[test]
    fn unknown_fields_and_partitions_are_rejected() {
        let unknown_field = EvidenceState::from_document(&json!({
            "desirability": {"problem_resonanse": 0.4}
        }));
        assert!(matches!(unknown_field, Err(KernelError::Validation(_))));

        let unknown_partition = EvidenceState::from_document(&json!({"marketing": {}}));
        assert!(matches!(unknown_partition, Err(KernelError::Validation(_))));

        let not_object = EvidenceState::from_document(&json!([1, 2]));
        assert!(matches!(not_object, Err(KernelError::Validation(_))));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let ratio = EvidenceState::from_document(&json!({
            "desirability": {"zombie_ratio": 1.4}
        }));
        assert!(matches!(ratio, Err(KernelError::Validation(_))));

        let negative = EvidenceState::from_document(&json!({"viability": {"cac": -3.0}}));
        assert!(matches!(negative, Err(KernelError::Validation(_))));

        let bad_approval = EvidenceState::from_document(&json!({
            "approvals": {"discovery_review": {
                "decision": "approve", "decided_by": " ", "decided_at": "2026-02-07T12:00:00Z"
            }}
        }));
        assert!(matches!(bad_approval, Err(KernelError::Validation(_))));
    }

    #[test]
    fn document_round_trip_omits_absent_fields() {
        let input = json!({
            "discovery": {"customer_segment": "freelancers"},
            "viability": {"cac": 40.0, "ltv": 200.0}
        });
        let state = must(EvidenceState::from_document(&input));
        let document = must(state.to_document());
        assert_eq!(document, input);
        assert_eq!(state.viability().and_then(ViabilityEvidence::ltv_cac_ratio), Some(5.0));
    }

    #[test]
    fn reset_field_keeps_siblings() {
        let mut state = must(EvidenceState::from_document(&json!({
            "discovery": {
                "problem_statement": "invoices are slow",
                "customer_segment": "freelancers",
                "artifacts": {"notes": "call log"}
            }
        })));
        must(state.reset_field(Phase::Discovery, "customer_segment"));

        let discovery = match state.discovery() {
            Some(value) => value,
            None => panic!("discovery partition vanished"),
        };
        assert!(discovery.customer_segment.is_none());
        assert_eq!(
            discovery.problem_statement.as_deref(),
            Some("invoices are slow")
        );
        assert_eq!(discovery.artifacts.get("notes"), Some(&json!("call log")));

        must(state.reset_field(Phase::Viability, "cac"));
        assert!(state.viability().is_none());
    }

    #[test]
    fn ltv_cac_ratio_requires_positive_cac() {
        let evidence = ViabilityEvidence {
            cac: Some(0.0),
            ltv: Some(10.0),
            ..ViabilityEvidence::default()
        };
        assert_eq!(evidence.ltv_cac_ratio(), None);
    }

    #[test]
    fn summary_is_derived_from_state() {
        let state = must(EvidenceState::from_document(&json!({
            "discovery": {
                "problem_statement": "p",
                "customer_segment": "s",
                "interviews_completed": 5,
                "problem_confirmed_ratio": 0.6
            },
            "desirability": {"problem_resonance": 0.5}
        })));

        let summary = state.summarize(Phase::Desirability, RunStatus::Active);
        assert_eq!(summary.progress_pct, 20);
        assert_eq!(summary.phases[0].coverage_pct, 100);
        assert_eq!(summary.phases[1].coverage_pct, 25);
        assert_eq!(summary.phases[1].signals_present, 1);
        assert_eq!(summary.phases[4].coverage_pct, 0);

        let done = state.summarize(Phase::Decision, RunStatus::Completed);
        assert_eq!(done.progress_pct, 100);
    }
}
