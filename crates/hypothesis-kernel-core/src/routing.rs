use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::evidence::{evidence_fields, CommitmentDepth, EvidenceState, FeasibilityStatus};
use crate::{HumanDecision, KernelError, Phase};

/// Closed taxonomy of pivots. Each kind names the assumption the evidence falsified.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PivotKind {
    AudienceMismatch,
    ValueMismatch,
    ScopeMismatch,
    CostStructureMismatch,
}

impl PivotKind {
    pub const ALL: [PivotKind; 4] = [
        Self::AudienceMismatch,
        Self::ValueMismatch,
        Self::ScopeMismatch,
        Self::CostStructureMismatch,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AudienceMismatch => "audience_mismatch",
            Self::ValueMismatch => "value_mismatch",
            Self::ScopeMismatch => "scope_mismatch",
            Self::CostStructureMismatch => "cost_structure_mismatch",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "audience_mismatch" => Some(Self::AudienceMismatch),
            "value_mismatch" => Some(Self::ValueMismatch),
            "scope_mismatch" => Some(Self::ScopeMismatch),
            "cost_structure_mismatch" => Some(Self::CostStructureMismatch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    InterviewsCompleted,
    ProblemConfirmedRatio,
    ProblemResonance,
    ValueResonance,
    ZombieRatio,
    CommitmentDepth,
    ExperimentsRun,
    FeasibilityStatus,
    LtvCacRatio,
    PaybackMonths,
}

impl Signal {
    pub const ALL: [Signal; 10] = [
        Self::InterviewsCompleted,
        Self::ProblemConfirmedRatio,
        Self::ProblemResonance,
        Self::ValueResonance,
        Self::ZombieRatio,
        Self::CommitmentDepth,
        Self::ExperimentsRun,
        Self::FeasibilityStatus,
        Self::LtvCacRatio,
        Self::PaybackMonths,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InterviewsCompleted => "interviews_completed",
            Self::ProblemConfirmedRatio => "problem_confirmed_ratio",
            Self::ProblemResonance => "problem_resonance",
            Self::ValueResonance => "value_resonance",
            Self::ZombieRatio => "zombie_ratio",
            Self::CommitmentDepth => "commitment_depth",
            Self::ExperimentsRun => "experiments_run",
            Self::FeasibilityStatus => "feasibility_status",
            Self::LtvCacRatio => "ltv_cac_ratio",
            Self::PaybackMonths => "payback_months",
        }
    }

    /// Labels accepted by `is` predicates. Empty for numeric signals.
    #[must_use]
    pub fn levels(self) -> &'static [&'static str] {
        match self {
            Self::CommitmentDepth => &["none", "verbal", "waitlist", "deposit", "preorder"],
            Self::FeasibilityStatus => &["green", "orange", "red"],
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SignalValue {
    Number(f64),
    Level { label: &'static str, rank: u8 },
}

impl SignalValue {
    #[must_use]
    pub fn numeric(self) -> f64 {
        match self {
            Self::Number(value) => value,
            Self::Level { rank, .. } => f64::from(rank),
        }
    }

    #[must_use]
    pub fn to_json(self) -> Value {
        match self {
            Self::Number(value) => Value::from(value),
            Self::Level { label, .. } => Value::from(label),
        }
    }
}

/// Reads one signal from the state. `None` means the signal has not been measured.
#[must_use]
pub fn extract_signal(state: &EvidenceState, signal: Signal) -> Option<SignalValue> {
    match signal {
        Signal::InterviewsCompleted => state
            .discovery()?
            .interviews_completed
            .map(|count| SignalValue::Number(f64::from(count))),
        Signal::ProblemConfirmedRatio => state
            .discovery()?
            .problem_confirmed_ratio
            .map(SignalValue::Number),
        Signal::ProblemResonance => state
            .desirability()?
            .problem_resonance
            .map(SignalValue::Number),
        Signal::ValueResonance => state
            .desirability()?
            .value_resonance
            .map(SignalValue::Number),
        Signal::ZombieRatio => state.desirability()?.zombie_ratio.map(SignalValue::Number),
        Signal::CommitmentDepth => {
            state
                .desirability()?
                .commitment_depth
                .map(|depth: CommitmentDepth| SignalValue::Level {
                    label: depth.as_str(),
                    rank: depth.rank(),
                })
        }
        Signal::ExperimentsRun => state
            .desirability()?
            .experiments_run
            .map(|count| SignalValue::Number(f64::from(count))),
        Signal::FeasibilityStatus => {
            state
                .feasibility()?
                .status
                .map(|status: FeasibilityStatus| SignalValue::Level {
                    label: status.as_str(),
                    rank: status.rank(),
                })
        }
        Signal::LtvCacRatio => state.viability()?.ltv_cac_ratio().map(SignalValue::Number),
        Signal::PaybackMonths => state
            .viability()?
            .payback_months
            .map(SignalValue::Number),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Below { signal: Signal, threshold: f64 },
    AtLeast { signal: Signal, threshold: f64 },
    Is { signal: Signal, value: String },
    Approved { checkpoint: String },
    Rejected { checkpoint: String },
    All { of: Vec<Predicate> },
}

impl Predicate {
    /// Absent signals never match.
    #[must_use]
    pub fn matches(&self, state: &EvidenceState) -> bool {
        match self {
            Self::Below { signal, threshold } => {
                extract_signal(state, *signal).is_some_and(|value| value.numeric() < *threshold)
            }
            Self::AtLeast { signal, threshold } => {
                extract_signal(state, *signal).is_some_and(|value| value.numeric() >= *threshold)
            }
            Self::Is { signal, value } => extract_signal(state, *signal).is_some_and(
                |found| matches!(found, SignalValue::Level { label, .. } if label == value.as_str()),
            ),
            Self::Approved { checkpoint } => state
                .approval(checkpoint)
                .is_some_and(|approval| approval.decision == HumanDecision::Approve),
            Self::Rejected { checkpoint } => state
                .approval(checkpoint)
                .is_some_and(|approval| approval.decision == HumanDecision::Reject),
            Self::All { of } => !of.is_empty() && of.iter().all(|inner| inner.matches(state)),
        }
    }

    fn validate(&self, context: &str) -> Result<(), KernelError> {
        match self {
            Self::Below { threshold, .. } | Self::AtLeast { threshold, .. } => {
                if !threshold.is_finite() {
                    return Err(KernelError::Configuration(format!(
                        "{context}: threshold MUST be finite"
                    )));
                }
            }
            Self::Is { signal, value } => {
                if !signal.levels().contains(&value.as_str()) {
                    return Err(KernelError::Configuration(format!(
                        "{context}: `{value}` is not a level of {}",
                        signal.as_str()
                    )));
                }
            }
            Self::Approved { checkpoint } | Self::Rejected { checkpoint } => {
                if checkpoint.trim().is_empty() {
                    return Err(KernelError::Configuration(format!(
                        "{context}: checkpoint MUST be non-empty"
                    )));
                }
            }
            Self::All { of } => {
                if of.is_empty() {
                    return Err(KernelError::Configuration(format!(
                        "{context}: `all` needs at least one predicate"
                    )));
                }
                for inner in of {
                    inner.validate(context)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Advance { next_phase: Phase },
    Pivot { kind: PivotKind, reason: String },
    Hold { checkpoint_name: String },
    Fail { reason: String },
    /// Advance out of the final phase.
    Complete,
    /// Stay in the phase and keep collecting evidence.
    Collect { reason: String },
}

impl Decision {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Advance { .. } => "advance",
            Self::Pivot { .. } => "pivot",
            Self::Hold { .. } => "hold",
            Self::Fail { .. } => "fail",
            Self::Complete => "complete",
            Self::Collect { .. } => "collect",
        }
    }

    #[must_use]
    pub fn hold_checkpoint(&self) -> Option<&str> {
        match self {
            Self::Hold { checkpoint_name } => Some(checkpoint_name),
            _ => None,
        }
    }

    fn validate(&self, phase: Phase, context: &str) -> Result<(), KernelError> {
        match self {
            Self::Advance { next_phase } => {
                if *next_phase <= phase {
                    return Err(KernelError::Configuration(format!(
                        "{context}: advance from {} to {} does not move forward",
                        phase.as_str(),
                        next_phase.as_str()
                    )));
                }
            }
            Self::Complete => {
                if !phase.is_final() {
                    return Err(KernelError::Configuration(format!(
                        "{context}: complete is only allowed in the final phase"
                    )));
                }
            }
            Self::Hold { checkpoint_name } if checkpoint_name.trim().is_empty() => {
                return Err(KernelError::Configuration(format!(
                    "{context}: hold needs a checkpoint name"
                )));
            }
            Self::Pivot { reason, .. } | Self::Fail { reason } | Self::Collect { reason }
                if reason.trim().is_empty() =>
            {
                return Err(KernelError::Configuration(format!(
                    "{context}: reason MUST be non-empty"
                )));
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Guard {
    pub name: String,
    pub when: Predicate,
    pub then: Decision,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseRoutes {
    pub phase: Phase,
    pub guards: Vec<Guard>,
    pub default: Decision,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum ResetTarget {
    Field { phase: Phase, field: String },
    Partition { phase: Phase },
    Approval { checkpoint: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PivotRule {
    pub kind: PivotKind,
    pub falsifies: String,
    pub return_phase: Phase,
    pub resets: Vec<ResetTarget>,
}

impl PivotRule {
    /// Applies the partial reset. Anything not listed survives.
    pub(crate) fn apply(&self, state: &mut EvidenceState) -> Result<(), KernelError> {
        for target in &self.resets {
            match target {
                ResetTarget::Field { phase, field } => state.reset_field(*phase, field)?,
                ResetTarget::Partition { phase } => state.remove_partition(*phase),
                ResetTarget::Approval { checkpoint } => state.remove_approval(checkpoint),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum TimeoutPolicy {
    Fail,
    Escalate { checkpoint_name: String },
}

/// Versioned routing configuration: guards per phase, pivot resets and limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingTable {
    pub routing_version: u32,
    pub max_pivots: u32,
    pub checkpoint_timeout: TimeoutPolicy,
    pub phases: Vec<PhaseRoutes>,
    pub pivots: Vec<PivotRule>,
}

fn guard(name: &str, when: Predicate, then: Decision) -> Guard {
    Guard {
        name: name.to_string(),
        when,
        then,
    }
}

fn below(signal: Signal, threshold: f64) -> Predicate {
    Predicate::Below { signal, threshold }
}

fn at_least(signal: Signal, threshold: f64) -> Predicate {
    Predicate::AtLeast { signal, threshold }
}

fn approved(checkpoint: &str) -> Predicate {
    Predicate::Approved {
        checkpoint: checkpoint.to_string(),
    }
}

fn rejected(checkpoint: &str) -> Predicate {
    Predicate::Rejected {
        checkpoint: checkpoint.to_string(),
    }
}

fn pivot(kind: PivotKind, reason: &str) -> Decision {
    Decision::Pivot {
        kind,
        reason: reason.to_string(),
    }
}

fn hold(checkpoint_name: &str) -> Decision {
    Decision::Hold {
        checkpoint_name: checkpoint_name.to_string(),
    }
}

fn fail(reason: &str) -> Decision {
    Decision::Fail {
        reason: reason.to_string(),
    }
}

fn collect(reason: &str) -> Decision {
    Decision::Collect {
        reason: reason.to_string(),
    }
}

fn field(phase: Phase, name: &str) -> ResetTarget {
    ResetTarget::Field {
        phase,
        field: name.to_string(),
    }
}

fn approval(checkpoint: &str) -> ResetTarget {
    ResetTarget::Approval {
        checkpoint: checkpoint.to_string(),
    }
}

const DISCOVERY_REVIEW: &str = "discovery_review";
const DESIRABILITY_GATE: &str = "desirability_gate";
const FEASIBILITY_REVIEW: &str = "feasibility_review";
const VIABILITY_REVIEW: &str = "viability_review";
const FINAL_DECISION: &str = "final_decision";

impl RoutingTable {
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn v1() -> Self {
        let discovery = PhaseRoutes {
            phase: Phase::Discovery,
            guards: vec![
                guard(
                    "discovery.review_rejected",
                    rejected(DISCOVERY_REVIEW),
                    fail("discovery review rejected the problem hypothesis"),
                ),
                guard(
                    "discovery.review_approved",
                    approved(DISCOVERY_REVIEW),
                    Decision::Advance {
                        next_phase: Phase::Desirability,
                    },
                ),
                guard(
                    "discovery.problem_unconfirmed",
                    Predicate::All {
                        of: vec![
                            at_least(Signal::InterviewsCompleted, 5.0),
                            below(Signal::ProblemConfirmedRatio, 0.3),
                        ],
                    },
                    pivot(
                        PivotKind::AudienceMismatch,
                        "interviewed segment does not confirm the problem",
                    ),
                ),
                guard(
                    "discovery.ready_for_review",
                    Predicate::All {
                        of: vec![
                            at_least(Signal::InterviewsCompleted, 5.0),
                            at_least(Signal::ProblemConfirmedRatio, 0.3),
                        ],
                    },
                    hold(DISCOVERY_REVIEW),
                ),
            ],
            default: collect("discovery needs at least 5 interviews"),
        };

        let desirability = PhaseRoutes {
            phase: Phase::Desirability,
            guards: vec![
                guard(
                    "desirability.gate_rejected",
                    rejected(DESIRABILITY_GATE),
                    pivot(
                        PivotKind::ValueMismatch,
                        "reviewer rejected the value proposition",
                    ),
                ),
                guard(
                    "desirability.gate_approved",
                    approved(DESIRABILITY_GATE),
                    Decision::Advance {
                        next_phase: Phase::Feasibility,
                    },
                ),
                guard(
                    "desirability.low_problem_resonance",
                    below(Signal::ProblemResonance, 0.3),
                    pivot(
                        PivotKind::AudienceMismatch,
                        "problem_resonance below 0.3: the audience does not feel the problem",
                    ),
                ),
                guard(
                    "desirability.zombie_interest",
                    at_least(Signal::ZombieRatio, 0.7),
                    pivot(
                        PivotKind::ValueMismatch,
                        "zombie_ratio at or above 0.7: interest without commitment",
                    ),
                ),
                guard(
                    "desirability.low_value_resonance",
                    below(Signal::ValueResonance, 0.3),
                    pivot(
                        PivotKind::ValueMismatch,
                        "value_resonance below 0.3: the offer does not land",
                    ),
                ),
                guard(
                    "desirability.ready_for_gate",
                    Predicate::All {
                        of: vec![
                            at_least(Signal::ProblemResonance, 0.3),
                            at_least(Signal::ValueResonance, 0.5),
                            at_least(
                                Signal::CommitmentDepth,
                                f64::from(CommitmentDepth::Waitlist.rank()),
                            ),
                        ],
                    },
                    hold(DESIRABILITY_GATE),
                ),
            ],
            default: collect("desirability signals are inconclusive"),
        };

        let feasibility = PhaseRoutes {
            phase: Phase::Feasibility,
            guards: vec![
                guard(
                    "feasibility.review_rejected",
                    rejected(FEASIBILITY_REVIEW),
                    pivot(
                        PivotKind::ScopeMismatch,
                        "reviewer rejected the constrained scope",
                    ),
                ),
                guard(
                    "feasibility.review_approved",
                    approved(FEASIBILITY_REVIEW),
                    Decision::Advance {
                        next_phase: Phase::Viability,
                    },
                ),
                guard(
                    "feasibility.red",
                    Predicate::Is {
                        signal: Signal::FeasibilityStatus,
                        value: "red".to_string(),
                    },
                    pivot(
                        PivotKind::ScopeMismatch,
                        "solution cannot be built as proposed",
                    ),
                ),
                guard(
                    "feasibility.orange",
                    Predicate::Is {
                        signal: Signal::FeasibilityStatus,
                        value: "orange".to_string(),
                    },
                    hold(FEASIBILITY_REVIEW),
                ),
                guard(
                    "feasibility.green",
                    Predicate::Is {
                        signal: Signal::FeasibilityStatus,
                        value: "green".to_string(),
                    },
                    Decision::Advance {
                        next_phase: Phase::Viability,
                    },
                ),
            ],
            default: collect("feasibility has not been assessed"),
        };

        let viability = PhaseRoutes {
            phase: Phase::Viability,
            guards: vec![
                guard(
                    "viability.review_rejected",
                    rejected(VIABILITY_REVIEW),
                    pivot(
                        PivotKind::CostStructureMismatch,
                        "reviewer rejected the unit economics",
                    ),
                ),
                guard(
                    "viability.review_approved",
                    approved(VIABILITY_REVIEW),
                    Decision::Advance {
                        next_phase: Phase::Decision,
                    },
                ),
                guard(
                    "viability.underwater",
                    below(Signal::LtvCacRatio, 1.0),
                    pivot(
                        PivotKind::CostStructureMismatch,
                        "ltv_cac_ratio below 1.0: every customer loses money",
                    ),
                ),
                guard(
                    "viability.strong",
                    at_least(Signal::LtvCacRatio, 3.0),
                    Decision::Advance {
                        next_phase: Phase::Decision,
                    },
                ),
                guard(
                    "viability.marginal",
                    at_least(Signal::LtvCacRatio, 1.0),
                    hold(VIABILITY_REVIEW),
                ),
            ],
            default: collect("unit economics need cac and ltv"),
        };

        let decision = PhaseRoutes {
            phase: Phase::Decision,
            guards: vec![
                guard(
                    "decision.approved",
                    approved(FINAL_DECISION),
                    Decision::Complete,
                ),
                guard(
                    "decision.rejected",
                    rejected(FINAL_DECISION),
                    fail("hypothesis killed at the final decision"),
                ),
            ],
            default: hold(FINAL_DECISION),
        };

        let downstream_approvals = [
            DESIRABILITY_GATE,
            FEASIBILITY_REVIEW,
            VIABILITY_REVIEW,
            FINAL_DECISION,
        ];

        let mut audience_resets = vec![
            field(Phase::Discovery, "customer_segment"),
            field(Phase::Discovery, "interviews_completed"),
            field(Phase::Discovery, "problem_confirmed_ratio"),
            ResetTarget::Partition {
                phase: Phase::Desirability,
            },
            ResetTarget::Partition {
                phase: Phase::Feasibility,
            },
            ResetTarget::Partition {
                phase: Phase::Viability,
            },
            ResetTarget::Partition {
                phase: Phase::Decision,
            },
            approval(DISCOVERY_REVIEW),
        ];
        audience_resets.extend(downstream_approvals.iter().map(|name| approval(name)));

        let mut value_resets = vec![
            field(Phase::Desirability, "value_resonance"),
            field(Phase::Desirability, "zombie_ratio"),
            field(Phase::Desirability, "commitment_depth"),
            field(Phase::Desirability, "experiments_run"),
            ResetTarget::Partition {
                phase: Phase::Feasibility,
            },
            ResetTarget::Partition {
                phase: Phase::Viability,
            },
            ResetTarget::Partition {
                phase: Phase::Decision,
            },
        ];
        value_resets.extend(downstream_approvals.iter().map(|name| approval(name)));

        let mut scope_resets = vec![
            field(Phase::Desirability, "value_resonance"),
            field(Phase::Desirability, "commitment_depth"),
            ResetTarget::Partition {
                phase: Phase::Feasibility,
            },
            ResetTarget::Partition {
                phase: Phase::Viability,
            },
            ResetTarget::Partition {
                phase: Phase::Decision,
            },
        ];
        scope_resets.extend(downstream_approvals.iter().map(|name| approval(name)));

        let cost_resets = vec![
            field(Phase::Viability, "cac"),
            field(Phase::Viability, "ltv"),
            field(Phase::Viability, "payback_months"),
            ResetTarget::Partition {
                phase: Phase::Decision,
            },
            approval(VIABILITY_REVIEW),
            approval(FINAL_DECISION),
        ];

        Self {
            routing_version: 1,
            max_pivots: 3,
            checkpoint_timeout: TimeoutPolicy::Fail,
            phases: vec![discovery, desirability, feasibility, viability, decision],
            pivots: vec![
                PivotRule {
                    kind: PivotKind::AudienceMismatch,
                    falsifies: "customer segment".to_string(),
                    return_phase: Phase::Discovery,
                    resets: audience_resets,
                },
                PivotRule {
                    kind: PivotKind::ValueMismatch,
                    falsifies: "value proposition".to_string(),
                    return_phase: Phase::Desirability,
                    resets: value_resets,
                },
                PivotRule {
                    kind: PivotKind::ScopeMismatch,
                    falsifies: "solution scope is buildable".to_string(),
                    return_phase: Phase::Desirability,
                    resets: scope_resets,
                },
                PivotRule {
                    kind: PivotKind::CostStructureMismatch,
                    falsifies: "unit economics".to_string(),
                    return_phase: Phase::Viability,
                    resets: cost_resets,
                },
            ],
        }
    }

    /// Validates phase coverage, pivot coverage and every guard.
    ///
    /// # Errors
    /// Returns [`KernelError::Configuration`] naming the first invalid entry.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.routing_version == 0 {
            return Err(KernelError::Configuration(
                "routing_version MUST be >= 1".to_string(),
            ));
        }
        if self.max_pivots == 0 {
            return Err(KernelError::Configuration(
                "max_pivots MUST be >= 1".to_string(),
            ));
        }
        if let TimeoutPolicy::Escalate { checkpoint_name } = &self.checkpoint_timeout {
            if checkpoint_name.trim().is_empty() {
                return Err(KernelError::Configuration(
                    "checkpoint_timeout.checkpoint_name MUST be non-empty".to_string(),
                ));
            }
        }

        let mut seen_phases = BTreeSet::new();
        for routes in &self.phases {
            if !seen_phases.insert(routes.phase) {
                return Err(KernelError::Configuration(format!(
                    "phase {} is routed more than once",
                    routes.phase.as_str()
                )));
            }

            let mut guard_names = BTreeSet::new();
            for guard in &routes.guards {
                let context = format!("{}/{}", routes.phase.as_str(), guard.name);
                if guard.name.trim().is_empty() || !guard_names.insert(guard.name.as_str()) {
                    return Err(KernelError::Configuration(format!(
                        "{context}: guard names MUST be non-empty and unique per phase"
                    )));
                }
                guard.when.validate(&context)?;
                guard.then.validate(routes.phase, &context)?;
                self.check_pivot_reference(&guard.then, &context)?;
            }

            let context = format!("{}/default", routes.phase.as_str());
            routes.default.validate(routes.phase, &context)?;
            self.check_pivot_reference(&routes.default, &context)?;
        }
        for phase in Phase::ALL {
            if !seen_phases.contains(&phase) {
                return Err(KernelError::Configuration(format!(
                    "phase {} has no routes",
                    phase.as_str()
                )));
            }
        }

        let mut seen_kinds = BTreeSet::new();
        for rule in &self.pivots {
            if !seen_kinds.insert(rule.kind) {
                return Err(KernelError::Configuration(format!(
                    "pivot {} has more than one reset rule",
                    rule.kind.as_str()
                )));
            }
            for target in &rule.resets {
                match target {
                    ResetTarget::Field { phase, field } => {
                        if !evidence_fields(*phase).contains(&field.as_str()) {
                            return Err(KernelError::Configuration(format!(
                                "pivot {}: {}.{field} is not an evidence field",
                                rule.kind.as_str(),
                                phase.as_str()
                            )));
                        }
                    }
                    ResetTarget::Approval { checkpoint } if checkpoint.trim().is_empty() => {
                        return Err(KernelError::Configuration(format!(
                            "pivot {}: approval reset needs a checkpoint name",
                            rule.kind.as_str()
                        )));
                    }
                    _ => {}
                }
            }
        }
        for kind in PivotKind::ALL {
            if !seen_kinds.contains(&kind) {
                return Err(KernelError::Configuration(format!(
                    "pivot {} has no reset rule",
                    kind.as_str()
                )));
            }
        }

        Ok(())
    }

    fn check_pivot_reference(&self, decision: &Decision, context: &str) -> Result<(), KernelError> {
        if let Decision::Pivot { kind, .. } = decision {
            if self.pivot_rule(*kind).is_none() {
                return Err(KernelError::Configuration(format!(
                    "{context}: pivot {} has no reset rule",
                    kind.as_str()
                )));
            }
        }
        Ok(())
    }

    /// Decodes and validates a routing table from JSON.
    ///
    /// # Errors
    /// Returns [`KernelError::Configuration`] when decoding or validation fails.
    pub fn from_json(value: &Value) -> Result<Self, KernelError> {
        let table: Self = serde_json::from_value(value.clone()).map_err(|err| {
            KernelError::Configuration(format!("invalid routing table JSON payload: {err}"))
        })?;
        table.validate()?;
        Ok(table)
    }

    #[must_use]
    pub fn routes_for(&self, phase: Phase) -> Option<&PhaseRoutes> {
        self.phases.iter().find(|routes| routes.phase == phase)
    }

    #[must_use]
    pub fn pivot_rule(&self, kind: PivotKind) -> Option<&PivotRule> {
        self.pivots.iter().find(|rule| rule.kind == kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteOutcome {
    #[serde(flatten)]
    pub decision: Decision,
    /// Guard that produced the decision; `None` when the phase default applied.
    pub guard: Option<String>,
    /// Holds that also matched but lost to an earlier guard.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suppressed_holds: Vec<String>,
}

/// Evaluates the phase's guards in declaration order; the first match wins.
///
/// Reads nothing but its arguments.
///
/// # Errors
/// Returns [`KernelError::Routing`] when the table has no routes for `phase`.
pub fn route(
    phase: Phase,
    state: &EvidenceState,
    table: &RoutingTable,
) -> Result<RouteOutcome, KernelError> {
    let routes = table.routes_for(phase).ok_or_else(|| {
        KernelError::Routing(format!(
            "routing table v{} has no routes for phase {}",
            table.routing_version,
            phase.as_str()
        ))
    })?;

    let mut selected: Option<&Guard> = None;
    let mut suppressed_holds = Vec::new();
    for guard in &routes.guards {
        if !guard.when.matches(state) {
            continue;
        }
        if selected.is_none() {
            selected = Some(guard);
        } else if let Some(name) = guard.then.hold_checkpoint() {
            suppressed_holds.push(name.to_string());
        }
    }

    Ok(match selected {
        Some(guard) => RouteOutcome {
            decision: guard.then.clone(),
            guard: Some(guard.name.clone()),
            suppressed_holds,
        },
        None => RouteOutcome {
            decision: routes.default.clone(),
            guard: None,
            suppressed_holds,
        },
    })
}
