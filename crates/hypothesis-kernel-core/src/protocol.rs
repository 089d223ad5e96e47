use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::evidence::{Approval, EvidenceState, PivotRecord};
use crate::merge::{deep_merge, ControlSignal, ParsedPatch};
use crate::routing::{
    extract_signal, route, Decision, RouteOutcome, RoutingTable, Signal, TimeoutPolicy,
};
use crate::{KernelError, Phase, RunStatus};

/// The part of a run that the fold of its history determines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub current_phase: Phase,
    pub status: RunStatus,
    pub awaiting_checkpoint: Option<String>,
    pub failure_reason: Option<String>,
    pub state: EvidenceState,
}

impl RunSnapshot {
    #[must_use]
    pub fn initial() -> Self {
        Self {
            current_phase: Phase::Discovery,
            status: RunStatus::Active,
            awaiting_checkpoint: None,
            failure_reason: None,
            state: EvidenceState::default(),
        }
    }
}

impl Default for RunSnapshot {
    fn default() -> Self {
        Self::initial()
    }
}

/// Side rows the store writes in the same transaction as the run update.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum Effect {
    OpenCheckpoint {
        checkpoint_name: String,
        phase: Phase,
        context: Value,
    },
    ResolveCheckpoint {
        checkpoint_name: String,
        approval: Approval,
    },
    ExpireCheckpoint {
        checkpoint_name: String,
    },
    EnqueueCompletion {
        payload: Value,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub snapshot: RunSnapshot,
    /// `None` while the run waits on a human; routing is not consulted then.
    pub routing: Option<RouteOutcome>,
    pub effects: Vec<Effect>,
}

impl Transition {
    #[must_use]
    pub fn decision(&self) -> Option<&Decision> {
        self.routing.as_ref().map(|outcome| &outcome.decision)
    }
}

/// Applies one delta to a run snapshot: merge, control handling, routing and the
/// resulting transition. `version` is the version this delta will produce.
///
/// # Errors
/// Returns [`KernelError::Validation`] when the run is closed, the merged state is invalid
/// or a control signal does not fit the run, and [`KernelError::Routing`] when the table
/// cannot route the current phase.
pub fn apply_delta(
    current: &RunSnapshot,
    patch: &ParsedPatch,
    table: &RoutingTable,
    version: u64,
) -> Result<Transition, KernelError> {
    if current.status.is_terminal() {
        return Err(KernelError::Validation(format!(
            "run is {} and accepts no further changes",
            current.status.as_str()
        )));
    }

    let mut next = current.clone();
    if !patch.document.is_empty() {
        let mut document = next.state.to_document()?;
        deep_merge(&mut document, &Value::Object(patch.document.clone()))?;
        next.state = EvidenceState::from_document(&document)?;
    }

    let mut effects = Vec::new();
    match &patch.control {
        Some(ControlSignal::Abandon { reason } | ControlSignal::Fail { reason }) => {
            if let Some(checkpoint_name) = next.awaiting_checkpoint.take() {
                effects.push(Effect::ExpireCheckpoint { checkpoint_name });
            }
            let outcome = RouteOutcome {
                decision: Decision::Fail {
                    reason: reason.clone(),
                },
                guard: patch.control.as_ref().map(|signal| signal.as_str().to_string()),
                suppressed_holds: Vec::new(),
            };
            return apply_decision(next, outcome, effects, table, version);
        }
        Some(ControlSignal::Expire { checkpoint_name }) => {
            require_awaiting(&next, checkpoint_name)?;
            next.awaiting_checkpoint = None;
            next.status = RunStatus::Active;
            effects.push(Effect::ExpireCheckpoint {
                checkpoint_name: checkpoint_name.clone(),
            });
            let decision = match &table.checkpoint_timeout {
                TimeoutPolicy::Escalate {
                    checkpoint_name: escalation,
                } if escalation != checkpoint_name => Decision::Hold {
                    checkpoint_name: escalation.clone(),
                },
                _ => Decision::Fail {
                    reason: format!("checkpoint {checkpoint_name} expired without a decision"),
                },
            };
            let outcome = RouteOutcome {
                decision,
                guard: Some("checkpoint_timeout".to_string()),
                suppressed_holds: Vec::new(),
            };
            return apply_decision(next, outcome, effects, table, version);
        }
        Some(ControlSignal::Resume { checkpoint_name }) => {
            require_awaiting(&next, checkpoint_name)?;
            let approval = next.state.approval(checkpoint_name).cloned().ok_or_else(|| {
                KernelError::Validation(format!(
                    "resuming {checkpoint_name} requires approvals.{checkpoint_name}"
                ))
            })?;
            next.awaiting_checkpoint = None;
            next.status = RunStatus::Active;
            effects.push(Effect::ResolveCheckpoint {
                checkpoint_name: checkpoint_name.clone(),
                approval,
            });
        }
        None => {}
    }

    if next.status == RunStatus::AwaitingHuman {
        return Ok(Transition {
            snapshot: next,
            routing: None,
            effects,
        });
    }

    let outcome = route(next.current_phase, &next.state, table)?;
    apply_decision(next, outcome, effects, table, version)
}

fn require_awaiting(snapshot: &RunSnapshot, checkpoint_name: &str) -> Result<(), KernelError> {
    match snapshot.awaiting_checkpoint.as_deref() {
        Some(open) if open == checkpoint_name => Ok(()),
        Some(open) => Err(KernelError::Validation(format!(
            "run is waiting on {open}, not {checkpoint_name}"
        ))),
        None => Err(KernelError::Validation(format!(
            "run has no open checkpoint named {checkpoint_name}"
        ))),
    }
}

fn apply_decision(
    mut next: RunSnapshot,
    mut outcome: RouteOutcome,
    mut effects: Vec<Effect>,
    table: &RoutingTable,
    version: u64,
) -> Result<Transition, KernelError> {
    match outcome.decision.clone() {
        Decision::Advance { next_phase } => {
            next.current_phase = next_phase;
            // A phase that holds on entry opens its checkpoint in the same commit.
            if let Decision::Hold { checkpoint_name } =
                route(next_phase, &next.state, table)?.decision
            {
                open_checkpoint(&mut next, &mut effects, checkpoint_name);
            }
        }
        Decision::Pivot { kind, reason } => {
            let taken = next.state.pivots().len();
            if taken >= usize::try_from(table.max_pivots).unwrap_or(usize::MAX) {
                let reason = format!(
                    "pivot budget exhausted after {taken} pivots; {} falsified again: {reason}",
                    kind.as_str()
                );
                outcome.decision = Decision::Fail {
                    reason: reason.clone(),
                };
                next.status = RunStatus::Failed;
                next.failure_reason = Some(reason);
            } else {
                let rule = table.pivot_rule(kind).ok_or_else(|| {
                    KernelError::Routing(format!("pivot {} has no reset rule", kind.as_str()))
                })?;
                rule.apply(&mut next.state)?;
                next.state.push_pivot(PivotRecord {
                    kind,
                    from_phase: next.current_phase,
                    to_phase: rule.return_phase,
                    reason,
                    at_version: version,
                });
                next.current_phase = rule.return_phase;
            }
        }
        Decision::Hold { checkpoint_name } => {
            open_checkpoint(&mut next, &mut effects, checkpoint_name);
        }
        Decision::Fail { reason } => {
            next.status = RunStatus::Failed;
            next.failure_reason = Some(reason);
        }
        Decision::Complete => {
            next.status = RunStatus::Completed;
            effects.push(Effect::EnqueueCompletion {
                payload: completion_payload(&next)?,
            });
        }
        Decision::Collect { .. } => {}
    }

    Ok(Transition {
        snapshot: next,
        routing: Some(outcome),
        effects,
    })
}

fn open_checkpoint(next: &mut RunSnapshot, effects: &mut Vec<Effect>, checkpoint_name: String) {
    next.status = RunStatus::AwaitingHuman;
    next.awaiting_checkpoint = Some(checkpoint_name.clone());
    effects.push(Effect::OpenCheckpoint {
        checkpoint_name,
        phase: next.current_phase,
        context: checkpoint_context(&next.state, next.current_phase),
    });
}

fn checkpoint_context(state: &EvidenceState, phase: Phase) -> Value {
    let signals: Map<String, Value> = Signal::ALL
        .iter()
        .filter_map(|signal| {
            extract_signal(state, *signal).map(|value| (signal.as_str().to_string(), value.to_json()))
        })
        .collect();
    json!({
        "phase": phase.as_str(),
        "evidence": state.partition_document(phase),
        "signals": signals,
        "pivot_count": state.pivots().len(),
    })
}

/// Payload handed to the terminal effect. Rebuildable from the run alone.
///
/// # Errors
/// Returns [`KernelError::Validation`] if the state cannot be encoded.
pub fn completion_payload(snapshot: &RunSnapshot) -> Result<Value, KernelError> {
    Ok(json!({
        "final_phase": snapshot.current_phase.as_str(),
        "pivot_count": snapshot.state.pivots().len(),
        "state": snapshot.state.to_document()?,
    }))
}
