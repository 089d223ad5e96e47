use anyhow::{anyhow, Result};
use hypothesis_kernel_core::{
    format_rfc3339, CheckpointId, CheckpointStatus, HumanDecision, Phase, RunId, RunStatus,
};
use hypothesis_kernel_store_sqlite::{
    CheckpointRecord, CommitRequest, CommitStatus, SqliteRunStore, StoreError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::Orchestrator;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecisionRequest {
    pub run_id: RunId,
    pub checkpoint_name: String,
    pub decision: HumanDecision,
    pub decided_by: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecideStatus {
    Resumed,
    /// The checkpoint was already decided; `decision` carries the recorded one.
    Duplicate,
    Expired,
    NotFound,
}

impl DecideStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resumed => "resumed",
            Self::Duplicate => "duplicate",
            Self::Expired => "expired",
            Self::NotFound => "not_found",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecideOutcome {
    pub status: DecideStatus,
    pub run_id: RunId,
    pub checkpoint_name: String,
    pub checkpoint_id: Option<CheckpointId>,
    pub decision: Option<HumanDecision>,
    pub version: Option<u64>,
    pub current_phase: Option<Phase>,
    pub run_status: Option<RunStatus>,
    pub dispatched: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExpiredCheckpoint {
    pub checkpoint_id: CheckpointId,
    pub run_id: RunId,
    pub checkpoint_name: String,
    pub run_status: Option<RunStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: Vec<ExpiredCheckpoint>,
    pub skipped: usize,
}

impl Orchestrator<'_> {
    /// Records a human decision and resumes the run.
    ///
    /// An overdue checkpoint is expired first and the late decision is refused. Deciding
    /// twice returns the first decision as `duplicate`.
    ///
    /// # Errors
    /// Returns an error when the store fails or the run keeps moving under concurrent
    /// commits past the configured retry limit.
    pub fn decide_checkpoint(&self, request: &DecisionRequest) -> Result<DecideOutcome> {
        if request.decided_by.trim().is_empty() {
            return Err(StoreError::InvalidDelta("decided_by must not be blank".to_string()).into());
        }
        let mut store = self.open_store()?;
        let Some(checkpoint) =
            store.latest_checkpoint(request.run_id, &request.checkpoint_name)?
        else {
            return self.outcome(&store, request, None, DecideStatus::NotFound);
        };

        match checkpoint.status {
            CheckpointStatus::Decided => {
                let mut outcome =
                    self.outcome(&store, request, Some(&checkpoint), DecideStatus::Duplicate)?;
                outcome.decision = checkpoint.decision;
                return Ok(outcome);
            }
            CheckpointStatus::Expired => {
                return self.outcome(&store, request, Some(&checkpoint), DecideStatus::Expired);
            }
            CheckpointStatus::Pending => {}
        }

        if checkpoint.is_overdue(self.now()) {
            self.expire_on(&mut store, &checkpoint)?;
            info!(
                run_id = %request.run_id,
                checkpoint = %request.checkpoint_name,
                "late decision refused; checkpoint expired"
            );
            return self.outcome(&store, request, Some(&checkpoint), DecideStatus::Expired);
        }

        let decided_at = format_rfc3339(self.now()).map_err(|err| anyhow!(err.to_string()))?;
        let patch = decision_patch(request, &decided_at);
        let change_id = format!("decide:{}", checkpoint.checkpoint_id);
        let retry_limit = self.config().commit_retry_limit;
        let mut attempt = 0_u32;
        let committed = loop {
            let Some(run) = store.get_run(request.run_id)? else {
                return self.outcome(&store, request, Some(&checkpoint), DecideStatus::NotFound);
            };
            let commit = CommitRequest {
                run_id: request.run_id,
                change_id: change_id.clone(),
                patch: Some(patch.clone()),
                history_entries: vec![json!({
                    "event": "checkpoint_decided",
                    "checkpoint": request.checkpoint_name,
                    "decision": request.decision.as_str(),
                    "decided_by": request.decided_by,
                })],
                expected_version: Some(run.version),
            };
            let outcome = match self.commit_on(&mut store, &commit) {
                Ok(outcome) => outcome,
                Err(err) if closed_underneath(&err) => {
                    let recorded = store.latest_checkpoint(request.run_id, &request.checkpoint_name)?;
                    match recorded.as_ref() {
                        Some(record) if record.status == CheckpointStatus::Expired => {
                            return self.outcome(&store, request, Some(record), DecideStatus::Expired);
                        }
                        // The deadline passed between the check above and the commit.
                        Some(record)
                            if record.status == CheckpointStatus::Pending
                                && record.is_overdue(self.now()) =>
                        {
                            self.expire_on(&mut store, record)?;
                            return self.outcome(&store, request, Some(record), DecideStatus::Expired);
                        }
                        _ => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            };
            match outcome.status {
                CommitStatus::Committed => break outcome,
                CommitStatus::Duplicate => {
                    let recorded = store.latest_checkpoint(request.run_id, &request.checkpoint_name)?;
                    let mut outcome = self.outcome(
                        &store,
                        request,
                        recorded.as_ref().or(Some(&checkpoint)),
                        DecideStatus::Duplicate,
                    )?;
                    outcome.decision = recorded.and_then(|record| record.decision);
                    return Ok(outcome);
                }
                CommitStatus::NotFound => {
                    return self.outcome(&store, request, Some(&checkpoint), DecideStatus::NotFound);
                }
                CommitStatus::VersionConflict => {
                    attempt += 1;
                    if attempt > retry_limit {
                        return Err(anyhow!(
                            "run {} kept changing while deciding {}; gave up after {retry_limit} retries",
                            request.run_id,
                            request.checkpoint_name
                        ));
                    }
                    debug!(run_id = %request.run_id, attempt, "decision raced another commit; retrying");
                }
            }
        };

        let dispatched = committed.run_status == Some(RunStatus::Active)
            && committed.current_phase.is_some_and(|phase| {
                match self.dispatcher().dispatch(request.run_id, phase) {
                    Ok(started) => started,
                    Err(err) => {
                        warn!(run_id = %request.run_id, error = %err, "worker dispatch failed");
                        false
                    }
                }
            });

        info!(
            run_id = %request.run_id,
            checkpoint = %request.checkpoint_name,
            decision = request.decision.as_str(),
            version = ?committed.version,
            "checkpoint decided"
        );
        Ok(DecideOutcome {
            status: DecideStatus::Resumed,
            run_id: request.run_id,
            checkpoint_name: request.checkpoint_name.clone(),
            checkpoint_id: Some(checkpoint.checkpoint_id),
            decision: Some(request.decision),
            version: committed.version,
            current_phase: committed.current_phase,
            run_status: committed.run_status,
            dispatched,
        })
    }

    /// Expires every pending checkpoint whose deadline has passed.
    ///
    /// Safe to run from several places at once; each expiry commits under a stable
    /// change id so a second sweeper sees `duplicate`.
    ///
    /// # Errors
    /// Returns an error when the store fails for a reason other than the run having moved on.
    pub fn sweep_expired_checkpoints(&self, limit: Option<usize>) -> Result<SweepReport> {
        let mut store = self.open_store()?;
        let overdue = store.list_overdue_checkpoints(self.now(), limit)?;
        let mut report = SweepReport {
            scanned: overdue.len(),
            ..SweepReport::default()
        };

        for checkpoint in &overdue {
            match self.expire_on(&mut store, checkpoint) {
                Ok(Some(run_status)) => report.expired.push(ExpiredCheckpoint {
                    checkpoint_id: checkpoint.checkpoint_id,
                    run_id: checkpoint.run_id,
                    checkpoint_name: checkpoint.checkpoint_name.clone(),
                    run_status: Some(run_status),
                }),
                Ok(None) => report.skipped += 1,
                Err(err) => match err.downcast_ref::<StoreError>() {
                    Some(
                        StoreError::InvalidDelta(_)
                        | StoreError::CheckpointState { .. }
                        | StoreError::RunClosed { .. },
                    ) => {
                        debug!(
                            checkpoint_id = %checkpoint.checkpoint_id,
                            error = %err,
                            "checkpoint no longer expirable"
                        );
                        report.skipped += 1;
                    }
                    _ => return Err(err),
                },
            }
        }

        if !report.expired.is_empty() {
            info!(
                expired = report.expired.len(),
                skipped = report.skipped,
                "checkpoint sweep finished"
            );
        }
        Ok(report)
    }

    /// Commits the expiry of one checkpoint. `None` when someone else already did.
    fn expire_on(
        &self,
        store: &mut SqliteRunStore,
        checkpoint: &CheckpointRecord,
    ) -> Result<Option<RunStatus>> {
        let request = CommitRequest {
            run_id: checkpoint.run_id,
            change_id: format!("expire:{}", checkpoint.checkpoint_id),
            patch: Some(json!({
                "$control": {"kind": "expire", "checkpoint_name": checkpoint.checkpoint_name}
            })),
            history_entries: vec![json!({
                "event": "checkpoint_expired",
                "checkpoint": checkpoint.checkpoint_name,
                "expires_at": checkpoint.expires_at,
            })],
            expected_version: None,
        };
        let outcome = self.commit_on(store, &request)?;
        match outcome.status {
            CommitStatus::Committed => {
                warn!(
                    run_id = %checkpoint.run_id,
                    checkpoint = %checkpoint.checkpoint_name,
                    run_status = ?outcome.run_status,
                    "checkpoint expired"
                );
                Ok(outcome.run_status)
            }
            _ => Ok(None),
        }
    }

    fn outcome(
        &self,
        store: &SqliteRunStore,
        request: &DecisionRequest,
        checkpoint: Option<&CheckpointRecord>,
        status: DecideStatus,
    ) -> Result<DecideOutcome> {
        let run = store.get_run(request.run_id)?;
        Ok(DecideOutcome {
            status,
            run_id: request.run_id,
            checkpoint_name: request.checkpoint_name.clone(),
            checkpoint_id: checkpoint.map(|record| record.checkpoint_id),
            decision: None,
            version: run.as_ref().map(|run| run.version),
            current_phase: run.as_ref().map(|run| run.current_phase),
            run_status: run.as_ref().map(|run| run.status),
            dispatched: false,
        })
    }
}

/// The run failed or the checkpoint expired between our read and our commit.
fn closed_underneath(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<StoreError>(),
        Some(
            StoreError::RunClosed { .. }
                | StoreError::InvalidDelta(_)
                | StoreError::CheckpointState { .. }
        )
    )
}

fn decision_patch(request: &DecisionRequest, decided_at: &str) -> Value {
    let mut approval = Map::new();
    approval.insert("decision".to_string(), json!(request.decision.as_str()));
    approval.insert("decided_by".to_string(), json!(request.decided_by));
    approval.insert("decided_at".to_string(), json!(decided_at));
    if let Some(note) = &request.note {
        approval.insert("note".to_string(), json!(note));
    }
    let mut approvals = Map::new();
    approvals.insert(request.checkpoint_name.clone(), Value::Object(approval));
    json!({
        "approvals": approvals,
        "$control": {"kind": "resume", "checkpoint_name": request.checkpoint_name}
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::{NoopChangeNotifier, NoopWorkerDispatcher};
    use hypothesis_kernel_core::KernelConfig;
    use hypothesis_kernel_store_sqlite::NewRun;

    fn request(run_id: RunId, name: &str, decision: HumanDecision) -> DecisionRequest {
        DecisionRequest {
            run_id,
            checkpoint_name: name.to_string(),
            decision,
            decided_by: "founder".to_string(),
            note: Some("looks real".to_string()),
        }
    }

    #[test]
    fn approve_resumes_and_dispatches_next_phase() {
        let db = TempDb::new("decide");
        let clock = fixture_clock();
        let dispatcher = RecordingDispatcher::default();
        let orchestrator = Orchestrator::new(
            &db.0,
            KernelConfig::default(),
            &clock,
            &NoopChangeNotifier,
            &dispatcher,
        );
        must(orchestrator.migrate());
        let run = must(orchestrator.create_run(&NewRun::default()));
        hold_discovery(&orchestrator, run.run_id);

        let outcome = must(orchestrator.decide_checkpoint(&request(
            run.run_id,
            "discovery_review",
            HumanDecision::Approve,
        )));
        assert_eq!(outcome.status, DecideStatus::Resumed);
        assert_eq!(outcome.current_phase, Some(Phase::Desirability));
        assert_eq!(outcome.run_status, Some(RunStatus::Active));
        assert!(outcome.dispatched);
        assert_eq!(dispatcher.phases(), vec![Phase::Desirability]);

        let store = must(orchestrator.open_store());
        let recorded = match must(store.latest_checkpoint(run.run_id, "discovery_review")) {
            Some(value) => value,
            None => panic!("checkpoint should exist"),
        };
        assert_eq!(recorded.status, CheckpointStatus::Decided);
        assert_eq!(recorded.note.as_deref(), Some("looks real"));
    }

    #[test]
    fn second_decision_returns_the_first_as_duplicate() {
        let db = TempDb::new("decide-dup");
        let clock = fixture_clock();
        let orchestrator = Orchestrator::new(
            &db.0,
            KernelConfig::default(),
            &clock,
            &NoopChangeNotifier,
            &NoopWorkerDispatcher,
        );
        must(orchestrator.migrate());
        let run = must(orchestrator.create_run(&NewRun::default()));
        hold_discovery(&orchestrator, run.run_id);

        let first = must(orchestrator.decide_checkpoint(&request(
            run.run_id,
            "discovery_review",
            HumanDecision::Approve,
        )));
        let second = must(orchestrator.decide_checkpoint(&request(
            run.run_id,
            "discovery_review",
            HumanDecision::Reject,
        )));
        assert_eq!(first.status, DecideStatus::Resumed);
        assert_eq!(second.status, DecideStatus::Duplicate);
        assert_eq!(second.decision, Some(HumanDecision::Approve));
        assert_eq!(second.version, first.version);
    }

    #[test]
    fn resume_without_a_dispatcher_reports_nothing_started() {
        let db = TempDb::new("decide-noop");
        let clock = fixture_clock();
        let orchestrator = Orchestrator::new(
            &db.0,
            KernelConfig::default(),
            &clock,
            &NoopChangeNotifier,
            &NoopWorkerDispatcher,
        );
        must(orchestrator.migrate());
        let run = must(orchestrator.create_run(&NewRun::default()));
        hold_discovery(&orchestrator, run.run_id);

        let outcome = must(orchestrator.decide_checkpoint(&request(
            run.run_id,
            "discovery_review",
            HumanDecision::Approve,
        )));
        assert_eq!(outcome.status, DecideStatus::Resumed);
        assert_eq!(outcome.run_status, Some(RunStatus::Active));
        assert!(!outcome.dispatched);
    }

    #[test]
    fn late_decision_after_deadline_is_expired() {
        let db = TempDb::new("decide-late");
        let clock = fixture_clock();
        let orchestrator = Orchestrator::new(
            &db.0,
            KernelConfig::default(),
            &clock,
            &NoopChangeNotifier,
            &NoopWorkerDispatcher,
        );
        must(orchestrator.migrate());
        let run = must(orchestrator.create_run(&NewRun::default()));
        hold_discovery(&orchestrator, run.run_id);

        clock.advance(orchestrator.config().checkpoint_ttl() + time::Duration::seconds(1));
        let outcome = must(orchestrator.decide_checkpoint(&request(
            run.run_id,
            "discovery_review",
            HumanDecision::Approve,
        )));
        assert_eq!(outcome.status, DecideStatus::Expired);
        assert_eq!(outcome.run_status, Some(RunStatus::Failed));

        let again = must(orchestrator.decide_checkpoint(&request(
            run.run_id,
            "discovery_review",
            HumanDecision::Approve,
        )));
        assert_eq!(again.status, DecideStatus::Expired);
        assert_eq!(again.version, outcome.version);
    }

    #[test]
    fn sweep_expires_overdue_checkpoints_once() {
        let db = TempDb::new("sweep");
        let clock = fixture_clock();
        let orchestrator = Orchestrator::new(
            &db.0,
            KernelConfig::default(),
            &clock,
            &NoopChangeNotifier,
            &NoopWorkerDispatcher,
        );
        must(orchestrator.migrate());
        let waiting = must(orchestrator.create_run(&NewRun::default()));
        hold_discovery(&orchestrator, waiting.run_id);

        let early = must(orchestrator.sweep_expired_checkpoints(None));
        assert_eq!(early.scanned, 0);

        clock.advance(orchestrator.config().checkpoint_ttl());
        let swept = must(orchestrator.sweep_expired_checkpoints(None));
        assert_eq!(swept.expired.len(), 1);
        assert_eq!(swept.expired[0].run_id, waiting.run_id);
        assert_eq!(swept.expired[0].run_status, Some(RunStatus::Failed));

        let again = must(orchestrator.sweep_expired_checkpoints(None));
        assert_eq!(again.scanned, 0);

        let late = must(orchestrator.decide_checkpoint(&request(
            waiting.run_id,
            "discovery_review",
            HumanDecision::Approve,
        )));
        assert_eq!(late.status, DecideStatus::Expired);
    }

    #[test]
    fn abandoned_run_refuses_decisions() {
        let db = TempDb::new("decide-abandon");
        let clock = fixture_clock();
        let orchestrator = Orchestrator::new(
            &db.0,
            KernelConfig::default(),
            &clock,
            &NoopChangeNotifier,
            &NoopWorkerDispatcher,
        );
        must(orchestrator.migrate());
        let run = must(orchestrator.create_run(&NewRun::default()));
        hold_discovery(&orchestrator, run.run_id);
        must(orchestrator.abandon(run.run_id, "no budget"));

        let outcome = must(orchestrator.decide_checkpoint(&request(
            run.run_id,
            "discovery_review",
            HumanDecision::Approve,
        )));
        assert_eq!(outcome.status, DecideStatus::Expired);
        assert_eq!(outcome.run_status, Some(RunStatus::Failed));
    }

    #[test]
    fn unknown_checkpoint_is_not_found() {
        let db = TempDb::new("decide-missing");
        let clock = fixture_clock();
        let orchestrator = Orchestrator::new(
            &db.0,
            KernelConfig::default(),
            &clock,
            &NoopChangeNotifier,
            &NoopWorkerDispatcher,
        );
        must(orchestrator.migrate());
        let run = must(orchestrator.create_run(&NewRun::default()));

        let outcome = must(orchestrator.decide_checkpoint(&request(
            run.run_id,
            "desirability_gate",
            HumanDecision::Approve,
        )));
        assert_eq!(outcome.status, DecideStatus::NotFound);
        assert!(outcome.checkpoint_id.is_none());
        assert_eq!(outcome.version, Some(0));
    }
}
