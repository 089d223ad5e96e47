use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use hypothesis_kernel_core::{Phase, RunId, RunStatus};
use hypothesis_kernel_store_sqlite::{CommitRequest, CommitStatus, RunRecord, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{Orchestrator, PhaseStep, PhaseTask, PhaseWorker};

const CONFLICT_BACKOFF_BASE_MS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "stop", rename_all = "snake_case")]
pub enum WorkerStop {
    Suspended { checkpoint_name: String },
    Completed,
    Failed { reason: String },
    Idle,
    StepLimit,
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerReport {
    pub run_id: RunId,
    pub steps: u32,
    #[serde(flatten)]
    pub stop: WorkerStop,
    pub version: Option<u64>,
    pub current_phase: Option<Phase>,
    pub status: Option<RunStatus>,
}

impl Orchestrator<'_> {
    /// Drives one run forward until it suspends, ends, idles or hits the step limit.
    ///
    /// The worker never holds run state across steps: the run is re-read before each
    /// step and every delta is committed with the version it was computed from.
    ///
    /// # Errors
    /// Returns an error when the store fails or a delta keeps losing version races past
    /// the retry limit. A failing [`PhaseWorker`] does not error; it fails the run.
    pub fn run_worker(&self, run_id: RunId, worker: &dyn PhaseWorker) -> Result<WorkerReport> {
        let mut store = self.open_store()?;
        let mut steps = 0_u32;
        let mut conflicts = 0_u32;

        loop {
            let Some(run) = store.get_run(run_id)? else {
                return Ok(report(run_id, steps, WorkerStop::NotFound, None));
            };
            if let Some(stop) = stop_for(&run) {
                return Ok(report(run_id, steps, stop, Some(&run)));
            }
            if steps >= self.config().worker_max_steps {
                warn!(run_id = %run_id, steps, "worker step limit reached");
                return Ok(report(run_id, steps, WorkerStop::StepLimit, Some(&run)));
            }

            let task = PhaseTask::from(&run);
            let request = match worker.execute(&task) {
                Ok(PhaseStep::Evidence {
                    change_id,
                    patch,
                    history_entries,
                }) => CommitRequest {
                    run_id,
                    change_id,
                    patch: Some(patch),
                    history_entries,
                    expected_version: Some(run.version),
                },
                Ok(PhaseStep::Idle) => {
                    debug!(run_id = %run_id, phase = run.current_phase.as_str(), "worker idle");
                    return Ok(report(run_id, steps, WorkerStop::Idle, Some(&run)));
                }
                Err(err) => {
                    warn!(run_id = %run_id, phase = run.current_phase.as_str(), error = %err, "phase worker failed");
                    failure_request(&run, &format!("{err:#}"), "worker_error")
                }
            };

            let outcome = match self.commit_on(&mut store, &request) {
                Ok(outcome) => outcome,
                Err(err)
                    if matches!(
                        err.downcast_ref::<StoreError>(),
                        Some(StoreError::InvalidDelta(_))
                    ) =>
                {
                    warn!(
                        run_id = %run_id,
                        change_id = %request.change_id,
                        error = %err,
                        "phase worker produced a rejected delta"
                    );
                    let failure = failure_request(&run, &format!("{err:#}"), "worker_delta_rejected");
                    self.commit_on(&mut store, &failure)?
                }
                Err(err) => return Err(err),
            };
            match outcome.status {
                CommitStatus::Committed | CommitStatus::Duplicate => {
                    steps += 1;
                    conflicts = 0;
                    if let Some(decision) = &outcome.decision {
                        debug!(
                            run_id = %run_id,
                            change_id = %request.change_id,
                            decision = decision.decision.as_str(),
                            "step committed"
                        );
                    }
                }
                CommitStatus::VersionConflict => {
                    conflicts += 1;
                    if conflicts > self.config().commit_retry_limit {
                        return Err(anyhow!(
                            "run {run_id} kept changing under the worker; gave up after {} retries",
                            self.config().commit_retry_limit
                        ));
                    }
                    let wait = CONFLICT_BACKOFF_BASE_MS << conflicts.min(6);
                    debug!(run_id = %run_id, conflicts, wait_ms = wait, "version conflict; re-reading run");
                    thread::sleep(Duration::from_millis(wait));
                }
                CommitStatus::NotFound => {
                    return Ok(report(run_id, steps, WorkerStop::NotFound, None));
                }
            }
        }
    }
}

/// A `fail` control computed from `run`. Keyed by version so a retried failure is a duplicate.
fn failure_request(run: &RunRecord, reason: &str, event: &str) -> CommitRequest {
    CommitRequest {
        run_id: run.run_id,
        change_id: format!("worker-error:{}:{}", run.run_id, run.version),
        patch: Some(json!({"$control": {"kind": "fail", "reason": reason}})),
        history_entries: vec![json!({
            "event": event,
            "phase": run.current_phase.as_str(),
        })],
        expected_version: Some(run.version),
    }
}

fn stop_for(run: &RunRecord) -> Option<WorkerStop> {
    match run.status {
        RunStatus::Active => None,
        RunStatus::AwaitingHuman => Some(WorkerStop::Suspended {
            checkpoint_name: run.awaiting_checkpoint.clone().unwrap_or_default(),
        }),
        RunStatus::Completed => Some(WorkerStop::Completed),
        RunStatus::Failed => Some(WorkerStop::Failed {
            reason: run.failure_reason.clone().unwrap_or_default(),
        }),
    }
}

fn report(run_id: RunId, steps: u32, stop: WorkerStop, run: Option<&RunRecord>) -> WorkerReport {
    let report = WorkerReport {
        run_id,
        steps,
        stop,
        version: run.map(|run| run.version),
        current_phase: run.map(|run| run.current_phase),
        status: run.map(|run| run.status),
    };
    info!(run_id = %run_id, steps, stop = ?report.stop, "worker stopped");
    report
}
