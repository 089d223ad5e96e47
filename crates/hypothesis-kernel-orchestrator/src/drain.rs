use anyhow::Result;
use hypothesis_kernel_core::{ItemId, RunId};
use hypothesis_kernel_store_sqlite::{FailOutcome, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{Orchestrator, TerminalEffect};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DrainOutcome {
    Idle,
    Completed,
    Retrying { attempts: u32, available_at: String },
    DeadLettered { attempts: u32 },
    /// The lease was reclaimed while the effect ran; another drainer owns the item now.
    LeaseLost,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DrainReport {
    pub owner: String,
    pub recovered: Vec<ItemId>,
    pub reclaimed: usize,
    pub reclaimed_dead_lettered: usize,
    pub item_id: Option<ItemId>,
    pub run_id: Option<RunId>,
    #[serde(flatten)]
    pub outcome: DrainOutcome,
}

impl Orchestrator<'_> {
    /// One pass of the completion queue: re-enqueue completed runs that lost their item,
    /// reclaim expired leases, then claim and fire at most one item.
    ///
    /// The effect runs outside any transaction. A crash between claim and completion
    /// leaves the item leased; once the lease runs out a later pass fires it again, so
    /// effects must tolerate redelivery of an item they never acknowledged.
    ///
    /// # Errors
    /// Returns an error when the queue cannot be read or updated.
    pub fn drain_once(&self, owner: &str, effect: &dyn TerminalEffect) -> Result<DrainReport> {
        let mut store = self.open_store()?;
        let recovered = store.recover_missing_completions(self.now())?;
        let reclaim = store.reclaim_expired(self.now())?;

        let mut report = DrainReport {
            owner: owner.to_string(),
            recovered,
            reclaimed: reclaim.reclaimed,
            reclaimed_dead_lettered: reclaim.dead_lettered,
            item_id: None,
            run_id: None,
            outcome: DrainOutcome::Idle,
        };

        let Some(item) = store.claim_next(owner, self.now())? else {
            return Ok(report);
        };
        report.item_id = Some(item.item_id);
        report.run_id = Some(item.run_id);

        let settled = match effect.fire(&item) {
            Ok(()) => store
                .complete_item(item.item_id, owner, self.now())
                .map(|()| DrainOutcome::Completed),
            Err(err) => {
                warn!(item_id = %item.item_id, run_id = %item.run_id, error = %err, "terminal effect failed");
                store
                    .fail_item(item.item_id, owner, &format!("{err:#}"), self.now())
                    .map(|outcome| match outcome {
                        FailOutcome::Retrying {
                            attempts,
                            available_at,
                        } => DrainOutcome::Retrying {
                            attempts,
                            available_at,
                        },
                        FailOutcome::DeadLettered { attempts } => {
                            DrainOutcome::DeadLettered { attempts }
                        }
                    })
            }
        };

        report.outcome = match settled {
            Ok(outcome) => outcome,
            Err(err) if matches!(err.downcast_ref::<StoreError>(), Some(StoreError::LeaseLost { .. })) => {
                warn!(item_id = %item.item_id, owner, "lease lost before the item settled");
                DrainOutcome::LeaseLost
            }
            Err(err) => return Err(err),
        };
        info!(
            item_id = %item.item_id,
            run_id = %item.run_id,
            outcome = ?report.outcome,
            "queue item drained"
        );
        Ok(report)
    }

    /// Drains until a pass finds nothing to claim or `max_items` items were handled.
    ///
    /// # Errors
    /// Stops at the first pass that errors.
    pub fn drain_all(
        &self,
        owner: &str,
        effect: &dyn TerminalEffect,
        max_items: usize,
    ) -> Result<Vec<DrainReport>> {
        let mut reports = Vec::new();
        while reports.len() < max_items {
            let report = self.drain_once(owner, effect)?;
            if report.outcome == DrainOutcome::Idle {
                break;
            }
            reports.push(report);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::{Clock, NoopChangeNotifier, NoopWorkerDispatcher};
    use anyhow::anyhow;
    use hypothesis_kernel_core::{KernelConfig, QueueStatus, RunStatus};
    use hypothesis_kernel_store_sqlite::{CommitRequest, CompletionItem, NewRun};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Drives a fresh run through every gate to completion.
    fn completed_run(orchestrator: &Orchestrator<'_>) -> RunId {
        let run = must(orchestrator.create_run(&NewRun::default()));
        let steps = [
            json!({"discovery": {"interviews_completed": 6, "problem_confirmed_ratio": 0.5}}),
            approve("discovery_review"),
            json!({"desirability": {
                "problem_resonance": 0.6,
                "value_resonance": 0.7,
                "commitment_depth": "waitlist"
            }}),
            approve("desirability_gate"),
            json!({"feasibility": {"status": "green"}}),
            json!({"viability": {"cac": 100.0, "ltv": 400.0}}),
            approve("final_decision"),
        ];
        for (index, patch) in steps.into_iter().enumerate() {
            let outcome = must(orchestrator.commit(&CommitRequest {
                run_id: run.run_id,
                change_id: format!("step-{index}"),
                patch: Some(patch),
                history_entries: Vec::new(),
                expected_version: None,
            }));
            assert_eq!(
                outcome.status,
                hypothesis_kernel_store_sqlite::CommitStatus::Committed,
                "step {index} should commit"
            );
        }
        let status = match must(orchestrator.get_status(run.run_id)) {
            Some(value) => value,
            None => panic!("run should exist"),
        };
        assert_eq!(status.status, RunStatus::Completed);
        run.run_id
    }

    fn approve(name: &str) -> serde_json::Value {
        json!({
            "approvals": {name: {
                "decision": "approve",
                "decided_by": "founder",
                "decided_at": "2026-02-07T12:00:00Z"
            }},
            "$control": {"kind": "resume", "checkpoint_name": name}
        })
    }

    struct FlakyEffect {
        failures_left: AtomicUsize,
    }

    impl TerminalEffect for FlakyEffect {
        fn fire(&self, _item: &CompletionItem) -> Result<()> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(anyhow!("webhook returned 503"));
            }
            Ok(())
        }
    }

    #[test]
    fn completion_fires_the_effect_once() {
        let db = TempDb::new("drain");
        let clock = fixture_clock();
        let orchestrator = Orchestrator::new(
            &db.0,
            KernelConfig::default(),
            &clock,
            &NoopChangeNotifier,
            &NoopWorkerDispatcher,
        );
        must(orchestrator.migrate());
        let run_id = completed_run(&orchestrator);
        let effect = CountingEffect::default();

        let first = must(orchestrator.drain_once("drainer-a", &effect));
        assert_eq!(first.outcome, DrainOutcome::Completed);
        assert_eq!(first.run_id, Some(run_id));

        let second = must(orchestrator.drain_once("drainer-a", &effect));
        assert_eq!(second.outcome, DrainOutcome::Idle);
        assert!(second.recovered.is_empty());
        assert_eq!(effect.count(), 1);
    }

    #[test]
    fn crash_after_claim_fires_exactly_once_after_lease_expiry() {
        let db = TempDb::new("drain-crash");
        let clock = fixture_clock();
        let orchestrator = Orchestrator::new(
            &db.0,
            KernelConfig::default(),
            &clock,
            &NoopChangeNotifier,
            &NoopWorkerDispatcher,
        );
        must(orchestrator.migrate());
        let run_id = completed_run(&orchestrator);

        // Claim and then "crash": the effect never runs and the item stays leased.
        let claimed = {
            let mut store = must(orchestrator.open_store());
            match must(store.claim_next("crashed-drainer", clock.now())) {
                Some(item) => item,
                None => panic!("completion item should be claimable"),
            }
        };
        assert_eq!(claimed.run_id, run_id);

        let effect = CountingEffect::default();
        let blocked = must(orchestrator.drain_once("drainer-b", &effect));
        assert_eq!(blocked.outcome, DrainOutcome::Idle);
        assert_eq!(effect.count(), 0);

        clock.advance(orchestrator.config().lease() + time::Duration::seconds(1));
        let resumed = must(orchestrator.drain_once("drainer-b", &effect));
        assert_eq!(resumed.reclaimed, 1);
        assert_eq!(resumed.outcome, DrainOutcome::Completed);
        assert_eq!(resumed.item_id, Some(claimed.item_id));

        clock.advance(orchestrator.config().lease() * 4);
        let quiet = must(orchestrator.drain_once("drainer-c", &effect));
        assert_eq!(quiet.outcome, DrainOutcome::Idle);
        assert_eq!(effect.count(), 1);

        let store = must(orchestrator.open_store());
        let item = match must(store.queue_item(claimed.item_id)) {
            Some(value) => value,
            None => panic!("item should exist"),
        };
        assert_eq!(item.status, QueueStatus::Completed);
        assert_eq!(item.lease_owner, None);
        let err = match store_complete(&orchestrator, claimed.item_id, "crashed-drainer") {
            Ok(()) => panic!("the crashed drainer must not settle the item"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::LeaseLost { .. })
        ));
    }

    fn store_complete(orchestrator: &Orchestrator<'_>, item_id: ItemId, owner: &str) -> Result<()> {
        let mut store = orchestrator.open_store()?;
        store.complete_item(item_id, owner, orchestrator.now())
    }

    #[test]
    fn failing_effect_backs_off_then_dead_letters() {
        let db = TempDb::new("drain-flaky");
        let clock = fixture_clock();
        let config = KernelConfig {
            max_attempts: 2,
            ..KernelConfig::default()
        };
        let orchestrator =
            Orchestrator::new(&db.0, config, &clock, &NoopChangeNotifier, &NoopWorkerDispatcher);
        must(orchestrator.migrate());
        completed_run(&orchestrator);
        let effect = FlakyEffect {
            failures_left: AtomicUsize::new(5),
        };

        let first = must(orchestrator.drain_once("drainer", &effect));
        let DrainOutcome::Retrying { attempts, .. } = first.outcome else {
            panic!("expected a retry, got {:?}", first.outcome);
        };
        assert_eq!(attempts, 1);

        let backing_off = must(orchestrator.drain_once("drainer", &effect));
        assert_eq!(backing_off.outcome, DrainOutcome::Idle);

        clock.advance(orchestrator.config().backoff_for(1) + time::Duration::seconds(1));
        let second = must(orchestrator.drain_once("drainer", &effect));
        assert_eq!(second.outcome, DrainOutcome::DeadLettered { attempts: 2 });

        let store = must(orchestrator.open_store());
        let dead = must(store.list_dead_letters());
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("webhook returned 503"));

        // Dead letters are parked, not recovered as missing completions.
        let idle = must(orchestrator.drain_once("drainer", &effect));
        assert!(idle.recovered.is_empty());
        assert_eq!(idle.outcome, DrainOutcome::Idle);
    }

    #[test]
    fn drain_all_stops_when_the_queue_is_empty() {
        let db = TempDb::new("drain-all");
        let clock = fixture_clock();
        let orchestrator = Orchestrator::new(
            &db.0,
            KernelConfig::default(),
            &clock,
            &NoopChangeNotifier,
            &NoopWorkerDispatcher,
        );
        must(orchestrator.migrate());
        completed_run(&orchestrator);
        completed_run(&orchestrator);
        let effect = CountingEffect::default();

        let reports = must(orchestrator.drain_all("drainer", &effect, 10));
        assert_eq!(reports.len(), 2);
        assert_eq!(effect.count(), 2);
    }
}
