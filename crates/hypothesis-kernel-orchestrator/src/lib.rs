#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use hypothesis_kernel_core::{now_utc, EvidenceState, KernelConfig, Phase, RunId, RunStatus};
use hypothesis_kernel_store_sqlite::{
    CommitOutcome, CommitRequest, CommitStatus, CompletionItem, FoldCheck, NewRun, RunRecord,
    RunStatusView, SqliteRunStore,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::{debug, info};
use ulid::Ulid;

mod drain;
mod gates;
mod worker;

pub use drain::{DrainOutcome, DrainReport};
pub use gates::{DecideOutcome, DecideStatus, DecisionRequest, ExpiredCheckpoint, SweepReport};
pub use worker::{WorkerReport, WorkerStop};

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        now_utc()
    }
}

/// Clock that only moves when told to. Used by sweeps and drains under test.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: time::Duration) {
        let mut guard = match self.now.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// What a phase worker sees: the run as last committed, re-read before every step.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseTask {
    pub run_id: RunId,
    pub version: u64,
    pub current_phase: Phase,
    pub state: EvidenceState,
}

impl From<&RunRecord> for PhaseTask {
    fn from(run: &RunRecord) -> Self {
        Self {
            run_id: run.run_id,
            version: run.version,
            current_phase: run.current_phase,
            state: run.structured_state.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhaseStep {
    Evidence {
        change_id: String,
        patch: Value,
        history_entries: Vec<Value>,
    },
    /// Nothing new to report; the worker exits and a later dispatch picks the run up again.
    Idle,
}

/// Produces evidence for the run's current phase. Implementations hold no run state.
pub trait PhaseWorker: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn execute(&self, task: &PhaseTask) -> Result<PhaseStep>;
}

/// Starts a worker for a run somewhere else (a job queue, a task runner, a thread).
///
/// Returns `false` when nothing was started, so callers can report the resume honestly.
pub trait WorkerDispatcher: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn dispatch(&self, run_id: RunId, phase: Phase) -> Result<bool>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunChange {
    pub run_id: RunId,
    pub version: u64,
    pub current_phase: Phase,
    pub status: RunStatus,
}

/// Best-effort fan-out of committed changes. Publishing never fails a commit.
pub trait ChangeNotifier: Send + Sync {
    fn publish(&self, change: &RunChange);
}

/// The side effect a completed run triggers, fired once per claimed queue item.
pub trait TerminalEffect: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn fire(&self, item: &CompletionItem) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWorkerDispatcher;

impl WorkerDispatcher for NoopWorkerDispatcher {
    fn dispatch(&self, run_id: RunId, phase: Phase) -> Result<bool> {
        debug!(run_id = %run_id, phase = phase.as_str(), "no dispatcher configured");
        Ok(false)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopChangeNotifier;

impl ChangeNotifier for NoopChangeNotifier {
    fn publish(&self, _change: &RunChange) {}
}

/// Writes the completion payload to the log. Stand-in until a real hand-off is wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTerminalEffect;

impl TerminalEffect for LogTerminalEffect {
    fn fire(&self, item: &CompletionItem) -> Result<()> {
        info!(
            item_id = %item.item_id,
            run_id = %item.run_id,
            payload = %item.payload,
            "run completed"
        );
        Ok(())
    }
}

/// Reads a [`KernelConfig`] JSON file, or the defaults when no path is given.
///
/// # Errors
/// Returns an error when the file cannot be read or the config does not validate.
pub fn load_config(path: Option<&Path>) -> Result<KernelConfig> {
    let Some(path) = path else {
        return Ok(KernelConfig::default());
    };
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let value: Value = serde_json::from_str(&body)
        .with_context(|| format!("config {} must be valid JSON", path.display()))?;
    KernelConfig::from_json(&value).map_err(|err| anyhow::anyhow!("{}: {err}", path.display()))
}

/// Lease owner label unique to this process and call.
#[must_use]
pub fn default_owner(prefix: &str) -> String {
    format!("{prefix}-{}", Ulid::new())
}

pub struct Orchestrator<'a> {
    db_path: PathBuf,
    config: KernelConfig,
    clock: &'a dyn Clock,
    notifier: &'a dyn ChangeNotifier,
    dispatcher: &'a dyn WorkerDispatcher,
}

impl<'a> Orchestrator<'a> {
    #[must_use]
    pub fn new(
        db_path: &Path,
        config: KernelConfig,
        clock: &'a dyn Clock,
        notifier: &'a dyn ChangeNotifier,
        dispatcher: &'a dyn WorkerDispatcher,
    ) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
            config,
            clock,
            notifier,
            dispatcher,
        }
    }

    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Opens a fresh connection. Nothing about a run is cached between calls.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened.
    pub fn open_store(&self) -> Result<SqliteRunStore> {
        Ok(SqliteRunStore::open(&self.db_path)?.with_config(self.config.clone()))
    }

    /// # Errors
    /// Returns an error when the schema cannot be applied.
    pub fn migrate(&self) -> Result<()> {
        self.open_store()?.migrate()
    }

    /// # Errors
    /// Returns an error when the routing version is not installed or the insert fails.
    pub fn create_run(&self, request: &NewRun) -> Result<RunRecord> {
        let mut store = self.open_store()?;
        let run = store.create_run(request, self.clock.now())?;
        self.notifier.publish(&RunChange {
            run_id: run.run_id,
            version: run.version,
            current_phase: run.current_phase,
            status: run.status,
        });
        Ok(run)
    }

    /// Commits one delta and publishes the change when it was applied.
    ///
    /// # Errors
    /// Propagates store errors; protocol outcomes (`duplicate`, `version_conflict`,
    /// `not_found`) come back as [`CommitOutcome`] values.
    pub fn commit(&self, request: &CommitRequest) -> Result<CommitOutcome> {
        let mut store = self.open_store()?;
        self.commit_on(&mut store, request)
    }

    pub(crate) fn commit_on(
        &self,
        store: &mut SqliteRunStore,
        request: &CommitRequest,
    ) -> Result<CommitOutcome> {
        let outcome = store.commit(request, self.clock.now())?;
        if outcome.status == CommitStatus::Committed {
            if let (Some(version), Some(current_phase), Some(status)) =
                (outcome.version, outcome.current_phase, outcome.run_status)
            {
                self.notifier.publish(&RunChange {
                    run_id: outcome.run_id,
                    version,
                    current_phase,
                    status,
                });
            }
        }
        Ok(outcome)
    }

    /// # Errors
    /// Returns an error when the run row cannot be read.
    pub fn get_status(&self, run_id: RunId) -> Result<Option<RunStatusView>> {
        self.open_store()?.get_status(run_id)
    }

    /// Fails the run through the ordinary commit path. A pending checkpoint expires with it.
    ///
    /// Retrying an abandon is a `duplicate`.
    ///
    /// # Errors
    /// Returns `RunClosed` when the run already ended, or a store error.
    pub fn abandon(&self, run_id: RunId, reason: &str) -> Result<CommitOutcome> {
        let request = CommitRequest {
            run_id,
            change_id: format!("abandon:{run_id}"),
            patch: Some(json!({"$control": {"kind": "abandon", "reason": reason}})),
            history_entries: Vec::new(),
            expected_version: None,
        };
        let outcome = self.commit(&request)?;
        if outcome.status == CommitStatus::Committed {
            info!(run_id = %run_id, reason, "run abandoned");
        }
        Ok(outcome)
    }

    /// # Errors
    /// Returns an error when history or the routing table cannot be read.
    pub fn verify_run(&self, run_id: RunId) -> Result<Option<FoldCheck>> {
        self.open_store()?
            .verify_run(run_id)
            .with_context(|| format!("failed to verify run {run_id}"))
    }

    pub(crate) fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    pub(crate) fn dispatcher(&self) -> &dyn WorkerDispatcher {
        self.dispatcher
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use hypothesis_kernel_core::parse_rfc3339_utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    pub(crate) fn fixture_clock() -> ManualClock {
        match parse_rfc3339_utc("2026-02-07T12:00:00Z") {
            Ok(value) => ManualClock::new(value),
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        }
    }

    /// Temp database that is removed on drop.
    pub(crate) struct TempDb(pub PathBuf);

    impl TempDb {
        pub(crate) fn new(label: &str) -> Self {
            Self(std::env::temp_dir().join(format!("hypothesis-{label}-{}.sqlite3", Ulid::new())))
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm"] {
                let mut path = self.0.clone().into_os_string();
                path.push(suffix);
                let _ = std::fs::remove_file(PathBuf::from(path));
            }
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub(crate) changes: Mutex<Vec<RunChange>>,
    }

    impl ChangeNotifier for RecordingNotifier {
        fn publish(&self, change: &RunChange) {
            if let Ok(mut changes) = self.changes.lock() {
                changes.push(change.clone());
            }
        }
    }

    impl RecordingNotifier {
        pub(crate) fn versions(&self) -> Vec<u64> {
            match self.changes.lock() {
                Ok(changes) => changes.iter().map(|change| change.version).collect(),
                Err(err) => panic!("notifier lock poisoned: {err}"),
            }
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingDispatcher {
        pub(crate) dispatched: Mutex<Vec<(RunId, Phase)>>,
    }

    impl WorkerDispatcher for RecordingDispatcher {
        fn dispatch(&self, run_id: RunId, phase: Phase) -> Result<bool> {
            if let Ok(mut dispatched) = self.dispatched.lock() {
                dispatched.push((run_id, phase));
            }
            Ok(true)
        }
    }

    impl RecordingDispatcher {
        pub(crate) fn phases(&self) -> Vec<Phase> {
            match self.dispatched.lock() {
                Ok(dispatched) => dispatched.iter().map(|(_, phase)| *phase).collect(),
                Err(err) => panic!("dispatcher lock poisoned: {err}"),
            }
        }
    }

    #[derive(Default)]
    pub(crate) struct CountingEffect {
        pub(crate) fired: AtomicUsize,
    }

    impl TerminalEffect for CountingEffect {
        fn fire(&self, _item: &CompletionItem) -> Result<()> {
            self.fired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl CountingEffect {
        pub(crate) fn count(&self) -> usize {
            self.fired.load(Ordering::SeqCst)
        }
    }

    pub(crate) fn evidence(change_id: &str, patch: Value) -> PhaseStep {
        PhaseStep::Evidence {
            change_id: change_id.to_string(),
            patch,
            history_entries: Vec::new(),
        }
    }

    pub(crate) fn delta(run_id: RunId, change_id: &str, patch: Value) -> CommitRequest {
        CommitRequest {
            run_id,
            change_id: change_id.to_string(),
            patch: Some(patch),
            history_entries: Vec::new(),
            expected_version: None,
        }
    }

    pub(crate) fn hold_discovery(orchestrator: &Orchestrator<'_>, run_id: RunId) {
        let outcome = must(orchestrator.commit(&delta(
            run_id,
            "discovery-evidence",
            json!({"discovery": {"interviews_completed": 6, "problem_confirmed_ratio": 0.5}}),
        )));
        assert_eq!(outcome.run_status, Some(RunStatus::AwaitingHuman));
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn commit_publishes_only_applied_changes() {
        let db = TempDb::new("notify");
        let clock = fixture_clock();
        let notifier = RecordingNotifier::default();
        let orchestrator =
            Orchestrator::new(&db.0, KernelConfig::default(), &clock, &notifier, &NoopWorkerDispatcher);
        must(orchestrator.migrate());
        let run = must(orchestrator.create_run(&NewRun::default()));

        let request = delta(run.run_id, "c1", json!({"discovery": {"interviews_completed": 2}}));
        let first = must(orchestrator.commit(&request));
        let replay = must(orchestrator.commit(&request));
        assert_eq!(first.status, CommitStatus::Committed);
        assert_eq!(replay.status, CommitStatus::Duplicate);

        assert_eq!(notifier.versions(), vec![0, 1]);
    }

    #[test]
    fn abandon_is_idempotent_and_fails_the_run() {
        let db = TempDb::new("abandon");
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

        let first = must(orchestrator.abandon(run.run_id, "founder left"));
        assert_eq!(first.status, CommitStatus::Committed);
        assert_eq!(first.run_status, Some(RunStatus::Failed));
        let again = must(orchestrator.abandon(run.run_id, "founder left"));
        assert_eq!(again.status, CommitStatus::Duplicate);

        let status = match must(orchestrator.get_status(run.run_id)) {
            Some(value) => value,
            None => panic!("status should exist"),
        };
        assert_eq!(status.failure_reason.as_deref(), Some("founder left"));
        assert!(status.awaiting_checkpoint.is_none());

        let check = match must(orchestrator.verify_run(run.run_id)) {
            Some(value) => value,
            None => panic!("fold check should exist"),
        };
        assert!(check.consistent, "issues: {:?}", check.issues);
    }

    #[test]
    fn manual_clock_only_moves_when_advanced() {
        let clock = fixture_clock();
        let start = clock.now();
        assert_eq!(clock.now(), start);
        clock.advance(time::Duration::minutes(5));
        assert_eq!(clock.now() - start, time::Duration::minutes(5));
        assert!(default_owner("drain").starts_with("drain-"));
    }
}
