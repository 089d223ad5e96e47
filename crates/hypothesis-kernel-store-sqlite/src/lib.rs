#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use hypothesis_kernel_core::{
    apply_delta, format_rfc3339, hash_json, now_utc, parse_patch, Decision, Effect,
    EvidenceState, ItemId, KernelConfig, KernelError, Phase, RouteOutcome, RoutingTable, RunId,
    RunSnapshot, RunStatus, StateSummary,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;

mod checkpoints;
mod queue;

pub use checkpoints::CheckpointRecord;
pub use queue::{CompletionItem, FailOutcome, QueueCounts, ReclaimReport};

const RUN_STORE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_RUN_STORE_V1: &str = r"
CREATE TABLE IF NOT EXISTS routing_tables (
  routing_version INTEGER PRIMARY KEY,
  table_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  version INTEGER NOT NULL CHECK (version >= 0),
  current_phase TEXT NOT NULL CHECK (
    current_phase IN ('discovery','desirability','feasibility','viability','decision')
  ),
  status TEXT NOT NULL CHECK (status IN ('active','awaiting_human','completed','failed')),
  awaiting_checkpoint TEXT,
  failure_reason TEXT,
  state_json TEXT NOT NULL DEFAULT '{}',
  routing_version INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK ((status = 'awaiting_human') = (awaiting_checkpoint IS NOT NULL)),
  CHECK (status <> 'failed' OR failure_reason IS NOT NULL),
  FOREIGN KEY (routing_version) REFERENCES routing_tables(routing_version)
);

CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);

CREATE TABLE IF NOT EXISTS run_history (
  run_id TEXT NOT NULL,
  version INTEGER NOT NULL CHECK (version >= 1),
  change_id TEXT NOT NULL,
  patch_json TEXT,
  patch_hash TEXT NOT NULL,
  entries_json TEXT NOT NULL DEFAULT '[]',
  phase_before TEXT NOT NULL,
  phase_after TEXT NOT NULL,
  status_after TEXT NOT NULL,
  routing_json TEXT,
  committed_at TEXT NOT NULL,
  PRIMARY KEY (run_id, version),
  UNIQUE (run_id, change_id),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TRIGGER IF NOT EXISTS trg_run_history_no_update
BEFORE UPDATE ON run_history
BEGIN
  SELECT RAISE(FAIL, 'run_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_run_history_no_delete
BEFORE DELETE ON run_history
BEGIN
  SELECT RAISE(FAIL, 'run_history is append-only');
END;

CREATE TABLE IF NOT EXISTS checkpoints (
  checkpoint_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  checkpoint_name TEXT NOT NULL,
  phase TEXT NOT NULL,
  context_json TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending','decided','expired')),
  decision TEXT CHECK (decision IN ('approve','reject') OR decision IS NULL),
  decided_by TEXT,
  note TEXT,
  opened_version INTEGER NOT NULL CHECK (opened_version >= 1),
  expires_at_ms INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  resolved_at TEXT,
  CHECK ((status = 'decided') = (decision IS NOT NULL)),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_checkpoints_one_pending_per_run
  ON checkpoints(run_id) WHERE status = 'pending';
CREATE INDEX IF NOT EXISTS idx_checkpoints_run_name
  ON checkpoints(run_id, checkpoint_name, opened_version);
CREATE INDEX IF NOT EXISTS idx_checkpoints_status_expiry
  ON checkpoints(status, expires_at_ms);

CREATE TABLE IF NOT EXISTS completion_queue (
  item_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending','processing','completed','dead_letter')),
  attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
  max_attempts INTEGER NOT NULL CHECK (max_attempts >= 1),
  available_at_ms INTEGER NOT NULL,
  lease_owner TEXT,
  lease_expires_at_ms INTEGER,
  last_error TEXT,
  enqueued_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  completed_at TEXT,
  CHECK ((status = 'processing') = (lease_owner IS NOT NULL)),
  CHECK ((lease_owner IS NULL) = (lease_expires_at_ms IS NULL)),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_completion_queue_one_live_item_per_run
  ON completion_queue(run_id) WHERE status IN ('pending','processing');
CREATE INDEX IF NOT EXISTS idx_completion_queue_claim
  ON completion_queue(status, available_at_ms, enqueued_at);
";

pub(crate) const RUN_COLUMNS: &str = "run_id, version, current_phase, status, awaiting_checkpoint, \
    failure_reason, state_json, routing_version, created_at, updated_at";

const HISTORY_COLUMNS: &str = "run_id, version, change_id, patch_json, patch_hash, entries_json, \
    phase_before, phase_after, status_after, routing_json, committed_at";

/// Typed failures callers are expected to branch on. Everything else surfaces as a plain
/// [`anyhow::Error`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("invalid delta: {0}")]
    InvalidDelta(String),
    #[error("run {run_id} is {} and accepts no further changes", .status.as_str())]
    RunClosed { run_id: RunId, status: RunStatus },
    #[error("queue item {item_id} is not leased by {owner}")]
    LeaseLost { item_id: ItemId, owner: String },
    #[error("checkpoint {checkpoint_name} on run {run_id} is not pending or past its deadline")]
    CheckpointState {
        run_id: RunId,
        checkpoint_name: String,
    },
    #[error("routing table v{0} is not installed")]
    UnknownRoutingVersion(u32),
}

pub struct SqliteRunStore {
    conn: Connection,
    config: KernelConfig,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct NewRun {
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub routing_version: Option<u32>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub version: u64,
    pub current_phase: Phase,
    pub status: RunStatus,
    pub awaiting_checkpoint: Option<String>,
    pub failure_reason: Option<String>,
    pub structured_state: EvidenceState,
    pub routing_version: u32,
    pub created_at: String,
    pub updated_at: String,
}

impl RunRecord {
    #[must_use]
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            current_phase: self.current_phase,
            status: self.status,
            awaiting_checkpoint: self.awaiting_checkpoint.clone(),
            failure_reason: self.failure_reason.clone(),
            state: self.structured_state.clone(),
        }
    }
}

/// One delta submitted against a run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct CommitRequest {
    pub run_id: RunId,
    pub change_id: String,
    #[serde(default)]
    pub patch: Option<Value>,
    #[serde(default)]
    pub history_entries: Vec<Value>,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    Committed,
    Duplicate,
    VersionConflict,
    NotFound,
}

impl CommitStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::Duplicate => "duplicate",
            Self::VersionConflict => "version_conflict",
            Self::NotFound => "not_found",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct CommitOutcome {
    pub status: CommitStatus,
    pub run_id: RunId,
    /// Version after the call; the unchanged current version for non-committed outcomes.
    pub version: Option<u64>,
    pub current_phase: Option<Phase>,
    pub run_status: Option<RunStatus>,
    pub decision: Option<RouteOutcome>,
    pub opened_checkpoint: Option<String>,
    pub enqueued_item: Option<ItemId>,
    pub payload_mismatch: bool,
}

impl CommitOutcome {
    fn not_found(run_id: RunId) -> Self {
        Self {
            status: CommitStatus::NotFound,
            run_id,
            version: None,
            current_phase: None,
            run_status: None,
            decision: None,
            opened_checkpoint: None,
            enqueued_item: None,
            payload_mismatch: false,
        }
    }

    fn unchanged(status: CommitStatus, run: &RunRecord, payload_mismatch: bool) -> Self {
        Self {
            status,
            run_id: run.run_id,
            version: Some(run.version),
            current_phase: Some(run.current_phase),
            run_status: Some(run.status),
            decision: None,
            opened_checkpoint: None,
            enqueued_item: None,
            payload_mismatch,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub run_id: RunId,
    pub version: u64,
    pub change_id: String,
    pub patch: Option<Value>,
    pub patch_hash: String,
    pub history_entries: Vec<Value>,
    pub phase_before: Phase,
    pub phase_after: Phase,
    pub status_after: RunStatus,
    pub routing: Option<RouteOutcome>,
    pub committed_at: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct RunStatusView {
    pub contract_version: String,
    pub run_id: RunId,
    pub version: u64,
    pub current_phase: Phase,
    pub status: RunStatus,
    pub awaiting_checkpoint: Option<String>,
    pub checkpoint_expires_at: Option<String>,
    pub failure_reason: Option<String>,
    pub routing_version: u32,
    pub summary: StateSummary,
    pub updated_at: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct FoldCheck {
    pub contract_version: String,
    pub run_id: RunId,
    pub consistent: bool,
    pub replayed_versions: u64,
    pub issues: Vec<String>,
}

impl SqliteRunStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            config: KernelConfig::default(),
        })
    }

    #[must_use]
    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_RUN_STORE_V1)
            .context("failed to apply run store schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![RUN_STORE_MIGRATION_VERSION, now],
            )
            .context("failed to register run store schema migration")?;

        self.upsert_routing_table(&RoutingTable::v1())?;
        Ok(())
    }

    pub fn upsert_routing_table(&self, table: &RoutingTable) -> Result<()> {
        table
            .validate()
            .map_err(|err| anyhow!("invalid routing table: {err}"))?;

        let payload = serde_json::to_string(table).context("failed to serialize routing table")?;
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO routing_tables(routing_version, table_json, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(routing_version) DO UPDATE SET
                   table_json = excluded.table_json,
                   created_at = excluded.created_at",
                params![i64::from(table.routing_version), payload, now],
            )
            .context("failed to upsert routing table")?;

        info!(routing_version = table.routing_version, "routing table installed");
        Ok(())
    }

    pub fn get_routing_tables(&self) -> Result<BTreeMap<u32, RoutingTable>> {
        let mut stmt = self.conn.prepare(
            "SELECT routing_version, table_json FROM routing_tables ORDER BY routing_version ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut map = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let version_i64: i64 = row.get(0)?;
            let version = u32::try_from(version_i64)
                .with_context(|| format!("invalid routing_version: {version_i64}"))?;
            let json: String = row.get(1)?;
            map.insert(version, decode_routing_table(version, &json)?);
        }
        Ok(map)
    }

    pub fn get_routing_table(&self, routing_version: u32) -> Result<Option<RoutingTable>> {
        match load_routing_table(&self.conn, routing_version) {
            Ok(table) => Ok(Some(table)),
            Err(err) if matches!(err.downcast_ref::<StoreError>(), Some(StoreError::UnknownRoutingVersion(_))) => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub fn create_run(&mut self, request: &NewRun, now: OffsetDateTime) -> Result<RunRecord> {
        let run_id = request.run_id.unwrap_or_default();
        let routing_version = request.routing_version.unwrap_or(1);
        let created_at = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;
        let state_json = serde_json::to_string(&EvidenceState::default())
            .context("failed to serialize empty structured state")?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start create_run transaction")?;
        load_routing_table(&tx, routing_version)?;
        tx.execute(
            "INSERT INTO runs(
                run_id, version, current_phase, status, awaiting_checkpoint, failure_reason,
                state_json, routing_version, created_at, updated_at
             ) VALUES (?1, 0, ?2, ?3, NULL, NULL, ?4, ?5, ?6, ?6)",
            params![
                run_id.to_string(),
                Phase::Discovery.as_str(),
                RunStatus::Active.as_str(),
                state_json,
                i64::from(routing_version),
                created_at,
            ],
        )
        .with_context(|| format!("failed to create run {run_id}"))?;
        tx.commit().context("failed to commit create_run transaction")?;

        info!(run_id = %run_id, routing_version, "run created");
        self.get_run(run_id)?
            .ok_or_else(|| anyhow!("run {run_id} missing right after insert"))
    }

    pub fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>> {
        load_run(&self.conn, run_id)
    }

    pub fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<RunRecord>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at ASC, run_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status.map(RunStatus::as_str)], parse_run_row)?;
        collect_rows(rows)
    }

    /// Applies one delta under the write lock.
    ///
    /// Merge, routing and every side row (checkpoint, completion item, history) land in one
    /// `BEGIN IMMEDIATE` transaction, so readers see either all of it or none of it.
    /// Checks run in order: unknown run, `expected_version`, replayed `change_id`, closed run.
    /// A stale writer therefore sees [`CommitStatus::VersionConflict`] even when replaying.
    ///
    /// # Errors
    /// Returns [`StoreError::InvalidDelta`] for malformed patches or deltas that do not fit
    /// the run, [`StoreError::RunClosed`] for terminal runs, and plain errors for storage
    /// failures. The run is untouched in every error case.
    pub fn commit(&mut self, request: &CommitRequest, now: OffsetDateTime) -> Result<CommitOutcome> {
        if request.change_id.trim().is_empty() {
            return Err(StoreError::InvalidDelta("change_id MUST be non-empty".to_string()).into());
        }
        let parsed = parse_patch(request.patch.as_ref())
            .map_err(|err| StoreError::InvalidDelta(err.to_string()))?;
        let patch_hash = hash_json(&json!({
            "patch": request.patch,
            "history_entries": request.history_entries,
        }))
        .map_err(|err| anyhow!(err.to_string()))?;
        let committed_at = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start commit transaction")?;

        let Some(run) = load_run(&tx, request.run_id)? else {
            debug!(run_id = %request.run_id, "commit against unknown run");
            return Ok(CommitOutcome::not_found(request.run_id));
        };

        if let Some(expected) = request.expected_version {
            if expected != run.version {
                debug!(
                    run_id = %run.run_id,
                    expected,
                    actual = run.version,
                    "version conflict"
                );
                return Ok(CommitOutcome::unchanged(CommitStatus::VersionConflict, &run, false));
            }
        }

        let prior_hash: Option<String> = tx
            .query_row(
                "SELECT patch_hash FROM run_history WHERE run_id = ?1 AND change_id = ?2",
                params![run.run_id.to_string(), request.change_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up change_id")?;
        if let Some(prior_hash) = prior_hash {
            let payload_mismatch = prior_hash != patch_hash;
            if payload_mismatch {
                warn!(
                    run_id = %run.run_id,
                    change_id = %request.change_id,
                    "change_id replayed with a different payload; keeping the first"
                );
            } else {
                debug!(run_id = %run.run_id, change_id = %request.change_id, "duplicate change_id");
            }
            return Ok(CommitOutcome::unchanged(
                CommitStatus::Duplicate,
                &run,
                payload_mismatch,
            ));
        }

        if run.status.is_terminal() {
            return Err(StoreError::RunClosed {
                run_id: run.run_id,
                status: run.status,
            }
            .into());
        }

        let table = load_routing_table(&tx, run.routing_version)?;
        let next_version = run.version + 1;
        let transition =
            apply_delta(&run.snapshot(), &parsed, &table, next_version).map_err(kernel_error)?;

        let mut opened_checkpoint = None;
        let mut enqueued_item = None;
        for effect in &transition.effects {
            match effect {
                Effect::OpenCheckpoint {
                    checkpoint_name,
                    phase,
                    context,
                } => {
                    checkpoints::insert_pending(
                        &tx,
                        &checkpoints::NewCheckpoint {
                            run_id: run.run_id,
                            checkpoint_name,
                            phase: *phase,
                            context,
                            opened_version: next_version,
                            expires_at: now + self.config.checkpoint_ttl(),
                        },
                        now,
                    )?;
                    opened_checkpoint = Some(checkpoint_name.clone());
                }
                Effect::ResolveCheckpoint {
                    checkpoint_name,
                    approval,
                } => checkpoints::mark_decided(&tx, run.run_id, checkpoint_name, approval, now)?,
                Effect::ExpireCheckpoint { checkpoint_name } => {
                    checkpoints::mark_expired(&tx, run.run_id, checkpoint_name, now)?;
                }
                Effect::EnqueueCompletion { payload } => {
                    enqueued_item = Some(queue::enqueue(
                        &tx,
                        run.run_id,
                        payload,
                        self.config.max_attempts,
                        now,
                    )?);
                }
            }
        }

        let snapshot = &transition.snapshot;
        let state_json = serde_json::to_string(&snapshot.state)
            .context("failed to serialize structured state")?;
        let patch_json = request
            .patch
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize patch")?;
        let entries_json = serde_json::to_string(&request.history_entries)
            .context("failed to serialize history entries")?;
        let routing_json = transition
            .routing
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize routing outcome")?;

        tx.execute(
            "INSERT INTO run_history(
                run_id, version, change_id, patch_json, patch_hash, entries_json,
                phase_before, phase_after, status_after, routing_json, committed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run.run_id.to_string(),
                to_sql_version(next_version)?,
                request.change_id,
                patch_json,
                patch_hash,
                entries_json,
                run.current_phase.as_str(),
                snapshot.current_phase.as_str(),
                snapshot.status.as_str(),
                routing_json,
                committed_at,
            ],
        )
        .context("failed to append run history")?;

        let updated = tx
            .execute(
                "UPDATE runs SET
                   version = ?1,
                   current_phase = ?2,
                   status = ?3,
                   awaiting_checkpoint = ?4,
                   failure_reason = ?5,
                   state_json = ?6,
                   updated_at = ?7
                 WHERE run_id = ?8 AND version = ?9",
                params![
                    to_sql_version(next_version)?,
                    snapshot.current_phase.as_str(),
                    snapshot.status.as_str(),
                    snapshot.awaiting_checkpoint,
                    snapshot.failure_reason,
                    state_json,
                    committed_at,
                    run.run_id.to_string(),
                    to_sql_version(run.version)?,
                ],
            )
            .context("failed to update run")?;
        if updated != 1 {
            return Err(anyhow!(
                "run {} changed while the commit lock was held",
                run.run_id
            ));
        }

        tx.commit().context("failed to commit run transaction")?;

        info!(
            run_id = %run.run_id,
            version = next_version,
            change_id = %request.change_id,
            phase = snapshot.current_phase.as_str(),
            status = snapshot.status.as_str(),
            decision = transition.decision().map_or("none", Decision::as_str),
            "delta committed"
        );

        Ok(CommitOutcome {
            status: CommitStatus::Committed,
            run_id: run.run_id,
            version: Some(next_version),
            current_phase: Some(snapshot.current_phase),
            run_status: Some(snapshot.status),
            decision: transition.routing.clone(),
            opened_checkpoint,
            enqueued_item,
            payload_mismatch: false,
        })
    }

    /// Read-only status with the derived progress summary. Never takes the write lock.
    pub fn get_status(&self, run_id: RunId) -> Result<Option<RunStatusView>> {
        let Some(run) = self.get_run(run_id)? else {
            return Ok(None);
        };

        let checkpoint_expires_at = if run.awaiting_checkpoint.is_some() {
            self.conn
                .query_row(
                    "SELECT expires_at_ms FROM checkpoints WHERE run_id = ?1 AND status = 'pending'",
                    params![run_id.to_string()],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
                .context("failed to read pending checkpoint expiry")?
                .map(millis_to_rfc3339)
                .transpose()?
        } else {
            None
        };

        Ok(Some(RunStatusView {
            contract_version: "run_status.v1".to_string(),
            run_id: run.run_id,
            version: run.version,
            current_phase: run.current_phase,
            status: run.status,
            summary: run
                .structured_state
                .summarize(run.current_phase, run.status),
            awaiting_checkpoint: run.awaiting_checkpoint,
            checkpoint_expires_at,
            failure_reason: run.failure_reason,
            routing_version: run.routing_version,
            updated_at: run.updated_at,
        }))
    }

    pub fn list_history(&self, run_id: RunId) -> Result<Vec<HistoryRecord>> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM run_history WHERE run_id = ?1 ORDER BY version ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![run_id.to_string()], parse_history_row)?;
        collect_rows(rows)
    }

    /// Re-folds the run's history from the initial snapshot and compares the result with
    /// the stored run row.
    pub fn verify_run(&self, run_id: RunId) -> Result<Option<FoldCheck>> {
        let Some(run) = self.get_run(run_id)? else {
            return Ok(None);
        };
        let table = load_routing_table(&self.conn, run.routing_version)?;
        let history = self.list_history(run_id)?;

        let mut issues = Vec::new();
        let mut snapshot = RunSnapshot::initial();
        let mut expected_version = 0_u64;
        for entry in &history {
            expected_version += 1;
            if entry.version != expected_version {
                issues.push(format!(
                    "history gap: expected version {expected_version}, found {}",
                    entry.version
                ));
                break;
            }
            let transition = parse_patch(entry.patch.as_ref())
                .and_then(|parsed| apply_delta(&snapshot, &parsed, &table, entry.version));
            let transition = match transition {
                Ok(value) => value,
                Err(err) => {
                    issues.push(format!("v{} no longer applies: {err}", entry.version));
                    break;
                }
            };
            if transition.snapshot.current_phase != entry.phase_after {
                issues.push(format!(
                    "v{}: replay lands in {}, history recorded {}",
                    entry.version,
                    transition.snapshot.current_phase.as_str(),
                    entry.phase_after.as_str()
                ));
            }
            if transition.snapshot.status != entry.status_after {
                issues.push(format!(
                    "v{}: replay status {}, history recorded {}",
                    entry.version,
                    transition.snapshot.status.as_str(),
                    entry.status_after.as_str()
                ));
            }
            snapshot = transition.snapshot;
        }

        let replayed_versions = u64::try_from(history.len()).unwrap_or(u64::MAX);
        if run.version != replayed_versions {
            issues.push(format!(
                "run is at version {} but history holds {replayed_versions} deltas",
                run.version
            ));
        }
        if issues.is_empty() && snapshot != run.snapshot() {
            issues.push("stored run differs from the fold of its history".to_string());
        }

        if !issues.is_empty() {
            warn!(run_id = %run_id, issues = issues.len(), "run fold check failed");
        }

        Ok(Some(FoldCheck {
            contract_version: "fold_check.v1".to_string(),
            run_id,
            consistent: issues.is_empty(),
            replayed_versions,
            issues,
        }))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn kernel_error(err: KernelError) -> anyhow::Error {
    match err {
        KernelError::Validation(message) => StoreError::InvalidDelta(message).into(),
        other => anyhow!(other),
    }
}

fn load_run(conn: &Connection, run_id: RunId) -> Result<Option<RunRecord>> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1");
    conn.query_row(&sql, params![run_id.to_string()], parse_run_row)
        .optional()
        .with_context(|| format!("failed to load run {run_id}"))
}

fn load_routing_table(conn: &Connection, routing_version: u32) -> Result<RoutingTable> {
    let json: Option<String> = conn
        .query_row(
            "SELECT table_json FROM routing_tables WHERE routing_version = ?1",
            params![i64::from(routing_version)],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read routing table")?;
    let json = json.ok_or(StoreError::UnknownRoutingVersion(routing_version))?;
    decode_routing_table(routing_version, &json)
}

fn decode_routing_table(routing_version: u32, json: &str) -> Result<RoutingTable> {
    let value: Value = serde_json::from_str(json).context("invalid stored routing table JSON")?;
    RoutingTable::from_json(&value)
        .map_err(|err| anyhow!("failed to parse routing table {routing_version}: {err}"))
}

pub(crate) fn parse_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let run_id_raw: String = row.get(0)?;
    let version_i64: i64 = row.get(1)?;
    let phase_raw: String = row.get(2)?;
    let status_raw: String = row.get(3)?;
    let state_raw: String = row.get(6)?;
    let routing_version_i64: i64 = row.get(7)?;

    let structured_state = serde_json::from_str::<Value>(&state_raw)
        .map_err(|err| invalid_column(6, Type::Text, format!("invalid state_json: {err}")))
        .and_then(|value| {
            EvidenceState::from_document(&value)
                .map_err(|err| invalid_column(6, Type::Text, err.to_string()))
        })?;

    Ok(RunRecord {
        run_id: RunId(parse_ulid(0, &run_id_raw)?),
        version: parse_version(1, version_i64)?,
        current_phase: parse_phase(2, &phase_raw)?,
        status: parse_run_status(3, &status_raw)?,
        awaiting_checkpoint: row.get(4)?,
        failure_reason: row.get(5)?,
        structured_state,
        routing_version: u32::try_from(routing_version_i64).map_err(|_| {
            invalid_column(
                7,
                Type::Integer,
                format!("invalid routing_version: {routing_version_i64}"),
            )
        })?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn parse_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let run_id_raw: String = row.get(0)?;
    let version_i64: i64 = row.get(1)?;
    let patch_raw: Option<String> = row.get(3)?;
    let entries_raw: String = row.get(5)?;
    let phase_before_raw: String = row.get(6)?;
    let phase_after_raw: String = row.get(7)?;
    let status_after_raw: String = row.get(8)?;
    let routing_raw: Option<String> = row.get(9)?;

    Ok(HistoryRecord {
        run_id: RunId(parse_ulid(0, &run_id_raw)?),
        version: parse_version(1, version_i64)?,
        change_id: row.get(2)?,
        patch: patch_raw
            .as_deref()
            .map(|raw| parse_json_column(3, raw))
            .transpose()?,
        patch_hash: row.get(4)?,
        history_entries: serde_json::from_str(&entries_raw)
            .map_err(|err| invalid_column(5, Type::Text, format!("invalid entries_json: {err}")))?,
        phase_before: parse_phase(6, &phase_before_raw)?,
        phase_after: parse_phase(7, &phase_after_raw)?,
        status_after: parse_run_status(8, &status_after_raw)?,
        routing: routing_raw
            .as_deref()
            .map(|raw| {
                serde_json::from_str(raw).map_err(|err| {
                    invalid_column(9, Type::Text, format!("invalid routing_json: {err}"))
                })
            })
            .transpose()?,
        committed_at: row.get(10)?,
    })
}

pub(crate) fn invalid_column(index: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

pub(crate) fn parse_ulid(index: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw)
        .map_err(|_| invalid_column(index, Type::Text, format!("invalid ULID: {raw}")))
}

pub(crate) fn parse_phase(index: usize, raw: &str) -> rusqlite::Result<Phase> {
    Phase::parse(raw).ok_or_else(|| invalid_column(index, Type::Text, format!("invalid phase: {raw}")))
}

fn parse_run_status(index: usize, raw: &str) -> rusqlite::Result<RunStatus> {
    RunStatus::parse(raw)
        .ok_or_else(|| invalid_column(index, Type::Text, format!("invalid run status: {raw}")))
}

pub(crate) fn parse_version(index: usize, raw: i64) -> rusqlite::Result<u64> {
    u64::try_from(raw)
        .map_err(|_| invalid_column(index, Type::Integer, format!("invalid version: {raw}")))
}

pub(crate) fn parse_json_column(index: usize, raw: &str) -> rusqlite::Result<Value> {
    serde_json::from_str(raw)
        .map_err(|err| invalid_column(index, Type::Text, format!("invalid JSON column: {err}")))
}

pub(crate) fn to_sql_version(version: u64) -> Result<i64> {
    i64::try_from(version).with_context(|| format!("version {version} exceeds sqlite range"))
}

/// Unix milliseconds; expiry and availability columns compare as integers.
pub(crate) fn to_millis(value: OffsetDateTime) -> i64 {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

pub(crate) fn millis_to_rfc3339(millis: i64) -> Result<String> {
    let value = OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .with_context(|| format!("timestamp {millis}ms is out of range"))?;
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

pub(crate) fn millis_column(index: usize, millis: i64) -> rusqlite::Result<String> {
    millis_to_rfc3339(millis).map_err(|err| invalid_column(index, Type::Integer, err.to_string()))
}

pub(crate) fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
