use anyhow::{anyhow, Context, Result};
use hypothesis_kernel_core::{
    format_rfc3339, parse_rfc3339_utc, Approval, CheckpointId, CheckpointStatus, HumanDecision,
    Phase, RunId,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{
    collect_rows, invalid_column, millis_column, parse_json_column, parse_phase, parse_ulid,
    parse_version, to_millis, to_sql_version, SqliteRunStore, StoreError,
};

const CHECKPOINT_COLUMNS: &str = "checkpoint_id, run_id, checkpoint_name, phase, context_json, \
    status, decision, decided_by, note, opened_version, expires_at_ms, created_at, resolved_at";

/// A human gate opened by a `hold` decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointRecord {
    pub checkpoint_id: CheckpointId,
    pub run_id: RunId,
    pub checkpoint_name: String,
    pub phase: Phase,
    pub context: Value,
    pub status: CheckpointStatus,
    pub decision: Option<HumanDecision>,
    pub decided_by: Option<String>,
    pub note: Option<String>,
    pub opened_version: u64,
    pub expires_at: String,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

impl CheckpointRecord {
    /// Whether `now` is at or past the deadline. Unparseable deadlines count as overdue.
    #[must_use]
    pub fn is_overdue(&self, now: OffsetDateTime) -> bool {
        parse_rfc3339_utc(&self.expires_at).map_or(true, |deadline| now >= deadline)
    }
}

pub(crate) struct NewCheckpoint<'a> {
    pub run_id: RunId,
    pub checkpoint_name: &'a str,
    pub phase: Phase,
    pub context: &'a Value,
    pub opened_version: u64,
    pub expires_at: OffsetDateTime,
}

pub(crate) fn insert_pending(
    conn: &Connection,
    checkpoint: &NewCheckpoint<'_>,
    now: OffsetDateTime,
) -> Result<CheckpointId> {
    let checkpoint_id = CheckpointId::new();
    let created_at = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;
    let context_json =
        serde_json::to_string(checkpoint.context).context("failed to serialize checkpoint context")?;

    conn.execute(
        "INSERT INTO checkpoints(
            checkpoint_id, run_id, checkpoint_name, phase, context_json, status,
            decision, decided_by, note, opened_version, expires_at_ms, created_at, resolved_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', NULL, NULL, NULL, ?6, ?7, ?8, NULL)",
        params![
            checkpoint_id.to_string(),
            checkpoint.run_id.to_string(),
            checkpoint.checkpoint_name,
            checkpoint.phase.as_str(),
            context_json,
            to_sql_version(checkpoint.opened_version)?,
            to_millis(checkpoint.expires_at),
            created_at,
        ],
    )
    .with_context(|| {
        format!(
            "failed to open checkpoint {} for run {}",
            checkpoint.checkpoint_name, checkpoint.run_id
        )
    })?;

    Ok(checkpoint_id)
}

/// Records the decision on a pending checkpoint whose deadline is still ahead of `now`.
pub(crate) fn mark_decided(
    conn: &Connection,
    run_id: RunId,
    checkpoint_name: &str,
    approval: &Approval,
    now: OffsetDateTime,
) -> Result<()> {
    let resolved_at = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;
    let updated = conn
        .execute(
            "UPDATE checkpoints SET
               status = 'decided',
               decision = ?1,
               decided_by = ?2,
               note = ?3,
               resolved_at = ?4
             WHERE run_id = ?5 AND checkpoint_name = ?6 AND status = 'pending'
               AND expires_at_ms > ?7",
            params![
                approval.decision.as_str(),
                approval.decided_by,
                approval.note,
                resolved_at,
                run_id.to_string(),
                checkpoint_name,
                to_millis(now),
            ],
        )
        .context("failed to record checkpoint decision")?;
    require_single_pending(updated, run_id, checkpoint_name)
}

pub(crate) fn mark_expired(
    conn: &Connection,
    run_id: RunId,
    checkpoint_name: &str,
    now: OffsetDateTime,
) -> Result<()> {
    let resolved_at = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;
    let updated = conn
        .execute(
            "UPDATE checkpoints SET status = 'expired', resolved_at = ?1
             WHERE run_id = ?2 AND checkpoint_name = ?3 AND status = 'pending'",
            params![resolved_at, run_id.to_string(), checkpoint_name],
        )
        .context("failed to expire checkpoint")?;
    require_single_pending(updated, run_id, checkpoint_name)
}

fn require_single_pending(updated: usize, run_id: RunId, checkpoint_name: &str) -> Result<()> {
    if updated == 1 {
        return Ok(());
    }
    Err(StoreError::CheckpointState {
        run_id,
        checkpoint_name: checkpoint_name.to_string(),
    }
    .into())
}

impl SqliteRunStore {
    pub fn get_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<Option<CheckpointRecord>> {
        let sql = format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE checkpoint_id = ?1");
        self.conn
            .query_row(&sql, params![checkpoint_id.to_string()], parse_checkpoint_row)
            .optional()
            .context("failed to load checkpoint")
    }

    pub fn list_checkpoints(&self, run_id: RunId) -> Result<Vec<CheckpointRecord>> {
        let sql = format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
             WHERE run_id = ?1
             ORDER BY opened_version ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![run_id.to_string()], parse_checkpoint_row)?;
        collect_rows(rows)
    }

    /// Most recently opened checkpoint with this name. A name can reopen after a pivot.
    pub fn latest_checkpoint(
        &self,
        run_id: RunId,
        checkpoint_name: &str,
    ) -> Result<Option<CheckpointRecord>> {
        let sql = format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
             WHERE run_id = ?1 AND checkpoint_name = ?2
             ORDER BY opened_version DESC
             LIMIT 1"
        );
        self.conn
            .query_row(
                &sql,
                params![run_id.to_string(), checkpoint_name],
                parse_checkpoint_row,
            )
            .optional()
            .context("failed to load latest checkpoint")
    }

    pub fn list_pending_checkpoints(&self) -> Result<Vec<CheckpointRecord>> {
        let sql = format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
             WHERE status = 'pending'
             ORDER BY expires_at_ms ASC, checkpoint_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], parse_checkpoint_row)?;
        collect_rows(rows)
    }

    pub fn list_overdue_checkpoints(
        &self,
        now: OffsetDateTime,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointRecord>> {
        let limit = i64::try_from(limit.unwrap_or(500)).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
             WHERE status = 'pending' AND expires_at_ms <= ?1
             ORDER BY expires_at_ms ASC, checkpoint_id ASC
             LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![to_millis(now), limit], parse_checkpoint_row)?;
        collect_rows(rows)
    }
}

fn parse_checkpoint_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointRecord> {
    let checkpoint_id_raw: String = row.get(0)?;
    let run_id_raw: String = row.get(1)?;
    let phase_raw: String = row.get(3)?;
    let context_raw: String = row.get(4)?;
    let status_raw: String = row.get(5)?;
    let decision_raw: Option<String> = row.get(6)?;
    let opened_version_i64: i64 = row.get(9)?;
    let expires_at_ms: i64 = row.get(10)?;

    let status = CheckpointStatus::parse(&status_raw).ok_or_else(|| {
        invalid_column(5, Type::Text, format!("invalid checkpoint status: {status_raw}"))
    })?;
    let decision = decision_raw
        .map(|raw| {
            HumanDecision::parse(&raw)
                .ok_or_else(|| invalid_column(6, Type::Text, format!("invalid decision: {raw}")))
        })
        .transpose()?;

    Ok(CheckpointRecord {
        checkpoint_id: CheckpointId(parse_ulid(0, &checkpoint_id_raw)?),
        run_id: RunId(parse_ulid(1, &run_id_raw)?),
        checkpoint_name: row.get(2)?,
        phase: parse_phase(3, &phase_raw)?,
        context: parse_json_column(4, &context_raw)?,
        status,
        decision,
        decided_by: row.get(7)?,
        note: row.get(8)?,
        opened_version: parse_version(9, opened_version_i64)?,
        expires_at: millis_column(10, expires_at_ms)?,
        created_at: row.get(11)?,
        resolved_at: row.get(12)?,
    })
}
