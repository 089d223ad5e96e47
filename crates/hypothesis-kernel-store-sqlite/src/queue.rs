use anyhow::{anyhow, Context, Result};
use hypothesis_kernel_core::{completion_payload, format_rfc3339, ItemId, QueueStatus, RunId};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::{
    collect_rows, invalid_column, millis_column, parse_json_column, parse_run_row, parse_ulid,
    to_millis, SqliteRunStore, StoreError, RUN_COLUMNS,
};

const ITEM_COLUMNS: &str = "item_id, run_id, payload_json, status, attempts, max_attempts, \
    available_at_ms, lease_owner, lease_expires_at_ms, last_error, enqueued_at, updated_at, \
    completed_at";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionItem {
    pub item_id: ItemId,
    pub run_id: RunId,
    pub payload: Value,
    pub status: QueueStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub available_at: String,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<String>,
    pub last_error: Option<String>,
    pub enqueued_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailOutcome {
    Retrying { attempts: u32, available_at: String },
    DeadLettered { attempts: u32 },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReclaimReport {
    pub reclaimed: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub dead_letter: usize,
}

pub(crate) fn enqueue(
    conn: &Connection,
    run_id: RunId,
    payload: &Value,
    max_attempts: u32,
    now: OffsetDateTime,
) -> Result<ItemId> {
    let item_id = ItemId::new();
    let enqueued_at = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;
    let payload_json =
        serde_json::to_string(payload).context("failed to serialize completion payload")?;

    conn.execute(
        "INSERT INTO completion_queue(
            item_id, run_id, payload_json, status, attempts, max_attempts, available_at_ms,
            lease_owner, lease_expires_at_ms, last_error, enqueued_at, updated_at, completed_at
         ) VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, NULL, NULL, NULL, ?6, ?6, NULL)",
        params![
            item_id.to_string(),
            run_id.to_string(),
            payload_json,
            i64::from(max_attempts),
            to_millis(now),
            enqueued_at,
        ],
    )
    .with_context(|| format!("failed to enqueue completion for run {run_id}"))?;

    Ok(item_id)
}

fn load_item(conn: &Connection, item_id: ItemId) -> Result<Option<CompletionItem>> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM completion_queue WHERE item_id = ?1");
    conn.query_row(&sql, params![item_id.to_string()], parse_item_row)
        .optional()
        .with_context(|| format!("failed to load queue item {item_id}"))
}

fn require_lease(
    conn: &Connection,
    item_id: ItemId,
    owner: &str,
) -> Result<CompletionItem> {
    match load_item(conn, item_id)? {
        Some(item)
            if item.status == QueueStatus::Processing
                && item.lease_owner.as_deref() == Some(owner) =>
        {
            Ok(item)
        }
        _ => Err(StoreError::LeaseLost {
            item_id,
            owner: owner.to_string(),
        }
        .into()),
    }
}

impl SqliteRunStore {
    /// Leases the oldest available pending item to `owner` for the configured lease.
    pub fn claim_next(&mut self, owner: &str, now: OffsetDateTime) -> Result<Option<CompletionItem>> {
        if owner.trim().is_empty() {
            return Err(anyhow!("lease owner MUST be non-empty"));
        }
        let lease_expires_at = now + self.config.lease();
        let updated_at = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start claim transaction")?;
        let candidate: Option<String> = tx
            .query_row(
                "SELECT item_id FROM completion_queue
                 WHERE status = 'pending' AND available_at_ms <= ?1
                 ORDER BY available_at_ms ASC, enqueued_at ASC, item_id ASC
                 LIMIT 1",
                params![to_millis(now)],
                |row| row.get(0),
            )
            .optional()
            .context("failed to select claimable item")?;
        let Some(item_id_raw) = candidate else {
            return Ok(None);
        };
        let item_id = ItemId::parse(&item_id_raw).map_err(|err| anyhow!(err.to_string()))?;

        tx.execute(
            "UPDATE completion_queue SET
               status = 'processing',
               lease_owner = ?1,
               lease_expires_at_ms = ?2,
               updated_at = ?3
             WHERE item_id = ?4 AND status = 'pending'",
            params![owner, to_millis(lease_expires_at), updated_at, item_id_raw],
        )
        .context("failed to lease queue item")?;
        let item = load_item(&tx, item_id)?
            .ok_or_else(|| anyhow!("queue item {item_id} vanished while claiming"))?;
        tx.commit().context("failed to commit claim transaction")?;

        info!(item_id = %item_id, run_id = %item.run_id, owner, attempts = item.attempts, "queue item claimed");
        Ok(Some(item))
    }

    /// Marks a leased item done. A lease that was reclaimed by the sweeper no longer counts.
    pub fn complete_item(&mut self, item_id: ItemId, owner: &str, now: OffsetDateTime) -> Result<()> {
        let completed_at = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start complete transaction")?;
        let item = require_lease(&tx, item_id, owner)?;
        tx.execute(
            "UPDATE completion_queue SET
               status = 'completed',
               lease_owner = NULL,
               lease_expires_at_ms = NULL,
               last_error = NULL,
               updated_at = ?1,
               completed_at = ?1
             WHERE item_id = ?2",
            params![completed_at, item_id.to_string()],
        )
        .context("failed to complete queue item")?;
        tx.commit().context("failed to commit complete transaction")?;

        info!(item_id = %item_id, run_id = %item.run_id, "queue item completed");
        Ok(())
    }

    /// Records a failed attempt. Retries back off exponentially; the last allowed attempt
    /// moves the item to the dead letter state.
    pub fn fail_item(
        &mut self,
        item_id: ItemId,
        owner: &str,
        error: &str,
        now: OffsetDateTime,
    ) -> Result<FailOutcome> {
        let updated_at = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start fail transaction")?;
        let item = require_lease(&tx, item_id, owner)?;
        let attempts = item.attempts.saturating_add(1);

        let outcome = if attempts >= item.max_attempts {
            tx.execute(
                "UPDATE completion_queue SET
                   status = 'dead_letter',
                   attempts = ?1,
                   lease_owner = NULL,
                   lease_expires_at_ms = NULL,
                   last_error = ?2,
                   updated_at = ?3
                 WHERE item_id = ?4",
                params![i64::from(attempts), error, updated_at, item_id.to_string()],
            )
            .context("failed to dead-letter queue item")?;
            FailOutcome::DeadLettered { attempts }
        } else {
            let available_at = now + self.config.backoff_for(attempts);
            tx.execute(
                "UPDATE completion_queue SET
                   status = 'pending',
                   attempts = ?1,
                   available_at_ms = ?2,
                   lease_owner = NULL,
                   lease_expires_at_ms = NULL,
                   last_error = ?3,
                   updated_at = ?4
                 WHERE item_id = ?5",
                params![
                    i64::from(attempts),
                    to_millis(available_at),
                    error,
                    updated_at,
                    item_id.to_string(),
                ],
            )
            .context("failed to reschedule queue item")?;
            FailOutcome::Retrying {
                attempts,
                available_at: format_rfc3339(available_at).map_err(|err| anyhow!(err.to_string()))?,
            }
        };
        tx.commit().context("failed to commit fail transaction")?;

        match &outcome {
            FailOutcome::DeadLettered { attempts } => {
                warn!(item_id = %item_id, run_id = %item.run_id, attempts, error, "queue item dead-lettered");
            }
            FailOutcome::Retrying { attempts, available_at } => {
                warn!(item_id = %item_id, run_id = %item.run_id, attempts, available_at = %available_at, error, "queue item will retry");
            }
        }
        Ok(outcome)
    }

    /// Returns items whose lease ran out to `pending`. A lost lease counts as an attempt.
    pub fn reclaim_expired(&mut self, now: OffsetDateTime) -> Result<ReclaimReport> {
        let updated_at = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start reclaim transaction")?;

        let expired = {
            let sql = format!(
                "SELECT {ITEM_COLUMNS} FROM completion_queue
                 WHERE status = 'processing' AND lease_expires_at_ms <= ?1
                 ORDER BY lease_expires_at_ms ASC"
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params![to_millis(now)], parse_item_row)?;
            collect_rows(rows)?
        };

        let mut report = ReclaimReport::default();
        for item in expired {
            let attempts = item.attempts.saturating_add(1);
            let last_error = format!(
                "lease held by {} expired",
                item.lease_owner.as_deref().unwrap_or("unknown")
            );
            if attempts >= item.max_attempts {
                tx.execute(
                    "UPDATE completion_queue SET
                       status = 'dead_letter',
                       attempts = ?1,
                       lease_owner = NULL,
                       lease_expires_at_ms = NULL,
                       last_error = ?2,
                       updated_at = ?3
                     WHERE item_id = ?4",
                    params![i64::from(attempts), last_error, updated_at, item.item_id.to_string()],
                )
                .context("failed to dead-letter reclaimed item")?;
                report.dead_lettered += 1;
                warn!(item_id = %item.item_id, run_id = %item.run_id, attempts, "expired lease exhausted attempts");
            } else {
                tx.execute(
                    "UPDATE completion_queue SET
                       status = 'pending',
                       attempts = ?1,
                       available_at_ms = ?2,
                       lease_owner = NULL,
                       lease_expires_at_ms = NULL,
                       last_error = ?3,
                       updated_at = ?4
                     WHERE item_id = ?5",
                    params![
                        i64::from(attempts),
                        to_millis(now),
                        last_error,
                        updated_at,
                        item.item_id.to_string(),
                    ],
                )
                .context("failed to reclaim queue item")?;
                report.reclaimed += 1;
                info!(item_id = %item.item_id, run_id = %item.run_id, attempts, "expired lease reclaimed");
            }
        }

        tx.commit().context("failed to commit reclaim transaction")?;
        Ok(report)
    }

    /// Enqueues completion items for completed runs that have none, rebuilding the payload
    /// from the run row.
    pub fn recover_missing_completions(&mut self, now: OffsetDateTime) -> Result<Vec<ItemId>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start recovery transaction")?;

        let orphans = {
            let sql = format!(
                "SELECT {RUN_COLUMNS} FROM runs
                 WHERE status = 'completed'
                   AND NOT EXISTS (
                     SELECT 1 FROM completion_queue q WHERE q.run_id = runs.run_id
                   )
                 ORDER BY updated_at ASC, run_id ASC"
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map([], parse_run_row)?;
            collect_rows(rows)?
        };

        let mut recovered = Vec::with_capacity(orphans.len());
        for run in orphans {
            let payload =
                completion_payload(&run.snapshot()).map_err(|err| anyhow!(err.to_string()))?;
            let item_id = enqueue(&tx, run.run_id, &payload, self.config.max_attempts, now)?;
            warn!(run_id = %run.run_id, item_id = %item_id, "recovered missing completion item");
            recovered.push(item_id);
        }

        tx.commit().context("failed to commit recovery transaction")?;
        Ok(recovered)
    }

    pub fn list_dead_letters(&self) -> Result<Vec<CompletionItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM completion_queue
             WHERE status = 'dead_letter'
             ORDER BY updated_at ASC, item_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], parse_item_row)?;
        collect_rows(rows)
    }

    /// Operator action: puts a dead-lettered item back in line with a fresh attempt budget.
    pub fn requeue_dead_letter(&mut self, item_id: ItemId, now: OffsetDateTime) -> Result<bool> {
        let updated_at = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;
        let updated = self
            .conn
            .execute(
                "UPDATE completion_queue SET
                   status = 'pending',
                   attempts = 0,
                   available_at_ms = ?1,
                   updated_at = ?2
                 WHERE item_id = ?3 AND status = 'dead_letter'",
                params![to_millis(now), updated_at, item_id.to_string()],
            )
            .context("failed to requeue dead letter")?;
        if updated == 1 {
            info!(item_id = %item_id, "dead letter requeued");
        }
        Ok(updated == 1)
    }

    pub fn queue_item(&self, item_id: ItemId) -> Result<Option<CompletionItem>> {
        load_item(&self.conn, item_id)
    }

    pub fn queue_items_for_run(&self, run_id: RunId) -> Result<Vec<CompletionItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM completion_queue
             WHERE run_id = ?1
             ORDER BY enqueued_at ASC, item_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![run_id.to_string()], parse_item_row)?;
        collect_rows(rows)
    }

    pub fn queue_counts(&self) -> Result<QueueCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM completion_queue GROUP BY status")?;
        let mut rows = stmt.query([])?;
        let mut counts = QueueCounts::default();
        while let Some(row) = rows.next()? {
            let status_raw: String = row.get(0)?;
            let count_i64: i64 = row.get(1)?;
            let count = usize::try_from(count_i64)
                .with_context(|| format!("invalid queue count: {count_i64}"))?;
            match QueueStatus::parse(&status_raw) {
                Some(QueueStatus::Pending) => counts.pending = count,
                Some(QueueStatus::Processing) => counts.processing = count,
                Some(QueueStatus::Completed) => counts.completed = count,
                Some(QueueStatus::DeadLetter) => counts.dead_letter = count,
                None => return Err(anyhow!("invalid queue status in storage: {status_raw}")),
            }
        }
        Ok(counts)
    }
}

fn parse_item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CompletionItem> {
    let item_id_raw: String = row.get(0)?;
    let run_id_raw: String = row.get(1)?;
    let payload_raw: String = row.get(2)?;
    let status_raw: String = row.get(3)?;
    let attempts_i64: i64 = row.get(4)?;
    let max_attempts_i64: i64 = row.get(5)?;
    let available_at_ms: i64 = row.get(6)?;
    let lease_expires_at_ms: Option<i64> = row.get(8)?;

    let to_u32 = |index: usize, raw: i64| {
        u32::try_from(raw)
            .map_err(|_| invalid_column(index, Type::Integer, format!("invalid counter: {raw}")))
    };

    Ok(CompletionItem {
        item_id: ItemId(parse_ulid(0, &item_id_raw)?),
        run_id: RunId(parse_ulid(1, &run_id_raw)?),
        payload: parse_json_column(2, &payload_raw)?,
        status: QueueStatus::parse(&status_raw).ok_or_else(|| {
            invalid_column(3, Type::Text, format!("invalid queue status: {status_raw}"))
        })?,
        attempts: to_u32(4, attempts_i64)?,
        max_attempts: to_u32(5, max_attempts_i64)?,
        available_at: millis_column(6, available_at_ms)?,
        lease_owner: row.get(7)?,
        lease_expires_at: lease_expires_at_ms
            .map(|millis| millis_column(8, millis))
            .transpose()?,
        last_error: row.get(9)?,
        enqueued_at: row.get(10)?,
        updated_at: row.get(11)?,
        completed_at: row.get(12)?,
    })
}
