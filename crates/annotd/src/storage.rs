//! SQLite storage for documents, runs, overlays and the transition outbox.
//!
//! Every overlay transition commits in one `BEGIN IMMEDIATE` transaction that
//! compare-and-swaps the overlay row, adjusts the run counters and appends the
//! outbox row the fan-out relay publishes from.

use std::path::Path;
use std::time::Duration;

use annot_core::aggregate::{self, AggregateError, Recount};
use annot_core::{
    Block, BlockOverlay, Id, OverlayStatus, OverlayTransition, Run, RunProgress, RunSnapshot,
    RunStatus, Transition, TransitionKind,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite, SqliteConnection};
use thiserror::Error;

const RUNS_COLUMNS: &str = "run_id, conv_uid, schema_id, status, total_blocks, \
    completed_blocks, failed_blocks, max_attempts, model_config, started_at, completed_at";

const OVERLAYS_COLUMNS: &str = "run_id, block_uid, block_index, status, staging_payload, \
    confirmed_payload, claimed_by, claimed_at, lease_ms, attempt_count, retry_base, last_error, \
    confirmed_by, confirmed_at, revision, updated_at";

const EVENTS_COLUMNS: &str =
    "seq, run_id, block_uid, kind, from_status, overlay_json, run_json, committed_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("counter error: {0}")]
    Aggregate(#[from] AggregateError),
    #[error("io error: {0}")]
    Io(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("overlay not found: {run_id}/{block_uid}")]
    OverlayNotFound { run_id: String, block_uid: String },
    /// The overlay changed between read and write.
    #[error("overlay {run_id}/{block_uid} changed concurrently")]
    Conflict { run_id: String, block_uid: String },
    #[error("run {0} is cancelled")]
    RunCancelled(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the daemon.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Open (or create) the database at `db_path`.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations. Safe to call on every start.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- Block operations ---

    /// Insert blocks of a document. Blocks already stored under the same
    /// `(conv_uid, block_uid)` or `block_index` are left untouched.
    pub async fn insert_blocks(&self, conv_uid: &str, blocks: &[Block]) -> Result<usize> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let mut inserted = 0;
        for block in blocks {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO blocks (conv_uid, block_uid, block_index, block_type, content) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(conv_uid)
            .bind(&block.block_uid)
            .bind(block.block_index)
            .bind(&block.block_type)
            .bind(&block.content)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Blocks of a document in reading order.
    pub async fn list_blocks(&self, conv_uid: &str) -> Result<Vec<Block>> {
        let rows = sqlx::query_as::<_, BlockRow>(
            "SELECT block_uid, block_index, block_type, content FROM blocks \
             WHERE conv_uid = ?1 ORDER BY block_index ASC",
        )
        .bind(conv_uid)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(BlockRow::into_block).collect())
    }

    // --- Run operations ---

    /// Insert a run together with its initial overlays.
    pub async fn create_run(&self, run: &Run, overlays: &[BlockOverlay]) -> Result<()> {
        let model_config = run
            .model_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        sqlx::query(
            r#"
            INSERT INTO runs (run_id, conv_uid, schema_id, status, total_blocks, completed_blocks,
                              failed_blocks, max_attempts, model_config, started_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(run.run_id.as_ref())
        .bind(&run.conv_uid)
        .bind(&run.schema_id)
        .bind(run.status.as_str())
        .bind(i64::from(run.total_blocks))
        .bind(i64::from(run.completed_blocks))
        .bind(i64::from(run.failed_blocks))
        .bind(i64::from(run.max_attempts))
        .bind(model_config)
        .bind(run.started_at.timestamp_millis())
        .bind(run.completed_at.map(|t| t.timestamp_millis()))
        .execute(&mut *tx)
        .await?;

        for overlay in overlays {
            insert_overlay(&mut *tx, overlay).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: &Id) -> Result<Run> {
        let mut conn = self.pool.acquire().await?;
        fetch_run(&mut *conn, run_id).await
    }

    /// Runs newest first, optionally for one document.
    pub async fn list_runs(&self, conv_uid: Option<&str>) -> Result<Vec<Run>> {
        let rows = match conv_uid {
            Some(conv) => {
                let query = format!(
                    "SELECT {RUNS_COLUMNS} FROM runs WHERE conv_uid = ?1 ORDER BY started_at DESC"
                );
                sqlx::query_as::<_, RunRow>(&query)
                    .bind(conv)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!("SELECT {RUNS_COLUMNS} FROM runs ORDER BY started_at DESC");
                sqlx::query_as::<_, RunRow>(&query)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(RunRow::into_run).collect()
    }

    /// Move a running run to cancelled. Returns false when the run was not
    /// running.
    pub async fn cancel_run(&self, run_id: &Id) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE runs SET status = 'cancelled' WHERE run_id = ?1 AND status = 'running'",
        )
        .bind(run_id.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a run, its overlays and its outbox rows.
    pub async fn delete_run(&self, run_id: &Id) -> Result<()> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        sqlx::query("DELETE FROM overlay_events WHERE run_id = ?1")
            .bind(run_id.as_ref())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM block_overlays WHERE run_id = ?1")
            .bind(run_id.as_ref())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM runs WHERE run_id = ?1")
            .bind(run_id.as_ref())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(run_id.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    /// Overwrite a run's counters with recomputed values and re-derive its
    /// status. Returns the updated run.
    pub async fn repair_counters(&self, run_id: &Id, counts: Recount) -> Result<Run> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let mut run = fetch_run(&mut *tx, run_id).await?;
        run.total_blocks = counts.total_blocks;
        run.completed_blocks = counts.completed_blocks;
        run.failed_blocks = counts.failed_blocks;
        aggregate::derive_status(&mut run, Utc::now());
        sqlx::query(
            "UPDATE runs SET total_blocks = ?1, completed_blocks = ?2, failed_blocks = ?3, \
             status = ?4, completed_at = ?5 WHERE run_id = ?6",
        )
        .bind(i64::from(run.total_blocks))
        .bind(i64::from(run.completed_blocks))
        .bind(i64::from(run.failed_blocks))
        .bind(run.status.as_str())
        .bind(run.completed_at.map(|t| t.timestamp_millis()))
        .bind(run_id.as_ref())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(run)
    }

    // --- Overlay operations ---

    pub async fn get_overlay(&self, run_id: &Id, block_uid: &str) -> Result<BlockOverlay> {
        let query =
            format!("SELECT {OVERLAYS_COLUMNS} FROM block_overlays WHERE run_id = ?1 AND block_uid = ?2");
        let row = sqlx::query_as::<_, OverlayRow>(&query)
            .bind(run_id.as_ref())
            .bind(block_uid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::OverlayNotFound {
                run_id: run_id.to_string(),
                block_uid: block_uid.to_string(),
            })?;
        row.into_overlay()
    }

    /// Overlays of a run in block order.
    pub async fn list_overlays(&self, run_id: &Id) -> Result<Vec<BlockOverlay>> {
        let mut conn = self.pool.acquire().await?;
        fetch_overlays(&mut *conn, run_id).await
    }

    pub async fn list_overlays_with_status(
        &self,
        run_id: &Id,
        status: OverlayStatus,
    ) -> Result<Vec<BlockOverlay>> {
        let query = format!(
            "SELECT {OVERLAYS_COLUMNS} FROM block_overlays WHERE run_id = ?1 AND status = ?2 \
             ORDER BY block_index ASC"
        );
        let rows = sqlx::query_as::<_, OverlayRow>(&query)
            .bind(run_id.as_ref())
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(OverlayRow::into_overlay).collect()
    }

    /// Claimable overlays in block order: pending, retryable failures and
    /// claims whose own lease ran out before `now`, with budget left.
    pub async fn claim_candidates(
        &self,
        run_id: &Id,
        max_attempts: u32,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<BlockOverlay>> {
        let query = format!(
            "SELECT {OVERLAYS_COLUMNS} FROM block_overlays \
             WHERE run_id = ?1 AND (status = 'pending' \
                OR (status = 'failed' AND attempt_count - retry_base < ?2) \
                OR (status = 'claimed' AND claimed_at + lease_ms < ?3 \
                    AND attempt_count - retry_base < ?2)) \
             ORDER BY block_index ASC, updated_at ASC LIMIT ?4"
        );
        let rows = sqlx::query_as::<_, OverlayRow>(&query)
            .bind(run_id.as_ref())
            .bind(i64::from(max_attempts))
            .bind(now.timestamp_millis())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(OverlayRow::into_overlay).collect()
    }

    /// Claims with no retry budget left whose lease ran out before `now`,
    /// across all runs. Earlier attempts stay claimable and are left to
    /// `claim_candidates`.
    pub async fn expired_final_claims(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<BlockOverlay>> {
        let query = format!(
            "SELECT {OVERLAYS_COLUMNS} FROM block_overlays \
             WHERE status = 'claimed' AND claimed_at + lease_ms < ?1 \
               AND attempt_count - retry_base >= \
                   (SELECT r.max_attempts FROM runs r WHERE r.run_id = block_overlays.run_id) \
             ORDER BY claimed_at ASC LIMIT ?2"
        );
        let rows = sqlx::query_as::<_, OverlayRow>(&query)
            .bind(now.timestamp_millis())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(OverlayRow::into_overlay).collect()
    }

    /// Commit one planned transition.
    ///
    /// The overlay write, the counter update and the outbox append either all
    /// land or none do. Fails with `Conflict` when the overlay no longer
    /// matches `transition.before`.
    pub async fn commit_transition(&self, transition: &Transition) -> Result<OverlayTransition> {
        let before = &transition.before;
        let after = &transition.after;
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let mut run = fetch_run(&mut *tx, &before.run_id).await?;
        if run.status == RunStatus::Cancelled && transition.kind.starts_attempt() {
            return Err(StorageError::RunCancelled(run.run_id.to_string()));
        }

        let staging = after.staging_payload.as_ref().map(serde_json::to_string).transpose()?;
        let confirmed = after.confirmed_payload.as_ref().map(serde_json::to_string).transpose()?;
        let updated = sqlx::query(
            r#"
            UPDATE block_overlays
            SET status = ?1, staging_payload = ?2, confirmed_payload = ?3, claimed_by = ?4,
                claimed_at = ?5, lease_ms = ?6, attempt_count = ?7, retry_base = ?8,
                last_error = ?9, confirmed_by = ?10, confirmed_at = ?11, revision = ?12,
                updated_at = ?13
            WHERE run_id = ?14 AND block_uid = ?15
              AND status = ?16 AND attempt_count = ?17 AND revision = ?18
            "#,
        )
        .bind(after.status.as_str())
        .bind(staging)
        .bind(confirmed)
        .bind(&after.claimed_by)
        .bind(after.claimed_at.map(|t| t.timestamp_millis()))
        .bind(after.lease_ms.map(|ms| ms as i64))
        .bind(i64::from(after.attempt_count))
        .bind(i64::from(after.retry_base))
        .bind(&after.last_error)
        .bind(&after.confirmed_by)
        .bind(after.confirmed_at.map(|t| t.timestamp_millis()))
        .bind(after.revision as i64)
        .bind(after.updated_at.timestamp_millis())
        .bind(before.run_id.as_ref())
        .bind(&before.block_uid)
        .bind(before.status.as_str())
        .bind(i64::from(before.attempt_count))
        .bind(before.revision as i64)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            // Dropping the transaction rolls it back.
            return Err(StorageError::Conflict {
                run_id: before.run_id.to_string(),
                block_uid: before.block_uid.clone(),
            });
        }

        if !transition.delta.is_zero() {
            aggregate::apply_delta(&mut run, transition.delta, after.updated_at)?;
            sqlx::query(
                "UPDATE runs SET completed_blocks = ?1, failed_blocks = ?2, status = ?3, \
                 completed_at = ?4 WHERE run_id = ?5",
            )
            .bind(i64::from(run.completed_blocks))
            .bind(i64::from(run.failed_blocks))
            .bind(run.status.as_str())
            .bind(run.completed_at.map(|t| t.timestamp_millis()))
            .bind(run.run_id.as_ref())
            .execute(&mut *tx)
            .await?;
        }

        let progress = run.progress();
        let committed_at = after.updated_at;
        let inserted = sqlx::query(
            r#"
            INSERT INTO overlay_events (run_id, block_uid, kind, from_status, overlay_json,
                                        run_json, committed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(after.run_id.as_ref())
        .bind(&after.block_uid)
        .bind(transition.kind.as_str())
        .bind(before.status.as_str())
        .bind(serde_json::to_string(after)?)
        .bind(serde_json::to_string(&progress)?)
        .bind(committed_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(OverlayTransition {
            seq: inserted.last_insert_rowid() as u64,
            run_id: after.run_id.clone(),
            block_uid: after.block_uid.clone(),
            kind: transition.kind,
            from_status: before.status,
            overlay: after.clone(),
            run: progress,
            committed_at,
        })
    }

    // --- Snapshot and outbox ---

    /// Run, overlays and outbox high-water mark read from one snapshot.
    pub async fn snapshot(&self, run_id: &Id) -> Result<RunSnapshot> {
        let mut tx = self.pool.begin().await?;
        let seq = fetch_latest_seq(&mut *tx).await?;
        let run = fetch_run(&mut *tx, run_id).await?;
        let overlays = fetch_overlays(&mut *tx, run_id).await?;
        tx.commit().await?;
        Ok(RunSnapshot { run, overlays, seq })
    }

    /// Highest sequence number ever assigned, including pruned rows.
    pub async fn latest_seq(&self) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        fetch_latest_seq(&mut *conn).await
    }

    /// Outbox rows after `seq`, oldest first.
    pub async fn events_after(&self, seq: u64, limit: u32) -> Result<Vec<OverlayTransition>> {
        let query = format!(
            "SELECT {EVENTS_COLUMNS} FROM overlay_events WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2"
        );
        let rows = sqlx::query_as::<_, EventRow>(&query)
            .bind(seq as i64)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(EventRow::into_transition).collect()
    }

    /// Drop outbox rows at or below `seq`.
    pub async fn prune_events(&self, seq: u64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM overlay_events WHERE seq <= ?1")
            .bind(seq as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

async fn fetch_run(conn: &mut SqliteConnection, run_id: &Id) -> Result<Run> {
    let query = format!("SELECT {RUNS_COLUMNS} FROM runs WHERE run_id = ?1");
    let row = sqlx::query_as::<_, RunRow>(&query)
        .bind(run_id.as_ref())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StorageError::RunNotFound(run_id.to_string()))?;
    row.into_run()
}

async fn fetch_overlays(conn: &mut SqliteConnection, run_id: &Id) -> Result<Vec<BlockOverlay>> {
    let query = format!(
        "SELECT {OVERLAYS_COLUMNS} FROM block_overlays WHERE run_id = ?1 ORDER BY block_index ASC"
    );
    let rows = sqlx::query_as::<_, OverlayRow>(&query)
        .bind(run_id.as_ref())
        .fetch_all(&mut *conn)
        .await?;
    rows.into_iter().map(OverlayRow::into_overlay).collect()
}

async fn fetch_latest_seq(conn: &mut SqliteConnection) -> Result<u64> {
    let seq: Option<(i64,)> =
        sqlx::query_as("SELECT seq FROM sqlite_sequence WHERE name = 'overlay_events'")
            .fetch_optional(&mut *conn)
            .await?;
    Ok(seq.map_or(0, |(s,)| s as u64))
}

async fn insert_overlay(conn: &mut SqliteConnection, overlay: &BlockOverlay) -> Result<()> {
    let staging = overlay.staging_payload.as_ref().map(serde_json::to_string).transpose()?;
    let confirmed = overlay.confirmed_payload.as_ref().map(serde_json::to_string).transpose()?;
    sqlx::query(
        r#"
        INSERT INTO block_overlays (run_id, block_uid, block_index, status, staging_payload,
                                    confirmed_payload, claimed_by, claimed_at, lease_ms,
                                    attempt_count, retry_base, last_error, confirmed_by,
                                    confirmed_at, revision, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
        "#,
    )
    .bind(overlay.run_id.as_ref())
    .bind(&overlay.block_uid)
    .bind(overlay.block_index)
    .bind(overlay.status.as_str())
    .bind(staging)
    .bind(confirmed)
    .bind(&overlay.claimed_by)
    .bind(overlay.claimed_at.map(|t| t.timestamp_millis()))
    .bind(overlay.lease_ms.map(|ms| ms as i64))
    .bind(i64::from(overlay.attempt_count))
    .bind(i64::from(overlay.retry_base))
    .bind(&overlay.last_error)
    .bind(&overlay.confirmed_by)
    .bind(overlay.confirmed_at.map(|t| t.timestamp_millis()))
    .bind(overlay.revision as i64)
    .bind(overlay.updated_at.timestamp_millis())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn timestamp(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_json(raw: Option<String>) -> Result<Option<serde_json::Value>> {
    raw.map(|s| serde_json::from_str(&s)).transpose().map_err(Into::into)
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct BlockRow {
    block_uid: String,
    block_index: i64,
    block_type: String,
    content: String,
}

impl BlockRow {
    fn into_block(self) -> Block {
        Block {
            block_uid: self.block_uid,
            block_index: self.block_index,
            block_type: self.block_type,
            content: self.content,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: String,
    conv_uid: String,
    schema_id: String,
    status: String,
    total_blocks: i64,
    completed_blocks: i64,
    failed_blocks: i64,
    max_attempts: i64,
    model_config: Option<String>,
    started_at: i64,
    completed_at: Option<i64>,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| StorageError::Corrupt(format!("run status {}", self.status)))?;
        Ok(Run {
            run_id: Id::from_string(self.run_id),
            conv_uid: self.conv_uid,
            schema_id: self.schema_id,
            status,
            total_blocks: self.total_blocks as u32,
            completed_blocks: self.completed_blocks as u32,
            failed_blocks: self.failed_blocks as u32,
            max_attempts: self.max_attempts as u32,
            model_config: parse_json(self.model_config)?,
            started_at: timestamp(self.started_at),
            completed_at: self.completed_at.map(timestamp),
        })
    }
}

#[derive(sqlx::FromRow)]
struct OverlayRow {
    run_id: String,
    block_uid: String,
    block_index: i64,
    status: String,
    staging_payload: Option<String>,
    confirmed_payload: Option<String>,
    claimed_by: Option<String>,
    claimed_at: Option<i64>,
    lease_ms: Option<i64>,
    attempt_count: i64,
    retry_base: i64,
    last_error: Option<String>,
    confirmed_by: Option<String>,
    confirmed_at: Option<i64>,
    revision: i64,
    updated_at: i64,
}

impl OverlayRow {
    fn into_overlay(self) -> Result<BlockOverlay> {
        let status = OverlayStatus::parse(&self.status)
            .ok_or_else(|| StorageError::Corrupt(format!("overlay status {}", self.status)))?;
        Ok(BlockOverlay {
            run_id: Id::from_string(self.run_id),
            block_uid: self.block_uid,
            block_index: self.block_index,
            status,
            staging_payload: parse_json(self.staging_payload)?,
            confirmed_payload: parse_json(self.confirmed_payload)?,
            claimed_by: self.claimed_by,
            claimed_at: self.claimed_at.map(timestamp),
            lease_ms: self.lease_ms.map(|ms| ms.max(0) as u64),
            attempt_count: self.attempt_count as u32,
            retry_base: self.retry_base as u32,
            last_error: self.last_error,
            confirmed_by: self.confirmed_by,
            confirmed_at: self.confirmed_at.map(timestamp),
            revision: self.revision as u64,
            updated_at: timestamp(self.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    seq: i64,
    run_id: String,
    block_uid: String,
    kind: String,
    from_status: String,
    overlay_json: String,
    run_json: String,
    committed_at: i64,
}

impl EventRow {
    fn into_transition(self) -> Result<OverlayTransition> {
        let kind = TransitionKind::parse(&self.kind)
            .ok_or_else(|| StorageError::Corrupt(format!("event kind {}", self.kind)))?;
        let from_status = OverlayStatus::parse(&self.from_status)
            .ok_or_else(|| StorageError::Corrupt(format!("event status {}", self.from_status)))?;
        let run: RunProgress = serde_json::from_str(&self.run_json)?;
        Ok(OverlayTransition {
            seq: self.seq as u64,
            run_id: Id::from_string(self.run_id),
            block_uid: self.block_uid,
            kind,
            from_status,
            overlay: serde_json::from_str(&self.overlay_json)?,
            run,
            committed_at: timestamp(self.committed_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use annot_core::transition::{plan, Command, Outcome, TransitionContext};
    use serde_json::json;
    use tempfile::TempDir;

    struct TestStorage {
        storage: Storage,
        _dir: TempDir, // Keep alive to prevent cleanup
    }

    async fn create_test_storage() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestStorage { storage, _dir: dir }
    }

    fn blocks(n: i64) -> Vec<Block> {
        (0..n)
            .map(|i| Block {
                block_uid: format!("b{i}"),
                block_index: i,
                block_type: "paragraph".to_string(),
                content: format!("block {i}"),
            })
            .collect()
    }

    async fn create_test_run(storage: &Storage, n: i64) -> Run {
        let now = Utc::now();
        let run = Run {
            run_id: Id::new(),
            conv_uid: "doc-1".to_string(),
            schema_id: "schema-1".to_string(),
            status: RunStatus::Running,
            total_blocks: n as u32,
            completed_blocks: 0,
            failed_blocks: 0,
            max_attempts: 3,
            model_config: Some(json!({"model": "small"})),
            started_at: now,
            completed_at: None,
        };
        let overlays: Vec<BlockOverlay> = blocks(n)
            .iter()
            .map(|b| BlockOverlay::pending(&run.run_id, b, now))
            .collect();
        storage.create_run(&run, &overlays).await.unwrap();
        run
    }

    fn ctx() -> TransitionContext {
        TransitionContext {
            now: Utc::now(),
            max_attempts: 3,
            allow_reopen_confirmed: false,
        }
    }

    fn claim_cmd(worker_id: &str, lease: Duration) -> Command {
        Command::Claim {
            worker_id: worker_id.to_string(),
            lease,
        }
    }

    fn planned(overlay: &BlockOverlay, command: Command) -> Transition {
        match plan(overlay, &command, &ctx()).unwrap() {
            Outcome::Apply(t) => t,
            Outcome::Unchanged => panic!("expected a state change"),
        }
    }

    #[tokio::test]
    async fn migrate_embedded_is_idempotent() {
        let ts = create_test_storage().await;
        ts.storage.migrate_embedded().await.unwrap();
        create_test_run(&ts.storage, 1).await;
    }

    #[tokio::test]
    async fn insert_blocks_ignores_existing() {
        let ts = create_test_storage().await;
        let mut input = blocks(3);
        input.reverse();
        assert_eq!(ts.storage.insert_blocks("doc-1", &input).await.unwrap(), 3);
        let listed = ts.storage.list_blocks("doc-1").await.unwrap();
        let uids: Vec<&str> = listed.iter().map(|b| b.block_uid.as_str()).collect();
        assert_eq!(uids, vec!["b0", "b1", "b2"]);

        let mut changed = blocks(1);
        changed[0].content = "rewritten".to_string();
        assert_eq!(ts.storage.insert_blocks("doc-1", &changed).await.unwrap(), 0);
        let listed = ts.storage.list_blocks("doc-1").await.unwrap();
        assert_eq!(listed[0].content, "block 0");
    }

    #[tokio::test]
    async fn create_and_get_run() {
        let ts = create_test_storage().await;
        let run = create_test_run(&ts.storage, 2).await;
        let retrieved = ts.storage.get_run(&run.run_id).await.unwrap();
        assert_eq!(retrieved.run_id, run.run_id);
        assert_eq!(retrieved.total_blocks, 2);
        assert_eq!(retrieved.model_config, Some(json!({"model": "small"})));

        let overlays = ts.storage.list_overlays(&run.run_id).await.unwrap();
        assert_eq!(overlays.len(), 2);
        assert!(overlays.iter().all(|o| o.status == OverlayStatus::Pending));
    }

    #[tokio::test]
    async fn get_missing_run_is_not_found() {
        let ts = create_test_storage().await;
        let err = ts.storage.get_run(&Id::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn commit_transition_writes_overlay_run_and_outbox() {
        let ts = create_test_storage().await;
        let run = create_test_run(&ts.storage, 1).await;
        let overlay = ts.storage.get_overlay(&run.run_id, "b0").await.unwrap();

        let claim = planned(&overlay, claim_cmd("w1", Duration::from_secs(300)));
        let event = ts.storage.commit_transition(&claim).await.unwrap();
        assert_eq!(event.seq, 1);
        assert_eq!(event.overlay.status, OverlayStatus::Claimed);

        let success = planned(
            &event.overlay,
            Command::ReportSuccess {
                expected_attempt: 1,
                staging_payload: json!({"label": "x"}),
            },
        );
        let event = ts.storage.commit_transition(&success).await.unwrap();
        let confirm = planned(
            &event.overlay,
            Command::Confirm {
                confirmed_by: "reviewer".to_string(),
                payload: None,
            },
        );
        let event = ts.storage.commit_transition(&confirm).await.unwrap();
        assert_eq!(event.run.status, RunStatus::Complete);

        let stored = ts.storage.get_run(&run.run_id).await.unwrap();
        assert_eq!(stored.completed_blocks, 1);
        assert_eq!(stored.status, RunStatus::Complete);
        assert!(stored.completed_at.is_some());

        let events = ts.storage.events_after(0, 10).await.unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(events[2].kind, TransitionKind::Confirm);
    }

    #[tokio::test]
    async fn commit_transition_rejects_stale_before() {
        let ts = create_test_storage().await;
        let run = create_test_run(&ts.storage, 1).await;
        let overlay = ts.storage.get_overlay(&run.run_id, "b0").await.unwrap();

        let first = planned(&overlay, claim_cmd("w1", Duration::from_secs(300)));
        let second = planned(&overlay, claim_cmd("w2", Duration::from_secs(300)));
        ts.storage.commit_transition(&first).await.unwrap();
        let err = ts.storage.commit_transition(&second).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));

        let stored = ts.storage.get_overlay(&run.run_id, "b0").await.unwrap();
        assert_eq!(stored.claimed_by.as_deref(), Some("w1"));
        assert_eq!(ts.storage.latest_seq().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelled_run_refuses_claims() {
        let ts = create_test_storage().await;
        let run = create_test_run(&ts.storage, 1).await;
        assert!(ts.storage.cancel_run(&run.run_id).await.unwrap());
        assert!(!ts.storage.cancel_run(&run.run_id).await.unwrap());

        let overlay = ts.storage.get_overlay(&run.run_id, "b0").await.unwrap();
        let claim = planned(&overlay, claim_cmd("w1", Duration::from_secs(300)));
        let err = ts.storage.commit_transition(&claim).await.unwrap_err();
        assert!(matches!(err, StorageError::RunCancelled(_)));
    }

    #[tokio::test]
    async fn claim_candidates_follow_block_order() {
        let ts = create_test_storage().await;
        let run = create_test_run(&ts.storage, 3).await;
        let candidates = ts
            .storage
            .claim_candidates(&run.run_id, 3, Utc::now(), 2)
            .await
            .unwrap();
        let uids: Vec<&str> = candidates.iter().map(|o| o.block_uid.as_str()).collect();
        assert_eq!(uids, vec!["b0", "b1"]);
    }

    #[tokio::test]
    async fn expired_claims_are_judged_by_their_own_lease() {
        let ts = create_test_storage().await;
        let run = create_test_run(&ts.storage, 2).await;
        let b0 = ts.storage.get_overlay(&run.run_id, "b0").await.unwrap();
        let b1 = ts.storage.get_overlay(&run.run_id, "b1").await.unwrap();
        let short = planned(&b0, claim_cmd("w1", Duration::from_secs(1)));
        let long = planned(&b1, claim_cmd("w1", Duration::from_secs(300)));
        ts.storage.commit_transition(&short).await.unwrap();
        ts.storage.commit_transition(&long).await.unwrap();

        let stored = ts.storage.get_overlay(&run.run_id, "b0").await.unwrap();
        assert_eq!(stored.lease_ms, Some(1000));

        let later = Utc::now() + chrono::Duration::seconds(5);
        let candidates = ts
            .storage
            .claim_candidates(&run.run_id, 3, later, 10)
            .await
            .unwrap();
        let uids: Vec<&str> = candidates.iter().map(|o| o.block_uid.as_str()).collect();
        assert_eq!(uids, vec!["b0"]);
        // First attempts are never final.
        assert!(ts.storage.expired_final_claims(later, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_reports_high_water_mark_after_prune() {
        let ts = create_test_storage().await;
        let run = create_test_run(&ts.storage, 2).await;
        for uid in ["b0", "b1"] {
            let overlay = ts.storage.get_overlay(&run.run_id, uid).await.unwrap();
            let claim = planned(&overlay, claim_cmd("w1", Duration::from_secs(300)));
            ts.storage.commit_transition(&claim).await.unwrap();
        }
        assert_eq!(ts.storage.prune_events(2).await.unwrap(), 2);

        let snapshot = ts.storage.snapshot(&run.run_id).await.unwrap();
        assert_eq!(snapshot.seq, 2);
        assert_eq!(snapshot.overlays.len(), 2);
        assert!(ts.storage.events_after(0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_run_removes_everything() {
        let ts = create_test_storage().await;
        let run = create_test_run(&ts.storage, 2).await;
        ts.storage.delete_run(&run.run_id).await.unwrap();
        assert!(matches!(
            ts.storage.get_run(&run.run_id).await,
            Err(StorageError::RunNotFound(_))
        ));
        assert!(ts.storage.list_overlays(&run.run_id).await.unwrap().is_empty());
        assert!(matches!(
            ts.storage.delete_run(&run.run_id).await,
            Err(StorageError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn repair_counters_rederives_status() {
        let ts = create_test_storage().await;
        let run = create_test_run(&ts.storage, 1).await;
        let repaired = ts
            .storage
            .repair_counters(
                &run.run_id,
                Recount {
                    total_blocks: 1,
                    completed_blocks: 1,
                    failed_blocks: 0,
                },
            )
            .await
            .unwrap();
        assert_eq!(repaired.status, RunStatus::Complete);
        let stored = ts.storage.get_run(&run.run_id).await.unwrap();
        assert_eq!(stored.completed_blocks, 1);
    }
}
