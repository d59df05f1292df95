//! Claim lease manager and overlay operations.
//!
//! Every operation loads the overlay and its run, plans the transition with
//! `annot_core::transition::plan`, and commits it through
//! `Storage::commit_transition`. Concurrent writers race on the row's
//! compare-and-swap; the loser sees `StaleStateConflict`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use annot_core::aggregate::{self, Recount};
use annot_core::transition::{plan, Command, Outcome, TransitionContext, TransitionError};
use annot_core::{
    Block, BlockOverlay, EngineConfig, Id, OverlayStatus, OverlayTransition, Run, RunSnapshot,
    RunStatus,
};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::storage::{Storage, StorageError};

/// Candidate refetches before ClaimNext reports no work.
const CLAIM_ROUNDS: usize = 3;
/// Candidates fetched per ClaimNext round.
const CLAIM_SCAN: u32 = 8;
/// Expired leases handled per reaper pass.
const REAP_LIMIT: u32 = 500;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("stale state: {0}")]
    StaleStateConflict(String),
    #[error("retry limit exceeded: {0}")]
    RetryLimitExceeded(String),
    #[error("run {0} is cancelled")]
    RunCancelled(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("overlay not found: {0}")]
    OverlayNotFound(String),
    #[error("document {0} has no blocks")]
    NoBlocks(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("engine is shutting down")]
    Shutdown,
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::RunNotFound(id) => Self::RunNotFound(id),
            StorageError::OverlayNotFound { run_id, block_uid } => {
                Self::OverlayNotFound(format!("{run_id}/{block_uid}"))
            }
            err @ StorageError::Conflict { .. } => Self::StaleStateConflict(err.to_string()),
            StorageError::RunCancelled(id) => Self::RunCancelled(id),
            other => Self::Storage(other),
        }
    }
}

impl From<TransitionError> for EngineError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::Stale { .. } => Self::StaleStateConflict(err.to_string()),
            TransitionError::RetryLimitExceeded { .. } => Self::RetryLimitExceeded(err.to_string()),
            TransitionError::ReopenDisabled | TransitionError::MissingPayload => {
                Self::InvalidTransition(err.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunRequest {
    pub conv_uid: String,
    pub schema_id: String,
    #[serde(default)]
    pub model_config: Option<Value>,
    /// Overrides the configured retry budget for this run.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmSummary {
    pub confirmed: Vec<String>,
    pub skipped: Vec<SkippedBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedBlock {
    pub block_uid: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub block_uid: String,
    pub problem: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub run_id: Id,
    pub stored: Recount,
    pub actual: Recount,
    pub violations: Vec<InvariantViolation>,
    pub consistent: bool,
    pub repaired: bool,
}

/// One line of a run export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub block: Block,
    pub overlay_status: Option<OverlayStatus>,
    /// Confirmed payload, or `{}` when the block has none.
    pub data: Value,
}

/// Engine state shared by the HTTP layer, the reaper and the relay.
#[derive(Debug)]
pub struct Engine {
    storage: Arc<Storage>,
    config: EngineConfig,
    /// Woken after every commit so the relay publishes without polling.
    commits: Arc<Notify>,
    shutdown: AtomicBool,
}

impl Engine {
    pub fn new(storage: Arc<Storage>, config: EngineConfig) -> Self {
        Self {
            storage,
            config,
            commits: Arc::new(Notify::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn with_defaults(storage: Arc<Storage>) -> Self {
        Self::new(storage, EngineConfig::default())
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Commit notifications for the fan-out relay.
    pub fn commit_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.commits)
    }

    /// Stop handing out new claims. Reports and confirms still land.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    // --- Documents ---

    /// Store the blocks of a document. Blocks are immutable: entries that
    /// already exist are ignored. Returns how many were new.
    pub async fn import_blocks(&self, conv_uid: &str, blocks: Vec<Block>) -> Result<usize> {
        if conv_uid.trim().is_empty() {
            return Err(EngineError::InvalidRequest("conv_uid is required".to_string()));
        }
        let mut uids = HashSet::new();
        let mut indices = HashSet::new();
        for block in &blocks {
            if block.block_uid.is_empty() {
                return Err(EngineError::InvalidRequest("block_uid is required".to_string()));
            }
            if !uids.insert(block.block_uid.as_str()) {
                return Err(EngineError::InvalidRequest(format!(
                    "duplicate block_uid {}",
                    block.block_uid
                )));
            }
            if !indices.insert(block.block_index) {
                return Err(EngineError::InvalidRequest(format!(
                    "duplicate block_index {}",
                    block.block_index
                )));
            }
        }
        let inserted = self.storage.insert_blocks(conv_uid, &blocks).await?;
        info!(conv_uid, received = blocks.len(), inserted, "imported blocks");
        Ok(inserted)
    }

    pub async fn list_blocks(&self, conv_uid: &str) -> Result<Vec<Block>> {
        Ok(self.storage.list_blocks(conv_uid).await?)
    }

    // --- Runs ---

    /// Create a run with one pending overlay per block of the document.
    pub async fn create_run(&self, request: CreateRunRequest) -> Result<Run> {
        if request.schema_id.trim().is_empty() {
            return Err(EngineError::InvalidRequest("schema_id is required".to_string()));
        }
        let max_attempts = request.max_attempts.unwrap_or(self.config.max_attempts);
        if max_attempts == 0 {
            return Err(EngineError::InvalidRequest("max_attempts must be at least 1".to_string()));
        }
        let blocks = self.storage.list_blocks(&request.conv_uid).await?;
        if blocks.is_empty() {
            return Err(EngineError::NoBlocks(request.conv_uid));
        }

        let now = now_millis();
        let run = Run {
            run_id: Id::new(),
            conv_uid: request.conv_uid,
            schema_id: request.schema_id,
            status: RunStatus::Running,
            total_blocks: blocks.len() as u32,
            completed_blocks: 0,
            failed_blocks: 0,
            max_attempts,
            model_config: request.model_config,
            started_at: now,
            completed_at: None,
        };
        let overlays: Vec<BlockOverlay> = blocks
            .iter()
            .map(|block| BlockOverlay::pending(&run.run_id, block, now))
            .collect();
        self.storage.create_run(&run, &overlays).await?;

        info!(
            run_id = %run.run_id,
            conv_uid = %run.conv_uid,
            schema_id = %run.schema_id,
            total_blocks = run.total_blocks,
            "run created"
        );
        Ok(run)
    }

    pub async fn get_run(&self, run_id: &Id) -> Result<Run> {
        Ok(self.storage.get_run(run_id).await?)
    }

    pub async fn list_runs(&self, conv_uid: Option<&str>) -> Result<Vec<Run>> {
        Ok(self.storage.list_runs(conv_uid).await?)
    }

    pub async fn list_overlays(&self, run_id: &Id) -> Result<Vec<BlockOverlay>> {
        self.storage.get_run(run_id).await?;
        Ok(self.storage.list_overlays(run_id).await?)
    }

    pub async fn get_overlay(&self, run_id: &Id, block_uid: &str) -> Result<BlockOverlay> {
        Ok(self.storage.get_overlay(run_id, block_uid).await?)
    }

    pub async fn snapshot(&self, run_id: &Id) -> Result<RunSnapshot> {
        Ok(self.storage.snapshot(run_id).await?)
    }

    /// Cancel a running run. Cancelling twice is a no-op; cancelling a
    /// finished run is an invalid transition.
    pub async fn cancel_run(&self, run_id: &Id) -> Result<Run> {
        if self.storage.cancel_run(run_id).await? {
            info!(run_id = %run_id, "run cancelled");
            return self.get_run(run_id).await;
        }
        let run = self.get_run(run_id).await?;
        match run.status {
            RunStatus::Cancelled => Ok(run),
            status => Err(EngineError::InvalidTransition(format!(
                "{status} -> {}",
                RunStatus::Cancelled
            ))),
        }
    }

    pub async fn delete_run(&self, run_id: &Id) -> Result<()> {
        self.storage.delete_run(run_id).await?;
        info!(run_id = %run_id, "run deleted");
        Ok(())
    }

    // --- Claims ---

    /// Claim the lowest-index claimable overlay for `lease` (the configured
    /// lease when None).
    ///
    /// Returns None when the run has no claimable overlay, is not running, or
    /// every candidate was taken by concurrent claimers for `CLAIM_ROUNDS`
    /// consecutive refetches.
    pub async fn claim_next(
        &self,
        run_id: &Id,
        worker_id: &str,
        lease: Option<Duration>,
    ) -> Result<Option<BlockOverlay>> {
        let mut claimed = self.claim_up_to(run_id, worker_id, lease, 1).await?;
        Ok(claimed.pop())
    }

    /// Claim up to `size` overlays (default and cap from config) in block
    /// order, all under the same lease.
    pub async fn claim_batch(
        &self,
        run_id: &Id,
        worker_id: &str,
        size: Option<u32>,
        lease: Option<Duration>,
    ) -> Result<Vec<BlockOverlay>> {
        let size = self.config.batch_size(size);
        self.claim_up_to(run_id, worker_id, lease, size as usize).await
    }

    async fn claim_up_to(
        &self,
        run_id: &Id,
        worker_id: &str,
        lease: Option<Duration>,
        want: usize,
    ) -> Result<Vec<BlockOverlay>> {
        if self.is_shutdown() {
            return Err(EngineError::Shutdown);
        }
        validate_actor("worker_id", worker_id)?;
        let lease = self.claim_lease(lease)?;
        let run = self.storage.get_run(run_id).await?;
        if run.status != RunStatus::Running {
            debug!(run_id = %run_id, status = %run.status, "run not claimable");
            return Ok(Vec::new());
        }

        let mut claimed = Vec::with_capacity(want);
        let mut lost_rounds = 0;
        while claimed.len() < want && lost_rounds < CLAIM_ROUNDS {
            let scan = CLAIM_SCAN.max((want - claimed.len()) as u32 * 2);
            let candidates = self
                .storage
                .claim_candidates(run_id, run.max_attempts, now_millis(), scan)
                .await?;
            if candidates.is_empty() {
                break;
            }

            let before = claimed.len();
            for candidate in candidates {
                if claimed.len() == want {
                    break;
                }
                let command = Command::Claim {
                    worker_id: worker_id.to_string(),
                    lease,
                };
                match self.apply(&run, &candidate, command).await {
                    Ok(Some(event)) => claimed.push(event.overlay),
                    Ok(None) => {}
                    Err(EngineError::StaleStateConflict(_) | EngineError::RetryLimitExceeded(_)) => {}
                    Err(EngineError::RunCancelled(_)) => return Ok(claimed),
                    Err(e) => return Err(e),
                }
            }
            if claimed.len() == before {
                lost_rounds += 1;
            }
        }

        if !claimed.is_empty() {
            info!(run_id = %run_id, worker_id, count = claimed.len(), "claimed overlays");
        }
        Ok(claimed)
    }

    /// Claim one specific overlay.
    pub async fn claim_block(
        &self,
        run_id: &Id,
        block_uid: &str,
        worker_id: &str,
        lease: Option<Duration>,
    ) -> Result<BlockOverlay> {
        if self.is_shutdown() {
            return Err(EngineError::Shutdown);
        }
        validate_actor("worker_id", worker_id)?;
        let lease = self.claim_lease(lease)?;
        self.transition(
            run_id,
            block_uid,
            Command::Claim {
                worker_id: worker_id.to_string(),
                lease,
            },
        )
        .await
    }

    pub async fn report_success(
        &self,
        run_id: &Id,
        block_uid: &str,
        expected_attempt: u32,
        staging_payload: Value,
    ) -> Result<BlockOverlay> {
        self.transition(
            run_id,
            block_uid,
            Command::ReportSuccess {
                expected_attempt,
                staging_payload,
            },
        )
        .await
    }

    pub async fn report_failure(
        &self,
        run_id: &Id,
        block_uid: &str,
        expected_attempt: u32,
        error: String,
    ) -> Result<BlockOverlay> {
        let overlay = self
            .transition(
                run_id,
                block_uid,
                Command::ReportFailure {
                    expected_attempt,
                    error,
                },
            )
            .await?;
        let run = self.storage.get_run(run_id).await?;
        if overlay.is_exhausted(run.max_attempts) {
            warn!(run_id = %run_id, block_uid, attempts = overlay.attempt_count, "retries exhausted");
        }
        Ok(overlay)
    }

    // --- Review ---

    /// Confirm one overlay. Confirming a confirmed overlay succeeds without
    /// changing it.
    pub async fn confirm(
        &self,
        run_id: &Id,
        block_uid: &str,
        confirmed_by: &str,
        payload: Option<Value>,
    ) -> Result<BlockOverlay> {
        validate_actor("confirmed_by", confirmed_by)?;
        self.transition(
            run_id,
            block_uid,
            Command::Confirm {
                confirmed_by: confirmed_by.to_string(),
                payload,
            },
        )
        .await
    }

    /// Confirm every ai_complete overlay of a run, or only `block_uids`.
    pub async fn confirm_all(
        &self,
        run_id: &Id,
        confirmed_by: &str,
        block_uids: Option<Vec<String>>,
    ) -> Result<ConfirmSummary> {
        validate_actor("confirmed_by", confirmed_by)?;
        let targets: Vec<String> = match block_uids {
            Some(uids) => uids,
            None => self
                .storage
                .list_overlays_with_status(run_id, OverlayStatus::AiComplete)
                .await?
                .into_iter()
                .map(|o| o.block_uid)
                .collect(),
        };

        let mut summary = ConfirmSummary::default();
        for block_uid in targets {
            match self.confirm(run_id, &block_uid, confirmed_by, None).await {
                Ok(_) => summary.confirmed.push(block_uid),
                Err(
                    e @ (EngineError::StaleStateConflict(_)
                    | EngineError::OverlayNotFound(_)
                    | EngineError::InvalidTransition(_)),
                ) => summary.skipped.push(SkippedBlock {
                    block_uid,
                    reason: e.to_string(),
                }),
                Err(e) => return Err(e),
            }
        }
        info!(
            run_id = %run_id,
            confirmed = summary.confirmed.len(),
            skipped = summary.skipped.len(),
            "bulk confirm"
        );
        Ok(summary)
    }

    pub async fn edit_staging(&self, run_id: &Id, block_uid: &str, payload: Value) -> Result<BlockOverlay> {
        self.transition(run_id, block_uid, Command::EditStaging { payload })
            .await
    }

    /// Send an ai_complete or exhausted overlay back for another attempt,
    /// claimed by the requester for `lease`. The requester may run the attempt
    /// itself and report with the returned `attempt_count`; with a zero lease
    /// the next ClaimNext hands it to a worker. Either way the retry budget
    /// starts over.
    pub async fn regenerate(
        &self,
        run_id: &Id,
        block_uid: &str,
        requested_by: &str,
        lease: Option<Duration>,
    ) -> Result<BlockOverlay> {
        validate_actor("requested_by", requested_by)?;
        let lease = lease.unwrap_or_else(|| self.config.lease());
        let overlay = self
            .transition(
                run_id,
                block_uid,
                Command::Regenerate {
                    requested_by: requested_by.to_string(),
                    lease,
                },
            )
            .await?;
        info!(
            run_id = %run_id,
            block_uid,
            requested_by,
            attempt = overlay.attempt_count,
            handed_to_workers = lease.is_zero(),
            "block regenerated"
        );
        Ok(overlay)
    }

    pub async fn reopen(
        &self,
        run_id: &Id,
        block_uid: &str,
        requested_by: &str,
        lease: Option<Duration>,
    ) -> Result<BlockOverlay> {
        validate_actor("requested_by", requested_by)?;
        let lease = lease.unwrap_or_else(|| self.config.lease());
        self.transition(
            run_id,
            block_uid,
            Command::Reopen {
                requested_by: requested_by.to_string(),
                lease,
            },
        )
        .await
    }

    // --- Maintenance ---

    /// Fail final-attempt claims whose lease ran out, so a crashed worker
    /// cannot keep a run from completing. Returns how many were expired.
    pub async fn reap_expired_leases(&self) -> Result<usize> {
        let expired = self
            .storage
            .expired_final_claims(now_millis(), REAP_LIMIT)
            .await?;
        let mut runs: HashMap<Id, Run> = HashMap::new();
        let mut reaped = 0;

        for overlay in expired {
            let run = match runs.get(&overlay.run_id) {
                Some(run) => run.clone(),
                None => {
                    let run = self.storage.get_run(&overlay.run_id).await?;
                    runs.insert(run.run_id.clone(), run.clone());
                    run
                }
            };
            match self.apply(&run, &overlay, Command::ExpireLease).await {
                Ok(Some(event)) => {
                    reaped += 1;
                    info!(
                        run_id = %event.run_id,
                        block_uid = %event.block_uid,
                        claimed_by = overlay.claimed_by.as_deref().unwrap_or("-"),
                        attempt = event.overlay.attempt_count,
                        "lease expired"
                    );
                    runs.insert(run.run_id.clone(), Run {
                        status: event.run.status,
                        completed_blocks: event.run.completed_blocks,
                        failed_blocks: event.run.failed_blocks,
                        ..run
                    });
                }
                Ok(None) => {}
                // Reported or reclaimed since the scan.
                Err(EngineError::StaleStateConflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reaped)
    }

    /// Recount a run from its overlays and compare against the stored
    /// counters. With `repair`, stored counters are overwritten.
    pub async fn audit(&self, run_id: &Id, repair: bool) -> Result<AuditReport> {
        let snapshot = self.storage.snapshot(run_id).await?;
        let run = &snapshot.run;
        let actual = aggregate::recount(&snapshot.overlays, run.max_attempts);
        let stored = Recount {
            total_blocks: run.total_blocks,
            completed_blocks: run.completed_blocks,
            failed_blocks: run.failed_blocks,
        };
        let violations: Vec<InvariantViolation> = snapshot
            .overlays
            .iter()
            .filter_map(|o| {
                o.invariant_violation().map(|problem| InvariantViolation {
                    block_uid: o.block_uid.clone(),
                    problem: problem.to_string(),
                })
            })
            .collect();
        let consistent = actual == stored && violations.is_empty();

        let mut repaired = false;
        if actual != stored {
            warn!(run_id = %run_id, ?stored, ?actual, "run counters drifted");
            if repair {
                self.storage.repair_counters(run_id, actual).await?;
                repaired = true;
                info!(run_id = %run_id, "run counters repaired");
            }
        }

        Ok(AuditReport {
            run_id: run_id.clone(),
            stored,
            actual,
            violations,
            consistent,
            repaired,
        })
    }

    /// One record per block of the run's document, in block order.
    pub async fn export(&self, run_id: &Id) -> Result<Vec<ExportRecord>> {
        let run = self.storage.get_run(run_id).await?;
        let blocks = self.storage.list_blocks(&run.conv_uid).await?;
        let mut overlays: HashMap<String, BlockOverlay> = self
            .storage
            .list_overlays(run_id)
            .await?
            .into_iter()
            .map(|o| (o.block_uid.clone(), o))
            .collect();

        Ok(blocks
            .into_iter()
            .map(|block| {
                let overlay = overlays.remove(&block.block_uid);
                let overlay_status = overlay.as_ref().map(|o| o.status);
                let data = overlay
                    .and_then(|o| o.confirmed_payload)
                    .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
                ExportRecord {
                    block,
                    overlay_status,
                    data,
                }
            })
            .collect())
    }

    // --- Internals ---

    /// Lease for a worker claim. A zero lease would be reclaimable at once.
    fn claim_lease(&self, lease: Option<Duration>) -> Result<Duration> {
        match lease {
            None => Ok(self.config.lease()),
            Some(lease) if lease.is_zero() => Err(EngineError::InvalidRequest(
                "claim lease must be positive".to_string(),
            )),
            Some(lease) => Ok(lease),
        }
    }

    async fn transition(&self, run_id: &Id, block_uid: &str, command: Command) -> Result<BlockOverlay> {
        let run = self.storage.get_run(run_id).await?;
        if run.status == RunStatus::Cancelled
            && matches!(command, Command::Regenerate { .. } | Command::Reopen { .. })
        {
            return Err(EngineError::RunCancelled(run_id.to_string()));
        }
        let overlay = self.storage.get_overlay(run_id, block_uid).await?;
        match self.apply(&run, &overlay, command).await? {
            Some(event) => Ok(event.overlay),
            None => Ok(overlay),
        }
    }

    /// Plan and commit one transition. `Ok(None)` means accepted with no
    /// change.
    async fn apply(&self, run: &Run, overlay: &BlockOverlay, command: Command) -> Result<Option<OverlayTransition>> {
        let ctx = TransitionContext {
            now: now_millis(),
            max_attempts: run.max_attempts,
            allow_reopen_confirmed: self.config.allow_reopen_confirmed,
        };
        let transition = match plan(overlay, &command, &ctx)? {
            Outcome::Apply(transition) => transition,
            Outcome::Unchanged => return Ok(None),
        };

        let event = self.storage.commit_transition(&transition).await?;
        self.commits.notify_one();

        debug!(
            seq = event.seq,
            run_id = %event.run_id,
            block_uid = %event.block_uid,
            kind = event.kind.as_str(),
            from = %event.from_status,
            to = %event.overlay.status,
            attempt = event.overlay.attempt_count,
            "overlay transition"
        );
        if event.run.status != run.status {
            info!(
                run_id = %event.run_id,
                from = %run.status,
                to = %event.run.status,
                completed = event.run.completed_blocks,
                failed = event.run.failed_blocks,
                "run status changed"
            );
        }
        Ok(Some(event))
    }
}

/// Current time truncated to the store's millisecond precision.
fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn validate_actor(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidRequest(format!("{field} is required")));
    }
    Ok(())
}
