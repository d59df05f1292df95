//! Run counter and status derivation.
//!
//! Counters are changed only by deltas computed from an overlay's before and
//! after state, inside the same commit as the overlay write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{BlockOverlay, OverlayStatus, Run, RunStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregateError {
    #[error("counter underflow: {field} would drop below zero")]
    Underflow { field: &'static str },
    #[error("counter overflow: completed {completed} + failed {failed} exceeds total {total}")]
    Overflow {
        completed: u32,
        failed: u32,
        total: u32,
    },
}

/// Counter view of a run carried alongside every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub status: RunStatus,
    pub total_blocks: u32,
    pub completed_blocks: u32,
    pub failed_blocks: u32,
}

impl Run {
    pub fn progress(&self) -> RunProgress {
        RunProgress {
            status: self.status,
            total_blocks: self.total_blocks,
            completed_blocks: self.completed_blocks,
            failed_blocks: self.failed_blocks,
        }
    }

    /// Blocks that reached a terminal outcome.
    pub fn settled_blocks(&self) -> u32 {
        self.completed_blocks + self.failed_blocks
    }
}

/// Signed change to a run's counters from one overlay transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunDelta {
    pub completed: i64,
    pub failed: i64,
}

impl RunDelta {
    pub fn between(before: &BlockOverlay, after: &BlockOverlay, max_attempts: u32) -> Self {
        let (c0, f0) = counted(before, max_attempts);
        let (c1, f1) = counted(after, max_attempts);
        Self {
            completed: c1 - c0,
            failed: f1 - f0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.completed == 0 && self.failed == 0
    }
}

fn counted(overlay: &BlockOverlay, max_attempts: u32) -> (i64, i64) {
    match overlay.status {
        OverlayStatus::Confirmed => (1, 0),
        _ if overlay.is_exhausted(max_attempts) => (0, 1),
        _ => (0, 0),
    }
}

fn shift(value: u32, by: i64, field: &'static str) -> Result<u32, AggregateError> {
    let next = i64::from(value) + by;
    u32::try_from(next).map_err(|_| AggregateError::Underflow { field })
}

/// Applies a delta and re-derives the run status.
///
/// Cancelled and externally failed runs keep their status; only the counters
/// move.
pub fn apply_delta(run: &mut Run, delta: RunDelta, now: DateTime<Utc>) -> Result<(), AggregateError> {
    let completed = shift(run.completed_blocks, delta.completed, "completed_blocks")?;
    let failed = shift(run.failed_blocks, delta.failed, "failed_blocks")?;
    if completed + failed > run.total_blocks {
        return Err(AggregateError::Overflow {
            completed,
            failed,
            total: run.total_blocks,
        });
    }
    run.completed_blocks = completed;
    run.failed_blocks = failed;
    derive_status(run, now);
    Ok(())
}

/// Running flips to complete once every block is settled. A complete run whose
/// counters drop (reopen or regenerate) goes back to running.
pub fn derive_status(run: &mut Run, now: DateTime<Utc>) {
    let settled = run.settled_blocks() == run.total_blocks;
    match run.status {
        RunStatus::Running if settled => {
            run.status = RunStatus::Complete;
            run.completed_at = Some(now);
        }
        RunStatus::Complete if !settled => {
            run.status = RunStatus::Running;
            run.completed_at = None;
        }
        _ => {}
    }
}

/// Counter values recomputed from scratch; used by audits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recount {
    pub total_blocks: u32,
    pub completed_blocks: u32,
    pub failed_blocks: u32,
}

pub fn recount<'a>(overlays: impl IntoIterator<Item = &'a BlockOverlay>, max_attempts: u32) -> Recount {
    let mut out = Recount::default();
    for overlay in overlays {
        out.total_blocks += 1;
        match counted(overlay, max_attempts) {
            (1, _) => out.completed_blocks += 1,
            (_, 1) => out.failed_blocks += 1,
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Block, Id};
    use serde_json::json;

    fn run(total: u32) -> Run {
        Run {
            run_id: Id::new(),
            conv_uid: "doc".to_string(),
            schema_id: "schema".to_string(),
            status: RunStatus::Running,
            total_blocks: total,
            completed_blocks: 0,
            failed_blocks: 0,
            max_attempts: 3,
            model_config: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    fn overlay(status: OverlayStatus, attempts: u32) -> BlockOverlay {
        let block = Block {
            block_uid: "b1".to_string(),
            block_index: 0,
            block_type: "p".to_string(),
            content: String::new(),
        };
        let mut o = BlockOverlay::pending(&Id::new(), &block, Utc::now());
        o.status = status;
        o.attempt_count = attempts;
        if status == OverlayStatus::Confirmed {
            o.confirmed_payload = Some(json!({}));
        }
        o
    }

    #[test]
    fn confirm_counts_completed() {
        let delta = RunDelta::between(
            &overlay(OverlayStatus::AiComplete, 1),
            &overlay(OverlayStatus::Confirmed, 1),
            3,
        );
        assert_eq!(delta, RunDelta { completed: 1, failed: 0 });
    }

    #[test]
    fn retryable_failure_is_not_counted() {
        let delta = RunDelta::between(
            &overlay(OverlayStatus::Claimed, 1),
            &overlay(OverlayStatus::Failed, 1),
            3,
        );
        assert!(delta.is_zero());
    }

    #[test]
    fn exhausted_failure_counts_failed() {
        let delta = RunDelta::between(
            &overlay(OverlayStatus::Claimed, 3),
            &overlay(OverlayStatus::Failed, 3),
            3,
        );
        assert_eq!(delta, RunDelta { completed: 0, failed: 1 });
    }

    #[test]
    fn regenerate_from_exhausted_uncounts_failed() {
        let delta = RunDelta::between(
            &overlay(OverlayStatus::Failed, 3),
            &overlay(OverlayStatus::Claimed, 4),
            3,
        );
        assert_eq!(delta, RunDelta { completed: 0, failed: -1 });
    }

    #[test]
    fn run_completes_when_all_settled() {
        let mut r = run(2);
        let now = Utc::now();
        apply_delta(&mut r, RunDelta { completed: 1, failed: 0 }, now).unwrap();
        assert_eq!(r.status, RunStatus::Running);
        apply_delta(&mut r, RunDelta { completed: 0, failed: 1 }, now).unwrap();
        assert_eq!(r.status, RunStatus::Complete);
        assert_eq!(r.completed_at, Some(now));
    }

    #[test]
    fn reopen_returns_complete_run_to_running() {
        let mut r = run(1);
        let now = Utc::now();
        apply_delta(&mut r, RunDelta { completed: 1, failed: 0 }, now).unwrap();
        assert_eq!(r.status, RunStatus::Complete);
        apply_delta(&mut r, RunDelta { completed: -1, failed: 0 }, now).unwrap();
        assert_eq!(r.status, RunStatus::Running);
        assert!(r.completed_at.is_none());
    }

    #[test]
    fn cancelled_run_keeps_status() {
        let mut r = run(1);
        r.status = RunStatus::Cancelled;
        apply_delta(&mut r, RunDelta { completed: 1, failed: 0 }, Utc::now()).unwrap();
        assert_eq!(r.status, RunStatus::Cancelled);
        assert_eq!(r.completed_blocks, 1);
    }

    #[test]
    fn delta_rejects_underflow_and_overflow() {
        let mut r = run(1);
        let err = apply_delta(&mut r, RunDelta { completed: -1, failed: 0 }, Utc::now());
        assert!(matches!(err, Err(AggregateError::Underflow { .. })));

        let err = apply_delta(&mut r, RunDelta { completed: 1, failed: 1 }, Utc::now());
        assert!(matches!(err, Err(AggregateError::Overflow { .. })));
        assert_eq!(r.completed_blocks, 0);
    }

    #[test]
    fn recount_matches_outcomes() {
        let overlays = vec![
            overlay(OverlayStatus::Confirmed, 1),
            overlay(OverlayStatus::Failed, 3),
            overlay(OverlayStatus::Failed, 1),
            overlay(OverlayStatus::Pending, 0),
        ];
        let counts = recount(&overlays, 3);
        assert_eq!(
            counts,
            Recount {
                total_blocks: 4,
                completed_blocks: 1,
                failed_blocks: 1
            }
        );
    }
}
