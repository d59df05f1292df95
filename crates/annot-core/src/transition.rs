//! Overlay state machine.
//!
//! `plan` validates one command against the current overlay and produces the
//! next overlay plus the counter delta. It performs no I/O; the daemon commits
//! the result with a compare-and-swap on `(status, attempt_count, revision)`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::aggregate::RunDelta;
use crate::types::{BlockOverlay, OverlayStatus};

/// Error recorded when a claim outlives its lease on its final attempt.
pub const LEASE_EXPIRED_ERROR: &str = "lease expired";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot {action}: overlay is {actual} at attempt {attempt}")]
    Stale {
        action: &'static str,
        actual: OverlayStatus,
        attempt: u32,
    },
    #[error("retry limit exceeded: {attempts} of {max_attempts} attempts used")]
    RetryLimitExceeded { attempts: u32, max_attempts: u32 },
    #[error("reopening confirmed overlays is disabled")]
    ReopenDisabled,
    #[error("nothing to confirm: overlay has no staged output")]
    MissingPayload,
}

/// What kind of edge a committed transition took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Claim,
    Retry,
    Reclaim,
    ReportSuccess,
    ReportFailure,
    Confirm,
    EditStaging,
    Regenerate,
    Reopen,
    LeaseExpired,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Retry => "retry",
            Self::Reclaim => "reclaim",
            Self::ReportSuccess => "report_success",
            Self::ReportFailure => "report_failure",
            Self::Confirm => "confirm",
            Self::EditStaging => "edit_staging",
            Self::Regenerate => "regenerate",
            Self::Reopen => "reopen",
            Self::LeaseExpired => "lease_expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "claim" => Some(Self::Claim),
            "retry" => Some(Self::Retry),
            "reclaim" => Some(Self::Reclaim),
            "report_success" => Some(Self::ReportSuccess),
            "report_failure" => Some(Self::ReportFailure),
            "confirm" => Some(Self::Confirm),
            "edit_staging" => Some(Self::EditStaging),
            "regenerate" => Some(Self::Regenerate),
            "reopen" => Some(Self::Reopen),
            "lease_expired" => Some(Self::LeaseExpired),
            _ => None,
        }
    }

    /// Edges that hand the overlay to someone for a new attempt. These are
    /// refused on cancelled runs.
    pub fn starts_attempt(&self) -> bool {
        matches!(
            self,
            Self::Claim | Self::Retry | Self::Reclaim | Self::Regenerate | Self::Reopen
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Claim { worker_id: String, lease: Duration },
    ReportSuccess { expected_attempt: u32, staging_payload: Value },
    ReportFailure { expected_attempt: u32, error: String },
    Confirm { confirmed_by: String, payload: Option<Value> },
    EditStaging { payload: Value },
    /// `lease` bounds the requester's own attempt. A zero lease hands the
    /// block straight back to the worker pool.
    Regenerate { requested_by: String, lease: Duration },
    Reopen { requested_by: String, lease: Duration },
    ExpireLease,
}

impl Command {
    fn action(&self) -> &'static str {
        match self {
            Self::Claim { .. } => "claim",
            Self::ReportSuccess { .. } => "report success",
            Self::ReportFailure { .. } => "report failure",
            Self::Confirm { .. } => "confirm",
            Self::EditStaging { .. } => "edit staging",
            Self::Regenerate { .. } => "regenerate",
            Self::Reopen { .. } => "reopen",
            Self::ExpireLease => "expire lease",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransitionContext {
    pub now: DateTime<Utc>,
    pub max_attempts: u32,
    pub allow_reopen_confirmed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub kind: TransitionKind,
    pub before: BlockOverlay,
    pub after: BlockOverlay,
    pub delta: RunDelta,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Apply(Transition),
    /// Accepted with no state change (duplicate confirm).
    Unchanged,
}

pub fn plan(
    current: &BlockOverlay,
    command: &Command,
    ctx: &TransitionContext,
) -> Result<Outcome, TransitionError> {
    let stale = || TransitionError::Stale {
        action: command.action(),
        actual: current.status,
        attempt: current.attempt_count,
    };
    let mut next = current.clone();

    let kind = match command {
        Command::Claim { worker_id, lease } => {
            let kind = match current.status {
                OverlayStatus::Pending => TransitionKind::Claim,
                OverlayStatus::Failed => TransitionKind::Retry,
                OverlayStatus::Claimed if current.lease_expired(ctx.now) => TransitionKind::Reclaim,
                _ => return Err(stale()),
            };
            if kind != TransitionKind::Claim && current.attempts_spent(ctx.max_attempts) {
                return Err(TransitionError::RetryLimitExceeded {
                    attempts: current.attempts_used(),
                    max_attempts: ctx.max_attempts,
                });
            }
            claim(&mut next, worker_id, *lease, ctx.now);
            kind
        }
        Command::ReportSuccess {
            expected_attempt,
            staging_payload,
        } => {
            if current.status != OverlayStatus::Claimed
                || current.attempt_count != *expected_attempt
            {
                return Err(stale());
            }
            release(&mut next);
            next.status = OverlayStatus::AiComplete;
            next.staging_payload = Some(staging_payload.clone());
            next.last_error = None;
            TransitionKind::ReportSuccess
        }
        Command::ReportFailure {
            expected_attempt,
            error,
        } => {
            if current.status != OverlayStatus::Claimed
                || current.attempt_count != *expected_attempt
            {
                return Err(stale());
            }
            release(&mut next);
            next.status = OverlayStatus::Failed;
            next.last_error = Some(error.clone());
            TransitionKind::ReportFailure
        }
        Command::Confirm {
            confirmed_by,
            payload,
        } => match current.status {
            OverlayStatus::Confirmed => return Ok(Outcome::Unchanged),
            OverlayStatus::AiComplete => {
                let approved = payload
                    .clone()
                    .or_else(|| current.staging_payload.clone())
                    .ok_or(TransitionError::MissingPayload)?;
                next.status = OverlayStatus::Confirmed;
                next.confirmed_payload = Some(approved);
                next.confirmed_by = Some(confirmed_by.clone());
                next.confirmed_at = Some(ctx.now);
                TransitionKind::Confirm
            }
            _ => return Err(stale()),
        },
        Command::EditStaging { payload } => {
            if current.status != OverlayStatus::AiComplete {
                return Err(stale());
            }
            next.staging_payload = Some(payload.clone());
            TransitionKind::EditStaging
        }
        Command::Regenerate {
            requested_by,
            lease,
        } => {
            let allowed = current.status == OverlayStatus::AiComplete
                || current.is_exhausted(ctx.max_attempts);
            if !allowed {
                return Err(stale());
            }
            claim(&mut next, requested_by, *lease, ctx.now);
            // Human-granted attempt; workers get a full budget after it.
            next.retry_base = next.attempt_count;
            TransitionKind::Regenerate
        }
        Command::Reopen {
            requested_by,
            lease,
        } => {
            if current.status != OverlayStatus::Confirmed {
                return Err(stale());
            }
            if !ctx.allow_reopen_confirmed {
                return Err(TransitionError::ReopenDisabled);
            }
            next.confirmed_payload = None;
            next.confirmed_by = None;
            next.confirmed_at = None;
            claim(&mut next, requested_by, *lease, ctx.now);
            next.retry_base = next.attempt_count;
            TransitionKind::Reopen
        }
        Command::ExpireLease => {
            if !current.lease_expired(ctx.now) {
                return Err(stale());
            }
            release(&mut next);
            next.status = OverlayStatus::Failed;
            next.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
            TransitionKind::LeaseExpired
        }
    };

    next.revision = current.revision + 1;
    next.updated_at = ctx.now;
    let delta = RunDelta::between(current, &next, ctx.max_attempts);

    Ok(Outcome::Apply(Transition {
        kind,
        before: current.clone(),
        after: next,
        delta,
    }))
}

fn claim(overlay: &mut BlockOverlay, owner: &str, lease: Duration, now: DateTime<Utc>) {
    overlay.status = OverlayStatus::Claimed;
    overlay.claimed_by = Some(owner.to_string());
    overlay.claimed_at = Some(now);
    overlay.lease_ms = Some(u64::try_from(lease.as_millis()).unwrap_or(u64::MAX));
    overlay.attempt_count += 1;
}

fn release(overlay: &mut BlockOverlay) {
    overlay.claimed_by = None;
    overlay.claimed_at = None;
    overlay.lease_ms = None;
}
