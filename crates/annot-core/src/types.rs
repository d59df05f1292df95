//! Core types for the block annotation run engine.
//!
//! Runs, blocks and per-(run, block) overlays as persisted by the daemon and
//! mirrored by viewers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for runs.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Complete,
    /// Set only by external tooling; the engine never produces it.
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Status is owned by the aggregator only while running or complete.
    pub fn is_aggregated(&self) -> bool {
        matches!(self, Self::Running | Self::Complete)
    }
}

/// Per-(run, block) annotation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayStatus {
    Pending,
    Claimed,
    AiComplete,
    Confirmed,
    Failed,
}

impl OverlayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::AiComplete => "ai_complete",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "claimed" => Some(Self::Claimed),
            "ai_complete" => Some(Self::AiComplete),
            "confirmed" => Some(Self::Confirmed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OverlayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Core Types ---

/// An immutable, ordered unit of a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub block_uid: String,
    pub block_index: i64,
    pub block_type: String,
    pub content: String,
}

/// One application of one schema to one document's blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Id,
    /// Document the blocks were read from.
    pub conv_uid: String,
    pub schema_id: String,
    pub status: RunStatus,
    pub total_blocks: u32,
    pub completed_blocks: u32,
    pub failed_blocks: u32,
    /// Retry budget, fixed when the run is created.
    pub max_attempts: u32,
    /// Opaque model settings handed to workers.
    pub model_config: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The mutable per-(run, block) annotation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockOverlay {
    pub run_id: Id,
    pub block_uid: String,
    /// Copied from the block at run creation; drives claim order.
    pub block_index: i64,
    pub status: OverlayStatus,
    /// Unreviewed AI output.
    pub staging_payload: Option<Value>,
    /// Human-approved output.
    pub confirmed_payload: Option<Value>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Lease granted with the current claim, in milliseconds.
    #[serde(default)]
    pub lease_ms: Option<u64>,
    /// Incremented on every claim, never reset.
    pub attempt_count: u32,
    /// `attempt_count` when a human last sent the block back. The retry
    /// budget counts only attempts after it.
    #[serde(default)]
    pub retry_base: u32,
    pub last_error: Option<String>,
    pub confirmed_by: Option<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Row version, bumped by every committed transition.
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl BlockOverlay {
    /// Fresh overlay for a block at run creation.
    pub fn pending(run_id: &Id, block: &Block, now: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.clone(),
            block_uid: block.block_uid.clone(),
            block_index: block.block_index,
            status: OverlayStatus::Pending,
            staging_payload: None,
            confirmed_payload: None,
            claimed_by: None,
            claimed_at: None,
            lease_ms: None,
            attempt_count: 0,
            retry_base: 0,
            last_error: None,
            confirmed_by: None,
            confirmed_at: None,
            revision: 0,
            updated_at: now,
        }
    }

    /// True when the overlay is claimed and the lease granted with the claim
    /// has run out.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        if self.status != OverlayStatus::Claimed {
            return false;
        }
        let (Some(at), Some(lease_ms)) = (self.claimed_at, self.lease_ms) else {
            return false;
        };
        let lease_ms = i64::try_from(lease_ms).unwrap_or(i64::MAX);
        (now - at).num_milliseconds() > lease_ms
    }

    /// The lease of the current claim.
    pub fn lease(&self) -> Option<Duration> {
        self.lease_ms.map(Duration::from_millis)
    }

    /// Attempts counted against the retry budget.
    pub fn attempts_used(&self) -> u32 {
        self.attempt_count.saturating_sub(self.retry_base)
    }

    /// The retry budget is spent; another failure or lost lease is final.
    pub fn attempts_spent(&self, max_attempts: u32) -> bool {
        self.attempts_used() >= max_attempts
    }

    /// Failed with no attempts left; needs a human to regenerate.
    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.status == OverlayStatus::Failed && self.attempts_spent(max_attempts)
    }

    /// Returns a description of the first violated field invariant, if any.
    pub fn invariant_violation(&self) -> Option<&'static str> {
        let claimed = self.status == OverlayStatus::Claimed;
        if claimed != self.claimed_by.is_some() {
            return Some("claimed_by must be set iff status is claimed");
        }
        if claimed != self.claimed_at.is_some() {
            return Some("claimed_at must be set iff status is claimed");
        }
        if claimed != self.lease_ms.is_some() {
            return Some("lease_ms must be set iff status is claimed");
        }
        if self.retry_base > self.attempt_count {
            return Some("retry_base must not exceed attempt_count");
        }
        if (self.status == OverlayStatus::Confirmed) != self.confirmed_payload.is_some() {
            return Some("confirmed_payload must be set iff status is confirmed");
        }
        None
    }
}
