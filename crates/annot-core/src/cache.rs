//! Client-side projection of a run's overlays.
//!
//! A viewer seeds the cache from a snapshot and then merges streamed
//! transitions. Merges are keyed by `block_uid` and guarded by `seq`, so
//! duplicates and deliveries older than the snapshot are dropped.

use std::collections::HashMap;

use crate::aggregate::RunProgress;
use crate::events::{OverlayTransition, RunSnapshot};
use crate::types::{BlockOverlay, Id, OverlayStatus};

/// Result of merging one streamed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already reflected by the snapshot or an earlier transition.
    Stale,
    /// Would move a confirmed overlay back to pending or claimed without a
    /// newer attempt.
    Backwards,
    /// No snapshot entry for the block; the cache asks for a refresh.
    UnknownBlock,
    /// No snapshot loaded since the last disconnect.
    AwaitingSnapshot,
    WrongRun,
}

#[derive(Debug, Clone)]
struct Entry {
    overlay: BlockOverlay,
    last_seq: u64,
}

#[derive(Debug, Clone)]
pub struct OverlayCache {
    run_id: Id,
    entries: HashMap<String, Entry>,
    progress: Option<RunProgress>,
    progress_seq: u64,
    snapshot_seq: Option<u64>,
    refresh_due: bool,
}

impl OverlayCache {
    pub fn new(run_id: Id) -> Self {
        Self {
            run_id,
            entries: HashMap::new(),
            progress: None,
            progress_seq: 0,
            snapshot_seq: None,
            refresh_due: false,
        }
    }

    pub fn run_id(&self) -> &Id {
        &self.run_id
    }

    /// Replaces the whole map. Called on initial subscribe and on every
    /// resubscribe.
    pub fn apply_snapshot(&mut self, snapshot: RunSnapshot) {
        self.entries = snapshot
            .overlays
            .into_iter()
            .map(|overlay| {
                (
                    overlay.block_uid.clone(),
                    Entry {
                        overlay,
                        last_seq: snapshot.seq,
                    },
                )
            })
            .collect();
        self.progress = Some(snapshot.run.progress());
        self.progress_seq = snapshot.seq;
        self.snapshot_seq = Some(snapshot.seq);
        self.refresh_due = false;
    }

    pub fn apply_transition(&mut self, event: &OverlayTransition) -> ApplyOutcome {
        if event.run_id != self.run_id {
            return ApplyOutcome::WrongRun;
        }
        let Some(snapshot_seq) = self.snapshot_seq else {
            return ApplyOutcome::AwaitingSnapshot;
        };
        if event.seq <= snapshot_seq {
            return ApplyOutcome::Stale;
        }
        let Some(entry) = self.entries.get_mut(&event.block_uid) else {
            self.refresh_due = true;
            return ApplyOutcome::UnknownBlock;
        };
        if event.seq <= entry.last_seq {
            return ApplyOutcome::Stale;
        }
        let incoming = &event.overlay;
        let regresses = matches!(
            incoming.status,
            OverlayStatus::Pending | OverlayStatus::Claimed
        );
        if entry.overlay.status == OverlayStatus::Confirmed
            && regresses
            && incoming.attempt_count <= entry.overlay.attempt_count
        {
            return ApplyOutcome::Backwards;
        }

        entry.overlay = incoming.clone();
        entry.last_seq = event.seq;
        if event.seq > self.progress_seq {
            self.progress = Some(event.run);
            self.progress_seq = event.seq;
        }
        ApplyOutcome::Applied
    }

    /// Stream dropped. Transitions are ignored until the next snapshot.
    pub fn mark_disconnected(&mut self) {
        self.snapshot_seq = None;
    }

    pub fn is_live(&self) -> bool {
        self.snapshot_seq.is_some()
    }

    /// Set when a transition named a block the snapshot did not contain.
    pub fn refresh_due(&self) -> bool {
        self.refresh_due
    }

    pub fn get(&self, block_uid: &str) -> Option<&BlockOverlay> {
        self.entries.get(block_uid).map(|e| &e.overlay)
    }

    pub fn progress(&self) -> Option<RunProgress> {
        self.progress
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overlays in block order.
    pub fn ordered(&self) -> Vec<&BlockOverlay> {
        let mut out: Vec<&BlockOverlay> = self.entries.values().map(|e| &e.overlay).collect();
        out.sort_by_key(|o| o.block_index);
        out
    }

    pub fn count(&self, status: OverlayStatus) -> usize {
        self.entries
            .values()
            .filter(|e| e.overlay.status == status)
            .count()
    }
}
