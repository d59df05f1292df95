//! Realtime fan-out messages.
//!
//! Every committed overlay transition becomes one `OverlayTransition` with a
//! run-wide sequence number. Subscribers receive a `RunSnapshot` first and
//! then transitions with a higher `seq`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::RunProgress;
use crate::transition::TransitionKind;
use crate::types::{BlockOverlay, Id, OverlayStatus, Run};

/// Stream event names as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    Snapshot,
    Transition,
    /// The subscriber fell behind; it must reconnect and re-snapshot.
    Resync,
}

impl StreamEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Transition => "transition",
            Self::Resync => "resync",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "snapshot" => Some(Self::Snapshot),
            "transition" => Some(Self::Transition),
            "resync" => Some(Self::Resync),
            _ => None,
        }
    }
}

/// One committed overlay change as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayTransition {
    /// Commit order across the whole store.
    pub seq: u64,
    pub run_id: Id,
    pub block_uid: String,
    pub kind: TransitionKind,
    pub from_status: OverlayStatus,
    /// Full overlay after the transition.
    pub overlay: BlockOverlay,
    /// Run counters after the transition.
    pub run: RunProgress,
    pub committed_at: DateTime<Utc>,
}

/// Consistent view of a run used to (re)seed a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: Run,
    pub overlays: Vec<BlockOverlay>,
    /// Highest transition `seq` already reflected in `overlays`.
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResyncPayload {
    pub run_id: Id,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Snapshot(RunSnapshot),
    Transition(OverlayTransition),
    Resync(ResyncPayload),
}

impl StreamEvent {
    pub fn event_type(&self) -> StreamEventType {
        match self {
            Self::Snapshot(_) => StreamEventType::Snapshot,
            Self::Transition(_) => StreamEventType::Transition,
            Self::Resync(_) => StreamEventType::Resync,
        }
    }

    pub fn data_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Snapshot(p) => serde_json::to_string(p),
            Self::Transition(p) => serde_json::to_string(p),
            Self::Resync(p) => serde_json::to_string(p),
        }
    }

    /// Decodes an event from its wire name and JSON data line.
    pub fn decode(event: &str, data: &str) -> Result<Option<Self>, serde_json::Error> {
        let Some(kind) = StreamEventType::parse(event) else {
            return Ok(None);
        };
        let decoded = match kind {
            StreamEventType::Snapshot => Self::Snapshot(serde_json::from_str(data)?),
            StreamEventType::Transition => Self::Transition(serde_json::from_str(data)?),
            StreamEventType::Resync => Self::Resync(serde_json::from_str(data)?),
        };
        Ok(Some(decoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunStatus;

    #[test]
    fn stream_event_type_serializes_correctly() {
        let json = serde_json::to_string(&StreamEventType::Resync).unwrap();
        assert_eq!(json, "\"resync\"");
        assert_eq!(StreamEventType::parse("snapshot"), Some(StreamEventType::Snapshot));
        assert_eq!(StreamEventType::parse("ping"), None);
    }

    #[test]
    fn transition_payload_has_expected_fields() {
        let run_id = Id::new();
        let now = Utc::now();
        let overlay = BlockOverlay {
            run_id: run_id.clone(),
            block_uid: "b1".to_string(),
            block_index: 0,
            status: OverlayStatus::Claimed,
            staging_payload: None,
            confirmed_payload: None,
            claimed_by: Some("w1".to_string()),
            claimed_at: Some(now),
            lease_ms: Some(300_000),
            attempt_count: 1,
            retry_base: 0,
            last_error: None,
            confirmed_by: None,
            confirmed_at: None,
            revision: 1,
            updated_at: now,
        };
        let event = OverlayTransition {
            seq: 7,
            run_id,
            block_uid: "b1".to_string(),
            kind: TransitionKind::Claim,
            from_status: OverlayStatus::Pending,
            overlay,
            run: RunProgress {
                status: RunStatus::Running,
                total_blocks: 3,
                completed_blocks: 0,
                failed_blocks: 0,
            },
            committed_at: now,
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["kind"], "claim");
        assert_eq!(json["from_status"], "pending");
        assert_eq!(json["overlay"]["status"], "claimed");
        assert_eq!(json["run"]["total_blocks"], 3);
    }

    #[test]
    fn decode_ignores_unknown_event_names() {
        assert!(StreamEvent::decode("keepalive", "{}").unwrap().is_none());
        let resync = StreamEvent::decode("resync", r#"{"run_id":"r1","reason":"lagged"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(resync.event_type(), StreamEventType::Resync);
    }
}
