//! Realtime fan-out of committed overlay transitions.
//!
//! The relay reads the outbox in `seq` order and publishes into one broadcast
//! channel per run. SQLite has a single writer, so `seq` order is commit order
//! and per-block ordering holds for every subscriber.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use annot_core::{Id, OverlayTransition};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::storage::{Storage, StorageError};

/// Outbox rows read per relay pass.
const RELAY_BATCH: u32 = 256;
/// Delivered outbox rows kept before pruning.
const OUTBOX_RETAIN: u64 = 10_000;

/// Per-run broadcast channels.
#[derive(Debug)]
pub struct FanoutHub {
    capacity: usize,
    channels: Mutex<HashMap<Id, broadcast::Sender<OverlayTransition>>>,
}

impl FanoutHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Channels whose receivers are all gone are swept here, so runs that
    /// never commit again do not keep theirs.
    pub async fn subscribe(&self, run_id: &Id) -> broadcast::Receiver<OverlayTransition> {
        let mut channels = self.channels.lock().await;
        channels.retain(|_, sender| sender.receiver_count() > 0);
        channels
            .entry(run_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Deliver to the run's subscribers. Returns how many received it.
    pub async fn publish(&self, event: OverlayTransition) -> usize {
        let mut channels = self.channels.lock().await;
        let Some(sender) = channels.get(&event.run_id) else {
            return 0;
        };
        let run_id = event.run_id.clone();
        match sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                // Every receiver is gone.
                channels.remove(&run_id);
                0
            }
        }
    }

    /// Drop a run's channel. Open receivers see the stream close.
    pub async fn remove(&self, run_id: &Id) -> bool {
        self.channels.lock().await.remove(run_id).is_some()
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn subscriber_count(&self, run_id: &Id) -> usize {
        self.channels
            .lock()
            .await
            .get(run_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

/// Moves committed transitions from the outbox to the hub.
#[derive(Debug)]
pub struct Relay {
    storage: Arc<Storage>,
    hub: Arc<FanoutHub>,
    commits: Arc<Notify>,
    poll: Duration,
    cursor: u64,
}

impl Relay {
    /// Starts after the current outbox head; earlier commits are already
    /// covered by any snapshot a subscriber takes.
    pub async fn new(
        storage: Arc<Storage>,
        hub: Arc<FanoutHub>,
        commits: Arc<Notify>,
        poll: Duration,
    ) -> Result<Self, StorageError> {
        let cursor = storage.latest_seq().await?;
        Ok(Self {
            storage,
            hub,
            commits,
            poll,
            cursor,
        })
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Publish everything committed since the last pass.
    pub async fn pump_once(&mut self) -> Result<usize, StorageError> {
        let mut published = 0;
        loop {
            let events = self.storage.events_after(self.cursor, RELAY_BATCH).await?;
            let fetched = events.len();
            for event in events {
                self.cursor = event.seq;
                self.hub.publish(event).await;
                published += 1;
            }
            if fetched < RELAY_BATCH as usize {
                break;
            }
        }
        if published > 0 {
            debug!(published, cursor = self.cursor, "relayed transitions");
            if self.cursor > OUTBOX_RETAIN {
                self.storage.prune_events(self.cursor - OUTBOX_RETAIN).await?;
            }
        }
        Ok(published)
    }

    /// Run until `cancel` fires. Wakes on commit notifications, with a poll
    /// fallback.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.commits.notified() => {}
                () = tokio::time::sleep(self.poll) => {}
            }
            if let Err(e) = self.pump_once().await {
                warn!("relay pass failed: {}", e);
            }
        }
        debug!(cursor = self.cursor, "relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use annot_core::transition::{plan, Command, Outcome, TransitionContext};
    use annot_core::{Block, BlockOverlay, OverlayStatus, Run, RunStatus};
    use chrono::Utc;
    use tempfile::TempDir;

    struct Fixture {
        storage: Arc<Storage>,
        run: Run,
        _dir: TempDir,
    }

    async fn fixture(n: i64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let now = Utc::now();
        let run = Run {
            run_id: Id::new(),
            conv_uid: "doc".to_string(),
            schema_id: "schema".to_string(),
            status: RunStatus::Running,
            total_blocks: n as u32,
            completed_blocks: 0,
            failed_blocks: 0,
            max_attempts: 3,
            model_config: None,
            started_at: now,
            completed_at: None,
        };
        let overlays: Vec<BlockOverlay> = (0..n)
            .map(|i| {
                let block = Block {
                    block_uid: format!("b{i}"),
                    block_index: i,
                    block_type: "p".to_string(),
                    content: String::new(),
                };
                BlockOverlay::pending(&run.run_id, &block, now)
            })
            .collect();
        storage.create_run(&run, &overlays).await.unwrap();
        Fixture {
            storage: Arc::new(storage),
            run,
            _dir: dir,
        }
    }

    async fn claim(storage: &Storage, run_id: &Id, uid: &str) {
        let overlay = storage.get_overlay(run_id, uid).await.unwrap();
        let ctx = TransitionContext {
            now: Utc::now(),
            max_attempts: 3,
            allow_reopen_confirmed: false,
        };
        let command = Command::Claim {
            worker_id: "w1".to_string(),
            lease: Duration::from_secs(300),
        };
        let Outcome::Apply(t) = plan(&overlay, &command, &ctx).unwrap() else {
            panic!("expected a state change");
        };
        storage.commit_transition(&t).await.unwrap();
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let f = fixture(1).await;
        claim(&f.storage, &f.run.run_id, "b0").await;
        let event = f.storage.events_after(0, 1).await.unwrap().remove(0);
        let hub = FanoutHub::new(4);
        assert_eq!(hub.publish(event).await, 0);
    }

    #[tokio::test]
    async fn relay_delivers_in_commit_order() {
        let f = fixture(3).await;
        let hub = Arc::new(FanoutHub::new(16));
        let mut rx = hub.subscribe(&f.run.run_id).await;
        let mut relay = Relay::new(
            Arc::clone(&f.storage),
            Arc::clone(&hub),
            Arc::new(Notify::new()),
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        for uid in ["b2", "b0", "b1"] {
            claim(&f.storage, &f.run.run_id, uid).await;
        }
        assert_eq!(relay.pump_once().await.unwrap(), 3);
        assert_eq!(relay.cursor(), 3);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.overlay.status, OverlayStatus::Claimed);
            seen.push((event.seq, event.block_uid));
        }
        assert_eq!(
            seen,
            vec![
                (1, "b2".to_string()),
                (2, "b0".to_string()),
                (3, "b1".to_string())
            ]
        );
        assert_eq!(relay.pump_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn relay_starts_after_existing_outbox() {
        let f = fixture(2).await;
        claim(&f.storage, &f.run.run_id, "b0").await;
        let hub = Arc::new(FanoutHub::new(16));
        let mut relay = Relay::new(
            Arc::clone(&f.storage),
            hub,
            Arc::new(Notify::new()),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        assert_eq!(relay.cursor(), 1);
        claim(&f.storage, &f.run.run_id, "b1").await;
        assert_eq!(relay.pump_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn slow_subscriber_lags() {
        let f = fixture(3).await;
        let hub = Arc::new(FanoutHub::new(1));
        let mut rx = hub.subscribe(&f.run.run_id).await;
        let mut relay = Relay::new(
            Arc::clone(&f.storage),
            Arc::clone(&hub),
            Arc::new(Notify::new()),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        for uid in ["b0", "b1", "b2"] {
            claim(&f.storage, &f.run.run_id, uid).await;
        }
        relay.pump_once().await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[tokio::test]
    async fn dropped_receivers_release_channel() {
        let f = fixture(1).await;
        let hub = FanoutHub::new(4);
        let rx = hub.subscribe(&f.run.run_id).await;
        assert_eq!(hub.subscriber_count(&f.run.run_id).await, 1);
        drop(rx);
        claim(&f.storage, &f.run.run_id, "b0").await;
        let event = f.storage.events_after(0, 1).await.unwrap().remove(0);
        assert_eq!(hub.publish(event).await, 0);
        assert_eq!(hub.subscriber_count(&f.run.run_id).await, 0);
    }

    #[tokio::test]
    async fn idle_channels_are_swept_on_subscribe() {
        let hub = FanoutHub::new(4);
        let (a, b) = (Id::new(), Id::new());
        drop(hub.subscribe(&a).await);
        assert_eq!(hub.channel_count().await, 1);
        let _rx = hub.subscribe(&b).await;
        assert_eq!(hub.channel_count().await, 1);
        assert_eq!(hub.subscriber_count(&b).await, 1);
    }

    #[tokio::test]
    async fn removed_channel_closes_receivers() {
        let hub = FanoutHub::new(4);
        let run_id = Id::new();
        let mut rx = hub.subscribe(&run_id).await;
        assert!(hub.remove(&run_id).await);
        assert!(!hub.remove(&run_id).await);
        assert_eq!(hub.channel_count().await, 0);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn run_loop_wakes_on_commit() {
        let f = fixture(1).await;
        let hub = Arc::new(FanoutHub::new(4));
        let mut rx = hub.subscribe(&f.run.run_id).await;
        let commits = Arc::new(Notify::new());
        let relay = Relay::new(
            Arc::clone(&f.storage),
            Arc::clone(&hub),
            Arc::clone(&commits),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(relay.run(cancel.clone()));

        claim(&f.storage, &f.run.run_id, "b0").await;
        commits.notify_one();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.block_uid, "b0");

        cancel.cancel();
        handle.await.unwrap();
    }
}
