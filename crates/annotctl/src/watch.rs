//! Live run viewer.
//!
//! Keeps an `OverlayCache` in sync with the daemon's subscribe stream and
//! reconnects with backoff whenever the stream drops or asks for a resync.

use std::time::Duration;

use annot_core::{ApplyOutcome, Id, OverlayCache, OverlayStatus, RunStatus, StreamEvent};
use tokio_util::sync::CancellationToken;

use crate::client::{Client, ClientError};
use crate::render;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

const STATUSES: [OverlayStatus; 5] = [
    OverlayStatus::Pending,
    OverlayStatus::Claimed,
    OverlayStatus::AiComplete,
    OverlayStatus::Confirmed,
    OverlayStatus::Failed,
];

/// Why one subscription ended.
#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    Settled,
    Resync(String),
    Closed,
}

/// Watch a run until Ctrl-C, or until it stops running when `until_settled`.
pub async fn watch(
    client: &Client,
    run_id: &str,
    until_settled: bool,
    cancel: CancellationToken,
) -> Result<(), ClientError> {
    let mut cache = OverlayCache::new(Id::from_string(run_id));
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let end = match client.subscribe(run_id).await {
            Ok(mut events) => {
                backoff = INITIAL_BACKOFF;
                session(&mut events, &mut cache, until_settled, &cancel).await
            }
            // Unknown run or bad token will not fix itself.
            Err(e @ (ClientError::NotFound(_) | ClientError::Unauthorized)) => return Err(e),
            Err(e) => Err(e),
        };

        match end {
            Ok(SessionEnd::Cancelled | SessionEnd::Settled) => return Ok(()),
            Ok(SessionEnd::Resync(reason)) => eprintln!("resync requested: {reason}"),
            Ok(SessionEnd::Closed) => eprintln!("stream closed by daemon"),
            Err(e) => eprintln!("stream error: {e}"),
        }

        cache.mark_disconnected();
        eprintln!("reconnecting in {}ms", backoff.as_millis());
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn session(
    events: &mut crate::client::EventStream,
    cache: &mut OverlayCache,
    until_settled: bool,
    cancel: &CancellationToken,
) -> Result<SessionEnd, ClientError> {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            event = events.next_event() => event?,
        };
        let Some(event) = event else {
            return Ok(SessionEnd::Closed);
        };

        match event {
            StreamEvent::Snapshot(snapshot) => {
                cache.apply_snapshot(snapshot);
                print_summary(cache);
            }
            StreamEvent::Transition(transition) => match cache.apply_transition(&transition) {
                ApplyOutcome::Applied => render::print_transition(&transition),
                ApplyOutcome::UnknownBlock => {
                    return Ok(SessionEnd::Resync(format!(
                        "unknown block {}",
                        transition.block_uid
                    )));
                }
                // Duplicates and replays are expected across reconnects.
                _ => {}
            },
            StreamEvent::Resync(payload) => return Ok(SessionEnd::Resync(payload.reason)),
        }

        if until_settled && cache.progress().is_some_and(|p| p.status != RunStatus::Running) {
            print_summary(cache);
            return Ok(SessionEnd::Settled);
        }
    }
}

fn print_summary(cache: &OverlayCache) {
    let Some(progress) = cache.progress() else {
        return;
    };
    let counts: Vec<(OverlayStatus, usize)> = STATUSES
        .iter()
        .map(|status| (*status, cache.count(*status)))
        .collect();
    render::print_cache_summary(&progress, &counts);
}
