//! Pull worker: claims blocks from a run and annotates each one with an
//! external command.
//!
//! The command receives a JSON request on stdin and must print the staging
//! payload as JSON on stdout. A non-zero exit, a timeout or unparsable output
//! is reported as a failure.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use annot_core::{Block, BlockOverlay, Run, RunStatus};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::client::{Client, ClientError};

/// Stderr kept in a failure report.
const MAX_ERROR_LEN: usize = 2000;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub run_id: String,
    pub worker_id: String,
    /// Program and arguments.
    pub command: Vec<String>,
    pub batch_size: u32,
    pub concurrency: usize,
    pub timeout: Duration,
    /// Lease requested with each claim; the server's when None.
    pub lease: Option<Duration>,
    /// Wait between claims when the run has nothing claimable.
    pub idle_poll: Duration,
    /// Exit instead of polling once nothing is claimable.
    pub exit_when_idle: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub succeeded: usize,
    pub failed: usize,
    /// Reports rejected because the claim was no longer ours.
    pub lost: usize,
}

/// Stdin document handed to the annotation command.
#[derive(Debug, Serialize)]
struct AnnotationRequest<'a> {
    run_id: &'a str,
    schema_id: &'a str,
    model_config: Option<&'a Value>,
    attempt: u32,
    block: &'a Block,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reported {
    Succeeded,
    Failed,
    Lost,
}

/// Claim and process batches until the run stops being claimable or `cancel`
/// fires. Claimed blocks are always finished before returning.
pub async fn run_worker(
    client: Arc<Client>,
    opts: WorkerOptions,
    cancel: CancellationToken,
) -> Result<WorkerStats, ClientError> {
    let run = client.get_run(&opts.run_id).await?;
    let blocks: HashMap<String, Block> = client
        .list_blocks(&run.conv_uid)
        .await?
        .into_iter()
        .map(|b| (b.block_uid.clone(), b))
        .collect();
    let run = Arc::new(run);
    let blocks = Arc::new(blocks);
    let mut stats = WorkerStats::default();

    while !cancel.is_cancelled() {
        let claimed = client
            .claim_batch(
                &opts.run_id,
                &opts.worker_id,
                opts.batch_size,
                opts.lease.map(|l| l.as_secs()),
            )
            .await?;

        if claimed.is_empty() {
            let current = client.get_run(&opts.run_id).await?;
            if current.status != RunStatus::Running || opts.exit_when_idle {
                eprintln!("no claimable blocks (run is {})", current.status);
                break;
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(opts.idle_poll) => continue,
            }
        }

        eprintln!("claimed {} block(s)", claimed.len());
        let results: Vec<Result<Reported, ClientError>> = stream::iter(claimed)
            .map(|overlay| {
                let client = Arc::clone(&client);
                let run = Arc::clone(&run);
                let blocks = Arc::clone(&blocks);
                let opts = &opts;
                async move { process(&client, &run, &blocks, opts, &overlay).await }
            })
            .buffer_unordered(opts.concurrency.max(1))
            .collect()
            .await;

        for result in results {
            match result? {
                Reported::Succeeded => stats.succeeded += 1,
                Reported::Failed => stats.failed += 1,
                Reported::Lost => stats.lost += 1,
            }
        }
    }

    if cancel.is_cancelled() {
        eprintln!("interrupted; in-flight blocks finished");
    }
    Ok(stats)
}

async fn process(
    client: &Client,
    run: &Run,
    blocks: &HashMap<String, Block>,
    opts: &WorkerOptions,
    overlay: &BlockOverlay,
) -> Result<Reported, ClientError> {
    let uid = overlay.block_uid.as_str();
    let outcome = match blocks.get(uid) {
        Some(block) => annotate(run, block, overlay.attempt_count, &opts.command, opts.timeout).await,
        None => Outcome::Failure(format!("block {uid} missing from document")),
    };
    report(client, &opts.run_id, overlay, &outcome).await
}

/// Run the annotation command for one claimed attempt of `block`.
pub async fn annotate(
    run: &Run,
    block: &Block,
    attempt: u32,
    command: &[String],
    timeout: Duration,
) -> Outcome {
    let request = AnnotationRequest {
        run_id: run.run_id.as_ref(),
        schema_id: &run.schema_id,
        model_config: run.model_config.as_ref(),
        attempt,
        block,
    };
    match serde_json::to_vec(&request) {
        Ok(input) => execute(command, &input, timeout).await,
        Err(e) => Outcome::Failure(format!("failed to encode request: {e}")),
    }
}

/// Report `outcome` against the attempt `overlay` was claimed with. A report
/// the server rejects as stale comes back as `Reported::Lost`.
pub async fn report(
    client: &Client,
    run_id: &str,
    overlay: &BlockOverlay,
    outcome: &Outcome,
) -> Result<Reported, ClientError> {
    let uid = overlay.block_uid.as_str();
    let attempt = overlay.attempt_count;
    let reported = match outcome {
        Outcome::Success(payload) => client
            .report_success(run_id, uid, attempt, payload)
            .await
            .map(|_| Reported::Succeeded),
        Outcome::Failure(error) => client
            .report_failure(run_id, uid, attempt, error)
            .await
            .map(|_| Reported::Failed),
    };

    match reported {
        Ok(r) => {
            match outcome {
                Outcome::Success(_) => eprintln!("  {uid} (attempt {attempt}): ok"),
                Outcome::Failure(e) => eprintln!("  {uid} (attempt {attempt}): failed: {e}"),
            }
            Ok(r)
        }
        Err(e) if e.is_stale() => {
            eprintln!("  {uid} (attempt {attempt}): claim lost, result discarded");
            Ok(Reported::Lost)
        }
        Err(e) => Err(e),
    }
}

/// Run the command with `input` on stdin.
pub async fn execute(command: &[String], input: &[u8], timeout: Duration) -> Outcome {
    let Some((program, args)) = command.split_first() else {
        return Outcome::Failure("no command configured".to_string());
    };

    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => return Outcome::Failure(format!("failed to start {program}: {e}")),
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(input).await {
            return Outcome::Failure(format!("failed to write stdin: {e}"));
        }
    }

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Err(_) => Outcome::Failure(format!("timed out after {}s", timeout.as_secs_f32())),
        Ok(Err(e)) => Outcome::Failure(format!("failed to wait for {program}: {e}")),
        Ok(Ok(output)) => interpret(
            output.status.success(),
            output.status.code(),
            &output.stdout,
            &output.stderr,
        ),
    }
}

/// Turn a finished command into an outcome.
pub fn interpret(success: bool, code: Option<i32>, stdout: &[u8], stderr: &[u8]) -> Outcome {
    if !success {
        let stderr = String::from_utf8_lossy(stderr);
        let stderr = stderr.trim();
        let status = code.map_or_else(|| "signal".to_string(), |c| format!("exit code {c}"));
        if stderr.is_empty() {
            return Outcome::Failure(format!("command failed ({status})"));
        }
        return Outcome::Failure(format!(
            "command failed ({status}): {}",
            truncate(stderr, MAX_ERROR_LEN)
        ));
    }
    match serde_json::from_slice::<Value>(stdout) {
        Ok(value) => Outcome::Success(value),
        Err(e) => Outcome::Failure(format!("invalid JSON output: {e}")),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
