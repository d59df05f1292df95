//! annotctl - CLI client for annotd
//!
//! Imports documents, starts and reviews runs, watches them live, and runs a
//! pull worker that annotates blocks with an external command.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod client;
mod render;
mod watch;
mod worker;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use annot_core::Block;
use clap::{Parser, Subcommand};
use client::{Client, ClientError, CreateRunRequest};
use tokio_util::sync::CancellationToken;
use worker::{Reported, WorkerOptions};

/// CLI client for the annotd annotation daemon.
#[derive(Parser)]
#[command(name = "annotctl")]
#[command(about = "Control plane for the annotd block annotation daemon")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:7710)
    #[arg(long, global = true, env = "ANNOTD_ADDR")]
    addr: Option<String>,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "ANNOTD_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import a document's blocks from a JSON array or JSON-lines file
    Import {
        /// Document ID
        conv_uid: String,
        /// Blocks file
        file: PathBuf,
    },

    /// Start a run of a schema over a document
    Create {
        conv_uid: String,
        schema_id: String,
        /// Model configuration as inline JSON
        #[arg(long)]
        model_config: Option<String>,
        /// Override the daemon's retry budget
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// List runs
    List {
        /// Only runs for this document
        #[arg(long)]
        conv: Option<String>,
    },

    /// Show a run and the state of every block
    Inspect { run_id: String },

    /// Cancel a run; in-flight results are still accepted
    Cancel { run_id: String },

    /// Delete a run with its overlays and history
    Delete { run_id: String },

    /// Confirm AI results
    Confirm {
        run_id: String,
        /// Confirm every ai_complete block
        #[arg(long, conflicts_with = "block")]
        all: bool,
        /// Block to confirm (repeatable)
        #[arg(long)]
        block: Vec<String>,
        /// Reviewer identity
        #[arg(long, env = "USER", default_value = "annotctl")]
        by: String,
    },

    /// Send a block back for another attempt. Without a command the
    /// attempt goes to the run's workers.
    Regenerate {
        run_id: String,
        block_uid: String,
        #[arg(long)]
        by: Option<String>,
        /// Command timeout in seconds
        #[arg(long, default_value = "120")]
        timeout_sec: u64,
        /// Annotate the block here with this command
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Export confirmed results as JSON lines
    Export {
        run_id: String,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Recount a run's counters from its blocks
    Audit {
        run_id: String,
        /// Overwrite stored counters that disagree
        #[arg(long)]
        repair: bool,
    },

    /// Follow a run live
    Watch {
        run_id: String,
        /// Exit once the run is no longer running
        #[arg(long)]
        until_settled: bool,
    },

    /// Claim blocks and annotate them with an external command
    Work {
        run_id: String,
        /// Worker identity recorded on claims
        #[arg(long)]
        worker_id: Option<String>,
        #[arg(long, default_value = "25")]
        batch_size: u32,
        /// Blocks processed at once
        #[arg(long, default_value = "4")]
        concurrency: usize,
        /// Per-block command timeout in seconds
        #[arg(long, default_value = "120")]
        timeout_sec: u64,
        /// Claim lease in seconds; three timeouts when absent
        #[arg(long)]
        lease_sec: Option<u64>,
        /// Exit when nothing is claimable instead of polling
        #[arg(long)]
        exit_when_idle: bool,
        /// Command and arguments; receives the block as JSON on stdin
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli
        .addr
        .unwrap_or_else(|| "http://127.0.0.1:7710".to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    if let Err(e) = client.wait_for_ready().await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }

    let result = match cli.command {
        Command::Import { conv_uid, file } => run_import(&client, &conv_uid, &file).await,
        Command::Create {
            conv_uid,
            schema_id,
            model_config,
            max_attempts,
        } => run_create(&client, conv_uid, schema_id, model_config, max_attempts).await,
        Command::List { conv } => run_list(&client, conv.as_deref()).await,
        Command::Inspect { run_id } => run_inspect(&client, &run_id).await,
        Command::Cancel { run_id } => run_cancel(&client, &run_id).await,
        Command::Delete { run_id } => run_delete(&client, &run_id).await,
        Command::Confirm {
            run_id,
            all,
            block,
            by,
        } => run_confirm(&client, &run_id, all, &block, &by).await,
        Command::Regenerate {
            run_id,
            block_uid,
            by,
            timeout_sec,
            command,
        } => {
            run_regenerate(
                &client,
                &run_id,
                &block_uid,
                by.as_deref(),
                &command,
                Duration::from_secs(timeout_sec),
            )
            .await
        }
        Command::Export { run_id, output } => run_export(&client, &run_id, output).await,
        Command::Audit { run_id, repair } => run_audit(&client, &run_id, repair).await,
        Command::Watch {
            run_id,
            until_settled,
        } => watch::watch(&client, &run_id, until_settled, ctrl_c_token()).await,
        Command::Work {
            run_id,
            worker_id,
            batch_size,
            concurrency,
            timeout_sec,
            lease_sec,
            exit_when_idle,
            command,
        } => {
            let opts = WorkerOptions {
                run_id,
                worker_id: worker_id.unwrap_or_else(default_actor),
                command,
                batch_size,
                concurrency,
                timeout: Duration::from_secs(timeout_sec),
                lease: Some(Duration::from_secs(
                    lease_sec.unwrap_or_else(|| default_lease_sec(timeout_sec)),
                )),
                idle_poll: Duration::from_secs(2),
                exit_when_idle,
            };
            run_work(client, opts).await
        }
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

/// Cancelled on the first Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    token
}

async fn run_import(client: &Client, conv_uid: &str, file: &Path) -> Result<(), ClientError> {
    let content = tokio::fs::read_to_string(file)
        .await
        .map_err(|e| ClientError::IoError(format!("{}: {}", file.display(), e)))?;
    let blocks = parse_blocks(&content)?;
    let imported = client.import_blocks(conv_uid, &blocks).await?;
    println!(
        "Imported {} new block(s) into {} ({} already present)",
        imported,
        conv_uid,
        blocks.len().saturating_sub(imported)
    );
    Ok(())
}

/// Accepts a JSON array of blocks or one block per line.
fn parse_blocks(content: &str) -> Result<Vec<Block>, ClientError> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .map_err(|e| ClientError::InvalidInput(format!("invalid blocks file: {e}")));
    }
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).map_err(|e| {
                ClientError::InvalidInput(format!("invalid block on line {}: {e}", n + 1))
            })
        })
        .collect()
}

async fn run_create(
    client: &Client,
    conv_uid: String,
    schema_id: String,
    model_config: Option<String>,
    max_attempts: Option<u32>,
) -> Result<(), ClientError> {
    let model_config = model_config
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| ClientError::InvalidInput(format!("--model-config is not JSON: {e}")))?;
    let run = client
        .create_run(&CreateRunRequest {
            conv_uid,
            schema_id,
            model_config,
            max_attempts,
        })
        .await?;
    render::print_run_created(&run);
    Ok(())
}

async fn run_list(client: &Client, conv_uid: Option<&str>) -> Result<(), ClientError> {
    let runs = client.list_runs(conv_uid).await?;
    render::print_run_list(&runs);
    Ok(())
}

async fn run_inspect(client: &Client, run_id: &str) -> Result<(), ClientError> {
    let run = client.get_run(run_id).await?;
    let overlays = client.list_overlays(run_id).await?;
    render::print_run_details(&run, &overlays);
    Ok(())
}

async fn run_cancel(client: &Client, run_id: &str) -> Result<(), ClientError> {
    let run = client.cancel_run(run_id).await?;
    println!("Run {} cancelled ({} blocks confirmed)", run_id, run.completed_blocks);
    Ok(())
}

async fn run_delete(client: &Client, run_id: &str) -> Result<(), ClientError> {
    client.delete_run(run_id).await?;
    println!("Run {} deleted", run_id);
    Ok(())
}

async fn run_confirm(
    client: &Client,
    run_id: &str,
    all: bool,
    blocks: &[String],
    by: &str,
) -> Result<(), ClientError> {
    match (all, blocks) {
        (true, _) => {
            let summary = client.confirm_all(run_id, by, None).await?;
            render::print_confirm_summary(&summary);
        }
        (false, [single]) => {
            let overlay = client.confirm_block(run_id, single, by).await?;
            println!("Block {} {}", overlay.block_uid, overlay.status);
        }
        (false, []) => {
            return Err(ClientError::InvalidInput(
                "pass --all or at least one --block".to_string(),
            ));
        }
        (false, many) => {
            let summary = client.confirm_all(run_id, by, Some(many)).await?;
            render::print_confirm_summary(&summary);
        }
    }
    Ok(())
}

fn default_actor() -> String {
    format!("annotctl-{}", std::process::id())
}

/// Room for the command plus the report round trip.
fn default_lease_sec(timeout_sec: u64) -> u64 {
    timeout_sec.saturating_mul(3).max(1)
}

async fn run_regenerate(
    client: &Client,
    run_id: &str,
    block_uid: &str,
    by: Option<&str>,
    command: &[String],
    timeout: Duration,
) -> Result<(), ClientError> {
    if command.is_empty() {
        let overlay = client.regenerate(run_id, block_uid, by, Some(0)).await?;
        println!(
            "Block {} queued for attempt {} by the run's workers",
            overlay.block_uid,
            overlay.attempt_count + 1
        );
        return Ok(());
    }

    let run = client.get_run(run_id).await?;
    let block = client
        .list_blocks(&run.conv_uid)
        .await?
        .into_iter()
        .find(|b| b.block_uid == block_uid)
        .ok_or_else(|| ClientError::InvalidInput(format!("block {block_uid} not in document")))?;

    let requester = by.map_or_else(default_actor, str::to_string);
    let lease_sec = default_lease_sec(timeout.as_secs());
    let overlay = client
        .regenerate(run_id, block_uid, Some(&requester), Some(lease_sec))
        .await?;
    eprintln!(
        "Block {} claimed by {} for attempt {}",
        overlay.block_uid, requester, overlay.attempt_count
    );

    let outcome = worker::annotate(&run, &block, overlay.attempt_count, command, timeout).await;
    match worker::report(client, run_id, &overlay, &outcome).await? {
        Reported::Succeeded => println!("Block {block_uid} regenerated"),
        Reported::Failed => println!("Block {block_uid} failed; workers may retry it"),
        Reported::Lost => println!("Block {block_uid} changed while regenerating; result discarded"),
    }
    Ok(())
}

async fn run_export(
    client: &Client,
    run_id: &str,
    output: Option<PathBuf>,
) -> Result<(), ClientError> {
    let body = client.export(run_id).await?;
    match output {
        Some(path) => {
            tokio::fs::write(&path, &body)
                .await
                .map_err(|e| ClientError::IoError(format!("{}: {}", path.display(), e)))?;
            eprintln!("Wrote {} record(s) to {}", body.lines().count(), path.display());
        }
        None => print!("{body}"),
    }
    Ok(())
}

async fn run_audit(client: &Client, run_id: &str, repair: bool) -> Result<(), ClientError> {
    let report = client.audit(run_id, repair).await?;
    render::print_audit(run_id, &report);
    Ok(())
}

async fn run_work(client: Client, opts: WorkerOptions) -> Result<(), ClientError> {
    eprintln!(
        "worker {} on run {} (batch {}, concurrency {})",
        opts.worker_id, opts.run_id, opts.batch_size, opts.concurrency
    );
    let stats = worker::run_worker(Arc::new(client), opts, ctrl_c_token()).await?;
    println!(
        "Done: {} succeeded, {} failed, {} lost",
        stats.succeeded, stats.failed, stats.lost
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_blocks_accepts_array() {
        let content = r#"[
            {"block_uid": "a", "block_index": 0, "block_type": "p", "content": "x"},
            {"block_uid": "b", "block_index": 1, "block_type": "p", "content": "y"}
        ]"#;
        let blocks = parse_blocks(content).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].block_uid, "b");
    }

    #[test]
    fn parse_blocks_accepts_json_lines() {
        let content = "{\"block_uid\":\"a\",\"block_index\":0,\"block_type\":\"p\",\"content\":\"x\"}\n\n\
                       {\"block_uid\":\"b\",\"block_index\":1,\"block_type\":\"p\",\"content\":\"y\"}\n";
        let blocks = parse_blocks(content).unwrap();
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn parse_blocks_reports_line_number() {
        let content = "{\"block_uid\":\"a\",\"block_index\":0,\"block_type\":\"p\",\"content\":\"x\"}\nnope\n";
        match parse_blocks(content) {
            Err(ClientError::InvalidInput(msg)) => assert!(msg.contains("line 2")),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn work_requires_a_command() {
        assert!(Cli::try_parse_from(["annotctl", "work", "run-1"]).is_err());
        let cli =
            Cli::try_parse_from(["annotctl", "work", "run-1", "--", "python", "annotate.py"])
                .unwrap();
        match cli.command {
            Command::Work { command, .. } => assert_eq!(command, vec!["python", "annotate.py"]),
            _ => panic!("expected work"),
        }
    }

    #[test]
    fn regenerate_command_is_optional() {
        let cli = Cli::try_parse_from(["annotctl", "regenerate", "run-1", "b0"]).unwrap();
        match cli.command {
            Command::Regenerate { command, by, .. } => {
                assert!(command.is_empty());
                assert!(by.is_none());
            }
            _ => panic!("expected regenerate"),
        }

        let cli = Cli::try_parse_from([
            "annotctl",
            "regenerate",
            "run-1",
            "b0",
            "--by",
            "alice",
            "--",
            "python",
            "annotate.py",
        ])
        .unwrap();
        match cli.command {
            Command::Regenerate { command, by, .. } => {
                assert_eq!(command, vec!["python", "annotate.py"]);
                assert_eq!(by.as_deref(), Some("alice"));
            }
            _ => panic!("expected regenerate"),
        }
    }

    #[test]
    fn worker_lease_covers_the_timeout() {
        assert_eq!(default_lease_sec(120), 360);
        assert_eq!(default_lease_sec(0), 1);
        let cli = Cli::try_parse_from([
            "annotctl", "work", "run-1", "--lease-sec", "30", "--", "cat",
        ])
        .unwrap();
        match cli.command {
            Command::Work { lease_sec, .. } => assert_eq!(lease_sec, Some(30)),
            _ => panic!("expected work"),
        }
    }
}
