//! Output rendering for annotctl.

use annot_core::aggregate::RunProgress;
use annot_core::{BlockOverlay, OverlayStatus, OverlayTransition, Run, RunStatus};

use crate::client::{AuditReport, ConfirmSummary};

/// Print confirmation after creating a run.
pub fn print_run_created(run: &Run) {
    println!("Created run: {}", run.run_id);
    println!("  Document:     {}", run.conv_uid);
    println!("  Schema:       {}", run.schema_id);
    println!("  Blocks:       {}", run.total_blocks);
    println!("  Max attempts: {}", run.max_attempts);
}

/// Print a list of runs in tabular format.
pub fn print_run_list(runs: &[Run]) {
    if runs.is_empty() {
        println!("No runs found.");
        return;
    }

    println!(
        "{:<36}  {:<16}  {:<12}  {:<10}  {:<12}  {:<20}",
        "ID", "DOCUMENT", "SCHEMA", "STATUS", "PROGRESS", "STARTED"
    );
    println!("{}", "-".repeat(116));

    for run in runs {
        println!(
            "{:<36}  {:<16}  {:<12}  {:<10}  {:<12}  {:<20}",
            run.run_id.0,
            truncate(&run.conv_uid, 16),
            truncate(&run.schema_id, 12),
            format_status(run.status),
            format_progress(&run.progress()),
            format_time(&run.started_at),
        );
    }

    println!();
    println!("{} run(s)", runs.len());
}

/// Print a run and one row per block. Blocks that used up their retries are
/// flagged.
pub fn print_run_details(run: &Run, overlays: &[BlockOverlay]) {
    println!("Run: {}", run.run_id);
    println!();
    println!("  Document:     {}", run.conv_uid);
    println!("  Schema:       {}", run.schema_id);
    println!("  Status:       {}", format_status(run.status));
    println!("  Progress:     {}", format_progress(&run.progress()));
    println!("  Max attempts: {}", run.max_attempts);
    println!("  Started:      {}", format_time(&run.started_at));
    if let Some(completed_at) = &run.completed_at {
        println!("  Completed:    {}", format_time(completed_at));
    }
    if let Some(config) = &run.model_config {
        println!("  Model config: {config}");
    }

    if overlays.is_empty() {
        return;
    }
    println!();
    println!(
        "  {:<6}  {:<24}  {:<12}  {:<8}  {:<16}  {}",
        "INDEX", "BLOCK", "STATUS", "ATTEMPT", "HOLDER", "NOTE"
    );
    println!("  {}", "-".repeat(90));

    let mut ordered: Vec<&BlockOverlay> = overlays.iter().collect();
    ordered.sort_by_key(|o| o.block_index);
    for overlay in ordered {
        let holder = overlay
            .claimed_by
            .as_deref()
            .or(overlay.confirmed_by.as_deref())
            .unwrap_or("-");
        let note = if overlay.is_exhausted(run.max_attempts) {
            format!(
                "PERMANENTLY FAILED: {}",
                overlay.last_error.as_deref().unwrap_or("unknown error")
            )
        } else {
            overlay.last_error.clone().unwrap_or_default()
        };
        println!(
            "  {:<6}  {:<24}  {:<12}  {:<8}  {:<16}  {}",
            overlay.block_index,
            truncate(&overlay.block_uid, 24),
            overlay.status.as_str(),
            overlay.attempt_count,
            truncate(holder, 16),
            truncate(&note, 60),
        );
    }

    let exhausted = overlays
        .iter()
        .filter(|o| o.is_exhausted(run.max_attempts))
        .count();
    if exhausted > 0 {
        println!();
        println!("  {exhausted} block(s) need manual regeneration");
    }
}

pub fn print_confirm_summary(summary: &ConfirmSummary) {
    println!("Confirmed {} block(s)", summary.confirmed.len());
    for skipped in &summary.skipped {
        println!("  skipped {}: {}", skipped.block_uid, skipped.reason);
    }
}

pub fn print_audit(run_id: &str, report: &AuditReport) {
    println!("Audit: {run_id}");
    println!(
        "  Stored:  total={} completed={} failed={}",
        report.stored.total_blocks, report.stored.completed_blocks, report.stored.failed_blocks
    );
    println!(
        "  Actual:  total={} completed={} failed={}",
        report.actual.total_blocks, report.actual.completed_blocks, report.actual.failed_blocks
    );
    for violation in &report.violations {
        println!("  ! {}: {}", violation.block_uid, violation.problem);
    }
    if report.consistent {
        println!("  Consistent");
    } else if report.repaired {
        println!("  Counters repaired");
    } else {
        println!("  Inconsistent (rerun with --repair to fix counters)");
    }
}

/// One line per streamed transition.
pub fn print_transition(event: &OverlayTransition) {
    let overlay = &event.overlay;
    let mut line = format!(
        "[{}] #{:<6} {:<16} {} -> {} (attempt {})",
        event.committed_at.format("%H:%M:%S"),
        event.seq,
        truncate(&event.block_uid, 16),
        event.from_status,
        overlay.status,
        overlay.attempt_count,
    );
    if overlay.status == OverlayStatus::Failed {
        if let Some(error) = &overlay.last_error {
            line.push_str(&format!(": {}", truncate(error, 60)));
        }
    }
    println!("{line}  [{}]", format_progress(&event.run));
}

pub fn print_cache_summary(progress: &RunProgress, counts: &[(OverlayStatus, usize)]) {
    let parts: Vec<String> = counts
        .iter()
        .filter(|(_, n)| *n > 0)
        .map(|(status, n)| format!("{status}={n}"))
        .collect();
    println!(
        "{} {}  ({})",
        format_status(progress.status),
        format_progress(progress),
        parts.join(" ")
    );
}

fn format_status(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "RUNNING",
        RunStatus::Complete => "COMPLETE",
        RunStatus::Failed => "FAILED",
        RunStatus::Cancelled => "CANCELLED",
    }
}

fn format_progress(progress: &RunProgress) -> String {
    if progress.failed_blocks > 0 {
        format!(
            "{}/{} ({} failed)",
            progress.completed_blocks, progress.total_blocks, progress.failed_blocks
        )
    } else {
        format!("{}/{}", progress.completed_blocks, progress.total_blocks)
    }
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_mentions_failures_only_when_present() {
        let mut progress = RunProgress {
            status: RunStatus::Running,
            total_blocks: 10,
            completed_blocks: 4,
            failed_blocks: 0,
        };
        assert_eq!(format_progress(&progress), "4/10");
        progress.failed_blocks = 2;
        assert_eq!(format_progress(&progress), "4/10 (2 failed)");
    }

    #[test]
    fn truncate_counts_characters() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ünïcödé-block-uid", 8), "ünïcö...");
    }
}
