use octolab_driver::SmokeReport;
use octolab_orchestrator::{WatchdogOutcome, WatchdogReport};

use crate::commands::DoctorReport;

/// Render a doctor report as human-readable text.
pub fn render_doctor(report: &DoctorReport) -> String {
    let mut out = String::new();
    for check in &report.checks {
        let mark = if check.ok { "ok  " } else { "FAIL" };
        out.push_str(&format!("[{mark}] {:<20} {}\n", check.name, check.detail));
    }
    out
}

/// Render a watchdog sweep report as human-readable text.
pub fn render_watchdog(report: &WatchdogReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "watchdog: threshold={}m action={:?} dry_run={}\n",
        report.threshold_minutes, report.action, report.dry_run
    ));
    if report.entries.is_empty() {
        out.push_str("  no stuck labs found\n");
        return out;
    }
    for entry in &report.entries {
        let line = match &entry.outcome {
            WatchdogOutcome::Finished => format!("  {} stuck {}m -> FINISHED", entry.lab_id, entry.stuck_for_minutes),
            WatchdogOutcome::Failed => format!("  {} stuck {}m -> FAILED", entry.lab_id, entry.stuck_for_minutes),
            WatchdogOutcome::StillEnding => format!("  {} stuck {}m -> still ENDING", entry.lab_id, entry.stuck_for_minutes),
            WatchdogOutcome::Error { message } => {
                format!("  {} stuck {}m -> error: {message}", entry.lab_id, entry.stuck_for_minutes)
            }
        };
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Render a smoke-test report as human-readable text.
pub fn render_smoke(report: &SmokeReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("smoke: {}\n", if report.ok { "OK" } else { "FAILED" }));
    out.push_str(&format!("  spawn -> process alive: {}ms\n", report.timings.spawn_to_process_alive_ms));
    match report.timings.process_alive_to_metrics_ms {
        Some(ms) => out.push_str(&format!("  process alive -> metrics: {ms}ms\n")),
        None => out.push_str("  process alive -> metrics: never\n"),
    }
    out.push_str(&format!("  total: {}ms\n", report.timings.total_ms));
    for note in &report.notes {
        out.push_str(&format!("  note: {note}\n"));
    }
    if !report.ok {
        out.push_str(&format!("  stderr tail:\n{}\n", report.debug.stderr_tail));
    }
    out
}
