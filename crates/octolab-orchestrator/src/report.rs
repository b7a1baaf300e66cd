use octolab_domain::LabId;
use serde::{Deserialize, Serialize};

/// What the stuck-ENDING watchdog should do with a lab it finds (spec
/// §4.7). An operator chooses the action; the watchdog never decides for
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogAction {
    /// Re-run the same teardown path the worker would have used.
    ForceTeardown,
    /// Mark the lab FAILED without attempting teardown again.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WatchdogOutcome {
    Finished,
    Failed,
    StillEnding,
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogEntry {
    pub lab_id: LabId,
    pub stuck_for_minutes: i64,
    pub outcome: WatchdogOutcome,
}

/// Result of one watchdog sweep (spec §4.7, §8 scenario S7). `dry_run`
/// runs exactly the same selection and age computation but takes no
/// action — every entry is reported as `StillEnding`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogReport {
    pub dry_run: bool,
    pub action: WatchdogAction,
    pub threshold_minutes: i64,
    pub entries: Vec<WatchdogEntry>,
}

impl WatchdogReport {
    pub fn new(dry_run: bool, action: WatchdogAction, threshold_minutes: i64) -> Self {
        Self { dry_run, action, threshold_minutes, entries: Vec::new() }
    }
}
