use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "octolab", about = "Lab orchestrator for security exercises", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP API plus the teardown worker (all configuration from
    /// `OCTOLAB_*` environment variables).
    Serve,

    /// Read-only diagnostics: binaries present, database reachable, gateway
    /// reachable. Exits non-zero if any check fails.
    Doctor {
        /// Emit a single JSON object instead of the human-readable report.
        #[arg(long)]
        json: bool,
    },

    /// Run one stuck-ENDING watchdog sweep and print what it found/did.
    Watchdog {
        /// Minutes a lab must have been ENDING to be considered stuck.
        #[arg(long, default_value_t = 15)]
        threshold_minutes: i64,

        /// What to do with a stuck lab.
        #[arg(long, value_enum, default_value_t = WatchdogActionArg::ForceTeardown)]
        action: WatchdogActionArg,

        /// Report what the sweep would do without acting.
        #[arg(long)]
        dry_run: bool,

        /// Operate on exactly this lab, bypassing the age/status filter.
        #[arg(long)]
        lab_id: Option<Uuid>,
    },

    /// Boot a minimal microVM under a bounded timeout and verify it comes up
    /// cleanly, without provisioning a real lab.
    Smoke {
        /// Keep the ephemeral state directory even when the run succeeds.
        #[arg(long)]
        keep_on_success: bool,

        /// Emit a single JSON record instead of the human-readable summary.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WatchdogActionArg {
    ForceTeardown,
    Fail,
}
