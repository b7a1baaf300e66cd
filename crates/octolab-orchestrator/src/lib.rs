pub mod error;
pub mod provision;
pub mod reconcile;
pub mod report;
pub mod teardown;
pub mod watchdog;

#[cfg(test)]
mod test_support;

pub use error::OrchestratorError;
pub use provision::{create_lab, create_lab_with_recipe, provision_lab, provision_lab_with_recipe};
pub use reconcile::reconcile_lab_on_read;
pub use report::{WatchdogAction, WatchdogEntry, WatchdogOutcome, WatchdogReport};
pub use teardown::{request_teardown, run_teardown_worker, teardown_one, teardown_worker_tick};
pub use watchdog::run_watchdog_sweep;
