pub mod container;
pub mod dockerfile;
pub mod driver;
pub mod error;
pub mod guest_agent;
pub mod microvm;
pub mod redact;
pub mod registry;
pub mod safe_extract;
pub mod smoke;
pub mod subprocess;

pub use driver::{CreateOutcome, RuntimeDriver, TeardownReport};
pub use error::DriverError;
pub use registry::DriverRegistry;
pub use smoke::{run_smoke_test, SmokeReport};
