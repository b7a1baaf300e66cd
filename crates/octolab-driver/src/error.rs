use thiserror::Error;

/// Typed failures a [`crate::driver::RuntimeDriver`] call can report. These map
/// directly onto the client-facing error kinds in spec §7.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("network/subnet pool exhausted")]
    PoolExhausted,

    #[error("host port {0} already in use")]
    PortCollision(u16),

    #[error("cleanup blocked by containers: {0:?}")]
    CleanupBlocked(Vec<String>),

    #[error("stale runtime image: {0}")]
    StaleImage(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("invalid resource name, refusing to operate: {0}")]
    InvalidName(String),

    #[error("runtime error: {0}")]
    RuntimeError(String),

    #[error("internal driver error: {0}")]
    Internal(String),

    #[error("no driver registered for runtime {0}")]
    DriverNotConfigured(octolab_domain::Runtime),
}
