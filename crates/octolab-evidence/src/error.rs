use thiserror::Error;

/// Typed failures from sealing, verifying, or bundling lab evidence
/// (spec §4.5, §7).
#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("evidence has not been sealed for this lab")]
    NotSealed,

    #[error("evidence verification failed: {0}")]
    VerificationFailed(String),

    #[error("extraction produced an unsafe archive entry: {0}")]
    SafeExtract(#[from] octolab_driver::safe_extract::SafeExtractError),

    #[error(transparent)]
    Driver(#[from] octolab_driver::DriverError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("internal evidence error: {0}")]
    Internal(String),
}
