use thiserror::Error;

/// Typed failures from the remote-desktop gateway integration (spec §4.6).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway integration is disabled")]
    Disabled,

    #[error("gateway preflight failed: {0}")]
    PreflightFailed(String),

    #[error("gateway admin authentication failed")]
    AuthFailed,

    #[error("gateway http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway returned an unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("credential encryption error: {0}")]
    Crypto(String),

    #[error("internal gateway error: {0}")]
    Internal(String),
}
