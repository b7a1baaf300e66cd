use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid lab status transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("invalid resource name: {0}")]
    InvalidResourceName(String),

    #[error("evidence_expires_at already set for lab {0}; refusing to move it backward")]
    EvidenceExpiryAlreadySet(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
