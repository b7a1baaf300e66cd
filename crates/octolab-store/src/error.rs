use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lab not found: {0}")]
    LabNotFound(String),

    #[error("port reservation not found for lab {0}")]
    ReservationNotFound(String),

    #[error("no free port available in the configured range")]
    PortRangeExhausted,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}
