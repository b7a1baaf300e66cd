use thiserror::Error;

/// Failures from the lab lifecycle entrypoints (spec §4.1, §7).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("config error: {0}")]
    Config(#[from] octolab_config::ConfigError),

    #[error("store error: {0}")]
    Store(#[from] octolab_store::StoreError),

    #[error("driver error: {0}")]
    Driver(#[from] octolab_driver::DriverError),

    #[error("evidence error: {0}")]
    Evidence(#[from] octolab_evidence::EvidenceError),

    #[error("gateway error: {0}")]
    Gateway(#[from] octolab_gateway::GatewayError),

    #[error("domain error: {0}")]
    Domain(#[from] octolab_domain::DomainError),

    #[error("active lab quota exceeded")]
    QuotaExceeded,

    #[error("no recipe matches the requested intent")]
    RecipeNotFound,

    #[error("lab {0} not found")]
    LabNotFound(octolab_domain::LabId),

    #[error("provisioning timed out after {0:?}")]
    ProvisionTimeout(std::time::Duration),

    #[error("internal orchestrator error: {0}")]
    Internal(String),
}
