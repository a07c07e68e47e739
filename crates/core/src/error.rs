use thiserror::Error;

pub type CampaignResult<T> = Result<T, CampaignError>;

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Redis cache error: {0}")]
    Cache(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("{0} not found")]
    NotFound(String),

    /// A referenced node or edge is missing or malformed. Fatal to the
    /// execution that hit it, never retried.
    #[error("Flow graph integrity error: {0}")]
    GraphIntegrity(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CampaignError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        CampaignError::NotFound(what.to_string())
    }

    pub fn graph(msg: impl Into<String>) -> Self {
        CampaignError::GraphIntegrity(msg.into())
    }

    /// Graph integrity failures terminate the execution instead of being retried.
    pub fn is_fatal_to_execution(&self) -> bool {
        matches!(
            self,
            CampaignError::GraphIntegrity(_) | CampaignError::InvalidTransition(_)
        )
    }
}
