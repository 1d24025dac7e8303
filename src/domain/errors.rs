use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Entity not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OutboxError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

pub type OutboxResult<T> = Result<T, OutboxError>;
