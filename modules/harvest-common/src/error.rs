use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
