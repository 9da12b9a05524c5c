use thiserror::Error;

pub type Result<T> = std::result::Result<T, AwsError>;

#[derive(Debug, Error)]
pub enum AwsError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Instance metadata unavailable: {0}")]
    Metadata(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Client setup failed: {0}")]
    Setup(String),
}

impl From<reqwest::Error> for AwsError {
    fn from(err: reqwest::Error) -> Self {
        AwsError::Network(err.to_string())
    }
}

impl From<quick_xml::DeError> for AwsError {
    fn from(err: quick_xml::DeError) -> Self {
        AwsError::Parse(err.to_string())
    }
}

impl From<url::ParseError> for AwsError {
    fn from(err: url::ParseError) -> Self {
        AwsError::InvalidEndpoint(err.to_string())
    }
}
