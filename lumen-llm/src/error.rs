use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Any failure of the upstream call: network, auth, provider-side error,
    /// malformed response or timeout.
    #[error("model invocation failed: {0}")]
    Invocation(String),
}

impl LlmError {
    /// Provider context without the classification prefix.
    pub fn context(&self) -> &str {
        match self {
            Self::InvalidInput(msg) | Self::Invocation(msg) => msg,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        Self::Invocation(format!("http error: {e}"))
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::Invocation(format!("unexpected response format: {e}"))
    }
}
