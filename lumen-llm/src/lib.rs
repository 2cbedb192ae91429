//! BYO-key client for the hosted generative-language provider.
//!
//! Pure HTTP client: one bounded call per invocation, every provider failure
//! collapsed into [`LlmError::Invocation`].

mod client;
mod error;
mod gemini;
mod types;

pub use client::{
    DEFAULT_BASE_URL, DEFAULT_MODEL, DEFAULT_TIMEOUT, ModelClient, ModelClientConfig, TextGenerator,
};
pub use error::{LlmError, Result};
pub use types::{ModelInfo, ModelRequest, ModelResponse};
