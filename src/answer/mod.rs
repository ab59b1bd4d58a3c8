//! Answer retrieval
//!
//! A question goes out as one request to a remote language model; one
//! answer string comes back or the attempt fails. There is no retry.

mod openrouter;

use async_trait::async_trait;

pub use openrouter::{AnswerConfig, OpenRouterClient};

/// Failures of the answer service
#[derive(Debug, thiserror::Error)]
pub enum AnswerError {
    #[error("no API key configured")]
    MissingApiKey,

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("answer service returned status {0}")]
    Status(u16),

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("response contained no answer")]
    Empty,
}

/// Turns a question into an answer
#[async_trait]
pub trait AnswerService: Send + Sync {
    async fn ask(&self, question: &str) -> Result<String, AnswerError>;
}
