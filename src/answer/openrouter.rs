//! OpenAI-compatible chat completions client (OpenRouter by default)

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{AnswerError, AnswerService};

/// Default chat completions endpoint
pub const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Default model
pub const DEFAULT_MODEL: &str = "openai/gpt-oss-120b:free";

/// Instruction sent ahead of every question
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful voice assistant. Keep responses concise and conversational, under 50 words.";

/// Connection settings for the answer service
#[derive(Clone)]
pub struct AnswerConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub system_prompt: String,
    /// Sent as `X-Title` so the provider can attribute traffic
    pub title: String,
    pub timeout: Duration,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            title: "Yo-Hi Voice Assistant".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

// Keep the key out of logs
impl std::fmt::Debug for AnswerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Answer service backed by a chat completions endpoint
pub struct OpenRouterClient {
    client: reqwest::Client,
    config: AnswerConfig,
}

impl OpenRouterClient {
    pub fn new(config: AnswerConfig) -> Result<Self, AnswerError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl AnswerService for OpenRouterClient {
    async fn ask(&self, question: &str) -> Result<String, AnswerError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(AnswerError::MissingApiKey)?;

        let body = ChatRequest {
            model: &self.config.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &self.config.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: question,
                },
            ],
        };

        info!(model = %self.config.model, "asking answer service");

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(api_key)
            .header("X-Title", &self.config.title)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AnswerError::Status(status.as_u16()));
        }

        let payload = response.text().await?;
        let parsed: ChatResponse = serde_json::from_str(&payload)?;

        let answer = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or(AnswerError::Empty)?;

        debug!(chars = answer.len(), "answer received");
        Ok(answer)
    }
}
