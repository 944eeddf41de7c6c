//! LLM Provider Client
//!
//! OpenAI-compatible chat-completions client behind the `LlmProvider` trait.
//! Both agents hold a shared `Arc<dyn LlmProvider>`; swapping provider means
//! swapping base URL, model and key, not code.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// Provider-level error
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("empty completion")]
    EmptyResponse,
}

/// Message role in a chat completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling parameters for one completion call
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1024,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

impl From<&crate::config::AgentConfig> for SamplingParams {
    fn from(config: &crate::config::AgentConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            top_p: config.top_p,
            frequency_penalty: config.frequency_penalty,
            presence_penalty: config.presence_penalty,
        }
    }
}

/// One LLM endpoint: an ordered message list in, a completion text out.
///
/// Implementations must be safe for concurrent use - both agent loops call
/// into the same provider independently.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        sampling: &SamplingParams,
        json_mode: bool,
    ) -> Result<String, LlmError>;

    /// Model name, used for token counting heuristics
    fn model(&self) -> &str;
}

/// API request
#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: &'static str,
}

/// API response
#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// OpenAI-compatible chat-completions client (OpenAI, Groq, Cerebras,
/// DeepSeek, local gateways - anything speaking the same REST contract).
#[derive(Clone)]
pub struct OpenAiCompatClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatClient {
    pub fn new(api_key: &str, base_url: Option<&str>, model: &str) -> Self {
        Self::with_timeout(api_key, base_url, model, Duration::from_secs(120))
    }

    pub fn with_timeout(
        api_key: &str,
        base_url: Option<&str>,
        model: &str,
        timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url
                .unwrap_or(OPENAI_API_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    /// Create from provider config
    pub fn from_config(config: &crate::config::ProviderConfig) -> Self {
        Self::with_timeout(
            &config.api_key,
            config.base_url.as_deref(),
            &config.model,
            config.timeout,
        )
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        sampling: &SamplingParams,
        json_mode: bool,
    ) -> Result<String, LlmError> {
        let request = CompletionRequest {
            model: &self.model,
            messages,
            temperature: sampling.temperature,
            max_tokens: sampling.max_tokens,
            top_p: sampling.top_p,
            frequency_penalty: sampling.frequency_penalty,
            presence_penalty: sampling.presence_penalty,
            response_format: json_mode.then_some(ResponseFormat {
                r#type: "json_object",
            }),
        };

        debug!(
            "Calling {}: model={}, messages={}",
            self.base_url,
            self.model,
            messages.len()
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, message });
        }

        let result: CompletionResponse = response.json().await?;

        result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.is_empty())
            .ok_or(LlmError::EmptyResponse)
    }

    fn model(&self) -> &str {
        &self.model
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let msg = ChatMessage::system("be helpful");
        assert_eq!(msg.role, Role::System);
        assert_eq!(msg.content, "be helpful");
    }

    #[test]
    fn test_role_serialization() {
        let msg = ChatMessage::user("hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = OpenAiCompatClient::new("key", Some("https://api.groq.com/openai/v1/"), "m");
        assert_eq!(client.base_url, "https://api.groq.com/openai/v1");
    }

    #[test]
    fn test_json_mode_adds_response_format() {
        let request = CompletionRequest {
            model: "m",
            messages: &[],
            temperature: 0.7,
            max_tokens: 100,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            response_format: Some(ResponseFormat {
                r#type: "json_object",
            }),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["response_format"]["type"], "json_object");
    }
}
