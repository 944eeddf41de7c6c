//! Context Reducer
//!
//! Keeps per-agent conversation histories inside the model's context window.
//! Older turns are summarized through the provider; if the summarization call
//! fails, the reducer falls back to plain truncation so the agent loop never
//! stalls on a full context.

use std::sync::Arc;
use tracing::{info, warn};

use crate::llm::{ChatMessage, LlmProvider, Role, SamplingParams};
use crate::prompts;
use crate::tokenizer::{model_context_limit, TokenCounter};

/// Tokens reserved for the system prompt and the response
const RESERVED_TOKENS: usize = 1500;
/// Recent messages preserved verbatim through a reduction
const PRESERVE_LAST: usize = 4;

/// History compression for a single agent
pub struct ContextReducer {
    provider: Arc<dyn LlmProvider>,
    counter: TokenCounter,
    effective_limit: usize,
}

impl ContextReducer {
    /// Create a reducer for the provider's model
    ///
    /// `max_context_tokens` overrides the auto-detected window;
    /// `compression_threshold` is the fraction of the usable window at which
    /// reduction triggers.
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        max_context_tokens: Option<usize>,
        compression_threshold: f32,
    ) -> Self {
        let max_tokens =
            max_context_tokens.unwrap_or_else(|| model_context_limit(provider.model()));
        let effective_limit = ((max_tokens.saturating_sub(RESERVED_TOKENS)) as f32
            * compression_threshold) as usize;

        let counter = TokenCounter::for_model(provider.model());

        info!(
            "Context reducer ready: window={max_tokens}, effective limit={effective_limit}"
        );

        Self {
            provider,
            counter,
            effective_limit,
        }
    }

    /// Token count for a message list
    pub fn count_tokens(&self, messages: &[ChatMessage]) -> usize {
        self.counter.count_messages(messages)
    }

    /// Whether the history has outgrown the effective limit
    pub fn needs_reduction(&self, messages: &[ChatMessage]) -> bool {
        self.count_tokens(messages) > self.effective_limit
    }

    /// Reduce a history by compressing everything but the most recent turns
    /// into a single summary message. Returns the input unchanged when no
    /// reduction is needed.
    pub async fn reduce(&self, messages: &[ChatMessage]) -> Vec<ChatMessage> {
        if !self.needs_reduction(messages) {
            return messages.to_vec();
        }

        let (system, non_system): (Vec<_>, Vec<_>) = messages
            .iter()
            .cloned()
            .partition(|m| m.role == Role::System);

        if non_system.len() <= PRESERVE_LAST {
            return messages.to_vec();
        }

        let split = non_system.len() - PRESERVE_LAST;
        let (to_compress, to_preserve) = non_system.split_at(split);

        info!("Compressing {} history messages", to_compress.len());

        let transcript = to_compress
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::System => "system",
                };
                format!("[{role}] {}", m.content)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let summary = match self.compress(&transcript).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!("History compression failed, truncating instead: {e}");
                let mut result = system;
                result.extend_from_slice(to_preserve);
                return result;
            }
        };

        let mut result = system;
        result.push(ChatMessage::system(format!(
            "Summary of earlier conversation:\n{summary}"
        )));
        result.extend_from_slice(to_preserve);
        result
    }

    async fn compress(&self, transcript: &str) -> Result<String, crate::llm::LlmError> {
        let sampling = SamplingParams {
            temperature: 0.3,
            max_tokens: 512,
            ..SamplingParams::default()
        };

        let messages = vec![ChatMessage::user(prompts::compression_prompt(transcript))];
        self.provider.complete(&messages, &sampling, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{FailingProvider, ScriptedProvider};

    fn long_history(turns: usize) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system("be helpful")];
        for i in 0..turns {
            messages.push(ChatMessage::user(format!("question {i}: {}", "x".repeat(400))));
            messages.push(ChatMessage::assistant(format!("answer {i}: {}", "y".repeat(400))));
        }
        messages
    }

    #[test]
    fn test_short_history_needs_no_reduction() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let reducer = ContextReducer::new(provider, Some(8192), 0.8);

        let messages = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        assert!(!reducer.needs_reduction(&messages));
    }

    #[tokio::test]
    async fn test_reduce_compresses_old_turns() {
        let provider = Arc::new(ScriptedProvider::new(vec!["they discussed many questions"]));
        // Tiny window forces a reduction
        let reducer = ContextReducer::new(provider, Some(2000), 0.5);

        let messages = long_history(10);
        assert!(reducer.needs_reduction(&messages));

        let reduced = reducer.reduce(&messages).await;

        // system + summary + last 4 preserved
        assert_eq!(reduced.len(), 6);
        assert!(reduced[1].content.contains("Summary of earlier conversation"));
        assert_eq!(reduced.last().unwrap().content, messages.last().unwrap().content);
    }

    #[tokio::test]
    async fn test_reduce_falls_back_to_truncation() {
        let provider = Arc::new(FailingProvider::new("provider down"));
        let reducer = ContextReducer::new(provider, Some(2000), 0.5);

        let messages = long_history(10);
        let reduced = reducer.reduce(&messages).await;

        // system + last 4, no summary
        assert_eq!(reduced.len(), 5);
        assert!(!reduced.iter().any(|m| m.content.contains("Summary")));
    }

    #[tokio::test]
    async fn test_reduce_noop_when_under_limit() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let reducer = ContextReducer::new(provider, Some(8192), 0.8);

        let messages = vec![ChatMessage::user("hi")];
        let reduced = reducer.reduce(&messages).await;
        assert_eq!(reduced.len(), 1);
    }
}
