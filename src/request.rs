//! Request Layer
//!
//! Shared LLM request machinery for both agents: message assembly over a
//! per-agent history, exponential-backoff retry, rate-limit detection with
//! extracted wait times, and tolerant structured-response parsing.
//!
//! Rate-limit waits do not consume the retry budget - the provider told us
//! when to come back, so the attempt is replayed in the same slot.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::llm::{ChatMessage, LlmError, LlmProvider, SamplingParams};

const MAX_RETRIES: usize = 3;
const BASE_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Wait when a rate limit is detected but no duration is extractable
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// Request layer error
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: usize,
        #[source]
        source: LlmError,
    },
}

/// Per-agent LLM request handle
///
/// Owns the agent's system prompt, conversation history and sampling
/// parameters; shares the provider with the other agent.
pub struct Requester {
    provider: Arc<dyn LlmProvider>,
    config: AgentConfig,
    system_prompt: String,
    history: Vec<ChatMessage>,
    max_retries: usize,
    base_delay: Duration,
}

impl Requester {
    pub fn new(provider: Arc<dyn LlmProvider>, config: AgentConfig) -> Self {
        Self {
            provider,
            config,
            system_prompt: String::new(),
            history: Vec::new(),
            max_retries: MAX_RETRIES,
            base_delay: BASE_RETRY_DELAY,
        }
    }

    /// Override the retry budget (tests use short delays)
    pub fn with_retry(mut self, max_retries: usize, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn set_history(&mut self, history: Vec<ChatMessage>) {
        self.history = history;
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Send a request and return the completion text
    ///
    /// Message order: system prompt, optional context block, prior history
    /// (when `include_history`), then the prompt. On success the user and
    /// assistant turns are appended to the history.
    pub async fn think(
        &mut self,
        prompt: &str,
        context: Option<&str>,
        include_history: bool,
        structured: bool,
    ) -> Result<String, RequestError> {
        let mut messages = Vec::new();

        if !self.system_prompt.is_empty() {
            messages.push(ChatMessage::system(self.system_prompt.clone()));
        }
        if let Some(context) = context {
            messages.push(ChatMessage::system(format!("Context:\n{context}")));
        }
        if include_history {
            messages.extend(self.history.iter().cloned());
        }
        messages.push(ChatMessage::user(prompt));

        let response = self.request_with_retry(&messages, structured).await?;

        self.history.push(ChatMessage::user(prompt));
        self.history.push(ChatMessage::assistant(response.clone()));

        Ok(response)
    }

    async fn request_with_retry(
        &self,
        messages: &[ChatMessage],
        structured: bool,
    ) -> Result<String, RequestError> {
        let sampling = SamplingParams::from(&self.config);
        let mut last_error = None;
        let mut attempt = 0;

        while attempt < self.max_retries {
            match self.provider.complete(messages, &sampling, structured).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    let message = e.to_string().to_lowercase();

                    if let Some(wait) = extract_wait_time(&message) {
                        info!("Rate limit hit, waiting {:.0}s", wait.as_secs_f64());
                        last_error = Some(e);
                        tokio::time::sleep(wait).await;
                        // Replay the same attempt slot
                        continue;
                    }

                    warn!(
                        "LLM request failed (attempt {}/{}): {e}",
                        attempt + 1,
                        self.max_retries
                    );
                    last_error = Some(e);
                    attempt += 1;

                    if attempt < self.max_retries {
                        let delay = self.base_delay * 2u32.pow(attempt as u32 - 1);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        error!("LLM request failed after {} attempts", self.max_retries);
        Err(RequestError::Exhausted {
            attempts: self.max_retries,
            source: last_error.unwrap_or(LlmError::EmptyResponse),
        })
    }
}

static COMBINED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)m(\d+)s").unwrap());
static SECONDS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\s*(?:seconds?|secs?|s\b)").unwrap());
static MINUTES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\s*(?:minutes?|mins?|m\b)").unwrap());
static HOURS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s*(?:hours?|hrs?|h\b)").unwrap());
static RETRY_AFTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"retry[-_\s]?after[:\s]+(\d+)").unwrap());

const RATE_LIMIT_KEYWORDS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "quota exceeded",
    "limit exceeded",
    "retry after",
    "retry-after",
    "please try again",
];

/// Extract a wait duration from a rate-limit error message
///
/// Returns None when the message is not a rate-limit error at all. A
/// one-second buffer is added to every extracted value; a detected rate
/// limit without a usable number falls back to 60s.
pub fn extract_wait_time(message: &str) -> Option<Duration> {
    if !RATE_LIMIT_KEYWORDS.iter().any(|kw| message.contains(kw)) {
        return None;
    }

    // "1m30s" must win over the bare-seconds pattern inside it
    if let Some(caps) = COMBINED_RE.captures(message) {
        let minutes: u64 = caps[1].parse().ok()?;
        let seconds: u64 = caps[2].parse().ok()?;
        return Some(Duration::from_secs(minutes * 60 + seconds + 1));
    }

    if let Some(caps) = SECONDS_RE.captures(message) {
        let seconds: u64 = caps[1].parse().ok()?;
        return Some(Duration::from_secs(seconds + 1));
    }

    if let Some(caps) = MINUTES_RE.captures(message) {
        let minutes: u64 = caps[1].parse().ok()?;
        return Some(Duration::from_secs(minutes * 60 + 1));
    }

    if let Some(caps) = HOURS_RE.captures(message) {
        let hours: u64 = caps[1].parse().ok()?;
        return Some(Duration::from_secs(hours * 3600 + 1));
    }

    if let Some(caps) = RETRY_AFTER_RE.captures(message) {
        let seconds: u64 = caps[1].parse().ok()?;
        return Some(Duration::from_secs(seconds + 1));
    }

    debug!("Rate limit detected without a wait time, defaulting to 60s");
    Some(DEFAULT_RATE_LIMIT_WAIT)
}

/// Parse a structured (JSON) model response, tolerating the usual damage
///
/// Recovery ladder: strip a fenced code block, strict parse, extract the
/// first-`{`-to-last-`}` substring, bracket-balance repair. Returns None
/// when every stage fails - malformed model output is an expected condition
/// here, never an error.
pub fn parse_structured(response: &str) -> Option<serde_json::Value> {
    let mut text = response.trim();

    if text.starts_with("```") {
        if let Some(newline) = text.find('\n') {
            text = &text[newline + 1..];
        }
        text = text.trim_end();
        if let Some(stripped) = text.strip_suffix("```") {
            text = stripped;
        }
        text = text.trim();
    }

    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }

    debug!("Strict JSON parse failed, extracting object substring");

    // A truncated response may have lost its closing brace entirely; in that
    // case the candidate runs to the end of the text and repair closes it.
    let start = text.find('{')?;
    let candidate = match text.rfind('}') {
        Some(end) if end > start => &text[start..=end],
        _ => &text[start..],
    };

    if let Ok(value) = serde_json::from_str(candidate) {
        return Some(value);
    }

    let repaired = repair_json(candidate)?;
    serde_json::from_str(&repaired).ok()
}

/// Attempt to repair truncated JSON: close an unterminated string, then
/// append missing `]` and `}` in count order.
fn repair_json(text: &str) -> Option<String> {
    let mut in_string = false;
    let mut escaped = false;
    let mut open_braces = 0i64;
    let mut close_braces = 0i64;
    let mut open_brackets = 0i64;
    let mut close_brackets = 0i64;

    for c in text.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => open_braces += 1,
            '}' if !in_string => close_braces += 1,
            '[' if !in_string => open_brackets += 1,
            ']' if !in_string => close_brackets += 1,
            _ => {}
        }
    }

    let mut repaired = text.to_string();

    if in_string {
        repaired.push('"');
    }
    for _ in 0..(open_brackets - close_brackets).max(0) {
        repaired.push(']');
    }
    for _ in 0..(open_braces - close_braces).max(0) {
        repaired.push('}');
    }

    (repaired != text).then_some(repaired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{FailingProvider, ScriptedProvider};
    use serde_json::json;

    #[test]
    fn test_fenced_block_matches_unwrapped() {
        let inner = r#"{"thought": "hm", "commands": []}"#;
        let fenced = format!("```json\n{inner}\n```");

        assert_eq!(parse_structured(inner), parse_structured(&fenced));
        assert_eq!(
            parse_structured(&fenced).unwrap()["thought"],
            json!("hm")
        );
    }

    #[test]
    fn test_surrounding_prose_stripped() {
        let text = r#"Sure! Here is the JSON: {"a": 1} Hope that helps."#;
        assert_eq!(parse_structured(text).unwrap()["a"], json!(1));
    }

    #[test]
    fn test_repair_missing_braces() {
        let truncated = r#"{"a": {"b": [1, 2"#;
        let value = parse_structured(truncated).unwrap();
        assert_eq!(value["a"]["b"], json!([1, 2]));
    }

    #[test]
    fn test_repair_unterminated_string() {
        let truncated = r#"{"message": "hello wor"#;
        let value = parse_structured(truncated).unwrap();
        assert_eq!(value["message"], json!("hello wor"));
    }

    #[test]
    fn test_brace_inside_string_not_counted() {
        let text = r#"{"note": "use {braces} freely"}"#;
        assert_eq!(parse_structured(text).unwrap()["note"], json!("use {braces} freely"));
    }

    #[test]
    fn test_hopeless_input_returns_none() {
        assert!(parse_structured("no json here at all").is_none());
        assert!(parse_structured("").is_none());
    }

    #[test]
    fn test_wait_time_seconds() {
        let wait = extract_wait_time("rate limit exceeded. retry after 60 seconds").unwrap();
        assert_eq!(wait, Duration::from_secs(61));
    }

    #[test]
    fn test_wait_time_combined() {
        let wait = extract_wait_time("please try again in 1m30s").unwrap();
        assert_eq!(wait, Duration::from_secs(91));
    }

    #[test]
    fn test_wait_time_retry_after_header() {
        let wait = extract_wait_time("retry-after: 120").unwrap();
        assert_eq!(wait, Duration::from_secs(121));
    }

    #[test]
    fn test_wait_time_minutes_and_hours() {
        assert_eq!(
            extract_wait_time("quota exceeded, wait 2 minutes").unwrap(),
            Duration::from_secs(121)
        );
        assert_eq!(
            extract_wait_time("quota exceeded, wait 1 hour").unwrap(),
            Duration::from_secs(3601)
        );
    }

    #[test]
    fn test_wait_time_default() {
        let wait = extract_wait_time("too many requests").unwrap();
        assert_eq!(wait, Duration::from_secs(60));
    }

    #[test]
    fn test_not_a_rate_limit() {
        assert!(extract_wait_time("connection reset by peer").is_none());
        assert!(extract_wait_time("internal server error 500").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let provider = Arc::new(FailingProvider::new("internal server error"));
        let mut requester = Requester::new(provider.clone(), AgentConfig::default())
            .with_retry(3, Duration::from_millis(10));

        let result = requester.think("hello", None, false, false).await;

        assert!(matches!(
            result,
            Err(RequestError::Exhausted { attempts: 3, .. })
        ));
        assert_eq!(provider.call_count(), 3);
        // Failure must not pollute the history
        assert!(requester.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_does_not_consume_budget() {
        // Two rate-limit errors, then success: would exhaust a 2-attempt
        // budget if the waits counted against it.
        let provider = Arc::new(ScriptedProvider::with_script(vec![
            Err("rate limit exceeded. retry after 1 seconds".to_string()),
            Err("rate limit exceeded. retry after 1 seconds".to_string()),
            Ok("finally".to_string()),
        ]));
        let mut requester = Requester::new(provider, AgentConfig::default())
            .with_retry(2, Duration::from_millis(10));

        let response = requester.think("hello", None, false, false).await.unwrap();
        assert_eq!(response, "finally");
    }

    #[tokio::test]
    async fn test_history_grows_on_success() {
        let provider = Arc::new(ScriptedProvider::new(vec!["hi there", "again"]));
        let mut requester = Requester::new(provider, AgentConfig::default());

        requester.think("hello", None, true, false).await.unwrap();
        assert_eq!(requester.history().len(), 2);

        requester.think("more", None, true, false).await.unwrap();
        assert_eq!(requester.history().len(), 4);
    }

    #[tokio::test]
    async fn test_context_block_included() {
        let provider = Arc::new(ScriptedProvider::new(vec!["ok"]));
        let mut requester = Requester::new(provider.clone(), AgentConfig::default());
        requester.set_system_prompt("be brief");

        requester
            .think("question", Some("relevant facts"), false, false)
            .await
            .unwrap();

        // The scripted provider records the last user message
        assert_eq!(provider.prompts(), vec!["question".to_string()]);
    }
}
