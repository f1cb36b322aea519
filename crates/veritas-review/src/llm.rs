use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use veritas_core::{LlmConfig, VeritasError};

use crate::ports::LanguageModel;

/// A message in a chat conversation with the model.
///
/// # Examples
///
/// ```
/// use veritas_review::llm::{ChatMessage, Role};
///
/// let msg = ChatMessage::user("Review this code");
/// assert_eq!(msg.role, Role::User);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    /// Role of the message sender.
    pub role: Role,
    /// Text content of the message.
    pub content: String,
}

impl ChatMessage {
    /// A system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Role in the chat conversation.
///
/// # Examples
///
/// ```
/// use veritas_review::llm::Role;
///
/// assert_eq!(serde_json::to_string(&Role::System).unwrap(), "\"system\"");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions.
    System,
    /// User input.
    User,
    /// Assistant response.
    Assistant,
}

/// OpenAI-compatible chat completions client.
///
/// Works with any provider that exposes `/v1/chat/completions`: OpenAI,
/// Ollama, vLLM, LiteLLM and so on. One call is one request; retries belong
/// to the caller's [`RetryPolicy`](crate::retry::RetryPolicy).
///
/// # Examples
///
/// ```
/// use veritas_core::LlmConfig;
/// use veritas_review::llm::LlmClient;
///
/// let config = LlmConfig {
///     api_key: Some("test-key".into()),
///     ..LlmConfig::default()
/// };
/// let client = LlmClient::new(&config).unwrap();
/// assert_eq!(client.endpoint(), "https://api.openai.com/v1/chat/completions");
/// ```
pub struct LlmClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    /// Create a new client from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`VeritasError::Llm`] if the HTTP client cannot be built.
    pub fn new(config: &LlmConfig) -> Result<Self, VeritasError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| VeritasError::Llm(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Full URL of the chat completions endpoint.
    pub fn endpoint(&self) -> String {
        let base_url = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com")
            .trim_end_matches('/');
        format!("{base_url}/v1/chat/completions")
    }

    /// Send a chat completion request and return the text response.
    ///
    /// # Errors
    ///
    /// - [`VeritasError::Transport`] for connection failures, timeouts and 5xx
    /// - [`VeritasError::RateLimited`] for 429, with the `Retry-After` hint
    /// - [`VeritasError::Llm`] for other non-success statuses
    /// - [`VeritasError::MalformedModelOutput`] when the body has no usable text
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<String, VeritasError> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": 0.2,
        });

        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| VeritasError::Transport(format!("LLM request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(response.headers());
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_failure(status.as_u16(), retry_after, &body_text));
        }

        let response_body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| VeritasError::MalformedModelOutput(format!("unreadable response: {e}")))?;
        extract_content(&response_body)
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, VeritasError> {
        self.chat(messages).await
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

/// Parse a `Retry-After` header given in seconds.
pub(crate) fn retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn classify_failure(status: u16, retry_after: Option<Duration>, body: &str) -> VeritasError {
    match status {
        429 => VeritasError::RateLimited { retry_after },
        500..=599 => VeritasError::Transport(format!("LLM API error {status}: {body}")),
        _ => VeritasError::Llm(format!("LLM API error {status}: {body}")),
    }
}

fn extract_content(body: &serde_json::Value) -> Result<String, VeritasError> {
    let content = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| {
            VeritasError::MalformedModelOutput(format!("unexpected response structure: {body}"))
        })?;
    Ok(content.to_string())
}
