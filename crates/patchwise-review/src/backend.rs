//! Language-model backends.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use patchwise_core::BackendSettings;

use crate::error::ReviewError;
use crate::Result;

/// Text-in, text-out completion service.
#[async_trait]
pub trait ReviewBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, system: Option<&str>, user: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` client.
pub struct OpenAiBackend {
    settings: BackendSettings,
    http_client: reqwest::Client,
    base_delay: Duration,
}

impl OpenAiBackend {
    pub fn new(settings: BackendSettings) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("patchwise/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(settings.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| ReviewError::Unavailable(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            settings,
            http_client,
            base_delay: Duration::from_millis(500),
        })
    }

    /// Delay before the first retry; doubles on every attempt.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.api_base.trim_end_matches('/')
        )
    }

    /// Model id as the API expects it. Accepts `openai/<model>` for
    /// compatibility with provider-prefixed names.
    fn model(&self) -> &str {
        self.settings
            .model
            .strip_prefix("openai/")
            .unwrap_or(&self.settings.model)
    }
}

fn is_retryable(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[async_trait]
impl ReviewBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, system: Option<&str>, user: &str) -> Result<String> {
        let api_key = self
            .settings
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(ReviewError::MissingApiKey)?;

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: user,
        });
        let request = ChatRequest {
            model: self.model(),
            messages,
            stream: false,
        };

        let endpoint = self.endpoint();
        let mut attempt: u32 = 0;
        loop {
            debug!(endpoint = %endpoint, model = %request.model, attempt, "sending completion request");
            let response = self
                .http_client
                .post(&endpoint)
                .bearer_auth(api_key)
                .json(&request)
                .send()
                .await
                .map_err(|e| ReviewError::Unavailable(e.to_string()))?;

            let status = response.status();
            if status.is_success() {
                let body: ChatResponse = response
                    .json()
                    .await
                    .map_err(|e| ReviewError::InvalidResponse(e.to_string()))?;
                return body
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| ReviewError::InvalidResponse("no completion in response".into()));
            }

            let body = response.text().await.unwrap_or_default();
            if !is_retryable(status) {
                return Err(ReviewError::Http {
                    status: status.as_u16(),
                    body: body.chars().take(500).collect(),
                });
            }
            if attempt >= self.settings.max_retries {
                return Err(ReviewError::Unavailable(format!(
                    "HTTP {} after {} attempts",
                    status.as_u16(),
                    attempt + 1
                )));
            }

            let delay = self.base_delay * 2u32.saturating_pow(attempt);
            warn!(status = status.as_u16(), retry_in_ms = delay.as_millis() as u64, "completion request failed, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_and_model() {
        let settings = BackendSettings {
            api_base: "http://localhost:8080/v1/".to_string(),
            model: "openai/gpt-4o".to_string(),
            ..BackendSettings::default()
        };
        let backend = OpenAiBackend::new(settings).unwrap();
        assert_eq!(backend.endpoint(), "http://localhost:8080/v1/chat/completions");
        assert_eq!(backend.model(), "gpt-4o");
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(reqwest::StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(reqwest::StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn test_missing_key_fails_fast() {
        let backend = OpenAiBackend::new(BackendSettings::default()).unwrap();
        let err = backend.complete(None, "hi").await.unwrap_err();
        assert!(matches!(err, ReviewError::MissingApiKey));
    }
}
