//! OpenAI-compatible completion client.
//!
//! Sends streaming chat completion requests and hands back the text
//! fragments as they arrive. The orchestrator only sees the
//! [`CompletionEngine`] trait, so tests can script responses.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client as HttpClient;

use super::config::ModelConfig;
use super::errors::InferenceError;
use super::streaming::parse_sse_stream;
use super::types::{ChatCompletionRequest, ChatMessage};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Fragments of a streamed completion, in arrival order.
pub type TextStream = BoxStream<'static, Result<String, InferenceError>>;

/// Something that can stream a chat completion.
#[async_trait]
pub trait CompletionEngine: Send + Sync {
    /// Model identifier, for logging.
    fn model_name(&self) -> &str;

    /// Start a streaming completion over `messages`.
    ///
    /// Errors returned here mean the request never produced a stream;
    /// errors inside the stream mean it broke part-way.
    async fn stream_completion(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<TextStream, InferenceError>;
}

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// HTTP client for a single OpenAI-compatible endpoint.
pub struct InferenceClient {
    http: HttpClient,
    config: ModelConfig,
}

impl InferenceClient {
    /// Build a client. Does NOT check connectivity; that happens on the
    /// first request.
    pub fn new(config: ModelConfig) -> Result<Self, InferenceError> {
        if config.base_url.trim().is_empty() {
            return Err(InferenceError::ConfigError {
                reason: "model.base_url is empty".to_string(),
            });
        }

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.stream_timeout_secs))
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: config.base_url.clone(),
                reason: format!("failed to build streaming HTTP client: {e}"),
            })?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn map_send_error(&self, url: &str, e: reqwest::Error) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout {
                duration_secs: self.config.stream_timeout_secs,
            }
        } else {
            InferenceError::ConnectionFailed {
                endpoint: url.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl CompletionEngine for InferenceClient {
    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    async fn stream_completion(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<TextStream, InferenceError> {
        let url = self.completions_url();
        let body = ChatCompletionRequest {
            model: self.config.model_name.clone(),
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: true,
        };

        // Metadata only; message bodies can be large.
        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            max_tokens = body.max_tokens,
            stream = body.stream,
            "=== LLM REQUEST ==="
        );

        let mut request = self
            .http
            .post(&url)
            .json(&body)
            .header("Accept", "text/event-stream");
        match self.config.resolved_api_key() {
            Some(key) => request = request.bearer_auth(key),
            None => tracing::warn!(
                env = %self.config.api_key_env,
                "no API key configured, sending unauthenticated request"
            ),
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.map_send_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        Ok(parse_sse_stream(response).boxed())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
