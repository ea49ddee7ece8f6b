//! Chat-completions adapter for the AI text service.
//!
//! Builds `{model, messages, temperature}` requests, posts them through the
//! [`RetryClient`], and surfaces provider error bodies
//! (`{"error": {"message", "type"}}`) as typed [`ApiError`]s.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

use lexiforge_shared::{ApiError, ApiErrorKind, LexiforgeError, Result};

use crate::http::RetryClient;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// A chat-completions request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl ChatRequest {
    /// Single user-message request.
    pub fn single(model: impl Into<String>, prompt: impl Into<String>, temperature: f32) -> Self {
        Self {
            model: model.into(),
            messages: vec![ChatMessage::user(prompt)],
            temperature: Some(temperature),
        }
    }

    /// Reject requests the provider would refuse anyway.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(LexiforgeError::validation("chat request: model is empty"));
        }
        if self.messages.is_empty() {
            return Err(LexiforgeError::validation("chat request: no messages"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub index: u32,
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

/// A chat-completions response. Always has at least one choice when
/// returned from [`ChatModel::send_message`].
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// Text of the first choice.
    pub fn content(&self) -> Result<&str> {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or(LexiforgeError::EmptyResponse)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

/// Map a non-success response body to a typed provider error when it has
/// the provider's error shape; otherwise keep the raw status error.
fn map_error_body(status: u16, body: String) -> LexiforgeError {
    match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => {
            let code = envelope
                .error
                .code
                .as_ref()
                .and_then(|c| c.as_str())
                .map(str::to_string);
            let kind = match (envelope.error.kind, code) {
                // Quota errors arrive as `type: insufficient_quota` or as a code.
                (_, Some(code)) if code == "insufficient_quota" => ApiErrorKind::InsufficientQuota,
                (Some(kind), _) => ApiErrorKind::from_type(&kind),
                (None, Some(code)) => ApiErrorKind::from_type(&code),
                (None, None) => ApiErrorKind::Other("unknown".into()),
            };
            LexiforgeError::Api(ApiError {
                status,
                kind,
                message: envelope.error.message,
            })
        }
        Err(_) => LexiforgeError::HttpStatus { status, body },
    }
}

// ---------------------------------------------------------------------------
// ChatModel
// ---------------------------------------------------------------------------

/// Anything that can answer a chat request.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Send a request and return a response with at least one choice.
    async fn send_message(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<ChatResponse>;
}

/// Bearer-authenticated HTTPS chat-completions client.
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: RetryClient,
    endpoint: Url,
    api_key: String,
}

impl ChatClient {
    /// `base_url` is the API root, e.g. `https://api.openai.com/v1`.
    pub fn new(http: RetryClient, base_url: &str, api_key: impl Into<String>) -> Result<Self> {
        let endpoint = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| LexiforgeError::config(format!("invalid AI base URL {base_url:?}: {e}")))?;
        Ok(Self {
            http,
            endpoint,
            api_key: api_key.into(),
        })
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| LexiforgeError::config("API key contains invalid header characters"))?;
        headers.insert(AUTHORIZATION, bearer);
        Ok(headers)
    }
}

#[async_trait]
impl ChatModel for ChatClient {
    #[instrument(skip_all, fields(model = %request.model, messages = request.messages.len()))]
    async fn send_message(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<ChatResponse> {
        request.validate()?;

        let body = serde_json::to_vec(request)
            .map_err(|e| LexiforgeError::parse(format!("failed to encode chat request: {e}")))?;

        let bytes = match self
            .http
            .post(cancel, &self.endpoint, Bytes::from(body), &self.headers()?)
            .await
        {
            Ok(bytes) => bytes,
            Err(LexiforgeError::HttpStatus { status, body }) => {
                return Err(map_error_body(status, body));
            }
            Err(e) => return Err(e),
        };

        let response: ChatResponse = serde_json::from_slice(&bytes)
            .map_err(|e| LexiforgeError::parse(format!("malformed chat response: {e}")))?;

        if response.choices.is_empty() {
            return Err(LexiforgeError::EmptyResponse);
        }

        if let Some(usage) = &response.usage {
            debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "chat completion"
            );
        }

        Ok(response)
    }
}
