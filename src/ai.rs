//! AI chat-completion client (OpenAI-compatible endpoint).
//!
//! The store supplies bounded conversation history; this module only turns
//! it into a request and maps upstream failures onto a small error taxonomy
//! the handlers can act on.

use serde::{Deserialize, Serialize};

use crate::config::AiConfig;
use crate::store::user::{HistoryTurn, TurnRole};

pub struct CompletionClient {
    config: AiConfig,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Debug)]
pub enum Error {
    /// Upstream quota exhausted (HTTP 429).
    RateLimited,
    /// The request did not complete within the configured bound.
    Timeout,
    /// Upstream rejected the request as malformed.
    InvalidRequest(String),
    /// Upstream failed internally or returned an unexpected status.
    Service(String),
    /// Transport-level failure before a response arrived.
    Http(String),
    /// The response body could not be parsed.
    Parse(String),
    /// A well-formed response with no completion in it.
    Empty,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::RateLimited => write!(f, "upstream rate limited"),
            Error::Timeout => write!(f, "upstream timed out"),
            Error::InvalidRequest(e) => write!(f, "invalid request: {e}"),
            Error::Service(e) => write!(f, "service error: {e}"),
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::Parse(e) => write!(f, "parse error: {e}"),
            Error::Empty => write!(f, "empty response"),
        }
    }
}

impl std::error::Error for Error {}

/// Map a non-success status onto the error taxonomy.
fn error_for_status(status: reqwest::StatusCode, body: String) -> Error {
    match status.as_u16() {
        429 => Error::RateLimited,
        400 | 422 => Error::InvalidRequest(body),
        _ => Error::Service(format!("{status}: {body}")),
    }
}

impl CompletionClient {
    pub fn new(config: AiConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("Failed to build HTTP client");

        Self { config, http }
    }

    /// Request a completion for `user_text` given the prior conversation.
    pub async fn complete(
        &self,
        system: &str,
        history: &[HistoryTurn],
        user_text: &str,
    ) -> Result<String, Error> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ApiMessage { role: "system", content: system });
        for turn in history {
            messages.push(ApiMessage {
                role: match turn.role {
                    TurnRole::User => "user",
                    TurnRole::Assistant => "assistant",
                },
                content: &turn.text,
            });
        }
        messages.push(ApiMessage { role: "user", content: user_text });

        let request = ApiRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout
                } else {
                    Error::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, body));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;

        let text = api_response
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .ok_or(Error::Empty)?;

        if text.is_empty() {
            return Err(Error::Empty);
        }
        Ok(text)
    }
}
