//! Gemini provider
//!
//! Calls the `generateContent` REST endpoint with the prompt as a single
//! user part and returns the first candidate's first text part.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Completer, CompletionError};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

/// Gemini `generateContent` client
pub struct GeminiCompleter {
    client: reqwest::Client,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl GeminiCompleter {
    pub fn new(api_key: String, model: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: model.to_string(),
            timeout,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/{}:generateContent", API_BASE, self.model)
    }

    async fn call(&self, prompt: &str) -> Result<String, CompletionError> {
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
        };

        let resp = self
            .client
            .post(self.endpoint())
            .header("X-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CompletionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = resp.json().await?;
        extract_reply(parsed)
    }
}

#[async_trait]
impl Completer for GeminiCompleter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        debug!(
            component = "completion",
            event = "completion.request",
            model = %self.model,
            prompt_chars = prompt.chars().count(),
        );
        match tokio::time::timeout(self.timeout, self.call(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(CompletionError::Timeout(self.timeout.as_millis() as u64)),
        }
    }
}

fn extract_reply(resp: GenerateResponse) -> Result<String, CompletionError> {
    resp.candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .and_then(|c| c.parts.into_iter().next())
        .and_then(|p| p.text)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or(CompletionError::EmptyReply)
}
