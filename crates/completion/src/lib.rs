//! relaydesk completion
//!
//! Providers for the automated responder that answers system-mode sessions.
//! Each provider turns a single prompt into a single reply.

pub mod gemini;

use async_trait::async_trait;
use thiserror::Error;

pub use gemini::GeminiCompleter;

/// Reply used when no provider credentials are configured.
pub const CANNED_REPLY: &str =
    "Thanks for your message! Our assistant is offline right now, a support agent will follow up shortly.";

/// Errors that can occur while asking a provider for a reply
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("Missing credentials for provider: {0}")]
    MissingCredentials(&'static str),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Provider returned an empty reply")]
    EmptyReply,

    #[error("Provider timed out after {0} ms")]
    Timeout(u64),
}

/// A source of AI replies
#[async_trait]
pub trait Completer: Send + Sync {
    /// Short provider name for logs
    fn name(&self) -> &'static str;

    /// Produce a reply for `prompt`.
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError>;
}

/// Degraded provider that always answers with [`CANNED_REPLY`].
#[derive(Debug, Default, Clone)]
pub struct CannedCompleter;

#[async_trait]
impl Completer for CannedCompleter {
    fn name(&self) -> &'static str {
        "canned"
    }

    async fn complete(&self, _prompt: &str) -> Result<String, CompletionError> {
        Ok(CANNED_REPLY.to_string())
    }
}

/// Pick the Gemini provider when a key is present, otherwise the canned one.
pub fn from_api_key(
    api_key: Option<String>,
    model: &str,
    timeout: std::time::Duration,
) -> Box<dyn Completer> {
    match api_key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty()) {
        Some(key) => Box::new(GeminiCompleter::new(key, model, timeout)),
        None => {
            tracing::warn!(
                component = "completion",
                event = "completion.degraded",
                "No GEMINI_API_KEY configured, system replies will be canned"
            );
            Box::new(CannedCompleter)
        }
    }
}
