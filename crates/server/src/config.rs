//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::logging::LogFormat;

/// relaydesk: live-chat handoff between an AI responder and human agents
#[derive(Debug, Clone, Parser)]
#[command(name = "relaydesk", version, about)]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "RELAYDESK_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Data directory (database, logs). Defaults to ~/.relaydesk
    #[arg(long, env = "RELAYDESK_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Sessions idle longer than this are reaped
    #[arg(long, env = "RELAYDESK_INACTIVITY_WINDOW_SECS", default_value_t = 30 * 60)]
    pub inactivity_window_secs: u64,

    /// How often the reaper sweeps
    #[arg(long, env = "RELAYDESK_REAP_INTERVAL_SECS", default_value_t = 10 * 60)]
    pub reap_interval_secs: u64,

    /// Upper bound for a single store call
    #[arg(long, env = "RELAYDESK_STORE_TIMEOUT_MS", default_value_t = 5_000)]
    pub store_timeout_ms: u64,

    /// Upper bound for a single AI completion
    #[arg(long, env = "RELAYDESK_COMPLETION_TIMEOUT_MS", default_value_t = 15_000)]
    pub completion_timeout_ms: u64,

    /// Gemini API key; without it the system responder sends a canned reply
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub gemini_api_key: Option<String>,

    /// Gemini model used for system replies
    #[arg(long, env = "RELAYDESK_GEMINI_MODEL", default_value = "gemini-2.0-flash")]
    pub gemini_model: String,

    /// Tracing filter directive; falls back to RUST_LOG
    #[arg(long, env = "RELAYDESK_LOG_FILTER")]
    pub log_filter: Option<String>,

    #[arg(long, env = "RELAYDESK_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Correlates log lines across restarts of one deployment
    #[arg(long, env = "RELAYDESK_RUN_ID")]
    pub run_id: Option<String>,
}

impl Config {
    pub fn inactivity_window(&self) -> Duration {
        Duration::from_secs(self.inactivity_window_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }
}
