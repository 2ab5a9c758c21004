//! Tracing setup: one non-blocking file sink under the data dir.

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::paths;

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";
const LOG_FILE: &str = "server.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Keeps the file writer flushing; drop it last.
pub struct LoggingHandle {
    pub run_id: String,
    pub guard: WorkerGuard,
}

/// Pick the filter directive: explicit setting, then `RUST_LOG`, then the default.
/// Unparseable directives fall through to the next source.
fn filter_directive(explicit: Option<&str>, rust_log: Option<&str>) -> String {
    [explicit, rust_log]
        .into_iter()
        .flatten()
        .find(|directive| EnvFilter::try_new(*directive).is_ok())
        .unwrap_or(DEFAULT_FILTER)
        .to_string()
}

pub fn init_logging(config: &Config) -> anyhow::Result<LoggingHandle> {
    let log_dir = paths::log_dir();
    std::fs::create_dir_all(&log_dir)?;

    let rust_log = std::env::var("RUST_LOG").ok();
    let directive = filter_directive(config.log_filter.as_deref(), rust_log.as_deref());
    let filter = EnvFilter::try_new(&directive)?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&log_dir, LOG_FILE));
    let base = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_target(true);

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Pretty => registry.with(base.pretty()).try_init()?,
        LogFormat::Json => registry
            .with(base.json().flatten_event(true).with_current_span(true))
            .try_init()?,
    }

    let run_id = config
        .run_id
        .clone()
        .unwrap_or_else(relaydesk_protocol::new_id);

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        run_id = %run_id,
        log_path = %log_dir.join(LOG_FILE).display(),
        format = ?config.log_format,
        filter = %directive,
    );

    Ok(LoggingHandle { run_id, guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_filter_wins_over_rust_log() {
        assert_eq!(filter_directive(Some("debug"), Some("warn")), "debug");
    }

    #[test]
    fn bad_directive_falls_through() {
        assert_eq!(filter_directive(Some("relaydesk=loud"), Some("warn")), "warn");
        assert_eq!(filter_directive(None, Some("relaydesk=loud")), DEFAULT_FILTER);
        assert_eq!(filter_directive(None, None), DEFAULT_FILTER);
    }
}
