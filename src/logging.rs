//! Logging setup for processes embedding the resilience layer
//!
//! Components only emit `tracing` events; installing a subscriber is left
//! to the host process, which may call [`init_logging`] once at startup.

use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default file name when the configured log path has none
const DEFAULT_LOG_FILE: &str = "pipeline-resilience.log";

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level used when no filter directive is given
    pub level: Level,
    /// `EnvFilter` directives, e.g. `pipeline_resilience=debug`
    pub filter: Option<String>,
    /// Daily-rotated log file
    pub file_path: Option<PathBuf>,
    pub stderr: bool,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
    pub thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            filter: None,
            file_path: None,
            stderr: true,
            json: false,
            thread_ids: false,
        }
    }
}

impl LogConfig {
    /// Read `RUST_LOG`, `RESILIENCE_LOG_FILE`, `RESILIENCE_LOG_JSON` and
    /// `RESILIENCE_LOG_STDERR`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(filter) = std::env::var("RUST_LOG") {
            if !filter.trim().is_empty() {
                config.filter = Some(filter);
            }
        }
        if let Ok(log_file) = std::env::var("RESILIENCE_LOG_FILE") {
            config.file_path = Some(PathBuf::from(log_file));
        }
        if let Ok(json) = std::env::var("RESILIENCE_LOG_JSON") {
            config.json = matches!(json.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(stderr) = std::env::var("RESILIENCE_LOG_STDERR") {
            config.stderr = stderr.to_lowercase() != "false";
        }

        config
    }

    fn env_filter(&self) -> EnvFilter {
        let builder = EnvFilter::builder().with_default_directive(self.level.into());
        match &self.filter {
            Some(directives) => builder.parse_lossy(directives),
            None => builder.from_env_lossy(),
        }
    }
}

/// Install the global subscriber
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = config.env_filter();

    let file_writer = match &config.file_path {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            std::fs::create_dir_all(dir)?;
            let name = path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new(DEFAULT_LOG_FILE));
            Some(tracing_appender::rolling::daily(dir, name))
        }
        None => None,
    };

    let stderr_text = (config.stderr && !config.json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_thread_ids(config.thread_ids)
    });
    let stderr_json = (config.stderr && config.json).then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_thread_ids(config.thread_ids)
    });

    let (file_text, file_json) = match file_writer {
        Some(writer) if config.json => (None, Some(fmt::layer().json().with_writer(writer))),
        Some(writer) => (
            Some(fmt::layer().with_ansi(false).with_writer(writer)),
            None,
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_text)
        .with(stderr_json)
        .with(file_text)
        .with(file_json)
        .try_init()?;

    Ok(())
}
