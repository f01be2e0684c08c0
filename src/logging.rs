use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Logging configuration for the engine and CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Initialize the global subscriber. Returns the appender guard
    /// when file logging is enabled; dropping it flushes the file.
    pub fn init(&self) -> Result<Option<WorkerGuard>> {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let mut guard = None;
        let file_layer = self.file.as_ref().map(|path| {
            let directory = path.parent().unwrap_or(std::path::Path::new("."));
            let file_name = path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "vigil.log".to_string());
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            guard = Some(file_guard);
            fmt::layer().with_ansi(false).with_writer(writer)
        });

        let registry = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer);

        if self.json {
            registry
                .with(fmt::layer().json().flatten_event(true))
                .init();
        } else {
            registry.with(fmt::layer()).init();
        }

        Ok(guard)
    }
}
