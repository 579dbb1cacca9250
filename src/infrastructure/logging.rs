use std::fs;

use once_cell::sync::OnceCell;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Configuration for bridge logging.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: String,
    pub enable_console: bool,
    pub enable_file: bool,
    pub log_level: Level,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            enable_console: true,
            enable_file: false,
            log_level: Level::INFO,
        }
    }
}

// Non-blocking writer guards must live for the process lifetime or file
// logs are lost on shutdown.
static GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

/// Initialize logging with an env-filter and optional daily-rotated file
/// output. Call once at startup; later calls fail.
pub fn init_logging(config: Option<LoggingConfig>) -> anyhow::Result<()> {
    let config = config.unwrap_or_default();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("telemetry_bridge={}", config.log_level))
    });

    let mut layers: Vec<Box<dyn Layer<_> + Send + Sync>> = Vec::new();
    let mut guards = Vec::new();

    if config.enable_console {
        layers.push(fmt::layer().with_target(true).boxed());
    }

    if config.enable_file {
        fs::create_dir_all(&config.log_dir)?;
        let appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "bridge.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        layers.push(fmt::layer().with_writer(writer).with_ansi(false).boxed());
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()?;

    let _ = GUARDS.set(guards);
    Ok(())
}
