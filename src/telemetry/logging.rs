use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::LoggingConfig;
use crate::error::Error;

/// Initialize the global `tracing` subscriber from [`LoggingConfig`].
pub fn init_logging(config: &LoggingConfig) -> Result<(), Error> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(Error::Config(format!("invalid log level: {other}"))),
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let registry = Registry::default().with(filter);

    if config.json {
        registry
            .with(fmt::Layer::default().with_target(true).json())
            .try_init()
    } else {
        registry
            .with(fmt::Layer::default().with_target(true))
            .try_init()
    }
    .map_err(|e| Error::Config(format!("failed to install global subscriber: {e}")))
}

#[cfg(test)]
pub fn init_test_logging() {
    let filter = EnvFilter::from_default_env().add_directive(Level::DEBUG.into());
    let _ = Registry::default()
        .with(filter)
        .with(fmt::Layer::default().with_test_writer().with_ansi(false))
        .try_init();
}
