mod settings;

pub use settings::{LoggingConfig, Settings};
