pub mod config;
pub mod error;
pub mod pki;
pub mod ssl;
pub mod telemetry;

pub use config::Settings;
pub use error::{Error, Fatal, Result};
pub use ssl::{CaClient, CertProvider, CsrBuilder, Driver, EnsureOutcome, SslContext};
