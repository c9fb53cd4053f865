use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Application configuration for the SSL bootstrap pipeline.
///
/// Loaded by [`Settings::load`] from layered sources (defaults, an optional
/// YAML file, then environment overrides), the same layering shape the
/// rest of this crate's ambient stack uses for everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// The agent's canonical identifier; used as the CSR subject CN and in
    /// CA URL paths.
    pub certname: String,

    /// Base URL of the CA service, e.g. `https://ca.example.com:8140`.
    pub ca_base_url: String,

    /// Comma-separated `TYPE:VALUE` (or bare `VALUE`, defaulting to `DNS`)
    /// subject alternative names to request in the CSR.
    #[serde(default)]
    pub dns_alt_names: String,

    /// Path to a YAML document with optional `custom_attributes` and
    /// `extension_requests` maps to fold into the CSR.
    #[serde(default)]
    pub csr_attributes_path: Option<PathBuf>,

    /// Whether revocation checking (CRL fetch/load) is enabled.
    #[serde(default = "default_true")]
    pub certificate_revocation: bool,

    /// Seconds to sleep between polls for a signed certificate. Zero means
    /// exit instead of polling.
    #[serde(default = "default_waitforcert")]
    pub waitforcert: u64,

    /// RSA modulus size used when generating a fresh private key.
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,

    /// Directory under which CA certs, CRLs, keys, CSRs, and the client
    /// cert are persisted.
    #[serde(default = "default_ssldir")]
    pub ssldir: PathBuf,

    /// Per-request HTTP timeout against the CA.
    #[serde(default = "default_ca_timeout_secs")]
    pub ca_timeout_secs: u64,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_true() -> bool {
    true
}

fn default_waitforcert() -> u64 {
    120
}

fn default_key_bits() -> usize {
    4096
}

fn default_ssldir() -> PathBuf {
    PathBuf::from("/etc/ca-bootstrap/ssl")
}

fn default_ca_timeout_secs() -> u64 {
    30
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `trace`, `debug`, `info`, `warn`, or `error`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON-formatted log lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            certname: String::new(),
            ca_base_url: String::new(),
            dns_alt_names: String::new(),
            csr_attributes_path: None,
            certificate_revocation: default_true(),
            waitforcert: default_waitforcert(),
            key_bits: default_key_bits(),
            ssldir: default_ssldir(),
            ca_timeout_secs: default_ca_timeout_secs(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Settings {
    /// Load configuration from environment variables and configuration
    /// files, layering: built-in defaults, an optional YAML file, then
    /// `CA_BOOTSTRAP_`-prefixed environment variables.
    pub fn load() -> Result<Self> {
        use config::{Config as ConfigBuilder, Environment, File};
        use std::env;

        let mut builder = ConfigBuilder::builder()
            .add_source(ConfigBuilder::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CA_BOOTSTRAP_CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_path));
        } else {
            builder = builder.add_source(File::with_name("config/ca-bootstrap").required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("CA_BOOTSTRAP").separator("__"),
        );

        let config = builder.build()?;
        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the fields the state machine requires to be present.
    pub fn validate(&self) -> Result<()> {
        if self.certname.trim().is_empty() {
            return Err(Error::Config("certname cannot be empty".into()));
        }

        if self.ca_base_url.trim().is_empty() {
            return Err(Error::Config("ca_base_url cannot be empty".into()));
        }

        if self.key_bits == 0 {
            return Err(Error::Config("key_bits cannot be zero".into()));
        }

        if let Some(path) = &self.csr_attributes_path {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "csr_attributes_path does not exist: {}",
                    path.display()
                )));
            }
        }

        Ok(())
    }
}
