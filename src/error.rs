use thiserror::Error;

/// The library's public error type.
///
/// Variants mirror the error kinds in the bootstrap specification: each
/// state classifies a failure into one of these before deciding whether to
/// raise it fatally or fold it into a `Wait` transition.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed CSR-attributes document, invalid `dns_alt_names`, or a
    /// missing/invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A non-2xx HTTP response from the CA that a state has decided is
    /// fatal (recoverable cases never reach this type — they become a
    /// `Wait` transition instead).
    #[error("Network error: {0}")]
    Network(String),

    /// Malformed PEM in a CA cert/CRL/client cert payload.
    #[error("Parse error: {0}")]
    Parse(String),

    /// A mismatched key/cert pair, or a certificate present on a CRL.
    #[error("Verification error: {0}")]
    Verification(String),

    /// RSA key decoding or generation failure.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// A CertProvider (filesystem) failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that must terminate the driver loop. Wrapping every fatal
/// condition in this newtype keeps "raise out of the driver" textually
/// distinct from the state-internal `Outcome::Wait` signal used for
/// recoverable conditions — the two never share a call site.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct Fatal(#[from] Error);

impl Fatal {
    pub fn into_inner(self) -> Error {
        self.0
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<rcgen::Error> for Error {
    fn from(err: rcgen::Error) -> Self {
        Error::Crypto(err.to_string())
    }
}

impl From<rsa::Error> for Error {
    fn from(err: rsa::Error) -> Self {
        Error::Crypto(err.to_string())
    }
}

impl From<rsa::pkcs8::Error> for Error {
    fn from(err: rsa::pkcs8::Error) -> Self {
        Error::Crypto(err.to_string())
    }
}

impl From<x509_parser::error::X509Error> for Error {
    fn from(err: x509_parser::error::X509Error) -> Self {
        Error::Parse(err.to_string())
    }
}
