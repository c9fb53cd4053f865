mod ca_client;
mod context;
mod csr;
mod driver;
mod provider;
mod state;

pub use ca_client::{CaClient, CaResponse, HttpCaClient};
pub use context::SslContext;
pub use csr::{CsrAttributesDocument, CsrBuilder, CsrSpec, RcgenCsrBuilder, SanEntry};
pub use driver::{Driver, EnsureOutcome};
pub use provider::{CertProvider, FileCertProvider};
pub use state::{SslState, Transition};
