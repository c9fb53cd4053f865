use crate::pki::{Certificate, Crl, PrivateKey};

/// The accumulating trust material gathered by the bootstrap pipeline.
///
/// Each state produces a new `SslContext` rather than mutating its
/// predecessor (invariant 5 of the data model) — cloning one is cheap
/// relative to a network round trip, so the state machine simply threads
/// ownership forward.
#[derive(Clone, Default)]
pub struct SslContext {
    pub cacerts: Vec<Certificate>,
    pub crls: Vec<Crl>,
    pub private_key: Option<PrivateKey>,
    pub client_cert: Option<Certificate>,
    pub verify_peer: bool,
}

impl std::fmt::Debug for SslContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SslContext")
            .field("cacerts", &self.cacerts.len())
            .field("crls", &self.crls.len())
            .field("has_private_key", &self.private_key.is_some())
            .field("has_client_cert", &self.client_cert.is_some())
            .field("verify_peer", &self.verify_peer)
            .finish()
    }
}

impl SslContext {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Invariant 1: an SslContext with CA certs present always verifies
    /// peers for any subsequent request except the CA-download itself —
    /// callers opt out of that one request explicitly.
    pub fn with_cacerts(cacerts: Vec<Certificate>) -> Self {
        Self {
            cacerts,
            verify_peer: true,
            ..Self::default()
        }
    }

    pub fn with_crls(self, crls: Vec<Crl>) -> Self {
        Self { crls, ..self }
    }

    pub fn with_private_key(self, private_key: PrivateKey) -> Self {
        Self {
            private_key: Some(private_key),
            ..self
        }
    }

    pub fn with_client_cert(self, client_cert: Certificate) -> Self {
        Self {
            client_cert: Some(client_cert),
            ..self
        }
    }

    /// True once the pipeline has reached a fully populated, verifiable
    /// state: `verify_peer ∧ cacerts ≠ ∅ ∧ private_key.pub = client_cert.pub`.
    pub fn is_fully_provisioned(&self) -> bool {
        self.verify_peer
            && !self.cacerts.is_empty()
            && match (&self.private_key, &self.client_cert) {
                (Some(key), Some(cert)) => {
                    matches!((key.public_key_der(), cert.public_key_der()), (Ok(a), Ok(b)) if a == b)
                }
                _ => false,
            }
    }
}
