use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::debug;

use crate::error::{Error, Result};

/// The agent's RSA private key.
///
/// Generation and PKCS#8 encode/decode are delegated to the `rsa` crate;
/// this type just gives the state machine a stable handle plus the
/// comparisons (public key DER) it needs without re-parsing PEM everywhere.
#[derive(Clone)]
pub struct PrivateKey {
    inner: RsaPrivateKey,
}

impl PrivateKey {
    /// Generate a fresh RSA key at the given modulus size.
    pub fn generate(bits: usize) -> Result<Self> {
        debug!(bits, "generating RSA private key");
        let mut rng = rand::thread_rng();
        let inner = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| Error::Crypto(format!("failed to generate RSA key: {e}")))?;
        Ok(Self { inner })
    }

    /// Decode a PKCS#8 PEM-encoded private key.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self> {
        let inner = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| Error::Crypto(format!("failed to decode private key: {e}")))?;
        Ok(Self { inner })
    }

    /// Encode as PKCS#8 PEM, for persistence via [`crate::ssl::CertProvider`].
    pub fn to_pkcs8_pem(&self) -> Result<String> {
        self.inner
            .to_pkcs8_pem(LineEnding::LF)
            .map(|zeroizing| zeroizing.to_string())
            .map_err(|e| Error::Crypto(format!("failed to encode private key: {e}")))
    }

    /// DER-encoded `SubjectPublicKeyInfo` for this key's public half, used
    /// to compare against a certificate's embedded public key.
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        let public: RsaPublicKey = self.inner.to_public_key();
        let doc = public
            .to_public_key_der()
            .map_err(|e| Error::Crypto(format!("failed to encode public key: {e}")))?;
        Ok(doc.as_bytes().to_vec())
    }

    /// Adapt this key for use with `rcgen`'s certificate/CSR builders.
    pub fn to_rcgen_key_pair(&self) -> Result<rcgen::KeyPair> {
        let pem = self.to_pkcs8_pem()?;
        rcgen::KeyPair::from_pem(&pem)
            .map_err(|e| Error::Crypto(format!("failed to adapt private key for CSR signing: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_round_trips_through_pem() {
        let key = PrivateKey::generate(2048).unwrap();
        let pem = key.to_pkcs8_pem().unwrap();
        let reloaded = PrivateKey::from_pkcs8_pem(&pem).unwrap();
        assert_eq!(key.public_key_der().unwrap(), reloaded.public_key_der().unwrap());
    }

    #[test]
    fn distinct_keys_have_distinct_public_keys() {
        let a = PrivateKey::generate(2048).unwrap();
        let b = PrivateKey::generate(2048).unwrap();
        assert_ne!(a.public_key_der().unwrap(), b.public_key_der().unwrap());
    }
}
