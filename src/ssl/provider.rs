use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::error::{Error, Result};
use crate::pki::{Certificate, Crl, PrivateKey};

/// Persists and retrieves the bootstrap pipeline's trust material.
///
/// Every `load_*` returns `Ok(None)` (or an empty `Vec` for chains) when
/// nothing is persisted yet, and propagates a fatal error when something
/// is on disk but fails to decode — the driver never distinguishes
/// "absent" from "corrupt", the implementation must.
#[async_trait]
pub trait CertProvider: Send + Sync {
    async fn load_cacerts(&self) -> Result<Option<Vec<Certificate>>>;
    async fn save_cacerts(&self, certs: &[Certificate]) -> Result<()>;

    async fn load_crls(&self) -> Result<Option<Vec<Crl>>>;
    async fn save_crls(&self, crls: &[Crl]) -> Result<()>;

    async fn load_private_key(&self) -> Result<Option<PrivateKey>>;
    async fn save_private_key(&self, key: &PrivateKey) -> Result<()>;

    async fn load_client_cert(&self) -> Result<Option<Certificate>>;
    async fn save_client_cert(&self, cert: &Certificate) -> Result<()>;

    async fn save_request(&self, certname: &str, csr_der: &[u8]) -> Result<()>;
}

/// Filesystem-backed [`CertProvider`], mirroring the conventional agent
/// SSL directory layout. Writes are atomic: every `save_*` writes to a
/// temp file beside the destination and renames it into place, so a
/// concurrent reader never observes a half-written file.
pub struct FileCertProvider {
    ssldir: PathBuf,
    certname: String,
}

impl FileCertProvider {
    pub fn new(ssldir: impl Into<PathBuf>, certname: impl Into<String>) -> Self {
        Self {
            ssldir: ssldir.into(),
            certname: certname.into(),
        }
    }

    fn ca_cert_path(&self) -> PathBuf {
        self.ssldir.join("certs").join("ca.pem")
    }

    fn crl_path(&self) -> PathBuf {
        self.ssldir.join("crl.pem")
    }

    fn private_key_path(&self) -> PathBuf {
        self.ssldir.join("private_keys").join(format!("{}.pem", self.certname))
    }

    fn client_cert_path(&self) -> PathBuf {
        self.ssldir.join("certs").join(format!("{}.pem", self.certname))
    }

    fn request_path(&self, certname: &str) -> PathBuf {
        self.ssldir
            .join("certificate_requests")
            .join(format!("{certname}.pem"))
    }

    async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, contents).await?;
        fs::rename(&tmp_path, path).await?;
        debug!(path = %path.display(), "wrote file atomically");
        Ok(())
    }

    async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[async_trait]
impl CertProvider for FileCertProvider {
    async fn load_cacerts(&self) -> Result<Option<Vec<Certificate>>> {
        match Self::read_optional(&self.ca_cert_path()).await? {
            Some(bytes) => Ok(Some(Certificate::parse_pem_chain(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_cacerts(&self, certs: &[Certificate]) -> Result<()> {
        let pem = Certificate::chain_to_pem(certs);
        Self::write_atomic(&self.ca_cert_path(), pem.as_bytes()).await
    }

    async fn load_crls(&self) -> Result<Option<Vec<Crl>>> {
        match Self::read_optional(&self.crl_path()).await? {
            Some(bytes) => Ok(Some(Crl::parse_pem_chain(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_crls(&self, crls: &[Crl]) -> Result<()> {
        let pem = Crl::chain_to_pem(crls);
        Self::write_atomic(&self.crl_path(), pem.as_bytes()).await
    }

    async fn load_private_key(&self) -> Result<Option<PrivateKey>> {
        match Self::read_optional(&self.private_key_path()).await? {
            Some(bytes) => {
                let pem = String::from_utf8(bytes)
                    .map_err(|e| Error::Crypto(format!("private key file is not valid UTF-8: {e}")))?;
                Ok(Some(PrivateKey::from_pkcs8_pem(&pem)?))
            }
            None => Ok(None),
        }
    }

    async fn save_private_key(&self, key: &PrivateKey) -> Result<()> {
        let pem = key.to_pkcs8_pem()?;
        Self::write_atomic(&self.private_key_path(), pem.as_bytes()).await
    }

    async fn load_client_cert(&self) -> Result<Option<Certificate>> {
        match Self::read_optional(&self.client_cert_path()).await? {
            Some(bytes) => {
                let mut certs = Certificate::parse_pem_chain(&bytes)?;
                Ok(Some(certs.remove(0)))
            }
            None => Ok(None),
        }
    }

    async fn save_client_cert(&self, cert: &Certificate) -> Result<()> {
        let pem = Certificate::chain_to_pem(std::slice::from_ref(cert));
        Self::write_atomic(&self.client_cert_path(), pem.as_bytes()).await
    }

    async fn save_request(&self, certname: &str, csr_der: &[u8]) -> Result<()> {
        use base64::Engine;
        let mut pem = String::from("-----BEGIN CERTIFICATE REQUEST-----\n");
        let encoded = base64::engine::general_purpose::STANDARD.encode(csr_der);
        for line in encoded.as_bytes().chunks(64) {
            pem.push_str(std::str::from_utf8(line).unwrap());
            pem.push('\n');
        }
        pem.push_str("-----END CERTIFICATE REQUEST-----\n");
        Self::write_atomic(&self.request_path(certname), pem.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::PrivateKey;

    #[tokio::test]
    async fn missing_material_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileCertProvider::new(dir.path(), "agent.example.com");
        assert!(provider.load_cacerts().await.unwrap().is_none());
        assert!(provider.load_crls().await.unwrap().is_none());
        assert!(provider.load_private_key().await.unwrap().is_none());
        assert!(provider.load_client_cert().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn private_key_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileCertProvider::new(dir.path(), "agent.example.com");
        let key = PrivateKey::generate(2048).unwrap();

        provider.save_private_key(&key).await.unwrap();
        let loaded = provider.load_private_key().await.unwrap().unwrap();

        assert_eq!(key.public_key_der().unwrap(), loaded.public_key_der().unwrap());
    }

    #[tokio::test]
    async fn save_request_writes_pem_csr() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileCertProvider::new(dir.path(), "agent.example.com");
        provider.save_request("agent.example.com", b"not-really-der").await.unwrap();

        let path = dir.path().join("certificate_requests").join("agent.example.com.pem");
        let contents = tokio::fs::read_to_string(path).await.unwrap();
        assert!(contents.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
    }
}
