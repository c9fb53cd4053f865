use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::pki::Certificate;

/// A response from the CA, reduced to what the state nodes need to
/// classify it: a status code and a raw body. Bodies are PEM or DER
/// depending on the endpoint, never decoded here.
#[derive(Debug, Clone, Default)]
pub struct CaResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl CaResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_as_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// The CA's HTTP surface, as the state machine needs it.
///
/// `verify_peer` is passed explicitly on every call because the state
/// machine, not the transport, is the sole authority on when peer
/// verification is allowed to be disabled (the bootstrap-of-trust
/// exception in §4.2).
#[async_trait]
pub trait CaClient: Send + Sync {
    async fn get_ca_certificates(&self, verify_peer: bool) -> Result<CaResponse>;
    async fn get_crls(&self, verify_peer: bool) -> Result<CaResponse>;
    async fn put_csr(&self, certname: &str, der: &[u8], verify_peer: bool) -> Result<CaResponse>;
    async fn get_client_certificate(&self, certname: &str, verify_peer: bool) -> Result<CaResponse>;

    /// Update the set of trust anchors used for verified requests. Called
    /// by the driver once `NeedCACerts` produces a chain. Implementations
    /// that don't do real TLS verification (mocks) can ignore this.
    async fn set_trust_anchors(&self, _cacerts: &[Certificate]) -> Result<()> {
        Ok(())
    }
}

/// `reqwest`-backed [`CaClient`] against a Puppet-CA-shaped HTTP API.
///
/// Holds two independently configured clients rather than reconfiguring
/// one per call: an "insecure" client with certificate verification
/// disabled, used only for the very first CA-certs download, and a
/// "secure" client that trusts the current trust anchors. The secure
/// client is rebuilt whenever the trust anchors change, since `reqwest`
/// bakes its root store in at construction time.
pub struct HttpCaClient {
    base_url: String,
    timeout: Duration,
    insecure_client: reqwest::Client,
    secure_client: RwLock<Option<Arc<reqwest::Client>>>,
}

impl HttpCaClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let insecure_client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            base_url: base_url.into(),
            timeout,
            insecure_client,
            secure_client: RwLock::new(None),
        })
    }

    async fn client_for(&self, verify_peer: bool) -> reqwest::Client {
        if verify_peer {
            match self.secure_client.read().await.as_ref() {
                Some(client) => (**client).clone(),
                None => self.insecure_client.clone(),
            }
        } else {
            self.insecure_client.clone()
        }
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<CaResponse> {
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        debug!(status, "received CA response");
        Ok(CaResponse { status, body })
    }
}

#[async_trait]
impl CaClient for HttpCaClient {
    /// Rebuild the secure client to trust exactly the given CA chain.
    /// Called whenever `NeedCACerts` produces a fresh chain, so that
    /// every subsequent verified request checks against current material.
    async fn set_trust_anchors(&self, cacerts: &[Certificate]) -> Result<()> {
        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        for cert in cacerts {
            let der_cert = reqwest::Certificate::from_der(&cert.der)?;
            builder = builder.add_root_certificate(der_cert);
        }
        let client = builder.build()?;
        *self.secure_client.write().await = Some(Arc::new(client));
        Ok(())
    }

    async fn get_ca_certificates(&self, verify_peer: bool) -> Result<CaResponse> {
        let url = format!("{}/puppet-ca/v1/certificate/ca", self.base_url);
        debug!(url, verify_peer, "fetching CA certificate");
        let client = self.client_for(verify_peer).await;
        self.execute(client.get(&url)).await
    }

    async fn get_crls(&self, verify_peer: bool) -> Result<CaResponse> {
        let url = format!("{}/puppet-ca/v1/certificate_revocation_list/ca", self.base_url);
        debug!(url, verify_peer, "fetching CRL");
        let client = self.client_for(verify_peer).await;
        self.execute(client.get(&url)).await
    }

    async fn put_csr(&self, certname: &str, der: &[u8], verify_peer: bool) -> Result<CaResponse> {
        let url = format!("{}/puppet-ca/v1/certificate_request/{certname}", self.base_url);
        debug!(url, verify_peer, "submitting CSR");
        let client = self.client_for(verify_peer).await;
        self.execute(
            client
                .put(&url)
                .header("Content-Type", "application/octet-stream")
                .body(der.to_vec()),
        )
        .await
    }

    async fn get_client_certificate(&self, certname: &str, verify_peer: bool) -> Result<CaResponse> {
        let url = format!("{}/puppet-ca/v1/certificate/{certname}", self.base_url);
        debug!(url, verify_peer, "fetching client certificate");
        let client = self.client_for(verify_peer).await;
        self.execute(client.get(&url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_range_is_2xx() {
        assert!(CaResponse { status: 200, body: vec![] }.is_success());
        assert!(CaResponse { status: 204, body: vec![] }.is_success());
        assert!(!CaResponse { status: 404, body: vec![] }.is_success());
        assert!(!CaResponse { status: 500, body: vec![] }.is_success());
    }

    #[tokio::test]
    async fn client_without_trust_anchors_falls_back_to_insecure() {
        let client = HttpCaClient::new("https://ca.example.com", Duration::from_secs(5)).unwrap();
        // No `set_trust_anchors` call yet; `client_for(true)` must not panic.
        let _ = client.client_for(true).await;
    }
}
