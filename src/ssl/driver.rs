use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::{Error, Fatal, Result};
use crate::pki::{is_revoked, Certificate, Crl, PrivateKey};
use crate::ssl::ca_client::CaClient;
use crate::ssl::csr::{parse_san_list, CsrAttributesDocument, CsrBuilder, CsrSpec};
use crate::ssl::provider::CertProvider;
use crate::ssl::state::{SslState, Transition};
use crate::ssl::SslContext;

/// What the public entry points return once the pipeline reaches a
/// terminal state for their purpose.
#[derive(Debug)]
pub enum EnsureOutcome {
    Context(SslContext),
    ExitRequested,
}

/// The "already has a certificate" substrings the CA is known to use in
/// a 400 response body when a CSR is redundant. Locked here per the
/// design note resolving the corresponding open question — this list is
/// not meant to be extended casually; extending it is a deliberate,
/// tested change, not configuration.
fn already_has_certificate_pattern() -> Regex {
    Regex::new(r"(?i)already has a (requested|signed|revoked) certificate").expect("valid regex")
}

/// Drives the bootstrap state machine described in the component design:
/// constructs the initial state, repeatedly advances it, and stops at the
/// terminal sentinel appropriate to the entry point called.
pub struct Driver {
    settings: Settings,
    ca_client: Arc<dyn CaClient>,
    cert_provider: Arc<dyn CertProvider>,
    csr_builder: Arc<dyn CsrBuilder>,
    already_has_cert_re: Regex,
}

impl Driver {
    pub fn new(
        settings: Settings,
        ca_client: Arc<dyn CaClient>,
        cert_provider: Arc<dyn CertProvider>,
        csr_builder: Arc<dyn CsrBuilder>,
    ) -> Self {
        Self {
            settings,
            ca_client,
            cert_provider,
            csr_builder,
            already_has_cert_re: already_has_certificate_pattern(),
        }
    }

    /// Runs the pipeline until CA certs (and CRLs, if enabled) are
    /// established, stopping before any key/CSR work.
    pub async fn ensure_ca_certificates(&self) -> std::result::Result<EnsureOutcome, Fatal> {
        self.run(SslState::NeedCaCerts, |state| {
            matches!(state, SslState::NeedKey | SslState::NeedSubmitCsr | SslState::NeedCert | SslState::Done)
        })
        .await
    }

    /// Runs the full pipeline through a signed client certificate.
    pub async fn ensure_client_certificate(&self) -> std::result::Result<EnsureOutcome, Fatal> {
        self.run(SslState::NeedCaCerts, |state| matches!(state, SslState::Done))
            .await
    }

    async fn run(
        &self,
        start: SslState,
        is_terminal: impl Fn(&SslState) -> bool,
    ) -> std::result::Result<EnsureOutcome, Fatal> {
        let mut state = start;
        let mut context = SslContext::empty();

        loop {
            if is_terminal(&state) {
                return Ok(EnsureOutcome::Context(context));
            }

            let started = Instant::now();
            debug!(%state, "entering state");

            let transition = self.advance(&state, context).await;

            match transition {
                Ok(Transition::Next(next_state, next_context)) => {
                    debug!(
                        from = %state,
                        to = %next_state,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "left state"
                    );
                    state = next_state;
                    context = next_context;
                }
                Ok(Transition::ExitRequested) => {
                    info!("exiting pipeline by operator-configured request");
                    return Ok(EnsureOutcome::ExitRequested);
                }
                Err(fatal) => {
                    error!(%state, error = %fatal, "bootstrap pipeline failed fatally");
                    return Err(fatal);
                }
            }
        }
    }

    async fn advance(&self, state: &SslState, context: SslContext) -> std::result::Result<Transition, Fatal> {
        match state {
            SslState::NeedCaCerts => self.need_ca_certs(context).await,
            SslState::NeedCrls => self.need_crls(context).await,
            SslState::NeedKey => self.need_key(context).await,
            SslState::NeedSubmitCsr => self.need_submit_csr(context).await,
            SslState::NeedCert => self.need_cert(context).await,
            SslState::Wait => self.wait(context).await,
            SslState::Done => panic!("next_state invoked on terminal Done state"),
        }
    }

    async fn need_ca_certs(&self, _context: SslContext) -> std::result::Result<Transition, Fatal> {
        if let Some(cacerts) = self.cert_provider.load_cacerts().await.map_err(Fatal::from)? {
            self.ca_client.set_trust_anchors(&cacerts).await.map_err(Fatal::from)?;
            let context = SslContext::with_cacerts(cacerts);
            return Ok(Transition::Next(SslState::NeedCrls, context));
        }

        let response = self
            .ca_client
            .get_ca_certificates(false)
            .await
            .map_err(Fatal::from)?;

        if response.status == 404 {
            return Err(Fatal::from(Error::Network(
                "CA certificate is missing from the server".into(),
            )));
        }
        if !response.is_success() {
            return Err(Fatal::from(Error::Network(format!(
                "Could not download CA certificate: {}",
                reason_phrase(response.status)
            ))));
        }

        let cacerts = Certificate::parse_pem_chain(&response.body).map_err(Fatal::from)?;
        self.cert_provider.save_cacerts(&cacerts).await.map_err(Fatal::from)?;
        self.ca_client.set_trust_anchors(&cacerts).await.map_err(Fatal::from)?;

        let context = SslContext::with_cacerts(cacerts);
        Ok(Transition::Next(SslState::NeedCrls, context))
    }

    async fn need_crls(&self, context: SslContext) -> std::result::Result<Transition, Fatal> {
        if !self.settings.certificate_revocation {
            debug!("revocation checking disabled, skipping CRL fetch");
            return Ok(Transition::Next(SslState::NeedKey, context));
        }

        if let Some(crls) = self.cert_provider.load_crls().await.map_err(Fatal::from)? {
            let context = context.with_crls(crls);
            return Ok(Transition::Next(SslState::NeedKey, context));
        }

        let response = self.ca_client.get_crls(true).await.map_err(Fatal::from)?;

        if response.status == 404 {
            return Err(Fatal::from(Error::Network("CRL is missing from the server".into())));
        }
        if !response.is_success() {
            return Err(Fatal::from(Error::Network(format!(
                "Could not download CRL: {}",
                reason_phrase(response.status)
            ))));
        }

        let crls = Crl::parse_pem_chain(&response.body).map_err(Fatal::from)?;
        self.cert_provider.save_crls(&crls).await.map_err(Fatal::from)?;

        let context = context.with_crls(crls);
        Ok(Transition::Next(SslState::NeedKey, context))
    }

    async fn need_key(&self, context: SslContext) -> std::result::Result<Transition, Fatal> {
        let key = match self.cert_provider.load_private_key().await.map_err(Fatal::from)? {
            Some(key) => key,
            None => {
                let key = PrivateKey::generate(self.settings.key_bits).map_err(Fatal::from)?;
                self.cert_provider.save_private_key(&key).await.map_err(Fatal::from)?;
                key
            }
        };

        if let Some(client_cert) = self.cert_provider.load_client_cert().await.map_err(Fatal::from)? {
            let key_pub = key.public_key_der().map_err(Fatal::from)?;
            let cert_pub = client_cert.public_key_der().map_err(Fatal::from)?;

            if key_pub == cert_pub {
                let context = context.with_private_key(key).with_client_cert(client_cert);
                return Ok(Transition::Next(SslState::Done, context));
            }

            let subject = client_cert.subject().map_err(Fatal::from)?;
            return Err(Fatal::from(Error::Verification(format!(
                "The certificate for '{subject}' does not match its private key"
            ))));
        }

        let context = context.with_private_key(key);
        Ok(Transition::Next(SslState::NeedSubmitCsr, context))
    }

    async fn need_submit_csr(&self, context: SslContext) -> std::result::Result<Transition, Fatal> {
        let key = context
            .private_key
            .clone()
            .expect("NeedSubmitCsr reached without a private key in context");

        let sans = parse_san_list(&self.settings.dns_alt_names, &self.settings.certname).map_err(Fatal::from)?;

        let attributes = match &self.settings.csr_attributes_path {
            Some(path) => CsrAttributesDocument::load(path).await.map_err(Fatal::from)?,
            None => CsrAttributesDocument::default(),
        };

        let spec = CsrSpec::new(&self.settings.certname)
            .with_sans(sans)
            .with_attributes(attributes);

        let der = self.csr_builder.build(&spec, &key).map_err(Fatal::from)?;

        self.cert_provider
            .save_request(&self.settings.certname, &der)
            .await
            .map_err(Fatal::from)?;

        let response = self
            .ca_client
            .put_csr(&self.settings.certname, &der, true)
            .await
            .map_err(Fatal::from)?;

        if response.is_success() || (response.status == 400 && self.already_has_cert_re.is_match(&response.body_as_str())) {
            return Ok(Transition::Next(SslState::NeedCert, context));
        }

        Err(Fatal::from(Error::Network(format!(
            "Failed to submit the CSR, HTTP response was {}",
            response.status
        ))))
    }

    async fn need_cert(&self, context: SslContext) -> std::result::Result<Transition, Fatal> {
        let response = self
            .ca_client
            .get_client_certificate(&self.settings.certname, true)
            .await
            .map_err(Fatal::from)?;

        if response.status != 200 {
            debug!(status = response.status, "client certificate not yet available");
            return Ok(Transition::Next(SslState::Wait, context));
        }

        let certs = match Certificate::parse_pem_chain(&response.body) {
            Ok(certs) => certs,
            Err(e) => {
                warn!(error = %e, "failed to parse client certificate, will retry");
                return Ok(Transition::Next(SslState::Wait, context));
            }
        };
        let cert = certs.into_iter().next().expect("parse_pem_chain never returns an empty Vec");

        let key = context
            .private_key
            .as_ref()
            .expect("NeedCert reached without a private key in context");

        let key_pub = key.public_key_der().map_err(Fatal::from)?;
        let cert_pub = match cert.public_key_der() {
            Ok(pub_der) => pub_der,
            Err(e) => {
                warn!(error = %e, "failed to read client certificate public key, will retry");
                return Ok(Transition::Next(SslState::Wait, context));
            }
        };

        if key_pub != cert_pub {
            let subject = cert.subject().unwrap_or_else(|_| "<unknown>".to_string());
            warn!(subject, "client certificate does not match private key, will retry");
            return Ok(Transition::Next(SslState::Wait, context));
        }

        match is_revoked(&cert, &context.crls) {
            Ok(true) => {
                let subject = cert.subject().unwrap_or_else(|_| "<unknown>".to_string());
                warn!(subject, "client certificate has been revoked, will retry");
                return Ok(Transition::Next(SslState::Wait, context));
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "failed to check revocation status, will retry");
                return Ok(Transition::Next(SslState::Wait, context));
            }
        }

        self.cert_provider.save_client_cert(&cert).await.map_err(Fatal::from)?;

        let context = context.with_client_cert(cert);
        Ok(Transition::Next(SslState::Done, context))
    }

    async fn wait(&self, context: SslContext) -> std::result::Result<Transition, Fatal> {
        if self.settings.waitforcert == 0 {
            println!(
                "Couldn't fetch certificate from CA server; you might still need to sign this agent's certificate ({}). Exiting now because the waitforcert setting is set to 0.",
                self.settings.certname
            );
            return Ok(Transition::ExitRequested);
        }

        info!(
            seconds = self.settings.waitforcert,
            "Couldn't fetch certificate from CA server; will try again in {} seconds.",
            self.settings.waitforcert
        );

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(self.settings.waitforcert)) => {
                Ok(Transition::Next(SslState::NeedCaCerts, SslContext::empty()))
            }
            _ = tokio::signal::ctrl_c() => {
                Err(Fatal::from(Error::Network("bootstrap cancelled while waiting for a signed certificate".into())))
            }
        }
    }
}

fn reason_phrase(status: u16) -> String {
    match status {
        400 => "Bad Request".to_string(),
        401 => "Unauthorized".to_string(),
        403 => "Forbidden".to_string(),
        404 => "Not Found".to_string(),
        500 => "Internal Server Error".to_string(),
        502 => "Bad Gateway".to_string(),
        503 => "Service Unavailable".to_string(),
        other => format!("HTTP status {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssl::ca_client::CaResponse;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockCaClient {
        ca_cert_response: CaResponse,
        crl_response: CaResponse,
        csr_response: CaResponse,
        cert_response: Mutex<Vec<CaResponse>>,
    }

    #[async_trait]
    impl CaClient for MockCaClient {
        async fn get_ca_certificates(&self, _verify_peer: bool) -> Result<CaResponse> {
            Ok(self.ca_cert_response.clone())
        }
        async fn get_crls(&self, _verify_peer: bool) -> Result<CaResponse> {
            Ok(self.crl_response.clone())
        }
        async fn put_csr(&self, _certname: &str, _der: &[u8], _verify_peer: bool) -> Result<CaResponse> {
            Ok(self.csr_response.clone())
        }
        async fn get_client_certificate(&self, _certname: &str, _verify_peer: bool) -> Result<CaResponse> {
            let mut responses = self.cert_response.lock().unwrap();
            if responses.len() > 1 {
                Ok(responses.remove(0))
            } else {
                Ok(responses[0].clone())
            }
        }
    }

    #[derive(Default)]
    struct MockCertProvider {
        cacerts: Mutex<Option<Vec<Certificate>>>,
        crls: Mutex<Option<Vec<Crl>>>,
        private_key: Mutex<Option<PrivateKey>>,
        client_cert: Mutex<Option<Certificate>>,
        requests: Mutex<BTreeMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl CertProvider for MockCertProvider {
        async fn load_cacerts(&self) -> Result<Option<Vec<Certificate>>> {
            Ok(self.cacerts.lock().unwrap().clone())
        }
        async fn save_cacerts(&self, certs: &[Certificate]) -> Result<()> {
            *self.cacerts.lock().unwrap() = Some(certs.to_vec());
            Ok(())
        }
        async fn load_crls(&self) -> Result<Option<Vec<Crl>>> {
            Ok(self.crls.lock().unwrap().clone())
        }
        async fn save_crls(&self, crls: &[Crl]) -> Result<()> {
            *self.crls.lock().unwrap() = Some(crls.to_vec());
            Ok(())
        }
        async fn load_private_key(&self) -> Result<Option<PrivateKey>> {
            Ok(self.private_key.lock().unwrap().clone())
        }
        async fn save_private_key(&self, key: &PrivateKey) -> Result<()> {
            *self.private_key.lock().unwrap() = Some(key.clone());
            Ok(())
        }
        async fn load_client_cert(&self) -> Result<Option<Certificate>> {
            Ok(self.client_cert.lock().unwrap().clone())
        }
        async fn save_client_cert(&self, cert: &Certificate) -> Result<()> {
            *self.client_cert.lock().unwrap() = Some(cert.clone());
            Ok(())
        }
        async fn save_request(&self, certname: &str, csr_der: &[u8]) -> Result<()> {
            self.requests.lock().unwrap().insert(certname.to_string(), csr_der.to_vec());
            Ok(())
        }
    }

    fn self_signed_cert_for(key: &PrivateKey, cn: &str) -> Certificate {
        use rcgen::{CertificateParams, DistinguishedName, DnType};
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        let key_pair = key.to_rcgen_key_pair().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        Certificate { der: cert.der().to_vec() }
    }

    fn settings(waitforcert: u64) -> Settings {
        Settings {
            certname: "agent.local".into(),
            ca_base_url: "https://ca.example.com".into(),
            waitforcert,
            certificate_revocation: false,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn reaches_done_when_local_key_and_cert_already_match() {
        let key = PrivateKey::generate(2048).unwrap();
        let cert = self_signed_cert_for(&key, "agent.local");
        let ca_cert = self_signed_cert_for(&PrivateKey::generate(2048).unwrap(), "ca.example.com");

        let ca_client = Arc::new(MockCaClient::default());
        let cert_provider = Arc::new(MockCertProvider {
            cacerts: Mutex::new(Some(vec![ca_cert])),
            private_key: Mutex::new(Some(key)),
            client_cert: Mutex::new(Some(cert)),
            ..Default::default()
        });

        let driver = Driver::new(
            settings(0),
            ca_client,
            cert_provider,
            Arc::new(crate::ssl::csr::RcgenCsrBuilder::new()),
        );

        let outcome = driver.ensure_client_certificate().await.unwrap();
        assert!(matches!(outcome, EnsureOutcome::Context(ctx) if ctx.is_fully_provisioned()));
    }

    #[tokio::test]
    async fn mismatched_local_cert_is_fatal() {
        let key = PrivateKey::generate(2048).unwrap();
        let other_key = PrivateKey::generate(2048).unwrap();
        let cert = self_signed_cert_for(&other_key, "agent.local");
        let ca_cert = self_signed_cert_for(&PrivateKey::generate(2048).unwrap(), "ca.example.com");

        let ca_client = Arc::new(MockCaClient::default());
        let cert_provider = Arc::new(MockCertProvider {
            cacerts: Mutex::new(Some(vec![ca_cert])),
            private_key: Mutex::new(Some(key)),
            client_cert: Mutex::new(Some(cert)),
            ..Default::default()
        });

        let driver = Driver::new(
            settings(0),
            ca_client,
            cert_provider,
            Arc::new(crate::ssl::csr::RcgenCsrBuilder::new()),
        );

        let err = driver.ensure_client_certificate().await.unwrap_err();
        assert!(err.to_string().contains("does not match its private key"));
    }

    #[tokio::test]
    async fn ca_unreachable_raises_the_documented_message() {
        let ca_client = Arc::new(MockCaClient {
            ca_cert_response: CaResponse { status: 500, body: b"Internal Server Error".to_vec() },
            ..Default::default()
        });
        let cert_provider = Arc::new(MockCertProvider::default());

        let driver = Driver::new(
            settings(0),
            ca_client,
            cert_provider,
            Arc::new(crate::ssl::csr::RcgenCsrBuilder::new()),
        );

        let err = driver.ensure_ca_certificates().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Network error: Could not download CA certificate: Internal Server Error"
        );
    }

    #[tokio::test]
    async fn revocation_disabled_never_touches_crl_provider() {
        let ca_cert = self_signed_cert_for(&PrivateKey::generate(2048).unwrap(), "ca.example.com");
        let ca_client = Arc::new(MockCaClient::default());
        let cert_provider = Arc::new(MockCertProvider {
            cacerts: Mutex::new(Some(vec![ca_cert])),
            ..Default::default()
        });

        let driver = Driver::new(
            settings(0),
            ca_client,
            cert_provider.clone(),
            Arc::new(crate::ssl::csr::RcgenCsrBuilder::new()),
        );

        let outcome = driver.ensure_ca_certificates().await.unwrap();
        assert!(matches!(outcome, EnsureOutcome::Context(ctx) if ctx.crls.is_empty()));
        assert!(cert_provider.load_crls().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn waitforcert_zero_requests_exit_on_unsigned_cert() {
        let key = PrivateKey::generate(2048).unwrap();
        let ca_cert = self_signed_cert_for(&PrivateKey::generate(2048).unwrap(), "ca.example.com");

        let ca_client = Arc::new(MockCaClient {
            csr_response: CaResponse { status: 200, body: vec![] },
            cert_response: Mutex::new(vec![CaResponse { status: 404, body: vec![] }]),
            ..Default::default()
        });
        let cert_provider = Arc::new(MockCertProvider {
            cacerts: Mutex::new(Some(vec![ca_cert])),
            private_key: Mutex::new(Some(key)),
            ..Default::default()
        });

        let driver = Driver::new(
            settings(0),
            ca_client,
            cert_provider,
            Arc::new(crate::ssl::csr::RcgenCsrBuilder::new()),
        );

        let outcome = driver.ensure_client_certificate().await.unwrap();
        assert!(matches!(outcome, EnsureOutcome::ExitRequested));
    }
}
