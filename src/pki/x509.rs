use std::io::Cursor;

use x509_parser::prelude::*;
use x509_parser::revocation_list::CertificateRevocationList;

use crate::error::{Error, Result};

/// A single parsed X.509 certificate, held as DER with parsing done on
/// demand (the `x509_parser::X509Certificate` borrows from the DER buffer,
/// so we don't keep the parsed form around across an `await` point).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub der: Vec<u8>,
}

impl Certificate {
    /// Parse an ordered chain of PEM certificates, leaf first. Fails
    /// closed: any unparseable entry, or an empty chain, is a [`Error::Parse`].
    pub fn parse_pem_chain(pem: &[u8]) -> Result<Vec<Certificate>> {
        let mut cursor = Cursor::new(pem);
        let ders: Vec<_> = rustls_pemfile::certs(&mut cursor)
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Parse(format!("invalid PEM certificate chain: {e}")))?;

        if ders.is_empty() {
            return Err(Error::Parse("no certificates found in PEM input".into()));
        }

        let certs: Vec<Certificate> = ders
            .into_iter()
            .map(|der| Certificate { der: der.to_vec() })
            .collect();

        // Validate each entry actually decodes as X.509 before accepting
        // the chain: the spec requires nothing is persisted unless it
        // parsed and validated successfully.
        for cert in &certs {
            cert.parsed()?;
        }

        Ok(certs)
    }

    /// Re-serialize a chain back to an ordered PEM blob for persistence.
    pub fn chain_to_pem(certs: &[Certificate]) -> String {
        use base64::Engine;
        let mut out = String::new();
        for cert in certs {
            out.push_str("-----BEGIN CERTIFICATE-----\n");
            let encoded = base64::engine::general_purpose::STANDARD.encode(&cert.der);
            for line in encoded.as_bytes().chunks(64) {
                out.push_str(std::str::from_utf8(line).unwrap());
                out.push('\n');
            }
            out.push_str("-----END CERTIFICATE-----\n");
        }
        out
    }

    pub fn parsed(&self) -> Result<X509Certificate<'_>> {
        let (_, cert) = X509Certificate::from_der(&self.der)
            .map_err(|e| Error::Parse(format!("invalid X.509 certificate: {e}")))?;
        Ok(cert)
    }

    /// The certificate's subject, formatted as it would read in an RFC
    /// 2253-ish string, e.g. `CN=agent.example.com`.
    pub fn subject(&self) -> Result<String> {
        Ok(self.parsed()?.subject().to_string())
    }

    /// DER-encoded `SubjectPublicKeyInfo`, comparable against
    /// [`crate::pki::PrivateKey::public_key_der`].
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        Ok(self.parsed()?.public_key().raw.to_vec())
    }

    pub fn raw_serial(&self) -> Result<Vec<u8>> {
        Ok(self.parsed()?.raw_serial().to_vec())
    }
}

/// A single parsed X.509 CRL, held as DER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crl {
    pub der: Vec<u8>,
}

impl Crl {
    /// Parse an ordered chain of PEM CRLs, positionally matching the CA
    /// chain they were requested alongside.
    pub fn parse_pem_chain(pem: &[u8]) -> Result<Vec<Crl>> {
        let mut cursor = Cursor::new(pem);
        let ders: Vec<_> = rustls_pemfile::crls(&mut cursor)
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Parse(format!("invalid PEM CRL chain: {e}")))?;

        if ders.is_empty() {
            return Err(Error::Parse("no CRLs found in PEM input".into()));
        }

        let crls: Vec<Crl> = ders.into_iter().map(|der| Crl { der: der.to_vec() }).collect();

        for crl in &crls {
            crl.parsed()?;
        }

        Ok(crls)
    }

    pub fn chain_to_pem(crls: &[Crl]) -> String {
        use base64::Engine;
        let mut out = String::new();
        for crl in crls {
            out.push_str("-----BEGIN X509 CRL-----\n");
            let encoded = base64::engine::general_purpose::STANDARD.encode(&crl.der);
            for line in encoded.as_bytes().chunks(64) {
                out.push_str(std::str::from_utf8(line).unwrap());
                out.push('\n');
            }
            out.push_str("-----END X509 CRL-----\n");
        }
        out
    }

    pub fn parsed(&self) -> Result<CertificateRevocationList<'_>> {
        let (_, crl) = CertificateRevocationList::from_der(&self.der)
            .map_err(|e| Error::Parse(format!("invalid X.509 CRL: {e}")))?;
        Ok(crl)
    }

    /// Whether `cert`'s serial number appears among this CRL's revoked
    /// entries.
    pub fn revokes(&self, cert: &Certificate) -> Result<bool> {
        let crl = self.parsed()?;
        let serial = cert.raw_serial()?;
        Ok(crl
            .iter_revoked_certificates()
            .any(|entry| entry.raw_serial() == serial.as_slice()))
    }
}

/// Whether `cert`'s serial number appears on any CRL in `crls`.
pub fn is_revoked(cert: &Certificate, crls: &[Crl]) -> Result<bool> {
    for crl in crls {
        if crl.revokes(cert)? {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pem_is_a_parse_error() {
        let result = Certificate::parse_pem_chain(b"");
        assert!(result.is_err());
    }

    #[test]
    fn garbage_pem_is_a_parse_error() {
        let result = Certificate::parse_pem_chain(b"not a certificate");
        assert!(result.is_err());
    }
}
