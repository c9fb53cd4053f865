use std::collections::BTreeMap;
use std::path::Path;

use rcgen::{CertificateParams, CustomExtension, DistinguishedName, DnType, SanType};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::pki::PrivateKey;

/// One entry of a CSR's subject alternative name list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanEntry {
    Dns(String),
    Ip(std::net::IpAddr),
}

impl SanEntry {
    /// Parse a single `TYPE:VALUE` entry, defaulting to `DNS` for a bare
    /// value (per the `dns_alt_names` grammar in the CSR construction rules).
    fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if let Some((ty, value)) = raw.split_once(':') {
            match ty.to_ascii_uppercase().as_str() {
                "DNS" => Ok(SanEntry::Dns(value.to_string())),
                "IP" => value
                    .parse()
                    .map(SanEntry::Ip)
                    .map_err(|e| Error::Config(format!("invalid IP SAN '{value}': {e}"))),
                other => Err(Error::Config(format!("unsupported SAN type '{other}' in dns_alt_names"))),
            }
        } else {
            Ok(SanEntry::Dns(raw.to_string()))
        }
    }

    fn into_rcgen(self) -> Result<SanType> {
        match self {
            SanEntry::Dns(name) => name
                .clone()
                .try_into()
                .map(SanType::DnsName)
                .map_err(|e| Error::Config(format!("invalid DNS SAN '{name}': {e:?}"))),
            SanEntry::Ip(ip) => Ok(SanType::IpAddress(ip)),
        }
    }
}

/// Parse the `dns_alt_names` configuration string into a deduplicated list
/// of SAN entries, with `certname` always appended as a `DNS` entry.
pub fn parse_san_list(dns_alt_names: &str, certname: &str) -> Result<Vec<SanEntry>> {
    let mut entries = Vec::new();

    for raw in dns_alt_names.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let entry = SanEntry::parse(raw)?;
        if !entries.contains(&entry) {
            entries.push(entry);
        }
    }

    let certname_entry = SanEntry::Dns(certname.to_string());
    if !entries.contains(&certname_entry) {
        entries.push(certname_entry);
    }

    Ok(entries)
}

/// The optional `custom_attributes`/`extension_requests` document
/// referenced by `csr_attributes_path`, each a map of dotted-decimal OID
/// strings to UTF8 values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CsrAttributesDocument {
    #[serde(default)]
    pub custom_attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub extension_requests: BTreeMap<String, String>,
}

impl CsrAttributesDocument {
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        let doc: Self = serde_yaml::from_str(&contents)?;
        Ok(doc)
    }
}

/// Everything needed to build one certificate signing request.
#[derive(Debug, Clone, Default)]
pub struct CsrSpec {
    pub certname: String,
    pub sans: Vec<SanEntry>,
    pub custom_attributes: BTreeMap<String, String>,
    pub extension_requests: BTreeMap<String, String>,
}

impl CsrSpec {
    pub fn new(certname: impl Into<String>) -> Self {
        Self {
            certname: certname.into(),
            ..Default::default()
        }
    }

    pub fn with_sans(mut self, sans: Vec<SanEntry>) -> Self {
        self.sans = sans;
        self
    }

    pub fn with_attributes(mut self, doc: CsrAttributesDocument) -> Self {
        self.custom_attributes = doc.custom_attributes;
        self.extension_requests = doc.extension_requests;
        self
    }
}

/// Builds a signed, DER-encoded PKCS#10 request from a [`CsrSpec`] and a
/// [`PrivateKey`].
pub trait CsrBuilder: Send + Sync {
    fn build(&self, spec: &CsrSpec, key: &PrivateKey) -> Result<Vec<u8>>;
}

/// Parse a dotted-decimal OID string ("1.3.6.1.4.1.34380.1.1") into the
/// numeric form `rcgen::CustomExtension` expects.
fn parse_oid(oid: &str) -> Result<Vec<u64>> {
    oid.split('.')
        .map(|part| {
            part.parse::<u64>()
                .map_err(|e| Error::Config(format!("invalid OID component '{part}' in '{oid}': {e}")))
        })
        .collect()
}

/// DER-encode a UTF8String value the way the custom_attributes/
/// extension_requests maps expect it — a primitive UTF8String TLV.
fn der_utf8_string(value: &str) -> Vec<u8> {
    let bytes = value.as_bytes();
    let mut der = vec![0x0c]; // UTF8String tag
    encode_der_length(bytes.len(), &mut der);
    der.extend_from_slice(bytes);
    der
}

fn encode_der_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let len_bytes = len.to_be_bytes();
        let significant: Vec<u8> = len_bytes
            .iter()
            .copied()
            .skip_while(|&b| b == 0)
            .collect();
        out.push(0x80 | significant.len() as u8);
        out.extend_from_slice(&significant);
    }
}

/// `rcgen`-backed [`CsrBuilder`].
///
/// `rcgen`'s CSR support has no concept of arbitrary top-level PKCS#10
/// attributes distinct from the single `extensionRequest` attribute it
/// emits for `subject_alt_names`/`custom_extensions`. Both
/// `custom_attributes` and `extension_requests` are therefore folded into
/// that one attribute, each entry becoming its own `CustomExtension`
/// keyed by its OID.
pub struct RcgenCsrBuilder;

impl RcgenCsrBuilder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RcgenCsrBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CsrBuilder for RcgenCsrBuilder {
    fn build(&self, spec: &CsrSpec, key: &PrivateKey) -> Result<Vec<u8>> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, spec.certname.clone());
        params.distinguished_name = dn;

        params.subject_alt_names = spec
            .sans
            .iter()
            .cloned()
            .map(SanEntry::into_rcgen)
            .collect::<Result<Vec<_>>>()?;

        for (oid, value) in spec.custom_attributes.iter().chain(spec.extension_requests.iter()) {
            let numeric_oid = parse_oid(oid)?;
            params
                .custom_extensions
                .push(CustomExtension::from_oid_content(&numeric_oid, der_utf8_string(value)));
        }

        let key_pair = key.to_rcgen_key_pair()?;
        let csr = params.serialize_request(&key_pair)?;
        Ok(csr.der().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_entries_default_to_dns() {
        let sans = parse_san_list("one,IP:192.168.0.1,DNS:two.com", "agent.local").unwrap();
        assert!(sans.contains(&SanEntry::Dns("one".into())));
        assert!(sans.contains(&SanEntry::Ip("192.168.0.1".parse().unwrap())));
        assert!(sans.contains(&SanEntry::Dns("two.com".into())));
        assert!(sans.contains(&SanEntry::Dns("agent.local".into())));
        assert_eq!(sans.len(), 4);
    }

    #[test]
    fn certname_is_not_duplicated_when_already_present() {
        let sans = parse_san_list("DNS:agent.local", "agent.local").unwrap();
        assert_eq!(sans, vec![SanEntry::Dns("agent.local".into())]);
    }

    #[test]
    fn empty_alt_names_yields_just_certname() {
        let sans = parse_san_list("", "agent.local").unwrap();
        assert_eq!(sans, vec![SanEntry::Dns("agent.local".into())]);
    }

    #[test]
    fn unsupported_san_type_is_a_config_error() {
        let result = parse_san_list("EMAIL:foo@example.com", "agent.local");
        assert!(result.is_err());
    }

    #[test]
    fn builds_a_der_csr() {
        let key = PrivateKey::generate(2048).unwrap();
        let spec = CsrSpec::new("agent.local").with_sans(vec![SanEntry::Dns("agent.local".into())]);
        let der = RcgenCsrBuilder::new().build(&spec, &key).unwrap();
        assert!(!der.is_empty());
    }

    /// A non-ASCII `DNS:` entry must raise `Error::Config`, not panic — the
    /// `Ia5String` conversion inside `into_rcgen` rejects any non-ASCII byte.
    #[test]
    fn non_ascii_dns_san_is_a_config_error_not_a_panic() {
        let key = PrivateKey::generate(2048).unwrap();
        let spec = CsrSpec::new("agent.local").with_sans(vec![SanEntry::Dns("café.example.com".into())]);
        let err = RcgenCsrBuilder::new().build(&spec, &key).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    /// Scenario 6: the produced CSR's DER-encoded `subjectAltName` extension
    /// decodes back to exactly the SAN set the spec describes, regardless
    /// of order.
    #[test]
    fn der_subject_alt_names_match_the_expected_set() {
        use std::collections::BTreeSet;
        use x509_parser::certification_request::X509CertificationRequest;
        use x509_parser::extensions::{GeneralName, ParsedExtension};

        let key = PrivateKey::generate(2048).unwrap();
        let sans = parse_san_list("one,IP:192.168.0.1,DNS:two.com", "agent.local").unwrap();
        let spec = CsrSpec::new("agent.local").with_sans(sans);
        let der = RcgenCsrBuilder::new().build(&spec, &key).unwrap();

        let (_, csr) = X509CertificationRequest::from_der(&der).unwrap();

        let mut found: BTreeSet<String> = BTreeSet::new();
        for ext in csr.certification_request_info.requested_extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = ext {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(n) => {
                            found.insert(format!("DNS:{n}"));
                        }
                        GeneralName::IPAddress(bytes) => {
                            let ip = match *bytes {
                                [a, b, c, d] => std::net::IpAddr::from([a, b, c, d]),
                                _ => {
                                    let mut octets = [0u8; 16];
                                    octets.copy_from_slice(bytes);
                                    std::net::IpAddr::from(octets)
                                }
                            };
                            found.insert(format!("IP Address:{ip}"));
                        }
                        other => panic!("unexpected SAN entry in CSR: {other:?}"),
                    }
                }
            }
        }

        let expected: BTreeSet<String> = ["DNS:one", "IP Address:192.168.0.1", "DNS:two.com", "DNS:agent.local"]
            .into_iter()
            .map(str::to_string)
            .collect();
        assert_eq!(found, expected);
    }
}
