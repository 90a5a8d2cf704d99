//! Certificate identity extraction.
//!
//! Pulls the fields post-chain constraints match on out of a DER-encoded
//! certificate: the Common Name and every subject alternative name, grouped
//! by kind.

use std::net::IpAddr;

use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

/// Identity fields of a client certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertIdentity {
    /// Certificate Common Name (CN).
    pub common_name: Option<String>,
    /// SAN DNS entries.
    pub san_dns_names: Vec<String>,
    /// SAN email (RFC 822) entries.
    pub san_emails: Vec<String>,
    /// SAN IP address entries, formatted.
    pub san_ips: Vec<String>,
    /// SAN URI entries (e.g. SPIFFE IDs).
    pub san_uris: Vec<String>,
    /// Label for logs: SPIFFE URI, then CN, then `<unknown>`.
    pub display_name: String,
}

impl CertIdentity {
    /// Parse a DER-encoded certificate and extract its identity fields.
    pub fn from_der(der: &[u8]) -> Result<Self, String> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| format!("failed to parse certificate: {e}"))?;
        Ok(Self::from_cert(&cert))
    }

    /// Extract identity fields from an already parsed certificate.
    #[must_use]
    pub fn from_cert(cert: &X509Certificate<'_>) -> Self {
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_owned);

        let mut id = Self {
            common_name,
            ..Self::default()
        };

        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => id.san_dns_names.push((*dns).to_owned()),
                    GeneralName::RFC822Name(email) => id.san_emails.push((*email).to_owned()),
                    GeneralName::URI(uri) => id.san_uris.push((*uri).to_owned()),
                    GeneralName::IPAddress(raw) => {
                        if let Some(ip) = ip_from_bytes(raw) {
                            id.san_ips.push(ip.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }

        id.display_name = id
            .san_uris
            .iter()
            .find(|u| u.starts_with("spiffe://"))
            .or(id.common_name.as_ref())
            .map_or_else(|| "<unknown>".to_owned(), Clone::clone);
        id
    }
}

fn ip_from_bytes(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => <[u8; 4]>::try_from(raw).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(raw).ok().map(IpAddr::from),
        _ => None,
    }
}
