//! Client certificate validation.
//!
//! Produces the `is_valid_client_certificate` fact consumed by route rules.
//! "Invalid" is an ordinary outcome (`Ok(false)`); only bytes that cannot be
//! parsed as certificates are an error.

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::request::ClientCertificateInfo;
use crate::x509::chain::{ChainPolicy, DEFAULT_MAX_DEPTH, RevocationList, TrustAnchors};
use crate::x509::identity::CertIdentity;
use crate::x509::pem;
use crate::{Error, Result};

/// Additional checks applied after the chain of trust is established.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientCertConstraints {
    /// Maximum number of intermediates between leaf and CA (default 10,
    /// `0` for unlimited).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_verify_depth: Option<usize>,
    /// Each matcher must match at least one SAN of its kind.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub san_matchers: Vec<SanMatcher>,
}

/// Regular expression over one kind of subject alternative name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SanMatcher {
    /// SAN kind.
    pub kind: SanKind,
    /// Pattern, implicitly anchored at both ends.
    pub pattern: String,
}

/// Subject alternative name kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SanKind {
    /// DNS name.
    Dns,
    /// Email address.
    Email,
    /// IP address.
    IpAddress,
    /// URI.
    Uri,
}

#[derive(Debug)]
struct CompiledConstraints {
    max_depth: Option<usize>,
    san: Vec<(SanKind, Regex)>,
}

impl CompiledConstraints {
    fn compile(c: &ClientCertConstraints) -> Result<Self> {
        let san = c
            .san_matchers
            .iter()
            .map(|m| {
                Regex::new(&format!("^(?:{})$", m.pattern))
                    .map(|re| (m.kind, re))
                    .map_err(|e| Error::Config(format!("invalid SAN pattern '{}': {e}", m.pattern)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            max_depth: match c.max_verify_depth {
                None => Some(DEFAULT_MAX_DEPTH),
                Some(0) => None,
                Some(n) => Some(n),
            },
            san,
        })
    }

    fn check(&self, id: &CertIdentity) -> bool {
        self.san.iter().all(|(kind, re)| {
            let names = match kind {
                SanKind::Dns => &id.san_dns_names,
                SanKind::Email => &id.san_emails,
                SanKind::IpAddress => &id.san_ips,
                SanKind::Uri => &id.san_uris,
            };
            names.iter().any(|n| re.is_match(n))
        })
    }
}

/// Validates presented client certificates against a CA, a CRL and
/// post-chain constraints.
#[derive(Debug, Clone)]
pub struct ClientCertificateValidator {
    anchors: Arc<TrustAnchors>,
    crl: Arc<RevocationList>,
    constraints: Arc<CompiledConstraints>,
}

impl ClientCertificateValidator {
    /// Build a validator. Fails on invalid SAN patterns.
    pub fn new(
        anchors: TrustAnchors,
        crl: RevocationList,
        constraints: &ClientCertConstraints,
    ) -> Result<Self> {
        Ok(Self {
            anchors: Arc::new(anchors),
            crl: Arc::new(crl),
            constraints: Arc::new(CompiledConstraints::compile(constraints)?),
        })
    }

    /// Same CRL and constraints, different trust anchors (route CA override).
    #[must_use]
    pub fn with_anchors(&self, anchors: TrustAnchors) -> Self {
        Self {
            anchors: Arc::new(anchors),
            crl: Arc::clone(&self.crl),
            constraints: Arc::clone(&self.constraints),
        }
    }

    /// Whether trust anchors are configured.
    #[must_use]
    pub fn has_anchors(&self) -> bool {
        !self.anchors.is_empty()
    }

    /// Validate `info` at `now` (seconds since the Unix epoch).
    pub fn validate(&self, info: &ClientCertificateInfo, now: i64) -> Result<bool> {
        if !info.presented {
            return Ok(false);
        }

        let leaf_der = pem::certificates(info.leaf.as_bytes())
            .map_err(|e| Error::CertificateValidationFault(format!("leaf: {e}")))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::CertificateValidationFault("leaf: no certificate presented".to_string())
            })?;
        let intermediates = pem::certificates(info.intermediates.as_bytes())
            .map_err(|e| Error::CertificateValidationFault(format!("intermediates: {e}")))?;
        let identity = CertIdentity::from_der(&leaf_der).map_err(Error::CertificateValidationFault)?;

        if self.anchors.is_empty() {
            debug!(
                client = %identity.display_name,
                "client certificate presented but no client CA configured"
            );
            return Ok(false);
        }

        let policy = ChainPolicy {
            now,
            max_depth: self.constraints.max_depth,
        };
        if let Err(reason) = self.anchors.verify(&leaf_der, &intermediates, &self.crl, policy) {
            debug!(client = %identity.display_name, %reason, "client certificate rejected");
            return Ok(false);
        }
        if !self.constraints.check(&identity) {
            debug!(client = %identity.display_name, "client certificate failed SAN constraints");
            return Ok(false);
        }
        Ok(true)
    }
}

/// One-shot validation with explicit inputs.
pub fn is_valid_client_certificate(
    ca: &[u8],
    crl: &[u8],
    info: &ClientCertificateInfo,
    constraints: &ClientCertConstraints,
    now: i64,
) -> Result<bool> {
    let anchors = TrustAnchors::from_bundle(ca).map_err(Error::CertificateValidationFault)?;
    let crl = RevocationList::from_bundle(crl).map_err(Error::CertificateValidationFault)?;
    ClientCertificateValidator::new(anchors, crl, constraints)?.validate(info, now)
}
