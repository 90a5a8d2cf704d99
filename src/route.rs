//! Route policy configuration and deterministic route identifiers.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Authorization configuration bound to one upstream route.
///
/// Rule documents are kept as opaque JSON values: their shape belongs to the
/// configured [`RuleEngine`](crate::rules::RuleEngine), which compiles them
/// when the snapshot is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutePolicy {
    /// Public URL (host pattern) the route answers on.
    pub from: String,
    /// Upstream targets.
    pub to: Vec<String>,
    /// Optional path prefix the route is restricted to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Optional exact path the route is restricted to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Optional path regex the route is restricted to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    /// Allow rules.
    pub allow: Vec<serde_json::Value>,
    /// Deny rules.
    pub deny: Vec<serde_json::Value>,
    /// Base64-encoded PEM client CA overriding the global one for this route.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_downstream_client_ca: Option<String>,
    /// Attach a cloud identity token for the upstream.
    pub enable_serverless_authentication: bool,
}

/// Fields that identify a route. Everything else (rules, CA override) can
/// change without changing the route id.
#[derive(Serialize)]
struct RouteIdentity<'a> {
    from: &'a str,
    prefix: Option<&'a str>,
    path: Option<&'a str>,
    regex: Option<&'a str>,
    to: &'a [String],
}

impl RoutePolicy {
    /// Deterministic route id: the first 8 bytes (big endian) of the SHA-256
    /// of the canonical JSON of the identity fields.
    ///
    /// Stable across restarts and reloads of unchanged content.
    pub fn route_id(&self) -> Result<u64> {
        let identity = RouteIdentity {
            from: &self.from,
            prefix: self.prefix.as_deref(),
            path: self.path.as_deref(),
            regex: self.regex.as_deref(),
            to: &self.to,
        };
        let canonical = serde_json::to_vec(&identity)?;
        let digest = Sha256::digest(&canonical);
        let mut id = [0u8; 8];
        id.copy_from_slice(&digest[..8]);
        Ok(u64::from_be_bytes(id))
    }

    /// Decode the route-specific client CA, if any.
    pub fn client_ca(&self) -> Result<Option<Vec<u8>>> {
        match self.tls_downstream_client_ca.as_deref() {
            None | Some("") => Ok(None),
            Some(b64) => STANDARD.decode(b64.trim()).map(Some).map_err(|e| {
                Error::Config(format!(
                    "route {}: invalid tls_downstream_client_ca: {e}",
                    self.from
                ))
            }),
        }
    }

    /// Audience presented to serverless upstreams: the origin of the first
    /// upstream target.
    #[must_use]
    pub fn upstream_audience(&self) -> Option<String> {
        let first = self.to.first()?;
        url::Url::parse(first)
            .ok()
            .map(|u| u.origin().ascii_serialization())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(from: &str, to: &str) -> RoutePolicy {
        RoutePolicy {
            from: from.to_string(),
            to: vec![to.to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn route_id_is_stable_for_identical_identity() {
        let a = policy("https://app.example.com", "http://app.internal");
        let b = policy("https://app.example.com", "http://app.internal");
        assert_eq!(a.route_id().unwrap(), b.route_id().unwrap());
    }

    #[test]
    fn route_id_ignores_rules_and_ca_override() {
        // GIVEN: two policies differing only in non-identity fields
        let a = policy("https://app.example.com", "http://app.internal");
        let mut b = a.clone();
        b.allow.push(serde_json::json!({"and": [{"accept": true}]}));
        b.tls_downstream_client_ca = Some("Zm9v".into());
        b.enable_serverless_authentication = true;
        // THEN: same route id
        assert_eq!(a.route_id().unwrap(), b.route_id().unwrap());
    }

    #[test]
    fn route_id_changes_with_identity_fields() {
        let a = policy("https://app.example.com", "http://app.internal");
        let mut b = a.clone();
        b.prefix = Some("/api".into());
        let c = policy("https://app.example.com", "http://other.internal");
        assert_ne!(a.route_id().unwrap(), b.route_id().unwrap());
        assert_ne!(a.route_id().unwrap(), c.route_id().unwrap());
    }

    #[test]
    fn client_ca_decodes_base64() {
        let mut p = policy("https://a", "http://b");
        assert!(p.client_ca().unwrap().is_none());
        p.tls_downstream_client_ca = Some(STANDARD.encode("-----BEGIN CERTIFICATE-----"));
        assert_eq!(
            p.client_ca().unwrap().unwrap(),
            b"-----BEGIN CERTIFICATE-----".to_vec()
        );
        p.tls_downstream_client_ca = Some("%%%".into());
        assert!(matches!(p.client_ca(), Err(Error::Config(_))));
    }

    #[test]
    fn upstream_audience_is_origin_of_first_target() {
        let p = policy("https://a", "https://svc-abc.run.app/path");
        assert_eq!(p.upstream_audience().as_deref(), Some("https://svc-abc.run.app"));
    }
}
