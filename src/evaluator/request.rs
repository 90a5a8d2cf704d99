//! Evaluation inputs and outputs.
//!
//! Field names of the serialized types are the wire contract with the proxy
//! layer.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use super::reason::{Reason, RuleResult};
use crate::httputil::canonical_header_key;
use crate::route::RoutePolicy;

/// Inputs needed for one evaluation.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// The request targets the proxy's own endpoints.
    pub is_internal: bool,
    /// Matched route, `None` when no route matched.
    pub policy: Option<Arc<RoutePolicy>>,
    /// HTTP facts.
    pub http: RequestHttp,
    /// Session reference.
    pub session: RequestSession,
}

/// HTTP facts of the inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestHttp {
    /// HTTP method.
    pub method: String,
    /// Host name without port.
    pub hostname: String,
    /// URL path.
    pub path: String,
    /// Full request URL.
    pub url: String,
    /// Request headers keyed by canonical header name.
    pub headers: BTreeMap<String, String>,
    /// Presented client certificate.
    pub client_certificate: ClientCertificateInfo,
    /// Client IP address.
    pub ip: String,
}

impl RequestHttp {
    /// Build HTTP facts from a parsed request URL.
    ///
    /// Header names are canonicalized so lookups are stable regardless of
    /// how the proxy layer spelled them.
    #[must_use]
    pub fn new(
        method: &str,
        url: &Url,
        headers: impl IntoIterator<Item = (String, String)>,
        client_certificate: ClientCertificateInfo,
        ip: impl Into<String>,
    ) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            hostname: url.host_str().unwrap_or_default().to_string(),
            path: url.path().to_string(),
            url: url.to_string(),
            headers: headers
                .into_iter()
                .map(|(k, v)| (canonical_header_key(&k), v))
                .collect(),
            client_certificate,
            ip: ip.into(),
        }
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .or_else(|| {
                self.headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }
}

/// Client certificate as presented on the TLS connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientCertificateInfo {
    /// The client presented a certificate.
    pub presented: bool,
    /// Leaf certificate, PEM (unvalidated).
    #[serde(skip_serializing_if = "String::is_empty")]
    pub leaf: String,
    /// Remainder of the chain as presented, PEM (unvalidated).
    #[serde(skip_serializing_if = "String::is_empty")]
    pub intermediates: String,
}

/// Session reference of the inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSession {
    /// Session id, empty when the request carries no session.
    pub id: String,
}

/// Which rule set a trace record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    /// Allow rule.
    Allow,
    /// Deny rule.
    Deny,
}

/// Record of one predicate evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationTrace {
    /// Predicate label (`deny[0]`, `allow[2]`, `default-client-certificate`).
    pub id: String,
    /// Rule set.
    pub kind: TraceKind,
    /// Predicate output.
    pub value: bool,
    /// Predicate reasons.
    pub reasons: Vec<Reason>,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Allow rule set verdict.
    pub allow: RuleResult,
    /// Deny rule set verdict.
    pub deny: RuleResult,
    /// Headers to set on the upstream request.
    pub headers: BTreeMap<String, Vec<String>>,
    /// Per-predicate traces in evaluation order.
    pub traces: Vec<EvaluationTrace>,
}

impl EvaluationResult {
    /// Final decision: allowed and not denied.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.allow.value && !self.deny.value
    }

    /// First value of an outbound header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.first())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_http_new_extracts_url_parts_and_canonicalizes_headers() {
        let url = Url::parse("https://app.example.com:8443/admin?x=1").unwrap();
        let http = RequestHttp::new(
            "get",
            &url,
            [("x-forwarded-for".to_string(), "10.0.0.1".to_string())],
            ClientCertificateInfo::default(),
            "10.0.0.1",
        );
        assert_eq!(http.method, "GET");
        assert_eq!(http.hostname, "app.example.com");
        assert_eq!(http.path, "/admin");
        assert_eq!(http.url, "https://app.example.com:8443/admin?x=1");
        assert_eq!(http.header("X-Forwarded-For"), Some("10.0.0.1"));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut http = RequestHttp::default();
        http.headers.insert("x-custom".into(), "v".into());
        assert_eq!(http.header("X-Custom"), Some("v"));
    }

    #[test]
    fn deny_takes_precedence_in_final_decision() {
        let res = EvaluationResult {
            allow: RuleResult::new(true, Reason::Accept),
            deny: RuleResult::new(true, Reason::InvalidClientCertificate),
            ..Default::default()
        };
        assert!(!res.is_allowed());
    }

    #[test]
    fn result_serializes_with_wire_field_names() {
        let res = EvaluationResult::default();
        let v = serde_json::to_value(&res).unwrap();
        for key in ["allow", "deny", "headers", "traces"] {
            assert!(v.get(key).is_some(), "missing {key}");
        }
    }
}
