//! Reason codes and rule results.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Why a predicate evaluated the way it did.
///
/// Serialized as a kebab-case string (`user-unauthenticated`). Engines other
/// than the built-in criteria engine may report their own codes through
/// [`Reason::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reason {
    /// Unconditional accept.
    Accept,
    /// Unconditional reject.
    Reject,
    /// No resolved session for an identity criterion.
    UserUnauthenticated,
    /// User id matched.
    UserOk,
    /// User id did not match.
    UserUnauthorized,
    /// Email matched.
    EmailOk,
    /// Email did not match.
    EmailUnauthorized,
    /// Email domain matched.
    DomainOk,
    /// Email domain did not match.
    DomainUnauthorized,
    /// Group membership matched.
    GroupsOk,
    /// Group membership did not match.
    GroupsUnauthorized,
    /// Arbitrary claim matched.
    ClaimOk,
    /// Arbitrary claim did not match.
    ClaimUnauthorized,
    /// HTTP method matched.
    HttpMethodOk,
    /// HTTP method did not match.
    HttpMethodUnauthorized,
    /// HTTP path matched.
    HttpPathOk,
    /// HTTP path did not match.
    HttpPathUnauthorized,
    /// Presented client certificate is valid.
    ValidClientCertificate,
    /// Client certificate missing or invalid.
    InvalidClientCertificate,
    /// No route matched the request.
    RouteNotFound,
    /// Request addressed the proxy's own endpoints.
    PomeriumRoute,
    /// Engine-specific reason.
    Custom(String),
}

impl Reason {
    /// Wire representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::UserUnauthenticated => "user-unauthenticated",
            Self::UserOk => "user-ok",
            Self::UserUnauthorized => "user-unauthorized",
            Self::EmailOk => "email-ok",
            Self::EmailUnauthorized => "email-unauthorized",
            Self::DomainOk => "domain-ok",
            Self::DomainUnauthorized => "domain-unauthorized",
            Self::GroupsOk => "groups-ok",
            Self::GroupsUnauthorized => "groups-unauthorized",
            Self::ClaimOk => "claim-ok",
            Self::ClaimUnauthorized => "claim-unauthorized",
            Self::HttpMethodOk => "http-method-ok",
            Self::HttpMethodUnauthorized => "http-method-unauthorized",
            Self::HttpPathOk => "http-path-ok",
            Self::HttpPathUnauthorized => "http-path-unauthorized",
            Self::ValidClientCertificate => "valid-client-certificate",
            Self::InvalidClientCertificate => "invalid-client-certificate",
            Self::RouteNotFound => "route-not-found",
            Self::PomeriumRoute => "pomerium-route",
            Self::Custom(s) => s,
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Reason {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "accept" => Self::Accept,
            "reject" => Self::Reject,
            "user-unauthenticated" => Self::UserUnauthenticated,
            "user-ok" => Self::UserOk,
            "user-unauthorized" => Self::UserUnauthorized,
            "email-ok" => Self::EmailOk,
            "email-unauthorized" => Self::EmailUnauthorized,
            "domain-ok" => Self::DomainOk,
            "domain-unauthorized" => Self::DomainUnauthorized,
            "groups-ok" => Self::GroupsOk,
            "groups-unauthorized" => Self::GroupsUnauthorized,
            "claim-ok" => Self::ClaimOk,
            "claim-unauthorized" => Self::ClaimUnauthorized,
            "http-method-ok" => Self::HttpMethodOk,
            "http-method-unauthorized" => Self::HttpMethodUnauthorized,
            "http-path-ok" => Self::HttpPathOk,
            "http-path-unauthorized" => Self::HttpPathUnauthorized,
            "valid-client-certificate" => Self::ValidClientCertificate,
            "invalid-client-certificate" => Self::InvalidClientCertificate,
            "route-not-found" => Self::RouteNotFound,
            "pomerium-route" => Self::PomeriumRoute,
            other => Self::Custom(other.to_string()),
        })
    }
}

impl Serialize for Reason {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Reason {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let Ok(reason) = s.parse::<Reason>();
        Ok(reason)
    }
}

/// Boolean verdict plus the reasons that produced it, in evaluation order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleResult {
    /// Verdict.
    pub value: bool,
    /// Ordered, de-duplicated reason codes.
    pub reasons: Vec<Reason>,
}

impl RuleResult {
    /// Result with a single reason.
    #[must_use]
    pub fn new(value: bool, reason: Reason) -> Self {
        Self {
            value,
            reasons: vec![reason],
        }
    }

    /// Result from several reasons, keeping first occurrence order.
    #[must_use]
    pub fn with_reasons(value: bool, reasons: impl IntoIterator<Item = Reason>) -> Self {
        let mut out = Self {
            value,
            reasons: Vec::new(),
        };
        out.extend_reasons(reasons);
        out
    }

    /// Append reasons not already present.
    pub fn extend_reasons(&mut self, reasons: impl IntoIterator<Item = Reason>) {
        for r in reasons {
            if !self.reasons.contains(&r) {
                self.reasons.push(r);
            }
        }
    }

    /// Whether `reason` is among the reasons.
    #[must_use]
    pub fn has_reason(&self, reason: &Reason) -> bool {
        self.reasons.contains(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_serialize_as_kebab_strings() {
        let rr = RuleResult::new(false, Reason::UserUnauthenticated);
        let json = serde_json::to_string(&rr).unwrap();
        assert_eq!(json, r#"{"value":false,"reasons":["user-unauthenticated"]}"#);
    }

    #[test]
    fn unknown_reason_round_trips_as_custom() {
        let r: Reason = serde_json::from_str("\"geo-blocked\"").unwrap();
        assert_eq!(r, Reason::Custom("geo-blocked".into()));
        assert_eq!(r.to_string(), "geo-blocked");
    }

    #[test]
    fn with_reasons_deduplicates_preserving_order() {
        let rr = RuleResult::with_reasons(
            false,
            [Reason::EmailUnauthorized, Reason::UserUnauthenticated, Reason::EmailUnauthorized],
        );
        assert_eq!(
            rr.reasons,
            vec![Reason::EmailUnauthorized, Reason::UserUnauthenticated]
        );
    }
}
