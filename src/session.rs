//! Session and identity-provider collaborators.
//!
//! The evaluator never talks to the identity provider itself. It resolves a
//! session id to claims through a synchronous [`SessionStore`] and, for
//! serverless upstreams, asks an [`IdentityTokenSource`] for a bearer token.
//! Both are in-memory lookups: no network I/O happens inside evaluation.

use std::collections::BTreeMap;
use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Identity claims attached to a session: claim name → values.
///
/// Single-valued claims (`email`) are stored as one-element lists so that
/// rule evaluation and header mapping treat every claim the same way.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, OneOrMany>", into = "BTreeMap<String, Vec<String>>")]
pub struct SessionClaims {
    claims: BTreeMap<String, Vec<String>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl From<BTreeMap<String, OneOrMany>> for SessionClaims {
    fn from(raw: BTreeMap<String, OneOrMany>) -> Self {
        let claims = raw
            .into_iter()
            .map(|(k, v)| match v {
                OneOrMany::One(s) => (k, vec![s]),
                OneOrMany::Many(list) => (k, list),
            })
            .collect();
        Self { claims }
    }
}

impl From<SessionClaims> for BTreeMap<String, Vec<String>> {
    fn from(c: SessionClaims) -> Self {
        c.claims
    }
}

impl SessionClaims {
    /// Empty claim set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set a claim.
    #[must_use]
    pub fn with<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.claims
            .insert(name.to_string(), values.into_iter().map(Into::into).collect());
        self
    }

    /// All values of a claim (empty when absent).
    #[must_use]
    pub fn get(&self, name: &str) -> &[String] {
        self.claims.get(name).map_or(&[], Vec::as_slice)
    }

    /// First value of a claim.
    #[must_use]
    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name).first().map(String::as_str)
    }

    /// The user id: `user` claim, falling back to `sub`.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.first("user").or_else(|| self.first("sub"))
    }

    /// Email address.
    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.first("email")
    }

    /// Group memberships.
    #[must_use]
    pub fn groups(&self) -> &[String] {
        self.get("groups")
    }

    /// Iterate claims in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.claims.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

/// Resolves a session id to identity claims.
///
/// Lookup failures are ordinary facts: an unknown or expired session simply
/// returns `None`.
pub trait SessionStore: Send + Sync + 'static {
    /// Look up the claims for `session_id`.
    fn get(&self, session_id: &str) -> Option<SessionClaims>;
}

/// In-memory session store backed by a `DashMap`.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, SessionClaims>,
}

impl InMemorySessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a session id → claims map.
    #[must_use]
    pub fn from_map(map: BTreeMap<String, SessionClaims>) -> Self {
        let sessions = DashMap::new();
        for (id, claims) in map {
            sessions.insert(id, claims);
        }
        Self { sessions }
    }

    /// Insert or replace a session.
    pub fn insert(&self, session_id: impl Into<String>, claims: SessionClaims) {
        self.sessions.insert(session_id.into(), claims);
    }

    /// Remove a session. Returns `true` if it existed.
    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Number of stored sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionStore for InMemorySessionStore {
    fn get(&self, session_id: &str) -> Option<SessionClaims> {
        self.sessions.get(session_id).map(|e| e.value().clone())
    }
}

impl fmt::Debug for InMemorySessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemorySessionStore")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

/// Supplies bearer tokens for upstreams that authenticate the proxy with a
/// cloud identity (serverless authentication).
pub trait IdentityTokenSource: Send + Sync + 'static {
    /// Token for `service_account` scoped to `audience`, if one is cached.
    fn token(&self, service_account: &str, audience: &str) -> Option<String>;
}

/// Token source returning pre-provisioned tokens keyed by audience.
#[derive(Debug, Default)]
pub struct StaticIdentityTokenSource {
    tokens: DashMap<String, String>,
}

impl StaticIdentityTokenSource {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token for an audience.
    pub fn insert(&self, audience: impl Into<String>, token: impl Into<String>) {
        self.tokens.insert(audience.into(), token.into());
    }
}

impl IdentityTokenSource for StaticIdentityTokenSource {
    fn token(&self, _service_account: &str, audience: &str) -> Option<String> {
        self.tokens.get(audience).map(|t| t.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_accept_scalar_and_list_values() {
        // GIVEN: JSON claims mixing strings and arrays
        let json = r#"{"sub":"u-1","email":"a@example.com","groups":["admins","ops"]}"#;
        // WHEN: deserialising
        let claims: SessionClaims = serde_json::from_str(json).unwrap();
        // THEN: scalars become single-element lists
        assert_eq!(claims.user_id(), Some("u-1"));
        assert_eq!(claims.email(), Some("a@example.com"));
        assert_eq!(claims.groups(), ["admins", "ops"]);
        assert!(claims.get("missing").is_empty());
    }

    #[test]
    fn user_claim_takes_precedence_over_sub() {
        let claims = SessionClaims::new()
            .with("sub", ["idp-subject"])
            .with("user", ["user-42"]);
        assert_eq!(claims.user_id(), Some("user-42"));
    }

    #[test]
    fn in_memory_store_lookup_and_remove() {
        let store = InMemorySessionStore::new();
        store.insert("s1", SessionClaims::new().with("email", ["x@y.z"]));
        assert_eq!(store.get("s1").unwrap().email(), Some("x@y.z"));
        assert!(store.get("nope").is_none());
        assert!(store.remove("s1"));
        assert!(store.is_empty());
    }

    #[test]
    fn static_token_source_is_keyed_by_audience() {
        let src = StaticIdentityTokenSource::new();
        src.insert("https://svc.run.app", "tok");
        assert_eq!(src.token("sa@x", "https://svc.run.app").as_deref(), Some("tok"));
        assert!(src.token("sa@x", "https://other").is_none());
    }
}
