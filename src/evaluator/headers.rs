//! Outbound identity headers.
//!
//! Every evaluated request receives a signed identity assertion
//! (`X-Pomerium-Jwt-Assertion`) plus one plain header per configured
//! claim mapping. Routes with serverless authentication additionally get an
//! `Authorization: Bearer` token from the [`IdentityTokenSource`].
//!
//! Inbound assertions are never trusted here; [`carry_over_jwt_assertion`]
//! only relays them to the `-For` header.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::request::{RequestHttp, RequestSession};
use super::signing_key::SigningKey;
use crate::Result;
use crate::httputil::{HEADER_AUTHORIZATION, HEADER_JWT_ASSERTION, HEADER_JWT_ASSERTION_FOR};
use crate::route::RoutePolicy;
use crate::session::{IdentityTokenSource, SessionClaims};

/// Assertion lifetime in seconds.
pub const ASSERTION_TTL_SECS: i64 = 5 * 60;

/// Outbound header map: canonical name → values.
pub type HeaderMap = BTreeMap<String, Vec<String>>;

/// Inputs of one header evaluation.
#[derive(Debug, Clone, Copy)]
pub struct HeadersRequest<'a> {
    /// HTTP facts.
    pub http: &'a RequestHttp,
    /// Session reference.
    pub session: &'a RequestSession,
    /// Resolved claims, `None` when unauthenticated.
    pub claims: Option<&'a SessionClaims>,
    /// Matched route, if any.
    pub policy: Option<&'a RoutePolicy>,
    /// Evaluation instant, seconds since the Unix epoch.
    pub now: i64,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
    jti: String,
    #[serde(skip_serializing_if = "is_blank")]
    sid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    #[serde(skip_serializing_if = "is_empty_list")]
    groups: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

fn is_blank(s: &&str) -> bool {
    s.is_empty()
}

fn is_empty_list(v: &&[String]) -> bool {
    v.is_empty()
}

/// Computes outbound identity headers from one store snapshot.
#[derive(Debug, Clone)]
pub struct HeadersEvaluator {
    signing_key: Arc<SigningKey>,
    issuer: Option<String>,
    claim_headers: BTreeMap<String, String>,
    serverless_service_account: Option<String>,
}

impl HeadersEvaluator {
    /// Build the evaluator. The signing key is mandatory by construction.
    #[must_use]
    pub fn new(
        signing_key: Arc<SigningKey>,
        issuer: Option<String>,
        claim_headers: BTreeMap<String, String>,
        serverless_service_account: Option<String>,
    ) -> Self {
        Self {
            signing_key,
            issuer,
            claim_headers,
            serverless_service_account,
        }
    }

    /// Signing key of this snapshot.
    #[must_use]
    pub fn signing_key(&self) -> &Arc<SigningKey> {
        &self.signing_key
    }

    /// Compute the headers for one request.
    pub fn evaluate(
        &self,
        req: &HeadersRequest<'_>,
        tokens: Option<&dyn IdentityTokenSource>,
    ) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        let assertion = self.signing_key.sign(&self.assertion_claims(req))?;
        headers.insert(HEADER_JWT_ASSERTION.to_string(), vec![assertion]);

        if let Some(claims) = req.claims {
            for (claim, header) in &self.claim_headers {
                let values: Vec<String> = if claim == "user" {
                    claims.user_id().map(str::to_owned).into_iter().collect()
                } else {
                    claims.get(claim).to_vec()
                };
                if !values.is_empty() {
                    headers.insert(header.clone(), vec![values.join(",")]);
                }
            }
        }

        if let Some(token) = self.serverless_token(req.policy, tokens) {
            headers.insert(HEADER_AUTHORIZATION.to_string(), vec![format!("Bearer {token}")]);
        }

        Ok(headers)
    }

    fn assertion_claims<'a>(&'a self, req: &HeadersRequest<'a>) -> AssertionClaims<'a> {
        let aud = req
            .policy
            .and_then(|p| route_hostname(&p.from))
            .unwrap_or(req.http.hostname.as_str());
        let iss = self.issuer.as_deref().unwrap_or(aud);
        let sid = req.session.id.as_str();

        AssertionClaims {
            iss,
            aud,
            iat: req.now,
            exp: req.now + ASSERTION_TTL_SECS,
            jti: assertion_id(sid, aud, req.now),
            sid,
            sub: req.claims.and_then(|c| c.first("sub")),
            user: req.claims.and_then(SessionClaims::user_id),
            email: req.claims.and_then(SessionClaims::email),
            groups: req.claims.map(SessionClaims::groups).unwrap_or_default(),
            name: req.claims.and_then(|c| c.first("name")),
        }
    }

    fn serverless_token(
        &self,
        policy: Option<&RoutePolicy>,
        tokens: Option<&dyn IdentityTokenSource>,
    ) -> Option<String> {
        let policy = policy.filter(|p| p.enable_serverless_authentication)?;
        let audience = policy.upstream_audience()?;
        let account = self.serverless_service_account.as_deref().unwrap_or_default();
        let token = tokens.and_then(|t| t.token(account, &audience));
        if token.is_none() {
            debug!(%audience, "no serverless identity token available");
        }
        token
    }
}

/// Host part of a route's `from` URL.
fn route_hostname(from: &str) -> Option<&str> {
    let rest = from.split_once("://").map_or(from, |(_, r)| r);
    let host = rest.split(['/', ':']).next()?;
    (!host.is_empty()).then_some(host)
}

/// Deterministic assertion id: the same session, audience and instant
/// always yield the same id.
fn assertion_id(sid: &str, aud: &str, iat: i64) -> String {
    let digest = Sha256::digest(format!("{sid}|{aud}|{iat}").as_bytes());
    hex::encode(&digest[..16])
}

/// Relay an inbound assertion to the outbound `-For` header.
///
/// An inbound `X-Pomerium-Jwt-Assertion-For` wins; otherwise an inbound
/// `X-Pomerium-Jwt-Assertion` is relayed. Empty values are ignored.
pub fn carry_over_jwt_assertion(dst: &mut HeaderMap, src: &RequestHttp) {
    let relayed = src
        .header(HEADER_JWT_ASSERTION_FOR)
        .filter(|v| !v.is_empty())
        .or_else(|| src.header(HEADER_JWT_ASSERTION).filter(|v| !v.is_empty()));
    if let Some(value) = relayed {
        dst.entry(HEADER_JWT_ASSERTION_FOR.to_string())
            .or_default()
            .push(value.to_string());
    }
}
