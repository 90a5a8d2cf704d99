//! Built-in criteria engine.
//!
//! Compiles route rule documents into an efficient runtime structure once per
//! snapshot. A rule has up to three criterion lists:
//!
//! ```yaml
//! allow:
//!   - or:
//!       - email: "*@example.com"
//!       - groups: { has: admins }
//!     not:
//!       - http_method: [DELETE]
//! deny:
//!   - and:
//!       - http_path: "/admin/*"
//!       - reject: true
//! ```
//!
//! # Rule semantics
//!
//! A rule fires when **every** `and` criterion holds, **at least one** `or`
//! criterion holds (if any are listed), and **no** `not` criterion holds.
//! Every criterion is evaluated, even after the outcome is known, so traces
//! and reasons do not depend on list order tricks.
//!
//! Identity criteria (`user`, `email`, `domain`, `groups`, `claim`,
//! `authenticated_user`) fail with `user-unauthenticated` when the request
//! has no resolved session.

use std::sync::Arc;

use serde::Deserialize;

use super::glob::{CompiledMatcher, StringMatcher};
use super::{EngineError, Facts, Predicate, RuleEngine, Verdict};
use crate::evaluator::reason::Reason;
use crate::session::SessionClaims;

/// The built-in rule engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct CriteriaEngine;

impl CriteriaEngine {
    /// Create the engine.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl RuleEngine for CriteriaEngine {
    fn name(&self) -> &'static str {
        "criteria"
    }

    fn compile(
        &self,
        rule: &serde_json::Value,
    ) -> std::result::Result<Arc<dyn Predicate>, EngineError> {
        let def: RuleDef = serde_json::from_value(rule.clone())
            .map_err(|e| EngineError::Malformed(e.to_string()))?;
        Ok(Arc::new(CompiledRule::from_def(def)?))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rule documents
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RuleDef {
    and: Vec<CriterionDef>,
    or: Vec<CriterionDef>,
    not: Vec<CriterionDef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
enum CriterionDef {
    Accept(bool),
    Reject(bool),
    AuthenticatedUser(bool),
    InvalidClientCertificate(bool),
    User(StringMatcher),
    Email(StringMatcher),
    Domain(StringMatcher),
    Groups(GroupsDef),
    Claim(ClaimDef),
    HttpMethod(Vec<String>),
    HttpPath(StringMatcher),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GroupsDef {
    has: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClaimDef {
    name: String,
    value: StringMatcher,
}

// ─────────────────────────────────────────────────────────────────────────────
// Compiled rule
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct CompiledRule {
    and: Vec<Criterion>,
    or: Vec<Criterion>,
    not: Vec<Criterion>,
}

impl CompiledRule {
    fn from_def(def: RuleDef) -> std::result::Result<Self, EngineError> {
        if def.and.is_empty() && def.or.is_empty() && def.not.is_empty() {
            return Err(EngineError::Malformed(
                "rule has no criteria (expected and/or/not)".to_string(),
            ));
        }
        let compile_all = |defs: Vec<CriterionDef>| {
            defs.into_iter()
                .map(Criterion::from_def)
                .collect::<std::result::Result<Vec<_>, _>>()
        };
        Ok(Self {
            and: compile_all(def.and)?,
            or: compile_all(def.or)?,
            not: compile_all(def.not)?,
        })
    }
}

impl Predicate for CompiledRule {
    fn evaluate(&self, facts: &Facts<'_>) -> std::result::Result<Verdict, EngineError> {
        let and: Vec<Verdict> = self.and.iter().map(|c| c.evaluate(facts)).collect();
        let or: Vec<Verdict> = self.or.iter().map(|c| c.evaluate(facts)).collect();
        let not: Vec<Verdict> = self.not.iter().map(|c| c.evaluate(facts)).collect();

        let and_ok = and.iter().all(|v| v.value);
        let or_ok = or.is_empty() || or.iter().any(|v| v.value);
        let not_ok = not.iter().all(|v| !v.value);
        let value = and_ok && or_ok && not_ok;

        let mut reasons = Vec::new();
        if value {
            // Everything that supported the outcome.
            collect(&mut reasons, and.iter());
            collect(&mut reasons, or.iter().filter(|v| v.value));
            collect(&mut reasons, not.iter());
        } else {
            // Only what blocked it.
            collect(&mut reasons, and.iter().filter(|v| !v.value));
            if !or_ok {
                collect(&mut reasons, or.iter());
            }
            collect(&mut reasons, not.iter().filter(|v| v.value));
        }

        Ok(Verdict { value, reasons })
    }
}

fn collect<'a>(out: &mut Vec<Reason>, verdicts: impl Iterator<Item = &'a Verdict>) {
    for r in verdicts.flat_map(|v| v.reasons.iter()) {
        if !out.contains(r) {
            out.push(r.clone());
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Compiled criteria
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Criterion {
    Accept,
    Reject,
    AuthenticatedUser,
    InvalidClientCertificate,
    User(CompiledMatcher),
    Email(CompiledMatcher),
    Domain(CompiledMatcher),
    Groups(String),
    Claim { name: String, value: CompiledMatcher },
    HttpMethod(Vec<String>),
    HttpPath(CompiledMatcher),
}

impl Criterion {
    fn from_def(def: CriterionDef) -> std::result::Result<Self, EngineError> {
        let matcher = |m: &StringMatcher, what: &str| {
            CompiledMatcher::compile(m).map_err(|e| EngineError::Malformed(format!("{what}: {e}")))
        };
        let flag = |set: bool, what: &str| {
            if set {
                Ok(())
            } else {
                Err(EngineError::Malformed(format!("{what} only accepts `true`")))
            }
        };

        Ok(match def {
            CriterionDef::Accept(b) => flag(b, "accept").map(|()| Self::Accept)?,
            CriterionDef::Reject(b) => flag(b, "reject").map(|()| Self::Reject)?,
            CriterionDef::AuthenticatedUser(b) => {
                flag(b, "authenticated_user").map(|()| Self::AuthenticatedUser)?
            }
            CriterionDef::InvalidClientCertificate(b) => {
                flag(b, "invalid_client_certificate").map(|()| Self::InvalidClientCertificate)?
            }
            CriterionDef::User(m) => Self::User(matcher(&m, "user")?),
            CriterionDef::Email(m) => Self::Email(matcher(&m, "email")?),
            CriterionDef::Domain(m) => Self::Domain(matcher(&m, "domain")?),
            CriterionDef::Groups(g) => Self::Groups(g.has),
            CriterionDef::Claim(c) => Self::Claim {
                value: matcher(&c.value, "claim")?,
                name: c.name,
            },
            CriterionDef::HttpMethod(methods) => {
                if methods.is_empty() {
                    return Err(EngineError::Malformed(
                        "http_method needs at least one method".to_string(),
                    ));
                }
                Self::HttpMethod(methods.iter().map(|m| m.to_ascii_uppercase()).collect())
            }
            CriterionDef::HttpPath(m) => Self::HttpPath(matcher(&m, "http_path")?),
        })
    }

    fn evaluate(&self, facts: &Facts<'_>) -> Verdict {
        match self {
            Self::Accept => Verdict::new(true, Reason::Accept),
            Self::Reject => Verdict::new(false, Reason::Reject),
            Self::AuthenticatedUser => match facts.claims {
                Some(_) => Verdict::new(true, Reason::UserOk),
                None => Verdict::new(false, Reason::UserUnauthenticated),
            },
            Self::InvalidClientCertificate => {
                if facts.is_valid_client_certificate {
                    Verdict::new(false, Reason::ValidClientCertificate)
                } else {
                    Verdict::new(true, Reason::InvalidClientCertificate)
                }
            }
            Self::User(m) => identity(facts, Reason::UserOk, Reason::UserUnauthorized, |c| {
                c.user_id().is_some_and(|u| m.matches(u))
            }),
            Self::Email(m) => identity(facts, Reason::EmailOk, Reason::EmailUnauthorized, |c| {
                c.email().is_some_and(|e| m.matches(e))
            }),
            Self::Domain(m) => identity(facts, Reason::DomainOk, Reason::DomainUnauthorized, |c| {
                c.email()
                    .and_then(|e| e.rsplit_once('@'))
                    .is_some_and(|(_, d)| m.matches(d))
            }),
            Self::Groups(g) => identity(facts, Reason::GroupsOk, Reason::GroupsUnauthorized, |c| {
                c.groups().iter().any(|have| have == g)
            }),
            Self::Claim { name, value } => {
                identity(facts, Reason::ClaimOk, Reason::ClaimUnauthorized, |c| {
                    c.get(name).iter().any(|v| value.matches(v))
                })
            }
            Self::HttpMethod(methods) => {
                if methods.iter().any(|m| m.eq_ignore_ascii_case(&facts.http.method)) {
                    Verdict::new(true, Reason::HttpMethodOk)
                } else {
                    Verdict::new(false, Reason::HttpMethodUnauthorized)
                }
            }
            Self::HttpPath(m) => {
                if m.matches(&facts.http.path) {
                    Verdict::new(true, Reason::HttpPathOk)
                } else {
                    Verdict::new(false, Reason::HttpPathUnauthorized)
                }
            }
        }
    }
}

/// Evaluate an identity criterion; unauthenticated requests never match.
fn identity(
    facts: &Facts<'_>,
    ok: Reason,
    unauthorized: Reason,
    check: impl FnOnce(&SessionClaims) -> bool,
) -> Verdict {
    match facts.claims {
        None => Verdict::new(false, Reason::UserUnauthenticated),
        Some(c) if check(c) => Verdict::new(true, ok),
        Some(_) => Verdict::new(false, unauthorized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::request::{RequestHttp, RequestSession};
    use serde_json::json;

    fn compile(rule: serde_json::Value) -> Arc<dyn Predicate> {
        CriteriaEngine::new().compile(&rule).unwrap()
    }

    fn http(method: &str, path: &str) -> RequestHttp {
        RequestHttp {
            method: method.to_string(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    fn eval(
        p: &Arc<dyn Predicate>,
        http: &RequestHttp,
        claims: Option<&SessionClaims>,
        valid_cert: bool,
    ) -> Verdict {
        let session = RequestSession::default();
        p.evaluate(&Facts {
            http,
            session: &session,
            claims,
            is_valid_client_certificate: valid_cert,
        })
        .unwrap()
    }

    fn alice() -> SessionClaims {
        SessionClaims::new()
            .with("sub", ["alice"])
            .with("email", ["alice@example.com"])
            .with("groups", ["admins"])
            .with("department", ["eng", "security"])
    }

    #[test]
    fn accept_fires_unconditionally() {
        let p = compile(json!({"and": [{"accept": true}]}));
        let v = eval(&p, &http("GET", "/"), None, false);
        assert_eq!(v, Verdict::new(true, Reason::Accept));
    }

    #[test]
    fn email_without_session_is_unauthenticated() {
        let p = compile(json!({"or": [{"email": "alice@example.com"}]}));
        let v = eval(&p, &http("GET", "/"), None, true);
        assert!(!v.value);
        assert_eq!(v.reasons, vec![Reason::UserUnauthenticated]);
    }

    #[test]
    fn email_mismatch_is_unauthorized() {
        let p = compile(json!({"or": [{"email": "bob@example.com"}]}));
        let claims = alice();
        let v = eval(&p, &http("GET", "/"), Some(&claims), true);
        assert_eq!(v, Verdict::new(false, Reason::EmailUnauthorized));
    }

    #[test]
    fn or_fires_on_any_match_and_reports_only_matches() {
        // GIVEN: domain fails, group matches
        let p = compile(json!({"or": [
            {"domain": "corp.io"},
            {"groups": {"has": "admins"}}
        ]}));
        let claims = alice();
        let v = eval(&p, &http("GET", "/"), Some(&claims), true);
        assert!(v.value);
        assert_eq!(v.reasons, vec![Reason::GroupsOk]);
    }

    #[test]
    fn and_requires_all_and_reports_failures() {
        let p = compile(json!({"and": [
            {"http_method": ["get", "head"]},
            {"http_path": "/admin/*"}
        ]}));
        let v = eval(&p, &http("GET", "/public"), None, true);
        assert!(!v.value);
        assert_eq!(v.reasons, vec![Reason::HttpPathUnauthorized]);

        let v = eval(&p, &http("HEAD", "/admin/users"), None, true);
        assert!(v.value);
        assert_eq!(v.reasons, vec![Reason::HttpMethodOk, Reason::HttpPathOk]);
    }

    #[test]
    fn not_blocks_when_any_listed_criterion_holds() {
        let p = compile(json!({
            "and": [{"authenticated_user": true}],
            "not": [{"http_method": ["DELETE"]}]
        }));
        let claims = alice();
        assert!(eval(&p, &http("GET", "/"), Some(&claims), true).value);
        let v = eval(&p, &http("DELETE", "/"), Some(&claims), true);
        assert!(!v.value);
        assert_eq!(v.reasons, vec![Reason::HttpMethodOk]);
    }

    #[test]
    fn domain_matches_part_after_last_at() {
        let p = compile(json!({"and": [{"domain": {"is": "example.com"}}]}));
        let claims = alice();
        assert!(eval(&p, &http("GET", "/"), Some(&claims), true).value);
    }

    #[test]
    fn claim_matches_any_value() {
        let p = compile(json!({"and": [{"claim": {"name": "department", "value": "sec*"}}]}));
        let claims = alice();
        let v = eval(&p, &http("GET", "/"), Some(&claims), true);
        assert_eq!(v, Verdict::new(true, Reason::ClaimOk));
    }

    #[test]
    fn invalid_client_certificate_criterion_tracks_fact() {
        let p = compile(json!({"and": [{"invalid_client_certificate": true}]}));
        assert_eq!(
            eval(&p, &http("GET", "/"), None, false),
            Verdict::new(true, Reason::InvalidClientCertificate)
        );
        assert_eq!(
            eval(&p, &http("GET", "/"), None, true),
            Verdict::new(false, Reason::ValidClientCertificate)
        );
    }

    #[test]
    fn evaluation_is_deterministic() {
        let p = compile(json!({"or": [{"email": "*@example.com"}, {"user": "bob"}]}));
        let claims = alice();
        let a = eval(&p, &http("GET", "/"), Some(&claims), true);
        let b = eval(&p, &http("GET", "/"), Some(&claims), true);
        assert_eq!(a, b);
    }

    #[test]
    fn malformed_rules_are_rejected() {
        let engine = CriteriaEngine::new();
        for bad in [
            json!({}),
            json!({"and": [{"accept": false}]}),
            json!({"and": [{"http_method": []}]}),
            json!({"and": [{"no_such_criterion": true}]}),
            json!({"allow": []}),
            json!({"and": [{"email": {}}]}),
        ] {
            assert!(
                matches!(engine.compile(&bad), Err(EngineError::Malformed(_))),
                "expected malformed: {bad}"
            );
        }
    }
}
