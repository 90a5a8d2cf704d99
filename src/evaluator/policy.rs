//! Per-route policy evaluation.
//!
//! A [`PolicyEvaluator`] is compiled once per route when a snapshot is built
//! and shared read-only by every request on that route.
//!
//! # Decision model
//!
//! Deny and allow rules are independent predicate sets. The deny result
//! fires when any deny predicate fires; the allow result fires when any allow
//! predicate fires. The caller combines them with deny precedence.
//!
//! When enabled, the built-in client certificate rule is the first deny
//! predicate. Because deny always wins, no allow rule can re-admit a request
//! it rejects; it can only be switched off in configuration.
//!
//! Every predicate is evaluated (no short-circuit) so that traces list the
//! whole rule set in a stable order.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::client_cert::ClientCertificateValidator;
use super::reason::{Reason, RuleResult};
use super::request::{EvaluationTrace, RequestHttp, RequestSession, TraceKind};
use crate::route::RoutePolicy;
use crate::rules::{
    EngineError, Facts, Predicate, RuleEngine, Verdict, compile_guarded, evaluate_guarded,
};
use crate::session::SessionClaims;
use crate::{Error, Result};

/// Trace id of the built-in client certificate rule.
pub const DEFAULT_CLIENT_CERTIFICATE_RULE: &str = "default-client-certificate";

/// Denies requests without a valid client certificate.
#[derive(Debug)]
struct InvalidClientCertificateRule;

impl Predicate for InvalidClientCertificateRule {
    fn evaluate(&self, facts: &Facts<'_>) -> std::result::Result<Verdict, EngineError> {
        Ok(if facts.is_valid_client_certificate {
            Verdict::new(false, Reason::ValidClientCertificate)
        } else {
            Verdict::new(true, Reason::InvalidClientCertificate)
        })
    }
}

struct LabeledPredicate {
    id: String,
    predicate: Arc<dyn Predicate>,
}

/// Inputs of one policy evaluation.
#[derive(Debug, Clone, Copy)]
pub struct PolicyRequest<'a> {
    /// HTTP facts.
    pub http: &'a RequestHttp,
    /// Session reference.
    pub session: &'a RequestSession,
    /// Resolved claims, `None` when unauthenticated.
    pub claims: Option<&'a SessionClaims>,
    /// Outcome of client certificate validation.
    pub is_valid_client_certificate: bool,
}

/// Output of one policy evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyResponse {
    /// Allow rule set verdict.
    pub allow: RuleResult,
    /// Deny rule set verdict.
    pub deny: RuleResult,
    /// One trace per evaluated predicate.
    pub traces: Vec<EvaluationTrace>,
}

/// Compiled rules of one route.
pub struct PolicyEvaluator {
    route_id: u64,
    policy: Arc<RoutePolicy>,
    deny: Vec<LabeledPredicate>,
    allow: Vec<LabeledPredicate>,
    client_certificates: ClientCertificateValidator,
}

impl PolicyEvaluator {
    /// Compile `policy` with `engine`.
    ///
    /// `client_certificates` is the validator for this route (global CA or
    /// the route's override).
    pub fn new(
        policy: Arc<RoutePolicy>,
        engine: &dyn RuleEngine,
        add_default_client_certificate_rule: bool,
        client_certificates: ClientCertificateValidator,
    ) -> Result<Self> {
        let route_id = policy.route_id()?;

        let mut deny = Vec::with_capacity(policy.deny.len() + 1);
        if add_default_client_certificate_rule {
            deny.push(LabeledPredicate {
                id: DEFAULT_CLIENT_CERTIFICATE_RULE.to_string(),
                predicate: Arc::new(InvalidClientCertificateRule),
            });
        }
        for (i, rule) in policy.deny.iter().enumerate() {
            deny.push(LabeledPredicate {
                id: format!("deny[{i}]"),
                predicate: compile(engine, &policy, rule, "deny", i)?,
            });
        }
        let allow = policy
            .allow
            .iter()
            .enumerate()
            .map(|(i, rule)| {
                Ok(LabeledPredicate {
                    id: format!("allow[{i}]"),
                    predicate: compile(engine, &policy, rule, "allow", i)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            route_id,
            policy,
            deny,
            allow,
            client_certificates,
        })
    }

    /// Route id this evaluator is registered under.
    #[must_use]
    pub fn route_id(&self) -> u64 {
        self.route_id
    }

    /// Route configuration.
    #[must_use]
    pub fn policy(&self) -> &Arc<RoutePolicy> {
        &self.policy
    }

    /// Client certificate validator for this route.
    #[must_use]
    pub fn client_certificates(&self) -> &ClientCertificateValidator {
        &self.client_certificates
    }

    /// Evaluate deny then allow rules.
    ///
    /// Cancellation is observed between predicates. Engine failures abort
    /// with [`Error::EvaluationFault`].
    pub fn evaluate(
        &self,
        req: &PolicyRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<PolicyResponse> {
        let facts = Facts {
            http: req.http,
            session: req.session,
            claims: req.claims,
            is_valid_client_certificate: req.is_valid_client_certificate,
        };
        let mut traces = Vec::with_capacity(self.deny.len() + self.allow.len());

        let deny = run(&self.deny, TraceKind::Deny, &facts, cancel, &mut traces)?;
        let allow = run(&self.allow, TraceKind::Allow, &facts, cancel, &mut traces)?;

        let deny_fired = deny.iter().any(|v| v.value);
        let deny = RuleResult::with_reasons(
            deny_fired,
            deny.into_iter()
                .filter(|v| v.value)
                .flat_map(|v| v.reasons),
        );

        let allow_fired = allow.iter().any(|v| v.value);
        let allow = RuleResult::with_reasons(
            allow_fired,
            allow
                .into_iter()
                .filter(|v| v.value == allow_fired)
                .flat_map(|v| v.reasons),
        );

        Ok(PolicyResponse {
            allow,
            deny,
            traces,
        })
    }
}

fn compile(
    engine: &dyn RuleEngine,
    policy: &RoutePolicy,
    rule: &serde_json::Value,
    kind: &str,
    index: usize,
) -> Result<Arc<dyn Predicate>> {
    compile_guarded(engine, rule).map_err(|e| match e {
        Error::Config(msg) => Error::Config(format!("route {} {kind}[{index}]: {msg}", policy.from)),
        other => other,
    })
}

fn run(
    predicates: &[LabeledPredicate],
    kind: TraceKind,
    facts: &Facts<'_>,
    cancel: &CancellationToken,
    traces: &mut Vec<EvaluationTrace>,
) -> Result<Vec<Verdict>> {
    let mut verdicts = Vec::with_capacity(predicates.len());
    for p in predicates {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let verdict = evaluate_guarded(p.predicate.as_ref(), facts)
            .map_err(|e| match e {
                Error::EvaluationFault(msg) => Error::EvaluationFault(format!("{}: {msg}", p.id)),
                other => other,
            })?;
        traces.push(EvaluationTrace {
            id: p.id.clone(),
            kind,
            value: verdict.value,
            reasons: verdict.reasons.clone(),
        });
        verdicts.push(verdict);
    }
    Ok(verdicts)
}

impl fmt::Debug for PolicyEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyEvaluator")
            .field("route_id", &self.route_id)
            .field("from", &self.policy.from)
            .field("deny", &self.deny.len())
            .field("allow", &self.allow.len())
            .finish_non_exhaustive()
    }
}
