//! Rule-engine capability.
//!
//! Route policies carry opaque rule documents. A [`RuleEngine`] compiles each
//! document into a [`Predicate`] when a snapshot is built, and the policy
//! evaluator runs those predicates on every request. The evaluator does not
//! trust the engine: every call goes through [`compile_guarded`] or
//! [`evaluate_guarded`], which turn engine errors *and panics* into typed
//! errors. A faulting engine can fail a request but can never allow it.
//!
//! [`CriteriaEngine`] is the built-in engine.

pub mod criteria;
pub mod glob;

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::evaluator::reason::Reason;
use crate::evaluator::request::{RequestHttp, RequestSession};
use crate::session::SessionClaims;
use crate::{Error, Result};

pub use criteria::CriteriaEngine;

/// Facts a predicate is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct Facts<'a> {
    /// HTTP facts of the request.
    pub http: &'a RequestHttp,
    /// Session reference.
    pub session: &'a RequestSession,
    /// Claims of the resolved session, `None` when unauthenticated.
    pub claims: Option<&'a SessionClaims>,
    /// Outcome of client certificate validation.
    pub is_valid_client_certificate: bool,
}

/// Output of one predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the predicate fired.
    pub value: bool,
    /// Reason codes, in the order the engine produced them.
    pub reasons: Vec<Reason>,
}

impl Verdict {
    /// Verdict with one reason.
    #[must_use]
    pub fn new(value: bool, reason: Reason) -> Self {
        Self {
            value,
            reasons: vec![reason],
        }
    }
}

/// Errors reported by a rule engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The rule document could not be compiled.
    #[error("malformed rule: {0}")]
    Malformed(String),

    /// The rule failed at evaluation time.
    #[error("rule runtime error: {0}")]
    Runtime(String),
}

/// A compiled rule.
///
/// Implementations must be pure: identical facts yield identical verdicts.
pub trait Predicate: Send + Sync + fmt::Debug {
    /// Evaluate against the request facts.
    fn evaluate(&self, facts: &Facts<'_>) -> std::result::Result<Verdict, EngineError>;
}

/// Compiles rule documents into predicates.
pub trait RuleEngine: Send + Sync + 'static {
    /// Engine name, used in logs.
    fn name(&self) -> &'static str;

    /// Compile one rule document.
    fn compile(
        &self,
        rule: &serde_json::Value,
    ) -> std::result::Result<Arc<dyn Predicate>, EngineError>;
}

/// Compile through the fault boundary. Failures reject the reload.
pub fn compile_guarded(
    engine: &dyn RuleEngine,
    rule: &serde_json::Value,
) -> Result<Arc<dyn Predicate>> {
    match catch_unwind(AssertUnwindSafe(|| engine.compile(rule))) {
        Ok(Ok(predicate)) => Ok(predicate),
        Ok(Err(e)) => Err(Error::Config(format!("{}: {e}", engine.name()))),
        Err(payload) => Err(Error::Config(format!(
            "{}: rule compilation panicked: {}",
            engine.name(),
            panic_message(payload.as_ref())
        ))),
    }
}

/// Evaluate through the fault boundary. Failures abort the request.
pub fn evaluate_guarded(predicate: &dyn Predicate, facts: &Facts<'_>) -> Result<Verdict> {
    match catch_unwind(AssertUnwindSafe(|| predicate.evaluate(facts))) {
        Ok(Ok(verdict)) => Ok(verdict),
        Ok(Err(e)) => Err(Error::EvaluationFault(e.to_string())),
        Err(payload) => Err(Error::EvaluationFault(format!(
            "rule engine panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}


#[cfg(test)]
mod tests {
    use super::testing::Faulty;
    use super::*;

    fn facts<'a>(http: &'a RequestHttp, session: &'a RequestSession) -> Facts<'a> {
        Facts {
            http,
            session,
            claims: None,
            is_valid_client_certificate: false,
        }
    }

    #[test]
    fn engine_panic_becomes_evaluation_fault() {
        let (http, session) = (RequestHttp::default(), RequestSession::default());
        let err = evaluate_guarded(&Faulty::Panics, &facts(&http, &session)).unwrap_err();
        assert!(matches!(err, Error::EvaluationFault(ref m) if m.contains("engine exploded")));
    }

    #[test]
    fn engine_error_becomes_evaluation_fault() {
        let (http, session) = (RequestHttp::default(), RequestSession::default());
        let err = evaluate_guarded(&Faulty::Errors, &facts(&http, &session)).unwrap_err();
        assert!(matches!(err, Error::EvaluationFault(ref m) if m.contains("division by zero")));
    }

    #[test]
    fn malformed_rule_is_a_config_error() {
        let engine = CriteriaEngine::new();
        let err = compile_guarded(&engine, &serde_json::json!(42)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
