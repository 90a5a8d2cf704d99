//! Per-request authorization evaluation.
//!
//! # Architecture
//!
//! ```text
//! Request
//!   → snapshot (one Arc<Store> for the whole request)
//!   → session claims lookup
//!   ├─ policy unit  : client certificate validation → PolicyEvaluator
//!   └─ header unit  : HeadersEvaluator → assertion carry-over
//!   → merge (allow/deny/traces from policy, headers from header unit)
//! ```
//!
//! Both units run on the blocking pool and share nothing mutable. The first
//! unit to fail cancels its sibling, and only that first error is returned.
//! An externally cancelled token aborts the request with
//! [`Error::Cancelled`].
//!
//! # Modules
//!
//! - [`request`]: inputs and outputs (`Request`, `EvaluationResult`)
//! - [`reason`]: reason codes and `RuleResult`
//! - [`policy`]: per-route `PolicyEvaluator`
//! - [`client_cert`]: `ClientCertificateValidator`
//! - [`headers`]: `HeadersEvaluator` and assertion carry-over
//! - [`signing_key`]: `SigningKey`
//! - [`store`]: `Store` snapshots and `LiveStore`

pub mod client_cert;
pub mod headers;
pub mod policy;
pub mod reason;
pub mod request;
pub mod signing_key;
pub mod store;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use client_cert::{
    ClientCertConstraints, ClientCertificateValidator, SanKind, SanMatcher,
    is_valid_client_certificate,
};
pub use headers::{HeadersEvaluator, HeadersRequest, carry_over_jwt_assertion};
pub use policy::{PolicyEvaluator, PolicyRequest, PolicyResponse};
pub use reason::{Reason, RuleResult};
pub use request::{
    ClientCertificateInfo, EvaluationResult, EvaluationTrace, Request, RequestHttp,
    RequestSession, TraceKind,
};
pub use signing_key::SigningKey;
pub use store::{LiveStore, Store};

use self::headers::HeaderMap;
use crate::config::EvaluatorConfig;
use crate::httputil::{JWT_PATH, WEBAUTHN_PATH};
use crate::rules::RuleEngine;
use crate::session::{IdentityTokenSource, SessionClaims, SessionStore};
use crate::{Error, Result};

/// Source of the evaluation instant.
pub trait Clock: Send + Sync + 'static {
    /// Seconds since the Unix epoch.
    fn now(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        time::OffsetDateTime::now_utc().unix_timestamp()
    }
}

/// Clock pinned to one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now(&self) -> i64 {
        self.0
    }
}

enum PolicyJob {
    Internal,
    RouteNotFound,
    Route(Arc<PolicyEvaluator>),
}

/// The authorization evaluator.
pub struct Evaluator {
    engine: Arc<dyn RuleEngine>,
    live: LiveStore,
    sessions: Arc<dyn SessionStore>,
    tokens: Option<Arc<dyn IdentityTokenSource>>,
    clock: Arc<dyn Clock>,
    reload_lock: Mutex<()>,
}

impl Evaluator {
    /// Build the evaluator and its first snapshot.
    pub fn new(
        config: &EvaluatorConfig,
        engine: Arc<dyn RuleEngine>,
        sessions: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        let store = Store::build(config, engine.as_ref(), None)?;
        Ok(Self {
            engine,
            live: LiveStore::new(store),
            sessions,
            tokens: None,
            clock: Arc::new(SystemClock),
            reload_lock: Mutex::new(()),
        })
    }

    /// Builder: evaluation clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Builder: identity token source for serverless upstreams.
    #[must_use]
    pub fn with_identity_tokens(mut self, tokens: Arc<dyn IdentityTokenSource>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Store> {
        self.live.get()
    }

    /// Rebuild the snapshot from `config` and publish it.
    ///
    /// On failure the live snapshot is left untouched. Returns the new
    /// generation.
    pub fn reload(&self, config: &EvaluatorConfig) -> Result<u64> {
        let _guard = self.reload_lock.lock();
        let current = self.live.get();
        match Store::build(config, self.engine.as_ref(), Some(&current)) {
            Ok(store) => {
                let generation = store.generation();
                let previous = self.live.set(store);
                info!(
                    from = previous.generation(),
                    to = generation,
                    "authorize: snapshot published"
                );
                Ok(generation)
            }
            Err(e) => {
                warn!(error = %e, generation = current.generation(), "authorize: reload rejected, keeping current snapshot");
                Err(e)
            }
        }
    }

    /// Evaluate one request.
    ///
    /// `cancel` is the caller's request-scoped cancellation signal.
    pub async fn evaluate(
        &self,
        req: &Request,
        cancel: &CancellationToken,
    ) -> Result<EvaluationResult> {
        let store = self.live.get();
        let now = self.clock.now();
        let claims: Option<Arc<SessionClaims>> = if req.session.id.is_empty() {
            None
        } else {
            self.sessions.get(&req.session.id).map(Arc::new)
        };

        let job = if req.is_internal {
            PolicyJob::Internal
        } else {
            match &req.policy {
                None => PolicyJob::RouteNotFound,
                Some(policy) => store
                    .policy_evaluator(policy.route_id()?)
                    .map_or(PolicyJob::RouteNotFound, |pe| PolicyJob::Route(Arc::clone(pe))),
            }
        };

        let units = cancel.child_token();
        let req = Arc::new(req.clone());

        let policy_unit: JoinHandle<Result<PolicyResponse>> = {
            let (req, claims, units) = (Arc::clone(&req), claims.clone(), units.clone());
            tokio::task::spawn_blocking(move || {
                evaluate_policy(&job, &req, claims.as_deref(), now, &units)
            })
        };
        let headers_unit: JoinHandle<Result<HeaderMap>> = {
            let (store, req, units) = (Arc::clone(&store), Arc::clone(&req), units.clone());
            let tokens = self.tokens.clone();
            tokio::task::spawn_blocking(move || {
                evaluate_headers(&store, &req, claims.as_deref(), tokens.as_deref(), now, &units)
            })
        };

        let joined = async {
            tokio::try_join!(join_unit(policy_unit, &units), join_unit(headers_unit, &units))
        };
        let (policy, headers) = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                units.cancel();
                return Err(Error::Cancelled);
            }
            res = joined => res?,
        };

        let result = EvaluationResult {
            allow: policy.allow,
            deny: policy.deny,
            headers,
            traces: policy.traces,
        };
        debug!(
            generation = store.generation(),
            host = %req.http.hostname,
            path = %req.http.path,
            allowed = result.is_allowed(),
            allow_reasons = ?result.allow.reasons,
            deny_reasons = ?result.deny.reasons,
            "authorize: decision"
        );
        Ok(result)
    }
}

/// Await a unit; a failure cancels the sibling.
async fn join_unit<T>(handle: JoinHandle<Result<T>>, units: &CancellationToken) -> Result<T> {
    let res = handle
        .await
        .unwrap_or_else(|e| Err(Error::EvaluationFault(format!("evaluation unit failed: {e}"))));
    if res.is_err() {
        units.cancel();
    }
    res
}

fn evaluate_policy(
    job: &PolicyJob,
    req: &Request,
    claims: Option<&SessionClaims>,
    now: i64,
    cancel: &CancellationToken,
) -> Result<PolicyResponse> {
    match job {
        PolicyJob::Internal => {
            let path = req.http.path.as_str();
            let allow = if (path == WEBAUTHN_PATH || path == JWT_PATH) && req.session.id.is_empty()
            {
                RuleResult::new(false, Reason::UserUnauthenticated)
            } else {
                RuleResult::new(true, Reason::PomeriumRoute)
            };
            Ok(PolicyResponse {
                allow,
                ..PolicyResponse::default()
            })
        }
        PolicyJob::RouteNotFound => Ok(PolicyResponse {
            deny: RuleResult::new(true, Reason::RouteNotFound),
            ..PolicyResponse::default()
        }),
        PolicyJob::Route(pe) => {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let is_valid_client_certificate = pe
                .client_certificates()
                .validate(&req.http.client_certificate, now)?;
            pe.evaluate(
                &PolicyRequest {
                    http: &req.http,
                    session: &req.session,
                    claims,
                    is_valid_client_certificate,
                },
                cancel,
            )
        }
    }
}

fn evaluate_headers(
    store: &Store,
    req: &Request,
    claims: Option<&SessionClaims>,
    tokens: Option<&dyn IdentityTokenSource>,
    now: i64,
    cancel: &CancellationToken,
) -> Result<HeaderMap> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let mut headers = store.headers().evaluate(
        &HeadersRequest {
            http: &req.http,
            session: &req.session,
            claims,
            policy: req.policy.as_deref(),
            now,
        },
        tokens,
    )?;
    carry_over_jwt_assertion(&mut headers, &req.http);
    Ok(headers)
}
