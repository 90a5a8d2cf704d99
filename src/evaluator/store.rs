//! Immutable evaluation snapshots.
//!
//! A [`Store`] is built wholesale from one [`EvaluatorConfig`] and never
//! mutated afterwards. [`LiveStore`] publishes the current snapshot; readers
//! clone the `Arc` once per request and keep using it even if a reload
//! swaps in a newer one mid-request.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{info, warn};

use super::client_cert::ClientCertificateValidator;
use super::headers::HeadersEvaluator;
use super::policy::PolicyEvaluator;
use super::signing_key::SigningKey;
use crate::config::EvaluatorConfig;
use crate::rules::RuleEngine;
use crate::x509::{RevocationList, TrustAnchors};
use crate::{Error, Result};

static GENERATION: AtomicU64 = AtomicU64::new(1);

/// One consistent view of configuration-derived evaluation state.
#[derive(Debug)]
pub struct Store {
    generation: u64,
    policies: HashMap<u64, Arc<PolicyEvaluator>>,
    headers: HeadersEvaluator,
}

impl Store {
    /// Build a snapshot.
    ///
    /// Without configured key material the signing key of `previous` is
    /// reused, and a fresh key is generated only when there is no previous
    /// snapshot. Any failure leaves nothing half-built.
    pub fn build(
        config: &EvaluatorConfig,
        engine: &dyn RuleEngine,
        previous: Option<&Store>,
    ) -> Result<Self> {
        let signing_key = match (config.signing_key.as_deref(), previous) {
            (Some(material), _) if !material.trim().is_empty() => {
                Arc::new(SigningKey::from_config(material)?)
            }
            (_, Some(prev)) => Arc::clone(prev.signing_key()),
            _ => Arc::new(SigningKey::generate()?),
        };

        let anchors = TrustAnchors::from_bundle(&config.client_ca_bytes()?)
            .map_err(|e| Error::Config(format!("client_ca: {e}")))?;
        let crl = RevocationList::from_bundle(&config.client_crl_bytes()?)
            .map_err(|e| Error::Config(format!("client_crl: {e}")))?;
        let client_certificates =
            ClientCertificateValidator::new(anchors, crl, &config.client_cert_constraints)?;

        let headers = HeadersEvaluator::new(
            Arc::clone(&signing_key),
            config.issuer()?,
            config.jwt_claim_headers.clone(),
            config.serverless_service_account.clone(),
        );

        let mut policies = HashMap::with_capacity(config.policies.len());
        for policy in &config.policies {
            let policy = Arc::new(policy.clone());
            let validator = match policy.client_ca()? {
                Some(ca) => client_certificates.with_anchors(TrustAnchors::from_bundle(&ca).map_err(
                    |e| Error::Config(format!("route {}: tls_downstream_client_ca: {e}", policy.from)),
                )?),
                None => client_certificates.clone(),
            };
            let add_default_rule = config
                .add_default_client_certificate_rule
                .unwrap_or_else(|| validator.has_anchors());

            let evaluator =
                PolicyEvaluator::new(Arc::clone(&policy), engine, add_default_rule, validator)?;
            let id = evaluator.route_id();
            if policies.insert(id, Arc::new(evaluator)).is_some() {
                warn!(route = %policy.from, route_id = id, "duplicate route id, later policy wins");
            }
        }

        let generation = GENERATION.fetch_add(1, Ordering::Relaxed);
        info!(
            generation,
            routes = policies.len(),
            algorithm = ?signing_key.algorithm(),
            key_id = %signing_key.key_id(),
            engine = engine.name(),
            "authorize: snapshot built"
        );

        Ok(Self {
            generation,
            policies,
            headers,
        })
    }

    /// Monotonic snapshot generation, unique per process.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Evaluator registered for `route_id`.
    #[must_use]
    pub fn policy_evaluator(&self, route_id: u64) -> Option<&Arc<PolicyEvaluator>> {
        self.policies.get(&route_id)
    }

    /// Registered route ids, sorted.
    #[must_use]
    pub fn route_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.policies.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Header evaluator.
    #[must_use]
    pub fn headers(&self) -> &HeadersEvaluator {
        &self.headers
    }

    /// Signing key of this snapshot.
    #[must_use]
    pub fn signing_key(&self) -> &Arc<SigningKey> {
        self.headers.signing_key()
    }
}

/// Atomically swappable snapshot holder.
///
/// Readers take a read-lock just long enough to clone the inner `Arc`;
/// writers replace the whole `Arc`.
#[derive(Debug)]
pub struct LiveStore {
    inner: RwLock<Arc<Store>>,
}

impl LiveStore {
    /// Seed with the startup snapshot.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            inner: RwLock::new(Arc::new(store)),
        }
    }

    /// Current snapshot.
    #[must_use]
    pub fn get(&self) -> Arc<Store> {
        Arc::clone(&self.inner.read())
    }

    /// Publish `store`, returning the replaced snapshot.
    pub fn set(&self, store: Store) -> Arc<Store> {
        std::mem::replace(&mut *self.inner.write(), Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::RoutePolicy;
    use crate::rules::CriteriaEngine;
    use crate::x509::generate::{CaParams, CertGenerator};
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde_json::json;

    fn route(from: &str) -> RoutePolicy {
        RoutePolicy {
            from: from.into(),
            to: vec!["http://upstream.internal".into()],
            allow: vec![json!({"and": [{"accept": true}]})],
            ..Default::default()
        }
    }

    #[test]
    fn routes_are_keyed_by_route_id() {
        let config = EvaluatorConfig::default()
            .with_policy(route("https://a.example.com"))
            .with_policy(route("https://b.example.com"));
        let store = Store::build(&config, &CriteriaEngine::new(), None).unwrap();
        for p in &config.policies {
            assert!(store.policy_evaluator(p.route_id().unwrap()).is_some());
        }
        assert_eq!(store.route_ids().len(), 2);
    }

    #[test]
    fn signing_key_is_reused_when_not_configured() {
        // GIVEN: a first snapshot with a generated key
        let engine = CriteriaEngine::new();
        let first = Store::build(&EvaluatorConfig::default(), &engine, None).unwrap();
        // WHEN: rebuilding without key material
        let second = Store::build(&EvaluatorConfig::default(), &engine, Some(&first)).unwrap();
        // THEN: same key, newer generation
        assert_eq!(first.signing_key().key_id(), second.signing_key().key_id());
        assert!(second.generation() > first.generation());
    }

    #[test]
    fn configured_key_replaces_previous() {
        let engine = CriteriaEngine::new();
        let first = Store::build(&EvaluatorConfig::default(), &engine, None).unwrap();
        let pem = crate::evaluator::signing_key::generate_pem().unwrap();
        let second = Store::build(
            &EvaluatorConfig::default().with_signing_key(pem),
            &engine,
            Some(&first),
        )
        .unwrap();
        assert_ne!(first.signing_key().key_id(), second.signing_key().key_id());
    }

    #[test]
    fn bad_material_fails_the_build() {
        let engine = CriteriaEngine::new();
        for config in [
            EvaluatorConfig::default().with_signing_key("garbage"),
            EvaluatorConfig::default().with_client_ca("-----BEGIN CERTIFICATE-----\n%%\n-----END CERTIFICATE-----\n"),
            EvaluatorConfig::default().with_client_crl("bm90IGEgY3Js"),
        ] {
            assert!(matches!(
                Store::build(&config, &engine, None),
                Err(Error::Config(_))
            ));
        }
    }

    #[test]
    fn route_ca_enables_default_rule_for_that_route_only() {
        // GIVEN: one route with its own CA, one without
        let ca = CertGenerator::init_ca(&CaParams {
            cn: "Route CA",
            validity_days: 30,
        })
        .unwrap();
        let mut with_ca = route("https://mtls.example.com");
        with_ca.tls_downstream_client_ca = Some(STANDARD.encode(&ca.cert_pem));
        let without = route("https://open.example.com");
        let config = EvaluatorConfig::default()
            .with_policy(with_ca.clone())
            .with_policy(without.clone());
        // WHEN: building
        let store = Store::build(&config, &CriteriaEngine::new(), None).unwrap();
        // THEN: only the mTLS route carries a CA
        let mtls = store.policy_evaluator(with_ca.route_id().unwrap()).unwrap();
        let open = store.policy_evaluator(without.route_id().unwrap()).unwrap();
        assert!(mtls.client_certificates().has_anchors());
        assert!(!open.client_certificates().has_anchors());
    }

    #[test]
    fn live_store_swap_returns_previous_snapshot() {
        let engine = CriteriaEngine::new();
        let live = LiveStore::new(Store::build(&EvaluatorConfig::default(), &engine, None).unwrap());
        let before = live.get();
        let next = Store::build(&EvaluatorConfig::default(), &engine, Some(&before)).unwrap();
        let old = live.set(next);
        assert_eq!(old.generation(), before.generation());
        assert_ne!(live.get().generation(), before.generation());
    }
}
