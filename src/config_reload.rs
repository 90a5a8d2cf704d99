//! Config hot-reload.
//!
//! Watches the configuration file, computes a structural diff against the
//! configuration the live snapshot was built from, and asks the
//! [`Evaluator`] to publish a new snapshot when anything changed. A file that
//! fails to parse, or a configuration the evaluator rejects, leaves the live
//! snapshot in place.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::EvaluatorConfig;
use crate::evaluator::Evaluator;
use crate::route::RoutePolicy;

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Structural diff between two [`EvaluatorConfig`]s.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigPatch {
    /// `from` of routes whose id is new.
    pub routes_added: Vec<String>,
    /// `from` of routes whose id disappeared.
    pub routes_removed: Vec<String>,
    /// `from` of routes whose id is kept but whose rules or CA changed.
    pub routes_modified: Vec<String>,
    /// Global client CA or CRL changed.
    pub client_certificates_changed: bool,
    /// Signing key material changed.
    pub signing_key_changed: bool,
    /// Issuer, claim headers or serverless account changed.
    pub headers_changed: bool,
}

impl ConfigPatch {
    /// No changes detected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes_added.is_empty()
            && self.routes_removed.is_empty()
            && self.routes_modified.is_empty()
            && !self.client_certificates_changed
            && !self.signing_key_changed
            && !self.headers_changed
    }

    /// One-line summary for logs.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        for (label, routes) in [
            ("added routes", &self.routes_added),
            ("removed routes", &self.routes_removed),
            ("modified routes", &self.routes_modified),
        ] {
            if !routes.is_empty() {
                parts.push(format!("{label}: [{}]", routes.join(", ")));
            }
        }
        if self.client_certificates_changed {
            parts.push("client CA/CRL changed".to_string());
        }
        if self.signing_key_changed {
            parts.push("signing key changed".to_string());
        }
        if self.headers_changed {
            parts.push("header settings changed".to_string());
        }
        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// Compute the diff between two configurations. Routes are matched by route
/// id, so editing a route's `from` or `to` shows up as remove + add.
#[must_use]
pub fn compute_diff(old: &EvaluatorConfig, new: &EvaluatorConfig) -> ConfigPatch {
    let old_routes = routes_by_id(&old.policies);
    let new_routes = routes_by_id(&new.policies);

    let mut patch = ConfigPatch::default();
    for (id, route) in &new_routes {
        match old_routes.get(id) {
            None => patch.routes_added.push(route.from.clone()),
            Some(prev) if prev != route => patch.routes_modified.push(route.from.clone()),
            Some(_) => {}
        }
    }
    let kept: BTreeSet<&u64> = new_routes.keys().collect();
    patch.routes_removed = old_routes
        .iter()
        .filter(|(id, _)| !kept.contains(id))
        .map(|(_, r)| r.from.clone())
        .collect();

    patch.client_certificates_changed = old.client_ca != new.client_ca
        || old.client_crl != new.client_crl
        || old.client_cert_constraints != new.client_cert_constraints
        || old.add_default_client_certificate_rule != new.add_default_client_certificate_rule;
    patch.signing_key_changed = old.signing_key != new.signing_key;
    patch.headers_changed = old.authenticate_url != new.authenticate_url
        || old.jwt_claim_headers != new.jwt_claim_headers
        || old.serverless_service_account != new.serverless_service_account;
    patch
}

fn routes_by_id(policies: &[RoutePolicy]) -> BTreeMap<u64, &RoutePolicy> {
    policies
        .iter()
        .filter_map(|p| p.route_id().ok().map(|id| (id, p)))
        .collect()
}

/// Reload `path` into `evaluator` if it differs from `current`.
///
/// On success `current` is replaced and the applied patch returned. On any
/// error `current` and the live snapshot are untouched.
pub fn reload_from_file(
    path: &Path,
    evaluator: &Evaluator,
    current: &mut EvaluatorConfig,
) -> Result<ConfigPatch> {
    let next = EvaluatorConfig::load(Some(path))?;
    let patch = compute_diff(current, &next);
    if patch.is_empty() {
        debug!("Config reload: no changes detected");
        return Ok(patch);
    }
    info!(changes = %patch.summary(), "Config reload: applying");
    let generation = evaluator.reload(&next)?;
    *current = next;
    info!(generation, "Config reload: complete");
    Ok(patch)
}

/// Watches the configuration file and hot-reloads the evaluator.
///
/// Dropping the watcher stops file notifications; the reload task exits on
/// the shutdown signal.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `config_path`.
    ///
    /// `initial` is the configuration the evaluator was built from.
    pub fn start(
        config_path: PathBuf,
        evaluator: Arc<Evaluator>,
        initial: EvaluatorConfig,
        shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<Self> {
        let (event_tx, event_rx) = tokio::sync::mpsc::channel(32);
        let watcher = create_notify_watcher(event_tx, &config_path)?;
        spawn_reload_task(config_path, evaluator, initial, event_rx, shutdown_rx);
        Ok(Self { _watcher: watcher })
    }
}

fn create_notify_watcher(
    event_tx: tokio::sync::mpsc::Sender<()>,
    config_path: &Path,
) -> Result<RecommendedWatcher> {
    let watch_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let file_name = config_path.file_name().map(ToOwned::to_owned);

    let mut watcher = RecommendedWatcher::new(
        move |result: std::result::Result<Event, notify::Error>| {
            if result
                .as_ref()
                .is_ok_and(|e| is_config_event(e, file_name.as_deref()))
            {
                let _ = event_tx.try_send(());
            }
        },
        NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
    )
    .map_err(|e| crate::Error::Internal(format!("Failed to create config watcher: {e}")))?;

    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .map_err(|e| crate::Error::Internal(format!("Failed to watch config path: {e}")))?;
    Ok(watcher)
}

fn spawn_reload_task(
    config_path: PathBuf,
    evaluator: Arc<Evaluator>,
    mut current: EvaluatorConfig,
    mut event_rx: tokio::sync::mpsc::Receiver<()>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut last_event: Option<Instant> = None;
        let mut ticker = tokio::time::interval(Duration::from_millis(100));

        loop {
            tokio::select! {
                Some(()) = event_rx.recv() => {
                    last_event = Some(Instant::now());
                }
                _ = ticker.tick() => {
                    if last_event.is_some_and(|t| t.elapsed() >= DEBOUNCE) {
                        last_event = None;
                        if let Err(e) = reload_from_file(&config_path, &evaluator, &mut current) {
                            warn!(error = %e, path = %config_path.display(), "Config reload failed, keeping current snapshot");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Config watcher shutting down");
                    break;
                }
            }
        }
    });
}

/// Create/modify events on the watched file. Editors that replace the file
/// surface as `Create` on the same name.
fn is_config_event(event: &Event, file_name: Option<&std::ffi::OsStr>) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|p| file_name.is_some_and(|f| p.file_name() == Some(f)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::CriteriaEngine;
    use crate::session::InMemorySessionStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn route(from: &str, allow: serde_json::Value) -> RoutePolicy {
        RoutePolicy {
            from: from.into(),
            to: vec!["http://upstream.internal".into()],
            allow: vec![allow],
            ..Default::default()
        }
    }

    #[test]
    fn identical_configs_produce_empty_patch() {
        let config = EvaluatorConfig::default().with_policy(route("https://a", json!({})));
        let patch = compute_diff(&config, &config.clone());
        assert!(patch.is_empty());
        assert_eq!(patch.summary(), "no changes");
    }

    #[test]
    fn routes_are_classified_by_id() {
        // GIVEN: a, b in the old config; b (rules changed), c in the new one
        let old = EvaluatorConfig::default()
            .with_policy(route("https://a", json!({"and": [{"accept": true}]})))
            .with_policy(route("https://b", json!({"and": [{"accept": true}]})));
        let new = EvaluatorConfig::default()
            .with_policy(route("https://b", json!({"and": [{"reject": true}]})))
            .with_policy(route("https://c", json!({"and": [{"accept": true}]})));
        // WHEN
        let patch = compute_diff(&old, &new);
        // THEN
        assert_eq!(patch.routes_added, vec!["https://c".to_string()]);
        assert_eq!(patch.routes_removed, vec!["https://a".to_string()]);
        assert_eq!(patch.routes_modified, vec!["https://b".to_string()]);
        assert!(!patch.signing_key_changed);
    }

    #[test]
    fn global_settings_changes_are_flagged() {
        let old = EvaluatorConfig::default();
        let new = EvaluatorConfig::default()
            .with_client_ca("-----BEGIN CERTIFICATE-----")
            .with_signing_key("k")
            .with_jwt_claim_header("email", "X-Email");
        let patch = compute_diff(&old, &new);
        assert!(patch.client_certificates_changed);
        assert!(patch.signing_key_changed);
        assert!(patch.headers_changed);
        assert!(patch.summary().contains("signing key changed"));
    }

    #[test]
    fn reload_from_file_publishes_and_rejects() {
        // GIVEN: an evaluator built from an empty config
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorize.yaml");
        let mut current = EvaluatorConfig::default();
        let evaluator = Evaluator::new(
            &current,
            Arc::new(CriteriaEngine::new()),
            Arc::new(InMemorySessionStore::new()),
        )
        .unwrap();
        let first = evaluator.snapshot().generation();

        // WHEN: a route is added on disk
        std::fs::write(
            &path,
            "policies:\n  - from: https://app.example.com\n    to: [http://app]\n    allow:\n      - and: [{accept: true}]\n",
        )
        .unwrap();
        let patch = reload_from_file(&path, &evaluator, &mut current).unwrap();

        // THEN: a new snapshot serves the route
        assert_eq!(patch.routes_added, vec!["https://app.example.com".to_string()]);
        let second = evaluator.snapshot().generation();
        assert!(second > first);
        assert_eq!(evaluator.snapshot().route_ids().len(), 1);

        // WHEN: the file becomes an invalid rule document
        std::fs::write(
            &path,
            "policies:\n  - from: https://app.example.com\n    to: [http://app]\n    allow:\n      - and: [{bogus: 1}]\n",
        )
        .unwrap();
        assert!(reload_from_file(&path, &evaluator, &mut current).is_err());

        // THEN: the previous snapshot and config stay live
        assert_eq!(evaluator.snapshot().generation(), second);
        assert_eq!(current.policies[0].allow[0], json!({"and": [{"accept": true}]}));
    }

    #[test]
    fn unchanged_file_does_not_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorize.yaml");
        std::fs::write(&path, "{}\n").unwrap();
        let mut current = EvaluatorConfig::default();
        let evaluator = Evaluator::new(
            &current,
            Arc::new(CriteriaEngine::new()),
            Arc::new(InMemorySessionStore::new()),
        )
        .unwrap();
        let generation = evaluator.snapshot().generation();
        let patch = reload_from_file(&path, &evaluator, &mut current).unwrap();
        assert!(patch.is_empty());
        assert_eq!(evaluator.snapshot().generation(), generation);
    }

    #[tokio::test]
    async fn watcher_reloads_on_file_change() {
        // GIVEN: a watcher over an empty config file
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorize.yaml");
        std::fs::write(&path, "{}\n").unwrap();
        let initial = EvaluatorConfig::default();
        let evaluator = Arc::new(
            Evaluator::new(
                &initial,
                Arc::new(CriteriaEngine::new()),
                Arc::new(InMemorySessionStore::new()),
            )
            .unwrap(),
        );
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
        let watcher =
            ConfigWatcher::start(path.clone(), Arc::clone(&evaluator), initial, shutdown_rx).unwrap();

        // WHEN: a route is written to the file
        std::fs::write(
            &path,
            "policies:\n  - from: https://app.example.com\n    to: [http://app]\n",
        )
        .unwrap();

        // THEN: the evaluator serves the route after the debounce
        let deadline = Instant::now() + Duration::from_secs(10);
        while evaluator.snapshot().route_ids().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(evaluator.snapshot().route_ids().len(), 1);

        let _ = shutdown_tx.send(());
        drop(watcher);
    }

    #[test]
    fn only_create_and_modify_of_the_file_count() {
        let name = std::ffi::OsStr::new("authorize.yaml");
        let hit = Event::new(EventKind::Modify(notify::event::ModifyKind::Any))
            .add_path(PathBuf::from("/etc/authorize/authorize.yaml"));
        let other = Event::new(EventKind::Modify(notify::event::ModifyKind::Any))
            .add_path(PathBuf::from("/etc/authorize/other.yaml"));
        let removed = Event::new(EventKind::Remove(notify::event::RemoveKind::Any))
            .add_path(PathBuf::from("/etc/authorize/authorize.yaml"));
        assert!(is_config_event(&hit, Some(name)));
        assert!(!is_config_event(&other, Some(name)));
        assert!(!is_config_event(&removed, Some(name)));
    }
}
