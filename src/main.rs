//! authorize - per-request authorization evaluator
//!
//! Offline front-end for the evaluator: evaluate recorded requests, inspect
//! route ids, and mint signing keys and client certificates.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use clap::Parser;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use edge_authorize::{
    cli::{Cli, Command, TlsCommand},
    config::EvaluatorConfig,
    config_reload::ConfigWatcher,
    evaluator::{Evaluator, FixedClock, Request, RequestHttp, RequestSession, signing_key},
    rules::CriteriaEngine,
    session::{InMemorySessionStore, SessionClaims},
    setup_tracing,
    x509::{CaParams, CertGenerator, ClientCertParams, CrlParams},
};

/// Request description accepted by `authorize evaluate`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RequestFile {
    is_internal: bool,
    /// `from` of the matched route; absent means no route matched.
    route: Option<String>,
    http: RequestHttp,
    session: RequestSession,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config_path = cli.config.clone();
    match cli.command {
        Command::Evaluate {
            request,
            sessions,
            at,
        } => run_evaluate(config_path.as_deref(), &request, sessions.as_deref(), at).await,
        Command::Check { watch } => run_check(config_path, watch).await,
        Command::RouteId => run_route_id(config_path.as_deref()),
        Command::Keygen => run_keygen(),
        Command::Tls(cmd) => run_tls_command(cmd),
    }
}

fn load_config(path: Option<&Path>) -> Option<EvaluatorConfig> {
    match EvaluatorConfig::load(path) {
        Ok(config) => Some(config),
        Err(e) => {
            error!("Failed to load configuration: {e}");
            None
        }
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("Cannot read '{}': {e}", path.display()))?;
    serde_json::from_str(&raw).map_err(|e| format!("Invalid JSON in '{}': {e}", path.display()))
}

/// Evaluate one recorded request
async fn run_evaluate(
    config_path: Option<&Path>,
    request_path: &Path,
    sessions_path: Option<&Path>,
    at: Option<i64>,
) -> ExitCode {
    let Some(config) = load_config(config_path) else {
        return ExitCode::FAILURE;
    };

    let file: RequestFile = match read_json(request_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };
    let sessions = match sessions_path.map(read_json::<BTreeMap<String, SessionClaims>>) {
        None => InMemorySessionStore::new(),
        Some(Ok(map)) => InMemorySessionStore::from_map(map),
        Some(Err(e)) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    let policy = match &file.route {
        None => None,
        Some(from) => match config.policies.iter().find(|p| &p.from == from) {
            Some(p) => Some(Arc::new(p.clone())),
            None => {
                eprintln!("❌ No configured route with from '{from}'");
                return ExitCode::FAILURE;
            }
        },
    };

    let mut evaluator =
        match Evaluator::new(&config, Arc::new(CriteriaEngine::new()), Arc::new(sessions)) {
            Ok(e) => e,
            Err(e) => {
                error!("Failed to build evaluator: {e}");
                return ExitCode::FAILURE;
            }
        };
    if let Some(now) = at {
        evaluator = evaluator.with_clock(Arc::new(FixedClock(now)));
    }

    let request = Request {
        is_internal: file.is_internal,
        policy,
        http: file.http,
        session: file.session,
    };
    match evaluator.evaluate(&request, &CancellationToken::new()).await {
        Ok(result) => match serde_json::to_string_pretty(&result) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("❌ Failed to serialize result: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("❌ Evaluation failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Build the configuration once, optionally keep hot-reloading it
async fn run_check(config_path: Option<PathBuf>, watch: bool) -> ExitCode {
    let Some(config) = load_config(config_path.as_deref()) else {
        return ExitCode::FAILURE;
    };
    let evaluator = match Evaluator::new(
        &config,
        Arc::new(CriteriaEngine::new()),
        Arc::new(InMemorySessionStore::new()),
    ) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            error!("Configuration rejected: {e}");
            return ExitCode::FAILURE;
        }
    };
    let snapshot = evaluator.snapshot();
    println!(
        "✅ {} route(s), signing key {} ({:?})",
        snapshot.route_ids().len(),
        snapshot.signing_key().key_id(),
        snapshot.signing_key().algorithm()
    );
    if !watch {
        return ExitCode::SUCCESS;
    }

    let Some(path) = config_path else {
        eprintln!("❌ --watch requires --config");
        return ExitCode::FAILURE;
    };
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _watcher = match ConfigWatcher::start(path.clone(), Arc::clone(&evaluator), config, shutdown_rx) {
        Ok(w) => w,
        Err(e) => {
            error!("Failed to start config watcher: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!(path = %path.display(), "Watching configuration, Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {e}");
    }
    let _ = shutdown_tx.send(());
    ExitCode::SUCCESS
}

/// Print route ids
fn run_route_id(config_path: Option<&Path>) -> ExitCode {
    let Some(config) = load_config(config_path) else {
        return ExitCode::FAILURE;
    };
    for policy in &config.policies {
        match policy.route_id() {
            Ok(id) => println!("{id:020}  {}", policy.from),
            Err(e) => {
                eprintln!("❌ {}: {e}", policy.from);
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}

/// Print a fresh base64 signing key
fn run_keygen() -> ExitCode {
    match signing_key::generate_pem() {
        Ok(pem) => {
            println!("{}", STANDARD.encode(pem));
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

fn read_pem(path: &Path) -> Result<String, String> {
    std::fs::read_to_string(path).map_err(|e| format!("Cannot read '{}': {e}", path.display()))
}

/// Run client certificate commands
fn run_tls_command(cmd: TlsCommand) -> ExitCode {
    let outcome = match cmd {
        TlsCommand::InitCa { cn, days, out_dir } => CertGenerator::init_ca(&CaParams {
            cn: &cn,
            validity_days: days,
        })
        .and_then(|ca| CertGenerator::write_to_dir(&ca, &out_dir, "ca"))
        .map(|()| format!("CA written to {}", out_dir.display()))
        .map_err(|e| e.to_string()),

        TlsCommand::IssueClient {
            ca_cert,
            ca_key,
            cn,
            serial,
            san_dns,
            san_emails,
            san_uris,
            days,
            out_dir,
            name,
        } => read_pem(&ca_cert).and_then(|cert| {
            let key = read_pem(&ca_key)?;
            let params = ClientCertParams {
                cn: &cn,
                serial,
                san_dns,
                san_emails,
                san_uris,
                validity_days: days,
            };
            let stem = name.unwrap_or_else(|| cn.clone());
            CertGenerator::issue_client(&params, &cert, &key)
                .and_then(|leaf| CertGenerator::write_to_dir(&leaf, &out_dir, &stem))
                .map(|()| format!("Client certificate '{cn}' written to {}", out_dir.display()))
                .map_err(|e| e.to_string())
        }),

        TlsCommand::Revoke {
            ca_cert,
            ca_key,
            serials,
            crl_number,
            days,
            out,
        } => read_pem(&ca_cert).and_then(|cert| {
            let key = read_pem(&ca_key)?;
            let params = CrlParams {
                revoked_serials: serials,
                crl_number,
                validity_days: days,
            };
            let crl = CertGenerator::issue_crl(&params, &cert, &key).map_err(|e| e.to_string())?;
            std::fs::write(&out, crl)
                .map_err(|e| format!("Cannot write '{}': {e}", out.display()))?;
            Ok(format!("CRL written to {}", out.display()))
        }),
    };

    match outcome {
        Ok(msg) => {
            println!("✅ {msg}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}
