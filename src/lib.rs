//! Edge Authorize Library
//!
//! Per-request authorization for an identity-aware reverse proxy. Given a
//! request's HTTP facts, its session and the matched route policy, the
//! [`Evaluator`](evaluator::Evaluator) decides whether the request is
//! allowed, records why, and computes the identity headers to forward to the
//! upstream.
//!
//! # Features
//!
//! - **Route policies**: allow/deny rules compiled by a pluggable
//!   [`RuleEngine`](rules::RuleEngine), with a built-in criteria engine
//! - **Client certificates**: chain building, CRL revocation and SAN
//!   constraints against configured CAs
//! - **Identity assertions**: signed JWT headers with a stable key id
//! - **Snapshots**: configuration-derived state swapped atomically on reload
//! - **Hot reload**: file watching with diffing and rejected-reload safety

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod config_reload;
pub mod error;
pub mod evaluator;
pub mod httputil;
pub mod route;
pub mod rules;
pub mod session;
pub mod x509;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
