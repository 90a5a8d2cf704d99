//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Per-request authorization evaluator for an identity-aware reverse proxy
#[derive(Parser, Debug)]
#[command(name = "authorize")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "AUTHORIZE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "AUTHORIZE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "AUTHORIZE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Evaluate one request and print the result as JSON
    Evaluate {
        /// Request description (JSON)
        #[arg(short, long)]
        request: PathBuf,

        /// Session claims keyed by session id (JSON)
        #[arg(short, long)]
        sessions: Option<PathBuf>,

        /// Evaluate at this Unix time instead of now
        #[arg(long)]
        at: Option<i64>,
    },

    /// Build the configuration and exit, or keep watching it for changes
    Check {
        /// Keep running and hot-reload on file changes
        #[arg(long)]
        watch: bool,
    },

    /// List route ids of the configured policies
    RouteId,

    /// Generate a base64-encoded Ed25519 signing key
    Keygen,

    /// Client certificate tooling
    #[command(subcommand)]
    Tls(TlsCommand),
}

/// Client certificate subcommands
#[derive(Subcommand, Debug)]
pub enum TlsCommand {
    /// Create a self-signed client CA
    InitCa {
        /// Common Name of the CA
        #[arg(long, default_value = "Edge Client CA")]
        cn: String,

        /// Validity in days
        #[arg(long, default_value_t = 3650)]
        days: u32,

        /// Output directory (writes ca.crt and ca.key)
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,
    },

    /// Issue a client certificate signed by the CA
    IssueClient {
        /// CA certificate (PEM)
        #[arg(long, default_value = "ca.crt")]
        ca_cert: PathBuf,

        /// CA private key (PEM)
        #[arg(long, default_value = "ca.key")]
        ca_key: PathBuf,

        /// Common Name of the client
        #[arg(long)]
        cn: String,

        /// Serial number (random when omitted)
        #[arg(long)]
        serial: Option<u64>,

        /// SAN DNS entry (repeatable)
        #[arg(long = "san-dns")]
        san_dns: Vec<String>,

        /// SAN email entry (repeatable)
        #[arg(long = "san-email")]
        san_emails: Vec<String>,

        /// SAN URI entry, e.g. a SPIFFE id (repeatable)
        #[arg(long = "san-uri")]
        san_uris: Vec<String>,

        /// Validity in days
        #[arg(long, default_value_t = 365)]
        days: u32,

        /// Output directory (writes <name>.crt and <name>.key)
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,

        /// Output file stem (defaults to the Common Name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Write a CRL revoking the given serials
    Revoke {
        /// CA certificate (PEM)
        #[arg(long, default_value = "ca.crt")]
        ca_cert: PathBuf,

        /// CA private key (PEM)
        #[arg(long, default_value = "ca.key")]
        ca_key: PathBuf,

        /// Serial to revoke (repeatable)
        #[arg(long = "serial", required = true)]
        serials: Vec<u64>,

        /// CRL number
        #[arg(long, default_value_t = 1)]
        crl_number: u64,

        /// Days until the next update
        #[arg(long, default_value_t = 7)]
        days: u32,

        /// Output file
        #[arg(short, long, default_value = "ca.crl")]
        out: PathBuf,
    },
}
