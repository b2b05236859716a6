//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Catalog Gate - token lifecycle and scope-based authorization for a library catalog
#[derive(Parser, Debug)]
#[command(name = "catalog-gate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "CATALOG_GATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "CATALOG_GATE_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "CATALOG_GATE_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "CATALOG_GATE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "CATALOG_GATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the token server (default)
    Serve,

    /// Hash a password for the `users` section of the config file
    HashPassword {
        /// Password to hash; read from stdin when omitted
        password: Option<String>,
    },

    /// Load and validate the configuration, then exit
    CheckConfig,
}
