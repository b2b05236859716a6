//! Catalog Gate Library
//!
//! Token lifecycle and scope-based authorization for a library catalog API.
//!
//! # Features
//!
//! - **Token endpoint**: OAuth-style password and refresh grants issuing opaque
//!   bearer tokens
//! - **Revocation cascade**: revoking an access token removes every refresh
//!   token anchored to it in one step
//! - **Scope hierarchy**: `superuser` > `<library>:admin` > `<library>:regular`
//! - **Authorization gate**: per-route access levels enforced as axum
//!   middleware
//! - **Audit trail**: structured `tracing` events for every token transition
//!
//! # Layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`credentials`] | Username/password verification |
//! | [`token`] | Issuance, storage, revocation, expiry |
//! | [`authority`] | Library scope lookup and the hierarchy rule |
//! | [`gate`] | Request-time allow/deny |
//! | [`server`] | Router and process lifecycle |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod authority;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gate;
pub mod server;
pub mod token;

pub use catalog_scope as scope;
pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`. `format` is `text` (default) or
/// `json`.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}"))),
        None | Some("text") => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}"))),
        Some(other) => Err(Error::Config(format!("Unknown log format: {other}"))),
    }
}
