//! Audit logging for token lifecycle events and gate denials.
//!
//! Every event is emitted via `tracing::info!` with a JSON `audit` field, so
//! the trail is queryable by any log aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `token.issued` | A password grant produced a token pair |
//! | `token.refreshed` | A refresh grant produced a new access token |
//! | `token.revoked` | An access token and its refresh tokens were deleted |
//! | `token.denied` | A grant was refused (credentials, refresh token, throttle) |
//! | `token.purged` | The reaper removed expired rows |
//! | `access.denied` | The authorization gate refused a request |
//!
//! Token values never appear in the trail. They are logged as the first
//! 8 bytes of their SHA-256 digest, hex encoded.

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::store::{AccessToken, RefreshToken};
use crate::credentials::UserId;

/// Structured audit event emitted for every token lifecycle transition.
#[derive(Debug, Default, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"token.issued"`).
    pub event: &'static str,
    /// User the event concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    /// Username presented on a password grant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Fingerprint of the affected access token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Fingerprint of the affected refresh token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Granted scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Number of rows affected (cascades and purges).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    /// Human-readable reason for denial events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    /// Construct a `token.issued` event.
    #[must_use]
    pub fn issued(access: &AccessToken, refresh: Option<&RefreshToken>) -> Self {
        Self {
            event: "token.issued",
            user_id: Some(access.user_id),
            access_token: Some(fingerprint(&access.token)),
            refresh_token: refresh.map(|r| fingerprint(&r.token)),
            scope: Some(access.scope.clone()),
            ..Self::default()
        }
    }

    /// Construct a `token.refreshed` event.
    #[must_use]
    pub fn refreshed(access: &AccessToken, refresh: Option<&RefreshToken>) -> Self {
        Self {
            event: "token.refreshed",
            ..Self::issued(access, refresh)
        }
    }

    /// Construct a `token.revoked` event.
    #[must_use]
    pub fn revoked(access_token: &str, user_id: Option<UserId>, refresh_removed: usize) -> Self {
        Self {
            event: "token.revoked",
            user_id,
            access_token: Some(fingerprint(access_token)),
            count: Some(refresh_removed),
            ..Self::default()
        }
    }

    /// Construct a `token.denied` event.
    #[must_use]
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            event: "token.denied",
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Attach the username presented on a password grant.
    #[must_use]
    pub fn with_username(mut self, username: &str) -> Self {
        self.username = Some(username.to_string());
        self
    }

    /// Attach the presented refresh token.
    #[must_use]
    pub fn with_refresh_token(mut self, token: &str) -> Self {
        self.refresh_token = Some(fingerprint(token));
        self
    }

    /// Construct a `token.purged` event.
    #[must_use]
    pub fn purged(access: usize, refresh: usize) -> Self {
        Self {
            event: "token.purged",
            count: Some(access + refresh),
            reason: Some(format!("{access} access, {refresh} refresh")),
            ..Self::default()
        }
    }

    /// Construct an `access.denied` event.
    #[must_use]
    pub fn access_denied(reason: &str, token: Option<&str>, requirement: &str) -> Self {
        Self {
            event: "access.denied",
            access_token: token.map(fingerprint),
            scope: Some(requirement.to_string()),
            reason: Some(reason.to_string()),
            ..Self::default()
        }
    }
}

/// Short, stable, non-reversible identifier for a token value.
#[must_use]
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..8])
}

/// Emit an audit event via the tracing subscriber.
///
/// Uses `tracing::info!` with a structured `audit` field so the event is
/// captured by whatever subscriber is installed.
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(json) => tracing::info!(audit = %json, event = event.event, "audit"),
        Err(e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
