//! Token store: persistence layer for access and refresh tokens.
//!
//! The [`TokenStore`] trait abstracts over storage backends. The shipped
//! implementation is [`InMemoryTokenStore`]; a relational backend would map
//! each method onto one statement (or one transaction for
//! [`TokenStore::revoke_access`]).
//!
//! # Design
//!
//! Access tokens and refresh tokens are indexed by their opaque value. A third
//! index maps an access token value to the refresh tokens anchored to it, so
//! the revocation cascade does not scan the refresh table.
//!
//! All three tables live behind a single `RwLock`. Every compound mutation
//! (put with uniqueness check, revocation cascade, purge) happens under one
//! write guard, which is the store's unit of work: readers see either the
//! state before it or the state after it, never a refresh token whose anchor
//! was deleted by a half-finished revocation.
//!
//! Lookups return expired rows as well. Whether an expired row counts is the
//! caller's decision, and the reaper removes them eventually.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::credentials::UserId;
use crate::{Error, Result};

/// Prefix of access token values.
pub const ACCESS_TOKEN_PREFIX: &str = "cgat_";
/// Prefix of refresh token values.
pub const REFRESH_TOKEN_PREFIX: &str = "cgrt_";

/// A short-lived credential authorizing API calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    /// Opaque bearer value.
    pub token: String,
    /// Owner.
    pub user_id: UserId,
    /// Grant copied at issuance.
    pub scope: String,
    /// Issued-at.
    pub issued: DateTime<Utc>,
    /// Absolute expiry.
    pub expires: DateTime<Utc>,
}

impl AccessToken {
    /// Returns `true` once `now` has reached the expiry.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires
    }

    /// Returns `true` if the token has passed its expiry time.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// A longer-lived credential exchanged for new access tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshToken {
    /// Opaque value.
    pub token: String,
    /// The access token this one is anchored to.
    pub access_token: String,
    /// Owner.
    pub user_id: UserId,
    /// Grant of the access token it was paired with.
    pub scope: String,
    /// Issued-at.
    pub issued: DateTime<Utc>,
    /// Absolute expiry.
    pub expires: DateTime<Utc>,
}

impl RefreshToken {
    /// Returns `true` once `now` has reached the expiry.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires
    }

    /// Returns `true` if the token has passed its expiry time.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Counts from one purge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    /// Access tokens removed.
    pub access: usize,
    /// Refresh tokens removed.
    pub refresh: usize,
}

impl PurgeStats {
    /// Total rows removed.
    #[must_use]
    pub fn total(&self) -> usize {
        self.access + self.refresh
    }
}

/// Trait abstracting the token storage backend.
///
/// Implementations must be `Send + Sync` because the token store is shared
/// across request tasks.
#[async_trait::async_trait]
pub trait TokenStore: Send + Sync + 'static {
    /// Insert an access token. Fails with [`Error::NotUnique`] on collision.
    async fn put_access(&self, token: AccessToken) -> Result<()>;

    /// Insert a refresh token. Fails with [`Error::NotUnique`] on collision.
    async fn put_refresh(&self, token: RefreshToken) -> Result<()>;

    /// Look up an access token by value, expired or not.
    async fn get_access(&self, token: &str) -> Result<Option<AccessToken>>;

    /// Look up a refresh token by value, expired or not.
    async fn get_refresh(&self, token: &str) -> Result<Option<RefreshToken>>;

    /// Delete one access token. Returns `true` if it existed.
    async fn delete_access(&self, token: &str) -> Result<bool>;

    /// Delete one refresh token. Returns `true` if it existed.
    async fn delete_refresh(&self, token: &str) -> Result<bool>;

    /// Delete every refresh token anchored to `access_token`.
    async fn delete_refresh_by_access_token(&self, access_token: &str) -> Result<usize>;

    /// Atomically delete an access token together with its refresh tokens.
    ///
    /// Returns the number of refresh tokens removed, or [`Error::NotFound`]
    /// if the access token does not exist (nothing is deleted in that case).
    async fn revoke_access(&self, access_token: &str) -> Result<usize>;

    /// Remove every token whose expiry is at or before `cutoff`.
    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<PurgeStats>;
}

#[derive(Default)]
struct Tables {
    access: HashMap<String, AccessToken>,
    refresh: HashMap<String, RefreshToken>,
    /// access token value → refresh token values anchored to it
    anchored: HashMap<String, HashSet<String>>,
}

impl Tables {
    fn remove_refresh(&mut self, token: &str) -> Option<RefreshToken> {
        let removed = self.refresh.remove(token)?;
        if let Some(family) = self.anchored.get_mut(&removed.access_token) {
            family.remove(token);
            if family.is_empty() {
                self.anchored.remove(&removed.access_token);
            }
        }
        Some(removed)
    }

    fn remove_family(&mut self, access_token: &str) -> usize {
        let Some(family) = self.anchored.remove(access_token) else {
            return 0;
        };
        family
            .iter()
            .filter(|value| self.refresh.remove(value.as_str()).is_some())
            .count()
    }
}

/// In-memory token store.
#[derive(Default)]
pub struct InMemoryTokenStore {
    tables: RwLock<Tables>,
}

impl InMemoryTokenStore {
    /// Create an empty token store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of access tokens held, expired ones included.
    #[must_use]
    pub fn access_count(&self) -> usize {
        self.tables.read().access.len()
    }

    /// Number of refresh tokens held, expired ones included.
    #[must_use]
    pub fn refresh_count(&self) -> usize {
        self.tables.read().refresh.len()
    }
}

#[async_trait::async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn put_access(&self, token: AccessToken) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.access.contains_key(&token.token) {
            return Err(Error::NotUnique("access token".to_string()));
        }
        tables.access.insert(token.token.clone(), token);
        Ok(())
    }

    async fn put_refresh(&self, token: RefreshToken) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.refresh.contains_key(&token.token) {
            return Err(Error::NotUnique("refresh token".to_string()));
        }
        tables
            .anchored
            .entry(token.access_token.clone())
            .or_default()
            .insert(token.token.clone());
        tables.refresh.insert(token.token.clone(), token);
        Ok(())
    }

    async fn get_access(&self, token: &str) -> Result<Option<AccessToken>> {
        Ok(self.tables.read().access.get(token).cloned())
    }

    async fn get_refresh(&self, token: &str) -> Result<Option<RefreshToken>> {
        Ok(self.tables.read().refresh.get(token).cloned())
    }

    async fn delete_access(&self, token: &str) -> Result<bool> {
        Ok(self.tables.write().access.remove(token).is_some())
    }

    async fn delete_refresh(&self, token: &str) -> Result<bool> {
        Ok(self.tables.write().remove_refresh(token).is_some())
    }

    async fn delete_refresh_by_access_token(&self, access_token: &str) -> Result<usize> {
        Ok(self.tables.write().remove_family(access_token))
    }

    async fn revoke_access(&self, access_token: &str) -> Result<usize> {
        let mut tables = self.tables.write();
        if !tables.access.contains_key(access_token) {
            return Err(Error::NotFound("access token".to_string()));
        }
        let refresh_removed = tables.remove_family(access_token);
        tables.access.remove(access_token);
        Ok(refresh_removed)
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<PurgeStats> {
        let mut tables = self.tables.write();

        let before = tables.access.len();
        tables.access.retain(|_, t| t.expires > cutoff);
        let access = before - tables.access.len();

        let expired_refresh: Vec<String> = tables
            .refresh
            .values()
            .filter(|t| t.expires <= cutoff)
            .map(|t| t.token.clone())
            .collect();
        for value in &expired_refresh {
            tables.remove_refresh(value);
        }

        Ok(PurgeStats {
            access,
            refresh: expired_refresh.len(),
        })
    }
}

/// Generate a cryptographically random opaque token value.
///
/// Format: `<prefix><43-char URL-safe base64>` (256 bits of entropy).
/// The prefix makes tokens greppable and detectable by secret scanners.
#[must_use]
pub fn generate_token(prefix: &str) -> String {
    let random_bytes: [u8; 32] = rand::random();
    format!(
        "{prefix}{}",
        base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            random_bytes,
        )
    )
}
