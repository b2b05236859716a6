//! Token issuer: turns a grant into an access/refresh token pair.
//!
//! Two grants are understood:
//!
//! - **password**: credentials are checked through the [`CredentialVerifier`]
//!   and the user's full scope is granted.
//! - **refresh_token**: a stored refresh token is exchanged for a new access
//!   token. The user is re-read, and the new scope is what remains of the
//!   refresh token's scope under the user's current scope.
//!
//! Token values are random, so a collision is astronomically unlikely but
//! still handled: a `put` failing with [`Error::NotUnique`] is retried with a
//! fresh value up to `max_generation_attempts` times.

use std::future::Future;
use std::sync::Arc;

use catalog_scope::Scope;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::store::{
    ACCESS_TOKEN_PREFIX, AccessToken, REFRESH_TOKEN_PREFIX, RefreshToken, TokenStore,
    generate_token,
};
use crate::config::TokenConfig;
use crate::credentials::{CredentialVerifier, UserId};
use crate::{Error, Result};

/// `grant_type` of the password grant.
pub const GRANT_PASSWORD: &str = "password";
/// `grant_type` of the refresh grant.
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";

/// A request for a new token pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    /// Resource-owner password credentials.
    Password {
        /// Username
        username: String,
        /// Plaintext password
        password: String,
        /// Requested scope. Accepted and currently ignored: the user's full
        /// scope is always granted.
        scope: Option<String>,
    },
    /// Exchange of a previously issued refresh token.
    RefreshToken {
        /// The refresh token value
        refresh_token: String,
    },
}

impl Grant {
    /// The `grant_type` string this grant was requested with.
    #[must_use]
    pub fn grant_type(&self) -> &'static str {
        match self {
            Self::Password { .. } => GRANT_PASSWORD,
            Self::RefreshToken { .. } => GRANT_REFRESH_TOKEN,
        }
    }
}

/// Token endpoint request body, as sent in JSON or form encoding.
#[derive(Debug, Default, Deserialize)]
pub struct TokenRequest {
    /// `password` or `refresh_token`
    #[serde(default)]
    pub grant_type: String,
    /// Password grant: username
    pub username: Option<String>,
    /// Password grant: password
    pub password: Option<String>,
    /// Password grant: requested scope
    pub scope: Option<String>,
    /// Refresh grant: the refresh token
    pub refresh_token: Option<String>,
}

impl TokenRequest {
    /// Validate the request shape and turn it into a [`Grant`].
    ///
    /// A password grant missing its username or password fails exactly like
    /// bad credentials do.
    pub fn into_grant(self) -> Result<Grant> {
        match self.grant_type.as_str() {
            GRANT_PASSWORD => match (self.username, self.password) {
                (Some(username), Some(password)) if !username.is_empty() => Ok(Grant::Password {
                    username,
                    password,
                    scope: self.scope.filter(|s| !s.is_empty()),
                }),
                _ => Err(Error::Authentication),
            },
            GRANT_REFRESH_TOKEN => match self.refresh_token {
                Some(refresh_token) if !refresh_token.is_empty() => {
                    Ok(Grant::RefreshToken { refresh_token })
                }
                _ => Err(Error::InvalidGrant("refresh_token is required".to_string())),
            },
            "" => Err(Error::UnsupportedGrant("grant_type is required".to_string())),
            other => Err(Error::UnsupportedGrant(other.to_string())),
        }
    }
}

/// The outcome of a successful grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedTokens {
    /// The new access token
    pub access: AccessToken,
    /// The new refresh token. `None` for a refresh grant without rotation.
    pub refresh: Option<RefreshToken>,
}

impl IssuedTokens {
    /// Render the token endpoint response.
    #[must_use]
    pub fn into_response(self) -> TokenResponse {
        TokenResponse {
            expires_in: (self.access.expires - self.access.issued).num_seconds(),
            access_token: self.access.token,
            token_type: "Bearer".to_string(),
            refresh_token: self.refresh.map(|r| r.token),
            scope: self.access.scope,
        }
    }
}

/// Token endpoint response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    /// The issued opaque bearer token.
    pub access_token: String,
    /// Always `"Bearer"`.
    pub token_type: String,
    /// Seconds until the access token expires.
    pub expires_in: i64,
    /// The refresh token, when one was issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Granted scope string.
    pub scope: String,
}

/// Issuer settings resolved from [`TokenConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssuerSettings {
    /// Access token lifetime
    pub access_ttl: TimeDelta,
    /// Refresh token lifetime
    pub refresh_ttl: TimeDelta,
    /// Replace the refresh token on every refresh grant
    pub rotate_refresh_tokens: bool,
    /// Attempts per token value before a collision becomes fatal
    pub max_generation_attempts: u32,
}

impl IssuerSettings {
    /// Convert the configured durations.
    pub fn from_config(config: &TokenConfig) -> Result<Self> {
        let ttl = |d, name: &str| {
            TimeDelta::from_std(d).map_err(|e| Error::Config(format!("tokens.{name}: {e}")))
        };
        Ok(Self {
            access_ttl: ttl(config.access_ttl, "access_ttl")?,
            refresh_ttl: ttl(config.refresh_ttl, "refresh_ttl")?,
            rotate_refresh_tokens: config.rotate_refresh_tokens,
            max_generation_attempts: config.max_generation_attempts.max(1),
        })
    }
}

impl Default for IssuerSettings {
    fn default() -> Self {
        Self {
            access_ttl: TimeDelta::hours(1),
            refresh_ttl: TimeDelta::days(14),
            rotate_refresh_tokens: false,
            max_generation_attempts: 3,
        }
    }
}

/// Creates token pairs.
pub struct TokenIssuer {
    store: Arc<dyn TokenStore>,
    credentials: Arc<dyn CredentialVerifier>,
    settings: IssuerSettings,
}

impl TokenIssuer {
    /// Create an issuer.
    #[must_use]
    pub fn new(
        store: Arc<dyn TokenStore>,
        credentials: Arc<dyn CredentialVerifier>,
        settings: IssuerSettings,
    ) -> Self {
        Self {
            store,
            credentials,
            settings,
        }
    }

    /// The settings in force.
    #[must_use]
    pub fn settings(&self) -> &IssuerSettings {
        &self.settings
    }

    /// Process a grant.
    pub async fn issue(&self, grant: Grant) -> Result<IssuedTokens> {
        match grant {
            Grant::Password {
                username,
                password,
                scope,
            } => {
                if let Some(requested) = scope {
                    debug!(%requested, "Requested scope ignored; granting the user's full scope");
                }
                let user = self.credentials.authenticate(&username, &password).await?;
                self.issue_pair(user.user_id, &user.scope).await
            }
            Grant::RefreshToken { refresh_token } => self.refresh(&refresh_token).await,
        }
    }

    async fn issue_pair(&self, user_id: UserId, scope: &str) -> Result<IssuedTokens> {
        let now = Utc::now();
        let refresh_expires = expiry(now, self.settings.refresh_ttl)?;
        let access = self.store_access(user_id, scope, now).await?;
        let refresh = self.store_refresh_or_unwind(&access, now, refresh_expires).await?;
        Ok(IssuedTokens {
            access,
            refresh: Some(refresh),
        })
    }

    async fn refresh(&self, value: &str) -> Result<IssuedTokens> {
        let now = Utc::now();

        let Some(presented) = self.store.get_refresh(value).await? else {
            return Err(Error::InvalidGrant("unknown refresh token".to_string()));
        };
        if presented.is_expired_at(now) {
            return Err(Error::InvalidGrant("refresh token expired".to_string()));
        }

        let Some(user) = self.credentials.current(presented.user_id).await? else {
            return Err(Error::InvalidGrant("user is no longer active".to_string()));
        };

        let granted = Scope::parse(&presented.scope);
        let scope = granted.narrow_to(&Scope::parse(&user.scope));
        if scope.is_empty() && !granted.is_empty() {
            return Err(Error::InvalidGrant(
                "user no longer holds any of the refresh token's scope".to_string(),
            ));
        }
        let scope = scope.to_string();

        if self.settings.rotate_refresh_tokens {
            // Claiming the old token first makes a refresh token single-use
            // even when two requests race with it.
            if !self.store.delete_refresh(value).await? {
                return Err(Error::InvalidGrant("unknown refresh token".to_string()));
            }
            return match self.issue_pair(user.user_id, &scope).await {
                Ok(issued) => Ok(issued),
                Err(e) => {
                    // Nothing replaced the claimed token, so hand it back.
                    if let Err(restore) = self.store.put_refresh(presented).await {
                        warn!(error = %restore, "Failed to restore a claimed refresh token");
                    }
                    Err(e)
                }
            };
        }

        let access = self.store_access(user.user_id, &scope, now).await?;
        Ok(IssuedTokens {
            access,
            refresh: None,
        })
    }

    async fn store_access(
        &self,
        user_id: UserId,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessToken> {
        let expires = expiry(now, self.settings.access_ttl)?;
        with_fresh_value(self.settings.max_generation_attempts, "access token", move || {
            let token = AccessToken {
                token: generate_token(ACCESS_TOKEN_PREFIX),
                user_id,
                scope: scope.to_string(),
                issued: now,
                expires,
            };
            async move { self.store.put_access(token.clone()).await.map(|()| token) }
        })
        .await
    }

    /// Store a refresh token anchored to `access`. If that fails, `access` is
    /// deleted again so no half-issued pair is left behind.
    async fn store_refresh_or_unwind(
        &self,
        access: &AccessToken,
        now: DateTime<Utc>,
        expires: DateTime<Utc>,
    ) -> Result<RefreshToken> {
        let stored =
            with_fresh_value(self.settings.max_generation_attempts, "refresh token", move || {
                let token = RefreshToken {
                    token: generate_token(REFRESH_TOKEN_PREFIX),
                    access_token: access.token.clone(),
                    user_id: access.user_id,
                    scope: access.scope.clone(),
                    issued: now,
                    expires,
                };
                async move { self.store.put_refresh(token.clone()).await.map(|()| token) }
            })
            .await;

        match stored {
            Ok(token) => Ok(token),
            Err(e) => {
                if let Err(cleanup) = self.store.delete_access(&access.token).await {
                    warn!(error = %cleanup, "Failed to delete access token of an incomplete pair");
                }
                Err(e)
            }
        }
    }
}

/// `now + ttl`, or [`Error::Internal`] when that is past the representable
/// range.
fn expiry(now: DateTime<Utc>, ttl: TimeDelta) -> Result<DateTime<Utc>> {
    now.checked_add_signed(ttl)
        .ok_or_else(|| Error::Internal(format!("token lifetime {ttl} is out of range")))
}

/// Run `attempt` until it stops failing with [`Error::NotUnique`].
///
/// Each call of `attempt` is expected to generate a new value. Other errors
/// are returned immediately; exhausting `max_attempts` yields
/// [`Error::Internal`].
async fn with_fresh_value<T, F, Fut>(max_attempts: u32, kind: &str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_not_unique() && attempts < max_attempts => {
                debug!(kind, attempt = attempts, "Token value collided, regenerating");
            }
            Err(e) if e.is_not_unique() => {
                return Err(Error::Internal(format!(
                    "could not generate a unique {kind} after {attempts} attempts"
                )));
            }
            Err(e) => return Err(e),
        }
    }
}
