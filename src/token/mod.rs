//! Token lifecycle: issuance, storage, revocation and expiry.
//!
//! 1. **Issuance**: `POST /token` accepts a password or refresh grant and
//!    returns an opaque bearer token, plus a refresh token where applicable.
//!
//! 2. **Validation**: the authorization gate looks access tokens up in the
//!    [`TokenStore`] and checks expiry and scope on every guarded request.
//!
//! 3. **Revocation**: `DELETE /token` revokes the presented access token and
//!    every refresh token anchored to it.
//!
//! 4. **Expiry**: [`spawn_reaper`] purges rows some time after they expire
//!    and forgets idle login throttle state.
//!
//! 5. **Audit**: every lifecycle event is emitted via `tracing::info!` with
//!    structured fields.
//!
//! # Architecture
//!
//! ```text
//! POST /token
//!   -> TokenRequest::into_grant         -- shape check
//!   -> LoginThrottle (password grants)  -- per-username quota
//!   -> TokenIssuer::issue               -- credentials / refresh lookup
//!   -> TokenStore::put_*                -- retried on collision
//! ```

pub mod audit;
pub mod handler;
pub mod issuer;
pub mod revocation;
pub mod store;
pub mod throttle;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};

use crate::config::TokenConfig;
use crate::credentials::{CredentialVerifier, UserId};
use crate::{Error, Result};

pub use audit::AuditEvent;
pub use issuer::{Grant, IssuedTokens, IssuerSettings, TokenIssuer, TokenRequest, TokenResponse};
pub use revocation::RevocationManager;
pub use store::{
    AccessToken, InMemoryTokenStore, PurgeStats, RefreshToken, TokenStore,
};
pub use throttle::LoginThrottle;

/// Central coordinator for the token lifecycle.
///
/// Holds the subsystems shared by the HTTP handlers and the authorization
/// gate.
pub struct TokenService {
    /// Token store
    pub store: Arc<dyn TokenStore>,
    /// Token issuer
    pub issuer: TokenIssuer,
    /// Revocation manager
    pub revocation: RevocationManager,
    /// Password grant throttle
    pub throttle: LoginThrottle,
}

impl TokenService {
    /// Assemble the service from a store, a credential verifier and the token
    /// configuration.
    pub fn new(
        store: Arc<dyn TokenStore>,
        credentials: Arc<dyn CredentialVerifier>,
        config: &TokenConfig,
    ) -> Result<Self> {
        let settings = IssuerSettings::from_config(config)?;
        Ok(Self {
            issuer: TokenIssuer::new(Arc::clone(&store), credentials, settings),
            revocation: RevocationManager::new(Arc::clone(&store)),
            throttle: LoginThrottle::new(config.login_attempts_per_minute),
            store,
        })
    }

    /// Process a grant, applying the login throttle and writing the audit
    /// trail.
    pub async fn grant(&self, grant: Grant) -> Result<IssuedTokens> {
        let denied = match &grant {
            Grant::Password { username, .. } => {
                if !self.throttle.check(username) {
                    warn!(username = %username, "Password attempts throttled");
                    audit::emit(&AuditEvent::denied("throttled").with_username(username));
                    return Err(Error::RateLimited(username.clone()));
                }
                AuditEvent::denied("authentication failed").with_username(username)
            }
            Grant::RefreshToken { refresh_token } => {
                AuditEvent::denied("invalid refresh grant").with_refresh_token(refresh_token)
            }
        };
        let refreshing = matches!(grant, Grant::RefreshToken { .. });

        match self.issuer.issue(grant).await {
            Ok(issued) => {
                let event = if refreshing {
                    AuditEvent::refreshed(&issued.access, issued.refresh.as_ref())
                } else {
                    AuditEvent::issued(&issued.access, issued.refresh.as_ref())
                };
                audit::emit(&event);
                Ok(issued)
            }
            Err(e) => {
                if e.status_code().is_client_error() {
                    audit::emit(&denied);
                }
                Err(e)
            }
        }
    }

    /// Revoke an access token and its refresh tokens.
    pub async fn revoke(&self, access_token: &str, user_id: Option<UserId>) -> Result<usize> {
        let removed = self.revocation.revoke(access_token).await?;
        audit::emit(&AuditEvent::revoked(access_token, user_id, removed));
        Ok(removed)
    }

    /// Purge tokens that expired before `cutoff` and drop replenished
    /// throttle entries.
    pub async fn purge(&self, cutoff: DateTime<Utc>) -> Result<PurgeStats> {
        self.throttle.prune();
        self.store.purge_expired(cutoff).await
    }
}

/// Spawn a background task that, every `interval`, purges tokens more than
/// `grace` past expiry.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    tokens: Arc<TokenService>,
    interval: Duration,
    grace: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    let grace = TimeDelta::from_std(grace).unwrap_or(TimeDelta::MAX);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cutoff = Utc::now()
                        .checked_sub_signed(grace)
                        .unwrap_or(DateTime::<Utc>::MIN_UTC);
                    match tokens.purge(cutoff).await {
                        Ok(stats) if stats.total() > 0 => {
                            audit::emit(&AuditEvent::purged(stats.access, stats.refresh));
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Token purge failed"),
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Token reaper shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{DirectoryVerifier, InMemoryUserDirectory, test_hasher};
    use crate::token::issuer::tests::user;
    use crate::token::store::tests::make_access;

    fn service(attempts_per_minute: u32) -> TokenService {
        let users = Arc::new(InMemoryUserDirectory::new([user(
            1,
            "alice",
            "wonderland",
            "books:admin",
        )]));
        let verifier = Arc::new(DirectoryVerifier::new(users, test_hasher()));
        let config = TokenConfig {
            login_attempts_per_minute: attempts_per_minute,
            ..TokenConfig::default()
        };
        TokenService::new(Arc::new(InMemoryTokenStore::new()), verifier, &config).unwrap()
    }

    fn password(pw: &str) -> Grant {
        Grant::Password {
            username: "alice".into(),
            password: pw.into(),
            scope: None,
        }
    }

    #[tokio::test]
    async fn throttle_trips_before_credentials_are_checked() {
        // GIVEN: two attempts per minute
        let svc = service(2);

        // WHEN: alice fails twice, then tries the right password
        assert!(matches!(svc.grant(password("x")).await, Err(Error::Authentication)));
        assert!(matches!(svc.grant(password("y")).await, Err(Error::Authentication)));
        let third = svc.grant(password("wonderland")).await;

        // THEN: the third attempt is rate limited
        assert!(matches!(third, Err(Error::RateLimited(_))));
    }

    #[tokio::test]
    async fn refresh_grants_are_not_throttled() {
        let svc = service(1);
        let issued = svc.grant(password("wonderland")).await.unwrap();
        let refresh_token = issued.refresh.unwrap().token;

        for _ in 0..3 {
            let grant = Grant::RefreshToken {
                refresh_token: refresh_token.clone(),
            };
            assert!(svc.grant(grant).await.is_ok());
        }
    }

    #[tokio::test]
    async fn reaper_purges_and_stops_on_shutdown() {
        // GIVEN: a service whose store holds a long-dead token
        let svc = Arc::new(service(0));
        let dead = make_access(1, "books:admin", -7200);
        svc.store.put_access(dead.clone()).await.unwrap();
        let (tx, rx) = tokio::sync::broadcast::channel(1);

        // WHEN: the reaper runs with zero grace
        let handle = spawn_reaper(
            Arc::clone(&svc),
            Duration::from_millis(10),
            Duration::ZERO,
            rx,
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        // THEN: the token is gone and the task has exited
        assert!(svc.store.get_access(&dead.token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_keeps_live_throttle_state() {
        // GIVEN: alice has just used up her quota
        let svc = service(1);
        assert!(matches!(svc.grant(password("x")).await, Err(Error::Authentication)));
        assert_eq!(svc.throttle.tracked(), 1);

        // WHEN: the reaper's purge runs
        svc.purge(Utc::now()).await.unwrap();

        // THEN: she stays throttled
        assert_eq!(svc.throttle.tracked(), 1);
        assert!(matches!(
            svc.grant(password("wonderland")).await,
            Err(Error::RateLimited(_))
        ));
    }

    #[tokio::test]
    async fn revoke_through_service() {
        let svc = service(0);
        let issued = svc.grant(password("wonderland")).await.unwrap();

        let removed = svc.revoke(&issued.access.token, Some(1)).await.unwrap();

        assert_eq!(removed, 1);
        assert!(svc.store.get_access(&issued.access.token).await.unwrap().is_none());
        assert!(matches!(
            svc.revoke(&issued.access.token, Some(1)).await,
            Err(Error::NotFound(_))
        ));
    }
}
