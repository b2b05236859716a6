//! Credential verification: username/password to an authenticated principal.
//!
//! Three seams, each a trait so the persistence layer can be swapped:
//!
//! - [`PasswordHasher`]: the opaque `hash`/`verify` capability. [`Argon2Hasher`]
//!   is the shipped implementation.
//! - [`UserDirectory`]: read-only user lookup. [`InMemoryUserDirectory`] is
//!   loaded from configuration.
//! - [`CredentialVerifier`]: what the token issuer talks to. [`DirectoryVerifier`]
//!   combines the two above.
//!
//! Every failure of [`CredentialVerifier::authenticate`] is the same
//! [`Error::Authentication`], so callers cannot tell an unknown user from a
//! wrong password or a deactivated account.

use std::collections::HashMap;
use std::sync::Arc;

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{
        PasswordHash, PasswordHasher as _, PasswordVerifier as _, SaltString, rand_core::OsRng,
    },
};
use parking_lot::RwLock;
use tracing::debug;

use crate::config::UserConfig;
use crate::{Error, Result};

/// Stable user identifier.
pub type UserId = u64;

/// Hash and verify passwords.
pub trait PasswordHasher: Send + Sync + 'static {
    /// Produce a self-describing hash of `plain`.
    fn hash(&self, plain: &str) -> Result<String>;

    /// Returns `true` if `plain` matches `hash`. Malformed hashes never match.
    fn verify(&self, plain: &str, hash: &str) -> bool;
}

/// Argon2id password hasher producing PHC strings.
pub struct Argon2Hasher {
    argon2: Argon2<'static>,
}

impl Argon2Hasher {
    /// Hasher with the crate's default (OWASP-recommended) parameters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            argon2: Argon2::default(),
        }
    }

    /// Hasher with explicit cost parameters (memory in KiB, iterations, lanes).
    ///
    /// Verification always uses the parameters embedded in the stored hash,
    /// so these only affect newly produced hashes.
    pub fn with_params(memory_kib: u32, iterations: u32, lanes: u32) -> Result<Self> {
        let params = Params::new(memory_kib, iterations, lanes, None)
            .map_err(|e| Error::Config(format!("Invalid argon2 parameters: {e}")))?;
        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }
}

impl Default for Argon2Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl PasswordHasher for Argon2Hasher {
    fn hash(&self, plain: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(plain.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| Error::Internal(format!("Password hashing failed: {e}")))
    }

    fn verify(&self, plain: &str, hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        self.argon2.verify_password(plain.as_bytes(), &parsed).is_ok()
    }
}

/// A user as seen by this service.
#[derive(Debug, Clone)]
pub struct UserRecord {
    /// Stable id
    pub id: UserId,
    /// Login name
    pub username: String,
    /// Stored password hash
    pub password_hash: String,
    /// Space-separated scope grants
    pub scope: String,
    /// Inactive users are refused tokens
    pub active: bool,
}

impl From<&UserConfig> for UserRecord {
    fn from(user: &UserConfig) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            password_hash: user.password_hash.clone(),
            scope: user.scope.clone(),
            active: user.active,
        }
    }
}

/// Read-only access to user accounts.
#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync + 'static {
    /// Look up a user by login name.
    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>>;

    /// Look up a user by id.
    async fn find_by_id(&self, id: UserId) -> Result<Option<UserRecord>>;
}

/// User directory held in memory, typically loaded from configuration.
#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<HashMap<UserId, UserRecord>>,
}

impl InMemoryUserDirectory {
    /// Build a directory from records.
    #[must_use]
    pub fn new(users: impl IntoIterator<Item = UserRecord>) -> Self {
        Self {
            users: RwLock::new(users.into_iter().map(|u| (u.id, u)).collect()),
        }
    }

    /// Build a directory from the `users` configuration section.
    #[must_use]
    pub fn from_config(users: &[UserConfig]) -> Self {
        Self::new(users.iter().map(UserRecord::from))
    }

    /// Insert or replace a user.
    pub fn upsert(&self, user: UserRecord) {
        self.users.write().insert(user.id, user);
    }
}

#[async_trait::async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
        Ok(self
            .users
            .read()
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<UserRecord>> {
        Ok(self.users.read().get(&id).cloned())
    }
}

/// An authenticated principal: who the user is and what they may do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    /// User id
    pub user_id: UserId,
    /// The user's full authorized scope
    pub scope: String,
}

/// The capability the token issuer uses to check credentials.
#[async_trait::async_trait]
pub trait CredentialVerifier: Send + Sync + 'static {
    /// Check a username/password pair.
    ///
    /// Fails with [`Error::Authentication`] for an unknown user, an inactive
    /// user or a wrong password alike.
    async fn authenticate(&self, username: &str, password: &str) -> Result<Authenticated>;

    /// The current standing of an already-known user, or `None` if the user
    /// no longer exists or is inactive.
    async fn current(&self, user_id: UserId) -> Result<Option<Authenticated>>;
}

/// [`CredentialVerifier`] backed by a [`UserDirectory`] and a [`PasswordHasher`].
pub struct DirectoryVerifier {
    users: Arc<dyn UserDirectory>,
    hasher: Arc<dyn PasswordHasher>,
    /// Verified against when the user does not exist, so unknown usernames
    /// cost as much as known ones.
    dummy_hash: String,
}

impl DirectoryVerifier {
    /// Create a verifier. Hashes the dummy password up front, so call this
    /// at startup rather than on a request path.
    #[must_use]
    pub fn new(users: Arc<dyn UserDirectory>, hasher: Arc<dyn PasswordHasher>) -> Self {
        let dummy_hash = hasher.hash("catalog-gate-dummy").unwrap_or_default();
        Self {
            users,
            hasher,
            dummy_hash,
        }
    }
}

#[async_trait::async_trait]
impl CredentialVerifier for DirectoryVerifier {
    async fn authenticate(&self, username: &str, password: &str) -> Result<Authenticated> {
        let user = self.users.find_by_username(username).await?;

        let hash = user
            .as_ref()
            .map_or_else(|| self.dummy_hash.clone(), |u| u.password_hash.clone());

        let hasher = Arc::clone(&self.hasher);
        let plain = password.to_string();
        let verified = tokio::task::spawn_blocking(move || hasher.verify(&plain, &hash))
            .await
            .map_err(|e| Error::Internal(format!("Password verification task failed: {e}")))?;

        match user {
            Some(u) if verified && u.active => Ok(Authenticated {
                user_id: u.id,
                scope: u.scope,
            }),
            Some(u) => {
                debug!(user_id = u.id, active = u.active, "Credential check failed");
                Err(Error::Authentication)
            }
            None => {
                debug!("Credential check for unknown username");
                Err(Error::Authentication)
            }
        }
    }

    async fn current(&self, user_id: UserId) -> Result<Option<Authenticated>> {
        Ok(self
            .users
            .find_by_id(user_id)
            .await?
            .filter(|u| u.active)
            .map(|u| Authenticated {
                user_id: u.id,
                scope: u.scope,
            }))
    }
}

/// Cheap hasher for tests; real deployments use [`Argon2Hasher::new`].
#[cfg(test)]
pub(crate) fn test_hasher() -> Arc<Argon2Hasher> {
    Arc::new(Argon2Hasher::with_params(8, 1, 1).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory(hasher: &Argon2Hasher) -> Arc<InMemoryUserDirectory> {
        Arc::new(InMemoryUserDirectory::new([
            UserRecord {
                id: 1,
                username: "alice".to_string(),
                password_hash: hasher.hash("wonderland").unwrap(),
                scope: "books:admin".to_string(),
                active: true,
            },
            UserRecord {
                id: 2,
                username: "mallory".to_string(),
                password_hash: hasher.hash("letmein").unwrap(),
                scope: "books:regular".to_string(),
                active: false,
            },
        ]))
    }

    #[test]
    fn argon2_round_trip() {
        let hasher = Argon2Hasher::with_params(8, 1, 1).unwrap();
        let hash = hasher.hash("secret").unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("secret", &hash));
        assert!(!hasher.verify("Secret", &hash));
    }

    #[test]
    fn argon2_rejects_malformed_hash() {
        let hasher = Argon2Hasher::with_params(8, 1, 1).unwrap();
        assert!(!hasher.verify("secret", "not-a-phc-string"));
        assert!(!hasher.verify("secret", ""));
    }

    #[test]
    fn argon2_salts_each_hash() {
        let hasher = Argon2Hasher::with_params(8, 1, 1).unwrap();
        assert_ne!(hasher.hash("same").unwrap(), hasher.hash("same").unwrap());
    }

    #[tokio::test]
    async fn authenticate_active_user() {
        // GIVEN: alice with a known password
        let hasher = test_hasher();
        let verifier = DirectoryVerifier::new(directory(&hasher), hasher);

        // WHEN: she presents it
        let principal = verifier.authenticate("alice", "wonderland").await.unwrap();

        // THEN: her id and full scope come back
        assert_eq!(principal.user_id, 1);
        assert_eq!(principal.scope, "books:admin");
    }

    #[test]
    fn dummy_hash_is_ready_at_construction() {
        // GIVEN / WHEN: a fresh verifier
        let hasher = test_hasher();
        let verifier = DirectoryVerifier::new(directory(&hasher), hasher.clone());

        // THEN: the unknown-user hash already exists and is a real PHC string
        assert!(verifier.dummy_hash.starts_with("$argon2id$"));
        assert!(hasher.verify("catalog-gate-dummy", &verifier.dummy_hash));
    }

    #[tokio::test]
    async fn every_failure_looks_the_same() {
        // GIVEN: three different ways of failing
        let hasher = test_hasher();
        let verifier = DirectoryVerifier::new(directory(&hasher), hasher);

        let wrong_password = verifier.authenticate("alice", "nope").await.unwrap_err();
        let unknown_user = verifier.authenticate("nobody", "wonderland").await.unwrap_err();
        let inactive_user = verifier.authenticate("mallory", "letmein").await.unwrap_err();

        // THEN: all produce the same error text
        let messages = [
            wrong_password.to_string(),
            unknown_user.to_string(),
            inactive_user.to_string(),
        ];
        assert!(messages.iter().all(|m| m == crate::error::AUTHENTICATION_FAILED));
        assert!(matches!(wrong_password, Error::Authentication));
        assert!(matches!(unknown_user, Error::Authentication));
        assert!(matches!(inactive_user, Error::Authentication));
    }

    #[tokio::test]
    async fn current_hides_inactive_and_missing_users() {
        let hasher = test_hasher();
        let verifier = DirectoryVerifier::new(directory(&hasher), hasher);

        assert_eq!(
            verifier.current(1).await.unwrap(),
            Some(Authenticated {
                user_id: 1,
                scope: "books:admin".to_string()
            })
        );
        assert_eq!(verifier.current(2).await.unwrap(), None);
        assert_eq!(verifier.current(99).await.unwrap(), None);
    }

    #[tokio::test]
    async fn upsert_changes_what_current_reports() {
        // GIVEN: alice is active
        let hasher = test_hasher();
        let users = directory(&hasher);
        let verifier = DirectoryVerifier::new(users.clone(), hasher);

        // WHEN: her account is deactivated
        let mut alice = users.find_by_id(1).await.unwrap().unwrap();
        alice.active = false;
        users.upsert(alice);

        // THEN: she is no longer current
        assert_eq!(verifier.current(1).await.unwrap(), None);
    }
}
