//! Revocation: delete an access token and everything anchored to it.

use std::sync::Arc;

use tracing::debug;

use super::store::TokenStore;
use crate::Result;

/// Deletes access tokens together with their refresh tokens.
///
/// The cascade is a single [`TokenStore::revoke_access`] call, so a
/// concurrent reader sees either the whole family or none of it.
pub struct RevocationManager {
    store: Arc<dyn TokenStore>,
}

impl RevocationManager {
    /// Create a revocation manager over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self { store }
    }

    /// Revoke `access_token`.
    ///
    /// Returns the number of refresh tokens removed with it, or
    /// [`Error::NotFound`](crate::Error::NotFound) when the access token does
    /// not exist.
    pub async fn revoke(&self, access_token: &str) -> Result<usize> {
        let removed = self.store.revoke_access(access_token).await?;
        debug!(refresh_removed = removed, "Access token revoked");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::token::store::InMemoryTokenStore;
    use crate::token::store::tests::{make_access, make_refresh};

    #[tokio::test]
    async fn revoke_removes_token_and_family() {
        // GIVEN: alice's pair and bob's pair
        let store = Arc::new(InMemoryTokenStore::new());
        let alice = make_access(1, "books:admin", 3600);
        let alice_refresh = make_refresh(&alice, 86_400);
        let bob = make_access(2, "books:regular", 3600);
        let bob_refresh = make_refresh(&bob, 86_400);
        for t in [&alice, &bob] {
            store.put_access(t.clone()).await.unwrap();
        }
        for t in [&alice_refresh, &bob_refresh] {
            store.put_refresh(t.clone()).await.unwrap();
        }
        let manager = RevocationManager::new(store.clone());

        // WHEN: alice's access token is revoked
        let removed = manager.revoke(&alice.token).await.unwrap();

        // THEN: her tokens are gone, bob's are untouched
        assert_eq!(removed, 1);
        assert!(store.get_access(&alice.token).await.unwrap().is_none());
        assert!(store.get_refresh(&alice_refresh.token).await.unwrap().is_none());
        assert!(store.get_access(&bob.token).await.unwrap().is_some());
        assert!(store.get_refresh(&bob_refresh.token).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn revoke_twice_is_not_found() {
        let store = Arc::new(InMemoryTokenStore::new());
        let token = make_access(1, "books:admin", 3600);
        store.put_access(token.clone()).await.unwrap();
        let manager = RevocationManager::new(store);

        manager.revoke(&token.token).await.unwrap();
        let second = manager.revoke(&token.token).await;

        assert!(matches!(second, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn concurrent_readers_never_see_orphaned_refresh_tokens() {
        // GIVEN: many families in the store
        let store = Arc::new(InMemoryTokenStore::new());
        let mut pairs = Vec::new();
        for user in 0..50 {
            let access = make_access(user, "books:regular", 3600);
            let refresh = make_refresh(&access, 86_400);
            store.put_access(access.clone()).await.unwrap();
            store.put_refresh(refresh.clone()).await.unwrap();
            pairs.push((access, refresh));
        }
        let manager = Arc::new(RevocationManager::new(store.clone()));

        // WHEN: all families are revoked while a reader checks them
        let reader = {
            let store = store.clone();
            let pairs = pairs.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    for (access, refresh) in &pairs {
                        // THEN: once the anchor is gone, its refresh token is gone too
                        let access_alive = store.get_access(&access.token).await.unwrap().is_some();
                        let refresh_alive = store.get_refresh(&refresh.token).await.unwrap().is_some();
                        assert!(access_alive || !refresh_alive);
                    }
                    tokio::task::yield_now().await;
                }
            })
        };
        let mut revokers = Vec::new();
        for (access, _) in &pairs {
            let manager = manager.clone();
            let value = access.token.clone();
            revokers.push(tokio::spawn(async move { manager.revoke(&value).await }));
        }
        for handle in revokers {
            handle.await.unwrap().unwrap();
        }
        reader.await.unwrap();

        assert_eq!(store.access_count(), 0);
        assert_eq!(store.refresh_count(), 0);
    }
}
