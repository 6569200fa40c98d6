use crate::{
    error::Result,
    store::{AcquireOutcome, LeaseStore, LeaseToken},
    Error, LeaseKey,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Bridges the mutex to a [`LeaseStore`], normalizing backend failures.
///
/// Conflicts come back as `Ok(None)`, a lost lease as a plain `false` from
/// [`renew`](LeaseManager::renew); only transient store trouble surfaces as
/// an error, and the mutex treats that the same as "not acquired".
#[derive(Debug, Clone)]
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    key: LeaseKey,
    lease_duration: Duration,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, key: LeaseKey, lease_duration: Duration) -> Self {
        Self {
            store,
            key,
            lease_duration,
        }
    }

    pub fn key(&self) -> &LeaseKey {
        &self.key
    }

    /// One acquisition attempt. `Ok(None)` means the lease is held elsewhere.
    ///
    /// When the lease object does not exist yet it is created first, then
    /// acquisition is retried exactly once. Creation is idempotent, so losing
    /// a creation race to another process just turns into a conflict here.
    pub async fn try_acquire(&self) -> Result<Option<LeaseToken>> {
        match self.store.acquire(&self.key, self.lease_duration).await? {
            AcquireOutcome::Acquired(token) => Ok(Some(token)),
            AcquireOutcome::Held => Ok(None),
            AcquireOutcome::Missing => {
                debug!(key = %self.key, "lease object missing, creating it");
                self.store.create_if_missing(&self.key).await?;
                match self.store.acquire(&self.key, self.lease_duration).await? {
                    AcquireOutcome::Acquired(token) => Ok(Some(token)),
                    AcquireOutcome::Held => Ok(None),
                    AcquireOutcome::Missing => Err(Error::LeaseUnavailable {
                        key: self.key.clone(),
                    }),
                }
            }
        }
    }

    /// Single renewal attempt, never retried here. `false` means the lease is
    /// gone and everything downstream of it must stop.
    pub async fn renew(&self, token: &LeaseToken) -> bool {
        match self.store.renew(&self.key, token, self.lease_duration).await {
            Ok(()) => true,
            Err(err) => {
                debug!(key = %self.key, %err, "lease renewal failed");
                false
            }
        }
    }

    /// Best-effort release. Failures are logged, never returned: the lease
    /// self-expires regardless.
    pub async fn release(&self, token: &LeaseToken) {
        if let Err(err) = self.store.release(&self.key, token).await {
            warn!(key = %self.key, %err, "lease release failed; it will expire on its own");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLeaseStore;

    fn manager(store: &Arc<InMemoryLeaseStore>) -> LeaseManager {
        LeaseManager::new(
            store.clone(),
            LeaseKey::new("leader"),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn first_acquisition_creates_the_lease_object() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let token = manager(&store).try_acquire().await.unwrap();
        assert!(token.is_some());
    }

    #[tokio::test]
    async fn conflict_is_not_an_error() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let winner = manager(&store);
        let loser = manager(&store);

        assert!(winner.try_acquire().await.unwrap().is_some());
        assert!(loser.try_acquire().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn renew_reports_false_once_the_lease_expired() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let manager = manager(&store);
        let token = manager.try_acquire().await.unwrap().unwrap();

        assert!(manager.renew(&token).await);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!manager.renew(&token).await);
    }

    #[tokio::test]
    async fn release_swallows_store_failures() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let manager = manager(&store);
        let token = manager.try_acquire().await.unwrap().unwrap();

        manager.release(&token).await;
        // Double release hits a store error; it must stay silent.
        manager.release(&token).await;

        assert!(manager.try_acquire().await.unwrap().is_some());
    }
}
