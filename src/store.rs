use crate::{error::Result, Error, LeaseKey};
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Opaque proof of lease ownership, required for renew and release calls.
///
/// A token is owned exclusively by the mutex instance that acquired it and
/// is never reused across holding periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct LeaseToken(pub Uuid);

impl LeaseToken {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Three-way outcome of an acquisition attempt against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The lease is ours for the requested duration.
    Acquired(LeaseToken),
    /// The lease is currently held by someone else. Expected, not an error.
    Held,
    /// The lease object does not exist in the store yet.
    Missing,
}

/// External lease arbiter.
///
/// Implementations must guarantee that at most one valid [`LeaseToken`]
/// exists for a given key at any instant, and that an expired, un-renewed
/// lease becomes acquirable by others.
#[async_trait]
pub trait LeaseStore: Send + Sync + std::fmt::Debug {
    async fn acquire(&self, key: &LeaseKey, duration: Duration) -> Result<AcquireOutcome>;

    /// Extend the current holder's lease by `duration` from now. Fails with
    /// [`Error::LeaseLost`] when `token` no longer owns the lease.
    async fn renew(&self, key: &LeaseKey, token: &LeaseToken, duration: Duration) -> Result<()>;

    /// Give the lease up early. Callers treat failures as noise; the lease
    /// expires on its own either way.
    async fn release(&self, key: &LeaseKey, token: &LeaseToken) -> Result<()>;

    /// Create the lease object if absent. Idempotent; losing a creation race
    /// to another process must not be an error.
    async fn create_if_missing(&self, key: &LeaseKey) -> Result<()>;
}

#[derive(Debug)]
struct Holder {
    token: LeaseToken,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct LeaseRecord {
    holder: Option<Holder>,
}

/// In-process [`LeaseStore`] backed by a concurrent map.
///
/// All competing mutex instances must share one store via `Arc` for it to
/// arbitrate between them. Expiry uses the tokio clock, so tests running
/// under a paused runtime control it directly.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    records: DashMap<LeaseKey, LeaseRecord>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn acquire(&self, key: &LeaseKey, duration: Duration) -> Result<AcquireOutcome> {
        let Some(mut record) = self.records.get_mut(key) else {
            return Ok(AcquireOutcome::Missing);
        };
        let now = Instant::now();
        match &record.holder {
            Some(holder) if holder.expires_at > now => Ok(AcquireOutcome::Held),
            _ => {
                let token = LeaseToken::generate();
                record.holder = Some(Holder {
                    token,
                    expires_at: now + duration,
                });
                Ok(AcquireOutcome::Acquired(token))
            }
        }
    }

    async fn renew(&self, key: &LeaseKey, token: &LeaseToken, duration: Duration) -> Result<()> {
        let mut record = self.records.get_mut(key).ok_or_else(|| Error::LeaseLost {
            key: key.clone(),
        })?;
        let now = Instant::now();
        match &mut record.holder {
            Some(holder) if holder.token == *token && holder.expires_at > now => {
                holder.expires_at = now + duration;
                Ok(())
            }
            _ => Err(Error::LeaseLost { key: key.clone() }),
        }
    }

    async fn release(&self, key: &LeaseKey, token: &LeaseToken) -> Result<()> {
        let mut record = self.records.get_mut(key).ok_or_else(|| Error::LeaseLost {
            key: key.clone(),
        })?;
        match &record.holder {
            Some(holder) if holder.token == *token => {
                record.holder = None;
                Ok(())
            }
            _ => Err(Error::LeaseLost { key: key.clone() }),
        }
    }

    async fn create_if_missing(&self, key: &LeaseKey) -> Result<()> {
        // entry() keeps an existing record (and its holder) intact.
        self.records.entry(key.clone()).or_default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn key() -> LeaseKey {
        LeaseKey::new("test-resource")
    }

    #[tokio::test]
    async fn acquire_reports_missing_until_created() {
        let store = InMemoryLeaseStore::new();
        let outcome = store.acquire(&key(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Missing);

        store.create_if_missing(&key()).await.unwrap();
        let outcome = store.acquire(&key(), Duration::from_secs(60)).await.unwrap();
        assert!(matches!(outcome, AcquireOutcome::Acquired(_)));

        // Second acquisition while held conflicts.
        let outcome = store.acquire(&key(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Held);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_becomes_acquirable() {
        let store = InMemoryLeaseStore::new();
        store.create_if_missing(&key()).await.unwrap();
        let AcquireOutcome::Acquired(old) =
            store.acquire(&key(), Duration::from_secs(60)).await.unwrap()
        else {
            panic!("expected acquisition");
        };

        tokio::time::advance(Duration::from_secs(61)).await;

        let outcome = store.acquire(&key(), Duration::from_secs(60)).await.unwrap();
        let AcquireOutcome::Acquired(new) = outcome else {
            panic!("expired lease should be acquirable, got {outcome:?}");
        };
        assert_ne!(old, new);

        // The stale token can no longer renew.
        let err = store.renew(&key(), &old, Duration::from_secs(60)).await;
        assert!(matches!(err, Err(Error::LeaseLost { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_extends_expiry() {
        let store = InMemoryLeaseStore::new();
        store.create_if_missing(&key()).await.unwrap();
        let AcquireOutcome::Acquired(token) =
            store.acquire(&key(), Duration::from_secs(60)).await.unwrap()
        else {
            panic!("expected acquisition");
        };

        tokio::time::advance(Duration::from_secs(50)).await;
        store.renew(&key(), &token, Duration::from_secs(60)).await.unwrap();

        // 100s after acquisition, but only 50s after renewal: still held.
        tokio::time::advance(Duration::from_secs(50)).await;
        let outcome = store.acquire(&key(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Held);
    }

    #[tokio::test]
    async fn release_frees_the_lease_for_the_owner_only() {
        let store = InMemoryLeaseStore::new();
        store.create_if_missing(&key()).await.unwrap();
        let AcquireOutcome::Acquired(token) =
            store.acquire(&key(), Duration::from_secs(60)).await.unwrap()
        else {
            panic!("expected acquisition");
        };

        // A stale or foreign token cannot release.
        let stranger = LeaseToken::generate();
        assert!(store.release(&key(), &stranger).await.is_err());
        assert_eq!(
            store.acquire(&key(), Duration::from_secs(60)).await.unwrap(),
            AcquireOutcome::Held
        );

        store.release(&key(), &token).await.unwrap();
        let outcome = store.acquire(&key(), Duration::from_secs(60)).await.unwrap();
        assert!(matches!(outcome, AcquireOutcome::Acquired(_)));
    }

    #[tokio::test]
    async fn create_if_missing_never_clobbers_a_holder() {
        let store = InMemoryLeaseStore::new();
        store.create_if_missing(&key()).await.unwrap();
        let AcquireOutcome::Acquired(token) =
            store.acquire(&key(), Duration::from_secs(60)).await.unwrap()
        else {
            panic!("expected acquisition");
        };

        store.create_if_missing(&key()).await.unwrap();
        assert_ok!(store.renew(&key(), &token, Duration::from_secs(60)).await);
    }
}
