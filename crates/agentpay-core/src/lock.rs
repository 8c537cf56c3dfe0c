//! Per-wallet fund lock.
//!
//! Payments against one wallet serialize here. A payment acquires exactly
//! one wallet lock, so there is no lock ordering to get wrong.

use std::{sync::Arc, time::Duration};

use agentpay_store::Store;

use crate::error::Error;

/// Tunables for [`FundLock`].
#[derive(Debug, Clone)]
pub struct FundLockConfig {
    /// How long a held lock survives a crashed holder.
    pub ttl: Duration,
    /// Acquisition attempts before giving up.
    pub retries: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for FundLockConfig {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(30), retries: 3, backoff: Duration::from_millis(500) }
    }
}

fn lock_key(wallet_id: &str) -> String {
    format!("lock:{wallet_id}")
}

/// Per-wallet mutex with caller-owned release tokens.
///
/// Acquisition is not fair; starvation is mitigated only by the retry
/// count. Release succeeds only for the token the holder was given, so a
/// late caller can never unlock a lock re-acquired by someone else.
#[derive(Clone)]
pub struct FundLock {
    store: Arc<dyn Store>,
    config: FundLockConfig,
}

impl std::fmt::Debug for FundLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FundLock").field("config", &self.config).finish_non_exhaustive()
    }
}

impl FundLock {
    /// Creates a lock manager with default tunables.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_config(store, FundLockConfig::default())
    }

    /// Creates a lock manager with explicit tunables.
    pub fn with_config(store: Arc<dyn Store>, config: FundLockConfig) -> Self {
        Self { store, config }
    }

    /// Try to lock `wallet_id`, returning the holder token, or `None`
    /// when every attempt found the lock held.
    pub async fn acquire(&self, wallet_id: &str) -> Result<Option<String>, Error> {
        let key = lock_key(wallet_id);
        let token = uuid::Uuid::new_v4().to_string();
        for attempt in 0..self.config.retries.max(1) {
            if self.store.acquire_lock(&key, &token, self.config.ttl).await? {
                tracing::debug!(wallet = wallet_id, "fund lock acquired");
                return Ok(Some(token));
            }
            if attempt + 1 < self.config.retries.max(1) {
                tokio::time::sleep(self.config.backoff).await;
            }
        }
        tracing::debug!(wallet = wallet_id, "fund lock busy");
        Ok(None)
    }

    /// Unlock `wallet_id` iff `token` is the current holder.
    pub async fn release_with_key(&self, wallet_id: &str, token: &str) -> Result<bool, Error> {
        Ok(self.store.release_lock(&lock_key(wallet_id), token).await?)
    }
}

#[cfg(test)]
mod tests {
    use agentpay_store::MemoryStore;

    use super::*;

    fn quick() -> FundLockConfig {
        FundLockConfig {
            ttl: Duration::from_secs(5),
            retries: 2,
            backoff: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn one_holder_at_a_time() -> Result<(), Box<dyn std::error::Error>> {
        let lock = FundLock::with_config(Arc::new(MemoryStore::new()), quick());
        let token = lock.acquire("w-1").await?.ok_or("expected token")?;
        assert!(lock.acquire("w-1").await?.is_none());
        assert!(lock.release_with_key("w-1", &token).await?);
        assert!(lock.acquire("w-1").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn foreign_token_never_releases() -> Result<(), Box<dyn std::error::Error>> {
        let lock = FundLock::with_config(Arc::new(MemoryStore::new()), quick());
        let _token = lock.acquire("w-1").await?.ok_or("expected token")?;
        assert!(!lock.release_with_key("w-1", "not-the-token").await?);
        assert!(lock.acquire("w-1").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn ttl_expiry_frees_the_wallet() -> Result<(), Box<dyn std::error::Error>> {
        let config = FundLockConfig {
            ttl: Duration::from_millis(10),
            retries: 1,
            backoff: Duration::from_millis(1),
        };
        let lock = FundLock::with_config(Arc::new(MemoryStore::new()), config);
        let stale = lock.acquire("w-1").await?.ok_or("expected token")?;
        tokio::time::sleep(Duration::from_millis(25)).await;
        let fresh = lock.acquire("w-1").await?;
        assert!(fresh.is_some());
        // The stale holder must not release the new holder's lock.
        assert!(!lock.release_with_key("w-1", &stale).await?);
        Ok(())
    }

    #[tokio::test]
    async fn distinct_wallets_do_not_contend() -> Result<(), Box<dyn std::error::Error>> {
        let lock = FundLock::with_config(Arc::new(MemoryStore::new()), quick());
        assert!(lock.acquire("w-1").await?.is_some());
        assert!(lock.acquire("w-2").await?.is_some());
        Ok(())
    }
}
