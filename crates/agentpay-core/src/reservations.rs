//! Fund reservations held by open payment intents.
//!
//! Separate from guard reservations: this registry tracks amounts, not
//! counters, so the pipeline can compute
//! `available = balance - total reserved` per wallet.

use std::{sync::Arc, time::Duration};

use agentpay_store::Store;

use crate::{error::Error, models::Amount};

const LOCK_TTL: Duration = Duration::from_secs(5);
const LOCK_ATTEMPTS: u32 = 40;
const LOCK_BACKOFF: Duration = Duration::from_millis(25);

fn reservation_key(intent_id: &str) -> String {
    format!("reservation:{intent_id}")
}

fn total_key(wallet_id: &str) -> String {
    format!("reservation_total:{wallet_id}")
}

fn wallet_lock_key(wallet_id: &str) -> String {
    format!("reservation_lock:{wallet_id}")
}

/// One held reservation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct Reservation {
    wallet_id: String,
    amount: Amount,
}

/// Registry of per-intent fund reservations with a per-wallet aggregate.
///
/// The per-intent entry and the wallet aggregate are kept consistent by
/// serializing mutations on a per-wallet lock key.
#[derive(Clone)]
pub struct ReservationRegistry {
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for ReservationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationRegistry").finish_non_exhaustive()
    }
}

impl ReservationRegistry {
    /// Creates a registry over `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn lock_wallet(&self, wallet_id: &str) -> Result<(String, String), Error> {
        let key = wallet_lock_key(wallet_id);
        let token = uuid::Uuid::new_v4().to_string();
        for _ in 0..LOCK_ATTEMPTS {
            if self.store.acquire_lock(&key, &token, LOCK_TTL).await? {
                return Ok((key, token));
            }
            tokio::time::sleep(LOCK_BACKOFF).await;
        }
        Err(Error::Network(format!("reservation contention for {wallet_id}")))
    }

    /// Hold `amount` against `wallet_id` for `intent_id`.
    ///
    /// Idempotent: re-reserving an intent id that already holds a
    /// reservation is a no-op.
    pub async fn reserve(
        &self,
        wallet_id: &str,
        amount: Amount,
        intent_id: &str,
    ) -> Result<(), Error> {
        let (lock_key, lock_token) = self.lock_wallet(wallet_id).await?;
        let result = self.reserve_locked(wallet_id, amount, intent_id).await;
        let _ = self.store.release_lock(&lock_key, &lock_token).await;
        result
    }

    async fn reserve_locked(
        &self,
        wallet_id: &str,
        amount: Amount,
        intent_id: &str,
    ) -> Result<(), Error> {
        let entry_key = reservation_key(intent_id);
        if self.store.get(&entry_key).await?.is_some() {
            return Ok(());
        }
        let reservation = Reservation { wallet_id: wallet_id.to_owned(), amount };
        let json = serde_json::to_string(&reservation)
            .map_err(|e| Error::Validation(format!("unserializable reservation: {e}")))?;
        self.store.put(&entry_key, &json).await?;
        let aggregate_key = total_key(wallet_id);
        let total = read_total(self.store.as_ref(), &aggregate_key).await?;
        let next = total
            .checked_add(amount)
            .ok_or_else(|| Error::Validation("reservation total overflow".to_owned()))?;
        self.store.put(&aggregate_key, &next.to_string()).await?;
        Ok(())
    }

    /// Release the reservation held by `intent_id`, if any. Unknown ids
    /// are a no-op.
    pub async fn release(&self, intent_id: &str) -> Result<(), Error> {
        let entry_key = reservation_key(intent_id);
        let Some(json) = self.store.get(&entry_key).await? else {
            return Ok(());
        };
        let reservation: Reservation = serde_json::from_str(&json).map_err(|e| {
            Error::Storage(agentpay_store::StoreError::Corrupt {
                key: entry_key.clone(),
                reason: e.to_string(),
            })
        })?;
        let (lock_key, lock_token) = self.lock_wallet(&reservation.wallet_id).await?;
        let result = self.release_locked(&entry_key, &reservation).await;
        let _ = self.store.release_lock(&lock_key, &lock_token).await;
        result
    }

    async fn release_locked(
        &self,
        entry_key: &str,
        reservation: &Reservation,
    ) -> Result<(), Error> {
        // Re-check under the lock; a concurrent release may have won.
        if self.store.get(entry_key).await?.is_none() {
            return Ok(());
        }
        self.store.delete(entry_key).await?;
        let aggregate_key = total_key(&reservation.wallet_id);
        let total = read_total(self.store.as_ref(), &aggregate_key).await?;
        self.store
            .put(&aggregate_key, &total.saturating_sub(reservation.amount).to_string())
            .await?;
        Ok(())
    }

    /// Total amount currently reserved against `wallet_id`.
    pub async fn total_for(&self, wallet_id: &str) -> Result<Amount, Error> {
        read_total(self.store.as_ref(), &total_key(wallet_id)).await
    }

    /// Amount held by one intent, when it holds one.
    pub async fn amount_for(&self, intent_id: &str) -> Result<Option<Amount>, Error> {
        let key = reservation_key(intent_id);
        match self.store.get(&key).await? {
            Some(json) => {
                let reservation: Reservation = serde_json::from_str(&json).map_err(|e| {
                    Error::Storage(agentpay_store::StoreError::Corrupt {
                        key,
                        reason: e.to_string(),
                    })
                })?;
                Ok(Some(reservation.amount))
            }
            None => Ok(None),
        }
    }
}

async fn read_total(store: &dyn Store, key: &str) -> Result<Amount, Error> {
    match store.get(key).await? {
        Some(text) => Amount::parse(&text),
        None => Ok(Amount::ZERO),
    }
}
