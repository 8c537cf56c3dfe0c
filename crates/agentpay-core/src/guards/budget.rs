//! Windowed spending caps.

use std::time::Duration;

use agentpay_store::Store;
use chrono::Utc;

use super::{GuardContext, GuardDecision, GuardToken};
use crate::{error::Error, models::Amount};

const DAY_SECS: i64 = 86_400;
const HOUR_SECS: i64 = 3_600;
const LOCK_TTL: Duration = Duration::from_secs(5);
const LOCK_ATTEMPTS: u32 = 40;
const LOCK_BACKOFF: Duration = Duration::from_millis(25);

/// Spending caps over rolling time windows.
///
/// Windows are time-based, not calendar-based: "daily" means the last
/// 86,400 seconds. Reservation serializes on a per-scope lock key so the
/// limit test and the usage record are one atomic step, on any backend.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetGuard {
    /// Cap over the last 24 hours.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_limit: Option<Amount>,
    /// Cap over the last hour.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hourly_limit: Option<Amount>,
    /// Cap over the wallet's lifetime.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifetime_limit: Option<Amount>,
}

/// One reserved-or-committed spend inside the rolling window.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct WindowEntry {
    id: String,
    at: i64,
    amount: Amount,
}

fn window_key(scope: &str) -> String {
    format!("budget:{scope}:window")
}

fn lifetime_key(scope: &str) -> String {
    format!("budget:{scope}:lifetime")
}

fn lock_key(scope: &str) -> String {
    format!("budget:{scope}:lock")
}

fn sum(mut entries: impl Iterator<Item = Amount>) -> Result<Amount, Error> {
    entries.try_fold(Amount::ZERO, |acc, a| {
        acc.checked_add(a).ok_or_else(|| Error::Validation("budget total overflow".to_owned()))
    })
}

impl BudgetGuard {
    /// A guard with only a 24h cap.
    pub const fn daily(limit: Amount) -> Self {
        Self { daily_limit: Some(limit), hourly_limit: None, lifetime_limit: None }
    }

    async fn load_window(
        &self,
        store: &dyn Store,
        scope: &str,
        now: i64,
    ) -> Result<Vec<WindowEntry>, Error> {
        let key = window_key(scope);
        let mut entries: Vec<WindowEntry> = match store.get(&key).await? {
            Some(json) => serde_json::from_str(&json).map_err(|e| {
                Error::Storage(agentpay_store::StoreError::Corrupt { key, reason: e.to_string() })
            })?,
            None => Vec::new(),
        };
        entries.retain(|e| e.at > now - DAY_SECS);
        Ok(entries)
    }

    async fn lifetime_spent(&self, store: &dyn Store, scope: &str) -> Result<Amount, Error> {
        match store.get(&lifetime_key(scope)).await? {
            Some(text) => Amount::parse(&text),
            None => Ok(Amount::ZERO),
        }
    }

    fn over_cap(
        &self,
        label: &str,
        spent: Amount,
        amount: Amount,
        limit: Amount,
    ) -> Option<String> {
        let projected = spent.checked_add(amount)?;
        if projected > limit {
            Some(format!("{label} budget exceeded: {spent} spent of {limit}, requested {amount}"))
        } else {
            None
        }
    }

    fn evaluate(
        &self,
        entries: &[WindowEntry],
        lifetime_spent: Amount,
        amount: Amount,
        now: i64,
    ) -> Result<(), String> {
        if let Some(limit) = self.daily_limit {
            let spent = sum(entries.iter().map(|e| e.amount)).map_err(|e| e.to_string())?;
            if let Some(reason) = self.over_cap("daily", spent, amount, limit) {
                return Err(reason);
            }
        }
        if let Some(limit) = self.hourly_limit {
            let spent =
                sum(entries.iter().filter(|e| e.at > now - HOUR_SECS).map(|e| e.amount))
                    .map_err(|e| e.to_string())?;
            if let Some(reason) = self.over_cap("hourly", spent, amount, limit) {
                return Err(reason);
            }
        }
        if let Some(limit) = self.lifetime_limit {
            if let Some(reason) = self.over_cap("lifetime", lifetime_spent, amount, limit) {
                return Err(reason);
            }
        }
        Ok(())
    }

    /// Read-only cap check, for simulation.
    pub async fn check(
        &self,
        store: &dyn Store,
        scope: &str,
        ctx: &GuardContext,
    ) -> Result<GuardDecision, Error> {
        let now = Utc::now().timestamp();
        let entries = self.load_window(store, scope, now).await?;
        let lifetime = self.lifetime_spent(store, scope).await?;
        Ok(match self.evaluate(&entries, lifetime, ctx.amount, now) {
            Ok(()) => GuardDecision::allow(),
            Err(reason) => GuardDecision::block(reason),
        })
    }

    /// Atomically test all caps and record the amount as pending usage.
    pub async fn reserve(
        &self,
        store: &dyn Store,
        scope: &str,
        ctx: &GuardContext,
    ) -> Result<GuardToken, Error> {
        let lock_token = uuid::Uuid::new_v4().to_string();
        self.acquire_scope_lock(store, scope, &lock_token).await?;
        let result = self.reserve_locked(store, scope, ctx).await;
        let _ = store.release_lock(&lock_key(scope), &lock_token).await;
        result
    }

    async fn acquire_scope_lock(
        &self,
        store: &dyn Store,
        scope: &str,
        token: &str,
    ) -> Result<(), Error> {
        let key = lock_key(scope);
        for _ in 0..LOCK_ATTEMPTS {
            if store.acquire_lock(&key, token, LOCK_TTL).await? {
                return Ok(());
            }
            tokio::time::sleep(LOCK_BACKOFF).await;
        }
        Err(Error::Network(format!("budget state contention for {scope}")))
    }

    async fn reserve_locked(
        &self,
        store: &dyn Store,
        scope: &str,
        ctx: &GuardContext,
    ) -> Result<GuardToken, Error> {
        let now = Utc::now().timestamp();
        let mut entries = self.load_window(store, scope, now).await?;
        let lifetime = self.lifetime_spent(store, scope).await?;
        if let Err(reason) = self.evaluate(&entries, lifetime, ctx.amount, now) {
            return Err(Error::GuardBlocked { guard: "budget".to_owned(), reason });
        }
        let entry_id = uuid::Uuid::new_v4().to_string();
        entries.push(WindowEntry { id: entry_id.clone(), at: now, amount: ctx.amount });
        let json = serde_json::to_string(&entries)
            .map_err(|e| Error::Validation(format!("unserializable budget window: {e}")))?;
        store.put(&window_key(scope), &json).await?;
        let next_lifetime = lifetime
            .checked_add(ctx.amount)
            .ok_or_else(|| Error::Validation("budget total overflow".to_owned()))?;
        store.put(&lifetime_key(scope), &next_lifetime.to_string()).await?;
        Ok(GuardToken::Budget { scope: scope.to_owned(), entry_id, amount: ctx.amount })
    }

    /// Reverse a pending reservation.
    pub async fn release(
        &self,
        store: &dyn Store,
        scope: &str,
        entry_id: &str,
        amount: Amount,
    ) -> Result<(), Error> {
        let lock_token = uuid::Uuid::new_v4().to_string();
        self.acquire_scope_lock(store, scope, &lock_token).await?;
        let result = self.release_locked(store, scope, entry_id, amount).await;
        let _ = store.release_lock(&lock_key(scope), &lock_token).await;
        result
    }

    async fn release_locked(
        &self,
        store: &dyn Store,
        scope: &str,
        entry_id: &str,
        amount: Amount,
    ) -> Result<(), Error> {
        let now = Utc::now().timestamp();
        let mut entries = self.load_window(store, scope, now).await?;
        entries.retain(|e| e.id != entry_id);
        let json = serde_json::to_string(&entries)
            .map_err(|e| Error::Validation(format!("unserializable budget window: {e}")))?;
        store.put(&window_key(scope), &json).await?;
        let lifetime = self.lifetime_spent(store, scope).await?;
        store.put(&lifetime_key(scope), &lifetime.saturating_sub(amount).to_string()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use agentpay_store::MemoryStore;

    use super::*;

    fn ctx(amount: &str) -> Result<GuardContext, Box<dyn std::error::Error>> {
        Ok(GuardContext {
            wallet_id: "w-1".to_owned(),
            wallet_set_id: None,
            recipient: "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_owned(),
            amount: Amount::parse(amount)?,
            purpose: None,
        })
    }

    #[tokio::test]
    async fn reserve_counts_against_daily_cap() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        let guard = BudgetGuard::daily(Amount::parse("50")?);
        guard.reserve(&store, "w-1", &ctx("25")?).await?;
        guard.reserve(&store, "w-1", &ctx("25")?).await?;
        let err = guard.reserve(&store, "w-1", &ctx("0.01")?).await.err().ok_or("expected")?;
        assert_eq!(err.kind(), "guard_blocked");
        Ok(())
    }

    #[tokio::test]
    async fn release_restores_headroom() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        let guard = BudgetGuard::daily(Amount::parse("50")?);
        let token = guard.reserve(&store, "w-1", &ctx("50")?).await?;
        let GuardToken::Budget { scope, entry_id, amount } = token else {
            return Err("wrong token kind".into());
        };
        guard.release(&store, &scope, &entry_id, amount).await?;
        guard.reserve(&store, "w-1", &ctx("50")?).await?;
        Ok(())
    }

    #[tokio::test]
    async fn lifetime_cap_survives_window_pruning() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        let guard = BudgetGuard {
            daily_limit: None,
            hourly_limit: None,
            lifetime_limit: Some(Amount::parse("40")?),
        };
        guard.reserve(&store, "w-1", &ctx("30")?).await?;
        let err = guard.reserve(&store, "w-1", &ctx("20")?).await.err().ok_or("expected")?;
        assert_eq!(err.kind(), "guard_blocked");
        guard.reserve(&store, "w-1", &ctx("10")?).await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reserves_admit_exactly_floor() -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(MemoryStore::new());
        let guard = Arc::new(BudgetGuard::daily(Amount::parse("50")?));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = Arc::clone(&store);
            let guard = Arc::clone(&guard);
            handles.push(tokio::spawn(async move {
                let ctx = GuardContext {
                    wallet_id: "w-1".to_owned(),
                    wallet_set_id: None,
                    recipient: "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_owned(),
                    amount: Amount::parse("10")?,
                    purpose: None,
                };
                guard.reserve(store.as_ref(), "w-1", &ctx).await.map(|_| ())
            }));
        }
        let mut admitted = 0;
        let mut blocked = 0;
        for handle in handles {
            match handle.await? {
                Ok(()) => admitted += 1,
                Err(err) => {
                    assert_eq!(err.kind(), "guard_blocked");
                    blocked += 1;
                }
            }
        }
        assert_eq!(admitted, 5);
        assert_eq!(blocked, 5);
        Ok(())
    }
}
