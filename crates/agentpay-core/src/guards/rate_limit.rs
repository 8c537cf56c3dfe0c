//! Windowed payment-count caps.

use std::time::Duration;

use agentpay_store::Store;
use chrono::Utc;

use super::{GuardContext, GuardDecision, GuardToken};
use crate::error::Error;

/// Payment-count caps per minute, hour, and day.
///
/// Counters live in bucketed keys (`rate:{scope}:{unit}:{bucket}`) so old
/// buckets expire on their own. Reservation is increment-then-check: the
/// bump and the read-back are one atomic step, and overshoot rolls back.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitGuard {
    /// Max payments per minute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_minute: Option<u32>,
    /// Max payments per hour.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_hour: Option<u32>,
    /// Max payments per day.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_day: Option<u32>,
}

impl RateLimitGuard {
    /// A guard with only a per-minute cap.
    pub const fn minutely(cap: u32) -> Self {
        Self { per_minute: Some(cap), per_hour: None, per_day: None }
    }

    fn units(&self) -> Vec<(&'static str, i64, u32)> {
        let mut units = Vec::new();
        if let Some(cap) = self.per_minute {
            units.push(("minute", 60, cap));
        }
        if let Some(cap) = self.per_hour {
            units.push(("hour", 3_600, cap));
        }
        if let Some(cap) = self.per_day {
            units.push(("day", 86_400, cap));
        }
        units
    }

    fn bucket_key(scope: &str, unit: &str, span: i64, now: i64) -> String {
        let bucket = now / span;
        format!("rate:{scope}:{unit}:{bucket}")
    }

    /// Read-only cap check, for simulation.
    pub async fn check(
        &self,
        store: &dyn Store,
        scope: &str,
        _ctx: &GuardContext,
    ) -> Result<GuardDecision, Error> {
        let now = Utc::now().timestamp();
        for (unit, span, cap) in self.units() {
            let key = Self::bucket_key(scope, unit, span, now);
            let count: i64 = match store.get(&key).await? {
                Some(text) => text.parse().unwrap_or(0),
                None => 0,
            };
            if count + 1 > i64::from(cap) {
                return Ok(GuardDecision::block(format!(
                    "per-{unit} rate limit exceeded ({count} of {cap})"
                )));
            }
        }
        Ok(GuardDecision::allow())
    }

    /// Atomically count this payment against every configured bucket.
    pub async fn reserve(
        &self,
        store: &dyn Store,
        scope: &str,
        _ctx: &GuardContext,
    ) -> Result<GuardToken, Error> {
        let now = Utc::now().timestamp();
        let mut incremented: Vec<String> = Vec::new();
        for (unit, span, cap) in self.units() {
            let key = Self::bucket_key(scope, unit, span, now);
            let window = Duration::from_secs((span * 2) as u64);
            let post = store.atomic_add(&key, 1, Some(window)).await?;
            incremented.push(key);
            if post > i64::from(cap) {
                for key in &incremented {
                    let _ = store.atomic_add(key, -1, None).await;
                }
                return Err(Error::GuardBlocked {
                    guard: "rate_limit".to_owned(),
                    reason: format!("per-{unit} rate limit exceeded ({cap})"),
                });
            }
        }
        Ok(GuardToken::Rate { keys: incremented })
    }

    /// Reverse a pending reservation by decrementing its buckets.
    pub async fn release(&self, store: &dyn Store, keys: &[String]) -> Result<(), Error> {
        for key in keys {
            store.atomic_add(key, -1, None).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use agentpay_store::MemoryStore;

    use super::*;
    use crate::models::Amount;

    fn ctx() -> Result<GuardContext, Box<dyn std::error::Error>> {
        Ok(GuardContext {
            wallet_id: "w-1".to_owned(),
            wallet_set_id: None,
            recipient: "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_owned(),
            amount: Amount::parse("1")?,
            purpose: None,
        })
    }

    #[tokio::test]
    async fn caps_at_configured_count() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        let guard = RateLimitGuard::minutely(2);
        guard.reserve(&store, "w-1", &ctx()?).await?;
        guard.reserve(&store, "w-1", &ctx()?).await?;
        let err = guard.reserve(&store, "w-1", &ctx()?).await.err().ok_or("expected")?;
        assert_eq!(err.kind(), "guard_blocked");
        Ok(())
    }

    #[tokio::test]
    async fn release_reopens_the_bucket() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        let guard = RateLimitGuard::minutely(1);
        let GuardToken::Rate { keys } = guard.reserve(&store, "w-1", &ctx()?).await? else {
            return Err("wrong token kind".into());
        };
        guard.release(&store, &keys).await?;
        guard.reserve(&store, "w-1", &ctx()?).await?;
        Ok(())
    }

    #[tokio::test]
    async fn check_reads_without_counting() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        let guard = RateLimitGuard::minutely(1);
        assert!(guard.check(&store, "w-1", &ctx()?).await?.allowed);
        assert!(guard.check(&store, "w-1", &ctx()?).await?.allowed);
        guard.reserve(&store, "w-1", &ctx()?).await?;
        assert!(!guard.check(&store, "w-1", &ctx()?).await?.allowed);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reserves_never_overshoot() -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(MemoryStore::new());
        let guard = Arc::new(RateLimitGuard::minutely(3));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let guard = Arc::clone(&guard);
            handles.push(tokio::spawn(async move {
                let ctx = GuardContext {
                    wallet_id: "w-1".to_owned(),
                    wallet_set_id: None,
                    recipient: "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_owned(),
                    amount: Amount::parse("1")?,
                    purpose: None,
                };
                guard.reserve(store.as_ref(), "w-1", &ctx).await.map(|_| ())
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await?.is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
        Ok(())
    }
}
