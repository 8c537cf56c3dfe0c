//! Process-local storage backend.

use std::time::{Duration, Instant};

use dashmap::{DashMap, mapref::entry::Entry};

use crate::{Mutator, Store, StoreError};

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn live(value: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self { value: value.into(), expires_at: ttl.map(|t| Instant::now() + t) }
    }

    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// In-memory [`Store`] backed by a sharded concurrent map.
///
/// Per-entry locking through the map's entry API makes every mutating
/// operation atomic with respect to concurrent callers, which is what the
/// guard-counter and lock contracts require. Expired entries are treated as
/// absent and reaped lazily on access.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: DashMap<String, Slot>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.map.insert(key.to_owned(), Slot::live(value, None));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        // The read guard must drop before the reap below touches the
        // same shard.
        let (value, reap) = match self.map.get(key) {
            Some(slot) if slot.expired() => (None, true),
            Some(slot) => (Some(slot.value.clone()), false),
            None => (None, false),
        };
        if reap {
            let _ = self.map.remove_if(key, |_, slot| slot.expired());
        }
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.map.remove(key);
        Ok(())
    }

    async fn update(&self, key: &str, mutator: Mutator<'_>) -> Result<Option<String>, StoreError> {
        match self.map.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let current =
                    if occupied.get().expired() { None } else { Some(occupied.get().value.clone()) };
                match mutator(current.as_deref()) {
                    Some(next) => {
                        occupied.insert(Slot::live(next.clone(), None));
                        Ok(Some(next))
                    }
                    None => Ok(current),
                }
            }
            Entry::Vacant(vacant) => match mutator(None) {
                Some(next) => {
                    vacant.insert(Slot::live(next.clone(), None));
                    Ok(Some(next))
                }
                None => Ok(None),
            },
        }
    }

    async fn atomic_add(
        &self,
        key: &str,
        delta: i64,
        window: Option<Duration>,
    ) -> Result<i64, StoreError> {
        match self.map.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expired() {
                    occupied.insert(Slot::live(delta.to_string(), window));
                    return Ok(delta);
                }
                let current: i64 = occupied
                    .get()
                    .value
                    .parse()
                    .map_err(|_| StoreError::non_integer(key))?;
                let next = current + delta;
                let expires_at = occupied.get().expires_at;
                occupied.insert(Slot { value: next.to_string(), expires_at });
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::live(delta.to_string(), window));
                Ok(delta)
            }
        }
    }

    async fn acquire_lock(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        match self.map.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expired() {
                    occupied.insert(Slot::live(token, Some(ttl)));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::live(token, Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        Ok(self.map.remove_if(key, |_, slot| !slot.expired() && slot.value == token).is_some())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut out = Vec::new();
        for entry in &self.map {
            if entry.key().starts_with(prefix) && !entry.value().expired() {
                out.push((entry.key().clone(), entry.value().value.clone()));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn put_get_delete_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        store.put("k", "v").await?;
        assert_eq!(store.get("k").await?.as_deref(), Some("v"));
        store.delete("k").await?;
        assert_eq!(store.get("k").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn atomic_add_creates_and_accumulates() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        assert_eq!(store.atomic_add("c", 3, None).await?, 3);
        assert_eq!(store.atomic_add("c", -1, None).await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn atomic_add_is_race_free() -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.atomic_add("c", 1, None).await }));
        }
        for handle in handles {
            handle.await??;
        }
        assert_eq!(store.get("c").await?.as_deref(), Some("32"));
        Ok(())
    }

    #[tokio::test]
    async fn lock_excludes_second_holder() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);
        assert!(store.acquire_lock("lock:w", "a", ttl).await?);
        assert!(!store.acquire_lock("lock:w", "b", ttl).await?);
        // Foreign token cannot release.
        assert!(!store.release_lock("lock:w", "b").await?);
        assert!(store.release_lock("lock:w", "a").await?);
        assert!(store.acquire_lock("lock:w", "b", ttl).await?);
        Ok(())
    }

    #[tokio::test]
    async fn expired_lock_is_reacquirable() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        assert!(store.acquire_lock("lock:w", "a", Duration::from_millis(10)).await?);
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(store.acquire_lock("lock:w", "b", Duration::from_secs(5)).await?);
        // The stale token must no longer release.
        assert!(!store.release_lock("lock:w", "a").await?);
        Ok(())
    }

    #[tokio::test]
    async fn windowed_counter_expires() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        store.atomic_add("c", 5, Some(Duration::from_millis(10))).await?;
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(store.atomic_add("c", 1, Some(Duration::from_secs(60))).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn update_sees_current_and_writes_next() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        store.put("k", "1").await?;
        let next = store
            .update("k", &mut |cur| cur.map(|v| format!("{}!", v)))
            .await?;
        assert_eq!(next.as_deref(), Some("1!"));
        // Mutator returning None leaves the value alone.
        let unchanged = store.update("k", &mut |_| None).await?;
        assert_eq!(unchanged.as_deref(), Some("1!"));
        Ok(())
    }

    #[tokio::test]
    async fn scan_filters_by_prefix() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        store.put("ledger:1", "a").await?;
        store.put("ledger:2", "b").await?;
        store.put("intent:1", "c").await?;
        let mut keys: Vec<String> =
            store.scan("ledger:").await?.into_iter().map(|(k, _)| k).collect();
        keys.sort();
        assert_eq!(keys, vec!["ledger:1", "ledger:2"]);
        Ok(())
    }
}
