//! Append-only audit ledger.
//!
//! Every payment attempt is recorded here *before* any side effect on an
//! external system, so partial failures can always be reconstructed.

use std::{collections::BTreeMap, sync::Arc};

use agentpay_store::Store;
use chrono::Utc;

use crate::{
    error::Error,
    models::{LedgerEntry, LedgerFilter, PaymentStatus, TransportMethod},
};

const KEY_PREFIX: &str = "ledger:";
const DEFAULT_QUERY_LIMIT: usize = 100;

fn entry_key(id: &str) -> String {
    format!("{KEY_PREFIX}{id}")
}

/// Audit ledger over the storage abstraction.
#[derive(Clone)]
pub struct AuditLedger {
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for AuditLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLedger").finish_non_exhaustive()
    }
}

impl AuditLedger {
    /// Creates a ledger over `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Record a new entry. The entry id must be fresh.
    pub async fn record(&self, entry: &LedgerEntry) -> Result<(), Error> {
        let json = serde_json::to_string(entry)
            .map_err(|e| Error::Validation(format!("unserializable ledger entry: {e}")))?;
        self.store.put(&entry_key(&entry.id), &json).await?;
        tracing::debug!(entry = %entry.id, wallet = %entry.wallet_id, "ledger entry recorded");
        Ok(())
    }

    /// Fetch one entry.
    pub async fn get(&self, id: &str) -> Result<Option<LedgerEntry>, Error> {
        match self.store.get(&entry_key(id)).await? {
            Some(json) => Ok(Some(parse_entry(id, &json)?)),
            None => Ok(None),
        }
    }

    /// Move an entry to `status`, optionally learning the transport
    /// method, transaction identifiers, and a metadata merge.
    ///
    /// Transitions are monotonic: once terminal, an entry is write-once and
    /// further updates are rejected.
    pub async fn update_status(
        &self,
        id: &str,
        status: PaymentStatus,
        method: Option<TransportMethod>,
        provider_tx_id: Option<&str>,
        tx_hash: Option<&str>,
        metadata_delta: Option<&BTreeMap<String, String>>,
    ) -> Result<LedgerEntry, Error> {
        let key = entry_key(id);
        let mut found = false;
        let mut already_terminal = false;
        let updated = self
            .store
            .update(&key, &mut |current| {
                let Some(json) = current else {
                    return None;
                };
                found = true;
                let Ok(mut entry) = serde_json::from_str::<LedgerEntry>(json) else {
                    return None;
                };
                if entry.status.is_terminal() {
                    already_terminal = true;
                    return None;
                }
                entry.status = status;
                if let Some(method) = method {
                    entry.method = Some(method);
                }
                if let Some(tx) = provider_tx_id {
                    entry.provider_tx_id = Some(tx.to_owned());
                }
                if let Some(hash) = tx_hash {
                    entry.tx_hash = Some(hash.to_owned());
                }
                if let Some(delta) = metadata_delta {
                    for (k, v) in delta {
                        entry.metadata.insert(k.clone(), v.clone());
                    }
                }
                entry.updated_at = Utc::now();
                serde_json::to_string(&entry).ok()
            })
            .await?;
        if !found {
            return Err(Error::Validation(format!("no ledger entry {id}")));
        }
        if already_terminal {
            return Err(Error::Validation(format!("ledger entry {id} is already terminal")));
        }
        let json = updated
            .ok_or_else(|| Error::Validation(format!("ledger entry {id} failed to update")))?;
        parse_entry(id, &json)
    }

    /// Query entries, newest first, capped at the filter's limit
    /// (default 100).
    pub async fn query(&self, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>, Error> {
        let limit = filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        let mut entries = Vec::new();
        for (key, json) in self.store.scan(KEY_PREFIX).await? {
            let entry = parse_entry(key.trim_start_matches(KEY_PREFIX), &json)?;
            if filter.matches(&entry) {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(limit);
        Ok(entries)
    }
}

fn parse_entry(id: &str, json: &str) -> Result<LedgerEntry, Error> {
    serde_json::from_str(json).map_err(|e| {
        Error::Storage(agentpay_store::StoreError::Corrupt {
            key: entry_key(id),
            reason: e.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use agentpay_store::MemoryStore;

    use super::*;
    use crate::models::{Amount, TransportMethod};

    fn pending_entry(id: &str, wallet: &str) -> Result<LedgerEntry, Box<dyn std::error::Error>> {
        Ok(LedgerEntry {
            id: id.to_owned(),
            wallet_id: wallet.to_owned(),
            wallet_set_id: None,
            recipient: "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_owned(),
            amount: Amount::parse("10")?,
            status: PaymentStatus::Pending,
            method: Some(TransportMethod::Transfer),
            provider_tx_id: None,
            tx_hash: None,
            guards_passed: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            purpose: None,
            metadata: BTreeMap::new(),
        })
    }

    #[tokio::test]
    async fn record_then_get() -> Result<(), Box<dyn std::error::Error>> {
        let ledger = AuditLedger::new(Arc::new(MemoryStore::new()));
        let entry = pending_entry("le-1", "w-1")?;
        ledger.record(&entry).await?;
        let got = ledger.get("le-1").await?.ok_or("missing")?;
        assert_eq!(got.status, PaymentStatus::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn terminal_entries_are_write_once() -> Result<(), Box<dyn std::error::Error>> {
        let ledger = AuditLedger::new(Arc::new(MemoryStore::new()));
        ledger.record(&pending_entry("le-1", "w-1")?).await?;
        let updated = ledger
            .update_status(
                "le-1",
                PaymentStatus::Completed,
                Some(TransportMethod::Transfer),
                Some("ptx-1"),
                Some("0xbeef"),
                None,
            )
            .await?;
        assert_eq!(updated.status, PaymentStatus::Completed);
        assert_eq!(updated.provider_tx_id.as_deref(), Some("ptx-1"));
        let again =
            ledger.update_status("le-1", PaymentStatus::Failed, None, None, None, None).await;
        assert!(again.is_err());
        let stored = ledger.get("le-1").await?.ok_or("missing")?;
        assert_eq!(stored.status, PaymentStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn query_filters_and_caps() -> Result<(), Box<dyn std::error::Error>> {
        let ledger = AuditLedger::new(Arc::new(MemoryStore::new()));
        for i in 0..5 {
            let wallet = if i % 2 == 0 { "w-even" } else { "w-odd" };
            ledger.record(&pending_entry(&format!("le-{i}"), wallet)?).await?;
        }
        let filter = LedgerFilter {
            wallet_id: Some("w-even".to_owned()),
            ..LedgerFilter::default()
        };
        let hits = ledger.query(&filter).await?;
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|e| e.wallet_id == "w-even"));

        let capped = ledger
            .query(&LedgerFilter { limit: Some(2), ..LedgerFilter::default() })
            .await?;
        assert_eq!(capped.len(), 2);
        Ok(())
    }
}
