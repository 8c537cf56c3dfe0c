//! Audit ledger entry types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::{
    amount::Amount,
    payment::{PaymentStatus, TransportMethod},
};

/// One payment attempt in the append-only audit ledger.
///
/// Immutable after creation except for `status`, the transaction
/// identifiers learned at completion, and additive metadata merges.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Entry id.
    pub id: String,
    /// Spending wallet.
    pub wallet_id: String,
    /// Wallet set, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet_set_id: Option<String>,
    /// Recipient as the caller gave it.
    pub recipient: String,
    /// Amount requested.
    pub amount: Amount,
    /// Current status. Pending entries may still move; terminal entries
    /// are write-once.
    pub status: PaymentStatus,
    /// Transport the payment was routed over.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<TransportMethod>,
    /// Custody provider's transaction id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_tx_id: Option<String>,
    /// On-chain transaction hash.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// Guards that passed reservation for this attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guards_passed: Vec<String>,
    /// When the entry was recorded.
    pub created_at: DateTime<Utc>,
    /// When the entry last changed.
    pub updated_at: DateTime<Utc>,
    /// Caller-supplied purpose.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    /// Free-form metadata; merges are additive.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Filters for ledger queries. All optional and conjunctive.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerFilter {
    /// Restrict to one wallet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet_id: Option<String>,
    /// Restrict to one wallet set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet_set_id: Option<String>,
    /// Restrict to one status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PaymentStatus>,
    /// Restrict to one recipient.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// Entries created at or after this instant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    /// Entries created strictly before this instant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
    /// Result cap; defaults to 100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl LedgerFilter {
    /// Whether `entry` matches every set filter.
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        if self.wallet_id.as_deref().is_some_and(|w| w != entry.wallet_id) {
            return false;
        }
        if self.wallet_set_id.is_some() && self.wallet_set_id != entry.wallet_set_id {
            return false;
        }
        if self.status.is_some_and(|s| s != entry.status) {
            return false;
        }
        if self.recipient.as_deref().is_some_and(|r| r != entry.recipient) {
            return false;
        }
        if self.from.is_some_and(|from| entry.created_at < from) {
            return false;
        }
        if self.to.is_some_and(|to| entry.created_at >= to) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Amount;

    fn entry() -> Result<LedgerEntry, Box<dyn std::error::Error>> {
        Ok(LedgerEntry {
            id: "le-1".to_owned(),
            wallet_id: "w-1".to_owned(),
            wallet_set_id: Some("ws-1".to_owned()),
            recipient: "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_owned(),
            amount: Amount::parse("10")?,
            status: PaymentStatus::Completed,
            method: Some(TransportMethod::Transfer),
            provider_tx_id: Some("ptx-1".to_owned()),
            tx_hash: None,
            guards_passed: vec!["budget".to_owned()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            purpose: None,
            metadata: BTreeMap::new(),
        })
    }

    #[test]
    fn entry_serde_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let entry = entry()?;
        let json = serde_json::to_string(&entry)?;
        assert!(json.contains("\"walletId\":\"w-1\""));
        assert!(json.contains("\"status\":\"COMPLETED\""));
        let back: LedgerEntry = serde_json::from_str(&json)?;
        assert_eq!(back.id, entry.id);
        assert_eq!(back.amount, entry.amount);
        Ok(())
    }

    #[test]
    fn filter_is_conjunctive() -> Result<(), Box<dyn std::error::Error>> {
        let entry = entry()?;
        let mut filter = LedgerFilter {
            wallet_id: Some("w-1".to_owned()),
            status: Some(PaymentStatus::Completed),
            ..LedgerFilter::default()
        };
        assert!(filter.matches(&entry));
        filter.status = Some(PaymentStatus::Failed);
        assert!(!filter.matches(&entry));
        Ok(())
    }
}
