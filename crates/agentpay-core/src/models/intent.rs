//! Payment intent types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::amount::Amount;

/// Lifecycle status of a payment intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentStatus {
    /// Created; funds reserved, awaiting confirmation.
    RequiresConfirmation,
    /// Confirmed; the payment pipeline is running.
    Processing,
    /// Payment completed.
    Succeeded,
    /// Payment failed.
    Failed,
    /// Cancelled before confirmation (explicitly or by expiry).
    Cancelled,
}

impl IntentStatus {
    /// Whether this status is final.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// A pre-authorized payment holding a fund reservation until confirmed,
/// cancelled, or expired.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntent {
    /// Intent id.
    pub id: String,
    /// Wallet the reservation is held against.
    pub wallet_id: String,
    /// Recipient the eventual payment goes to.
    pub recipient: String,
    /// Amount reserved and eventually paid.
    pub amount: Amount,
    /// Currency tag, e.g. `USDC`.
    pub currency: String,
    /// Current status.
    pub status: IntentStatus,
    /// Amount currently held in the reservation registry. Zero once
    /// terminal.
    pub reserved_amount: Amount,
    /// Ledger entry recording this intent's payment attempt.
    pub ledger_entry_id: String,
    /// When the intent was created.
    pub created_at: DateTime<Utc>,
    /// When an unconfirmed intent auto-cancels.
    pub expires_at: DateTime<Utc>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl PaymentIntent {
    /// Whether the stored expiry has passed at `now`.
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}
