//! Trust and approval capabilities injected by the embedder.

use crate::{
    error::Error,
    models::{Amount, PaymentRequest},
};

/// Verdict of the optional pre-flight trust hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrustVerdict {
    /// Proceed with the payment.
    Approve,
    /// Defer: materialize an intent awaiting explicit confirmation.
    Hold,
    /// Refuse the payment outright.
    Block,
}

/// Pre-flight gate consulted before any side effect on external systems.
///
/// How the verdict is produced (identity registries, reputation scoring,
/// static allowlists) is the embedder's business; the core only honors it.
#[async_trait::async_trait]
pub trait TrustHook: Send + Sync {
    /// Evaluate a payment request.
    async fn evaluate(&self, request: &PaymentRequest) -> Result<TrustVerdict, Error>;
}

/// What the confirm guard presents for out-of-band approval.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    /// Spending wallet.
    pub wallet_id: String,
    /// Recipient as given.
    pub recipient: String,
    /// Amount awaiting approval.
    pub amount: Amount,
    /// Caller-supplied purpose, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
}

/// Out-of-band approval capability used by the confirm guard.
///
/// The core does not prescribe how approval happens; returning `false`
/// (or having no hook configured at all) blocks the payment.
#[async_trait::async_trait]
pub trait ApprovalHook: Send + Sync {
    /// Ask for approval of one payment.
    async fn approve(&self, request: &ApprovalRequest) -> Result<bool, Error>;
}
