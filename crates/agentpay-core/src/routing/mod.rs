//! Payment routing: one uniform adapter contract, three transports.

pub mod crosschain;
pub mod http402;
pub mod transfer;

use std::{collections::BTreeMap, sync::Arc};

pub use crosschain::{CrossChainAdapter, CrossChainOptions};
pub use http402::Http402Adapter;
pub use transfer::TransferAdapter;

use crate::{
    custody::WalletInfo,
    error::Error,
    models::{Amount, PaymentRequest, TransportMethod},
};

/// What an adapter's dry run reports.
#[derive(Debug, Clone)]
pub struct RouteSimulation {
    /// Whether the adapter expects execution to succeed.
    pub would_succeed: bool,
    /// Fee estimate, when the adapter can produce one without side
    /// effects.
    pub estimated_fee: Option<Amount>,
    /// Explanation, mostly for the failure case.
    pub reason: Option<String>,
}

/// What a successful execution reports. Route-specific detail goes into
/// the metadata sink the adapter was handed.
#[derive(Debug, Clone)]
pub struct AdapterReceipt {
    /// Custody provider's transaction id, when one exists.
    pub provider_tx_id: Option<String>,
    /// On-chain transaction hash, when one exists.
    pub tx_hash: Option<String>,
}

/// Transport-specific payment executor behind a uniform contract.
///
/// `simulate` must move no funds and leave no irreversible mark on the
/// counterparty. `execute` writes route metadata into `meta` as it
/// progresses, so a failure partway still leaves enough in the ledger to
/// reconcile manually. Exactly-once semantics are delegated to the
/// custody provider via the request's idempotency key.
#[async_trait::async_trait]
pub trait PaymentAdapter: Send + Sync {
    /// Stable adapter name; doubles as the circuit-breaker service name.
    fn name(&self) -> &'static str;

    /// Transport this adapter speaks.
    fn method(&self) -> TransportMethod;

    /// Tie-break priority; on multiple matches the lowest number wins.
    fn priority(&self) -> u8;

    /// Whether this adapter can carry the request.
    fn can_handle(&self, request: &PaymentRequest, wallet: &WalletInfo) -> bool;

    /// Dry run.
    async fn simulate(
        &self,
        request: &PaymentRequest,
        wallet: &WalletInfo,
    ) -> Result<RouteSimulation, Error>;

    /// Execute the payment.
    async fn execute(
        &self,
        request: &PaymentRequest,
        wallet: &WalletInfo,
        meta: &mut BTreeMap<String, String>,
    ) -> Result<AdapterReceipt, Error>;
}

/// Selects exactly one adapter per request.
///
/// A destination network differing from the wallet's network routes
/// cross-chain regardless of recipient shape; otherwise the recipient
/// shape decides, with priorities breaking ties toward the more specific
/// match.
#[derive(Clone)]
pub struct Router {
    adapters: Vec<Arc<dyn PaymentAdapter>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.adapters.iter().map(|a| a.name()).collect();
        f.debug_struct("Router").field("adapters", &names).finish()
    }
}

impl Router {
    /// Builds a router over the given adapters.
    pub fn new(adapters: Vec<Arc<dyn PaymentAdapter>>) -> Self {
        Self { adapters }
    }

    /// Pick the adapter for this request, or fail with `routing_failed`.
    pub fn select(
        &self,
        request: &PaymentRequest,
        wallet: &WalletInfo,
    ) -> Result<Arc<dyn PaymentAdapter>, Error> {
        self.adapters
            .iter()
            .filter(|a| a.can_handle(request, wallet))
            .min_by_key(|a| a.priority())
            .cloned()
            .ok_or_else(|| Error::RoutingFailed(request.recipient.clone()))
    }
}
