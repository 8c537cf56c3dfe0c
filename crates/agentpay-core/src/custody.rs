//! Custody provider capability.
//!
//! The core never touches private keys or blockchains. Everything that
//! actually moves funds goes through this trait, implemented by the
//! embedder against their custody provider's API.

use crate::{
    error::Error,
    models::{Amount, FeeLevel, Network},
};

/// What the custody provider knows about a wallet.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletInfo {
    /// Wallet id.
    pub id: String,
    /// On-chain address of the wallet.
    pub address: String,
    /// Network the wallet lives on.
    pub network: Network,
    /// Wallet set the wallet belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet_set_id: Option<String>,
}

/// A token transfer for the custody provider to execute.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustodyTransfer {
    /// Spending wallet.
    pub wallet_id: String,
    /// Destination address on the wallet's network.
    pub to_address: String,
    /// Amount to move.
    pub amount: Amount,
    /// Fee priority.
    pub fee_level: FeeLevel,
    /// Exactly-once key; the provider deduplicates on it.
    pub idempotency_key: String,
    /// Block until the transaction confirms on chain.
    pub wait_for_confirmation: bool,
}

/// A smart-contract call for the custody provider to execute, expressed as
/// a function signature plus stringified parameters (the shape custody
/// APIs accept, so the core needs no ABI encoder).
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractCall {
    /// Wallet that signs and pays gas.
    pub wallet_id: String,
    /// Target contract address.
    pub contract_address: String,
    /// Solidity-style signature, e.g. `approve(address,uint256)`.
    pub abi_function_signature: String,
    /// Positional parameters, stringified.
    pub abi_parameters: Vec<String>,
    /// Fee priority.
    pub fee_level: FeeLevel,
    /// Exactly-once key.
    pub idempotency_key: String,
}

/// Custody-side transaction state, as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CustodyTxState {
    /// Accepted, not yet broadcast.
    Queued,
    /// Broadcast, awaiting confirmation.
    Sent,
    /// Confirmed on chain.
    Confirmed,
    /// Fully complete.
    Complete,
    /// Failed provider-side or on chain.
    Failed,
    /// Cancelled before broadcast.
    Cancelled,
}

impl CustodyTxState {
    /// Whether the provider will not advance this transaction further.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

/// Receipt returned for custody-side executions and state lookups.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustodyReceipt {
    /// Provider transaction id.
    pub provider_tx_id: String,
    /// On-chain hash, once broadcast.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// Provider-side state.
    pub state: CustodyTxState,
}

/// The capability that moves funds and returns transaction identifiers.
///
/// Implementations are expected to translate their provider's failures
/// into [`Error`] kinds: unknown wallets to `wallet_not_found`, 5xx and
/// connectivity trouble to `network_error`, everything else to
/// `protocol_error`.
#[async_trait::async_trait]
pub trait CustodyProvider: Send + Sync {
    /// Look up a wallet's address, network, and wallet set.
    async fn wallet(&self, wallet_id: &str) -> Result<WalletInfo, Error>;

    /// Live spendable balance of the wallet.
    async fn balance(&self, wallet_id: &str) -> Result<Amount, Error>;

    /// Execute a token transfer.
    async fn transfer(&self, transfer: &CustodyTransfer) -> Result<CustodyReceipt, Error>;

    /// Execute a smart-contract call.
    async fn call_contract(&self, call: &ContractCall) -> Result<CustodyReceipt, Error>;

    /// Current state of a previously submitted transaction.
    async fn transaction_state(&self, provider_tx_id: &str) -> Result<CustodyReceipt, Error>;

    /// Estimate the fee for a transfer, when the provider can.
    async fn estimate_transfer_fee(
        &self,
        transfer: &CustodyTransfer,
    ) -> Result<Option<Amount>, Error>;

    /// Sign an arbitrary message with the wallet's key, returning the
    /// signature in the provider's encoding.
    async fn sign_message(&self, wallet_id: &str, message: &str) -> Result<String, Error>;
}
