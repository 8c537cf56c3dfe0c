//! Data models for the payment execution core.
//!
//! Groups request/result types, ledger and intent records, amounts, and
//! network identifiers.

pub mod amount;
pub mod intent;
pub mod ledger;
pub mod network;
pub mod payment;

pub use amount::Amount;
pub use intent::{IntentStatus, PaymentIntent};
pub use ledger::{LedgerEntry, LedgerFilter};
pub use network::Network;
pub use payment::{
    AttestationMode, BatchResult, FeeLevel, GuardFinding, PaymentRequest, PaymentResult,
    PaymentStatus, RecipientKind, ResilienceStrategy, SimulationResult, TransportMethod,
    TrustOverride, classify_recipient, is_base58_address, is_evm_address,
};
