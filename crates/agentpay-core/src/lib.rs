//! Payment execution core for agent-operated custodial stablecoin
//! wallets.
//!
//! One entry point ([`PaymentEngine::pay`]) runs every payment through a
//! reversible pipeline: audit-ledger record, optional trust gate, policy
//! guard reservation, per-wallet fund lock, live balance check, then
//! routing across three transports (direct custody transfer, negotiated
//! HTTP-402, cross-chain burn/attest/mint) under a distributed circuit
//! breaker with typed retry. Two-phase payments run through intents that
//! hold fund reservations until confirmed, cancelled, or expired.
//!
//! The engine holds no in-process payment state: guards, locks,
//! reservations, circuit state, intents, and the ledger all live behind
//! the [`agentpay_store::Store`] abstraction, so multiple processes can
//! share one Redis backend.
//!
//! External collaborators are injected as capabilities: the custody
//! provider ([`custody::CustodyProvider`]), the optional trust gate
//! ([`trust::TrustHook`]), and the approval channel for the confirm guard
//! ([`trust::ApprovalHook`]).
//!
//! # Quick Start
//!
//! ```no_run
//! use std::{collections::BTreeMap, sync::Arc};
//!
//! use agentpay_core::{
//!     PaymentEngine,
//!     guards::{BudgetGuard, GuardConfig},
//!     models::{Amount, PaymentRequest},
//! };
//! use agentpay_store::MemoryStore;
//!
//! # fn custody() -> Arc<dyn agentpay_core::custody::CustodyProvider> { unreachable!() }
//! #[tokio::main]
//! async fn main() -> Result<(), agentpay_core::Error> {
//!     let engine = PaymentEngine::builder(Arc::new(MemoryStore::new()), custody()).build();
//!     engine
//!         .add_guard("wallet-1", GuardConfig::Budget(BudgetGuard::daily(Amount::parse("50")?)))
//!         .await?;
//!     let result = engine
//!         .pay(PaymentRequest::new(
//!             "wallet-1",
//!             "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
//!             Amount::parse("25")?,
//!         ))
//!         .await?;
//!     println!("{} ({:?})", result.success, result.status);
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod custody;
pub mod engine;
pub mod error;
pub mod guards;
pub mod intents;
pub mod ledger;
pub mod lock;
pub mod models;
pub mod reservations;
pub mod resilience;
pub mod routing;
pub mod trust;

pub use config::EngineConfig;
pub use engine::{EngineOptions, PaymentEngine, PaymentEngineBuilder};
pub use error::Error;
