//! Error types for the `agentpay-core` crate.
//!
//! Every failure carries a stable machine-readable kind (see [`Error::kind`])
//! next to its human-readable message, so embedders can branch on outcomes
//! without string matching.

use crate::models::Amount;

/// Errors surfaced by the payment execution core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing credential, unknown network, or other wiring problem.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Malformed request, e.g. a negative amount. Never recorded in the
    /// ledger; surfaces synchronously to the caller.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The custody provider does not know the referenced wallet.
    #[error("wallet not found: {0}")]
    WalletNotFound(String),

    /// Live balance minus open reservations does not cover the amount.
    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance {
        /// Balance net of open reservations at check time.
        available: Amount,
        /// Amount the payment asked for.
        requested: Amount,
    },

    /// The per-wallet fund lock could not be acquired within its retries.
    #[error("wallet busy: {0}")]
    WalletBusy(String),

    /// A guard rejected the payment.
    #[error("blocked by guard {guard}: {reason}")]
    GuardBlocked {
        /// Name of the rejecting guard.
        guard: String,
        /// Why it rejected.
        reason: String,
    },

    /// No adapter matched the recipient.
    #[error("no payment route for recipient: {0}")]
    RoutingFailed(String),

    /// A counterparty violated the expected adapter protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transient upstream failure; eligible for retry.
    #[error("network error: {0}")]
    Network(String),

    /// A deadline expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The circuit breaker is gating the target service.
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    /// No intent stored under the given id.
    #[error("payment intent not found: {0}")]
    IntentNotFound(String),

    /// The intent already reached a terminal state.
    #[error("payment intent already terminal: {0}")]
    IntentAlreadyTerminal(String),

    /// The intent expired before it was confirmed.
    #[error("payment intent expired: {0}")]
    IntentExpired(String),

    /// The storage backend failed.
    #[error(transparent)]
    Storage(#[from] agentpay_store::StoreError),
}

impl Error {
    /// Stable machine-readable kind for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Validation(_) => "validation_error",
            Self::WalletNotFound(_) => "wallet_not_found",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::WalletBusy(_) => "wallet_busy",
            Self::GuardBlocked { .. } => "guard_blocked",
            Self::RoutingFailed(_) => "routing_failed",
            Self::Protocol(_) => "protocol_error",
            Self::Network(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::CircuitOpen(_) => "circuit_open",
            Self::IntentNotFound(_) => "intent_not_found",
            Self::IntentAlreadyTerminal(_) => "intent_already_terminal",
            Self::IntentExpired(_) => "intent_expired",
            Self::Storage(_) => "storage_error",
        }
    }

    /// Whether a retry policy may re-attempt after this error.
    ///
    /// Only transient upstream failures qualify. Guard blocks, validation
    /// problems, balance shortfalls and open circuits never do.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::Timeout(_)
                | Self::Storage(agentpay_store::StoreError::Unavailable(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        let err = Error::GuardBlocked { guard: "budget".to_owned(), reason: "over".to_owned() };
        assert_eq!(err.kind(), "guard_blocked");
        assert_eq!(Error::CircuitOpen("custody".to_owned()).kind(), "circuit_open");
    }

    #[test]
    fn transience_classification() {
        assert!(Error::Network("503".to_owned()).is_transient());
        assert!(Error::Timeout("upstream".to_owned()).is_transient());
        assert!(!Error::CircuitOpen("svc".to_owned()).is_transient());
        assert!(!Error::Validation("bad".to_owned()).is_transient());
        let blocked = Error::GuardBlocked { guard: "rate".to_owned(), reason: "cap".to_owned() };
        assert!(!blocked.is_transient());
    }
}
