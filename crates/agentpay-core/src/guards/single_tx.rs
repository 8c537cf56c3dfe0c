//! Per-payment amount bounds.

use super::{GuardContext, GuardDecision, GuardToken};
use crate::{error::Error, models::Amount};

/// Stateless bounds on a single payment's amount.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleTxGuard {
    /// Minimum amount, inclusive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<Amount>,
    /// Maximum amount, inclusive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<Amount>,
}

impl SingleTxGuard {
    /// A guard with only a maximum.
    pub const fn max(max: Amount) -> Self {
        Self { min: None, max: Some(max) }
    }

    /// Reject bounds that exclude every amount.
    pub fn validate(&self) -> Result<(), Error> {
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(Error::Validation(format!(
                    "single-tx bounds are empty: min {min} > max {max}"
                )));
            }
        }
        Ok(())
    }

    fn decide(&self, amount: Amount) -> GuardDecision {
        if let Some(min) = self.min {
            if amount < min {
                return GuardDecision::block(format!("amount {amount} below minimum {min}"));
            }
        }
        if let Some(max) = self.max {
            if amount > max {
                return GuardDecision::block(format!("amount {amount} above maximum {max}"));
            }
        }
        GuardDecision::allow()
    }

    /// Bounds check, for simulation.
    pub fn check(&self, ctx: &GuardContext) -> GuardDecision {
        self.decide(ctx.amount)
    }

    /// Bounds check as a reservation; nothing is counted.
    pub fn reserve(&self, ctx: &GuardContext) -> Result<GuardToken, Error> {
        let decision = self.decide(ctx.amount);
        if decision.allowed {
            Ok(GuardToken::Stateless)
        } else {
            Err(Error::GuardBlocked {
                guard: "single_tx".to_owned(),
                reason: decision.reason.unwrap_or_default(),
            })
        }
    }
}
