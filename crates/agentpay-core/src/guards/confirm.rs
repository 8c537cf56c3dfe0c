//! Above-threshold out-of-band approval.

use super::{GuardContext, GuardDecision, GuardEnv, GuardToken};
use crate::{error::Error, models::Amount, trust::ApprovalRequest};

/// Requires an injected approval capability above a threshold (or for
/// every payment when no threshold is set).
///
/// The core does not prescribe how approval happens; a missing hook or a
/// `false` answer blocks the payment.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmGuard {
    /// Amounts at or above this require approval. `None` means every
    /// payment does.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<Amount>,
}

impl ConfirmGuard {
    /// A guard requiring approval at or above `threshold`.
    pub const fn above(threshold: Amount) -> Self {
        Self { threshold: Some(threshold) }
    }

    fn needs_approval(&self, amount: Amount) -> bool {
        match self.threshold {
            Some(threshold) => amount >= threshold,
            None => true,
        }
    }

    /// Read-only check: reports "would require confirmation" as a block so
    /// simulations surface it, without consulting the hook.
    pub fn check(&self, ctx: &GuardContext) -> GuardDecision {
        if self.needs_approval(ctx.amount) {
            GuardDecision::block(format!("amount {} requires out-of-band approval", ctx.amount))
        } else {
            GuardDecision::allow()
        }
    }

    /// Consult the approval hook when the amount requires it.
    pub async fn reserve(
        &self,
        env: &GuardEnv<'_>,
        ctx: &GuardContext,
    ) -> Result<GuardToken, Error> {
        if !self.needs_approval(ctx.amount) {
            return Ok(GuardToken::Stateless);
        }
        let Some(hook) = env.approval else {
            return Err(Error::GuardBlocked {
                guard: "confirm".to_owned(),
                reason: "approval required but no approval hook is configured".to_owned(),
            });
        };
        let request = ApprovalRequest {
            wallet_id: ctx.wallet_id.clone(),
            recipient: ctx.recipient.clone(),
            amount: ctx.amount,
            purpose: ctx.purpose.clone(),
        };
        if hook.approve(&request).await? {
            Ok(GuardToken::Stateless)
        } else {
            Err(Error::GuardBlocked {
                guard: "confirm".to_owned(),
                reason: format!("approval denied for {} to {}", ctx.amount, ctx.recipient),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use agentpay_store::MemoryStore;

    use super::*;
    use crate::trust::ApprovalHook;

    struct Always(bool);

    #[async_trait::async_trait]
    impl ApprovalHook for Always {
        async fn approve(&self, _request: &ApprovalRequest) -> Result<bool, Error> {
            Ok(self.0)
        }
    }

    fn ctx(amount: &str) -> Result<GuardContext, Box<dyn std::error::Error>> {
        Ok(GuardContext {
            wallet_id: "w-1".to_owned(),
            wallet_set_id: None,
            recipient: "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_owned(),
            amount: Amount::parse(amount)?,
            purpose: None,
        })
    }

    #[tokio::test]
    async fn below_threshold_passes_without_hook() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        let guard = ConfirmGuard::above(Amount::parse("100")?);
        let env = GuardEnv { store: &store, approval: None };
        guard.reserve(&env, &ctx("99")?).await?;
        Ok(())
    }

    #[tokio::test]
    async fn missing_hook_blocks() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        let guard = ConfirmGuard::above(Amount::parse("100")?);
        let env = GuardEnv { store: &store, approval: None };
        let err = guard.reserve(&env, &ctx("100")?).await.err().ok_or("expected")?;
        assert_eq!(err.kind(), "guard_blocked");
        Ok(())
    }

    #[tokio::test]
    async fn hook_answer_decides() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        let guard = ConfirmGuard::default();
        let yes = Always(true);
        let env = GuardEnv { store: &store, approval: Some(&yes) };
        guard.reserve(&env, &ctx("5")?).await?;
        let no = Always(false);
        let env = GuardEnv { store: &store, approval: Some(&no) };
        let err = guard.reserve(&env, &ctx("5")?).await.err().ok_or("expected")?;
        assert_eq!(err.kind(), "guard_blocked");
        Ok(())
    }
}
