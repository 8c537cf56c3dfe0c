//! Policy guards and the per-wallet guard chain.
//!
//! Guards are tagged variants so chains persist as JSON in the store and
//! survive restart. Each guard supports four operations: a read-only
//! `check` for simulation, an atomic `reserve` that tests limits and
//! counts pending usage, and `commit`/`release` to finalize or roll back.
//!
//! The effective chain for a payment is the wallet-set chain followed by
//! the wallet chain.

pub mod budget;
pub mod confirm;
pub mod rate_limit;
pub mod recipient;
pub mod single_tx;

use std::sync::Arc;

use agentpay_store::Store;

pub use budget::BudgetGuard;
pub use confirm::ConfirmGuard;
pub use rate_limit::RateLimitGuard;
pub use recipient::{RecipientGuard, RecipientMode};
pub use single_tx::SingleTxGuard;

use crate::{
    error::Error,
    models::Amount,
    trust::ApprovalHook,
};

/// Capabilities a guard evaluation runs against.
pub struct GuardEnv<'a> {
    /// Storage abstraction holding all guard state.
    pub store: &'a dyn Store,
    /// Approval capability for the confirm guard, when configured.
    pub approval: Option<&'a dyn ApprovalHook>,
}

/// The payment fields guards evaluate.
#[derive(Debug, Clone)]
pub struct GuardContext {
    /// Spending wallet.
    pub wallet_id: String,
    /// Wallet set, when known.
    pub wallet_set_id: Option<String>,
    /// Recipient as given.
    pub recipient: String,
    /// Amount to pay.
    pub amount: Amount,
    /// Caller-supplied purpose.
    pub purpose: Option<String>,
}

/// Read-only verdict from a guard's `check`.
#[derive(Debug, Clone)]
pub struct GuardDecision {
    /// Whether the guard would admit the payment.
    pub allowed: bool,
    /// Why not, when it would not.
    pub reason: Option<String>,
}

impl GuardDecision {
    /// An allowing decision.
    pub const fn allow() -> Self {
        Self { allowed: true, reason: None }
    }

    /// A blocking decision with a reason.
    pub fn block(reason: impl Into<String>) -> Self {
        Self { allowed: false, reason: Some(reason.into()) }
    }
}

/// Opaque handle returned by a guard's `reserve`, consumed by
/// `commit`/`release`.
#[derive(Debug, Clone)]
pub enum GuardToken {
    /// Budget usage pending under the given scope.
    Budget {
        /// Budget scope (wallet or wallet-set id).
        scope: String,
        /// Window entry recorded by the reservation.
        entry_id: String,
        /// Amount reserved.
        amount: Amount,
    },
    /// Rate buckets incremented by the reservation.
    Rate {
        /// Bucket keys to decrement on release.
        keys: Vec<String>,
    },
    /// Guards with nothing to roll back.
    Stateless,
}

/// One configured guard, persistable as JSON.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GuardConfig {
    /// Windowed spending caps.
    Budget(BudgetGuard),
    /// Windowed payment-count caps.
    RateLimit(RateLimitGuard),
    /// Per-payment amount bounds.
    SingleTx(SingleTxGuard),
    /// Recipient allow/deny lists.
    Recipient(RecipientGuard),
    /// Above-threshold out-of-band approval.
    Confirm(ConfirmGuard),
}

impl GuardConfig {
    /// Stable guard name, used in block reasons and results.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Budget(_) => "budget",
            Self::RateLimit(_) => "rate_limit",
            Self::SingleTx(_) => "single_tx",
            Self::Recipient(_) => "recipient",
            Self::Confirm(_) => "confirm",
        }
    }

    /// Read-only predicate for simulation. No counters move.
    pub async fn check(
        &self,
        env: &GuardEnv<'_>,
        scope: &str,
        ctx: &GuardContext,
    ) -> Result<GuardDecision, Error> {
        match self {
            Self::Budget(g) => g.check(env.store, scope, ctx).await,
            Self::RateLimit(g) => g.check(env.store, scope, ctx).await,
            Self::SingleTx(g) => Ok(g.check(ctx)),
            Self::Recipient(g) => Ok(g.check(ctx)),
            Self::Confirm(g) => Ok(g.check(ctx)),
        }
    }

    /// Atomically test limits and record pending usage.
    pub async fn reserve(
        &self,
        env: &GuardEnv<'_>,
        scope: &str,
        ctx: &GuardContext,
    ) -> Result<GuardToken, Error> {
        match self {
            Self::Budget(g) => g.reserve(env.store, scope, ctx).await,
            Self::RateLimit(g) => g.reserve(env.store, scope, ctx).await,
            Self::SingleTx(g) => g.reserve(ctx),
            Self::Recipient(g) => g.reserve(ctx),
            Self::Confirm(g) => g.reserve(env, ctx).await,
        }
    }

    /// Finalize pending usage. Most guards already counted at reserve.
    pub async fn commit(
        &self,
        _env: &GuardEnv<'_>,
        _scope: &str,
        _ctx: &GuardContext,
        _token: &GuardToken,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Roll back pending usage.
    pub async fn release(
        &self,
        env: &GuardEnv<'_>,
        _scope: &str,
        _ctx: &GuardContext,
        token: &GuardToken,
    ) -> Result<(), Error> {
        match (self, token) {
            (Self::Budget(g), GuardToken::Budget { scope: token_scope, entry_id, amount }) => {
                g.release(env.store, token_scope, entry_id, *amount).await
            }
            (Self::RateLimit(g), GuardToken::Rate { keys }) => g.release(env.store, keys).await,
            _ => Ok(()),
        }
    }
}

/// A guard bound to the scope (wallet or wallet-set id) whose state it
/// keys.
#[derive(Debug, Clone)]
pub struct GuardLink {
    /// State scope: the wallet id for wallet chains, the set id for
    /// wallet-set chains.
    pub scope: String,
    /// The guard itself.
    pub config: GuardConfig,
}

/// Tokens held by a successful chain reservation.
#[derive(Debug)]
pub struct ChainReservation {
    held: Vec<(GuardLink, GuardToken)>,
}

impl ChainReservation {
    /// Names of the guards that passed, in chain order.
    pub fn guard_names(&self) -> Vec<String> {
        self.held.iter().map(|(link, _)| link.config.name().to_owned()).collect()
    }
}

/// Ordered composition of guards evaluated for one payment.
#[derive(Debug, Clone, Default)]
pub struct GuardChain {
    links: Vec<GuardLink>,
}

impl GuardChain {
    /// Builds a chain from links, wallet-set guards first.
    pub fn new(links: Vec<GuardLink>) -> Self {
        Self { links }
    }

    /// Whether the chain has no guards at all.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Run every guard's read-only check.
    pub async fn check_all(
        &self,
        env: &GuardEnv<'_>,
        ctx: &GuardContext,
    ) -> Result<Vec<(String, GuardDecision)>, Error> {
        let mut findings = Vec::with_capacity(self.links.len());
        for link in &self.links {
            let decision = link.config.check(env, &link.scope, ctx).await?;
            findings.push((link.config.name().to_owned(), decision));
        }
        Ok(findings)
    }

    /// Reserve every guard in order.
    ///
    /// On the first failure all previously obtained tokens are released
    /// and the block reason propagates.
    pub async fn reserve(
        &self,
        env: &GuardEnv<'_>,
        ctx: &GuardContext,
    ) -> Result<ChainReservation, Error> {
        let mut held: Vec<(GuardLink, GuardToken)> = Vec::with_capacity(self.links.len());
        for link in &self.links {
            match link.config.reserve(env, &link.scope, ctx).await {
                Ok(token) => held.push((link.clone(), token)),
                Err(err) => {
                    for (acquired, token) in held.iter().rev() {
                        if let Err(release_err) =
                            acquired.config.release(env, &acquired.scope, ctx, token).await
                        {
                            tracing::warn!(
                                guard = acquired.config.name(),
                                error = %release_err,
                                "failed to roll back guard reservation",
                            );
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(ChainReservation { held })
    }

    /// Finalize a reservation across the whole token set.
    pub async fn commit(
        &self,
        env: &GuardEnv<'_>,
        ctx: &GuardContext,
        reservation: &ChainReservation,
    ) -> Result<(), Error> {
        for (link, token) in &reservation.held {
            link.config.commit(env, &link.scope, ctx, token).await?;
        }
        Ok(())
    }

    /// Roll back a reservation across the whole token set.
    pub async fn release(
        &self,
        env: &GuardEnv<'_>,
        ctx: &GuardContext,
        reservation: &ChainReservation,
    ) -> Result<(), Error> {
        for (link, token) in reservation.held.iter().rev() {
            link.config.release(env, &link.scope, ctx, token).await?;
        }
        Ok(())
    }
}

fn wallet_guards_key(wallet_id: &str) -> String {
    format!("guards:{wallet_id}")
}

fn set_guards_key(set_id: &str) -> String {
    format!("guards:set:{set_id}")
}

/// Persistent registry of guard chains per wallet and per wallet-set.
#[derive(Clone)]
pub struct GuardRegistry {
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for GuardRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardRegistry").finish_non_exhaustive()
    }
}

impl GuardRegistry {
    /// Creates a registry over `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn load(&self, key: &str) -> Result<Vec<GuardConfig>, Error> {
        match self.store.get(key).await? {
            Some(json) => serde_json::from_str(&json).map_err(|e| {
                Error::Storage(agentpay_store::StoreError::Corrupt {
                    key: key.to_owned(),
                    reason: e.to_string(),
                })
            }),
            None => Ok(Vec::new()),
        }
    }

    async fn append(&self, key: &str, config: GuardConfig) -> Result<(), Error> {
        self.store
            .update(key, &mut |current| {
                let mut configs: Vec<GuardConfig> = current
                    .and_then(|json| serde_json::from_str(json).ok())
                    .unwrap_or_default();
                configs.push(config.clone());
                serde_json::to_string(&configs).ok()
            })
            .await?;
        Ok(())
    }

    async fn remove_named(&self, key: &str, name: &str) -> Result<(), Error> {
        self.store
            .update(key, &mut |current| {
                let mut configs: Vec<GuardConfig> = current
                    .and_then(|json| serde_json::from_str(json).ok())
                    .unwrap_or_default();
                configs.retain(|c| c.name() != name);
                serde_json::to_string(&configs).ok()
            })
            .await?;
        Ok(())
    }

    /// Append a guard to a wallet's chain.
    pub async fn add(&self, wallet_id: &str, config: GuardConfig) -> Result<(), Error> {
        config.validate()?;
        self.append(&wallet_guards_key(wallet_id), config).await
    }

    /// Append a guard to a wallet-set's chain.
    pub async fn add_for_set(&self, set_id: &str, config: GuardConfig) -> Result<(), Error> {
        config.validate()?;
        self.append(&set_guards_key(set_id), config).await
    }

    /// Remove every guard named `name` from a wallet's chain.
    pub async fn remove(&self, wallet_id: &str, name: &str) -> Result<(), Error> {
        self.remove_named(&wallet_guards_key(wallet_id), name).await
    }

    /// Remove every guard named `name` from a wallet-set's chain.
    pub async fn remove_for_set(&self, set_id: &str, name: &str) -> Result<(), Error> {
        self.remove_named(&set_guards_key(set_id), name).await
    }

    /// List a wallet's guards.
    pub async fn list(&self, wallet_id: &str) -> Result<Vec<GuardConfig>, Error> {
        self.load(&wallet_guards_key(wallet_id)).await
    }

    /// List a wallet-set's guards.
    pub async fn list_for_set(&self, set_id: &str) -> Result<Vec<GuardConfig>, Error> {
        self.load(&set_guards_key(set_id)).await
    }

    /// The effective chain for a payment: wallet-set guards first, then
    /// wallet guards.
    pub async fn chain_for(
        &self,
        wallet_id: &str,
        wallet_set_id: Option<&str>,
    ) -> Result<GuardChain, Error> {
        let mut links = Vec::new();
        if let Some(set_id) = wallet_set_id {
            for config in self.list_for_set(set_id).await? {
                links.push(GuardLink { scope: set_id.to_owned(), config });
            }
        }
        for config in self.list(wallet_id).await? {
            links.push(GuardLink { scope: wallet_id.to_owned(), config });
        }
        Ok(GuardChain::new(links))
    }
}

impl GuardConfig {
    /// Reject configurations that could never evaluate.
    pub fn validate(&self) -> Result<(), Error> {
        match self {
            Self::Recipient(g) => g.validate(),
            Self::SingleTx(g) => g.validate(),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use agentpay_store::MemoryStore;

    use super::*;

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
    async fn registry_roundtrip_and_chain_order() -> Result<(), Box<dyn std::error::Error>> {
        let registry = GuardRegistry::new(Arc::new(MemoryStore::new()));
        registry
            .add("w-1", GuardConfig::SingleTx(SingleTxGuard::max(Amount::parse("10")?)))
            .await?;
        registry
            .add_for_set("ws-1", GuardConfig::Budget(BudgetGuard::daily(Amount::parse("50")?)))
            .await?;
        let chain = registry.chain_for("w-1", Some("ws-1")).await?;
        // Wallet-set guards come first.
        assert_eq!(chain.links[0].config.name(), "budget");
        assert_eq!(chain.links[0].scope, "ws-1");
        assert_eq!(chain.links[1].config.name(), "single_tx");
        Ok(())
    }

    #[tokio::test]
    async fn remove_drops_by_name() -> Result<(), Box<dyn std::error::Error>> {
        let registry = GuardRegistry::new(Arc::new(MemoryStore::new()));
        registry
            .add("w-1", GuardConfig::SingleTx(SingleTxGuard::max(Amount::parse("10")?)))
            .await?;
        registry.remove("w-1", "single_tx").await?;
        assert!(registry.list("w-1").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failed_reserve_rolls_back_earlier_guards() -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(MemoryStore::new());
        let chain = GuardChain::new(vec![
            GuardLink {
                scope: "w-1".to_owned(),
                config: GuardConfig::Budget(BudgetGuard::daily(Amount::parse("100")?)),
            },
            GuardLink {
                scope: "w-1".to_owned(),
                config: GuardConfig::SingleTx(SingleTxGuard::max(Amount::parse("5")?)),
            },
        ]);
        let env = GuardEnv { store: store.as_ref(), approval: None };
        let err = chain.reserve(&env, &ctx("10")?).await.err().ok_or("expected block")?;
        assert_eq!(err.kind(), "guard_blocked");
        // The budget counted nothing after rollback.
        let budget = BudgetGuard::daily(Amount::parse("100")?);
        let decision = budget.check(store.as_ref(), "w-1", &ctx("100")?).await?;
        assert!(decision.allowed);
        Ok(())
    }

    #[tokio::test]
    async fn commit_keeps_usage_release_reverses_it() -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(MemoryStore::new());
        let chain = GuardChain::new(vec![GuardLink {
            scope: "w-1".to_owned(),
            config: GuardConfig::Budget(BudgetGuard::daily(Amount::parse("50")?)),
        }]);
        let env = GuardEnv { store: store.as_ref(), approval: None };

        let held = chain.reserve(&env, &ctx("30")?).await?;
        chain.release(&env, &ctx("30")?, &held).await?;
        // After release the full budget is available again.
        let held = chain.reserve(&env, &ctx("50")?).await?;
        chain.commit(&env, &ctx("50")?, &held).await?;
        // After commit it is spent.
        let err = chain.reserve(&env, &ctx("1")?).await.err().ok_or("expected block")?;
        assert_eq!(err.kind(), "guard_blocked");
        Ok(())
    }
}
