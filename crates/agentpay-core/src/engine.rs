//! The payment orchestrator.
//!
//! One pipeline answers `pay`: record, trust-check, reserve guards, lock
//! the wallet, check available balance, route, execute under the circuit
//! breaker and retry policy, commit or roll back, settle the ledger,
//! unlock. A failure at any step unwinds everything the earlier steps
//! did.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use agentpay_store::Store;
use chrono::Utc;
use futures::StreamExt;

use crate::{
    config::EngineConfig,
    custody::{CustodyProvider, CustodyTxState, WalletInfo},
    error::Error,
    guards::{ChainReservation, GuardConfig, GuardContext, GuardEnv, GuardRegistry},
    intents::{CreateIntent, IntentService},
    ledger::AuditLedger,
    lock::{FundLock, FundLockConfig},
    models::{
        Amount, BatchResult, GuardFinding, LedgerEntry, LedgerFilter, PaymentIntent,
        PaymentRequest, PaymentResult, PaymentStatus, SimulationResult, TrustOverride,
    },
    reservations::ReservationRegistry,
    resilience::{BreakerConfig, CircuitBreaker, RetryPolicy},
    routing::{
        CrossChainAdapter, CrossChainOptions, Http402Adapter, PaymentAdapter, Router,
        TransferAdapter,
    },
    trust::{ApprovalHook, TrustHook, TrustVerdict},
};

/// How long a claimed idempotency key replays the original outcome.
const IDEMPOTENCY_TTL: Duration = Duration::from_secs(7 * 24 * 3_600);

/// Engine tunables; the defaults match the documented component
/// defaults.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Fund-lock TTL/retries/backoff.
    pub fund_lock: FundLockConfig,
    /// Circuit-breaker thresholds.
    pub breaker: BreakerConfig,
    /// Retry policy for the retry-then-fail and queue-background
    /// strategies.
    pub retry: RetryPolicy,
    /// Cross-chain wiring.
    pub crosschain: CrossChainOptions,
}

/// Wires every subsystem together behind the stable programmatic
/// surface: `pay`, `simulate`, `batch_pay`, the intent operations, guard
/// management, and ledger queries.
///
/// The engine holds no payment state of its own; everything lives behind
/// the storage abstraction, so any number of engines may share a backend.
#[derive(Clone)]
pub struct PaymentEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PaymentEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentEngine").finish_non_exhaustive()
    }
}

struct Inner {
    store: Arc<dyn Store>,
    custody: Arc<dyn CustodyProvider>,
    ledger: AuditLedger,
    guards: GuardRegistry,
    reservations: ReservationRegistry,
    fund_lock: FundLock,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    router: Router,
    intents: IntentService,
    trust: Option<Arc<dyn TrustHook>>,
    approval: Option<Arc<dyn ApprovalHook>>,
}

/// Builder for [`PaymentEngine`].
pub struct PaymentEngineBuilder {
    store: Arc<dyn Store>,
    custody: Arc<dyn CustodyProvider>,
    options: EngineOptions,
    trust: Option<Arc<dyn TrustHook>>,
    approval: Option<Arc<dyn ApprovalHook>>,
}

impl std::fmt::Debug for PaymentEngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentEngineBuilder").finish_non_exhaustive()
    }
}

impl PaymentEngineBuilder {
    /// Override the default tunables.
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Install a pre-flight trust hook.
    pub fn trust_hook(mut self, hook: Arc<dyn TrustHook>) -> Self {
        self.trust = Some(hook);
        self
    }

    /// Install the approval capability the confirm guard consults.
    pub fn approval_hook(mut self, hook: Arc<dyn ApprovalHook>) -> Self {
        self.approval = Some(hook);
        self
    }

    /// Assemble the engine.
    pub fn build(self) -> PaymentEngine {
        let ledger = AuditLedger::new(Arc::clone(&self.store));
        let reservations = ReservationRegistry::new(Arc::clone(&self.store));
        let router = Router::new(vec![
            Arc::new(CrossChainAdapter::new(
                Arc::clone(&self.custody),
                self.options.crosschain.clone(),
            )) as Arc<dyn PaymentAdapter>,
            Arc::new(Http402Adapter::new(Arc::clone(&self.custody))),
            Arc::new(TransferAdapter::new(Arc::clone(&self.custody))),
        ]);
        let intents =
            IntentService::new(Arc::clone(&self.store), ledger.clone(), reservations.clone());
        PaymentEngine {
            inner: Arc::new(Inner {
                guards: GuardRegistry::new(Arc::clone(&self.store)),
                fund_lock: FundLock::with_config(
                    Arc::clone(&self.store),
                    self.options.fund_lock.clone(),
                ),
                breaker: CircuitBreaker::with_config(
                    Arc::clone(&self.store),
                    self.options.breaker.clone(),
                ),
                retry: self.options.retry.clone(),
                ledger,
                reservations,
                router,
                intents,
                trust: self.trust,
                approval: self.approval,
                store: self.store,
                custody: self.custody,
            }),
        }
    }
}

impl PaymentEngine {
    /// Start building an engine over a store and a custody capability.
    pub fn builder(
        store: Arc<dyn Store>,
        custody: Arc<dyn CustodyProvider>,
    ) -> PaymentEngineBuilder {
        PaymentEngineBuilder { store, custody, options: EngineOptions::default(), trust: None, approval: None }
    }

    /// Build an engine from environment configuration with default
    /// tunables.
    pub async fn from_config(
        config: &EngineConfig,
        custody: Arc<dyn CustodyProvider>,
    ) -> Result<Self, Error> {
        let store = config.build_store().await?;
        Ok(Self::builder(store, custody).build())
    }

    /// Execute one payment through the full pipeline.
    ///
    /// Returns `Ok` with a failure-shaped [`PaymentResult`] for anything
    /// that produced a ledger entry; `Err` only for synchronous
    /// validation and storage faults before the ledger was touched.
    pub async fn pay(&self, request: PaymentRequest) -> Result<PaymentResult, Error> {
        let mut request = request;
        validate_request(&request)?;

        let entry_id = format!("le_{}", uuid::Uuid::new_v4().simple());
        if let Some(key) = request.idempotency_key.clone() {
            let idem_key = format!("idem:{key}");
            let claimed =
                self.inner.store.acquire_lock(&idem_key, &entry_id, IDEMPOTENCY_TTL).await?;
            if !claimed {
                return self.replay(&key, &request).await;
            }
        } else {
            // Always hand the custody provider a key, so in-pipeline
            // retries cannot double-spend.
            request.idempotency_key = Some(uuid::Uuid::new_v4().to_string());
        }

        // Step 1: the attempt is on the books before any side effect.
        self.inner.ledger.record(&pending_entry(&request, &entry_id)).await?;

        let inner = Arc::clone(&self.inner);
        let spawned_request = request.clone();
        let spawned_entry = entry_id.clone();
        let handle = tokio::spawn(async move {
            inner.run_pipeline(spawned_request, spawned_entry, None, true).await
        });
        match request.timeout {
            None => handle.await.map_err(|e| Error::Network(format!("payment task died: {e}"))),
            Some(deadline) => match tokio::time::timeout(deadline, handle).await {
                Ok(joined) => {
                    joined.map_err(|e| Error::Network(format!("payment task died: {e}")))
                }
                // The external call cannot be cancelled mid-flight; the
                // task finishes and unwinds on its own while the caller
                // hears a timeout.
                Err(_) => Ok(timeout_result(&request, &entry_id)),
            },
        }
    }

    /// Replay the outcome already produced under an idempotency key.
    async fn replay(&self, key: &str, request: &PaymentRequest) -> Result<PaymentResult, Error> {
        let idem_key = format!("idem:{key}");
        let prior_entry = match self.inner.store.get(&idem_key).await? {
            Some(entry_id) => self.inner.ledger.get(&entry_id).await?,
            None => None,
        };
        match prior_entry {
            Some(entry) => Ok(result_from_entry(&entry)),
            // Claimed but not yet recorded: the first call is mid-flight.
            None => Ok(PaymentResult {
                success: false,
                status: PaymentStatus::Pending,
                method: None,
                provider_tx_id: None,
                tx_hash: None,
                amount: request.amount,
                recipient: request.recipient.clone(),
                guards_passed: Vec::new(),
                error_kind: None,
                error_message: None,
                ledger_entry_id: None,
                metadata: BTreeMap::new(),
            }),
        }
    }

    /// Dry-run a payment: trust verdict, guard checks, available
    /// balance, route and adapter simulation. Acquires no locks and
    /// mutates no counters.
    pub async fn simulate(&self, request: PaymentRequest) -> Result<SimulationResult, Error> {
        validate_request(&request)?;
        let inner = &self.inner;
        let wallet = inner.custody.wallet(&request.wallet_id).await?;
        let mut would_succeed = true;
        let mut reason: Option<String> = None;

        if request.trust_check != TrustOverride::Off {
            if let Some(hook) = &inner.trust {
                match hook.evaluate(&request).await? {
                    TrustVerdict::Approve => {}
                    TrustVerdict::Hold => {
                        would_succeed = false;
                        reason = Some("trust hook would hold this payment".to_owned());
                    }
                    TrustVerdict::Block => {
                        would_succeed = false;
                        reason = Some("trust hook would block this payment".to_owned());
                    }
                }
            } else if request.trust_check == TrustOverride::On {
                return Err(Error::Configuration(
                    "trust check requested but no trust hook is configured".to_owned(),
                ));
            }
        }

        let mut guards_passed = Vec::new();
        let mut guards_failed = Vec::new();
        if !request.skip_guards {
            let chain = inner
                .guards
                .chain_for(&request.wallet_id, request.wallet_set_id.as_deref())
                .await?;
            let ctx = guard_context(&request);
            let env = GuardEnv { store: inner.store.as_ref(), approval: None };
            for (guard, decision) in chain.check_all(&env, &ctx).await? {
                if decision.allowed {
                    guards_passed.push(guard);
                } else {
                    would_succeed = false;
                    guards_failed.push(GuardFinding { guard, reason: decision.reason });
                }
            }
        }

        let available = self.available_balance(&request.wallet_id).await?;
        if available < request.amount {
            would_succeed = false;
            reason.get_or_insert(format!(
                "insufficient balance: available {available}, requested {}",
                request.amount
            ));
        }

        let (route, estimated_fee) = match inner.router.select(&request, &wallet) {
            Ok(adapter) => {
                let sim = adapter.simulate(&request, &wallet).await?;
                if !sim.would_succeed {
                    would_succeed = false;
                }
                if reason.is_none() {
                    reason = sim.reason;
                }
                (Some(adapter.method()), sim.estimated_fee)
            }
            Err(err) => {
                would_succeed = false;
                reason.get_or_insert(err.to_string());
                (None, None)
            }
        };

        Ok(SimulationResult {
            would_succeed,
            route,
            estimated_fee,
            guards_passed,
            guards_failed,
            reason,
        })
    }

    /// Run up to `concurrency` payments in parallel. Each is independent;
    /// there is no cross-payment atomicity.
    pub async fn batch_pay(
        &self,
        requests: Vec<PaymentRequest>,
        concurrency: usize,
    ) -> BatchResult {
        let concurrency = concurrency.max(1);
        let mut indexed: Vec<(usize, PaymentResult)> = futures::stream::iter(
            requests.into_iter().enumerate().map(|(index, request)| {
                let engine = self.clone();
                async move {
                    let amount = request.amount;
                    let recipient = request.recipient.clone();
                    let result = engine
                        .pay(request)
                        .await
                        .unwrap_or_else(|err| error_result(amount, recipient, &err));
                    (index, result)
                }
            }),
        )
        .buffer_unordered(concurrency)
        .collect()
        .await;
        indexed.sort_by_key(|(index, _)| *index);
        let results: Vec<PaymentResult> = indexed.into_iter().map(|(_, r)| r).collect();
        let succeeded = results.iter().filter(|r| r.success).count();
        let failed = results.len() - succeeded;
        BatchResult { results, succeeded, failed }
    }

    /// Create a payment intent: guard checks, then a reservation, a
    /// pending ledger entry, and the intent record.
    pub async fn create_intent(&self, params: CreateIntent) -> Result<PaymentIntent, Error> {
        let inner = &self.inner;
        let chain =
            inner.guards.chain_for(&params.wallet_id, params.wallet_set_id.as_deref()).await?;
        let ctx = GuardContext {
            wallet_id: params.wallet_id.clone(),
            wallet_set_id: params.wallet_set_id.clone(),
            recipient: params.recipient.clone(),
            amount: params.amount,
            purpose: params.purpose.clone(),
        };
        let env = GuardEnv { store: inner.store.as_ref(), approval: None };
        for (guard, decision) in chain.check_all(&env, &ctx).await? {
            // The confirm guard is satisfied by the intent flow itself.
            if !decision.allowed && guard != "confirm" {
                return Err(Error::GuardBlocked {
                    guard,
                    reason: decision.reason.unwrap_or_default(),
                });
            }
        }
        inner.intents.create(params).await
    }

    /// Confirm an intent, executing its payment through the pipeline.
    pub async fn confirm_intent(
        &self,
        intent_id: &str,
    ) -> Result<(PaymentIntent, PaymentResult), Error> {
        let intent = self.inner.intents.begin_confirm(intent_id).await?;
        let mut request = PaymentRequest::new(
            intent.wallet_id.clone(),
            intent.recipient.clone(),
            intent.amount,
        );
        request.metadata = intent.metadata.clone();
        request.idempotency_key = Some(format!("intent-{intent_id}"));
        let result = self
            .inner
            .run_pipeline(
                request,
                intent.ledger_entry_id.clone(),
                Some(intent.id.clone()),
                false,
            )
            .await;
        let settled = self.inner.intents.finish_confirm(intent_id, result.success).await?;
        Ok((settled, result))
    }

    /// Cancel an unconfirmed intent.
    pub async fn cancel_intent(&self, intent_id: &str) -> Result<PaymentIntent, Error> {
        self.inner.intents.cancel(intent_id).await
    }

    /// Fetch an intent, auto-cancelling on expiry.
    pub async fn get_intent(&self, intent_id: &str) -> Result<PaymentIntent, Error> {
        self.inner.intents.get(intent_id).await
    }

    /// Append a guard to a wallet's chain.
    pub async fn add_guard(&self, wallet_id: &str, guard: GuardConfig) -> Result<(), Error> {
        self.inner.guards.add(wallet_id, guard).await
    }

    /// Append a guard to a wallet-set's chain.
    pub async fn add_guard_for_set(&self, set_id: &str, guard: GuardConfig) -> Result<(), Error> {
        self.inner.guards.add_for_set(set_id, guard).await
    }

    /// Remove every guard named `name` from a wallet's chain.
    pub async fn remove_guard(&self, wallet_id: &str, name: &str) -> Result<(), Error> {
        self.inner.guards.remove(wallet_id, name).await
    }

    /// Remove every guard named `name` from a wallet-set's chain.
    pub async fn remove_guard_for_set(&self, set_id: &str, name: &str) -> Result<(), Error> {
        self.inner.guards.remove_for_set(set_id, name).await
    }

    /// List a wallet's guards.
    pub async fn list_guards(&self, wallet_id: &str) -> Result<Vec<GuardConfig>, Error> {
        self.inner.guards.list(wallet_id).await
    }

    /// List a wallet-set's guards.
    pub async fn list_guards_for_set(&self, set_id: &str) -> Result<Vec<GuardConfig>, Error> {
        self.inner.guards.list_for_set(set_id).await
    }

    /// Query the audit ledger.
    pub async fn query_ledger(&self, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>, Error> {
        self.inner.ledger.query(filter).await
    }

    /// Fetch one ledger entry.
    pub async fn get_ledger_entry(&self, entry_id: &str) -> Result<Option<LedgerEntry>, Error> {
        self.inner.ledger.get(entry_id).await
    }

    /// Re-poll the custody provider for a pending entry's transaction and
    /// fold the result into the ledger.
    pub async fn sync_transaction(&self, entry_id: &str) -> Result<LedgerEntry, Error> {
        let inner = &self.inner;
        let entry = inner
            .ledger
            .get(entry_id)
            .await?
            .ok_or_else(|| Error::Validation(format!("no ledger entry {entry_id}")))?;
        if entry.status != PaymentStatus::Pending {
            return Ok(entry);
        }
        let Some(provider_tx_id) = entry.provider_tx_id.clone() else {
            return Ok(entry);
        };
        let receipt = inner.custody.transaction_state(&provider_tx_id).await?;
        let status = match receipt.state {
            CustodyTxState::Complete | CustodyTxState::Confirmed => PaymentStatus::Completed,
            CustodyTxState::Failed | CustodyTxState::Cancelled => PaymentStatus::Failed,
            CustodyTxState::Queued | CustodyTxState::Sent => return Ok(entry),
        };
        inner
            .ledger
            .update_status(
                entry_id,
                status,
                entry.method,
                Some(&provider_tx_id),
                receipt.tx_hash.as_deref(),
                None,
            )
            .await
    }

    /// Live balance minus open reservations.
    pub async fn available_balance(&self, wallet_id: &str) -> Result<Amount, Error> {
        let balance = self.inner.custody.balance(wallet_id).await?;
        let reserved = self.inner.reservations.total_for(wallet_id).await?;
        Ok(balance.saturating_sub(reserved))
    }
}

impl Inner {
    /// Steps 2-10. `existing_reservation` marks the confirm path: the
    /// intent's own hold is excluded from the availability check, and
    /// queue-background degrades to retry-then-fail.
    async fn run_pipeline(
        &self,
        request: PaymentRequest,
        entry_id: String,
        exclude_intent: Option<String>,
        may_queue: bool,
    ) -> PaymentResult {
        let ctx = guard_context(&request);
        let env = GuardEnv {
            store: self.store.as_ref(),
            approval: self.approval.as_deref(),
        };

        // Step 2: trust hook.
        match self.trust_verdict(&request).await {
            Ok(None) => {}
            Ok(Some(TrustVerdict::Block)) => {
                let err = Error::GuardBlocked {
                    guard: "trust".to_owned(),
                    reason: "trust hook blocked this payment".to_owned(),
                };
                return self
                    .settle_failure(&request, &entry_id, PaymentStatus::Blocked, &err, &[], None)
                    .await;
            }
            Ok(Some(TrustVerdict::Hold)) => {
                return self.queue_intent(&request, &entry_id, "trustHold").await;
            }
            Ok(Some(TrustVerdict::Approve)) => {}
            Err(err) => {
                return self
                    .settle_failure(&request, &entry_id, PaymentStatus::Failed, &err, &[], None)
                    .await;
            }
        }

        // Step 3: guard chain reservation.
        let chain = match self
            .guards
            .chain_for(&request.wallet_id, request.wallet_set_id.as_deref())
            .await
        {
            Ok(chain) => chain,
            Err(err) => {
                return self
                    .settle_failure(&request, &entry_id, PaymentStatus::Failed, &err, &[], None)
                    .await;
            }
        };
        let reservation: Option<ChainReservation> = if request.skip_guards {
            None
        } else {
            match chain.reserve(&env, &ctx).await {
                Ok(held) => Some(held),
                Err(err) => {
                    let status = match &err {
                        Error::GuardBlocked { .. } => PaymentStatus::Blocked,
                        _ => PaymentStatus::Failed,
                    };
                    return self
                        .settle_failure(&request, &entry_id, status, &err, &[], None)
                        .await;
                }
            }
        };
        let guards_passed: Vec<String> =
            reservation.as_ref().map(ChainReservation::guard_names).unwrap_or_default();

        // The wallet lookup feeds routing and the availability check.
        let wallet = match self.custody.wallet(&request.wallet_id).await {
            Ok(wallet) => wallet,
            Err(err) => {
                self.release_guards(&chain, &env, &ctx, reservation.as_ref()).await;
                return self
                    .settle_failure(
                        &request,
                        &entry_id,
                        PaymentStatus::Failed,
                        &err,
                        &guards_passed,
                        None,
                    )
                    .await;
            }
        };

        // Step 4: fund lock.
        let lock_token = match self.fund_lock.acquire(&request.wallet_id).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                self.release_guards(&chain, &env, &ctx, reservation.as_ref()).await;
                let err = Error::WalletBusy(request.wallet_id.clone());
                return self
                    .settle_failure(
                        &request,
                        &entry_id,
                        PaymentStatus::Failed,
                        &err,
                        &guards_passed,
                        None,
                    )
                    .await;
            }
            Err(err) => {
                self.release_guards(&chain, &env, &ctx, reservation.as_ref()).await;
                return self
                    .settle_failure(
                        &request,
                        &entry_id,
                        PaymentStatus::Failed,
                        &err,
                        &guards_passed,
                        None,
                    )
                    .await;
            }
        };

        // Step 5: live balance against open reservations.
        let available =
            match self.available_for(&request.wallet_id, exclude_intent.as_deref()).await {
                Ok(available) => available,
                Err(err) => {
                    self.release_guards(&chain, &env, &ctx, reservation.as_ref()).await;
                    self.unlock(&request.wallet_id, &lock_token).await;
                    return self
                        .settle_failure(
                            &request,
                            &entry_id,
                            PaymentStatus::Failed,
                            &err,
                            &guards_passed,
                            None,
                        )
                        .await;
                }
            };
        if available < request.amount {
            let err = Error::InsufficientBalance { available, requested: request.amount };
            self.release_guards(&chain, &env, &ctx, reservation.as_ref()).await;
            self.unlock(&request.wallet_id, &lock_token).await;
            return self
                .settle_failure(
                    &request,
                    &entry_id,
                    PaymentStatus::Failed,
                    &err,
                    &guards_passed,
                    None,
                )
                .await;
        }

        // Step 6: route.
        let adapter = match self.router.select(&request, &wallet) {
            Ok(adapter) => adapter,
            Err(err) => {
                self.release_guards(&chain, &env, &ctx, reservation.as_ref()).await;
                self.unlock(&request.wallet_id, &lock_token).await;
                return self
                    .settle_failure(
                        &request,
                        &entry_id,
                        PaymentStatus::Failed,
                        &err,
                        &guards_passed,
                        None,
                    )
                    .await;
            }
        };

        // Step 7: execute under the breaker, per resilience strategy.
        let mut route_meta: BTreeMap<String, String> = BTreeMap::new();
        let outcome =
            self.execute_with_strategy(&request, &wallet, adapter.as_ref(), &mut route_meta).await;

        match outcome {
            Ok(receipt) => {
                // Step 8: finalize guard usage.
                if let Some(held) = reservation.as_ref() {
                    if let Err(err) = chain.commit(&env, &ctx, held).await {
                        tracing::warn!(error = %err, "guard commit failed after execution");
                    }
                }
                // Step 9: terminal ledger entry.
                let entry = self
                    .ledger
                    .update_status(
                        &entry_id,
                        PaymentStatus::Completed,
                        Some(adapter.method()),
                        receipt.provider_tx_id.as_deref(),
                        receipt.tx_hash.as_deref(),
                        Some(&route_meta),
                    )
                    .await;
                if let Err(err) = &entry {
                    tracing::error!(entry = %entry_id, error = %err, "ledger finalize failed");
                }
                // Step 10: unlock.
                self.unlock(&request.wallet_id, &lock_token).await;
                PaymentResult {
                    success: true,
                    status: PaymentStatus::Completed,
                    method: Some(adapter.method()),
                    provider_tx_id: receipt.provider_tx_id,
                    tx_hash: receipt.tx_hash,
                    amount: request.amount,
                    recipient: request.recipient.clone(),
                    guards_passed,
                    error_kind: None,
                    error_message: None,
                    ledger_entry_id: Some(entry_id),
                    metadata: route_meta,
                }
            }
            Err(err) => {
                // Step 8: roll back guard usage.
                self.release_guards(&chain, &env, &ctx, reservation.as_ref()).await;
                self.unlock(&request.wallet_id, &lock_token).await;
                if may_queue
                    && matches!(err, Error::CircuitOpen(_))
                    && request.resilience
                        == crate::models::ResilienceStrategy::QueueBackground
                {
                    return self.queue_intent(&request, &entry_id, "circuitOpen").await;
                }
                let mut result = self
                    .settle_failure(
                        &request,
                        &entry_id,
                        PaymentStatus::Failed,
                        &err,
                        &guards_passed,
                        Some(&route_meta),
                    )
                    .await;
                result.method = Some(adapter.method());
                result
            }
        }
    }

    /// Evaluate the trust hook per the request's override. `Ok(None)`
    /// means "not consulted".
    async fn trust_verdict(
        &self,
        request: &PaymentRequest,
    ) -> Result<Option<TrustVerdict>, Error> {
        match (request.trust_check, &self.trust) {
            (TrustOverride::Off, _) => Ok(None),
            (TrustOverride::On, None) => Err(Error::Configuration(
                "trust check requested but no trust hook is configured".to_owned(),
            )),
            (_, None) => Ok(None),
            (_, Some(hook)) => hook.evaluate(request).await.map(Some),
        }
    }

    async fn available_for(
        &self,
        wallet_id: &str,
        exclude_intent: Option<&str>,
    ) -> Result<Amount, Error> {
        let balance = self.custody.balance(wallet_id).await?;
        let mut reserved = self.reservations.total_for(wallet_id).await?;
        if let Some(intent_id) = exclude_intent {
            if let Some(own) = self.reservations.amount_for(intent_id).await? {
                reserved = reserved.saturating_sub(own);
            }
        }
        Ok(balance.saturating_sub(reserved))
    }

    /// Step 7's strategy matrix: breaker always wraps the adapter; the
    /// retry policy only runs for the retrying strategies.
    ///
    /// The metadata sink is reused across attempts so that whatever the
    /// last attempt learned (burn hash, attestation URL) survives into
    /// the ledger even when it ultimately failed.
    async fn execute_with_strategy(
        &self,
        request: &PaymentRequest,
        wallet: &WalletInfo,
        adapter: &dyn PaymentAdapter,
        meta: &mut BTreeMap<String, String>,
    ) -> Result<crate::routing::AdapterReceipt, Error> {
        use crate::models::ResilienceStrategy;
        if request.resilience == ResilienceStrategy::FailFast {
            return self.execute_once(request, wallet, adapter, meta).await;
        }
        let mut retries_used: u32 = 0;
        loop {
            match self.execute_once(request, wallet, adapter, meta).await {
                Ok(receipt) => return Ok(receipt),
                Err(err) => {
                    if !err.is_transient() || retries_used >= self.retry.max_retries {
                        return Err(err);
                    }
                    retries_used += 1;
                    let wait = self.retry.delay_for(retries_used);
                    tracing::info!(
                        retry = retries_used,
                        adapter = adapter.name(),
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "retrying payment after transient failure",
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// One breaker-guarded adapter execution.
    async fn execute_once(
        &self,
        request: &PaymentRequest,
        wallet: &WalletInfo,
        adapter: &dyn PaymentAdapter,
        meta: &mut BTreeMap<String, String>,
    ) -> Result<crate::routing::AdapterReceipt, Error> {
        let service = adapter.name();
        self.breaker.try_acquire(service).await?;
        match adapter.execute(request, wallet, meta).await {
            Ok(receipt) => {
                // Breaker bookkeeping must never fail a payment that
                // already moved funds.
                if let Err(err) = self.breaker.record_success(service).await {
                    tracing::warn!(service, error = %err, "breaker success record failed");
                }
                Ok(receipt)
            }
            Err(err) => {
                // Only upstream trouble counts against the service's
                // health; caller mistakes do not.
                if matches!(err, Error::Network(_) | Error::Timeout(_) | Error::Protocol(_)) {
                    if let Err(record_err) = self.breaker.record_failure(service).await {
                        tracing::warn!(service, error = %record_err, "breaker failure record failed");
                    }
                }
                Err(err)
            }
        }
    }

    /// Materialize an intent instead of failing, for trust holds and for
    /// queue-background behind an open circuit.
    async fn queue_intent(
        &self,
        request: &PaymentRequest,
        entry_id: &str,
        cause: &str,
    ) -> PaymentResult {
        let create = CreateIntent {
            wallet_id: request.wallet_id.clone(),
            wallet_set_id: request.wallet_set_id.clone(),
            recipient: request.recipient.clone(),
            amount: request.amount,
            currency: None,
            expires_in: None,
            purpose: request.purpose.clone(),
            metadata: request.metadata.clone(),
        };
        match self
            .intents
            .create_with_ledger_entry(create, Some(entry_id.to_owned()))
            .await
        {
            Ok(intent) => {
                let mut delta = BTreeMap::new();
                delta.insert("queued".to_owned(), "true".to_owned());
                delta.insert("queueCause".to_owned(), cause.to_owned());
                delta.insert("intentId".to_owned(), intent.id.clone());
                if let Err(err) = self
                    .ledger
                    .update_status(entry_id, PaymentStatus::Pending, None, None, None, Some(&delta))
                    .await
                {
                    tracing::warn!(entry = entry_id, error = %err, "queue metadata merge failed");
                }
                PaymentResult {
                    success: true,
                    status: PaymentStatus::Pending,
                    method: None,
                    provider_tx_id: None,
                    tx_hash: None,
                    amount: request.amount,
                    recipient: request.recipient.clone(),
                    guards_passed: Vec::new(),
                    error_kind: None,
                    error_message: None,
                    ledger_entry_id: Some(entry_id.to_owned()),
                    metadata: delta,
                }
            }
            Err(err) => {
                self.settle_failure(
                    request,
                    entry_id,
                    PaymentStatus::Failed,
                    &err,
                    &[],
                    None,
                )
                .await
            }
        }
    }

    async fn release_guards(
        &self,
        chain: &crate::guards::GuardChain,
        env: &GuardEnv<'_>,
        ctx: &GuardContext,
        reservation: Option<&ChainReservation>,
    ) {
        if let Some(held) = reservation {
            if let Err(err) = chain.release(env, ctx, held).await {
                tracing::warn!(error = %err, "guard release failed");
            }
        }
    }

    async fn unlock(&self, wallet_id: &str, token: &str) {
        match self.fund_lock.release_with_key(wallet_id, token).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(wallet = wallet_id, "fund lock expired before release"),
            Err(err) => tracing::warn!(wallet = wallet_id, error = %err, "fund lock release failed"),
        }
    }

    /// Move the ledger entry to its terminal status and shape the
    /// failure result.
    async fn settle_failure(
        &self,
        request: &PaymentRequest,
        entry_id: &str,
        status: PaymentStatus,
        err: &Error,
        guards_passed: &[String],
        route_meta: Option<&BTreeMap<String, String>>,
    ) -> PaymentResult {
        let mut delta = route_meta.cloned().unwrap_or_default();
        delta.insert("errorKind".to_owned(), err.kind().to_owned());
        if let Err(ledger_err) =
            self.ledger.update_status(entry_id, status, None, None, None, Some(&delta)).await
        {
            tracing::error!(entry = entry_id, error = %ledger_err, "ledger settle failed");
        }
        tracing::info!(entry = entry_id, kind = err.kind(), "payment did not complete");
        PaymentResult {
            success: false,
            status,
            method: None,
            provider_tx_id: None,
            tx_hash: None,
            amount: request.amount,
            recipient: request.recipient.clone(),
            guards_passed: guards_passed.to_vec(),
            error_kind: Some(err.kind().to_owned()),
            error_message: Some(err.to_string()),
            ledger_entry_id: Some(entry_id.to_owned()),
            metadata: delta,
        }
    }
}

fn validate_request(request: &PaymentRequest) -> Result<(), Error> {
    if request.wallet_id.trim().is_empty() {
        return Err(Error::Validation("wallet id is empty".to_owned()));
    }
    if request.recipient.trim().is_empty() {
        return Err(Error::Validation("recipient is empty".to_owned()));
    }
    if !request.amount.is_positive() {
        return Err(Error::Validation(format!(
            "amount must be positive, got {}",
            request.amount
        )));
    }
    Ok(())
}

fn guard_context(request: &PaymentRequest) -> GuardContext {
    GuardContext {
        wallet_id: request.wallet_id.clone(),
        wallet_set_id: request.wallet_set_id.clone(),
        recipient: request.recipient.clone(),
        amount: request.amount,
        purpose: request.purpose.clone(),
    }
}

fn pending_entry(request: &PaymentRequest, entry_id: &str) -> LedgerEntry {
    let now = Utc::now();
    LedgerEntry {
        id: entry_id.to_owned(),
        wallet_id: request.wallet_id.clone(),
        wallet_set_id: request.wallet_set_id.clone(),
        recipient: request.recipient.clone(),
        amount: request.amount,
        status: PaymentStatus::Pending,
        method: None,
        provider_tx_id: None,
        tx_hash: None,
        guards_passed: Vec::new(),
        created_at: now,
        updated_at: now,
        purpose: request.purpose.clone(),
        metadata: request.metadata.clone(),
    }
}

fn result_from_entry(entry: &LedgerEntry) -> PaymentResult {
    PaymentResult {
        success: entry.status == PaymentStatus::Completed,
        status: entry.status,
        method: entry.method,
        provider_tx_id: entry.provider_tx_id.clone(),
        tx_hash: entry.tx_hash.clone(),
        amount: entry.amount,
        recipient: entry.recipient.clone(),
        guards_passed: entry.guards_passed.clone(),
        error_kind: entry.metadata.get("errorKind").cloned(),
        error_message: None,
        ledger_entry_id: Some(entry.id.clone()),
        metadata: entry.metadata.clone(),
    }
}

fn timeout_result(request: &PaymentRequest, entry_id: &str) -> PaymentResult {
    let err = Error::Timeout("payment deadline elapsed".to_owned());
    PaymentResult {
        success: false,
        status: PaymentStatus::Pending,
        method: None,
        provider_tx_id: None,
        tx_hash: None,
        amount: request.amount,
        recipient: request.recipient.clone(),
        guards_passed: Vec::new(),
        error_kind: Some(err.kind().to_owned()),
        error_message: Some(err.to_string()),
        ledger_entry_id: Some(entry_id.to_owned()),
        metadata: BTreeMap::new(),
    }
}

fn error_result(amount: Amount, recipient: String, err: &Error) -> PaymentResult {
    PaymentResult {
        success: false,
        status: PaymentStatus::Failed,
        method: None,
        provider_tx_id: None,
        tx_hash: None,
        amount,
        recipient,
        guards_passed: Vec::new(),
        error_kind: Some(err.kind().to_owned()),
        error_message: Some(err.to_string()),
        ledger_entry_id: None,
        metadata: BTreeMap::new(),
    }
}
