//! Two-phase payment intents.
//!
//! An intent holds a fund reservation from creation until it reaches a
//! terminal state, so other payments see a reduced available balance in
//! the meantime. Expiry is enforced lazily, on read.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use agentpay_store::Store;
use chrono::Utc;

use crate::{
    error::Error,
    ledger::AuditLedger,
    models::{Amount, IntentStatus, LedgerEntry, PaymentIntent, PaymentStatus},
    reservations::ReservationRegistry,
};

/// Default lifetime of an unconfirmed intent.
pub const DEFAULT_INTENT_TTL: Duration = Duration::from_secs(900);

fn intent_key(id: &str) -> String {
    format!("intent:{id}")
}

/// Inputs for creating an intent.
#[derive(Debug, Clone)]
pub struct CreateIntent {
    /// Wallet the reservation is held against.
    pub wallet_id: String,
    /// Wallet set, when known.
    pub wallet_set_id: Option<String>,
    /// Recipient of the eventual payment.
    pub recipient: String,
    /// Amount to reserve and eventually pay.
    pub amount: Amount,
    /// Currency tag; defaults to USDC.
    pub currency: Option<String>,
    /// Lifetime before auto-cancel; defaults to 15 minutes.
    pub expires_in: Option<Duration>,
    /// Free-text purpose for the ledger.
    pub purpose: Option<String>,
    /// Free-form metadata.
    pub metadata: BTreeMap<String, String>,
}

/// What an atomic status transition observed.
enum Transition {
    /// No intent stored under the id.
    Missing,
    /// The transition applied; the intent now has the new status.
    Moved(PaymentIntent),
    /// The transition did not apply; the intent is returned as stored.
    Unchanged(PaymentIntent),
}

/// Storage-backed intent state machine.
///
/// The orchestrator drives `confirm`; this service owns persistence and
/// the guarded status transitions.
#[derive(Clone)]
pub struct IntentService {
    store: Arc<dyn Store>,
    ledger: AuditLedger,
    reservations: ReservationRegistry,
}

impl std::fmt::Debug for IntentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentService").finish_non_exhaustive()
    }
}

impl IntentService {
    /// Creates the service over shared components.
    pub fn new(
        store: Arc<dyn Store>,
        ledger: AuditLedger,
        reservations: ReservationRegistry,
    ) -> Self {
        Self { store, ledger, reservations }
    }

    /// Create an intent: reservation first, then a pending ledger entry,
    /// then the intent record.
    ///
    /// The caller (the orchestrator) is responsible for running guard
    /// checks before this point.
    pub async fn create(&self, params: CreateIntent) -> Result<PaymentIntent, Error> {
        self.create_with_ledger_entry(params, None).await
    }

    /// Like [`IntentService::create`], but attach the intent to an
    /// existing pending ledger entry instead of recording a fresh one
    /// (used when a payment is queued behind an open circuit).
    pub async fn create_with_ledger_entry(
        &self,
        params: CreateIntent,
        ledger_entry_id: Option<String>,
    ) -> Result<PaymentIntent, Error> {
        if !params.amount.is_positive() {
            return Err(Error::Validation(format!(
                "intent amount must be positive, got {}",
                params.amount
            )));
        }
        let id = format!("in_{}", uuid::Uuid::new_v4().simple());
        let now = Utc::now();
        let ttl = params.expires_in.unwrap_or(DEFAULT_INTENT_TTL);
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|_| Error::Validation("intent lifetime out of range".to_owned()))?;

        self.reservations.reserve(&params.wallet_id, params.amount, &id).await?;

        let entry_id = match ledger_entry_id {
            Some(existing) => existing,
            None => {
                let entry_id = format!("le_{}", uuid::Uuid::new_v4().simple());
                let entry = LedgerEntry {
                    id: entry_id.clone(),
                    wallet_id: params.wallet_id.clone(),
                    wallet_set_id: params.wallet_set_id.clone(),
                    recipient: params.recipient.clone(),
                    amount: params.amount,
                    status: PaymentStatus::Pending,
                    method: None,
                    provider_tx_id: None,
                    tx_hash: None,
                    guards_passed: Vec::new(),
                    created_at: now,
                    updated_at: now,
                    purpose: params.purpose.clone(),
                    metadata: params.metadata.clone(),
                };
                if let Err(err) = self.ledger.record(&entry).await {
                    self.reservations.release(&id).await?;
                    return Err(err);
                }
                entry_id
            }
        };

        let intent = PaymentIntent {
            id: id.clone(),
            wallet_id: params.wallet_id,
            recipient: params.recipient,
            amount: params.amount,
            currency: params.currency.unwrap_or_else(|| "USDC".to_owned()),
            status: IntentStatus::RequiresConfirmation,
            reserved_amount: params.amount,
            ledger_entry_id: entry_id,
            created_at: now,
            expires_at,
            metadata: params.metadata,
        };
        let json = serde_json::to_string(&intent)
            .map_err(|e| Error::Validation(format!("unserializable intent: {e}")))?;
        if let Err(err) = self.store.put(&intent_key(&id), &json).await {
            self.reservations.release(&id).await?;
            return Err(err.into());
        }
        tracing::info!(
            intent = %id,
            wallet = %intent.wallet_id,
            amount = %intent.amount,
            "intent created",
        );
        Ok(intent)
    }

    /// Fetch an intent, auto-cancelling it when its expiry has passed.
    pub async fn get(&self, id: &str) -> Result<PaymentIntent, Error> {
        match self
            .transition(id, |intent, now| {
                (intent.status == IntentStatus::RequiresConfirmation && intent.expired_at(now))
                    .then_some(IntentStatus::Cancelled)
            })
            .await?
        {
            Transition::Missing => Err(Error::IntentNotFound(id.to_owned())),
            Transition::Unchanged(intent) => Ok(intent),
            Transition::Moved(intent) => {
                self.settle_cancelled(&intent).await?;
                Ok(intent)
            }
        }
    }

    /// Atomically move an intent from requires-confirmation to
    /// processing, enforcing expiry and terminality.
    pub async fn begin_confirm(&self, id: &str) -> Result<PaymentIntent, Error> {
        match self
            .transition(id, |intent, now| {
                if intent.status != IntentStatus::RequiresConfirmation {
                    return None;
                }
                if intent.expired_at(now) {
                    Some(IntentStatus::Cancelled)
                } else {
                    Some(IntentStatus::Processing)
                }
            })
            .await?
        {
            Transition::Missing => Err(Error::IntentNotFound(id.to_owned())),
            Transition::Moved(intent) if intent.status == IntentStatus::Processing => Ok(intent),
            Transition::Moved(intent) => {
                // Expiry raced the confirm: settle and report it.
                self.settle_cancelled(&intent).await?;
                Err(Error::IntentExpired(id.to_owned()))
            }
            Transition::Unchanged(_) => Err(Error::IntentAlreadyTerminal(id.to_owned())),
        }
    }

    /// Settle a processing intent after the pipeline ran.
    pub async fn finish_confirm(&self, id: &str, succeeded: bool) -> Result<PaymentIntent, Error> {
        let target = if succeeded { IntentStatus::Succeeded } else { IntentStatus::Failed };
        match self
            .transition(id, move |intent, _| {
                (intent.status == IntentStatus::Processing).then_some(target)
            })
            .await?
        {
            Transition::Missing => Err(Error::IntentNotFound(id.to_owned())),
            Transition::Moved(intent) => {
                self.reservations.release(id).await?;
                Ok(intent)
            }
            Transition::Unchanged(_) => Err(Error::IntentAlreadyTerminal(id.to_owned())),
        }
    }

    /// Cancel an unconfirmed intent, releasing its reservation.
    pub async fn cancel(&self, id: &str) -> Result<PaymentIntent, Error> {
        match self
            .transition(id, |intent, _| {
                (intent.status == IntentStatus::RequiresConfirmation)
                    .then_some(IntentStatus::Cancelled)
            })
            .await?
        {
            Transition::Missing => Err(Error::IntentNotFound(id.to_owned())),
            Transition::Moved(intent) => {
                self.settle_cancelled(&intent).await?;
                Ok(intent)
            }
            Transition::Unchanged(_) => Err(Error::IntentAlreadyTerminal(id.to_owned())),
        }
    }

    async fn settle_cancelled(&self, intent: &PaymentIntent) -> Result<(), Error> {
        self.reservations.release(&intent.id).await?;
        match self
            .ledger
            .update_status(&intent.ledger_entry_id, PaymentStatus::Cancelled, None, None, None, None)
            .await
        {
            Ok(_) => Ok(()),
            // A queued intent shares its ledger entry with the original
            // payment attempt, which may already be terminal.
            Err(Error::Validation(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Run `decide` inside one atomic read-modify-write of the intent.
    /// Returning `Some(status)` applies that status; `None` leaves the
    /// record untouched.
    async fn transition<F>(&self, id: &str, decide: F) -> Result<Transition, Error>
    where
        F: Fn(&PaymentIntent, chrono::DateTime<Utc>) -> Option<IntentStatus> + Send + Sync,
    {
        let key = intent_key(id);
        let mut observed: Option<(PaymentIntent, bool)> = None;
        self.store
            .update(&key, &mut |current| {
                observed = None;
                let json = current?;
                let mut intent: PaymentIntent = serde_json::from_str(json).ok()?;
                match decide(&intent, Utc::now()) {
                    Some(next) => {
                        intent.status = next;
                        if next.is_terminal() {
                            intent.reserved_amount = Amount::ZERO;
                        }
                        let json = serde_json::to_string(&intent).ok();
                        observed = Some((intent, true));
                        json
                    }
                    None => {
                        observed = Some((intent, false));
                        None
                    }
                }
            })
            .await?;
        Ok(match observed {
            None => Transition::Missing,
            Some((intent, true)) => Transition::Moved(intent),
            Some((intent, false)) => Transition::Unchanged(intent),
        })
    }
}
