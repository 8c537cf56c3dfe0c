//! Payment request and result types.

use std::{collections::BTreeMap, time::Duration};

use super::{amount::Amount, network::Network};

/// What a free-form recipient string turned out to be.
///
/// Classification is deterministic and happens once, at route time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecipientKind {
    /// A blockchain address, hex (EVM) or Base58 (Solana-family).
    ChainAddress,
    /// An `http://` or `https://` URL for negotiated HTTP-402 payment.
    HttpUrl,
    /// Anything else; no adapter will match.
    Other,
}

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Classify a recipient string.
pub fn classify_recipient(recipient: &str) -> RecipientKind {
    if recipient.starts_with("http://") || recipient.starts_with("https://") {
        return RecipientKind::HttpUrl;
    }
    if is_evm_address(recipient) || is_base58_address(recipient) {
        return RecipientKind::ChainAddress;
    }
    RecipientKind::Other
}

/// 40 hex digits with an optional `0x` prefix.
pub fn is_evm_address(s: &str) -> bool {
    let hex = s.strip_prefix("0x").unwrap_or(s);
    hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit())
}

/// Base58 string of plausible account-key length.
pub fn is_base58_address(s: &str) -> bool {
    (32..=44).contains(&s.len()) && s.chars().all(|c| BASE58_ALPHABET.contains(c))
}

/// Relative fee priority forwarded to the custody provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeLevel {
    /// Cheapest, slowest.
    Low,
    /// Default.
    #[default]
    Medium,
    /// Most expensive, fastest.
    High,
}

/// How the pipeline reacts to transient upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResilienceStrategy {
    /// Surface the first error immediately, no retry.
    FailFast,
    /// Retry transient errors with backoff; an open circuit still surfaces
    /// immediately.
    #[default]
    RetryThenFail,
    /// On an open circuit, materialize a payment intent with a fund
    /// reservation instead of failing the caller.
    QueueBackground,
}

/// Caller control over the optional pre-flight trust hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrustOverride {
    /// Require the hook; error if none is configured.
    On,
    /// Skip the hook even when configured.
    Off,
    /// Invoke the hook iff one is configured.
    #[default]
    Auto,
}

/// How long the cross-chain adapter waits for an attestation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttestationMode {
    /// Seconds-scale finality; poll tightly, give up early.
    #[default]
    Fast,
    /// Full-finality attestation; may take tens of minutes.
    Standard,
}

/// A request to move funds out of a custodial wallet.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    /// Wallet to spend from.
    pub wallet_id: String,
    /// Wallet set the wallet belongs to, when known by the caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet_set_id: Option<String>,
    /// Free-form recipient: chain address, URL, or anything else.
    pub recipient: String,
    /// Amount to pay.
    pub amount: Amount,
    /// Destination network; present and different from the wallet's network
    /// means a cross-chain payment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_network: Option<Network>,
    /// Free-text purpose recorded in the ledger.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    /// Opaque caller metadata, merged into the ledger entry.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Idempotency key; repeated identical requests with the same key
    /// produce one custody-side effect and one ledger entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Fee priority.
    #[serde(default)]
    pub fee_level: FeeLevel,
    /// Skip the guard chain entirely. For embedder-internal flows only.
    #[serde(default)]
    pub skip_guards: bool,
    /// Trust hook control.
    #[serde(default)]
    pub trust_check: TrustOverride,
    /// Ask the custody provider to wait for on-chain confirmation.
    #[serde(default)]
    pub wait_for_confirmation: bool,
    /// Caller deadline for the whole pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "optional_duration_secs")]
    pub timeout: Option<Duration>,
    /// Failure-handling strategy.
    #[serde(default)]
    pub resilience: ResilienceStrategy,
    /// Attestation wait mode for cross-chain payments.
    #[serde(default)]
    pub attestation_mode: AttestationMode,
}

impl PaymentRequest {
    /// A request with defaults everywhere but the three required fields.
    pub fn new(
        wallet_id: impl Into<String>,
        recipient: impl Into<String>,
        amount: Amount,
    ) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            wallet_set_id: None,
            recipient: recipient.into(),
            amount,
            destination_network: None,
            purpose: None,
            metadata: BTreeMap::new(),
            idempotency_key: None,
            fee_level: FeeLevel::default(),
            skip_guards: false,
            trust_check: TrustOverride::default(),
            wait_for_confirmation: false,
            timeout: None,
            resilience: ResilienceStrategy::default(),
            attestation_mode: AttestationMode::default(),
        }
    }
}

mod optional_duration_secs {
    //! Serialize `Option<Duration>` as whole seconds.

    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs: Option<u64> = Option::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

/// Transport a payment was (or would be) routed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TransportMethod {
    /// Direct custody transfer on the wallet's own network.
    #[serde(rename = "TRANSFER")]
    Transfer,
    /// Negotiated HTTP-402 payment against a URL.
    #[serde(rename = "HTTP_402")]
    Http402,
    /// Burn/attest/mint across two networks.
    #[serde(rename = "CROSS_CHAIN")]
    CrossChain,
}

/// Lifecycle status of a payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// Recorded, side effects may be in flight.
    Pending,
    /// Funds moved.
    Completed,
    /// Gave up; no (reconciled) funds moved.
    Failed,
    /// A guard or the trust hook rejected it.
    Blocked,
    /// Withdrawn before execution.
    Cancelled,
}

impl PaymentStatus {
    /// Whether the status is final. Terminal ledger statuses are write-once.
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Outcome of a `pay` call.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResult {
    /// True when funds moved (or a deferred commitment was created).
    pub success: bool,
    /// Final (or, for queued payments, current) status.
    pub status: PaymentStatus,
    /// Transport the payment was routed over, when routing happened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<TransportMethod>,
    /// Custody provider's transaction id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_tx_id: Option<String>,
    /// On-chain transaction hash.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// Amount requested.
    pub amount: Amount,
    /// Recipient as given.
    pub recipient: String,
    /// Names of guards that passed reservation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guards_passed: Vec<String>,
    /// Machine-readable error kind when unsuccessful.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Human-readable error message when unsuccessful.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Ledger entry recording this attempt, when one was created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_entry_id: Option<String>,
    /// Route-specific metadata (e.g. cross-chain domains, attestation URL).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// One guard's verdict inside a simulation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardFinding {
    /// Guard name.
    pub guard: String,
    /// Why it would block, when it would.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Outcome of a `simulate` call. No funds move, no counters mutate.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    /// Whether the payment would be attempted as-is.
    pub would_succeed: bool,
    /// Transport it would be routed over.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<TransportMethod>,
    /// Adapter's fee estimate, when it can produce one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_fee: Option<Amount>,
    /// Guards that would pass.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guards_passed: Vec<String>,
    /// Guards that would block, with reasons.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guards_failed: Vec<GuardFinding>,
    /// Free-form explanation of the verdict.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Aggregate outcome of a `batch_pay` call.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    /// Per-request results, in input order.
    pub results: Vec<PaymentResult>,
    /// How many succeeded.
    pub succeeded: usize,
    /// How many failed.
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_deterministic() {
        assert_eq!(
            classify_recipient("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
            RecipientKind::ChainAddress
        );
        assert_eq!(
            classify_recipient("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
            RecipientKind::ChainAddress
        );
        assert_eq!(
            classify_recipient("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v"),
            RecipientKind::ChainAddress
        );
        assert_eq!(classify_recipient("https://api.example.com/tool"), RecipientKind::HttpUrl);
        assert_eq!(classify_recipient("http://localhost:4021/pay"), RecipientKind::HttpUrl);
        assert_eq!(classify_recipient("bob@example.com"), RecipientKind::Other);
        // 0x prefix with bad length is not an address.
        assert_eq!(classify_recipient("0xabc"), RecipientKind::Other);
        // Base58 excludes 0, O, I, l.
        assert_eq!(
            classify_recipient("O0000000000000000000000000000000000"),
            RecipientKind::Other
        );
    }

    #[test]
    fn request_serde_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let mut req = PaymentRequest::new("w-1", "https://pay.example.com", Amount::parse("5")?);
        req.timeout = Some(Duration::from_secs(30));
        req.resilience = ResilienceStrategy::QueueBackground;
        let json = serde_json::to_string(&req)?;
        assert!(json.contains("\"walletId\":\"w-1\""));
        assert!(json.contains("\"resilience\":\"queueBackground\""));
        let back: PaymentRequest = serde_json::from_str(&json)?;
        assert_eq!(back.timeout, Some(Duration::from_secs(30)));
        assert_eq!(back.fee_level, FeeLevel::Medium);
        Ok(())
    }

    #[test]
    fn status_terminality() {
        assert!(!PaymentStatus::Pending.is_terminal());
        assert!(PaymentStatus::Completed.is_terminal());
        assert!(PaymentStatus::Blocked.is_terminal());
    }

    #[test]
    fn transport_wire_names() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(serde_json::to_string(&TransportMethod::Http402)?, "\"HTTP_402\"");
        assert_eq!(serde_json::to_string(&TransportMethod::CrossChain)?, "\"CROSS_CHAIN\"");
        Ok(())
    }
}
