//! Cross-chain burn/attest/mint payment.
//!
//! Drives the external cross-chain messaging protocol through the custody
//! provider's contract-execution capability: approve the token messenger,
//! `depositForBurn` on the source network, poll the attestation service
//! until it signs off, then `receiveMessage` on the destination, either
//! through a known relayer or through an embedder-owned wallet there.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use super::{AdapterReceipt, PaymentAdapter, RouteSimulation, transfer::TransferAdapter};
use crate::{
    custody::{ContractCall, CustodyProvider, CustodyTxState, WalletInfo},
    error::Error,
    models::{AttestationMode, Network, PaymentRequest, TransportMethod, is_evm_address},
};

/// Protocol version reported in result metadata.
const MESSAGE_VERSION: &str = "2";

/// Token messenger contract, deployed at the same address on every
/// supported EVM network.
const TOKEN_MESSENGER: &str = "0x28b5a0e9c621a5badaa536219b3a228c8168cf5d";

/// Message transmitter contract, likewise uniform across EVM networks.
const MESSAGE_TRANSMITTER: &str = "0x81d40f21f12a8f0e3252bccb954d722d4c464b64";

/// Finality thresholds the burn call accepts.
const FINALITY_FAST: u32 = 1_000;
const FINALITY_STANDARD: u32 = 2_000;

/// USDC token contract on each supported network.
const fn usdc_address(network: Network) -> Option<&'static str> {
    match network {
        Network::Eth => Some("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"),
        Network::EthSepolia => Some("0x1c7d4b196cb0c7b01d743fbc6116a902379c7238"),
        Network::Avax => Some("0xb97ef9ef8734c71904d8002f8b6bc66dd9c48a6e"),
        Network::AvaxFuji => Some("0x5425890298aed601595a70ab815c96711a31bc65"),
        Network::Op => Some("0x0b2c639c533813f4aa9d7837caf62653d097ff85"),
        Network::OpSepolia => Some("0x5fd84259d66cd46123540766be93dfe6d43130d7"),
        Network::Arb => Some("0xaf88d065e77c8cc2239327c5edb3a432268e5831"),
        Network::ArbSepolia => Some("0x75faf114eafb1bdbe2f0316df893fd58ce46aa4d"),
        Network::Base => Some("0x833589fcd6edb6e08f4c7c32d4f71b54bda02913"),
        Network::BaseSepolia => Some("0x036cbd53842c5426634e7929541ec2318f3dcf7e"),
        Network::Matic => Some("0x3c499c542cef5e3811e1192ce70d8cc03d5c3359"),
        Network::MaticAmoy => Some("0x41e94eb019c0762f9bfcf9fb1e58725bfb0e7582"),
        Network::Sol | Network::SolDevnet => None,
    }
}

/// Left-pad an EVM address into the bytes32 argument shape.
fn as_bytes32(address: &str) -> String {
    let hex = address.strip_prefix("0x").unwrap_or(address);
    format!("0x{:0>64}", hex.to_ascii_lowercase())
}

/// Embedder wiring for the cross-chain route.
#[derive(Debug, Clone)]
pub struct CrossChainOptions {
    /// Attestation service base URL.
    pub attestation_base_url: String,
    /// Destinations a relayer mints on automatically; no receive call is
    /// issued for them.
    pub auto_relayed: BTreeSet<Network>,
    /// Embedder-owned wallets, per destination network, that issue the
    /// receive call where no relayer exists. The wallet needs gas there.
    pub destination_wallets: BTreeMap<Network, String>,
}

impl Default for CrossChainOptions {
    fn default() -> Self {
        Self {
            attestation_base_url: "https://iris-api.circle.com".to_owned(),
            auto_relayed: BTreeSet::new(),
            destination_wallets: BTreeMap::new(),
        }
    }
}

/// Attestation polling cadence per mode.
const fn polling(mode: AttestationMode) -> (Duration, Duration) {
    match mode {
        AttestationMode::Fast => (Duration::from_secs(2), Duration::from_secs(60)),
        AttestationMode::Standard => (Duration::from_secs(15), Duration::from_secs(1_200)),
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttestationEnvelope {
    #[serde(default)]
    messages: Vec<AttestationMessage>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttestationMessage {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    attestation: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Adapter for payments whose destination network differs from the
/// wallet's. Same-network requests delegate to the transfer adapter.
#[derive(Clone)]
pub struct CrossChainAdapter {
    custody: Arc<dyn CustodyProvider>,
    transfer: TransferAdapter,
    http: hpx::Client,
    options: CrossChainOptions,
}

impl std::fmt::Debug for CrossChainAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossChainAdapter").field("options", &self.options).finish_non_exhaustive()
    }
}

impl CrossChainAdapter {
    /// Creates the adapter over a custody capability.
    pub fn new(custody: Arc<dyn CustodyProvider>, options: CrossChainOptions) -> Self {
        let transfer = TransferAdapter::new(Arc::clone(&custody));
        Self { custody, transfer, http: hpx::Client::new(), options }
    }

    fn route_check(
        request: &PaymentRequest,
        wallet: &WalletInfo,
    ) -> Result<(Network, &'static str, &'static str), Error> {
        let destination = request
            .destination_network
            .ok_or_else(|| Error::Validation("cross-chain payment without destination".to_owned()))?;
        if !wallet.network.is_evm() || !destination.is_evm() {
            return Err(Error::Configuration(format!(
                "cross-chain route {} -> {destination} is not supported",
                wallet.network
            )));
        }
        let source_usdc = usdc_address(wallet.network).ok_or_else(|| {
            Error::Configuration(format!("no token contract known on {}", wallet.network))
        })?;
        let destination_usdc = usdc_address(destination).ok_or_else(|| {
            Error::Configuration(format!("no token contract known on {destination}"))
        })?;
        if !is_evm_address(&request.recipient) {
            return Err(Error::Validation(format!(
                "cross-chain recipient {} is not an EVM address",
                request.recipient
            )));
        }
        Ok((destination, source_usdc, destination_usdc))
    }

    /// Wait until the custody provider reports an on-chain hash for the
    /// burn transaction.
    async fn await_tx_hash(&self, provider_tx_id: &str) -> Result<String, Error> {
        for _ in 0..30 {
            let receipt = self.custody.transaction_state(provider_tx_id).await?;
            if let Some(hash) = receipt.tx_hash {
                return Ok(hash);
            }
            if matches!(receipt.state, CustodyTxState::Failed | CustodyTxState::Cancelled) {
                return Err(Error::Protocol(format!(
                    "burn transaction {provider_tx_id} ended {:?}",
                    receipt.state
                )));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        Err(Error::Timeout(format!("burn transaction {provider_tx_id} never got a hash")))
    }

    /// Poll the attestation service until the message is signed.
    async fn await_attestation(
        &self,
        url: &str,
        mode: AttestationMode,
    ) -> Result<(String, String), Error> {
        let (interval, deadline) = polling(mode);
        let started = std::time::Instant::now();
        loop {
            let resp = self.http.get(url).send().await.map_err(|e| Error::Network(e.to_string()));
            if let Ok(resp) = resp {
                if resp.status().is_success() {
                    let envelope: AttestationEnvelope =
                        resp.json().await.map_err(|e| Error::Network(e.to_string()))?;
                    if let Some(message) = envelope.messages.first() {
                        let complete =
                            message.status.as_deref().is_some_and(|s| s.eq_ignore_ascii_case("complete"));
                        if complete {
                            if let (Some(body), Some(attestation)) =
                                (message.message.clone(), message.attestation.clone())
                            {
                                return Ok((body, attestation));
                            }
                        }
                    }
                }
            }
            if started.elapsed() >= deadline {
                return Err(Error::Timeout(format!("attestation not ready at {url}")));
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn call(&self, call: ContractCall, label: &str) -> Result<crate::custody::CustodyReceipt, Error> {
        let receipt = self.custody.call_contract(&call).await?;
        if matches!(receipt.state, CustodyTxState::Failed | CustodyTxState::Cancelled) {
            return Err(Error::Protocol(format!(
                "{label} call {} ended {:?}",
                receipt.provider_tx_id, receipt.state
            )));
        }
        Ok(receipt)
    }
}

#[async_trait::async_trait]
impl PaymentAdapter for CrossChainAdapter {
    fn name(&self) -> &'static str {
        "crosschain"
    }

    fn method(&self) -> TransportMethod {
        TransportMethod::CrossChain
    }

    fn priority(&self) -> u8 {
        1
    }

    fn can_handle(&self, request: &PaymentRequest, wallet: &WalletInfo) -> bool {
        request.destination_network.is_some_and(|dest| dest != wallet.network)
    }

    async fn simulate(
        &self,
        request: &PaymentRequest,
        wallet: &WalletInfo,
    ) -> Result<RouteSimulation, Error> {
        if request.destination_network == Some(wallet.network) {
            return self.transfer.simulate(request, wallet).await;
        }
        match Self::route_check(request, wallet) {
            Ok((destination, _, _)) => {
                let receivable = self.options.auto_relayed.contains(&destination)
                    || self.options.destination_wallets.contains_key(&destination);
                Ok(RouteSimulation {
                    would_succeed: receivable,
                    estimated_fee: None,
                    reason: Some(if receivable {
                        format!("burn on {}, mint on {destination}", wallet.network)
                    } else {
                        format!("no relayer or destination wallet for {destination}")
                    }),
                })
            }
            Err(err) => Ok(RouteSimulation {
                would_succeed: false,
                estimated_fee: None,
                reason: Some(err.to_string()),
            }),
        }
    }

    async fn execute(
        &self,
        request: &PaymentRequest,
        wallet: &WalletInfo,
        meta: &mut BTreeMap<String, String>,
    ) -> Result<AdapterReceipt, Error> {
        if request.destination_network == Some(wallet.network) {
            return self.transfer.execute(request, wallet, meta).await;
        }
        let (destination, source_usdc, _destination_usdc) = Self::route_check(request, wallet)?;
        let source_domain = wallet.network.domain_id();
        let destination_domain = destination.domain_id();
        let units = request.amount.to_base_units()?;
        let idempotency_root = request
            .idempotency_key
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        meta.insert("version".to_owned(), MESSAGE_VERSION.to_owned());
        meta.insert("sourceDomain".to_owned(), source_domain.to_string());
        meta.insert("destinationDomain".to_owned(), destination_domain.to_string());

        // Step 1: allow the token messenger to pull the burn amount.
        self.call(
            ContractCall {
                wallet_id: request.wallet_id.clone(),
                contract_address: source_usdc.to_owned(),
                abi_function_signature: "approve(address,uint256)".to_owned(),
                abi_parameters: vec![TOKEN_MESSENGER.to_owned(), units.clone()],
                fee_level: request.fee_level,
                idempotency_key: format!("{idempotency_root}:approve"),
            },
            "approve",
        )
        .await?;

        // Step 2: burn on the source network.
        let finality = match request.attestation_mode {
            AttestationMode::Fast => FINALITY_FAST,
            AttestationMode::Standard => FINALITY_STANDARD,
        };
        let max_fee = match request.attestation_mode {
            // Fast-finality transfers pay the messenger a fee out of the
            // burn amount; standard transfers do not.
            AttestationMode::Fast => (units.parse::<u128>().unwrap_or(0) / 100).to_string(),
            AttestationMode::Standard => "0".to_owned(),
        };
        let burn = self
            .call(
                ContractCall {
                    wallet_id: request.wallet_id.clone(),
                    contract_address: TOKEN_MESSENGER.to_owned(),
                    abi_function_signature:
                        "depositForBurn(uint256,uint32,bytes32,address,bytes32,uint256,uint32)"
                            .to_owned(),
                    abi_parameters: vec![
                        units,
                        destination_domain.to_string(),
                        as_bytes32(&request.recipient),
                        source_usdc.to_owned(),
                        as_bytes32("0x0000000000000000000000000000000000000000"),
                        max_fee,
                        finality.to_string(),
                    ],
                    fee_level: request.fee_level,
                    idempotency_key: format!("{idempotency_root}:burn"),
                },
                "depositForBurn",
            )
            .await?;
        let burn_hash = match burn.tx_hash.clone() {
            Some(hash) => hash,
            None => self.await_tx_hash(&burn.provider_tx_id).await?,
        };
        meta.insert("burnTxHash".to_owned(), burn_hash.clone());

        // Step 3: wait for the signed attestation. The URL goes into the
        // metadata first so a timeout still leaves a reconciliation trail.
        let attestation_url = format!(
            "{}/v2/messages/{source_domain}?transactionHash={burn_hash}",
            self.options.attestation_base_url
        );
        meta.insert("attestationUrl".to_owned(), attestation_url.clone());
        let (message, attestation) =
            self.await_attestation(&attestation_url, request.attestation_mode).await?;

        // Step 4: mint on the destination.
        if self.options.auto_relayed.contains(&destination) {
            meta.insert("relayed".to_owned(), "true".to_owned());
        } else {
            let receiver = self.options.destination_wallets.get(&destination).ok_or_else(|| {
                Error::Configuration(format!(
                    "no relayer or destination wallet configured for {destination}"
                ))
            })?;
            let mint = self
                .call(
                    ContractCall {
                        wallet_id: receiver.clone(),
                        contract_address: MESSAGE_TRANSMITTER.to_owned(),
                        abi_function_signature: "receiveMessage(bytes,bytes)".to_owned(),
                        abi_parameters: vec![message, attestation],
                        fee_level: request.fee_level,
                        idempotency_key: format!("{idempotency_root}:receive"),
                    },
                    "receiveMessage",
                )
                .await?;
            if let Some(hash) = mint.tx_hash {
                meta.insert("mintTxHash".to_owned(), hash);
            }
        }

        Ok(AdapterReceipt { provider_tx_id: Some(burn.provider_tx_id), tx_hash: Some(burn_hash) })
    }
}
