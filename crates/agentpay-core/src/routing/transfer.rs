//! Direct custody transfer on the wallet's own network.

use std::{collections::BTreeMap, sync::Arc};

use super::{AdapterReceipt, PaymentAdapter, RouteSimulation};
use crate::{
    custody::{CustodyProvider, CustodyTransfer, CustodyTxState, WalletInfo},
    error::Error,
    models::{
        PaymentRequest, RecipientKind, TransportMethod, classify_recipient, is_base58_address,
        is_evm_address,
    },
};

/// Delegates chain-address payments to the custody provider.
///
/// The accepted address shape follows the wallet's network tag, not
/// recipient inspection: EVM wallets pay 40-hex addresses, Solana-family
/// wallets pay Base58 addresses.
#[derive(Clone)]
pub struct TransferAdapter {
    custody: Arc<dyn CustodyProvider>,
}

impl std::fmt::Debug for TransferAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferAdapter").finish_non_exhaustive()
    }
}

impl TransferAdapter {
    /// Creates the adapter over a custody capability.
    pub fn new(custody: Arc<dyn CustodyProvider>) -> Self {
        Self { custody }
    }

    fn address_shape_ok(recipient: &str, wallet: &WalletInfo) -> bool {
        if wallet.network.is_evm() {
            is_evm_address(recipient)
        } else {
            is_base58_address(recipient)
        }
    }

    fn to_custody_transfer(request: &PaymentRequest) -> CustodyTransfer {
        CustodyTransfer {
            wallet_id: request.wallet_id.clone(),
            to_address: request.recipient.clone(),
            amount: request.amount,
            fee_level: request.fee_level,
            idempotency_key: request
                .idempotency_key
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            wait_for_confirmation: request.wait_for_confirmation,
        }
    }
}

#[async_trait::async_trait]
impl PaymentAdapter for TransferAdapter {
    fn name(&self) -> &'static str {
        "transfer"
    }

    fn method(&self) -> TransportMethod {
        TransportMethod::Transfer
    }

    fn priority(&self) -> u8 {
        50
    }

    fn can_handle(&self, request: &PaymentRequest, wallet: &WalletInfo) -> bool {
        let same_network =
            request.destination_network.is_none_or(|dest| dest == wallet.network);
        same_network && classify_recipient(&request.recipient) == RecipientKind::ChainAddress
    }

    async fn simulate(
        &self,
        request: &PaymentRequest,
        wallet: &WalletInfo,
    ) -> Result<RouteSimulation, Error> {
        if !Self::address_shape_ok(&request.recipient, wallet) {
            return Ok(RouteSimulation {
                would_succeed: false,
                estimated_fee: None,
                reason: Some(format!(
                    "recipient does not look like a {} address",
                    wallet.network
                )),
            });
        }
        let estimated_fee = self
            .custody
            .estimate_transfer_fee(&Self::to_custody_transfer(request))
            .await
            .ok()
            .flatten();
        Ok(RouteSimulation { would_succeed: true, estimated_fee, reason: None })
    }

    async fn execute(
        &self,
        request: &PaymentRequest,
        wallet: &WalletInfo,
        meta: &mut BTreeMap<String, String>,
    ) -> Result<AdapterReceipt, Error> {
        if !Self::address_shape_ok(&request.recipient, wallet) {
            return Err(Error::Validation(format!(
                "recipient {} does not match the wallet network {}",
                request.recipient, wallet.network
            )));
        }
        meta.insert("network".to_owned(), wallet.network.to_string());
        let receipt = self.custody.transfer(&Self::to_custody_transfer(request)).await?;
        match receipt.state {
            CustodyTxState::Failed | CustodyTxState::Cancelled => Err(Error::Protocol(format!(
                "custody transfer {} ended {:?}",
                receipt.provider_tx_id, receipt.state
            ))),
            _ => Ok(AdapterReceipt {
                provider_tx_id: Some(receipt.provider_tx_id),
                tx_hash: receipt.tx_hash,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        custody::{ContractCall, CustodyReceipt},
        models::{Amount, Network},
    };

    struct FakeCustody;

    #[async_trait::async_trait]
    impl CustodyProvider for FakeCustody {
        async fn wallet(&self, wallet_id: &str) -> Result<WalletInfo, Error> {
            Ok(WalletInfo {
                id: wallet_id.to_owned(),
                address: "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_owned(),
                network: Network::Base,
                wallet_set_id: None,
            })
        }
        async fn balance(&self, _wallet_id: &str) -> Result<Amount, Error> {
            Amount::parse("100")
        }
        async fn transfer(&self, transfer: &CustodyTransfer) -> Result<CustodyReceipt, Error> {
            assert!(!transfer.idempotency_key.is_empty());
            Ok(CustodyReceipt {
                provider_tx_id: "ptx-1".to_owned(),
                tx_hash: Some("0xbeef".to_owned()),
                state: CustodyTxState::Complete,
            })
        }
        async fn call_contract(&self, _call: &ContractCall) -> Result<CustodyReceipt, Error> {
            Err(Error::Protocol("unexpected".to_owned()))
        }
        async fn transaction_state(&self, _id: &str) -> Result<CustodyReceipt, Error> {
            Err(Error::Protocol("unexpected".to_owned()))
        }
        async fn estimate_transfer_fee(
            &self,
            _transfer: &CustodyTransfer,
        ) -> Result<Option<Amount>, Error> {
            Ok(Some(Amount::parse("0.01")?))
        }
        async fn sign_message(&self, _wallet_id: &str, _message: &str) -> Result<String, Error> {
            Ok("sig".to_owned())
        }
    }

    fn wallet(network: Network) -> WalletInfo {
        WalletInfo {
            id: "w-1".to_owned(),
            address: "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_owned(),
            network,
            wallet_set_id: None,
        }
    }

    #[tokio::test]
    async fn executes_evm_transfer() -> Result<(), Box<dyn std::error::Error>> {
        let adapter = TransferAdapter::new(Arc::new(FakeCustody));
        let request = PaymentRequest::new(
            "w-1",
            "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
            Amount::parse("25")?,
        );
        let mut meta = BTreeMap::new();
        let receipt = adapter.execute(&request, &wallet(Network::Base), &mut meta).await?;
        assert_eq!(receipt.provider_tx_id.as_deref(), Some("ptx-1"));
        assert_eq!(meta.get("network").map(String::as_str), Some("BASE"));
        Ok(())
    }

    #[tokio::test]
    async fn network_tag_decides_address_shape() -> Result<(), Box<dyn std::error::Error>> {
        let adapter = TransferAdapter::new(Arc::new(FakeCustody));
        // A Base58 recipient is invalid for an EVM wallet even though it
        // classifies as a chain address.
        let request = PaymentRequest::new(
            "w-1",
            "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
            Amount::parse("1")?,
        );
        let mut meta = BTreeMap::new();
        let err = adapter
            .execute(&request, &wallet(Network::Base), &mut meta)
            .await
            .err()
            .ok_or("expected")?;
        assert_eq!(err.kind(), "validation_error");
        // The same recipient is fine for a Solana wallet.
        let sim = adapter.simulate(&request, &wallet(Network::Sol)).await?;
        assert!(sim.would_succeed);
        Ok(())
    }

    #[tokio::test]
    async fn simulate_reports_fee_estimate() -> Result<(), Box<dyn std::error::Error>> {
        let adapter = TransferAdapter::new(Arc::new(FakeCustody));
        let request = PaymentRequest::new(
            "w-1",
            "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
            Amount::parse("25")?,
        );
        let sim = adapter.simulate(&request, &wallet(Network::Base)).await?;
        assert!(sim.would_succeed);
        assert_eq!(sim.estimated_fee, Some(Amount::parse("0.01")?));
        Ok(())
    }
}
