//! Negotiated HTTP-402 payment.
//!
//! Flow: probe the recipient URL unauthenticated, parse the payment
//! descriptor out of the 402 response, assemble a signed payment proof
//! with the custody wallet's identity, then re-issue the request with the
//! proof attached. Success is the retried request succeeding.

use std::{collections::BTreeMap, sync::Arc};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;

use super::{AdapterReceipt, PaymentAdapter, RouteSimulation};
use crate::{
    custody::{CustodyProvider, WalletInfo},
    error::Error,
    models::{Amount, PaymentRequest, RecipientKind, TransportMethod, classify_recipient},
};

/// Structured descriptor a 402 response carries, either in the
/// `X-Payment-Required` header or in the body.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentDescriptor {
    pay_to: String,
    amount: Amount,
    #[serde(default)]
    asset: Option<String>,
    #[serde(default)]
    network: Option<String>,
    #[serde(default, alias = "x402Version")]
    version: Option<u32>,
}

/// Signed payload attached to the paid retry.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentProof<'a> {
    from: &'a str,
    pay_to: &'a str,
    amount: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    asset: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    network: Option<&'a str>,
    nonce: String,
    issued_at: i64,
}

/// Adapter for HTTP-402 counterparties.
///
/// Supports both header schemes in the wild: v1 sends a single
/// `X-Payment` header carrying `payload.signature`; v2 sends the payload
/// and signature separately as `PAYMENT-PAYLOAD` and `PAYMENT-SIGNATURE`.
#[derive(Clone)]
pub struct Http402Adapter {
    custody: Arc<dyn CustodyProvider>,
    http: hpx::Client,
}

impl std::fmt::Debug for Http402Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http402Adapter").finish_non_exhaustive()
    }
}

fn network_error(err: hpx::Error) -> Error {
    Error::Network(err.to_string())
}

impl Http402Adapter {
    /// Creates the adapter over a custody capability.
    pub fn new(custody: Arc<dyn CustodyProvider>) -> Self {
        Self { custody, http: hpx::Client::new() }
    }

    /// Probe the URL and extract the payment descriptor.
    async fn probe(&self, url: &str) -> Result<PaymentDescriptor, Error> {
        let resp = self.http.get(url).send().await.map_err(network_error)?;
        let status = resp.status().as_u16();
        if status != 402 {
            if status >= 500 {
                return Err(Error::Network(format!("probe of {url} returned {status}")));
            }
            if status >= 400 {
                return Err(Error::Protocol(format!(
                    "probe of {url} returned {status}, expected 402"
                )));
            }
            return Err(Error::Protocol(format!(
                "{url} did not request payment (probe returned {status})"
            )));
        }
        let header_descriptor = resp
            .headers()
            .get("X-Payment-Required")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        if let Some(raw) = header_descriptor {
            return serde_json::from_str(&raw).map_err(|e| {
                Error::Protocol(format!("malformed X-Payment-Required header from {url}: {e}"))
            });
        }
        let body = resp.text().await.map_err(network_error)?;
        serde_json::from_str(&body)
            .map_err(|e| Error::Protocol(format!("malformed 402 descriptor from {url}: {e}")))
    }

    fn authorized(descriptor: &PaymentDescriptor, request: &PaymentRequest) -> Result<(), Error> {
        if descriptor.amount > request.amount {
            return Err(Error::Protocol(format!(
                "counterparty requested {} but only {} was authorized",
                descriptor.amount, request.amount
            )));
        }
        Ok(())
    }

    /// Build and sign the payment proof, returning the base64 payload and
    /// its signature.
    async fn build_proof(
        &self,
        descriptor: &PaymentDescriptor,
        wallet: &WalletInfo,
    ) -> Result<(String, String), Error> {
        let proof = PaymentProof {
            from: &wallet.address,
            pay_to: &descriptor.pay_to,
            amount: descriptor.amount,
            asset: descriptor.asset.as_deref(),
            network: descriptor.network.as_deref(),
            nonce: uuid::Uuid::new_v4().to_string(),
            issued_at: Utc::now().timestamp(),
        };
        let payload = serde_json::to_string(&proof)
            .map_err(|e| Error::Validation(format!("unserializable payment proof: {e}")))?;
        let signature = self.custody.sign_message(&wallet.id, &payload).await?;
        Ok((BASE64.encode(payload), signature))
    }
}

#[async_trait::async_trait]
impl PaymentAdapter for Http402Adapter {
    fn name(&self) -> &'static str {
        "http402"
    }

    fn method(&self) -> TransportMethod {
        TransportMethod::Http402
    }

    fn priority(&self) -> u8 {
        10
    }

    fn can_handle(&self, request: &PaymentRequest, wallet: &WalletInfo) -> bool {
        let same_network =
            request.destination_network.is_none_or(|dest| dest == wallet.network);
        same_network && classify_recipient(&request.recipient) == RecipientKind::HttpUrl
    }

    async fn simulate(
        &self,
        request: &PaymentRequest,
        _wallet: &WalletInfo,
    ) -> Result<RouteSimulation, Error> {
        // The probe is read-only on the counterparty, so simulation may
        // perform it.
        match self.probe(&request.recipient).await {
            Ok(descriptor) => match Self::authorized(&descriptor, request) {
                Ok(()) => Ok(RouteSimulation {
                    would_succeed: true,
                    estimated_fee: None,
                    reason: Some(format!(
                        "counterparty quotes {} to {}",
                        descriptor.amount, descriptor.pay_to
                    )),
                }),
                Err(err) => Ok(RouteSimulation {
                    would_succeed: false,
                    estimated_fee: None,
                    reason: Some(err.to_string()),
                }),
            },
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
        let url = &request.recipient;
        let descriptor = self.probe(url).await?;
        Self::authorized(&descriptor, request)?;
        meta.insert("payTo".to_owned(), descriptor.pay_to.clone());
        meta.insert("quotedAmount".to_owned(), descriptor.amount.to_string());
        if let Some(asset) = &descriptor.asset {
            meta.insert("asset".to_owned(), asset.clone());
        }

        let (payload, signature) = self.build_proof(&descriptor, wallet).await?;
        let scheme_v2 = descriptor.version.is_some_and(|v| v >= 2);
        let retry = if scheme_v2 {
            meta.insert("scheme".to_owned(), "v2".to_owned());
            self.http
                .get(url)
                .header("PAYMENT-PAYLOAD", payload)
                .header("PAYMENT-SIGNATURE", signature)
        } else {
            meta.insert("scheme".to_owned(), "v1".to_owned());
            self.http.get(url).header("X-Payment", format!("{payload}.{signature}"))
        };
        let resp = retry.send().await.map_err(network_error)?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            if status >= 500 {
                return Err(Error::Network(format!("paid retry of {url} returned {status}")));
            }
            return Err(Error::Protocol(format!(
                "counterparty rejected payment proof with {status}"
            )));
        }
        Ok(AdapterReceipt { provider_tx_id: None, tx_hash: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_parses_both_carriers() -> Result<(), Box<dyn std::error::Error>> {
        let body = r#"{"payTo":"0xabc","amount":"0.10","asset":"USDC","network":"BASE"}"#;
        let descriptor: PaymentDescriptor = serde_json::from_str(body)?;
        assert_eq!(descriptor.pay_to, "0xabc");
        assert_eq!(descriptor.amount, Amount::parse("0.10")?);
        assert_eq!(descriptor.version, None);

        let versioned = r#"{"payTo":"0xabc","amount":"1","x402Version":2}"#;
        let descriptor: PaymentDescriptor = serde_json::from_str(versioned)?;
        assert_eq!(descriptor.version, Some(2));
        Ok(())
    }

    #[test]
    fn overquoted_descriptor_is_a_protocol_error() -> Result<(), Box<dyn std::error::Error>> {
        let descriptor: PaymentDescriptor =
            serde_json::from_str(r#"{"payTo":"0xabc","amount":"5"}"#)?;
        let request = PaymentRequest::new("w-1", "https://x.example", Amount::parse("1")?);
        let err = Http402Adapter::authorized(&descriptor, &request).err().ok_or("expected")?;
        assert_eq!(err.kind(), "protocol_error");
        Ok(())
    }

    #[test]
    fn proof_payload_serializes_camel_case() -> Result<(), Box<dyn std::error::Error>> {
        let proof = PaymentProof {
            from: "0xfrom",
            pay_to: "0xto",
            amount: Amount::parse("1")?,
            asset: Some("USDC"),
            network: None,
            nonce: "n".to_owned(),
            issued_at: 0,
        };
        let json = serde_json::to_string(&proof)?;
        assert!(json.contains("\"payTo\":\"0xto\""));
        assert!(json.contains("\"issuedAt\":0"));
        Ok(())
    }
}
