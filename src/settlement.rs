//! HTTP-402 settlement orchestration.
//!
//! Two proof shapes reach this service through the `X-PAYMENT` header:
//!
//! - a full protocol envelope, verified and settled by the remote
//!   facilitator (`verify` then `settle`, both hard-failing on rejection);
//! - a self-contained wallet signature over `{amount, currency, merchant}`,
//!   checked locally with the curve the network family uses — ed25519 for
//!   account chains, secp256k1 recovery for EVM chains. This path has no
//!   on-chain confirmation, so amount, currency, and merchant must match
//!   exactly, with no tolerance.
//!
//! Every `process_payment` invocation records a brand-new completed
//! [`PaymentTransaction`]; retried attempts produce independent audit rows
//! and never reopen an existing one.

use alloy_primitives::Address;
use ed25519_dalek::{Signature as EdSignature, Verifier, VerifyingKey};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;
use url::Url;

use crate::currency::{Currency, Network, NetworkFamily};
use crate::ledger::{LedgerError, LedgerService, NotificationEvent, Notifier};
use crate::price::ceil_to_precision;
use crate::store::{SettleOutcome, Settlement, StoreError, TransactionStore};
use crate::timestamp::Clock;
use crate::types::{
    BillingKind, PaymentMethod, PaymentRecordError, PaymentTransaction, ReferenceCode, TokenAmount,
};
use crate::util::Base64Bytes;
use crate::x402::{
    ClientPayment, FacilitatorClient, PaymentDecodingError, PaymentPayload,
    PaymentRequiredResponse, PaymentRequirements, Scheme, SettleResponse, SimpleSignaturePayload,
    VerifyRequest, VerifyResponse, X402Error, X402Version,
};

/// Payment window offered to clients in the 402 challenge.
const PAYMENT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error(transparent)]
    Decoding(#[from] PaymentDecodingError),
    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),
    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),
    #[error("Payment message names the wrong merchant")]
    WrongMerchant,
    #[error("Payment message amount {actual} does not match expected {expected}")]
    AmountMismatch { expected: Decimal, actual: Decimal },
    #[error("Payment message currency {actual} does not match expected {expected}")]
    CurrencyMismatch { expected: String, actual: String },
    #[error("Malformed payment message: {0}")]
    MalformedMessage(String),
    #[error("Payment requirements name an unknown asset: {0}")]
    UnknownAsset(String),
    #[error("No merchant wallet configured for {0} networks")]
    ConfigurationMissing(&'static str),
    #[error(transparent)]
    Facilitator(#[from] X402Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Record(#[from] PaymentRecordError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// The signed body of a simple-signature payment.
#[derive(Debug, Clone, Deserialize)]
struct SignedPaymentMessage {
    amount: Decimal,
    currency: String,
    merchant: String,
}

/// Outcome of a processed payment, echoed to the client through the
/// `X-PAYMENT-RESPONSE` header.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessedPayment {
    pub reference_code: ReferenceCode,
    pub payer: Option<String>,
    pub transaction: Option<String>,
    pub network: Network,
    pub payment_method: PaymentMethod,
}

impl ProcessedPayment {
    /// Encodes the `X-PAYMENT-RESPONSE` header value: base64 JSON carrying
    /// the reference code and the on-chain transaction, when one exists.
    pub fn response_header(&self) -> Base64Bytes<'static> {
        let body = serde_json::json!({
            "transactionId": self.reference_code,
            "transaction": self.transaction,
            "network": self.network,
        });
        Base64Bytes::encode(body.to_string())
    }
}

pub struct FacilitatorPaymentService {
    facilitator: FacilitatorClient,
    store: Arc<dyn TransactionStore>,
    ledger: Arc<dyn LedgerService>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    /// Merchant wallet on account chains.
    merchant_wallet: String,
    /// Merchant address on EVM chains, when that family is enabled.
    merchant_evm_address: Option<String>,
}

impl FacilitatorPaymentService {
    pub fn new(
        facilitator: FacilitatorClient,
        store: Arc<dyn TransactionStore>,
        ledger: Arc<dyn LedgerService>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        merchant_wallet: String,
        merchant_evm_address: Option<String>,
    ) -> Self {
        Self {
            facilitator,
            store,
            ledger,
            notifier,
            clock,
            merchant_wallet,
            merchant_evm_address,
        }
    }

    fn merchant_for(&self, family: NetworkFamily) -> Result<&str, SettlementError> {
        match family {
            NetworkFamily::Account => Ok(&self.merchant_wallet),
            NetworkFamily::Evm => self
                .merchant_evm_address
                .as_deref()
                .ok_or(SettlementError::ConfigurationMissing("EVM")),
        }
    }

    /// Builds the payment requirements for `amount` of `currency` and wraps
    /// them in the HTTP 402 challenge envelope. The requirements are the
    /// caller's to hold: they must be threaded back into verify/settle.
    pub fn create_payment_request(
        &self,
        amount: Decimal,
        currency: Currency,
        description: &str,
        resource: Url,
    ) -> Result<(PaymentRequiredResponse, PaymentRequirements), SettlementError> {
        let network = currency.network();
        let pay_to = self.merchant_for(network.family())?.to_string();
        let decimals = currency.decimals();
        let rounded = ceil_to_precision(amount, decimals);
        let atomic = (rounded * Decimal::from(10u64.pow(decimals as u32)))
            .to_u128()
            .ok_or_else(|| SettlementError::MalformedMessage("amount out of range".to_string()))?;
        let extra = match network.family() {
            NetworkFamily::Account => Some(serde_json::json!({ "feePayer": "facilitator" })),
            NetworkFamily::Evm => None,
        };
        let requirements = PaymentRequirements {
            scheme: Scheme::Exact,
            network,
            max_amount_required: TokenAmount(atomic),
            resource,
            description: description.to_string(),
            mime_type: "application/json".to_string(),
            pay_to,
            max_timeout_seconds: PAYMENT_TIMEOUT_SECS,
            asset: currency.asset_id().to_string(),
            extra,
        };
        let envelope = PaymentRequiredResponse {
            x402_version: X402Version::V1,
            accepts: vec![requirements.clone()],
            error: None,
        };
        Ok((envelope, requirements))
    }

    /// Asks the facilitator to verify a protocol payload against the
    /// requirements. A non-200 answer or `isValid = false` is a hard
    /// failure carrying the facilitator's stated reason.
    #[instrument(skip_all, err)]
    pub async fn verify_payment(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<String, SettlementError> {
        let request = VerifyRequest {
            x402_version: X402Version::V1,
            payment_payload: payload.clone(),
            payment_requirements: requirements.clone(),
        };
        match self.facilitator.verify(&request).await? {
            VerifyResponse::Valid { payer } => Ok(payer),
            VerifyResponse::Invalid { reason, .. } => {
                Err(SettlementError::Facilitator(X402Error::Rejected { reason }))
            }
        }
    }

    /// Asks the facilitator to settle a verified payload on-chain.
    #[instrument(skip_all, err)]
    pub async fn settle_payment(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, SettlementError> {
        let request = VerifyRequest {
            x402_version: X402Version::V1,
            payment_payload: payload.clone(),
            payment_requirements: requirements.clone(),
        };
        let response = self.facilitator.settle(&request).await?;
        if !response.success {
            let reason = response
                .error_reason
                .unwrap_or_else(|| "settlement failed".to_string());
            return Err(SettlementError::Facilitator(X402Error::Rejected { reason }));
        }
        Ok(response)
    }

    /// Verifies a bare wallet-signed payment message without a facilitator
    /// round trip. Returns the payer wallet on success.
    ///
    /// There is no on-chain confirmation behind this path, so the message
    /// must name the merchant and match the expected amount and currency
    /// exactly.
    #[instrument(skip_all, err, fields(network = %payload.network))]
    pub fn verify_simple_signature(
        &self,
        payload: &SimpleSignaturePayload,
        expected_amount: Decimal,
        expected_currency: Currency,
    ) -> Result<String, SettlementError> {
        let network: Network = payload
            .network
            .parse()
            .map_err(|_| SettlementError::UnsupportedNetwork(payload.network.clone()))?;

        let message_bytes = decode_message(&payload.message)?;
        let message: SignedPaymentMessage = serde_json::from_slice(&message_bytes)
            .map_err(|e| SettlementError::MalformedMessage(e.to_string()))?;

        let merchant = self.merchant_for(network.family())?;
        if !address_eq(network.family(), &message.merchant, merchant) {
            return Err(SettlementError::WrongMerchant);
        }
        if message.amount != expected_amount {
            return Err(SettlementError::AmountMismatch {
                expected: expected_amount,
                actual: message.amount,
            });
        }
        if message.currency != expected_currency.code() {
            return Err(SettlementError::CurrencyMismatch {
                expected: expected_currency.code().to_string(),
                actual: message.currency,
            });
        }

        match network.family() {
            NetworkFamily::Account => {
                verify_ed25519(&payload.wallet, &payload.signature, &message_bytes)?
            }
            NetworkFamily::Evm => {
                verify_evm_recovery(&payload.wallet, &payload.signature, &message_bytes)?
            }
        }
        Ok(payload.wallet.clone())
    }

    /// The orchestrating entry point: detects the payload shape, runs the
    /// matching verification path, and records a brand-new completed
    /// [`PaymentTransaction`]. Never updates an existing row.
    #[instrument(skip_all, err)]
    pub async fn process_payment(
        &self,
        payment: ClientPayment,
        requirements: &PaymentRequirements,
        user_id: Option<String>,
        company_id: Option<String>,
        token_amount: Option<u64>,
    ) -> Result<ProcessedPayment, SettlementError> {
        let currency = currency_for_asset(&requirements.asset)
            .ok_or_else(|| SettlementError::UnknownAsset(requirements.asset.clone()))?;
        let expected_amount = Decimal::from_i128_with_scale(
            requirements.max_amount_required.0 as i128,
            currency.decimals() as u32,
        );

        let (method, payer, transaction, metadata) = match payment {
            ClientPayment::Simple(simple) => {
                let payer =
                    self.verify_simple_signature(&simple, expected_amount, currency)?;
                let metadata = serde_json::json!({
                    "route": "simple-signature",
                    "network": simple.network,
                    "signature": simple.signature,
                });
                (PaymentMethod::X402Simple, payer, None, metadata)
            }
            ClientPayment::Protocol(payload) => {
                self.verify_payment(&payload, requirements).await?;
                let settled = self.settle_payment(&payload, requirements).await?;
                let payer = settled.payer.unwrap_or_default();
                let metadata = serde_json::json!({
                    "route": "facilitator",
                    "network": settled.network,
                    "transaction": settled.transaction,
                });
                (PaymentMethod::X402, payer, settled.transaction, metadata)
            }
        };

        let billing = BillingKind::Tokens {
            token_amount: token_amount.unwrap_or(0),
        };
        let now = self.clock.now();
        let record = PaymentTransaction::new_pending(
            user_id,
            company_id,
            billing,
            method,
            Some(currency),
            Some(requirements.network),
            expected_amount,
            expected_amount,
            Decimal::ONE,
            now,
        )?;
        let reference = record.reference_code.clone();
        self.store.insert(record).await?;
        let outcome = self
            .store
            .settle(
                &reference,
                Settlement {
                    transaction_hash: transaction.clone(),
                    wallet_address: Some(payer.clone()),
                    metadata,
                    now,
                },
            )
            .await?;

        if let SettleOutcome::NewlyCompleted(settled) = &outcome {
            if let (BillingKind::Tokens { token_amount }, Some(company_id)) =
                (settled.billing, settled.company_id.as_deref())
            {
                if token_amount > 0 {
                    self.ledger
                        .credit_tokens(company_id, token_amount, settled.amount_usd)
                        .await?;
                    self.notifier
                        .notify(NotificationEvent::TokensCredited {
                            company_id: company_id.to_string(),
                            tokens: token_amount,
                            amount_usd: settled.amount_usd,
                            reference_code: settled.reference_code.to_string(),
                        })
                        .await;
                }
            }
        }

        Ok(ProcessedPayment {
            reference_code: reference,
            payer: Some(payer),
            transaction,
            network: requirements.network,
            payment_method: method,
        })
    }
}

fn currency_for_asset(asset: &str) -> Option<Currency> {
    Currency::variants()
        .iter()
        .copied()
        .find(|currency| currency.asset_id() == asset)
}

/// Decodes the signed message: raw JSON text, or base64-encoded JSON.
fn decode_message(message: &str) -> Result<Vec<u8>, SettlementError> {
    let trimmed = message.trim_start();
    if trimmed.starts_with('{') {
        return Ok(message.as_bytes().to_vec());
    }
    Base64Bytes::from(message.as_bytes())
        .decode()
        .map_err(|_| SettlementError::MalformedMessage("not JSON or base64 JSON".to_string()))
}

/// Address equality per network family: EVM hex addresses compare
/// case-insensitively, account-chain addresses are case-sensitive base58.
fn address_eq(family: NetworkFamily, a: &str, b: &str) -> bool {
    match family {
        NetworkFamily::Account => a == b,
        NetworkFamily::Evm => a.eq_ignore_ascii_case(b),
    }
}

fn verify_ed25519(wallet: &str, signature: &str, message: &[u8]) -> Result<(), SettlementError> {
    let key_bytes: [u8; 32] = bs58::decode(wallet)
        .into_vec()
        .map_err(|e| SettlementError::SignatureInvalid(format!("bad wallet encoding: {e}")))?
        .try_into()
        .map_err(|_| SettlementError::SignatureInvalid("wallet must be 32 bytes".to_string()))?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| SettlementError::SignatureInvalid(format!("bad public key: {e}")))?;

    // Signatures arrive base58 (wallet convention) or base64.
    let signature_bytes = bs58::decode(signature)
        .into_vec()
        .ok()
        .or_else(|| Base64Bytes::from(signature.as_bytes()).decode().ok())
        .ok_or_else(|| {
            SettlementError::SignatureInvalid("bad signature encoding".to_string())
        })?;
    let signature_bytes: [u8; 64] = signature_bytes
        .try_into()
        .map_err(|_| SettlementError::SignatureInvalid("signature must be 64 bytes".to_string()))?;
    let signature = EdSignature::from_bytes(&signature_bytes);

    verifying_key
        .verify(message, &signature)
        .map_err(|_| SettlementError::SignatureInvalid("ed25519 verification failed".to_string()))
}

fn verify_evm_recovery(
    wallet: &str,
    signature: &str,
    message: &[u8],
) -> Result<(), SettlementError> {
    let expected = Address::from_str(wallet)
        .map_err(|e| SettlementError::SignatureInvalid(format!("bad wallet address: {e}")))?;
    let raw = hex::decode(signature.trim_start_matches("0x"))
        .map_err(|e| SettlementError::SignatureInvalid(format!("bad signature hex: {e}")))?;
    let raw: [u8; 65] = raw
        .try_into()
        .map_err(|_| SettlementError::SignatureInvalid("signature must be 65 bytes".to_string()))?;
    let signature = alloy_primitives::Signature::from_raw_array(&raw)
        .map_err(|e| SettlementError::SignatureInvalid(format!("{e}")))?;
    let recovered = signature
        .recover_address_from_msg(message)
        .map_err(|e| SettlementError::SignatureInvalid(format!("{e}")))?;
    if recovered != expected {
        return Err(SettlementError::SignatureInvalid(format!(
            "address mismatch: recovered {recovered}, expected {expected}"
        )));
    }
    Ok(())
}
