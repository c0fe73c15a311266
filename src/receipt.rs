//! Chain transaction receipts and the balance-delta verifier.
//!
//! Given a fetched receipt (ordered account list, pre/post native balances,
//! pre/post token-holding balances, an on-chain error flag, slot and block
//! time), [`received_amount`] computes how many units of a given asset were
//! delivered to the merchant wallet. This component states what happened
//! on-chain; whether that is *enough* is the invoice service's policy.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::instrument;
use url::Url;

use crate::currency::AssetKind;
use crate::types::TokenAmount;

const RPC_TIMEOUT: Duration = Duration::from_secs(15);

/// A confirmed transaction as the chain node reports it.
#[derive(Debug, Clone)]
pub struct ChainReceipt {
    pub slot: u64,
    pub block_time: Option<i64>,
    /// The transaction executed but failed on-chain. A failed transaction is
    /// never a payment.
    pub failed: bool,
    /// Ordered account list; balance arrays are indexed by position here.
    pub account_keys: Vec<String>,
    /// Native balances in atomic units, per account index.
    pub pre_balances: Vec<u64>,
    pub post_balances: Vec<u64>,
    pub pre_token_balances: Vec<TokenBalanceEntry>,
    pub post_token_balances: Vec<TokenBalanceEntry>,
}

/// One token-holding balance snapshot inside a receipt.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalanceEntry {
    pub mint: String,
    /// The wallet that owns the holding account. Entries without an owner
    /// cannot be attributed and are ignored.
    #[serde(default)]
    pub owner: Option<String>,
    pub ui_token_amount: UiTokenAmount,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UiTokenAmount {
    /// Atomic amount as a decimal string.
    pub amount: TokenAmount,
    pub decimals: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiptError {
    #[error("Transaction failed on-chain")]
    TransactionFailed,
    /// The transaction never touched the merchant wallet.
    #[error("Wrong recipient: transaction does not involve wallet {0}")]
    WrongRecipient(String),
}

/// The verifier's answer: the delivered amount plus the audit facts an
/// invoice stores alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedAmount {
    pub amount: Decimal,
    pub slot: u64,
    pub block_time: Option<i64>,
}

fn scale(atomic: u128, decimals: u8) -> Decimal {
    Decimal::from_i128_with_scale(atomic as i128, decimals as u32)
}

/// Sums the atomic holdings of `wallet` in `mint` on one side of the receipt.
/// No matching entry means the balance on that side is zero.
fn token_holding(entries: &[TokenBalanceEntry], wallet: &str, mint: &str) -> u128 {
    entries
        .iter()
        .filter(|entry| entry.mint == mint && entry.owner.as_deref() == Some(wallet))
        .map(|entry| entry.ui_token_amount.amount.0)
        .sum()
}

/// Computes how many units of `asset` the receipt delivered to `wallet`.
///
/// A net outflow from the wallet clamps to zero; the delta is never negative.
pub fn received_amount(
    receipt: &ChainReceipt,
    wallet: &str,
    asset: &AssetKind,
) -> Result<ReceivedAmount, ReceiptError> {
    if receipt.failed {
        return Err(ReceiptError::TransactionFailed);
    }
    let index = receipt
        .account_keys
        .iter()
        .position(|key| key == wallet)
        .ok_or_else(|| ReceiptError::WrongRecipient(wallet.to_string()))?;

    let amount = match asset {
        AssetKind::Native { decimals } => {
            let pre = receipt.pre_balances.get(index).copied().unwrap_or(0);
            let post = receipt.post_balances.get(index).copied().unwrap_or(0);
            scale(post.saturating_sub(pre) as u128, *decimals)
        }
        AssetKind::Token { mint, decimals } => {
            let pre = token_holding(&receipt.pre_token_balances, wallet, mint);
            let post = token_holding(&receipt.post_token_balances, wallet, mint);
            scale(post.saturating_sub(pre), *decimals)
        }
    };

    Ok(ReceivedAmount {
        amount,
        slot: receipt.slot,
        block_time: receipt.block_time,
    })
}

/// Transport-level failure talking to the chain node. Retryable; distinct
/// from any verification failure.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Chain RPC transport error: {0}")]
    Transport(String),
    #[error("Chain RPC returned status {0}")]
    Status(u16),
    #[error("Malformed chain RPC response: {0}")]
    Malformed(String),
}

/// The consumed chain-RPC collaborator: fetch a transaction receipt by its
/// signature/hash.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// `Ok(None)` means the node does not know the transaction.
    async fn transaction_receipt(&self, hash: &str) -> Result<Option<ChainReceipt>, RpcError>;
}

// Wire shape of the node's `getTransaction` response, jsonParsed encoding.
#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    result: Option<RpcTransaction>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    slot: u64,
    #[serde(default)]
    block_time: Option<i64>,
    meta: RpcMeta,
    transaction: RpcInner,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcMeta {
    #[serde(default)]
    err: Option<serde_json::Value>,
    pre_balances: Vec<u64>,
    post_balances: Vec<u64>,
    #[serde(default)]
    pre_token_balances: Vec<TokenBalanceEntry>,
    #[serde(default)]
    post_token_balances: Vec<TokenBalanceEntry>,
}

#[derive(Debug, Deserialize)]
struct RpcInner {
    message: RpcMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcMessage {
    account_keys: Vec<RpcAccountKey>,
}

/// Account keys arrive as plain strings (base encodings) or as objects
/// (jsonParsed encoding).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RpcAccountKey {
    Parsed { pubkey: String },
    Raw(String),
}

impl RpcAccountKey {
    fn into_pubkey(self) -> String {
        match self {
            RpcAccountKey::Parsed { pubkey } => pubkey,
            RpcAccountKey::Raw(pubkey) => pubkey,
        }
    }
}

impl From<RpcTransaction> for ChainReceipt {
    fn from(tx: RpcTransaction) -> Self {
        ChainReceipt {
            slot: tx.slot,
            block_time: tx.block_time,
            failed: tx.meta.err.is_some(),
            account_keys: tx
                .transaction
                .message
                .account_keys
                .into_iter()
                .map(RpcAccountKey::into_pubkey)
                .collect(),
            pre_balances: tx.meta.pre_balances,
            post_balances: tx.meta.post_balances,
            pre_token_balances: tx.meta.pre_token_balances,
            post_token_balances: tx.meta.post_token_balances,
        }
    }
}

/// JSON-RPC implementation of [`ChainRpc`] over a node's HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpChainRpc {
    client: Client,
    url: Url,
}

impl HttpChainRpc {
    pub fn new(url: Url) -> Self {
        let client = Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self { client, url }
    }
}

#[async_trait]
impl ChainRpc for HttpChainRpc {
    #[instrument(skip_all, err, fields(hash = hash))]
    async fn transaction_receipt(&self, hash: &str) -> Result<Option<ChainReceipt>, RpcError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getTransaction",
            "params": [hash, {
                "encoding": "jsonParsed",
                "commitment": "confirmed",
                "maxSupportedTransactionVersion": 0,
            }],
        });
        let response = self
            .client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RpcError::Status(response.status().as_u16()));
        }
        let envelope: RpcEnvelope = response
            .json()
            .await
            .map_err(|e| RpcError::Malformed(e.to_string()))?;
        if let Some(error) = envelope.error {
            return Err(RpcError::Malformed(error.to_string()));
        }
        Ok(envelope.result.map(ChainReceipt::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MERCHANT: &str = "9mWalletMerchant1111111111111111111111111111";
    const PAYER: &str = "7qWalletPayer2222222222222222222222222222222";

    fn native_receipt(pre: u64, post: u64) -> ChainReceipt {
        ChainReceipt {
            slot: 2_480_551,
            block_time: Some(1_730_000_000),
            failed: false,
            account_keys: vec![PAYER.to_string(), MERCHANT.to_string()],
            pre_balances: vec![5_000_000_000, pre],
            post_balances: vec![4_950_000_000, post],
            pre_token_balances: vec![],
            post_token_balances: vec![],
        }
    }

    fn token_entry(owner: &str, mint: &str, atomic: u128) -> TokenBalanceEntry {
        TokenBalanceEntry {
            mint: mint.to_string(),
            owner: Some(owner.to_string()),
            ui_token_amount: UiTokenAmount {
                amount: TokenAmount(atomic),
                decimals: 6,
            },
        }
    }

    #[test]
    fn native_delta_scales_to_decimal() {
        let receipt = native_receipt(1_000_000_000, 1_050_000_000);
        let received = received_amount(
            &receipt,
            MERCHANT,
            &AssetKind::Native { decimals: 9 },
        )
        .unwrap();
        assert_eq!(received.amount, Decimal::from_str("0.050000000").unwrap());
        assert_eq!(received.slot, 2_480_551);
    }

    #[test]
    fn failed_transaction_is_never_a_payment() {
        let mut receipt = native_receipt(0, 1_000_000_000);
        receipt.failed = true;
        let err = received_amount(&receipt, MERCHANT, &AssetKind::Native { decimals: 9 })
            .unwrap_err();
        assert!(matches!(err, ReceiptError::TransactionFailed));
    }

    #[test]
    fn absent_merchant_is_wrong_recipient() {
        let mut receipt = native_receipt(0, 1_000_000_000);
        receipt.account_keys = vec![PAYER.to_string()];
        let err = received_amount(&receipt, MERCHANT, &AssetKind::Native { decimals: 9 })
            .unwrap_err();
        assert!(matches!(err, ReceiptError::WrongRecipient(_)));
    }

    #[test]
    fn net_outflow_clamps_to_zero() {
        let receipt = native_receipt(2_000_000_000, 1_500_000_000);
        let received = received_amount(
            &receipt,
            MERCHANT,
            &AssetKind::Native { decimals: 9 },
        )
        .unwrap();
        assert_eq!(received.amount, Decimal::ZERO);
    }

    #[test]
    fn token_delta_matches_owner_and_mint() {
        let mint = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
        let other_mint = "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB";
        let mut receipt = native_receipt(0, 0);
        receipt.pre_token_balances = vec![
            token_entry(MERCHANT, mint, 10_000_000),
            token_entry(MERCHANT, other_mint, 999_000_000),
        ];
        receipt.post_token_balances = vec![
            token_entry(MERCHANT, mint, 307_000_000),
            token_entry(MERCHANT, other_mint, 999_000_000),
            token_entry(PAYER, mint, 1),
        ];
        let received = received_amount(
            &receipt,
            MERCHANT,
            &AssetKind::Token { mint, decimals: 6 },
        )
        .unwrap();
        assert_eq!(received.amount, Decimal::from_str("297.000000").unwrap());
    }

    #[test]
    fn missing_pre_side_is_zero_balance() {
        let mint = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
        let mut receipt = native_receipt(0, 0);
        receipt.post_token_balances = vec![token_entry(MERCHANT, mint, 5_000_000)];
        let received = received_amount(
            &receipt,
            MERCHANT,
            &AssetKind::Token { mint, decimals: 6 },
        )
        .unwrap();
        assert_eq!(received.amount, Decimal::from_str("5.000000").unwrap());
    }

    #[tokio::test]
    async fn rpc_parses_json_parsed_receipt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {
                    "slot": 2480551,
                    "blockTime": 1730000000,
                    "meta": {
                        "err": null,
                        "preBalances": [5000000000u64, 1000000000u64],
                        "postBalances": [4950000000u64, 1050000000u64],
                        "preTokenBalances": [],
                        "postTokenBalances": []
                    },
                    "transaction": {
                        "message": {
                            "accountKeys": [
                                {"pubkey": PAYER, "signer": true},
                                {"pubkey": MERCHANT, "signer": false}
                            ]
                        }
                    }
                }
            })))
            .mount(&server)
            .await;

        let rpc = HttpChainRpc::new(server.uri().parse().unwrap());
        let receipt = rpc
            .transaction_receipt("5sig111111111111111111111111111111111111111111111111111111111111")
            .await
            .unwrap()
            .unwrap();
        assert!(!receipt.failed);
        assert_eq!(receipt.account_keys[1], MERCHANT);
        assert_eq!(receipt.post_balances[1], 1_050_000_000);
    }

    #[tokio::test]
    async fn rpc_unknown_transaction_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": null
            })))
            .mount(&server)
            .await;

        let rpc = HttpChainRpc::new(server.uri().parse().unwrap());
        let receipt = rpc.transaction_receipt("missing").await.unwrap();
        assert!(receipt.is_none());
    }
}
