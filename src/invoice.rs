//! Crypto invoice rail: create pending invoices, verify submitted
//! transaction hashes against them, and credit the ledger exactly once.
//!
//! Verification is a pipeline of guards — ownership, idempotency, expiry,
//! receipt lookup, recipient, amount tolerance — each surfacing a typed
//! error. An amount below tolerance leaves the record `pending` so a
//! corrected transaction may still be submitted before expiry; every other
//! failure is terminal for that verification attempt but does not consume
//! the invoice.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::instrument;

use crate::currency::Currency;
use crate::ledger::{LedgerError, LedgerService, NotificationEvent, Notifier};
use crate::price::{BillingBasis, PriceQuoteService, PricingError};
use crate::receipt::{ChainRpc, ReceiptError, RpcError, received_amount};
use crate::store::{SettleOutcome, Settlement, StoreError, TransactionStore};
use crate::timestamp::{Clock, UnixTimestamp};
use crate::types::{
    BillingKind, PaymentMethod, PaymentRecordError, PaymentStatus, PaymentTransaction,
    ReferenceCode,
};

/// Fraction of the quoted amount that must arrive for a payment to settle.
/// Covers network fees and slippage; anything below fails verification.
fn amount_tolerance() -> Decimal {
    Decimal::new(995, 3)
}

/// Default invoice lifetime when the caller does not choose one.
pub const DEFAULT_INVOICE_TTL_MINUTES: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum InvoiceError {
    #[error("Invoice not found: {0}")]
    NotFound(String),
    #[error("Invoice {0} belongs to a different user")]
    OwnershipMismatch(ReferenceCode),
    /// The invoice already settled under a different transaction hash; one
    /// invoice cannot be claimed twice by different transactions.
    #[error("Invoice {0} was already settled by a different transaction")]
    HashMismatch(ReferenceCode),
    #[error("Invoice {0} has expired")]
    Expired(ReferenceCode),
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),
    #[error("Amount below tolerance: received {received}, required at least {required}")]
    AmountBelowTolerance { received: Decimal, required: Decimal },
    #[error(transparent)]
    Pricing(#[from] PricingError),
    #[error(transparent)]
    Receipt(#[from] ReceiptError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Record(#[from] PaymentRecordError),
}

/// Request to open an invoice. `seat_count` and `token_amount` pick the
/// billing mode; `amount_usd` overrides seat-based pricing with a fixed
/// top-up amount.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CreateInvoice {
    pub currency: Currency,
    #[serde(default)]
    pub seat_count: Option<u32>,
    #[serde(default)]
    pub amount_usd: Option<Decimal>,
    #[serde(default)]
    pub token_amount: Option<u64>,
    #[serde(default)]
    pub expires_in_minutes: Option<u64>,
    #[serde(default)]
    pub memo: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub company_id: Option<String>,
}

/// What the payer needs to settle an invoice.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Invoice {
    pub reference_code: ReferenceCode,
    /// The merchant wallet the payment must be sent to.
    pub wallet_address: String,
    pub memo: Option<String>,
    pub currency: Currency,
    pub network: crate::currency::Network,
    pub amount_usd: Decimal,
    pub amount_currency: Decimal,
    pub exchange_rate: Decimal,
    pub expires_at: UnixTimestamp,
}

pub struct CryptoInvoiceService {
    quotes: Arc<PriceQuoteService>,
    rpc: Arc<dyn ChainRpc>,
    store: Arc<dyn TransactionStore>,
    ledger: Arc<dyn LedgerService>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    merchant_wallet: String,
}

impl CryptoInvoiceService {
    pub fn new(
        quotes: Arc<PriceQuoteService>,
        rpc: Arc<dyn ChainRpc>,
        store: Arc<dyn TransactionStore>,
        ledger: Arc<dyn LedgerService>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        merchant_wallet: String,
    ) -> Self {
        Self {
            quotes,
            rpc,
            store,
            ledger,
            notifier,
            clock,
            merchant_wallet,
        }
    }

    /// Quotes the request, persists a `pending` record with a fresh reference
    /// code, and returns the invoice. A pricing failure blocks creation
    /// entirely; no record is written.
    #[instrument(skip_all, err, fields(currency = %request.currency))]
    pub async fn create_invoice(&self, request: CreateInvoice) -> Result<Invoice, InvoiceError> {
        let basis = match (request.amount_usd, request.seat_count) {
            (Some(amount), _) => BillingBasis::AmountUsd(amount),
            (None, Some(seats)) => BillingBasis::Seats(seats),
            (None, None) => BillingBasis::Seats(1),
        };
        let quote = self.quotes.get_quote(request.currency, basis).await?;

        let billing = match request.token_amount {
            Some(token_amount) => BillingKind::Tokens { token_amount },
            None => BillingKind::Seats {
                seat_count: request.seat_count.unwrap_or(1),
            },
        };
        let now = self.clock.now();
        let ttl_minutes = request
            .expires_in_minutes
            .unwrap_or(DEFAULT_INVOICE_TTL_MINUTES);
        let expires_at = now + ttl_minutes * 60;

        let mut record = PaymentTransaction::new_pending(
            request.user_id,
            request.company_id,
            billing,
            PaymentMethod::Crypto,
            Some(quote.currency),
            Some(quote.network),
            quote.amount_usd,
            quote.amount_currency,
            quote.exchange_rate,
            now,
        )?;
        record.memo = request.memo.clone();
        record.expires_at = Some(expires_at);
        let reference_code = record.reference_code.clone();
        self.store.insert(record).await?;

        tracing::info!(%reference_code, amount_currency = %quote.amount_currency, "invoice created");

        Ok(Invoice {
            reference_code,
            wallet_address: self.merchant_wallet.clone(),
            memo: request.memo,
            currency: quote.currency,
            network: quote.network,
            amount_usd: quote.amount_usd,
            amount_currency: quote.amount_currency,
            exchange_rate: quote.exchange_rate,
            expires_at,
        })
    }

    /// Verifies a submitted transaction hash against an invoice and settles
    /// it. Repeating the call with the same hash on a settled invoice
    /// returns the stored result and never credits the ledger again.
    #[instrument(skip_all, err, fields(reference = reference_code, hash = transaction_hash))]
    pub async fn verify_transaction(
        &self,
        reference_code: &str,
        transaction_hash: &str,
        expected_user_id: Option<&str>,
    ) -> Result<PaymentTransaction, InvoiceError> {
        let reference: ReferenceCode = reference_code
            .parse()
            .map_err(|_| InvoiceError::NotFound(reference_code.to_string()))?;
        let record = self
            .store
            .get(&reference)
            .await?
            .ok_or_else(|| InvoiceError::NotFound(reference_code.to_string()))?;

        if let (Some(expected), Some(owner)) = (expected_user_id, record.user_id.as_deref()) {
            if expected != owner {
                return Err(InvoiceError::OwnershipMismatch(reference));
            }
        }

        if record.status == PaymentStatus::Completed {
            return if record.transaction_hash.as_deref() == Some(transaction_hash) {
                Ok(record)
            } else {
                Err(InvoiceError::HashMismatch(reference))
            };
        }

        let now = self.clock.now();
        if let Some(expires_at) = record.expires_at {
            if now > expires_at {
                self.store
                    .mark(&reference, PaymentStatus::Expired, now)
                    .await?;
                return Err(InvoiceError::Expired(reference));
            }
        }

        let receipt = self
            .rpc
            .transaction_receipt(transaction_hash)
            .await?
            .ok_or_else(|| InvoiceError::TransactionNotFound(transaction_hash.to_string()))?;

        let currency = record
            .currency
            .ok_or_else(|| InvoiceError::NotFound(reference_code.to_string()))?;
        let received = received_amount(&receipt, &self.merchant_wallet, &currency.asset_kind())?;

        let required = record.amount_currency * amount_tolerance();
        if received.amount < required {
            // The record stays pending: a corrected or top-up transaction may
            // still be submitted before expiry.
            return Err(InvoiceError::AmountBelowTolerance {
                received: received.amount,
                required,
            });
        }
        if received.amount > record.amount_currency {
            tracing::warn!(
                %reference,
                received = %received.amount,
                invoiced = %record.amount_currency,
                "overpayment received; crediting the invoiced amount only"
            );
        }

        let payer = receipt.account_keys.first().cloned();
        let settlement = Settlement {
            transaction_hash: Some(transaction_hash.to_string()),
            wallet_address: payer,
            metadata: serde_json::json!({
                "slot": received.slot,
                "block_time": received.block_time,
                "confirmed_amount": received.amount,
            }),
            now,
        };
        let outcome = self.store.settle(&reference, settlement).await?;
        if let SettleOutcome::NewlyCompleted(settled) = &outcome {
            self.credit_ledger(settled).await?;
        }
        Ok(outcome.record().clone())
    }

    /// Credits the ledger for a record that settled in this call. Runs at
    /// most once per reference code, guarded by the store's status re-check.
    async fn credit_ledger(&self, record: &PaymentTransaction) -> Result<(), InvoiceError> {
        match (record.billing, record.company_id.as_deref()) {
            (BillingKind::Tokens { token_amount }, Some(company_id)) => {
                self.ledger
                    .credit_tokens(company_id, token_amount, record.amount_usd)
                    .await?;
                self.notifier
                    .notify(NotificationEvent::TokensCredited {
                        company_id: company_id.to_string(),
                        tokens: token_amount,
                        amount_usd: record.amount_usd,
                        reference_code: record.reference_code.to_string(),
                    })
                    .await;
            }
            (BillingKind::Seats { seat_count }, Some(company_id)) => {
                self.ledger
                    .set_company_seats(company_id, seat_count, None)
                    .await?;
                self.notifier
                    .notify(NotificationEvent::SubscriptionActivated {
                        company_id: company_id.to_string(),
                        seats: seat_count,
                    })
                    .await;
            }
            (_, None) => {
                tracing::warn!(
                    reference = %record.reference_code,
                    "settled invoice has no owning company; nothing to credit"
                );
            }
        }
        Ok(())
    }
}
