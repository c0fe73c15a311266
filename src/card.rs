//! Card-network rail: payment intents and asynchronous webhook
//! reconciliation.
//!
//! One physical webhook endpoint receives every billing event. The signature
//! is verified against the shared signing secret before any parsing or store
//! access; event bodies then decode at the boundary into the tagged
//! [`BillingEvent`] enum, and each kind has its own reconciliation handler.
//! Delivery is at-least-once and possibly out of order, so every handler is
//! safe to run twice: token credits are guarded by the record's status, and
//! seat/activation changes are guarded by the subscription id on file.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use url::Url;

use crate::ledger::{BillingMode, LedgerError, LedgerService, NotificationEvent, Notifier};
use crate::store::{SettleOutcome, Settlement, StoreError, TransactionStore};
use crate::timestamp::{Clock, UnixTimestamp};
use crate::types::{
    BillingKind, PaymentMethod, PaymentRecordError, PaymentStatus, PaymentTransaction,
    ReferenceCode,
};

type HmacSha256 = Hmac<Sha256>;

/// Reject signed events older (or newer) than this.
const SIGNATURE_TOLERANCE_SECS: u64 = 300;

/// Seat limit a company falls back to when its subscription is deleted.
const SEAT_FLOOR: u32 = 1;

const GATEWAY_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Payment intents
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// No API key configured for the card gateway.
    #[error("Card gateway is not configured: {0}")]
    ConfigurationMissing(&'static str),
    #[error("Card gateway transport error: {0}")]
    Http(String),
    #[error("Card gateway returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Malformed card gateway response: {0}")]
    Malformed(String),
}

/// An intent created at the card network, returned to the browser client.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
}

/// The consumed card-network SDK surface: create a payment intent.
#[async_trait]
pub trait CardGateway: Send + Sync {
    async fn create_payment_intent(
        &self,
        amount_usd: Decimal,
        reference: &ReferenceCode,
    ) -> Result<PaymentIntent, GatewayError>;
}

/// Thin REST implementation of [`CardGateway`].
#[derive(Debug, Clone)]
pub struct RestCardGateway {
    client: Client,
    base_url: Url,
    secret_key: String,
}

impl RestCardGateway {
    pub fn new(base_url: Url, secret_key: String) -> Result<Self, GatewayError> {
        if secret_key.is_empty() {
            return Err(GatewayError::ConfigurationMissing("secret key"));
        }
        let client = Client::builder()
            .timeout(GATEWAY_TIMEOUT)
            .build()
            .expect("reqwest client");
        Ok(Self {
            client,
            base_url,
            secret_key,
        })
    }
}

#[async_trait]
impl CardGateway for RestCardGateway {
    #[instrument(skip_all, err, fields(reference = %reference))]
    async fn create_payment_intent(
        &self,
        amount_usd: Decimal,
        reference: &ReferenceCode,
    ) -> Result<PaymentIntent, GatewayError> {
        let cents = (amount_usd * Decimal::from(100))
            .trunc()
            .to_u64()
            .ok_or_else(|| GatewayError::Malformed("amount does not fit in cents".to_string()))?;
        let url = self
            .base_url
            .join("v1/payment_intents")
            .map_err(|e| GatewayError::Http(e.to_string()))?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.secret_key)
            .form(&[
                ("amount", cents.to_string()),
                ("currency", "usd".to_string()),
                ("metadata[reference_code]", reference.to_string()),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::Http(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status { status, body });
        }
        response
            .json::<PaymentIntent>()
            .await
            .map_err(|e| GatewayError::Malformed(e.to_string()))
    }
}

/// Stand-in gateway used when no API key is configured. Every intent
/// creation fails with [`GatewayError::ConfigurationMissing`]; webhook
/// reconciliation is unaffected.
#[derive(Debug, Default)]
pub struct UnconfiguredGateway;

#[async_trait]
impl CardGateway for UnconfiguredGateway {
    async fn create_payment_intent(
        &self,
        _amount_usd: Decimal,
        _reference: &ReferenceCode,
    ) -> Result<PaymentIntent, GatewayError> {
        Err(GatewayError::ConfigurationMissing("secret key"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CardRailError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Record(#[from] PaymentRecordError),
}

/// Reply to a seat-based intent creation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PaymentIntentReply {
    pub reference_code: ReferenceCode,
    pub client_secret: String,
    pub amount_usd: Decimal,
    pub status: PaymentStatus,
}

/// Creates seat-based card charges and persists their write-ahead records.
pub struct CardPaymentGateway {
    gateway: Arc<dyn CardGateway>,
    store: Arc<dyn TransactionStore>,
    clock: Arc<dyn Clock>,
    seat_price_usd: Decimal,
}

impl CardPaymentGateway {
    pub fn new(
        gateway: Arc<dyn CardGateway>,
        store: Arc<dyn TransactionStore>,
        clock: Arc<dyn Clock>,
        seat_price_usd: Decimal,
    ) -> Self {
        Self {
            gateway,
            store,
            clock,
            seat_price_usd,
        }
    }

    /// Computes the seat-based USD amount, creates the external intent, and
    /// persists a `pending` record keyed by the intent id.
    #[instrument(skip_all, err, fields(seat_count))]
    pub async fn create_payment_intent(
        &self,
        seat_count: u32,
        user_id: Option<String>,
        company_id: Option<String>,
    ) -> Result<PaymentIntentReply, CardRailError> {
        let seats = seat_count.max(1);
        let amount_usd = self.seat_price_usd * Decimal::from(seats);
        let now = self.clock.now();

        let mut record = PaymentTransaction::new_pending(
            user_id,
            company_id,
            BillingKind::Seats { seat_count: seats },
            PaymentMethod::Stripe,
            None,
            None,
            amount_usd,
            amount_usd,
            Decimal::ONE,
            now,
        )?;
        let intent = self
            .gateway
            .create_payment_intent(amount_usd, &record.reference_code)
            .await?;
        record.external_id = Some(intent.id);
        let reference_code = record.reference_code.clone();
        self.store.insert(record).await?;

        Ok(PaymentIntentReply {
            reference_code,
            client_secret: intent.client_secret,
            amount_usd,
            status: PaymentStatus::Pending,
        })
    }
}

// ---------------------------------------------------------------------------
// Webhook signature
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Invalid webhook signature")]
    SignatureInvalid,
    #[error("Malformed webhook signature header")]
    MalformedSignatureHeader,
    #[error("Webhook timestamp outside tolerance")]
    StaleTimestamp,
    #[error("Malformed webhook event: {0}")]
    MalformedEvent(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Record(#[from] PaymentRecordError),
}

/// Verifies a `t=...,v1=...` HMAC-SHA256 signature header over
/// `"{t}.{payload}"`. Runs before any parsing; a failure means the request
/// must be rejected with no store access at all.
pub fn verify_webhook_signature(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
    now: UnixTimestamp,
) -> Result<(), WebhookError> {
    let mut timestamp: Option<&str> = None;
    let mut signature: Option<&str> = None;
    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => signature = Some(value),
            _ => {}
        }
    }
    let (timestamp, signature) = match (timestamp, signature) {
        (Some(t), Some(v)) => (t, v),
        _ => return Err(WebhookError::MalformedSignatureHeader),
    };
    let event_time = timestamp
        .parse::<u64>()
        .map_err(|_| WebhookError::MalformedSignatureHeader)?;
    let skew = now.as_secs().abs_diff(event_time);
    if skew > SIGNATURE_TOLERANCE_SECS {
        return Err(WebhookError::StaleTimestamp);
    }

    let expected = hex::decode(signature).map_err(|_| WebhookError::SignatureInvalid)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any size");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    // Constant-time comparison.
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::SignatureInvalid)
}

// ---------------------------------------------------------------------------
// Event decoding
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(rename = "type")]
    kind: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: serde_json::Value,
}

/// A recurring subscription as carried inside events: either expanded or by
/// bare id.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SubscriptionField {
    Expanded(SubscriptionObject),
    Id(String),
}

impl SubscriptionField {
    pub fn id(&self) -> &str {
        match self {
            SubscriptionField::Expanded(object) => &object.id,
            SubscriptionField::Id(id) => id,
        }
    }

    pub fn seat_quantity(&self) -> u32 {
        match self {
            SubscriptionField::Expanded(object) => object.seat_quantity(),
            SubscriptionField::Id(_) => 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    quantity: Option<u32>,
    #[serde(default)]
    items: Option<SubscriptionItems>,
}

#[derive(Debug, Clone, Deserialize)]
struct SubscriptionItems {
    #[serde(default)]
    data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct SubscriptionItem {
    #[serde(default)]
    quantity: Option<u32>,
}

impl SubscriptionObject {
    pub fn seat_quantity(&self) -> u32 {
        self.quantity
            .or_else(|| {
                self.items
                    .as_ref()
                    .and_then(|items| items.data.first())
                    .and_then(|item| item.quantity)
            })
            .unwrap_or(1)
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status.as_deref(), Some("active") | Some("trialing"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    pub payment_status: String,
    #[serde(default)]
    pub subscription: Option<SubscriptionField>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChargeObject {
    pub id: String,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    /// Paid amount in cents.
    #[serde(default)]
    pub amount_paid: u64,
}

/// Billing events this engine reconciles, decoded at the boundary.
#[derive(Debug, Clone)]
pub enum BillingEvent {
    CheckoutCompleted(CheckoutSession),
    SubscriptionUpdated(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    ChargeSucceeded(ChargeObject),
    InvoicePaid(InvoiceObject),
    InvoicePaymentFailed(InvoiceObject),
    /// Anything else is acknowledged and ignored.
    Other(String),
}

/// Decodes a raw event body into a [`BillingEvent`].
pub fn parse_event(body: &[u8]) -> Result<BillingEvent, WebhookError> {
    fn decode<T: serde::de::DeserializeOwned>(
        kind: &str,
        value: serde_json::Value,
    ) -> Result<T, WebhookError> {
        serde_json::from_value(value)
            .map_err(|e| WebhookError::MalformedEvent(format!("{kind}: {e}")))
    }

    let envelope: EventEnvelope = serde_json::from_slice(body)
        .map_err(|e| WebhookError::MalformedEvent(e.to_string()))?;
    let object = envelope.data.object;
    Ok(match envelope.kind.as_str() {
        "checkout.session.completed" => {
            BillingEvent::CheckoutCompleted(decode(&envelope.kind, object)?)
        }
        "customer.subscription.updated" => {
            BillingEvent::SubscriptionUpdated(decode(&envelope.kind, object)?)
        }
        "customer.subscription.deleted" => {
            BillingEvent::SubscriptionDeleted(decode(&envelope.kind, object)?)
        }
        "charge.succeeded" => BillingEvent::ChargeSucceeded(decode(&envelope.kind, object)?),
        "invoice.payment_succeeded" => BillingEvent::InvoicePaid(decode(&envelope.kind, object)?),
        "invoice.payment_failed" => {
            BillingEvent::InvoicePaymentFailed(decode(&envelope.kind, object)?)
        }
        other => BillingEvent::Other(other.to_string()),
    })
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Reconciles asynchronous billing events into the ledger, exactly once per
/// effect.
pub struct WebhookReconciler {
    store: Arc<dyn TransactionStore>,
    ledger: Arc<dyn LedgerService>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    signing_secret: String,
    /// USD value of one token, for converting renewal payments.
    token_unit_price_usd: Decimal,
}

impl WebhookReconciler {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        ledger: Arc<dyn LedgerService>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        signing_secret: String,
        token_unit_price_usd: Decimal,
    ) -> Self {
        Self {
            store,
            ledger,
            notifier,
            clock,
            signing_secret,
            token_unit_price_usd,
        }
    }

    /// Verifies the signature, decodes the event, and dispatches it.
    ///
    /// An error anywhere means the caller must answer non-2xx so the card
    /// network redelivers; every handler converges when re-run.
    #[instrument(skip_all, err)]
    pub async fn handle(&self, body: &[u8], signature_header: &str) -> Result<(), WebhookError> {
        verify_webhook_signature(body, signature_header, &self.signing_secret, self.clock.now())?;
        let event = parse_event(body)?;
        self.reconcile(event).await
    }

    /// Applies one decoded event. Split from [`Self::handle`] so tests can
    /// drive events without signing them.
    pub async fn reconcile(&self, event: BillingEvent) -> Result<(), WebhookError> {
        match event {
            BillingEvent::CheckoutCompleted(session) => self.on_checkout_completed(session).await,
            BillingEvent::SubscriptionUpdated(sub) => self.on_subscription_updated(sub).await,
            BillingEvent::SubscriptionDeleted(sub) => self.on_subscription_deleted(sub).await,
            BillingEvent::ChargeSucceeded(charge) => self.on_charge_succeeded(charge).await,
            BillingEvent::InvoicePaid(invoice) => self.on_invoice_paid(invoice).await,
            BillingEvent::InvoicePaymentFailed(invoice) => {
                tracing::warn!(invoice = %invoice.id, "invoice payment failed");
                Ok(())
            }
            BillingEvent::Other(kind) => {
                tracing::debug!(kind, "ignoring unhandled event kind");
                Ok(())
            }
        }
    }

    #[instrument(skip_all, err)]
    async fn on_checkout_completed(&self, session: CheckoutSession) -> Result<(), WebhookError> {
        let Some(email) = session.customer_email.as_deref() else {
            tracing::debug!("checkout event carries no email; skipping");
            return Ok(());
        };
        let Some(user) = self.ledger.find_user_by_email(email).await? else {
            tracing::debug!(email, "checkout for unknown user; skipping");
            return Ok(());
        };
        if let Some(customer_id) = session.customer.as_deref() {
            self.ledger.record_customer(&user.id, customer_id).await?;
        }
        if session.payment_status != "paid" {
            tracing::debug!(status = %session.payment_status, "checkout not paid yet");
            return Ok(());
        }

        match &session.subscription {
            Some(subscription) => {
                let seats = subscription.seat_quantity();
                self.ledger
                    .set_user_subscription(&user.id, Some(subscription.id()), seats, true)
                    .await?;
                self.ledger
                    .set_company_seats(&user.company_id, seats, Some(subscription.id()))
                    .await?;
                self.notifier
                    .notify(NotificationEvent::SubscriptionActivated {
                        company_id: user.company_id.clone(),
                        seats,
                    })
                    .await;
            }
            None => {
                // One-off checkout: activate without touching seat state.
                self.ledger
                    .set_user_subscription(
                        &user.id,
                        user.subscription_id.as_deref(),
                        user.seat_quantity,
                        true,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    #[instrument(skip_all, err, fields(subscription = %sub.id))]
    async fn on_subscription_updated(&self, sub: SubscriptionObject) -> Result<(), WebhookError> {
        let Some(customer) = sub.customer.as_deref() else {
            return Ok(());
        };
        let users = self.ledger.find_users_by_customer(customer).await?;
        for user in users {
            // Only the subscription on file may mutate this account; an
            // unrelated subscription for the same customer is a no-op.
            if user.subscription_id.as_deref() != Some(sub.id.as_str()) {
                tracing::debug!(user = %user.id, "event subscription does not match the one on file");
                continue;
            }
            let seats = sub.seat_quantity();
            let active = sub.is_active();
            self.ledger
                .set_user_subscription(&user.id, Some(&sub.id), seats, active)
                .await?;
            self.ledger
                .set_company_seats(&user.company_id, seats, Some(&sub.id))
                .await?;
        }
        Ok(())
    }

    #[instrument(skip_all, err, fields(subscription = %sub.id))]
    async fn on_subscription_deleted(&self, sub: SubscriptionObject) -> Result<(), WebhookError> {
        let Some(customer) = sub.customer.as_deref() else {
            return Ok(());
        };
        let users = self.ledger.find_users_by_customer(customer).await?;
        for user in users {
            if user.subscription_id.as_deref() != Some(sub.id.as_str()) {
                continue;
            }
            self.ledger
                .set_user_subscription(&user.id, None, 0, false)
                .await?;
            self.ledger
                .set_company_seats(&user.company_id, SEAT_FLOOR, None)
                .await?;
        }
        Ok(())
    }

    #[instrument(skip_all, err, fields(charge = %charge.id))]
    async fn on_charge_succeeded(&self, charge: ChargeObject) -> Result<(), WebhookError> {
        let external_id = charge.payment_intent.as_deref().unwrap_or(&charge.id);
        let Some(record) = self.store.find_by_external_id(external_id).await? else {
            tracing::debug!(external_id, "charge does not reference our records; skipping");
            return Ok(());
        };

        let settlement = Settlement {
            transaction_hash: None,
            wallet_address: None,
            metadata: serde_json::json!({ "charge_id": charge.id }),
            now: self.clock.now(),
        };
        let outcome = self.store.settle(&record.reference_code, settlement).await?;
        let SettleOutcome::NewlyCompleted(settled) = outcome else {
            // Redelivered event: credited on a prior delivery.
            tracing::debug!(reference = %record.reference_code, "charge already reconciled");
            return Ok(());
        };

        match settled.billing {
            BillingKind::Tokens { token_amount } => {
                if let Some(company_id) = settled.company_id.as_deref() {
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
            BillingKind::Seats { seat_count } if seat_count > 0 => {
                if let Some(user_id) = settled.user_id.as_deref() {
                    self.ledger
                        .set_user_subscription(
                            user_id,
                            charge.subscription.as_deref(),
                            seat_count,
                            true,
                        )
                        .await?;
                }
                if let Some(company_id) = settled.company_id.as_deref() {
                    self.ledger
                        .set_company_seats(company_id, seat_count, charge.subscription.as_deref())
                        .await?;
                    self.notifier
                        .notify(NotificationEvent::SubscriptionActivated {
                            company_id: company_id.to_string(),
                            seats: seat_count,
                        })
                        .await;
                }
            }
            BillingKind::Seats { .. } => {}
        }
        Ok(())
    }

    /// Recurring renewal. Finds the company by the subscription on file; if
    /// auto-renewal is enabled, token-mode companies convert the paid amount
    /// (credit balance first) into tokens, seat-mode companies get a renewal
    /// stamp. Every invoice produces its own fresh audit row.
    #[instrument(skip_all, err, fields(invoice = %invoice.id))]
    async fn on_invoice_paid(&self, invoice: InvoiceObject) -> Result<(), WebhookError> {
        let Some(subscription_id) = invoice.subscription.as_deref() else {
            tracing::debug!("invoice without subscription; skipping");
            return Ok(());
        };
        let Some(company) = self
            .ledger
            .find_company_by_subscription(subscription_id)
            .await?
        else {
            tracing::debug!(subscription_id, "no company on file for subscription; skipping");
            return Ok(());
        };
        if !company.auto_renew {
            tracing::info!(company = %company.id, "auto-renewal disabled; not reconciling invoice");
            return Ok(());
        }

        // Redelivery guard: one audit row per external invoice id.
        if let Some(existing) = self.store.find_by_external_id(&invoice.id).await? {
            if existing.status == PaymentStatus::Completed {
                tracing::debug!(invoice = %invoice.id, "invoice already reconciled");
                return Ok(());
            }
        }

        let amount_usd = Decimal::from(invoice.amount_paid) / Decimal::from(100);
        let now = self.clock.now();

        let (billing, minted) = match company.billing_mode {
            BillingMode::Tokens => {
                let remainder = self
                    .ledger
                    .apply_account_credit(&company.id, amount_usd)
                    .await?;
                let tokens = (remainder / self.token_unit_price_usd)
                    .trunc()
                    .to_u64()
                    .unwrap_or(0);
                (BillingKind::Tokens { token_amount: tokens }, tokens)
            }
            BillingMode::Seats => {
                self.ledger.stamp_renewal(&company.id).await?;
                (
                    BillingKind::Seats {
                        seat_count: company.seat_limit,
                    },
                    0,
                )
            }
        };

        let mut record = PaymentTransaction::new_pending(
            None,
            Some(company.id.clone()),
            billing,
            PaymentMethod::StripeSubscription,
            None,
            None,
            amount_usd,
            amount_usd,
            Decimal::ONE,
            now,
        )?;
        record.external_id = Some(invoice.id.clone());
        let reference = record.reference_code.clone();
        self.store.insert(record).await?;
        self.store
            .settle(
                &reference,
                Settlement {
                    transaction_hash: None,
                    wallet_address: None,
                    metadata: serde_json::json!({
                        "invoice_id": invoice.id,
                        "amount_paid_cents": invoice.amount_paid,
                        "tokens_minted": minted,
                    }),
                    now,
                },
            )
            .await?;

        if minted > 0 {
            self.ledger
                .credit_tokens(&company.id, minted, amount_usd)
                .await?;
            self.notifier
                .notify(NotificationEvent::TokensCredited {
                    company_id: company.id.clone(),
                    tokens: minted,
                    amount_usd,
                    reference_code: reference.to_string(),
                })
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{InMemoryLedger, LedgerCompany, LedgerUser, LogNotifier};
    use crate::store::InMemoryTransactionStore;
    use crate::timestamp::test_clock::FixedClock;

    fn sign(payload: &[u8], secret: &str, timestamp: u64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_is_accepted() {
        let payload = br#"{"type":"charge.succeeded"}"#;
        let header = sign(payload, "whsec_abc", 10_000);
        verify_webhook_signature(payload, &header, "whsec_abc", UnixTimestamp::from_secs(10_060))
            .unwrap();
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let payload = br#"{"type":"charge.succeeded"}"#;
        let header = sign(payload, "whsec_other", 10_000);
        let err = verify_webhook_signature(
            payload,
            &header,
            "whsec_abc",
            UnixTimestamp::from_secs(10_000),
        )
        .unwrap_err();
        assert!(matches!(err, WebhookError::SignatureInvalid));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let payload = br#"{"type":"charge.succeeded"}"#;
        let header = sign(payload, "whsec_abc", 10_000);
        let err = verify_webhook_signature(
            br#"{"type":"charge.succeeded","amount":1}"#,
            &header,
            "whsec_abc",
            UnixTimestamp::from_secs(10_000),
        )
        .unwrap_err();
        assert!(matches!(err, WebhookError::SignatureInvalid));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let payload = br#"{"type":"charge.succeeded"}"#;
        let header = sign(payload, "whsec_abc", 10_000);
        let err = verify_webhook_signature(
            payload,
            &header,
            "whsec_abc",
            UnixTimestamp::from_secs(10_000 + SIGNATURE_TOLERANCE_SECS + 1),
        )
        .unwrap_err();
        assert!(matches!(err, WebhookError::StaleTimestamp));
    }

    #[test]
    fn malformed_header_is_rejected() {
        for header in ["", "garbage", "t=123", "v1=deadbeef"] {
            let err = verify_webhook_signature(
                b"{}",
                header,
                "whsec_abc",
                UnixTimestamp::from_secs(0),
            )
            .unwrap_err();
            assert!(matches!(err, WebhookError::MalformedSignatureHeader));
        }
    }

    struct Harness {
        reconciler: WebhookReconciler,
        store: Arc<InMemoryTransactionStore>,
        ledger: Arc<InMemoryLedger>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryTransactionStore::new());
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.upsert_user(LedgerUser {
            id: "user-1".to_string(),
            email: "dev@acme.test".to_string(),
            company_id: "acme".to_string(),
            customer_id: None,
            subscription_id: None,
            seat_quantity: 0,
            active: false,
        });
        ledger.upsert_company(LedgerCompany {
            id: "acme".to_string(),
            seat_limit: 1,
            subscription_id: None,
            token_balance: 0,
            token_balance_usd: Decimal::ZERO,
            credit_balance_usd: Decimal::ZERO,
            auto_renew: true,
            billing_mode: BillingMode::Tokens,
        });
        let reconciler = WebhookReconciler::new(
            store.clone(),
            ledger.clone(),
            Arc::new(LogNotifier),
            Arc::new(FixedClock::at(50_000)),
            "whsec_abc".to_string(),
            Decimal::new(1, 2), // $0.01 per token
        );
        Harness {
            reconciler,
            store,
            ledger,
        }
    }

    fn checkout_event(payment_status: &str, email: &str) -> BillingEvent {
        parse_event(
            serde_json::json!({
                "type": "checkout.session.completed",
                "data": {"object": {
                    "customer_email": email,
                    "customer": "cus_77",
                    "payment_status": payment_status,
                    "subscription": {
                        "id": "sub_9",
                        "status": "active",
                        "items": {"data": [{"quantity": 4}]}
                    }
                }}
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn checkout_paid_activates_and_persists_seats() {
        let h = harness();
        h.reconciler.reconcile(checkout_event("paid", "dev@acme.test")).await.unwrap();

        let user = h.ledger.user("user-1").unwrap();
        assert!(user.active);
        assert_eq!(user.customer_id.as_deref(), Some("cus_77"));
        assert_eq!(user.subscription_id.as_deref(), Some("sub_9"));
        assert_eq!(user.seat_quantity, 4);
        let acme = h.ledger.company("acme").await.unwrap().unwrap();
        assert_eq!(acme.seat_limit, 4);
        assert_eq!(acme.subscription_id.as_deref(), Some("sub_9"));
    }

    #[tokio::test]
    async fn checkout_unpaid_records_customer_only() {
        let h = harness();
        h.reconciler
            .reconcile(checkout_event("unpaid", "dev@acme.test"))
            .await
            .unwrap();

        let user = h.ledger.user("user-1").unwrap();
        assert!(!user.active);
        assert_eq!(user.customer_id.as_deref(), Some("cus_77"));
        assert_eq!(user.seat_quantity, 0);
    }

    #[tokio::test]
    async fn checkout_for_unknown_email_is_a_noop() {
        let h = harness();
        h.reconciler
            .reconcile(checkout_event("paid", "stranger@elsewhere.test"))
            .await
            .unwrap();
        assert!(!h.ledger.user("user-1").unwrap().active);
    }

    fn subscription_event(kind: &str, sub_id: &str, quantity: u32, status: &str) -> BillingEvent {
        parse_event(
            serde_json::json!({
                "type": kind,
                "data": {"object": {
                    "id": sub_id,
                    "customer": "cus_77",
                    "status": status,
                    "items": {"data": [{"quantity": quantity}]}
                }}
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn foreign_subscription_update_is_a_noop() {
        let h = harness();
        h.reconciler.reconcile(checkout_event("paid", "dev@acme.test")).await.unwrap();

        // An event for a different subscription id must not mutate state.
        h.reconciler
            .reconcile(subscription_event(
                "customer.subscription.updated",
                "sub_unrelated",
                9,
                "active",
            ))
            .await
            .unwrap();
        let user = h.ledger.user("user-1").unwrap();
        assert_eq!(user.seat_quantity, 4);
        assert_eq!(h.ledger.company("acme").await.unwrap().unwrap().seat_limit, 4);
    }

    #[tokio::test]
    async fn matching_subscription_update_resyncs_seats_and_status() {
        let h = harness();
        h.reconciler.reconcile(checkout_event("paid", "dev@acme.test")).await.unwrap();

        h.reconciler
            .reconcile(subscription_event(
                "customer.subscription.updated",
                "sub_9",
                7,
                "past_due",
            ))
            .await
            .unwrap();
        let user = h.ledger.user("user-1").unwrap();
        assert_eq!(user.seat_quantity, 7);
        assert!(!user.active);
        assert_eq!(h.ledger.company("acme").await.unwrap().unwrap().seat_limit, 7);
    }

    #[tokio::test]
    async fn subscription_deleted_resets_to_seat_floor() {
        let h = harness();
        h.reconciler.reconcile(checkout_event("paid", "dev@acme.test")).await.unwrap();

        h.reconciler
            .reconcile(subscription_event(
                "customer.subscription.deleted",
                "sub_9",
                4,
                "canceled",
            ))
            .await
            .unwrap();
        let user = h.ledger.user("user-1").unwrap();
        assert!(!user.active);
        assert_eq!(user.seat_quantity, 0);
        assert!(user.subscription_id.is_none());
        assert_eq!(
            h.ledger.company("acme").await.unwrap().unwrap().seat_limit,
            SEAT_FLOOR
        );
    }

    async fn seed_token_intent(h: &Harness) -> ReferenceCode {
        let mut record = PaymentTransaction::new_pending(
            Some("user-1".to_string()),
            Some("acme".to_string()),
            BillingKind::Tokens { token_amount: 2_000 },
            PaymentMethod::Stripe,
            None,
            None,
            Decimal::new(20, 0),
            Decimal::new(20, 0),
            Decimal::ONE,
            UnixTimestamp::from_secs(49_000),
        )
        .unwrap();
        record.external_id = Some("pi_500".to_string());
        let reference = record.reference_code.clone();
        h.store.insert(record).await.unwrap();
        reference
    }

    fn charge_event(intent: &str) -> BillingEvent {
        parse_event(
            serde_json::json!({
                "type": "charge.succeeded",
                "data": {"object": {"id": "ch_1", "payment_intent": intent}}
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn duplicate_charge_event_credits_once() {
        let h = harness();
        let reference = seed_token_intent(&h).await;

        h.reconciler.reconcile(charge_event("pi_500")).await.unwrap();
        h.reconciler.reconcile(charge_event("pi_500")).await.unwrap();

        let acme = h.ledger.company("acme").await.unwrap().unwrap();
        assert_eq!(acme.token_balance, 2_000);
        let record = h.store.get(&reference).await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn charge_for_foreign_intent_is_a_noop() {
        let h = harness();
        seed_token_intent(&h).await;
        h.reconciler.reconcile(charge_event("pi_unknown")).await.unwrap();
        let acme = h.ledger.company("acme").await.unwrap().unwrap();
        assert_eq!(acme.token_balance, 0);
    }

    fn invoice_event(invoice_id: &str, subscription: &str, cents: u64) -> BillingEvent {
        parse_event(
            serde_json::json!({
                "type": "invoice.payment_succeeded",
                "data": {"object": {
                    "id": invoice_id,
                    "customer": "cus_77",
                    "subscription": subscription,
                    "amount_paid": cents
                }}
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn renewal_applies_credit_before_minting_tokens() {
        let h = harness();
        h.ledger.upsert_company(LedgerCompany {
            id: "acme".to_string(),
            seat_limit: 1,
            subscription_id: Some("sub_9".to_string()),
            token_balance: 0,
            token_balance_usd: Decimal::ZERO,
            credit_balance_usd: Decimal::new(30, 0),
            auto_renew: true,
            billing_mode: BillingMode::Tokens,
        });

        // $50 paid; $30 consumed by credit; $20 remainder mints 2000 tokens
        // at $0.01 apiece.
        h.reconciler
            .reconcile(invoice_event("in_1", "sub_9", 5_000))
            .await
            .unwrap();
        let acme = h.ledger.company("acme").await.unwrap().unwrap();
        assert_eq!(acme.token_balance, 2_000);
        assert_eq!(acme.credit_balance_usd, Decimal::ZERO);

        // Redelivery of the same invoice id is a no-op.
        h.reconciler
            .reconcile(invoice_event("in_1", "sub_9", 5_000))
            .await
            .unwrap();
        let acme = h.ledger.company("acme").await.unwrap().unwrap();
        assert_eq!(acme.token_balance, 2_000);

        // Each new invoice gets its own audit row.
        let row = h.store.find_by_external_id("in_1").await.unwrap().unwrap();
        assert_eq!(row.status, PaymentStatus::Completed);
        assert_eq!(row.payment_method, PaymentMethod::StripeSubscription);
    }

    #[tokio::test]
    async fn seat_mode_renewal_mints_nothing() {
        let h = harness();
        h.ledger.upsert_company(LedgerCompany {
            id: "acme".to_string(),
            seat_limit: 5,
            subscription_id: Some("sub_9".to_string()),
            token_balance: 0,
            token_balance_usd: Decimal::ZERO,
            credit_balance_usd: Decimal::ZERO,
            auto_renew: true,
            billing_mode: BillingMode::Seats,
        });

        h.reconciler
            .reconcile(invoice_event("in_2", "sub_9", 49_500))
            .await
            .unwrap();
        let acme = h.ledger.company("acme").await.unwrap().unwrap();
        assert_eq!(acme.token_balance, 0);
        let row = h.store.find_by_external_id("in_2").await.unwrap().unwrap();
        assert_eq!(row.billing.seat_count(), Some(5));
    }

    #[tokio::test]
    async fn invoice_payment_failed_mutates_nothing() {
        let h = harness();
        let event = parse_event(
            serde_json::json!({
                "type": "invoice.payment_failed",
                "data": {"object": {"id": "in_3", "subscription": "sub_9", "amount_paid": 0}}
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap();
        h.reconciler.reconcile(event).await.unwrap();
        let acme = h.ledger.company("acme").await.unwrap().unwrap();
        assert_eq!(acme.token_balance, 0);
        assert!(h.store.find_by_external_id("in_3").await.unwrap().is_none());
    }
}
