//! HTTP endpoints for the settlement rails.
//!
//! - `POST /invoices` — create a crypto invoice.
//! - `POST /invoices/{reference_code}/verify` — verify a submitted
//!   transaction hash and settle the invoice.
//! - `POST /payment-intents` — create a seat-based card charge.
//! - `POST /webhook` — signed card-network events; an invalid or missing
//!   signature is rejected with 400 before anything is parsed or stored.
//! - `POST /pay` — the HTTP-402 rail: answers 402 with a payment-required
//!   envelope until an `X-PAYMENT` header arrives, then verifies/settles and
//!   echoes `X-PAYMENT-RESPONSE`.
//! - `GET /health` — liveness.
//!
//! Every typed engine error maps onto a status code here; nothing is
//! swallowed below this layer.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header::HeaderName};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

use crate::card::{CardPaymentGateway, CardRailError, GatewayError, WebhookError, WebhookReconciler};
use crate::invoice::{CreateInvoice, CryptoInvoiceService, InvoiceError};
use crate::ledger::LedgerError;
use crate::price::PricingError;
use crate::receipt::ReceiptError;
use crate::settlement::{FacilitatorPaymentService, SettlementError};
use crate::store::StoreError;
use crate::x402::{ClientPayment, X402Error};

static X_PAYMENT: HeaderName = HeaderName::from_static("x-payment");
static X_PAYMENT_RESPONSE: HeaderName = HeaderName::from_static("x-payment-response");
static SIGNATURE_HEADER: HeaderName = HeaderName::from_static("stripe-signature");

/// Everything the handlers need, wired once at startup.
pub struct AppState {
    pub invoices: CryptoInvoiceService,
    pub card: CardPaymentGateway,
    pub webhooks: WebhookReconciler,
    pub settlement: FacilitatorPaymentService,
    /// Price/currency of the 402-gated resource, from config.
    pub x402_price: rust_decimal::Decimal,
    pub x402_currency: crate::currency::Currency,
    pub merchant_company_id: String,
}

/// A simple error structure returned on failures.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        axum::Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(get_health))
        .route("/invoices", post(post_invoices))
        .route("/invoices/{reference_code}/verify", post(post_invoice_verify))
        .route("/payment-intents", post(post_payment_intents))
        .route("/webhook", post(post_webhook))
        .route("/pay", post(post_pay))
}

#[instrument(skip_all)]
async fn get_health() -> impl IntoResponse {
    axum::Json(json!({ "status": "ok" }))
}

#[instrument(skip_all)]
async fn post_invoices(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<CreateInvoice>,
) -> Response {
    match state.invoices.create_invoice(body).await {
        Ok(invoice) => (StatusCode::CREATED, axum::Json(invoice)).into_response(),
        Err(error) => invoice_error_response(error),
    }
}

#[derive(Debug, Deserialize)]
struct VerifyInvoiceBody {
    transaction_hash: String,
    #[serde(default)]
    expected_user_id: Option<String>,
}

#[instrument(skip_all, fields(reference_code))]
async fn post_invoice_verify(
    State(state): State<Arc<AppState>>,
    Path(reference_code): Path<String>,
    axum::Json(body): axum::Json<VerifyInvoiceBody>,
) -> Response {
    match state
        .invoices
        .verify_transaction(
            &reference_code,
            &body.transaction_hash,
            body.expected_user_id.as_deref(),
        )
        .await
    {
        Ok(record) => axum::Json(record).into_response(),
        Err(error) => invoice_error_response(error),
    }
}

fn invoice_error_response(error: InvoiceError) -> Response {
    tracing::warn!(error = %error, "invoice operation failed");
    match &error {
        InvoiceError::NotFound(_) | InvoiceError::TransactionNotFound(_) => {
            error_response(StatusCode::NOT_FOUND, error)
        }
        InvoiceError::OwnershipMismatch(_) => error_response(StatusCode::FORBIDDEN, error),
        InvoiceError::Expired(_) => error_response(StatusCode::GONE, error),
        InvoiceError::HashMismatch(_) => error_response(StatusCode::CONFLICT, error),
        InvoiceError::AmountBelowTolerance { .. } => error_response(StatusCode::BAD_REQUEST, error),
        InvoiceError::Receipt(ReceiptError::TransactionFailed)
        | InvoiceError::Receipt(ReceiptError::WrongRecipient(_)) => {
            error_response(StatusCode::BAD_REQUEST, error)
        }
        InvoiceError::Pricing(pricing) => match pricing {
            PricingError::UnsupportedCurrency(_) | PricingError::NonPositiveAmount => {
                error_response(StatusCode::BAD_REQUEST, error)
            }
            // Retryable: the upstream source failed; no stale rate is used.
            PricingError::Upstream(_)
            | PricingError::PriceUnavailable { .. }
            | PricingError::NonPositiveRate { .. } => error_response(StatusCode::BAD_GATEWAY, error),
        },
        InvoiceError::Rpc(_) => error_response(StatusCode::BAD_GATEWAY, error),
        InvoiceError::Store(StoreError::IllegalTransition { .. }) => {
            error_response(StatusCode::CONFLICT, error)
        }
        InvoiceError::Store(_) | InvoiceError::Ledger(_) | InvoiceError::Record(_) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, error)
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateIntentBody {
    seat_count: u32,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    company_id: Option<String>,
}

#[instrument(skip_all)]
async fn post_payment_intents(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<CreateIntentBody>,
) -> Response {
    match state
        .card
        .create_payment_intent(body.seat_count, body.user_id, body.company_id)
        .await
    {
        Ok(reply) => (StatusCode::CREATED, axum::Json(reply)).into_response(),
        Err(error) => {
            tracing::warn!(error = %error, "payment intent creation failed");
            match &error {
                CardRailError::Gateway(GatewayError::ConfigurationMissing(_)) => {
                    error_response(StatusCode::SERVICE_UNAVAILABLE, error)
                }
                CardRailError::Gateway(_) => error_response(StatusCode::BAD_GATEWAY, error),
                CardRailError::Record(_) => error_response(StatusCode::BAD_REQUEST, error),
                CardRailError::Store(_) => {
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, error)
                }
            }
        }
    }
}

#[instrument(skip_all)]
async fn post_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let Some(signature) = headers
        .get(&SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return error_response(StatusCode::BAD_REQUEST, "missing signature header");
    };

    match state.webhooks.handle(&body, signature).await {
        Ok(()) => axum::Json(json!({ "success": true })).into_response(),
        Err(error) => {
            tracing::warn!(error = %error, "webhook rejected");
            match &error {
                WebhookError::SignatureInvalid
                | WebhookError::MalformedSignatureHeader
                | WebhookError::StaleTimestamp
                | WebhookError::MalformedEvent(_) => error_response(StatusCode::BAD_REQUEST, error),
                // A handler failure returns 5xx so the card network
                // redelivers; handlers converge when re-run.
                WebhookError::Store(_) | WebhookError::Record(_) => {
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, error)
                }
                WebhookError::Ledger(LedgerError::Unavailable(_)) => {
                    error_response(StatusCode::BAD_GATEWAY, error)
                }
                WebhookError::Ledger(_) => {
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, error)
                }
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PayQuery {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    company_id: Option<String>,
    #[serde(default)]
    token_amount: Option<u64>,
}

#[instrument(skip_all)]
async fn post_pay(
    State(state): State<Arc<AppState>>,
    axum::extract::Query(query): axum::extract::Query<PayQuery>,
    headers: HeaderMap,
) -> Response {
    let resource: url::Url = "https://railpay.invalid/pay"
        .parse()
        .expect("static resource URL");
    let built = state.settlement.create_payment_request(
        state.x402_price,
        state.x402_currency,
        "x402-gated resource",
        resource,
    );
    let (envelope, requirements) = match built {
        Ok(parts) => parts,
        Err(error) => return settlement_error_response(error),
    };

    let Some(header) = headers.get(&X_PAYMENT) else {
        return (StatusCode::PAYMENT_REQUIRED, axum::Json(envelope)).into_response();
    };
    let payment = match ClientPayment::parse(header.as_bytes()) {
        Ok(payment) => payment,
        Err(error) => return error_response(StatusCode::BAD_REQUEST, error),
    };

    let company_id = query
        .company_id
        .or_else(|| Some(state.merchant_company_id.clone()));
    match state
        .settlement
        .process_payment(payment, &requirements, query.user_id, company_id, query.token_amount)
        .await
    {
        Ok(processed) => {
            let mut response = axum::Json(&processed).into_response();
            if let Ok(value) = processed.response_header().as_str().parse() {
                response.headers_mut().insert(&X_PAYMENT_RESPONSE, value);
            }
            response
        }
        Err(error) => settlement_error_response(error),
    }
}

fn settlement_error_response(error: SettlementError) -> Response {
    tracing::warn!(error = %error, "x402 payment failed");
    match &error {
        SettlementError::Decoding(_)
        | SettlementError::MalformedMessage(_)
        | SettlementError::UnknownAsset(_)
        | SettlementError::UnsupportedNetwork(_) => error_response(StatusCode::BAD_REQUEST, error),
        SettlementError::SignatureInvalid(_)
        | SettlementError::WrongMerchant
        | SettlementError::AmountMismatch { .. }
        | SettlementError::CurrencyMismatch { .. } => {
            error_response(StatusCode::PAYMENT_REQUIRED, error)
        }
        SettlementError::Facilitator(X402Error::Rejected { .. }) => {
            error_response(StatusCode::PAYMENT_REQUIRED, error)
        }
        // Transport-class facilitator failures are retryable, never conflated
        // with a verification failure.
        SettlementError::Facilitator(_) => error_response(StatusCode::BAD_GATEWAY, error),
        SettlementError::ConfigurationMissing(_) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, error)
        }
        SettlementError::Store(_) | SettlementError::Record(_) | SettlementError::Ledger(_) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, error)
        }
    }
}
