//! Settlement engine HTTP entrypoint.
//!
//! Launches an axum-based server exposing the three payment rails:
//!
//! - `POST /invoices`, `POST /invoices/{reference_code}/verify` — crypto rail
//! - `POST /payment-intents`, `POST /webhook` — card rail
//! - `POST /pay` — x402 rail (HTTP 402 challenge/response)
//! - `GET /health` — liveness
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control the binding address
//! - see `config` for the collaborator endpoints and merchant settings

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use railpay::card::{
    CardGateway, CardPaymentGateway, RestCardGateway, UnconfiguredGateway, WebhookReconciler,
};
use railpay::config::Config;
use railpay::handlers::{self, AppState};
use railpay::invoice::CryptoInvoiceService;
use railpay::ledger::{InMemoryLedger, LogNotifier};
use railpay::price::{PoolAggregatorSource, PriceQuoteService, SpotPriceSource, UpstreamRates};
use railpay::receipt::HttpChainRpc;
use railpay::settlement::FacilitatorPaymentService;
use railpay::store::InMemoryTransactionStore;
use railpay::telemetry::Telemetry;
use railpay::timestamp::SystemClock;
use railpay::util::SigDown;
use railpay::x402::FacilitatorClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = Config::from_env()?;

    let clock = Arc::new(SystemClock);
    let store = Arc::new(InMemoryTransactionStore::new());
    let ledger = Arc::new(InMemoryLedger::new());
    let notifier = Arc::new(LogNotifier);

    let quotes = Arc::new(PriceQuoteService::new(
        Arc::new(UpstreamRates::new(
            SpotPriceSource::new(config.spot_price_url.clone()),
            PoolAggregatorSource::new(config.pool_aggregator_url.clone()),
        )),
        clock.clone(),
        config.rate_ttl_secs,
        config.seat_price_usd,
    ));

    let invoices = CryptoInvoiceService::new(
        quotes,
        Arc::new(HttpChainRpc::new(config.rpc_url.clone())),
        store.clone(),
        ledger.clone(),
        notifier.clone(),
        clock.clone(),
        config.merchant_wallet.clone(),
    );

    let gateway: Arc<dyn CardGateway> = match &config.card_secret_key {
        Some(secret_key) => Arc::new(RestCardGateway::new(
            config.card_api_url.clone(),
            secret_key.clone(),
        )?),
        None => {
            tracing::warn!("no card gateway API key configured; payment intents are disabled");
            Arc::new(UnconfiguredGateway)
        }
    };
    let card = CardPaymentGateway::new(gateway, store.clone(), clock.clone(), config.seat_price_usd);

    let webhooks = WebhookReconciler::new(
        store.clone(),
        ledger.clone(),
        notifier.clone(),
        clock.clone(),
        config.webhook_signing_secret.clone(),
        config.token_unit_price_usd,
    );

    let settlement = FacilitatorPaymentService::new(
        FacilitatorClient::try_new(config.facilitator_url.clone())?,
        store,
        ledger,
        notifier,
        clock,
        config.merchant_wallet.clone(),
        config.merchant_evm_address.clone(),
    );

    let state = Arc::new(AppState {
        invoices,
        card,
        webhooks,
        settlement,
        x402_price: config.x402_price,
        x402_currency: config.x402_currency,
        merchant_company_id: config.merchant_company_id.clone(),
    });

    let http_endpoints = Router::new()
        .merge(handlers::routes().with_state(state))
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let sig_down = SigDown::try_new()?;
    let axum_cancellation_token = sig_down.cancellation_token();
    let axum_graceful_shutdown = async move { axum_cancellation_token.cancelled().await };
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(axum_graceful_shutdown)
        .await?;

    Ok(())
}
