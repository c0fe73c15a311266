//! Price quoting: USD amounts to on-chain currency amounts.
//!
//! A quote freezes the exchange rate, the USD amount, and the converted
//! currency amount at creation time; nothing downstream ever recomputes them.
//! Stable-pegged currencies short-circuit to a rate of 1. Volatile currencies
//! fetch a spot rate from one of two upstream shapes — an id-keyed spot-price
//! lookup or a liquidity-pool aggregator — behind a TTL cache whose lock is
//! re-checked after acquisition, so concurrent callers racing on an expired
//! entry trigger a single upstream fetch.
//!
//! A pricing failure is always surfaced; there is no fallback to a stale or
//! zero rate.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::instrument;
use url::Url;

use crate::currency::{Currency, RateRoute, UnsupportedCurrencyError};
use crate::timestamp::{Clock, UnixTimestamp};

/// Default freshness window for cached exchange rates.
pub const DEFAULT_RATE_TTL_SECS: u64 = 300;

/// Default per-seat subscription price in USD.
pub const DEFAULT_SEAT_PRICE_USD: u32 = 99;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum PricingError {
    #[error(transparent)]
    UnsupportedCurrency(#[from] UnsupportedCurrencyError),
    /// No pool or spot entry exists for the asset. Not retryable without a
    /// configuration change.
    #[error("Price unavailable for {currency}: {reason}")]
    PriceUnavailable { currency: Currency, reason: String },
    /// The upstream source could not be reached or answered garbage.
    /// Retryable.
    #[error("Upstream pricing fetch failed: {0}")]
    Upstream(String),
    #[error("Non-positive exchange rate {rate} for {currency}")]
    NonPositiveRate { currency: Currency, rate: Decimal },
    #[error("Billing amount must be positive")]
    NonPositiveAmount,
}

/// What is being priced: a seat-based subscription or a fixed USD top-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingBasis {
    Seats(u32),
    AmountUsd(Decimal),
}

/// A priced conversion, frozen at creation.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Quote {
    pub currency: Currency,
    pub network: crate::currency::Network,
    pub amount_usd: Decimal,
    pub amount_currency: Decimal,
    pub exchange_rate: Decimal,
    pub asset_id: String,
}

/// Rounds a currency amount up to the currency's native precision.
///
/// Rounding is always toward positive infinity so the merchant is never
/// underpaid by rounding.
pub fn ceil_to_precision(amount: Decimal, decimals: u8) -> Decimal {
    amount.round_dp_with_strategy(decimals as u32, RoundingStrategy::ToPositiveInfinity)
}

/// Source of USD exchange rates for volatile currencies.
#[async_trait]
pub trait RateSource: Send + Sync {
    /// Returns how many USD one unit of `currency` is worth.
    async fn usd_rate(&self, currency: Currency) -> Result<Decimal, PricingError>;
}

/// Id-keyed spot-price lookup: `GET {base}/simple/price?ids={id}&vs_currencies=usd`.
#[derive(Debug, Clone)]
pub struct SpotPriceSource {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct SpotQuote {
    usd: Decimal,
}

impl SpotPriceSource {
    pub fn new(base_url: Url) -> Self {
        let client = Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self { client, base_url }
    }

    #[instrument(skip_all, err, fields(id = id))]
    pub async fn fetch(&self, currency: Currency, id: &str) -> Result<Decimal, PricingError> {
        let url = self
            .base_url
            .join("simple/price")
            .map_err(|e| PricingError::Upstream(format!("bad spot price URL: {e}")))?;
        let response = self
            .client
            .get(url)
            .query(&[("ids", id), ("vs_currencies", "usd")])
            .send()
            .await
            .map_err(|e| PricingError::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PricingError::Upstream(format!(
                "spot price endpoint returned {}",
                response.status()
            )));
        }
        let body: HashMap<String, SpotQuote> = response
            .json()
            .await
            .map_err(|e| PricingError::Upstream(format!("malformed spot price body: {e}")))?;
        let quote = body.get(id).ok_or_else(|| PricingError::PriceUnavailable {
            currency,
            reason: format!("no spot entry for id {id}"),
        })?;
        Ok(quote.usd)
    }
}

/// Liquidity-pool aggregator: `GET {base}/token-pairs/v1/{chain}/{mint}`.
///
/// When multiple pools exist for the asset, the one with the highest USD
/// liquidity wins; an empty pool list means the price is unavailable.
#[derive(Debug, Clone)]
pub struct PoolAggregatorSource {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PoolPair {
    #[serde(default)]
    liquidity: Option<PoolLiquidity>,
    price_usd: Decimal,
}

#[derive(Debug, Deserialize)]
struct PoolLiquidity {
    usd: Decimal,
}

impl PoolAggregatorSource {
    pub fn new(base_url: Url) -> Self {
        let client = Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self { client, base_url }
    }

    #[instrument(skip_all, err, fields(mint = mint))]
    pub async fn fetch(&self, currency: Currency, mint: &str) -> Result<Decimal, PricingError> {
        let url = self
            .base_url
            .join(&format!("token-pairs/v1/solana/{mint}"))
            .map_err(|e| PricingError::Upstream(format!("bad pool aggregator URL: {e}")))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PricingError::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PricingError::Upstream(format!(
                "pool aggregator returned {}",
                response.status()
            )));
        }
        let pairs: Vec<PoolPair> = response
            .json()
            .await
            .map_err(|e| PricingError::Upstream(format!("malformed pool body: {e}")))?;
        let best = pairs
            .into_iter()
            .max_by_key(|pair| {
                pair.liquidity
                    .as_ref()
                    .map(|l| l.usd)
                    .unwrap_or(Decimal::ZERO)
            })
            .ok_or_else(|| PricingError::PriceUnavailable {
                currency,
                reason: "no liquidity pools for asset".to_string(),
            })?;
        Ok(best.price_usd)
    }
}

/// Production rate source: routes each currency to the upstream shape its
/// registry entry names.
#[derive(Debug, Clone)]
pub struct UpstreamRates {
    spot: SpotPriceSource,
    pools: PoolAggregatorSource,
}

impl UpstreamRates {
    pub fn new(spot: SpotPriceSource, pools: PoolAggregatorSource) -> Self {
        Self { spot, pools }
    }
}

#[async_trait]
impl RateSource for UpstreamRates {
    async fn usd_rate(&self, currency: Currency) -> Result<Decimal, PricingError> {
        match currency.rate_route() {
            RateRoute::Pegged => Ok(Decimal::ONE),
            RateRoute::Spot(id) => self.spot.fetch(currency, id).await,
            RateRoute::Pool(mint) => self.pools.fetch(currency, mint).await,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedRate {
    rate: Decimal,
    fetched_at: UnixTimestamp,
}

/// TTL cache over a [`RateSource`].
///
/// One mutex guards the entries and is held across the upstream fetch.
/// Callers racing on an expired entry serialize on the lock and re-check
/// freshness after acquiring it, so exactly one of them fetches.
pub struct RateCache {
    ttl_secs: u64,
    entries: Mutex<HashMap<Currency, CachedRate>>,
}

impl RateCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl_secs,
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn get_or_fetch(
        &self,
        currency: Currency,
        source: &dyn RateSource,
        now: UnixTimestamp,
    ) -> Result<Decimal, PricingError> {
        let mut entries = self.entries.lock().await;
        // Freshness check happens after the lock is held: a second caller
        // that raced on the same expired entry sees the first caller's write.
        if let Some(cached) = entries.get(&currency) {
            if now.saturating_since(cached.fetched_at) < self.ttl_secs {
                return Ok(cached.rate);
            }
        }
        let rate = source.usd_rate(currency).await?;
        if rate <= Decimal::ZERO {
            return Err(PricingError::NonPositiveRate { currency, rate });
        }
        entries.insert(
            currency,
            CachedRate {
                rate,
                fetched_at: now,
            },
        );
        Ok(rate)
    }
}

/// Converts a billing request plus a target currency into a frozen quote.
pub struct PriceQuoteService {
    source: Arc<dyn RateSource>,
    cache: RateCache,
    clock: Arc<dyn Clock>,
    seat_price_usd: Decimal,
}

impl PriceQuoteService {
    pub fn new(
        source: Arc<dyn RateSource>,
        clock: Arc<dyn Clock>,
        ttl_secs: u64,
        seat_price_usd: Decimal,
    ) -> Self {
        Self {
            source,
            cache: RateCache::new(ttl_secs),
            clock,
            seat_price_usd,
        }
    }

    /// Quotes `basis` in `currency`.
    ///
    /// The USD→currency conversion rounds up to the currency's native
    /// precision, so `amount_currency × exchange_rate ≥ amount_usd` always
    /// holds.
    #[instrument(skip_all, err, fields(currency = %currency))]
    pub async fn get_quote(
        &self,
        currency: Currency,
        basis: BillingBasis,
    ) -> Result<Quote, PricingError> {
        let amount_usd = match basis {
            BillingBasis::Seats(seat_count) => {
                self.seat_price_usd * Decimal::from(seat_count.max(1))
            }
            BillingBasis::AmountUsd(amount) => amount,
        };
        if amount_usd <= Decimal::ZERO {
            return Err(PricingError::NonPositiveAmount);
        }

        let exchange_rate = self.exchange_rate(currency).await?;
        let amount_currency =
            ceil_to_precision(amount_usd / exchange_rate, currency.decimals());

        Ok(Quote {
            currency,
            network: currency.network(),
            amount_usd,
            amount_currency,
            exchange_rate,
            asset_id: currency.asset_id().to_string(),
        })
    }

    /// Current USD rate for a currency. Stable-pegged currencies never touch
    /// the cache or the upstream.
    pub async fn exchange_rate(&self, currency: Currency) -> Result<Decimal, PricingError> {
        if currency.is_stable() {
            return Ok(Decimal::ONE);
        }
        self.cache
            .get_or_fetch(currency, self.source.as_ref(), self.clock.now())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::test_clock::FixedClock;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// A source that counts fetches and returns a fixed rate.
    struct CountingSource {
        rate: Decimal,
        calls: AtomicUsize,
    }

    impl CountingSource {
        fn at(rate: Decimal) -> Arc<Self> {
            Arc::new(Self {
                rate,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RateSource for CountingSource {
        async fn usd_rate(&self, _currency: Currency) -> Result<Decimal, PricingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.rate)
        }
    }

    /// A source that must never be consulted.
    struct PanicSource;

    #[async_trait]
    impl RateSource for PanicSource {
        async fn usd_rate(&self, currency: Currency) -> Result<Decimal, PricingError> {
            panic!("stable-pegged quote for {currency} reached the upstream source");
        }
    }

    fn service(source: Arc<dyn RateSource>, clock: Arc<FixedClock>) -> PriceQuoteService {
        PriceQuoteService::new(
            source,
            clock,
            DEFAULT_RATE_TTL_SECS,
            Decimal::from(DEFAULT_SEAT_PRICE_USD),
        )
    }

    #[tokio::test]
    async fn stable_coin_shortcut_for_seat_quote() {
        let clock = Arc::new(FixedClock::at(1_000));
        let quotes = service(Arc::new(PanicSource), clock);

        let quote = quotes
            .get_quote(Currency::Usdc, BillingBasis::Seats(3))
            .await
            .unwrap();
        assert_eq!(quote.amount_usd, Decimal::new(297, 0));
        assert_eq!(quote.exchange_rate, Decimal::ONE);
        assert_eq!(quote.amount_currency, Decimal::from_str("297.000000").unwrap());
        assert_eq!(quote.asset_id, Currency::Usdc.asset_id());
    }

    #[tokio::test]
    async fn conversion_rounds_up_never_down() {
        let clock = Arc::new(FixedClock::at(1_000));
        let rate = Decimal::from_str("3").unwrap();
        let quotes = service(CountingSource::at(rate), clock);

        let quote = quotes
            .get_quote(Currency::Sol, BillingBasis::AmountUsd(Decimal::new(100, 0)))
            .await
            .unwrap();
        // 100 / 3 = 33.333... rounds up at 9 decimals.
        assert_eq!(
            quote.amount_currency,
            Decimal::from_str("33.333333334").unwrap()
        );
        assert!(quote.amount_currency * quote.exchange_rate >= quote.amount_usd);
    }

    #[tokio::test]
    async fn racing_callers_trigger_one_fetch() {
        let clock = Arc::new(FixedClock::at(1_000));
        let source = CountingSource::at(Decimal::new(180, 0));
        let quotes = Arc::new(service(source.clone(), clock.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let quotes = quotes.clone();
            handles.push(tokio::spawn(async move {
                quotes
                    .get_quote(Currency::Sol, BillingBasis::AmountUsd(Decimal::new(9, 0)))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // Past the TTL the next call fetches again.
        clock.advance(DEFAULT_RATE_TTL_SECS + 1);
        quotes
            .get_quote(Currency::Sol, BillingBasis::AmountUsd(Decimal::new(9, 0)))
            .await
            .unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_positive_rate_is_rejected() {
        let clock = Arc::new(FixedClock::at(1_000));
        let quotes = service(CountingSource::at(Decimal::ZERO), clock);
        let err = quotes
            .get_quote(Currency::Sol, BillingBasis::AmountUsd(Decimal::new(10, 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, PricingError::NonPositiveRate { .. }));
    }

    #[tokio::test]
    async fn spot_source_reads_id_keyed_quote() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/simple/price"))
            .and(query_param("ids", "solana"))
            .and(query_param("vs_currencies", "usd"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "solana": {"usd": 181.55}
                })),
            )
            .mount(&server)
            .await;

        let source = SpotPriceSource::new(format!("{}/", server.uri()).parse().unwrap());
        let rate = source.fetch(Currency::Sol, "solana").await.unwrap();
        assert_eq!(rate, Decimal::from_str("181.55").unwrap());
    }

    #[tokio::test]
    async fn spot_source_failure_is_retryable_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/simple/price"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let source = SpotPriceSource::new(format!("{}/", server.uri()).parse().unwrap());
        let err = source.fetch(Currency::Sol, "solana").await.unwrap_err();
        assert!(matches!(err, PricingError::Upstream(_)));
    }

    #[tokio::test]
    async fn pool_source_picks_highest_liquidity() {
        let server = MockServer::start().await;
        let mint = Currency::Jup.asset_id();
        Mock::given(method("GET"))
            .and(path(format!("/token-pairs/v1/solana/{mint}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"liquidity": {"usd": 50_000}, "priceUsd": "0.91"},
                {"liquidity": {"usd": 2_400_000}, "priceUsd": "0.93"},
                {"priceUsd": "5.55"}
            ])))
            .mount(&server)
            .await;

        let source = PoolAggregatorSource::new(format!("{}/", server.uri()).parse().unwrap());
        let rate = source.fetch(Currency::Jup, mint).await.unwrap();
        assert_eq!(rate, Decimal::from_str("0.93").unwrap());
    }

    #[tokio::test]
    async fn pool_source_with_no_pools_is_price_unavailable() {
        let server = MockServer::start().await;
        let mint = Currency::Jup.asset_id();
        Mock::given(method("GET"))
            .and(path(format!("/token-pairs/v1/solana/{mint}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let source = PoolAggregatorSource::new(format!("{}/", server.uri()).parse().unwrap());
        let err = source.fetch(Currency::Jup, mint).await.unwrap_err();
        assert!(matches!(err, PricingError::PriceUnavailable { .. }));
    }
}
