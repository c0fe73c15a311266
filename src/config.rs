//! Environment configuration for the settlement engine.
//!
//! All settings come from environment variables (a `.env` file is loaded at
//! startup). A missing required variable is an explicit
//! [`ConfigError::Missing`]; nothing silently defaults to an empty secret or
//! wallet.
//!
//! Environment variables used:
//! - `MERCHANT_WALLET` — merchant wallet on the account chain (required)
//! - `MERCHANT_EVM_ADDRESS` — merchant address for EVM-style networks
//! - `WEBHOOK_SIGNING_SECRET` — shared secret for card-network webhooks (required)
//! - `CARD_SECRET_KEY` — card gateway API key
//! - `CARD_API_URL`, `FACILITATOR_URL`, `RPC_URL_SOLANA`,
//!   `SPOT_PRICE_URL`, `POOL_AGGREGATOR_URL` — collaborator endpoints
//! - `RATE_TTL_SECS`, `SEAT_PRICE_USD`, `TOKEN_UNIT_PRICE_USD`,
//!   `X402_PRICE`, `X402_CURRENCY`, `MERCHANT_COMPANY_ID` — tunables
//! - `HOST`, `PORT` — bind address

use rust_decimal::Decimal;
use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use url::Url;

use crate::currency::Currency;
use crate::price::{DEFAULT_RATE_TTL_SECS, DEFAULT_SEAT_PRICE_USD};

const ENV_HOST: &str = "HOST";
const ENV_PORT: &str = "PORT";
const ENV_MERCHANT_WALLET: &str = "MERCHANT_WALLET";
const ENV_MERCHANT_EVM_ADDRESS: &str = "MERCHANT_EVM_ADDRESS";
const ENV_WEBHOOK_SIGNING_SECRET: &str = "WEBHOOK_SIGNING_SECRET";
const ENV_CARD_SECRET_KEY: &str = "CARD_SECRET_KEY";
const ENV_CARD_API_URL: &str = "CARD_API_URL";
const ENV_FACILITATOR_URL: &str = "FACILITATOR_URL";
const ENV_RPC_SOLANA: &str = "RPC_URL_SOLANA";
const ENV_SPOT_PRICE_URL: &str = "SPOT_PRICE_URL";
const ENV_POOL_AGGREGATOR_URL: &str = "POOL_AGGREGATOR_URL";
const ENV_RATE_TTL_SECS: &str = "RATE_TTL_SECS";
const ENV_SEAT_PRICE_USD: &str = "SEAT_PRICE_USD";
const ENV_TOKEN_UNIT_PRICE_USD: &str = "TOKEN_UNIT_PRICE_USD";
const ENV_X402_PRICE: &str = "X402_PRICE";
const ENV_X402_CURRENCY: &str = "X402_CURRENCY";
const ENV_MERCHANT_COMPANY_ID: &str = "MERCHANT_COMPANY_ID";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("env {0} not set")]
    Missing(&'static str),
    #[error("env {name} is invalid: {reason}")]
    Invalid {
        name: &'static str,
        reason: String,
    },
}

/// Server configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub merchant_wallet: String,
    pub merchant_evm_address: Option<String>,
    pub webhook_signing_secret: String,
    pub card_secret_key: Option<String>,
    pub card_api_url: Url,
    pub facilitator_url: Url,
    pub rpc_url: Url,
    pub spot_price_url: Url,
    pub pool_aggregator_url: Url,
    pub rate_ttl_secs: u64,
    pub seat_price_usd: Decimal,
    /// USD value of one internal token, for renewal conversion.
    pub token_unit_price_usd: Decimal,
    /// Price and currency of the 402-gated resource.
    pub x402_price: Decimal,
    pub x402_currency: Currency,
    /// Company credited for anonymous x402 payments.
    pub merchant_company_id: String,
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn parse_or<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(name) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn url_or(name: &'static str, default: &str) -> Result<Url, ConfigError> {
    let raw = optional(name).unwrap_or_else(|| default.to_string());
    Url::parse(&raw).map_err(|e| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Config {
            host: parse_or(ENV_HOST, IpAddr::from([0, 0, 0, 0]))?,
            port: parse_or(ENV_PORT, 8080)?,
            merchant_wallet: required(ENV_MERCHANT_WALLET)?,
            merchant_evm_address: optional(ENV_MERCHANT_EVM_ADDRESS),
            webhook_signing_secret: required(ENV_WEBHOOK_SIGNING_SECRET)?,
            card_secret_key: optional(ENV_CARD_SECRET_KEY),
            card_api_url: url_or(ENV_CARD_API_URL, "https://api.stripe.com/")?,
            facilitator_url: url_or(ENV_FACILITATOR_URL, "https://facilitator.x402.rs/")?,
            rpc_url: url_or(ENV_RPC_SOLANA, "https://api.mainnet-beta.solana.com/")?,
            spot_price_url: url_or(ENV_SPOT_PRICE_URL, "https://api.coingecko.com/api/v3/")?,
            pool_aggregator_url: url_or(ENV_POOL_AGGREGATOR_URL, "https://api.dexscreener.com/")?,
            rate_ttl_secs: parse_or(ENV_RATE_TTL_SECS, DEFAULT_RATE_TTL_SECS)?,
            seat_price_usd: parse_or(ENV_SEAT_PRICE_USD, Decimal::from(DEFAULT_SEAT_PRICE_USD))?,
            token_unit_price_usd: parse_or(ENV_TOKEN_UNIT_PRICE_USD, Decimal::new(1, 2))?,
            x402_price: parse_or(ENV_X402_PRICE, Decimal::new(10, 2))?,
            x402_currency: parse_or(ENV_X402_CURRENCY, Currency::Usdc)?,
            merchant_company_id: optional(ENV_MERCHANT_COMPANY_ID)
                .unwrap_or_else(|| "merchant".to_string()),
        })
    }
}
