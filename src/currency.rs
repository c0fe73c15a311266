//! Registry of currencies and networks accepted by the settlement rails.
//!
//! A [`Currency`] carries everything that is frozen into a quote: the network
//! it settles on, its native decimal precision, the on-chain asset identifier,
//! and how its USD exchange rate is obtained. Stable-pegged currencies
//! short-circuit to a rate of 1 and never touch an upstream pricing source.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

/// Networks payments can settle on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Solana,
    SolanaDevnet,
    Base,
    BaseSepolia,
}

/// Broad family of a network, which decides the signature scheme used by the
/// facilitator-free simple-signature path: ed25519 for account chains,
/// secp256k1 recovery for EVM chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFamily {
    Account,
    Evm,
}

impl Network {
    pub fn variants() -> &'static [Network] {
        &[
            Network::Solana,
            Network::SolanaDevnet,
            Network::Base,
            Network::BaseSepolia,
        ]
    }

    pub fn family(&self) -> NetworkFamily {
        match self {
            Network::Solana | Network::SolanaDevnet => NetworkFamily::Account,
            Network::Base | Network::BaseSepolia => NetworkFamily::Evm,
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Network::Solana => "solana",
            Network::SolanaDevnet => "solana-devnet",
            Network::Base => "base",
            Network::BaseSepolia => "base-sepolia",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unsupported network: {0}")]
pub struct UnsupportedNetworkError(pub String);

impl FromStr for Network {
    type Err = UnsupportedNetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "solana" => Ok(Network::Solana),
            "solana-devnet" => Ok(Network::SolanaDevnet),
            "base" => Ok(Network::Base),
            "base-sepolia" => Ok(Network::BaseSepolia),
            other => Err(UnsupportedNetworkError(other.to_string())),
        }
    }
}

impl Serialize for Network {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Network {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// How the USD exchange rate for a currency is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateRoute {
    /// Stable-pegged: rate is 1, no upstream call.
    Pegged,
    /// Id-keyed spot-price lookup (e.g. `ids=solana`).
    Spot(&'static str),
    /// Liquidity-pool aggregator query keyed by the asset mint; the pool with
    /// the highest liquidity wins.
    Pool(&'static str),
}

/// The asset a payment delivers, as the chain receipt sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetKind {
    /// The network's native asset, identified by balance deltas at the
    /// wallet's account index.
    Native { decimals: u8 },
    /// A token identified by its mint address in the receipt's token-balance
    /// entries.
    Token { mint: &'static str, decimals: u8 },
}

impl AssetKind {
    pub fn decimals(&self) -> u8 {
        match self {
            AssetKind::Native { decimals } => *decimals,
            AssetKind::Token { decimals, .. } => *decimals,
        }
    }
}

const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
const USDT_MINT: &str = "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB";
const JUP_MINT: &str = "JUPyiwrYJFskUPiHa7hkeR8VUtAeFoSYbKedZNsDvCN";

/// Currencies accepted for invoice payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Currency {
    Usdc,
    Usdt,
    Sol,
    Jup,
}

impl Currency {
    pub fn variants() -> &'static [Currency] {
        &[Currency::Usdc, Currency::Usdt, Currency::Sol, Currency::Jup]
    }

    /// Canonical uppercase code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Usdc => "USDC",
            Currency::Usdt => "USDT",
            Currency::Sol => "SOL",
            Currency::Jup => "JUP",
        }
    }

    /// Native decimal precision. Conversions round up to this many places.
    pub fn decimals(&self) -> u8 {
        match self {
            Currency::Usdc | Currency::Usdt | Currency::Jup => 6,
            Currency::Sol => 9,
        }
    }

    /// Stable-pegged currencies quote at an exchange rate of exactly 1.
    pub fn is_stable(&self) -> bool {
        matches!(self, Currency::Usdc | Currency::Usdt)
    }

    pub fn network(&self) -> Network {
        Network::Solana
    }

    /// On-chain asset identifier, as reported in quotes and matched against
    /// receipts. The native asset uses its ticker.
    pub fn asset_id(&self) -> &'static str {
        match self {
            Currency::Usdc => USDC_MINT,
            Currency::Usdt => USDT_MINT,
            Currency::Sol => "SOL",
            Currency::Jup => JUP_MINT,
        }
    }

    pub fn rate_route(&self) -> RateRoute {
        match self {
            Currency::Usdc | Currency::Usdt => RateRoute::Pegged,
            Currency::Sol => RateRoute::Spot("solana"),
            Currency::Jup => RateRoute::Pool(JUP_MINT),
        }
    }

    pub fn asset_kind(&self) -> AssetKind {
        match self {
            Currency::Sol => AssetKind::Native { decimals: 9 },
            Currency::Usdc => AssetKind::Token {
                mint: USDC_MINT,
                decimals: 6,
            },
            Currency::Usdt => AssetKind::Token {
                mint: USDT_MINT,
                decimals: 6,
            },
            Currency::Jup => AssetKind::Token {
                mint: JUP_MINT,
                decimals: 6,
            },
        }
    }
}

impl Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Error for a currency code this engine does not support. Raised before any
/// network call is made.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Unsupported currency: {0}")]
pub struct UnsupportedCurrencyError(pub String);

impl FromStr for Currency {
    type Err = UnsupportedCurrencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USDC" => Ok(Currency::Usdc),
            "USDT" => Ok(Currency::Usdt),
            "SOL" => Ok(Currency::Sol),
            "JUP" => Ok(Currency::Jup),
            other => Err(UnsupportedCurrencyError(other.to_string())),
        }
    }
}

impl Serialize for Currency {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

impl<'de> Deserialize<'de> for Currency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_codes_case_insensitively() {
        assert_eq!("usdc".parse::<Currency>().unwrap(), Currency::Usdc);
        assert_eq!("SOL".parse::<Currency>().unwrap(), Currency::Sol);
    }

    #[test]
    fn rejects_unknown_code() {
        let err = "DOGE".parse::<Currency>().unwrap_err();
        assert_eq!(err.to_string(), "Unsupported currency: DOGE");
    }

    #[test]
    fn stable_currencies_are_pegged() {
        for currency in Currency::variants() {
            assert_eq!(
                currency.is_stable(),
                currency.rate_route() == RateRoute::Pegged
            );
        }
    }

    #[test]
    fn network_round_trips_through_serde() {
        for network in Network::variants() {
            let json = serde_json::to_string(network).unwrap();
            let back: Network = serde_json::from_str(&json).unwrap();
            assert_eq!(back, *network);
        }
    }
}
