//! Core payment-record types shared by every settlement rail.
//!
//! The central object is [`PaymentTransaction`], the write-ahead record
//! persisted for every attempted payment. A record is created `pending` by a
//! rail-specific create call, moved to exactly one terminal state by a single
//! verification or reconciliation call, and never deleted — the table doubles
//! as the audit log. Amounts, currency, and exchange rate are frozen at quote
//! time and never recomputed.

use once_cell::sync::Lazy;
use rand::Rng;
use rand::distr::Alphanumeric;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

use crate::currency::{Currency, Network};
use crate::timestamp::UnixTimestamp;

/// Globally unique external identifier for one payment attempt.
///
/// Generated once at record creation and never reused; a retried payment gets
/// a brand-new reference code rather than reopening a terminal record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ReferenceCode(String);

impl ReferenceCode {
    const PREFIX: &'static str = "pay_";
    const SUFFIX_LEN: usize = 24;

    pub fn generate() -> Self {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(Self::SUFFIX_LEN)
            .map(char::from)
            .collect();
        ReferenceCode(format!("{}{}", Self::PREFIX, suffix.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ReferenceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid reference code format")]
pub struct ReferenceCodeFormatError;

impl FromStr for ReferenceCode {
    type Err = ReferenceCodeFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static REF_REGEX: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^pay_[a-z0-9]{24}$").expect("Invalid regex for reference code")
        });
        if REF_REGEX.is_match(s) {
            Ok(ReferenceCode(s.to_string()))
        } else {
            Err(ReferenceCodeFormatError)
        }
    }
}

impl<'de> Deserialize<'de> for ReferenceCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The rail a payment travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    #[serde(rename = "crypto")]
    Crypto,
    #[serde(rename = "stripe")]
    Stripe,
    #[serde(rename = "stripe_subscription")]
    StripeSubscription,
    #[serde(rename = "x402")]
    X402,
    #[serde(rename = "x402-simple")]
    X402Simple,
}

impl Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentMethod::Crypto => "crypto",
            PaymentMethod::Stripe => "stripe",
            PaymentMethod::StripeSubscription => "stripe_subscription",
            PaymentMethod::X402 => "x402",
            PaymentMethod::X402Simple => "x402-simple",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle status of a payment record.
///
/// Transitions are monotonic: `pending` may move to any terminal state, and
/// no transition leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Expired,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        matches!(self, PaymentStatus::Pending) && next.is_terminal()
    }
}

impl Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

/// A precise on-chain amount in atomic units (e.g. USDC with 6 decimals).
/// Serialized as a stringified integer to prevent precision loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TokenAmount(pub u128);

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let value = s
            .parse::<u128>()
            .map_err(|_| serde::de::Error::custom("token amount must be a non-negative integer"))?;
        Ok(TokenAmount(value))
    }
}

impl Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u128> for TokenAmount {
    fn from(value: u128) -> Self {
        TokenAmount(value)
    }
}

/// What settling a record credits: seats for a subscription, or a token
/// top-up. Mutually exclusive by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingKind {
    Seats { seat_count: u32 },
    Tokens { token_amount: u64 },
}

impl BillingKind {
    pub fn seat_count(&self) -> Option<u32> {
        match self {
            BillingKind::Seats { seat_count } => Some(*seat_count),
            BillingKind::Tokens { .. } => None,
        }
    }

    pub fn token_amount(&self) -> Option<u64> {
        match self {
            BillingKind::Tokens { token_amount } => Some(*token_amount),
            BillingKind::Seats { .. } => None,
        }
    }
}

/// The write-ahead record for every attempted payment, across all rails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub reference_code: ReferenceCode,
    pub user_id: Option<String>,
    pub company_id: Option<String>,
    pub billing: BillingKind,
    pub payment_method: PaymentMethod,
    /// Settlement currency and network, for rails with an on-chain leg.
    /// Card-rail records charge in USD and carry neither.
    pub currency: Option<Currency>,
    pub network: Option<Network>,
    /// Frozen at quote time; never recomputed after creation.
    pub amount_usd: Decimal,
    pub amount_currency: Decimal,
    pub exchange_rate: Decimal,
    /// Payer wallet, once known.
    pub wallet_address: Option<String>,
    pub transaction_hash: Option<String>,
    /// External identifier on the card rail (payment-intent / charge id).
    pub external_id: Option<String>,
    pub memo: Option<String>,
    pub status: PaymentStatus,
    /// Rail-specific audit facts: block slot/time, confirmed amount,
    /// facilitator response, verification route.
    pub metadata: serde_json::Value,
    pub expires_at: Option<UnixTimestamp>,
    pub created_at: UnixTimestamp,
    pub updated_at: UnixTimestamp,
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentRecordError {
    /// Every record needs a user or a company to credit on settlement.
    #[error("A payment record requires a billing target (user or company)")]
    MissingBillingTarget,
}

impl PaymentTransaction {
    /// Creates a fresh `pending` record with a newly generated reference code.
    ///
    /// At least one of `user_id` / `company_id` must be present; there is
    /// nobody to credit otherwise.
    #[allow(clippy::too_many_arguments)]
    pub fn new_pending(
        user_id: Option<String>,
        company_id: Option<String>,
        billing: BillingKind,
        payment_method: PaymentMethod,
        currency: Option<Currency>,
        network: Option<Network>,
        amount_usd: Decimal,
        amount_currency: Decimal,
        exchange_rate: Decimal,
        now: UnixTimestamp,
    ) -> Result<Self, PaymentRecordError> {
        if user_id.is_none() && company_id.is_none() {
            return Err(PaymentRecordError::MissingBillingTarget);
        }
        Ok(PaymentTransaction {
            reference_code: ReferenceCode::generate(),
            user_id,
            company_id,
            billing,
            payment_method,
            currency,
            network,
            amount_usd,
            amount_currency,
            exchange_rate,
            wallet_address: None,
            transaction_hash: None,
            external_id: None,
            memo: None,
            status: PaymentStatus::Pending,
            metadata: serde_json::Value::Null,
            expires_at: None,
            created_at: now,
            updated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_codes_are_unique_and_well_formed() {
        let a = ReferenceCode::generate();
        let b = ReferenceCode::generate();
        assert_ne!(a, b);
        assert!(a.as_str().parse::<ReferenceCode>().is_ok());
    }

    #[test]
    fn reference_code_rejects_foreign_format() {
        assert!("inv-123".parse::<ReferenceCode>().is_err());
        assert!("pay_SHOUTING0000000000000000".parse::<ReferenceCode>().is_err());
    }

    #[test]
    fn terminal_states_admit_no_transition() {
        for terminal in [
            PaymentStatus::Completed,
            PaymentStatus::Failed,
            PaymentStatus::Expired,
        ] {
            for next in [
                PaymentStatus::Pending,
                PaymentStatus::Completed,
                PaymentStatus::Failed,
                PaymentStatus::Expired,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(PaymentStatus::Pending.can_transition_to(PaymentStatus::Completed));
        assert!(!PaymentStatus::Pending.can_transition_to(PaymentStatus::Pending));
    }

    #[test]
    fn payment_method_wire_names() {
        assert_eq!(
            serde_json::to_string(&PaymentMethod::X402Simple).unwrap(),
            "\"x402-simple\""
        );
        assert_eq!(
            serde_json::to_string(&PaymentMethod::StripeSubscription).unwrap(),
            "\"stripe_subscription\""
        );
    }

    #[test]
    fn record_requires_billing_target() {
        let err = PaymentTransaction::new_pending(
            None,
            None,
            BillingKind::Tokens { token_amount: 10 },
            PaymentMethod::Crypto,
            Some(Currency::Usdc),
            Some(Network::Solana),
            Decimal::new(100, 0),
            Decimal::new(100, 0),
            Decimal::ONE,
            UnixTimestamp::from_secs(0),
        )
        .unwrap_err();
        assert!(matches!(err, PaymentRecordError::MissingBillingTarget));
    }

    #[test]
    fn token_amount_serializes_as_string() {
        let amount = TokenAmount(297_000_000);
        assert_eq!(serde_json::to_string(&amount).unwrap(), "\"297000000\"");
    }
}
