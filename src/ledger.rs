//! The external ledger, consumed but not owned.
//!
//! Every rail funnels its single "this payment settled" effect through
//! [`LedgerService`]: token credits for top-ups, seat limits and activation
//! for subscriptions. The engine guarantees at-most-once invocation per
//! settled reference code; the ledger behind this trait is expected to be
//! idempotent per caller on top of that.
//!
//! [`InMemoryLedger`] is the reference implementation used by tests and the
//! default server wiring.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;

/// Billing mode a company is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingMode {
    /// Per-seat subscription; renewals stamp the period, no token minting.
    Seats,
    /// Consumable token balance; renewals convert paid USD to tokens.
    Tokens,
}

#[derive(Debug, Clone)]
pub struct LedgerUser {
    pub id: String,
    pub email: String,
    pub company_id: String,
    /// External card-network customer id, recorded at first checkout.
    pub customer_id: Option<String>,
    /// Subscription currently on file. Incoming webhook events must match
    /// this id before they may mutate seat or activation state.
    pub subscription_id: Option<String>,
    pub seat_quantity: u32,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct LedgerCompany {
    pub id: String,
    pub seat_limit: u32,
    pub subscription_id: Option<String>,
    pub token_balance: u64,
    pub token_balance_usd: Decimal,
    /// Outstanding account credit, applied before token conversion on
    /// renewals.
    pub credit_balance_usd: Decimal,
    pub auto_renew: bool,
    pub billing_mode: BillingMode,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Unknown ledger user: {0}")]
    UnknownUser(String),
    #[error("Unknown ledger company: {0}")]
    UnknownCompany(String),
    /// The ledger service could not be reached. Retryable.
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait LedgerService: Send + Sync {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<LedgerUser>, LedgerError>;

    async fn find_users_by_customer(
        &self,
        customer_id: &str,
    ) -> Result<Vec<LedgerUser>, LedgerError>;

    async fn company(&self, company_id: &str) -> Result<Option<LedgerCompany>, LedgerError>;

    async fn find_company_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<LedgerCompany>, LedgerError>;

    /// Records the external customer id against a user.
    async fn record_customer(&self, user_id: &str, customer_id: &str) -> Result<(), LedgerError>;

    /// Resyncs a user's subscription id, seat quantity, and active flag.
    async fn set_user_subscription(
        &self,
        user_id: &str,
        subscription_id: Option<&str>,
        seat_quantity: u32,
        active: bool,
    ) -> Result<(), LedgerError>;

    /// Sets a company's seat limit and, when present, the subscription id
    /// that future events must match.
    async fn set_company_seats(
        &self,
        company_id: &str,
        seat_limit: u32,
        subscription_id: Option<&str>,
    ) -> Result<(), LedgerError>;

    /// Credits `tokens` (worth `amount_usd`) to the company. Called at most
    /// once per settled reference code.
    async fn credit_tokens(
        &self,
        company_id: &str,
        tokens: u64,
        amount_usd: Decimal,
    ) -> Result<(), LedgerError>;

    /// Applies `amount_usd` against the company's outstanding credit balance
    /// first; returns the remainder left over for token conversion.
    async fn apply_account_credit(
        &self,
        company_id: &str,
        amount_usd: Decimal,
    ) -> Result<Decimal, LedgerError>;

    /// Stamps a successful renewal period for a seat-based company.
    async fn stamp_renewal(&self, company_id: &str) -> Result<(), LedgerError>;
}

/// Reference ledger backed by concurrent maps.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    users: DashMap<String, LedgerUser>,
    companies: DashMap<String, LedgerCompany>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_user(&self, user: LedgerUser) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn upsert_company(&self, company: LedgerCompany) {
        self.companies.insert(company.id.clone(), company);
    }

    pub fn user(&self, user_id: &str) -> Option<LedgerUser> {
        self.users.get(user_id).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl LedgerService for InMemoryLedger {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<LedgerUser>, LedgerError> {
        Ok(self
            .users
            .iter()
            .find(|entry| entry.value().email == email)
            .map(|entry| entry.value().clone()))
    }

    async fn find_users_by_customer(
        &self,
        customer_id: &str,
    ) -> Result<Vec<LedgerUser>, LedgerError> {
        Ok(self
            .users
            .iter()
            .filter(|entry| entry.value().customer_id.as_deref() == Some(customer_id))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn company(&self, company_id: &str) -> Result<Option<LedgerCompany>, LedgerError> {
        Ok(self
            .companies
            .get(company_id)
            .map(|entry| entry.value().clone()))
    }

    async fn find_company_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<LedgerCompany>, LedgerError> {
        Ok(self
            .companies
            .iter()
            .find(|entry| entry.value().subscription_id.as_deref() == Some(subscription_id))
            .map(|entry| entry.value().clone()))
    }

    async fn record_customer(&self, user_id: &str, customer_id: &str) -> Result<(), LedgerError> {
        let mut user = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| LedgerError::UnknownUser(user_id.to_string()))?;
        user.customer_id = Some(customer_id.to_string());
        Ok(())
    }

    async fn set_user_subscription(
        &self,
        user_id: &str,
        subscription_id: Option<&str>,
        seat_quantity: u32,
        active: bool,
    ) -> Result<(), LedgerError> {
        let mut user = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| LedgerError::UnknownUser(user_id.to_string()))?;
        user.subscription_id = subscription_id.map(str::to_string);
        user.seat_quantity = seat_quantity;
        user.active = active;
        Ok(())
    }

    async fn set_company_seats(
        &self,
        company_id: &str,
        seat_limit: u32,
        subscription_id: Option<&str>,
    ) -> Result<(), LedgerError> {
        let mut company = self
            .companies
            .get_mut(company_id)
            .ok_or_else(|| LedgerError::UnknownCompany(company_id.to_string()))?;
        company.seat_limit = seat_limit;
        if subscription_id.is_some() {
            company.subscription_id = subscription_id.map(str::to_string);
        }
        Ok(())
    }

    async fn credit_tokens(
        &self,
        company_id: &str,
        tokens: u64,
        amount_usd: Decimal,
    ) -> Result<(), LedgerError> {
        let mut company = self
            .companies
            .get_mut(company_id)
            .ok_or_else(|| LedgerError::UnknownCompany(company_id.to_string()))?;
        company.token_balance += tokens;
        company.token_balance_usd += amount_usd;
        Ok(())
    }

    async fn apply_account_credit(
        &self,
        company_id: &str,
        amount_usd: Decimal,
    ) -> Result<Decimal, LedgerError> {
        let mut company = self
            .companies
            .get_mut(company_id)
            .ok_or_else(|| LedgerError::UnknownCompany(company_id.to_string()))?;
        let consumed = amount_usd.min(company.credit_balance_usd);
        company.credit_balance_usd -= consumed;
        Ok(amount_usd - consumed)
    }

    async fn stamp_renewal(&self, _company_id: &str) -> Result<(), LedgerError> {
        // The reference ledger keeps no period bookkeeping.
        Ok(())
    }
}

/// Completion alert pushed after a settlement. Best-effort only.
#[derive(Debug, Clone)]
pub enum NotificationEvent {
    TokensCredited {
        company_id: String,
        tokens: u64,
        amount_usd: Decimal,
        reference_code: String,
    },
    SubscriptionActivated {
        company_id: String,
        seats: u32,
    },
}

/// Fire-and-forget dispatcher for settlement alerts. Implementations must
/// swallow their own failures; a notification never blocks settlement.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotificationEvent);
}

/// Default notifier: writes the event to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: NotificationEvent) {
        match event {
            NotificationEvent::TokensCredited {
                company_id,
                tokens,
                amount_usd,
                reference_code,
            } => {
                tracing::info!(%company_id, tokens, %amount_usd, %reference_code, "tokens credited");
            }
            NotificationEvent::SubscriptionActivated { company_id, seats } => {
                tracing::info!(%company_id, seats, "subscription activated");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn company(id: &str, credit: Decimal) -> LedgerCompany {
        LedgerCompany {
            id: id.to_string(),
            seat_limit: 1,
            subscription_id: None,
            token_balance: 0,
            token_balance_usd: Decimal::ZERO,
            credit_balance_usd: credit,
            auto_renew: true,
            billing_mode: BillingMode::Tokens,
        }
    }

    #[tokio::test]
    async fn account_credit_is_consumed_before_remainder() {
        let ledger = InMemoryLedger::new();
        ledger.upsert_company(company("acme", Decimal::new(30, 0)));

        let remainder = ledger
            .apply_account_credit("acme", Decimal::new(50, 0))
            .await
            .unwrap();
        assert_eq!(remainder, Decimal::new(20, 0));
        assert_eq!(
            ledger.company("acme").await.unwrap().unwrap().credit_balance_usd,
            Decimal::ZERO
        );

        // A second renewal finds no credit left.
        let remainder = ledger
            .apply_account_credit("acme", Decimal::new(50, 0))
            .await
            .unwrap();
        assert_eq!(remainder, Decimal::new(50, 0));
    }

    #[tokio::test]
    async fn credit_tokens_accumulates() {
        let ledger = InMemoryLedger::new();
        ledger.upsert_company(company("acme", Decimal::ZERO));
        ledger
            .credit_tokens("acme", 1_000, Decimal::new(10, 0))
            .await
            .unwrap();
        ledger
            .credit_tokens("acme", 500, Decimal::new(5, 0))
            .await
            .unwrap();
        let acme = ledger.company("acme").await.unwrap().unwrap();
        assert_eq!(acme.token_balance, 1_500);
        assert_eq!(acme.token_balance_usd, Decimal::new(15, 0));
    }
}
