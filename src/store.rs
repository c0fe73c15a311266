//! Persistence seam for [`PaymentTransaction`] records.
//!
//! The store owns the status machine's enforcement point: every mutation
//! re-checks the record's current status immediately before writing, so a
//! second concurrent settle of the same reference degrades to the idempotent
//! already-completed path instead of a double credit. Records are never
//! deleted; terminal records remain as the audit log.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::timestamp::UnixTimestamp;
use crate::types::{PaymentStatus, PaymentTransaction, ReferenceCode};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Duplicate reference code: {0}")]
    DuplicateReference(ReferenceCode),
    #[error("Payment record not found: {0}")]
    NotFound(ReferenceCode),
    #[error("Illegal status transition {from} -> {to} for {reference}")]
    IllegalTransition {
        reference: ReferenceCode,
        from: PaymentStatus,
        to: PaymentStatus,
    },
    /// Backend failure (I/O, connection). Retryable; never raised by the
    /// in-memory store.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Facts recorded onto a record when it settles.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub transaction_hash: Option<String>,
    pub wallet_address: Option<String>,
    /// Rail-specific audit facts (block slot/time, confirmed amount,
    /// facilitator response).
    pub metadata: serde_json::Value,
    pub now: UnixTimestamp,
}

/// Result of a settle attempt.
#[derive(Debug, Clone)]
pub enum SettleOutcome {
    /// The record moved `pending -> completed` in this call. The caller must
    /// credit the ledger exactly once, now.
    NewlyCompleted(PaymentTransaction),
    /// The record was already `completed`; the stored result is returned and
    /// the ledger must not be touched again.
    AlreadyCompleted(PaymentTransaction),
}

impl SettleOutcome {
    pub fn record(&self) -> &PaymentTransaction {
        match self {
            SettleOutcome::NewlyCompleted(record) => record,
            SettleOutcome::AlreadyCompleted(record) => record,
        }
    }
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Persists a fresh record. Fails if the reference code already exists.
    async fn insert(&self, record: PaymentTransaction) -> Result<(), StoreError>;

    async fn get(
        &self,
        reference: &ReferenceCode,
    ) -> Result<Option<PaymentTransaction>, StoreError>;

    /// Looks a record up by its card-rail external id (payment-intent or
    /// charge id).
    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<PaymentTransaction>, StoreError>;

    /// Moves a record to `completed`, re-checking status under the record
    /// lock. An already-completed record yields
    /// [`SettleOutcome::AlreadyCompleted`]; a failed or expired record is an
    /// illegal transition.
    async fn settle(
        &self,
        reference: &ReferenceCode,
        settlement: Settlement,
    ) -> Result<SettleOutcome, StoreError>;

    /// Moves a pending record to `failed` or `expired`. Marking a record with
    /// the terminal status it already has is a no-op returning the stored
    /// record; any other transition out of a terminal state is illegal.
    async fn mark(
        &self,
        reference: &ReferenceCode,
        status: PaymentStatus,
        now: UnixTimestamp,
    ) -> Result<PaymentTransaction, StoreError>;
}

/// Reference store backed by concurrent maps. Per-record mutations are atomic
/// via entry locking.
#[derive(Debug, Default)]
pub struct InMemoryTransactionStore {
    records: DashMap<String, PaymentTransaction>,
    by_external_id: DashMap<String, ReferenceCode>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn insert(&self, record: PaymentTransaction) -> Result<(), StoreError> {
        let key = record.reference_code.as_str().to_string();
        if self.records.contains_key(&key) {
            return Err(StoreError::DuplicateReference(record.reference_code));
        }
        if let Some(external_id) = &record.external_id {
            self.by_external_id
                .insert(external_id.clone(), record.reference_code.clone());
        }
        self.records.insert(key, record);
        Ok(())
    }

    async fn get(
        &self,
        reference: &ReferenceCode,
    ) -> Result<Option<PaymentTransaction>, StoreError> {
        Ok(self
            .records
            .get(reference.as_str())
            .map(|entry| entry.value().clone()))
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<PaymentTransaction>, StoreError> {
        let Some(reference) = self
            .by_external_id
            .get(external_id)
            .map(|entry| entry.value().clone())
        else {
            return Ok(None);
        };
        self.get(&reference).await
    }

    async fn settle(
        &self,
        reference: &ReferenceCode,
        settlement: Settlement,
    ) -> Result<SettleOutcome, StoreError> {
        let mut entry = self
            .records
            .get_mut(reference.as_str())
            .ok_or_else(|| StoreError::NotFound(reference.clone()))?;
        let record = entry.value_mut();
        match record.status {
            PaymentStatus::Completed => Ok(SettleOutcome::AlreadyCompleted(record.clone())),
            PaymentStatus::Pending => {
                record.status = PaymentStatus::Completed;
                if settlement.transaction_hash.is_some() {
                    record.transaction_hash = settlement.transaction_hash;
                }
                if settlement.wallet_address.is_some() {
                    record.wallet_address = settlement.wallet_address;
                }
                record.metadata = settlement.metadata;
                record.updated_at = settlement.now;
                Ok(SettleOutcome::NewlyCompleted(record.clone()))
            }
            from => Err(StoreError::IllegalTransition {
                reference: reference.clone(),
                from,
                to: PaymentStatus::Completed,
            }),
        }
    }

    async fn mark(
        &self,
        reference: &ReferenceCode,
        status: PaymentStatus,
        now: UnixTimestamp,
    ) -> Result<PaymentTransaction, StoreError> {
        let mut entry = self
            .records
            .get_mut(reference.as_str())
            .ok_or_else(|| StoreError::NotFound(reference.clone()))?;
        let record = entry.value_mut();
        if record.status == status {
            return Ok(record.clone());
        }
        if !record.status.can_transition_to(status) {
            return Err(StoreError::IllegalTransition {
                reference: reference.clone(),
                from: record.status,
                to: status,
            });
        }
        record.status = status;
        record.updated_at = now;
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::Currency;
    use crate::types::{BillingKind, PaymentMethod};
    use rust_decimal::Decimal;

    fn pending_record() -> PaymentTransaction {
        PaymentTransaction::new_pending(
            Some("user-1".to_string()),
            Some("acme".to_string()),
            BillingKind::Tokens { token_amount: 500 },
            PaymentMethod::Crypto,
            Some(Currency::Usdc),
            Some(crate::currency::Network::Solana),
            Decimal::new(10, 0),
            Decimal::new(10, 0),
            Decimal::ONE,
            UnixTimestamp::from_secs(1_000),
        )
        .unwrap()
    }

    fn settlement_at(now: u64) -> Settlement {
        Settlement {
            transaction_hash: Some("5Nf...sig".to_string()),
            wallet_address: None,
            metadata: serde_json::json!({"slot": 42}),
            now: UnixTimestamp::from_secs(now),
        }
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryTransactionStore::new();
        let record = pending_record();
        store.insert(record.clone()).await.unwrap();
        let err = store.insert(record).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateReference(_)));
    }

    #[tokio::test]
    async fn settle_is_idempotent() {
        let store = InMemoryTransactionStore::new();
        let record = pending_record();
        let reference = record.reference_code.clone();
        store.insert(record).await.unwrap();

        let first = store.settle(&reference, settlement_at(2_000)).await.unwrap();
        assert!(matches!(first, SettleOutcome::NewlyCompleted(_)));

        let second = store.settle(&reference, settlement_at(3_000)).await.unwrap();
        match second {
            SettleOutcome::AlreadyCompleted(stored) => {
                // The stored result is returned unchanged.
                assert_eq!(stored.updated_at, UnixTimestamp::from_secs(2_000));
                assert_eq!(stored.transaction_hash.as_deref(), Some("5Nf...sig"));
            }
            SettleOutcome::NewlyCompleted(_) => panic!("second settle must not re-complete"),
        }
    }

    #[tokio::test]
    async fn settling_an_expired_record_is_illegal() {
        let store = InMemoryTransactionStore::new();
        let record = pending_record();
        let reference = record.reference_code.clone();
        store.insert(record).await.unwrap();
        store
            .mark(
                &reference,
                PaymentStatus::Expired,
                UnixTimestamp::from_secs(2_000),
            )
            .await
            .unwrap();

        let err = store
            .settle(&reference, settlement_at(3_000))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn external_id_lookup() {
        let store = InMemoryTransactionStore::new();
        let mut record = pending_record();
        record.external_id = Some("pi_123".to_string());
        let reference = record.reference_code.clone();
        store.insert(record).await.unwrap();

        let found = store.find_by_external_id("pi_123").await.unwrap().unwrap();
        assert_eq!(found.reference_code, reference);
        assert!(store.find_by_external_id("pi_999").await.unwrap().is_none());
    }
}
