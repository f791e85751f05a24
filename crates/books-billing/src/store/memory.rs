//! In-Memory Billing Store
//!
//! Every write touches one record under a single lock acquisition. Contents
//! are lost on restart.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::BillingStore;
use crate::error::{BillingError, Result};
use crate::model::{SubscriptionTriple, UserBillingRecord, UserId};

#[derive(Default)]
struct Records {
    by_user: HashMap<UserId, UserBillingRecord>,
    by_subject: HashMap<String, UserId>,
    by_customer: HashMap<String, UserId>,
}

/// In-memory billing store (for development and tests)
pub struct MemoryBillingStore {
    records: RwLock<Records>,
    writes: AtomicUsize,
}

impl Default for MemoryBillingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Records::default()),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of billing-field writes applied so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Records>> {
        self.records
            .read()
            .map_err(|_| BillingError::Storage("billing store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Records>> {
        self.records
            .write()
            .map_err(|_| BillingError::Storage("billing store lock poisoned".into()))
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn upsert_user(
        &self,
        subject: &str,
        email: Option<&str>,
        name: Option<&str>,
    ) -> Result<UserBillingRecord> {
        let mut records = self.write()?;

        if let Some(user_id) = records.by_subject.get(subject).copied() {
            if let Some(record) = records.by_user.get_mut(&user_id) {
                if email.is_some() {
                    record.email = email.map(str::to_string);
                }
                if name.is_some() {
                    record.name = name.map(str::to_string);
                }
                return Ok(record.clone());
            }
        }

        let record = UserBillingRecord::new(
            subject,
            email.map(str::to_string),
            name.map(str::to_string),
        );
        records.by_subject.insert(subject.to_string(), record.user_id);
        records.by_user.insert(record.user_id, record.clone());

        tracing::debug!(user_id = %record.user_id, "Created billing record");
        Ok(record)
    }

    async fn get(&self, user_id: UserId) -> Result<Option<UserBillingRecord>> {
        let records = self.read()?;
        Ok(records.by_user.get(&user_id).cloned())
    }

    async fn find_by_customer(&self, customer_id: &str) -> Result<Option<UserBillingRecord>> {
        let records = self.read()?;

        Ok(records
            .by_customer
            .get(customer_id)
            .and_then(|user_id| records.by_user.get(user_id))
            .cloned())
    }

    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<UserBillingRecord>> {
        let records = self.read()?;

        Ok(records
            .by_user
            .values()
            .find(|r| r.active_subscription_id() == Some(subscription_id))
            .cloned())
    }

    async fn set_customer(&self, user_id: UserId, customer_id: &str) -> Result<()> {
        let mut records = self.write()?;
        let Records {
            by_user,
            by_customer,
            ..
        } = &mut *records;

        let record = by_user
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;

        if let Some(previous) = record.billing_customer_id.take() {
            if previous != customer_id {
                by_customer.remove(&previous);
            }
        }
        record.billing_customer_id = Some(customer_id.to_string());
        record.updated_at = Utc::now();
        by_customer.insert(customer_id.to_string(), user_id);

        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_subscription(
        &self,
        user_id: UserId,
        subscription: Option<SubscriptionTriple>,
    ) -> Result<()> {
        let mut records = self.write()?;

        let record = records
            .by_user
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;

        record.subscription = subscription;
        record.updated_at = Utc::now();

        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribed_users(&self) -> Result<Vec<UserBillingRecord>> {
        let records = self.read()?;

        Ok(records
            .by_user
            .values()
            .filter(|r| r.subscription.is_some())
            .cloned()
            .collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
