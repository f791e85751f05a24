//! User Billing Record Storage
//!
//! [`PgBillingStore`] is the durable store the server runs on;
//! [`MemoryBillingStore`] backs tests and local development. Both write the
//! subscription triple in a single step, so readers never observe a
//! half-written triple.

mod memory;
mod postgres;

pub use memory::MemoryBillingStore;
pub use postgres::PgBillingStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{SubscriptionTriple, UserBillingRecord, UserId};

/// Billing record storage trait
#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Find the record for an OAuth subject, creating it on first sight.
    /// Email and name are refreshed when provided.
    async fn upsert_user(
        &self,
        subject: &str,
        email: Option<&str>,
        name: Option<&str>,
    ) -> Result<UserBillingRecord>;

    /// Get record by local user id
    async fn get(&self, user_id: UserId) -> Result<Option<UserBillingRecord>>;

    /// Get record by its current Stripe customer id
    async fn find_by_customer(&self, customer_id: &str) -> Result<Option<UserBillingRecord>>;

    /// Get the record whose stored triple names this subscription
    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<UserBillingRecord>>;

    /// Set the Stripe customer id
    async fn set_customer(&self, user_id: UserId, customer_id: &str) -> Result<()>;

    /// Replace the whole subscription triple; `None` clears it
    async fn set_subscription(
        &self,
        user_id: UserId,
        subscription: Option<SubscriptionTriple>,
    ) -> Result<()>;

    /// Records that currently hold a subscription
    async fn subscribed_users(&self) -> Result<Vec<UserBillingRecord>>;

    /// Store name
    fn name(&self) -> &str;
}
