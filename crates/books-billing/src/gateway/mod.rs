//! Billing Gateway
//!
//! Abstraction over the payment provider. [`StripeGateway`] talks to Stripe;
//! [`MemoryGateway`] is an in-process fake with the same observable behavior.

mod live;
mod memory;

pub use live::StripeGateway;
pub use memory::MemoryGateway;

use async_trait::async_trait;

use crate::catalog::Tier;
use crate::error::Result;
use crate::model::{CheckoutSession, InvoiceSummary, SubscriptionSnapshot, UserId};

/// Customer to resolve or create
#[derive(Clone, Debug)]
pub struct CustomerRequest {
    pub user_id: UserId,
    pub email: Option<String>,
    pub name: Option<String>,

    /// Reference already stored locally, if any
    pub existing_customer_id: Option<String>,
}

/// Result of resolving a customer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CustomerResolution {
    pub customer_id: String,

    /// A new customer was created during this call
    pub created: bool,
}

/// Request to start a hosted checkout
#[derive(Clone, Debug)]
pub struct CheckoutRequest {
    pub customer_id: String,
    pub price_id: String,
    pub user_id: UserId,
    pub tier_id: String,
    pub success_url: String,
    pub cancel_url: String,
}

/// Payment provider trait (Strategy pattern)
#[async_trait]
pub trait BillingGateway: Send + Sync {
    /// Return a usable customer id.
    ///
    /// A stored reference the provider reports as missing or deleted is
    /// replaced by a freshly created customer. Any other lookup failure is
    /// returned and nothing is created.
    async fn ensure_customer(&self, request: CustomerRequest) -> Result<CustomerResolution>;

    /// Find or create the monthly price for a tier, keyed by the tier id.
    /// Repeated calls converge on the same price.
    async fn ensure_tier_price(&self, tier: &Tier) -> Result<String>;

    /// Create a subscription-mode checkout session. Both the session and the
    /// subscription it produces carry `{user_id, tier_id}` metadata.
    async fn start_checkout(&self, request: CheckoutRequest) -> Result<CheckoutSession>;

    /// Cancel immediately, returning the terminal state
    async fn cancel_subscription(&self, subscription_id: &str) -> Result<SubscriptionSnapshot>;

    /// Swap the subscription's single line item to the tier's price with
    /// prorations, and rewrite its `tier_id` metadata
    async fn change_tier(&self, subscription_id: &str, tier: &Tier)
    -> Result<SubscriptionSnapshot>;

    /// Current state of a subscription
    async fn fetch_subscription(&self, subscription_id: &str) -> Result<SubscriptionSnapshot>;

    /// Most recent invoices first
    async fn list_invoices(&self, customer_id: &str, limit: u8) -> Result<Vec<InvoiceSummary>>;

    /// Gateway name
    fn name(&self) -> &str;
}
