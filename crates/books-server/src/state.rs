//! Application State

use std::sync::Arc;

use books_billing::{BillingStore, SubscriptionSync, TierCatalog, WebhookVerifier};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// User billing records
    pub store: Arc<dyn BillingStore>,

    /// Published tiers, served even when Stripe is not configured
    pub catalog: Arc<TierCatalog>,

    /// Subscription synchronizer (None if Stripe is not configured)
    pub sync: Option<Arc<SubscriptionSync>>,

    /// Webhook signature verifier (None if Stripe is not configured)
    pub webhooks: Option<Arc<WebhookVerifier>>,

    /// Fallback origin for checkout redirects
    pub public_base_url: Option<String>,
}
