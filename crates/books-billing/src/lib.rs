//! # books-billing
//!
//! Subscription billing for the flat-fee accounting site: the tier catalog,
//! a Stripe gateway, and the synchronizer that keeps each user's local
//! subscription state in line with Stripe.
//!
//! ## Flow
//!
//! ```text
//! ┌─────────────┐  checkout   ┌─────────────────┐  redirect  ┌─────────────┐
//! │  Pricing    │────────────▶│  Stripe Hosted  │───────────▶│  Dashboard  │
//! │  page       │             │  Checkout       │            │             │
//! └─────────────┘             └────────┬────────┘            └─────────────┘
//!                                      │ webhooks
//!                                      ▼
//!                             ┌─────────────────┐
//!                             │ SubscriptionSync│──▶ BillingStore
//!                             └─────────────────┘
//! ```
//!
//! The synchronous path only creates the checkout session (and stores a
//! newly created customer id). The subscription id, tier and status are
//! written exclusively from verified webhook events, each derived from a
//! fresh subscription snapshot, so redelivery and reordering converge.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use books_billing::{
//!     BillingConfig, CheckoutUrls, PgBillingStore, StoreConfig, StripeGateway,
//!     SubscriptionSync, TierCatalog, WebhookVerifier,
//! };
//!
//! let config = BillingConfig::from_env()?;
//! let store = PgBillingStore::connect(&StoreConfig::from_env()?).await?;
//! store.migrate().await?;
//!
//! let sync = SubscriptionSync::new(
//!     Arc::new(TierCatalog::standard()),
//!     Arc::new(StripeGateway::from_config(&config)),
//!     Arc::new(store),
//! );
//!
//! // User clicked "Get started" on the Startups tier
//! let session = sync
//!     .request_checkout(user_id, "startups", &CheckoutUrls::for_origin("https://books.example.com"))
//!     .await?;
//!
//! // Later, in the webhook endpoint
//! let verifier = WebhookVerifier::from_config(&config);
//! let event = verifier.verify(&body, &signature)?;
//! sync.handle_event(&event).await?;
//! ```

mod catalog;
mod config;
mod error;
mod gateway;
mod model;
mod store;
mod sync;
mod webhook;

pub use catalog::{Tier, TierCatalog};
pub use config::{
    BillingConfig, DEFAULT_DB_MAX_CONNECTIONS, DEFAULT_WEBHOOK_TOLERANCE_SECS, StoreConfig,
};
pub use error::{BillingError, Result};
pub use gateway::{
    BillingGateway, CheckoutRequest, CustomerRequest, CustomerResolution, MemoryGateway,
    StripeGateway,
};
pub use model::{
    CheckoutSession, CheckoutUrls, InvoiceSummary, META_TIER_ID, META_USER_ID,
    SubscriptionSnapshot, SubscriptionStatus, SubscriptionTriple, UserBillingRecord, UserId,
};
pub use store::{BillingStore, MemoryBillingStore, PgBillingStore};
pub use sync::{BILLING_HISTORY_LIMIT, EventOutcome, SubscriptionSync};
pub use webhook::{
    CheckoutSessionObject, EventPayload, InvoiceObject, TEST_EVENT_PREFIX, WebhookEvent,
    WebhookVerifier, signature_header,
};
