//! In-Memory Gateway
//!
//! For tests and local development. Mimics the parts of Stripe this crate
//! relies on: id prefixes, lookup-key prices, metadata propagation from a
//! checkout session to the subscription it creates.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{BillingGateway, CheckoutRequest, CustomerRequest, CustomerResolution};
use crate::catalog::Tier;
use crate::error::{BillingError, Result};
use crate::model::{
    CheckoutSession, InvoiceSummary, META_TIER_ID, META_USER_ID, SubscriptionSnapshot,
    SubscriptionStatus,
};

#[derive(Clone, Debug)]
struct StoredSession {
    customer_id: String,
    price_id: String,
    metadata: HashMap<String, String>,
}

#[derive(Clone, Debug)]
struct StoredSubscription {
    customer_id: String,
    price_id: String,
    status: SubscriptionStatus,
    metadata: HashMap<String, String>,
    canceled: bool,
}

#[derive(Clone, Debug)]
struct StoredInvoice {
    customer_id: String,
    summary: InvoiceSummary,
}

#[derive(Default)]
struct State {
    counters: HashMap<&'static str, u32>,
    customers: HashMap<String, Option<String>>,
    products: HashMap<String, String>,
    prices: HashMap<String, String>,
    sessions: HashMap<String, StoredSession>,
    subscriptions: HashMap<String, StoredSubscription>,
    invoices: Vec<StoredInvoice>,
    calls: usize,
    unavailable: bool,
}

impl State {
    fn next_id(&mut self, prefix: &'static str) -> String {
        let counter = self.counters.entry(prefix).or_insert(0);
        *counter += 1;
        format!("{prefix}_{counter}")
    }

    /// Counts the call and fails it when the gateway is marked down
    fn enter(&mut self, operation: &str) -> Result<()> {
        self.calls += 1;
        if self.unavailable {
            return Err(BillingError::GatewayUnavailable(format!(
                "{operation}: simulated outage"
            )));
        }
        Ok(())
    }

    fn snapshot(&self, subscription_id: &str) -> Result<SubscriptionSnapshot> {
        let sub = self
            .subscriptions
            .get(subscription_id)
            .ok_or_else(|| BillingError::GatewayNotFound(format!("subscription {subscription_id}")))?;

        let now = Utc::now();
        Ok(SubscriptionSnapshot {
            id: subscription_id.to_string(),
            customer_id: sub.customer_id.clone(),
            status: sub.status,
            tier_id: sub.metadata.get(META_TIER_ID).cloned(),
            user_id: sub.metadata.get(META_USER_ID).cloned(),
            current_period_end: Some(now + Duration::days(30)),
            cancel_at_period_end: false,
            canceled_at: sub.canceled.then_some(now),
        })
    }
}

/// In-memory stand-in for Stripe
pub struct MemoryGateway {
    state: Mutex<State>,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Number of gateway operations invoked so far
    pub async fn call_count(&self) -> usize {
        self.state.lock().await.calls
    }

    /// Make every subsequent operation fail as a provider outage
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    pub async fn customer_count(&self) -> usize {
        self.state.lock().await.customers.len()
    }

    /// Drop a customer, as if it had been deleted in the dashboard
    pub async fn forget_customer(&self, customer_id: &str) {
        self.state.lock().await.customers.remove(customer_id);
    }

    /// Metadata stamped on a checkout session
    pub async fn session_metadata(&self, session_id: &str) -> Option<HashMap<String, String>> {
        self.state
            .lock()
            .await
            .sessions
            .get(session_id)
            .map(|s| s.metadata.clone())
    }

    /// Price currently on a subscription's line item
    pub async fn subscription_price(&self, subscription_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .subscriptions
            .get(subscription_id)
            .map(|s| s.price_id.clone())
    }

    /// Simulate the customer finishing the hosted checkout.
    ///
    /// Creates the subscription with the session's metadata, like Stripe's
    /// `subscription_data.metadata`.
    pub async fn complete_checkout(
        &self,
        session_id: &str,
        status: SubscriptionStatus,
    ) -> Result<SubscriptionSnapshot> {
        let mut state = self.state.lock().await;

        let session = state
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| BillingError::GatewayNotFound(format!("session {session_id}")))?;

        let subscription_id = state.next_id("sub");
        state.subscriptions.insert(
            subscription_id.clone(),
            StoredSubscription {
                customer_id: session.customer_id.clone(),
                price_id: session.price_id.clone(),
                status,
                metadata: session.metadata.clone(),
                canceled: false,
            },
        );
        state.snapshot(&subscription_id)
    }

    /// Change a subscription's status, as Stripe does on payment events
    pub async fn set_subscription_status(
        &self,
        subscription_id: &str,
        status: SubscriptionStatus,
    ) -> Result<SubscriptionSnapshot> {
        let mut state = self.state.lock().await;

        let sub = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| BillingError::GatewayNotFound(format!("subscription {subscription_id}")))?;
        sub.status = status;

        state.snapshot(subscription_id)
    }

    /// Record an invoice for a customer
    pub async fn add_invoice(&self, customer_id: &str, amount: i64, status: &str) -> String {
        let mut state = self.state.lock().await;
        let id = state.next_id("in");
        let created = Utc::now() + Duration::seconds(i64::try_from(state.invoices.len()).unwrap_or(0));

        state.invoices.push(StoredInvoice {
            customer_id: customer_id.to_string(),
            summary: InvoiceSummary {
                id: id.clone(),
                amount,
                currency: "usd".into(),
                status: Some(status.to_string()),
                created: Some(created),
                invoice_pdf: Some(format!("https://pay.example.test/{id}.pdf")),
                hosted_invoice_url: Some(format!("https://pay.example.test/{id}")),
            },
        });
        id
    }
}

#[async_trait]
impl BillingGateway for MemoryGateway {
    async fn ensure_customer(&self, request: CustomerRequest) -> Result<CustomerResolution> {
        let mut state = self.state.lock().await;
        state.enter("ensure customer")?;

        if let Some(existing) = request.existing_customer_id {
            if state.customers.contains_key(&existing) {
                return Ok(CustomerResolution {
                    customer_id: existing,
                    created: false,
                });
            }
            tracing::warn!(customer_id = %existing, "Customer not found, creating new one");
        }

        let customer_id = state.next_id("cus");
        state.customers.insert(customer_id.clone(), request.email);

        Ok(CustomerResolution {
            customer_id,
            created: true,
        })
    }

    async fn ensure_tier_price(&self, tier: &Tier) -> Result<String> {
        let mut state = self.state.lock().await;
        state.enter("ensure tier price")?;

        if let Some(price_id) = state.prices.get(&tier.id) {
            return Ok(price_id.clone());
        }

        if !state.products.contains_key(&tier.id) {
            let product_id = state.next_id("prod");
            state.products.insert(tier.id.clone(), product_id);
        }

        let price_id = state.next_id("price");
        state.prices.insert(tier.id.clone(), price_id.clone());
        Ok(price_id)
    }

    async fn start_checkout(&self, request: CheckoutRequest) -> Result<CheckoutSession> {
        let mut state = self.state.lock().await;
        state.enter("create checkout session")?;

        if !state.customers.contains_key(&request.customer_id) {
            return Err(BillingError::GatewayNotFound(format!(
                "customer {}",
                request.customer_id
            )));
        }

        let mut metadata = HashMap::new();
        metadata.insert(META_USER_ID.to_string(), request.user_id.to_string());
        metadata.insert(META_TIER_ID.to_string(), request.tier_id.clone());

        let session_id = state.next_id("cs");
        state.sessions.insert(
            session_id.clone(),
            StoredSession {
                customer_id: request.customer_id,
                price_id: request.price_id,
                metadata,
            },
        );

        Ok(CheckoutSession {
            url: format!("https://checkout.example.test/pay/{session_id}"),
            id: session_id,
        })
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<SubscriptionSnapshot> {
        let mut state = self.state.lock().await;
        state.enter("cancel subscription")?;

        let sub = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| BillingError::GatewayNotFound(format!("subscription {subscription_id}")))?;
        sub.status = SubscriptionStatus::Canceled;
        sub.canceled = true;

        state.snapshot(subscription_id)
    }

    async fn change_tier(
        &self,
        subscription_id: &str,
        tier: &Tier,
    ) -> Result<SubscriptionSnapshot> {
        let price_id = self.ensure_tier_price(tier).await?;

        let mut state = self.state.lock().await;
        state.enter("update subscription")?;

        let sub = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| BillingError::GatewayNotFound(format!("subscription {subscription_id}")))?;
        sub.price_id = price_id;
        sub.metadata.insert(META_TIER_ID.to_string(), tier.id.clone());

        state.snapshot(subscription_id)
    }

    async fn fetch_subscription(&self, subscription_id: &str) -> Result<SubscriptionSnapshot> {
        let mut state = self.state.lock().await;
        state.enter("retrieve subscription")?;
        state.snapshot(subscription_id)
    }

    async fn list_invoices(&self, customer_id: &str, limit: u8) -> Result<Vec<InvoiceSummary>> {
        let mut state = self.state.lock().await;
        state.enter("list invoices")?;

        let mut invoices: Vec<InvoiceSummary> = state
            .invoices
            .iter()
            .filter(|i| i.customer_id == customer_id)
            .map(|i| i.summary.clone())
            .collect();
        invoices.sort_by(|a, b| b.created.cmp(&a.created));
        invoices.truncate(usize::from(limit));

        Ok(invoices)
    }

    fn name(&self) -> &str {
        "MemoryGateway"
    }
}
