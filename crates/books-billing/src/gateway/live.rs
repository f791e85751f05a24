//! Stripe Gateway
//!
//! Talks to the Stripe API through `async-stripe` and narrows every response
//! into the crate's own snapshot types.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use stripe::{
    CancelSubscription, CheckoutSession as StripeCheckoutSession,
    CheckoutSessionBillingAddressCollection, CheckoutSessionMode, Client, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData, CreateCustomer,
    CreatePrice, CreatePriceRecurring, CreatePriceRecurringInterval, CreateProduct, Currency,
    Customer, CustomerId, IdOrCreate, Invoice, ListInvoices, ListPrices, ListProducts, Price,
    Product, StripeError, Subscription, SubscriptionId, UpdateSubscription,
    UpdateSubscriptionItems,
};
// Ambiguous at the crate root; the update params take this one
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;

use super::{BillingGateway, CheckoutRequest, CustomerRequest, CustomerResolution};
use crate::catalog::Tier;
use crate::config::BillingConfig;
use crate::error::{BillingError, Result};
use crate::model::{
    CheckoutSession, InvoiceSummary, META_TIER_ID, META_USER_ID, SubscriptionSnapshot, timestamp,
};

/// Stripe-backed gateway
pub struct StripeGateway {
    client: Client,

    /// tier id -> Stripe price id, filled on first resolution
    price_cache: RwLock<HashMap<String, String>>,
}

impl StripeGateway {
    /// Create a new Stripe gateway
    pub fn new(secret_key: &str) -> Self {
        Self {
            client: Client::new(secret_key),
            price_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &BillingConfig) -> Self {
        Self::new(&config.stripe_secret_key)
    }

    /// Get the underlying Stripe client
    pub const fn inner(&self) -> &Client {
        &self.client
    }

    fn cached_price(&self, tier_id: &str) -> Option<String> {
        self.price_cache
            .read()
            .ok()
            .and_then(|cache| cache.get(tier_id).cloned())
    }

    fn cache_price(&self, tier_id: &str, price_id: &str) {
        if let Ok(mut cache) = self.price_cache.write() {
            cache.insert(tier_id.to_string(), price_id.to_string());
        }
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> Result<Subscription> {
        let id = parse_subscription_id(subscription_id)?;
        Subscription::retrieve(&self.client, &id, &[])
            .await
            .map_err(|e| map_stripe_error("retrieve subscription", &e))
    }

    /// Product tagged with the tier id, created if missing
    async fn ensure_product(&self, tier: &Tier) -> Result<String> {
        let mut list = ListProducts::new();
        list.limit = Some(100);

        let products = Product::list(&self.client, &list)
            .await
            .map_err(|e| map_stripe_error("list products", &e))?;

        let existing = products.data.into_iter().find(|p| {
            p.metadata
                .as_ref()
                .and_then(|m| m.get(META_TIER_ID))
                .is_some_and(|t| *t == tier.id)
        });
        if let Some(product) = existing {
            return Ok(product.id.to_string());
        }

        let name = format!("{} Tier - Flat-Fee Accounting", tier.name);
        let mut metadata = HashMap::new();
        metadata.insert(META_TIER_ID.to_string(), tier.id.clone());
        metadata.insert("transaction_range".to_string(), tier.transaction_range.clone());

        let mut params = CreateProduct::new(&name);
        params.description = Some(&tier.description);
        params.metadata = Some(metadata);

        let product = Product::create(&self.client, params)
            .await
            .map_err(|e| map_stripe_error("create product", &e))?;

        tracing::info!(tier_id = %tier.id, product_id = %product.id, "Created Stripe product");
        Ok(product.id.to_string())
    }
}

#[async_trait]
impl BillingGateway for StripeGateway {
    async fn ensure_customer(&self, request: CustomerRequest) -> Result<CustomerResolution> {
        if let Some(existing) = request.existing_customer_id.as_deref() {
            match existing.parse::<CustomerId>() {
                Ok(customer_id) => match Customer::retrieve(&self.client, &customer_id, &[]).await {
                    Ok(customer) if !customer.deleted => {
                        return Ok(CustomerResolution {
                            customer_id: existing.to_string(),
                            created: false,
                        });
                    }
                    Ok(_) => {
                        tracing::warn!(customer_id = %existing, "Stripe customer was deleted, creating new one");
                    }
                    Err(e) => match map_stripe_error("retrieve customer", &e) {
                        BillingError::GatewayNotFound(_) => {
                            tracing::warn!(customer_id = %existing, "Stripe customer not found, creating new one");
                        }
                        // Only a definitive answer may replace the stored customer
                        other => return Err(other),
                    },
                },
                Err(_) => {
                    tracing::warn!(customer_id = %existing, "Malformed Stripe customer id, creating new one");
                }
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert(META_USER_ID.to_string(), request.user_id.to_string());

        let mut params = CreateCustomer::new();
        params.email = request.email.as_deref();
        params.name = request.name.as_deref();
        params.metadata = Some(metadata);

        let customer = Customer::create(&self.client, params)
            .await
            .map_err(|e| map_stripe_error("create customer", &e))?;

        tracing::info!(user_id = %request.user_id, customer_id = %customer.id, "Created Stripe customer");

        Ok(CustomerResolution {
            customer_id: customer.id.to_string(),
            created: true,
        })
    }

    async fn ensure_tier_price(&self, tier: &Tier) -> Result<String> {
        if let Some(price_id) = self.cached_price(&tier.id) {
            return Ok(price_id);
        }

        let mut list = ListPrices::new();
        list.lookup_keys = Some(vec![tier.id.clone()]);
        list.limit = Some(1);

        let existing = Price::list(&self.client, &list)
            .await
            .map_err(|e| map_stripe_error("list prices", &e))?;

        let price_id = if let Some(price) = existing.data.into_iter().next() {
            price.id.to_string()
        } else {
            let product_id = self.ensure_product(tier).await?;

            let mut metadata = HashMap::new();
            metadata.insert(META_TIER_ID.to_string(), tier.id.clone());

            let mut params = CreatePrice::new(Currency::USD);
            params.product = Some(IdOrCreate::Id(product_id.as_str()));
            params.unit_amount = Some(tier.monthly_price);
            params.lookup_key = Some(&tier.id);
            params.metadata = Some(metadata);
            params.recurring = Some(CreatePriceRecurring {
                interval: CreatePriceRecurringInterval::Month,
                ..Default::default()
            });

            let price = Price::create(&self.client, params)
                .await
                .map_err(|e| map_stripe_error("create price", &e))?;

            tracing::info!(tier_id = %tier.id, price_id = %price.id, "Created Stripe price");
            price.id.to_string()
        };

        self.cache_price(&tier.id, &price_id);
        Ok(price_id)
    }

    async fn start_checkout(&self, request: CheckoutRequest) -> Result<CheckoutSession> {
        let customer_id = request
            .customer_id
            .parse::<CustomerId>()
            .map_err(|_| BillingError::GatewayNotFound(format!("customer {}", request.customer_id)))?;
        let user_id = request.user_id.to_string();

        let mut metadata = HashMap::new();
        metadata.insert(META_USER_ID.to_string(), user_id.clone());
        metadata.insert(META_TIER_ID.to_string(), request.tier_id.clone());

        let mut params = CreateCheckoutSession::new();
        params.customer = Some(customer_id);
        params.client_reference_id = Some(&user_id);
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.allow_promotion_codes = Some(true);
        params.billing_address_collection = Some(CheckoutSessionBillingAddressCollection::Auto);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata.clone());
        params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
            metadata: Some(metadata),
            ..Default::default()
        });

        let session = StripeCheckoutSession::create(&self.client, params)
            .await
            .map_err(|e| map_stripe_error("create checkout session", &e))?;

        let url = session
            .url
            .ok_or_else(|| BillingError::GatewayUnavailable("No checkout URL returned".into()))?;

        Ok(CheckoutSession {
            id: session.id.to_string(),
            url,
        })
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<SubscriptionSnapshot> {
        let id = parse_subscription_id(subscription_id)?;

        let subscription = Subscription::cancel(&self.client, &id, CancelSubscription::default())
            .await
            .map_err(|e| map_stripe_error("cancel subscription", &e))?;

        map_subscription(&subscription)
    }

    async fn change_tier(
        &self,
        subscription_id: &str,
        tier: &Tier,
    ) -> Result<SubscriptionSnapshot> {
        let price_id = self.ensure_tier_price(tier).await?;
        let current = self.retrieve_subscription(subscription_id).await?;

        let item = current.items.data.first().ok_or_else(|| {
            BillingError::GatewayNotFound(format!("line item on subscription {subscription_id}"))
        })?;

        let mut metadata = current.metadata.clone();
        metadata.insert(META_TIER_ID.to_string(), tier.id.clone());

        let mut params = UpdateSubscription::new();
        params.items = Some(vec![UpdateSubscriptionItems {
            id: Some(item.id.to_string()),
            price: Some(price_id),
            ..Default::default()
        }]);
        params.proration_behavior = Some(SubscriptionProrationBehavior::CreateProrations);
        params.metadata = Some(metadata);

        let updated = Subscription::update(&self.client, &current.id, params)
            .await
            .map_err(|e| map_stripe_error("update subscription", &e))?;

        map_subscription(&updated)
    }

    async fn fetch_subscription(&self, subscription_id: &str) -> Result<SubscriptionSnapshot> {
        let subscription = self.retrieve_subscription(subscription_id).await?;
        map_subscription(&subscription)
    }

    async fn list_invoices(&self, customer_id: &str, limit: u8) -> Result<Vec<InvoiceSummary>> {
        let customer_id = customer_id
            .parse::<CustomerId>()
            .map_err(|_| BillingError::GatewayNotFound(format!("customer {customer_id}")))?;

        let mut params = ListInvoices::new();
        params.customer = Some(customer_id);
        params.limit = Some(u64::from(limit));

        let invoices = Invoice::list(&self.client, &params)
            .await
            .map_err(|e| map_stripe_error("list invoices", &e))?;

        Ok(invoices.data.into_iter().map(map_invoice).collect())
    }

    fn name(&self) -> &str {
        "Stripe"
    }
}

fn parse_subscription_id(id: &str) -> Result<SubscriptionId> {
    id.parse()
        .map_err(|_| BillingError::GatewayNotFound(format!("subscription {id}")))
}

/// 404 is the only answer that means "does not exist"; everything else may
/// succeed on a later attempt.
fn map_stripe_error(operation: &str, error: &StripeError) -> BillingError {
    if let StripeError::Stripe(request) = error {
        if request.http_status == 404 {
            return BillingError::GatewayNotFound(format!("{operation}: {error}"));
        }
    }
    BillingError::GatewayUnavailable(format!("{operation}: {error}"))
}

fn map_subscription(sub: &Subscription) -> Result<SubscriptionSnapshot> {
    let status = sub
        .status
        .to_string()
        .parse()
        .map_err(BillingError::GatewayUnavailable)?;

    Ok(SubscriptionSnapshot {
        id: sub.id.to_string(),
        customer_id: sub.customer.id().to_string(),
        status,
        tier_id: sub.metadata.get(META_TIER_ID).cloned(),
        user_id: sub.metadata.get(META_USER_ID).cloned(),
        current_period_end: timestamp(sub.current_period_end),
        cancel_at_period_end: sub.cancel_at_period_end,
        canceled_at: sub.canceled_at.and_then(timestamp),
    })
}

fn map_invoice(invoice: Invoice) -> InvoiceSummary {
    InvoiceSummary {
        id: invoice.id.to_string(),
        amount: invoice.amount_paid.unwrap_or(0),
        currency: invoice
            .currency
            .map_or_else(|| "usd".to_string(), |c| c.to_string()),
        status: invoice.status.map(|s| s.to_string()),
        created: invoice.created.and_then(timestamp),
        invoice_pdf: invoice.invoice_pdf,
        hosted_invoice_url: invoice.hosted_invoice_url,
    }
}
