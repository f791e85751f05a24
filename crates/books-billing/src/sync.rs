//! Subscription State Synchronizer
//!
//! Owns every write to a user's subscription triple. User-initiated calls
//! (checkout, cancel, tier change) only talk to Stripe; the triple itself is
//! written from webhook deliveries and reconciliation, all through
//! [`SubscriptionSync::apply_subscription_snapshot`].
//!
//! Each write is derived from a fresh subscription snapshot, so duplicate and
//! reordered deliveries converge. A very old duplicate arriving after a newer
//! change can still overwrite it; Stripe does not order deliveries either.

use std::sync::Arc;

use crate::catalog::{Tier, TierCatalog};
use crate::error::{BillingError, Result};
use crate::gateway::{BillingGateway, CheckoutRequest, CustomerRequest};
use crate::model::{
    CheckoutSession, CheckoutUrls, InvoiceSummary, SubscriptionSnapshot, SubscriptionTriple,
    UserBillingRecord, UserId,
};
use crate::store::BillingStore;
use crate::webhook::{CheckoutSessionObject, EventPayload, InvoiceObject, WebhookEvent};

/// Invoices returned by [`SubscriptionSync::billing_history`]
pub const BILLING_HISTORY_LIMIT: u8 = 10;

/// What happened to a verified webhook delivery
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventOutcome {
    /// Local state was derived from the event
    Applied,

    /// Synthetic endpoint check, never dispatched
    TestEventAcknowledged,

    /// Event type or shape we have nothing to do for
    Ignored(String),

    /// Event could not be attributed; acknowledged so Stripe stops retrying
    Discarded { reason: String },
}

/// Subscription state synchronizer
pub struct SubscriptionSync {
    catalog: Arc<TierCatalog>,
    gateway: Arc<dyn BillingGateway>,
    store: Arc<dyn BillingStore>,
}

impl SubscriptionSync {
    pub fn new(
        catalog: Arc<TierCatalog>,
        gateway: Arc<dyn BillingGateway>,
        store: Arc<dyn BillingStore>,
    ) -> Self {
        tracing::info!(
            gateway = gateway.name(),
            store = store.name(),
            tiers = catalog.len(),
            "Subscription sync ready"
        );
        Self {
            catalog,
            gateway,
            store,
        }
    }

    pub fn catalog(&self) -> &TierCatalog {
        &self.catalog
    }

    pub fn tiers(&self) -> &[Tier] {
        self.catalog.tiers()
    }

    // ===== User-Initiated Operations =====

    /// Start a hosted checkout for a tier.
    ///
    /// A newly created customer is persisted right away: no webhook we
    /// listen to announces it, and losing it would duplicate customers on
    /// retry. The subscription triple is not touched here.
    pub async fn request_checkout(
        &self,
        user_id: UserId,
        tier_id: &str,
        urls: &CheckoutUrls,
    ) -> Result<CheckoutSession> {
        let tier = self
            .catalog
            .get(tier_id)
            .ok_or_else(|| BillingError::InvalidTier(tier_id.to_string()))?;

        let record = self.record(user_id).await?;

        let resolution = self
            .gateway
            .ensure_customer(CustomerRequest {
                user_id,
                email: record.email.clone(),
                name: record.name.clone(),
                existing_customer_id: record.billing_customer_id.clone(),
            })
            .await?;

        if resolution.created {
            self.store.set_customer(user_id, &resolution.customer_id).await?;
            tracing::info!(
                user_id = %user_id,
                customer_id = %resolution.customer_id,
                "Stored new billing customer"
            );
        }

        let price_id = self.gateway.ensure_tier_price(tier).await?;

        let session = self
            .gateway
            .start_checkout(CheckoutRequest {
                customer_id: resolution.customer_id,
                price_id,
                user_id,
                tier_id: tier.id.clone(),
                success_url: urls.success_url.clone(),
                cancel_url: urls.cancel_url.clone(),
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            tier_id = %tier.id,
            session_id = %session.id,
            "Created checkout session"
        );

        Ok(session)
    }

    /// Cancel the user's subscription immediately.
    ///
    /// The local triple is cleared later by the deletion webhook.
    pub async fn cancel_active_subscription(&self, user_id: UserId) -> Result<SubscriptionSnapshot> {
        let record = self.record(user_id).await?;
        let subscription_id = record
            .active_subscription_id()
            .ok_or(BillingError::NoActiveSubscription)?;

        let snapshot = self.gateway.cancel_subscription(subscription_id).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %snapshot.id,
            status = %snapshot.status,
            "Subscription canceled"
        );

        Ok(snapshot)
    }

    /// Move the subscription to another tier with prorations.
    ///
    /// The returned snapshot is for immediate feedback; the update webhook
    /// persists the new tier.
    pub async fn change_subscription_tier(
        &self,
        user_id: UserId,
        new_tier_id: &str,
    ) -> Result<SubscriptionSnapshot> {
        let record = self.record(user_id).await?;
        let subscription_id = record
            .active_subscription_id()
            .ok_or(BillingError::NoActiveSubscription)?;

        let tier = self
            .catalog
            .get(new_tier_id)
            .ok_or_else(|| BillingError::InvalidTier(new_tier_id.to_string()))?;

        let snapshot = self.gateway.change_tier(subscription_id, tier).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %snapshot.id,
            tier_id = %tier.id,
            "Subscription tier changed"
        );

        Ok(snapshot)
    }

    /// Live subscription state, or `None` without a subscription.
    ///
    /// The tier comes from the subscription's own metadata; the stored tier
    /// only fills in when that is missing.
    pub async fn current_subscription(&self, user_id: UserId) -> Result<Option<SubscriptionSnapshot>> {
        let record = self.record(user_id).await?;
        let Some(triple) = record.subscription else {
            return Ok(None);
        };

        let mut snapshot = self.gateway.fetch_subscription(&triple.subscription_id).await?;
        if snapshot.tier_id.is_none() {
            snapshot.tier_id = Some(triple.tier_id);
        }
        Ok(Some(snapshot))
    }

    /// Most recent invoices; empty when the user was never a customer
    pub async fn billing_history(&self, user_id: UserId) -> Result<Vec<InvoiceSummary>> {
        let record = self.record(user_id).await?;
        let Some(customer_id) = record.billing_customer_id else {
            return Ok(Vec::new());
        };

        self.gateway
            .list_invoices(&customer_id, BILLING_HISTORY_LIMIT)
            .await
    }

    // ===== Webhook Dispatch =====

    /// Apply a verified delivery.
    ///
    /// Attribution failures are logged and reported as
    /// [`EventOutcome::Discarded`]; any other error is returned so the
    /// delivery is retried.
    pub async fn handle_event(&self, event: &WebhookEvent) -> Result<EventOutcome> {
        if event.is_test() {
            tracing::info!(event_id = %event.id, "Test webhook event acknowledged");
            return Ok(EventOutcome::TestEventAcknowledged);
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        let result = match event.decode()? {
            EventPayload::CheckoutCompleted(session) => self.on_checkout_completed(&session).await,
            EventPayload::SubscriptionChanged(snapshot) => {
                self.on_subscription_changed(&snapshot).await
            }
            EventPayload::SubscriptionDeleted(snapshot) => {
                self.on_subscription_deleted(&snapshot).await
            }
            EventPayload::InvoicePaid(invoice) | EventPayload::InvoicePaymentFailed(invoice) => {
                self.on_invoice(&invoice).await
            }
            EventPayload::Other(kind) => {
                tracing::debug!(event_type = %kind, "Unhandled webhook event");
                Ok(EventOutcome::Ignored(kind))
            }
        };

        match result {
            Err(e) if e.is_acknowledged() => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook event discarded"
                );
                Ok(EventOutcome::Discarded {
                    reason: e.to_string(),
                })
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook handler failed"
                );
                Err(e)
            }
            ok => ok,
        }
    }

    async fn on_checkout_completed(&self, session: &CheckoutSessionObject) -> Result<EventOutcome> {
        let raw_user_id = session.user_id.as_deref().ok_or_else(|| {
            BillingError::AttributionMissing(format!("checkout session {} has no user_id", session.id))
        })?;
        let user_id: UserId = raw_user_id.parse().map_err(|_| {
            BillingError::AttributionMissing(format!(
                "checkout session {} has malformed user_id {raw_user_id}",
                session.id
            ))
        })?;

        let record = self
            .store
            .get(user_id)
            .await?
            .ok_or_else(|| BillingError::OrphanEvent(format!("user {user_id} does not exist")))?;

        if let Some(customer_id) = &session.customer_id {
            if record.billing_customer_id.as_deref() != Some(customer_id.as_str()) {
                self.store.set_customer(user_id, customer_id).await?;
            }
        }

        let Some(subscription_id) = &session.subscription_id else {
            return Ok(EventOutcome::Ignored(format!(
                "checkout session {} has no subscription",
                session.id
            )));
        };

        let snapshot = self.gateway.fetch_subscription(subscription_id).await?;
        let tier_id = self.known_tier(session.tier_id.as_deref(), &session.id)?;

        self.apply_subscription_snapshot(&record, Some(&snapshot), Some(tier_id))
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %snapshot.id,
            status = %snapshot.status,
            "Checkout completed"
        );

        Ok(EventOutcome::Applied)
    }

    async fn on_subscription_changed(&self, snapshot: &SubscriptionSnapshot) -> Result<EventOutcome> {
        let record = self.owner_of(snapshot).await?;
        let tier_id = self.known_tier(snapshot.tier_id.as_deref(), &snapshot.id)?;

        self.apply_subscription_snapshot(&record, Some(snapshot), Some(tier_id))
            .await?;
        Ok(EventOutcome::Applied)
    }

    async fn on_subscription_deleted(&self, snapshot: &SubscriptionSnapshot) -> Result<EventOutcome> {
        let record = self.owner_of(snapshot).await?;

        self.apply_subscription_snapshot(&record, None, None).await?;

        tracing::info!(
            user_id = %record.user_id,
            subscription_id = %snapshot.id,
            "Subscription deleted"
        );
        Ok(EventOutcome::Applied)
    }

    /// Invoices only signal that the subscription may have moved; the
    /// embedded status is not trusted.
    async fn on_invoice(&self, invoice: &InvoiceObject) -> Result<EventOutcome> {
        let Some(subscription_id) = &invoice.subscription_id else {
            return Ok(EventOutcome::Ignored(format!(
                "invoice {} has no subscription",
                invoice.id
            )));
        };

        let snapshot = self.gateway.fetch_subscription(subscription_id).await?;
        self.on_subscription_changed(&snapshot).await
    }

    // ===== Reconciliation =====

    /// Re-derive one user's triple from Stripe.
    ///
    /// Catches cancellations whose deletion webhook never arrived. Returns
    /// whether the stored triple changed.
    pub async fn reconcile_user(&self, user_id: UserId) -> Result<bool> {
        let record = self.record(user_id).await?;
        let Some(triple) = record.subscription.clone() else {
            return Ok(false);
        };

        let snapshot = match self.gateway.fetch_subscription(&triple.subscription_id).await {
            Ok(snapshot) => Some(snapshot),
            Err(BillingError::GatewayNotFound(_)) => None,
            Err(e) => return Err(e),
        };

        match snapshot {
            Some(snapshot) if !snapshot.status.is_terminal() => {
                let tier_id = snapshot
                    .tier_id
                    .as_deref()
                    .and_then(|id| self.catalog.get(id))
                    .map_or(triple.tier_id.as_str(), |tier| tier.id.as_str());
                self.apply_subscription_snapshot(&record, Some(&snapshot), Some(tier_id))
                    .await
            }
            _ => self.apply_subscription_snapshot(&record, None, None).await,
        }
    }

    /// Reconcile every subscribed user. Returns how many records changed.
    ///
    /// A failure for one user is logged and does not stop the sweep.
    pub async fn reconcile_all(&self) -> Result<usize> {
        let users = self.store.subscribed_users().await?;
        let mut changed = 0;

        for user in &users {
            match self.reconcile_user(user.user_id).await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(user_id = %user.user_id, error = %e, "Reconciliation failed");
                }
            }
        }

        tracing::info!(checked = users.len(), changed, "Reconciliation finished");
        Ok(changed)
    }

    // ===== Triple Writer =====

    /// The only place the subscription triple is written.
    ///
    /// `None` clears the triple. Writing a triple equal to the stored one is
    /// skipped, so replays leave the record untouched. Returns whether a
    /// write happened.
    async fn apply_subscription_snapshot(
        &self,
        record: &UserBillingRecord,
        snapshot: Option<&SubscriptionSnapshot>,
        tier_id: Option<&str>,
    ) -> Result<bool> {
        let triple = match (snapshot, tier_id) {
            (Some(snapshot), Some(tier_id)) => Some(SubscriptionTriple {
                subscription_id: snapshot.id.clone(),
                tier_id: tier_id.to_string(),
                status: snapshot.status,
            }),
            _ => None,
        };

        if record.subscription == triple {
            tracing::debug!(user_id = %record.user_id, "Subscription triple unchanged");
            return Ok(false);
        }

        self.store.set_subscription(record.user_id, triple.clone()).await?;

        match &triple {
            Some(t) => tracing::info!(
                user_id = %record.user_id,
                subscription_id = %t.subscription_id,
                tier_id = %t.tier_id,
                status = %t.status,
                "Subscription triple updated"
            ),
            None => tracing::info!(user_id = %record.user_id, "Subscription triple cleared"),
        }

        Ok(true)
    }

    // ===== Helpers =====

    async fn record(&self, user_id: UserId) -> Result<UserBillingRecord> {
        self.store
            .get(user_id)
            .await?
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))
    }

    /// The user a subscription event belongs to.
    ///
    /// A user whose customer was recreated still holds subscriptions under
    /// the old customer, so the stored subscription id is checked too.
    async fn owner_of(&self, snapshot: &SubscriptionSnapshot) -> Result<UserBillingRecord> {
        if let Some(record) = self.store.find_by_customer(&snapshot.customer_id).await? {
            return Ok(record);
        }

        if let Some(record) = self.store.find_by_subscription(&snapshot.id).await? {
            tracing::debug!(
                user_id = %record.user_id,
                subscription_id = %snapshot.id,
                customer_id = %snapshot.customer_id,
                "Subscription attributed through stored subscription id"
            );
            return Ok(record);
        }

        Err(BillingError::OrphanEvent(format!(
            "subscription {} belongs to unknown customer {}",
            snapshot.id, snapshot.customer_id
        )))
    }

    fn known_tier<'a>(&'a self, tier_id: Option<&str>, source: &str) -> Result<&'a str> {
        let tier_id = tier_id
            .ok_or_else(|| BillingError::AttributionMissing(format!("{source} has no tier_id")))?;

        self.catalog
            .get(tier_id)
            .map(|tier| tier.id.as_str())
            .ok_or_else(|| BillingError::AttributionMissing(format!("{source} has unknown tier {tier_id}")))
    }
}
