//! books-server
//!
//! Axum server for subscription billing: checkout, subscription management,
//! billing history and the Stripe webhook endpoint.

mod auth;
mod handlers;
mod state;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use books_billing::{
    BillingConfig, BillingStore, MemoryBillingStore, PgBillingStore, StoreConfig, StripeGateway,
    SubscriptionSync, TierCatalog, WebhookVerifier,
};

use crate::handlers::{
    billing_history, cancel_subscription, create_checkout, get_subscription, health_check,
    list_tiers, stripe_webhook, update_subscription,
};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    let catalog = Arc::new(TierCatalog::standard());

    // Initialize storage
    let durable = match StoreConfig::from_env() {
        Ok(config) => {
            let store = PgBillingStore::connect(&config).await?;
            store.migrate().await?;
            Some(Arc::new(store))
        }
        Err(e) => {
            tracing::warn!(error = %e, "No database configured - billing records are not durable");
            None
        }
    };
    let store: Arc<dyn BillingStore> = match &durable {
        Some(store) => store.clone(),
        None => Arc::new(MemoryBillingStore::new()),
    };

    // Initialize billing; customer ids must survive restarts
    let (sync, webhooks, public_base_url) = match (BillingConfig::from_env(), durable) {
        (Ok(config), Some(durable)) => {
            tracing::info!("Stripe configured");
            let sync = SubscriptionSync::new(
                catalog.clone(),
                Arc::new(StripeGateway::from_config(&config)),
                durable,
            );
            (
                Some(Arc::new(sync)),
                Some(Arc::new(WebhookVerifier::from_config(&config))),
                config.public_base_url,
            )
        }
        (Ok(config), None) => {
            tracing::warn!("Stripe configured but DATABASE_URL is not set - payments disabled");
            (None, None, config.public_base_url)
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Stripe not configured - payments disabled");
            tracing::warn!("Set STRIPE_SECRET_KEY and STRIPE_WEBHOOK_SECRET in .env");
            (None, None, std::env::var("PUBLIC_BASE_URL").ok())
        }
    };

    if let (Some(sync), Some(interval)) = (sync.clone(), reconcile_interval()?) {
        tracing::info!(interval_secs = interval.as_secs(), "Periodic reconciliation enabled");
        tokio::spawn(reconcile_loop(sync, interval));
    }

    let state = AppState {
        store,
        catalog,
        sync,
        webhooks,
        public_base_url,
    };

    let app = router(state);

    // Start server
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("books-server running on http://{}", addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health                          - Health check");
    tracing::info!("  GET  /api/billing/tiers               - Pricing tiers");
    tracing::info!("  POST /api/billing/checkout            - Start checkout");
    tracing::info!("  GET  /api/billing/subscription        - Current subscription");
    tracing::info!("  POST /api/billing/subscription/cancel - Cancel subscription");
    tracing::info!("  POST /api/billing/subscription/tier   - Change tier");
    tracing::info!("  GET  /api/billing/invoices            - Billing history");
    tracing::info!("  POST /api/stripe/webhook              - Stripe webhooks");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(health_check))

        // Billing API
        .route("/api/billing/tiers", get(list_tiers))
        .route("/api/billing/checkout", post(create_checkout))
        .route("/api/billing/subscription", get(get_subscription))
        .route("/api/billing/subscription/cancel", post(cancel_subscription))
        .route("/api/billing/subscription/tier", post(update_subscription))
        .route("/api/billing/invoices", get(billing_history))

        // Stripe (raw body, no JSON extractor)
        .route("/api/stripe/webhook", post(stripe_webhook))

        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

/// `RECONCILE_INTERVAL_SECS`, unset or 0 disables the sweep
fn reconcile_interval() -> anyhow::Result<Option<Duration>> {
    match std::env::var("RECONCILE_INTERVAL_SECS") {
        Ok(raw) => {
            let secs: u64 = raw
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("RECONCILE_INTERVAL_SECS is not a number: {raw}"))?;
            Ok((secs > 0).then_some(Duration::from_secs(secs)))
        }
        Err(_) => Ok(None),
    }
}

async fn reconcile_loop(sync: Arc<SubscriptionSync>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if let Err(e) = sync.reconcile_all().await {
            tracing::error!(error = %e, "Reconciliation sweep failed");
        }
    }
}
