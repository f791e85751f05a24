//! HTTP Handlers

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use books_billing::{
    BillingError, CheckoutUrls, EventOutcome, InvoiceSummary, SubscriptionStatus,
    SubscriptionSync, Tier,
};

use crate::auth::AuthUser;
use crate::state::AppState;

type ApiError = (StatusCode, Json<ErrorResponse>);

// ===== Request/Response Types =====

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub stripe_configured: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutRequest {
    pub tier_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResponse {
    pub id: String,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<i64>,
    pub cancel_at_period_end: bool,
    pub tier_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub id: String,
    pub status: SubscriptionStatus,
    pub canceled_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSubscriptionRequest {
    pub new_tier_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSubscriptionResponse {
    pub id: String,
    pub status: SubscriptionStatus,
    pub tier_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,

    /// Set for Stripe's endpoint-check events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
}

// ===== Handlers =====

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        stripe_configured: state.sync.is_some(),
    })
}

/// Published pricing tiers (no sign-in needed)
pub async fn list_tiers(State(state): State<AppState>) -> Json<Vec<Tier>> {
    Json(state.catalog.tiers().to_vec())
}

/// Start a hosted checkout for a tier
pub async fn create_checkout(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
    Json(payload): Json<CreateCheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let sync = billing(&state)?;
    let origin = checkout_origin(&headers, &state)?;

    tracing::debug!(subject = %user.subject, tier_id = %payload.tier_id, "Checkout requested");

    let session = sync
        .request_checkout(user.user_id, &payload.tier_id, &CheckoutUrls::for_origin(&origin))
        .await
        .map_err(billing_error)?;

    Ok(Json(CheckoutResponse {
        session_id: session.id,
        url: session.url,
    }))
}

/// Current subscription, live from Stripe, or `null`
pub async fn get_subscription(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Option<SubscriptionResponse>>, ApiError> {
    let sync = billing(&state)?;

    let snapshot = sync
        .current_subscription(user.user_id)
        .await
        .map_err(billing_error)?;

    Ok(Json(snapshot.map(|s| SubscriptionResponse {
        id: s.id,
        status: s.status,
        current_period_end: s.current_period_end.map(|t| t.timestamp()),
        cancel_at_period_end: s.cancel_at_period_end,
        tier_id: s.tier_id,
    })))
}

/// Cancel the caller's subscription
pub async fn cancel_subscription(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<CancelResponse>, ApiError> {
    let sync = billing(&state)?;

    let snapshot = sync
        .cancel_active_subscription(user.user_id)
        .await
        .map_err(billing_error)?;

    Ok(Json(CancelResponse {
        id: snapshot.id,
        status: snapshot.status,
        canceled_at: snapshot.canceled_at.map(|t| t.timestamp()),
    }))
}

/// Move the caller's subscription to another tier
pub async fn update_subscription(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<UpdateSubscriptionRequest>,
) -> Result<Json<UpdateSubscriptionResponse>, ApiError> {
    let sync = billing(&state)?;

    let snapshot = sync
        .change_subscription_tier(user.user_id, &payload.new_tier_id)
        .await
        .map_err(billing_error)?;

    Ok(Json(UpdateSubscriptionResponse {
        id: snapshot.id,
        status: snapshot.status,
        tier_id: snapshot.tier_id,
    }))
}

/// Recent invoices, newest first
pub async fn billing_history(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<InvoiceSummary>>, ApiError> {
    let sync = billing(&state)?;

    let invoices = sync
        .billing_history(user.user_id)
        .await
        .map_err(billing_error)?;

    Ok(Json(invoices))
}

/// Stripe webhook handler.
///
/// Takes the raw body; the signature covers the exact bytes Stripe sent.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let (Some(sync), Some(verifier)) = (state.sync.as_ref(), state.webhooks.as_ref()) else {
        return Err(payments_disabled());
    };

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "Missing Stripe signature".into(),
                    code: "MISSING_SIGNATURE".into(),
                }),
            )
        })?;

    // Past the signature check every failure is ours, and Stripe should retry
    let event = verifier.verify(&body, signature).map_err(|e| match e {
        BillingError::SignatureInvalid(_) => billing_error(e),
        other => webhook_failure(&other),
    })?;

    match sync.handle_event(&event).await {
        Ok(EventOutcome::TestEventAcknowledged) => Ok(Json(WebhookAck {
            received: true,
            verified: Some(true),
        })),
        Ok(_) => Ok(Json(WebhookAck {
            received: true,
            verified: None,
        })),
        Err(e) => Err(webhook_failure(&e)),
    }
}

// ===== Helpers =====

fn billing(state: &AppState) -> Result<&Arc<SubscriptionSync>, ApiError> {
    state.sync.as_ref().ok_or_else(payments_disabled)
}

fn payments_disabled() -> ApiError {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: "Payments not configured".into(),
            code: "PAYMENTS_DISABLED".into(),
        }),
    )
}

/// Origin for checkout redirects: the request's `Origin`, else the
/// configured public URL
fn checkout_origin(headers: &HeaderMap, state: &AppState) -> Result<String, ApiError> {
    headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && *v != "null")
        .map(str::to_string)
        .or_else(|| state.public_base_url.clone())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "Cannot determine redirect origin".into(),
                    code: "MISSING_ORIGIN".into(),
                }),
            )
        })
}

fn webhook_failure(e: &BillingError) -> ApiError {
    tracing::error!(error = %e, "Webhook processing failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: format!("Webhook processing failed: {e}"),
            code: "WEBHOOK_ERROR".into(),
        }),
    )
}

fn billing_error(e: BillingError) -> ApiError {
    let (status, code) = match &e {
        BillingError::InvalidTier(_) => (StatusCode::BAD_REQUEST, "INVALID_TIER"),
        BillingError::NoActiveSubscription => (StatusCode::CONFLICT, "NO_ACTIVE_SUBSCRIPTION"),
        BillingError::GatewayUnavailable(_) => (StatusCode::BAD_GATEWAY, "GATEWAY_UNAVAILABLE"),
        BillingError::GatewayNotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        BillingError::UserNotFound(_) => (StatusCode::NOT_FOUND, "USER_NOT_FOUND"),
        BillingError::SignatureInvalid(_) => (StatusCode::BAD_REQUEST, "INVALID_SIGNATURE"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    };

    if status.is_server_error() {
        tracing::error!(error = %e, code, "Billing request failed");
    } else {
        tracing::warn!(error = %e, code, "Billing request rejected");
    }

    (
        status,
        Json(ErrorResponse {
            error: e.user_message().into(),
            code: code.into(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::Request};
    use books_billing::{
        BillingStore, MemoryBillingStore, MemoryGateway, TierCatalog, WebhookVerifier,
        signature_header,
    };
    use serde_json::{Value, json};
    use std::time::{SystemTime, UNIX_EPOCH};
    use tower::ServiceExt;

    const SECRET: &str = "whsec_test_secret";
    const ORIGIN: &str = "https://books.example.com";

    struct TestApp {
        router: Router,
        gateway: Arc<MemoryGateway>,
        store: Arc<MemoryBillingStore>,
    }

    fn test_app() -> TestApp {
        let catalog = Arc::new(TierCatalog::standard());
        let gateway = Arc::new(MemoryGateway::new());
        let store = Arc::new(MemoryBillingStore::new());
        let sync = SubscriptionSync::new(catalog.clone(), gateway.clone(), store.clone());

        let state = AppState {
            store: store.clone(),
            catalog,
            sync: Some(Arc::new(sync)),
            webhooks: Some(Arc::new(WebhookVerifier::new(SECRET, 300))),
            public_base_url: None,
        };

        TestApp {
            router: crate::router(state),
            gateway,
            store,
        }
    }

    fn disabled_app() -> Router {
        crate::router(AppState {
            store: Arc::new(MemoryBillingStore::new()),
            catalog: Arc::new(TierCatalog::standard()),
            sync: None,
            webhooks: None,
            public_base_url: None,
        })
    }

    fn authed(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-auth-subject", "oauth|ada")
            .header("x-auth-email", "ada@example.com")
            .header(header::ORIGIN, ORIGIN);

        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    fn webhook(payload: &Value, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/api/stripe/webhook");
        if let Some(signature) = signature {
            builder = builder.header("stripe-signature", signature);
        }
        builder.body(Body::from(payload.to_string())).unwrap()
    }

    fn signed(payload: &Value) -> String {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        signature_header(SECRET, i64::try_from(now).unwrap(), payload.to_string().as_bytes())
    }

    fn event(id: &str, kind: &str, object: Value) -> Value {
        json!({"id": id, "object": "event", "type": kind, "created": 1_700_000_000, "data": {"object": object}})
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app();
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();

        let (status, body) = send(&app.router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stripe_configured"], true);
    }

    #[tokio::test]
    async fn test_tiers_are_public() {
        let router = disabled_app();
        let request = Request::builder().uri("/api/billing/tiers").body(Body::empty()).unwrap();

        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 4);
        assert_eq!(body[0]["id"], "startups");
        assert_eq!(body[0]["monthlyPrice"], 25_000);
    }

    #[tokio::test]
    async fn test_checkout_requires_sign_in() {
        let app = test_app();
        let request = Request::builder()
            .method("POST")
            .uri("/api/billing/checkout")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"tierId": "startups"}).to_string()))
            .unwrap();

        let (status, body) = send(&app.router, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHENTICATED");
        assert_eq!(app.gateway.call_count().await, 0);
    }

    #[tokio::test]
    async fn test_checkout() {
        let app = test_app();
        let request = authed("POST", "/api/billing/checkout", Some(json!({"tierId": "startups"})));

        let (status, body) = send(&app.router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessionId"], "cs_1");
        assert!(body["url"].as_str().unwrap().contains("cs_1"));

        let user = app.store.upsert_user("oauth|ada", None, None).await.unwrap();
        assert_eq!(user.billing_customer_id.as_deref(), Some("cus_1"));
        assert!(user.subscription.is_none());
    }

    #[tokio::test]
    async fn test_checkout_invalid_tier() {
        let app = test_app();
        let request = authed("POST", "/api/billing/checkout", Some(json!({"tierId": "platinum"})));

        let (status, body) = send(&app.router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_TIER");
        assert_eq!(app.gateway.call_count().await, 0);
    }

    #[tokio::test]
    async fn test_checkout_gateway_outage() {
        let app = test_app();
        app.gateway.set_unavailable(true).await;
        let request = authed("POST", "/api/billing/checkout", Some(json!({"tierId": "startups"})));

        let (status, body) = send(&app.router, request).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "GATEWAY_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_payments_disabled() {
        let router = disabled_app();
        let request = authed("POST", "/api/billing/checkout", Some(json!({"tierId": "startups"})));

        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "PAYMENTS_DISABLED");
    }

    #[tokio::test]
    async fn test_subscription_endpoints_without_subscription() {
        let app = test_app();

        let (status, body) = send(&app.router, authed("GET", "/api/billing/subscription", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_null());

        let (status, body) =
            send(&app.router, authed("POST", "/api/billing/subscription/cancel", None)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "NO_ACTIVE_SUBSCRIPTION");

        let (status, body) = send(&app.router, authed("GET", "/api/billing/invoices", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_webhook_missing_signature() {
        let app = test_app();
        let payload = event("evt_1", "customer.created", json!({"id": "cus_1"}));

        let (status, body) = send(&app.router, webhook(&payload, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "MISSING_SIGNATURE");
    }

    #[tokio::test]
    async fn test_webhook_bad_signature_changes_nothing() {
        let app = test_app();
        let user = app.store.upsert_user("oauth|ada", None, None).await.unwrap();
        let payload = event(
            "evt_1",
            "checkout.session.completed",
            json!({"id": "cs_1", "customer": "cus_evil", "metadata": {"user_id": user.user_id.to_string()}}),
        );
        let forged = signature_header("whsec_wrong", 1_700_000_000, payload.to_string().as_bytes());

        let (status, body) = send(&app.router, webhook(&payload, Some(forged))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_SIGNATURE");
        assert_eq!(app.store.write_count(), 0);
        assert_eq!(app.gateway.call_count().await, 0);
    }

    #[tokio::test]
    async fn test_webhook_test_event() {
        let app = test_app();
        let payload = event("evt_test_webhook", "checkout.session.completed", json!({"id": "cs_x"}));

        let (status, body) = send(&app.router, webhook(&payload, Some(signed(&payload)))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"received": true, "verified": true}));
        assert_eq!(app.store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_webhook_orphan_is_acknowledged() {
        let app = test_app();
        let payload = event(
            "evt_1",
            "customer.subscription.deleted",
            json!({"id": "sub_9", "customer": "cus_unknown", "status": "canceled"}),
        );

        let (status, body) = send(&app.router, webhook(&payload, Some(signed(&payload)))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"received": true}));
    }

    #[tokio::test]
    async fn test_webhook_handler_failure_is_500() {
        let app = test_app();
        app.gateway.set_unavailable(true).await;
        let payload = event(
            "evt_1",
            "invoice.paid",
            json!({"id": "in_1", "customer": "cus_1", "subscription": "sub_1"}),
        );

        let (status, body) = send(&app.router, webhook(&payload, Some(signed(&payload)))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "WEBHOOK_ERROR");
    }

    #[tokio::test]
    async fn test_webhook_undecodable_event_is_500() {
        let app = test_app();
        let payload = event(
            "evt_1",
            "customer.subscription.updated",
            json!({"id": "sub_1", "customer": "cus_1", "status": "mystery"}),
        );

        let (status, body) = send(&app.router, webhook(&payload, Some(signed(&payload)))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "WEBHOOK_ERROR");
        assert_eq!(app.store.write_count(), 0);

        // Signed but not an event envelope
        let payload = json!({"hello": "world"});
        let (status, body) = send(&app.router, webhook(&payload, Some(signed(&payload)))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "WEBHOOK_ERROR");
    }

    #[tokio::test]
    async fn test_checkout_to_subscription_flow() {
        let app = test_app();

        let request = authed("POST", "/api/billing/checkout", Some(json!({"tierId": "startups"})));
        let (status, _) = send(&app.router, request).await;
        assert_eq!(status, StatusCode::OK);

        let sub = app
            .gateway
            .complete_checkout("cs_1", SubscriptionStatus::Active)
            .await
            .unwrap();
        let user = app.store.upsert_user("oauth|ada", None, None).await.unwrap();
        let completed = event(
            "evt_2",
            "checkout.session.completed",
            json!({
                "id": "cs_1",
                "customer": "cus_1",
                "subscription": sub.id,
                "metadata": {"user_id": user.user_id.to_string(), "tier_id": "startups"},
            }),
        );

        let (status, _) = send(&app.router, webhook(&completed, Some(signed(&completed)))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app.router, authed("GET", "/api/billing/subscription", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "sub_1");
        assert_eq!(body["status"], "active");
        assert_eq!(body["tierId"], "startups");

        let (status, body) = send(
            &app.router,
            authed("POST", "/api/billing/subscription/tier", Some(json!({"newTierId": "scale"}))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tierId"], "scale");

        let (status, body) =
            send(&app.router, authed("POST", "/api/billing/subscription/cancel", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "canceled");
        assert!(body["canceledAt"].is_i64());
    }
}
