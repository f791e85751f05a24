//! Stripe Webhook Verification and Decoding
//!
//! Deliveries are verified against the endpoint secret before anything in the
//! body is trusted, then narrowed into [`EventPayload`]. Only the fields the
//! synchronizer consumes survive decoding.

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;

use crate::config::BillingConfig;
use crate::error::{BillingError, Result};
use crate::model::{META_TIER_ID, META_USER_ID, SubscriptionSnapshot, SubscriptionStatus, timestamp};

type HmacSha256 = Hmac<Sha256>;

/// Id prefix of Stripe's synthetic endpoint-check events
pub const TEST_EVENT_PREFIX: &str = "evt_test_";

/// Verifies `Stripe-Signature` headers
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish_non_exhaustive()
    }
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    pub fn from_config(config: &BillingConfig) -> Self {
        Self::new(config.webhook_secret.clone(), config.webhook_tolerance_secs)
    }

    /// Verify a delivery against the current clock and parse its envelope
    pub fn verify(&self, payload: &[u8], signature_header: &str) -> Result<WebhookEvent> {
        self.verify_at(payload, signature_header, Utc::now().timestamp())
    }

    /// Verify a delivery as of `now` (unix seconds)
    pub fn verify_at(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: i64,
    ) -> Result<WebhookEvent> {
        let header = SignatureHeader::parse(signature_header)?;

        // `t` is unauthenticated here; abs_diff cannot overflow
        if now.abs_diff(header.timestamp) > self.tolerance_secs.unsigned_abs() {
            tracing::warn!(
                timestamp = header.timestamp,
                now,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::SignatureInvalid(
                "timestamp outside tolerance".into(),
            ));
        }

        let matched = header
            .signatures
            .iter()
            .any(|candidate| self.matches(header.timestamp, payload, candidate));
        if !matched {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::SignatureInvalid(
                "no signature matches the payload".into(),
            ));
        }

        WebhookEvent::parse(payload)
    }

    fn matches(&self, timestamp: i64, payload: &[u8], candidate: &str) -> bool {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
            return false;
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    }
}

/// Build a `Stripe-Signature` header value for a payload.
///
/// Used to sign fixtures and replayed deliveries.
pub fn signature_header(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let signature = HmacSha256::new_from_slice(secret.as_bytes()).map_or_else(
        |_| String::new(),
        |mut mac| {
            mac.update(timestamp.to_string().as_bytes());
            mac.update(b".");
            mac.update(payload);
            hex::encode(mac.finalize().into_bytes())
        },
    );
    format!("t={timestamp},v1={signature}")
}

struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<String>,
}

impl SignatureHeader {
    /// Parse `t=<unix>,v1=<hex>[,v1=<hex>][,v0=<hex>]`
    fn parse(raw: &str) -> Result<Self> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in raw.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => timestamp = value.parse::<i64>().ok(),
                "v1" => signatures.push(value.to_string()),
                _ => {}
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| BillingError::SignatureInvalid("missing timestamp".into()))?;
        if signatures.is_empty() {
            return Err(BillingError::SignatureInvalid("missing v1 signature".into()));
        }

        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

// ===== Event Envelope =====

/// A verified delivery
#[derive(Clone, Debug)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub created: i64,

    /// `data.object`, still undecoded
    pub object: serde_json::Value,
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: i64,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

impl WebhookEvent {
    fn parse(payload: &[u8]) -> Result<Self> {
        let raw: RawEvent = serde_json::from_slice(payload)
            .map_err(|e| BillingError::WebhookParse(format!("event envelope: {e}")))?;

        Ok(Self {
            id: raw.id,
            event_type: raw.event_type,
            created: raw.created,
            object: raw.data.object,
        })
    }

    /// Synthetic event sent to check the endpoint is reachable
    pub fn is_test(&self) -> bool {
        self.id.starts_with(TEST_EVENT_PREFIX)
    }

    /// Narrow `data.object` by event type
    pub fn decode(&self) -> Result<EventPayload> {
        let payload = match self.event_type.as_str() {
            "checkout.session.completed" => {
                EventPayload::CheckoutCompleted(decode_object::<RawCheckoutSession>(&self.object)?.into())
            }
            "customer.subscription.created" | "customer.subscription.updated" => {
                EventPayload::SubscriptionChanged(decode_object::<RawSubscription>(&self.object)?.try_into()?)
            }
            "customer.subscription.deleted" => {
                EventPayload::SubscriptionDeleted(decode_object::<RawSubscription>(&self.object)?.try_into()?)
            }
            "invoice.paid" => {
                EventPayload::InvoicePaid(decode_object::<RawInvoice>(&self.object)?.into())
            }
            "invoice.payment_failed" => {
                EventPayload::InvoicePaymentFailed(decode_object::<RawInvoice>(&self.object)?.into())
            }
            other => EventPayload::Other(other.to_string()),
        };
        Ok(payload)
    }
}

fn decode_object<T: for<'de> Deserialize<'de>>(object: &serde_json::Value) -> Result<T> {
    T::deserialize(object).map_err(|e| BillingError::WebhookParse(e.to_string()))
}

// ===== Decoded Payloads =====

/// Event payloads the synchronizer acts on
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventPayload {
    CheckoutCompleted(CheckoutSessionObject),
    SubscriptionChanged(SubscriptionSnapshot),
    SubscriptionDeleted(SubscriptionSnapshot),
    InvoicePaid(InvoiceObject),
    InvoicePaymentFailed(InvoiceObject),

    /// Event type we do not handle
    Other(String),
}

/// Completed checkout session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckoutSessionObject {
    pub id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub user_id: Option<String>,
    pub tier_id: Option<String>,
}

/// Invoice reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvoiceObject {
    pub id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
}

/// Stripe references are either a bare id or an expanded object
#[derive(Deserialize)]
#[serde(untagged)]
enum ExpandableRef {
    Id(String),
    Object { id: String },
}

impl ExpandableRef {
    fn into_id(self) -> String {
        match self {
            Self::Id(id) | Self::Object { id } => id,
        }
    }
}

#[derive(Deserialize)]
struct RawCheckoutSession {
    id: String,
    customer: Option<ExpandableRef>,
    subscription: Option<ExpandableRef>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

impl From<RawCheckoutSession> for CheckoutSessionObject {
    fn from(raw: RawCheckoutSession) -> Self {
        let mut metadata = raw.metadata.unwrap_or_default();
        Self {
            id: raw.id,
            customer_id: raw.customer.map(ExpandableRef::into_id),
            subscription_id: raw.subscription.map(ExpandableRef::into_id),
            user_id: non_empty(metadata.remove(META_USER_ID)),
            tier_id: non_empty(metadata.remove(META_TIER_ID)),
        }
    }
}

#[derive(Deserialize)]
struct RawSubscription {
    id: String,
    customer: ExpandableRef,
    status: String,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
    current_period_end: Option<i64>,
    items: Option<RawList<RawSubscriptionItem>>,
    #[serde(default)]
    cancel_at_period_end: bool,
    canceled_at: Option<i64>,
}

#[derive(Deserialize)]
struct RawList<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Deserialize)]
struct RawSubscriptionItem {
    current_period_end: Option<i64>,
}

impl TryFrom<RawSubscription> for SubscriptionSnapshot {
    type Error = BillingError;

    fn try_from(raw: RawSubscription) -> Result<Self> {
        let status: SubscriptionStatus = raw.status.parse().map_err(BillingError::WebhookParse)?;
        let mut metadata = raw.metadata.unwrap_or_default();

        // Newer API versions moved the period onto the items
        let period_end = raw.current_period_end.or_else(|| {
            raw.items
                .and_then(|items| items.data.into_iter().find_map(|i| i.current_period_end))
        });

        Ok(Self {
            id: raw.id,
            customer_id: raw.customer.into_id(),
            status,
            tier_id: non_empty(metadata.remove(META_TIER_ID)),
            user_id: non_empty(metadata.remove(META_USER_ID)),
            current_period_end: period_end.and_then(timestamp),
            cancel_at_period_end: raw.cancel_at_period_end,
            canceled_at: raw.canceled_at.and_then(timestamp),
        })
    }
}

#[derive(Deserialize)]
struct RawInvoice {
    id: String,
    customer: Option<ExpandableRef>,
    subscription: Option<ExpandableRef>,
    parent: Option<RawInvoiceParent>,
}

#[derive(Deserialize)]
struct RawInvoiceParent {
    subscription_details: Option<RawSubscriptionDetails>,
}

#[derive(Deserialize)]
struct RawSubscriptionDetails {
    subscription: Option<ExpandableRef>,
}

impl From<RawInvoice> for InvoiceObject {
    fn from(raw: RawInvoice) -> Self {
        let subscription = raw.subscription.or_else(|| {
            raw.parent
                .and_then(|p| p.subscription_details)
                .and_then(|d| d.subscription)
        });

        Self {
            id: raw.id,
            customer_id: raw.customer.map(ExpandableRef::into_id),
            subscription_id: subscription.map(ExpandableRef::into_id),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_700_000_000;

    fn event(id: &str, kind: &str, object: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": id,
            "object": "event",
            "type": kind,
            "created": NOW,
            "data": { "object": object },
        }))
        .unwrap()
    }

    fn verifier() -> WebhookVerifier {
        WebhookVerifier::new(SECRET, 300)
    }

    #[test]
    fn test_valid_signature() {
        let payload = event("evt_1", "invoice.paid", json!({"id": "in_1"}));
        let header = signature_header(SECRET, NOW, &payload);

        let verified = verifier().verify_at(&payload, &header, NOW + 10).unwrap();
        assert_eq!(verified.id, "evt_1");
        assert_eq!(verified.event_type, "invoice.paid");
        assert!(!verified.is_test());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = event("evt_1", "invoice.paid", json!({"id": "in_1"}));
        let header = signature_header("whsec_other", NOW, &payload);

        let result = verifier().verify_at(&payload, &header, NOW);
        assert!(matches!(result, Err(BillingError::SignatureInvalid(_))));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let payload = event("evt_1", "invoice.paid", json!({"id": "in_1"}));
        let header = signature_header(SECRET, NOW, &payload);
        let tampered = event("evt_1", "invoice.paid", json!({"id": "in_2"}));

        let result = verifier().verify_at(&tampered, &header, NOW);
        assert!(matches!(result, Err(BillingError::SignatureInvalid(_))));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = event("evt_1", "invoice.paid", json!({"id": "in_1"}));
        let header = signature_header(SECRET, NOW, &payload);

        let result = verifier().verify_at(&payload, &header, NOW + 301);
        assert!(matches!(result, Err(BillingError::SignatureInvalid(_))));
    }

    #[test]
    fn test_malformed_headers_rejected() {
        let payload = event("evt_1", "invoice.paid", json!({"id": "in_1"}));
        let no_signature = format!("t={NOW}");
        for header in ["", "t=abc,v1=00", no_signature.as_str(), "v1=deadbeef"] {
            let result = verifier().verify_at(&payload, header, NOW);
            assert!(
                matches!(result, Err(BillingError::SignatureInvalid(_))),
                "header {header:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_extreme_timestamps_rejected() {
        let payload = event("evt_1", "invoice.paid", json!({"id": "in_1"}));

        for t in [i64::MIN, i64::MIN + 1, -1, i64::MAX] {
            let unsigned = format!("t={t},v1=00");
            let result = verifier().verify_at(&payload, &unsigned, NOW);
            assert!(
                matches!(result, Err(BillingError::SignatureInvalid(_))),
                "timestamp {t} should be rejected"
            );

            // Correctly signed, still far outside tolerance
            let signed = signature_header(SECRET, t, &payload);
            let result = verifier().verify_at(&payload, &signed, NOW);
            assert!(matches!(result, Err(BillingError::SignatureInvalid(_))));
        }

        let header = signature_header(SECRET, NOW, &payload);
        for now in [i64::MIN, i64::MAX] {
            let result = verifier().verify_at(&payload, &header, now);
            assert!(matches!(result, Err(BillingError::SignatureInvalid(_))));
        }
    }

    #[test]
    fn test_any_v1_may_match() {
        let payload = event("evt_1", "invoice.paid", json!({"id": "in_1"}));
        let good = signature_header(SECRET, NOW, &payload);
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={NOW},v1=00ff,v1={good_sig},v0=abc");

        assert!(verifier().verify_at(&payload, &header, NOW).is_ok());
    }

    #[test]
    fn test_unparseable_envelope_after_valid_signature() {
        let payload = b"not json".to_vec();
        let header = signature_header(SECRET, NOW, &payload);

        let result = verifier().verify_at(&payload, &header, NOW);
        assert!(matches!(result, Err(BillingError::WebhookParse(_))));
    }

    #[test]
    fn test_test_event_prefix() {
        let payload = event("evt_test_webhook", "ping", json!({}));
        let header = signature_header(SECRET, NOW, &payload);

        let verified = verifier().verify_at(&payload, &header, NOW).unwrap();
        assert!(verified.is_test());
    }

    fn parsed(kind: &str, object: serde_json::Value) -> WebhookEvent {
        WebhookEvent::parse(&event("evt_1", kind, object)).unwrap()
    }

    #[test]
    fn test_decode_checkout_completed() {
        let decoded = parsed(
            "checkout.session.completed",
            json!({
                "id": "cs_1",
                "customer": "cus_1",
                "subscription": "sub_1",
                "metadata": {"user_id": "u-1", "tier_id": "startups"},
                "client_reference_id": "u-1",
            }),
        )
        .decode()
        .unwrap();

        assert_eq!(
            decoded,
            EventPayload::CheckoutCompleted(CheckoutSessionObject {
                id: "cs_1".into(),
                customer_id: Some("cus_1".into()),
                subscription_id: Some("sub_1".into()),
                user_id: Some("u-1".into()),
                tier_id: Some("startups".into()),
            })
        );
    }

    #[test]
    fn test_decode_subscription_with_item_period() {
        let decoded = parsed(
            "customer.subscription.updated",
            json!({
                "id": "sub_1",
                "customer": {"id": "cus_1", "object": "customer"},
                "status": "past_due",
                "metadata": {"tier_id": "scale"},
                "items": {"data": [{"id": "si_1", "current_period_end": NOW}]},
                "cancel_at_period_end": true,
                "canceled_at": null,
            }),
        )
        .decode()
        .unwrap();

        let EventPayload::SubscriptionChanged(snapshot) = decoded else {
            panic!("expected subscription change");
        };
        assert_eq!(snapshot.customer_id, "cus_1");
        assert_eq!(snapshot.status, SubscriptionStatus::PastDue);
        assert_eq!(snapshot.tier_id.as_deref(), Some("scale"));
        assert!(snapshot.user_id.is_none());
        assert_eq!(snapshot.current_period_end, timestamp(NOW));
        assert!(snapshot.cancel_at_period_end);
    }

    #[test]
    fn test_decode_unknown_status_fails() {
        let result = parsed(
            "customer.subscription.deleted",
            json!({"id": "sub_1", "customer": "cus_1", "status": "exploded"}),
        )
        .decode();
        assert!(matches!(result, Err(BillingError::WebhookParse(_))));
    }

    #[test]
    fn test_decode_invoice_subscription_locations() {
        let legacy = parsed(
            "invoice.paid",
            json!({"id": "in_1", "customer": "cus_1", "subscription": "sub_1"}),
        )
        .decode()
        .unwrap();
        let nested = parsed(
            "invoice.payment_failed",
            json!({
                "id": "in_2",
                "customer": "cus_1",
                "parent": {"subscription_details": {"subscription": "sub_2"}},
            }),
        )
        .decode()
        .unwrap();
        let one_off = parsed("invoice.paid", json!({"id": "in_3", "customer": "cus_1"}))
            .decode()
            .unwrap();

        assert!(matches!(
            legacy,
            EventPayload::InvoicePaid(InvoiceObject { subscription_id: Some(ref s), .. }) if s == "sub_1"
        ));
        assert!(matches!(
            nested,
            EventPayload::InvoicePaymentFailed(InvoiceObject { subscription_id: Some(ref s), .. }) if s == "sub_2"
        ));
        assert!(matches!(
            one_off,
            EventPayload::InvoicePaid(InvoiceObject { subscription_id: None, .. })
        ));
    }

    #[test]
    fn test_decode_other_event() {
        let decoded = parsed("customer.created", json!({"id": "cus_1"})).decode().unwrap();
        assert_eq!(decoded, EventPayload::Other("customer.created".into()));
    }
}
