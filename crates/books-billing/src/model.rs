//! Billing Records and Provider Snapshots
//!
//! Everything the rest of the crate reads from Stripe is narrowed into the
//! types here before it leaves the gateway or webhook boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Metadata key carrying the local user id on Stripe objects
pub const META_USER_ID: &str = "user_id";

/// Metadata key carrying the tier id on Stripe objects
pub const META_TIER_ID: &str = "tier_id";

/// Local user identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Subscription status as reported by Stripe
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
}

impl SubscriptionStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Unpaid => "unpaid",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Paused => "paused",
        }
    }

    /// The subscription can no longer become active again
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::IncompleteExpired)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "trialing" => Ok(Self::Trialing),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            "unpaid" => Ok(Self::Unpaid),
            "incomplete" => Ok(Self::Incomplete),
            "incomplete_expired" => Ok(Self::IncompleteExpired),
            "paused" => Ok(Self::Paused),
            other => Err(format!("unknown subscription status: {other}")),
        }
    }
}

/// Subscription id, tier id and status, always written together
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionTriple {
    pub subscription_id: String,
    pub tier_id: String,
    pub status: SubscriptionStatus,
}

/// Per-user billing record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBillingRecord {
    pub user_id: UserId,

    /// Identity asserted by the OAuth provider
    pub subject: String,
    pub email: Option<String>,
    pub name: Option<String>,

    /// Stripe customer id
    pub billing_customer_id: Option<String>,

    /// `None` means no subscription
    pub subscription: Option<SubscriptionTriple>,

    pub updated_at: DateTime<Utc>,
}

impl UserBillingRecord {
    pub fn new(subject: impl Into<String>, email: Option<String>, name: Option<String>) -> Self {
        Self {
            user_id: UserId::generate(),
            subject: subject.into(),
            email,
            name,
            billing_customer_id: None,
            subscription: None,
            updated_at: Utc::now(),
        }
    }

    pub fn active_subscription_id(&self) -> Option<&str> {
        self.subscription.as_ref().map(|s| s.subscription_id.as_str())
    }

    pub fn tier_id(&self) -> Option<&str> {
        self.subscription.as_ref().map(|s| s.tier_id.as_str())
    }

    pub fn subscription_status(&self) -> Option<SubscriptionStatus> {
        self.subscription.as_ref().map(|s| s.status)
    }
}

/// Fields we consume from a Stripe subscription
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSnapshot {
    pub id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,

    /// `tier_id` from the subscription's own metadata
    pub tier_id: Option<String>,

    /// `user_id` from the subscription's own metadata
    pub user_id: Option<String>,

    pub current_period_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
}

/// Invoice line in the billing history
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceSummary {
    pub id: String,

    /// Amount paid in cents
    pub amount: i64,
    pub currency: String,
    pub status: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub invoice_pdf: Option<String>,
    pub hosted_invoice_url: Option<String>,
}

/// Hosted checkout session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

/// Redirect targets for a hosted checkout
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckoutUrls {
    pub success_url: String,
    pub cancel_url: String,
}

impl CheckoutUrls {
    /// Dashboard on success, pricing section on cancel.
    ///
    /// `{CHECKOUT_SESSION_ID}` is substituted by Stripe.
    pub fn for_origin(origin: &str) -> Self {
        let origin = origin.trim_end_matches('/');
        Self {
            success_url: format!("{origin}/dashboard?session_id={{CHECKOUT_SESSION_ID}}"),
            cancel_url: format!("{origin}/#pricing"),
        }
    }
}

/// Convert a Stripe unix timestamp
pub fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_with_provider_strings() {
        for raw in ["active", "trialing", "past_due", "canceled", "unpaid", "paused"] {
            let status: SubscriptionStatus = raw.parse().unwrap();
            assert_eq!(status.as_str(), raw);
        }
        assert!("bogus".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn test_status_serde_matches_provider() {
        let json = serde_json::to_string(&SubscriptionStatus::PastDue).unwrap();
        assert_eq!(json, "\"past_due\"");
    }

    #[test]
    fn test_new_record_has_no_subscription() {
        let record = UserBillingRecord::new("oauth|42", Some("a@b.co".into()), None);
        assert!(record.billing_customer_id.is_none());
        assert!(record.active_subscription_id().is_none());
        assert!(record.tier_id().is_none());
        assert!(record.subscription_status().is_none());
    }

    #[test]
    fn test_triple_accessors() {
        let mut record = UserBillingRecord::new("oauth|42", None, None);
        record.subscription = Some(SubscriptionTriple {
            subscription_id: "sub_1".into(),
            tier_id: "scale".into(),
            status: SubscriptionStatus::Trialing,
        });
        assert_eq!(record.active_subscription_id(), Some("sub_1"));
        assert_eq!(record.tier_id(), Some("scale"));
        assert_eq!(record.subscription_status(), Some(SubscriptionStatus::Trialing));
    }

    #[test]
    fn test_user_id_parse() {
        let id = UserId::generate();
        let parsed: UserId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<UserId>().is_err());
    }

    #[test]
    fn test_checkout_urls() {
        let urls = CheckoutUrls::for_origin("https://books.example.com/");
        assert_eq!(
            urls.success_url,
            "https://books.example.com/dashboard?session_id={CHECKOUT_SESSION_ID}"
        );
        assert_eq!(urls.cancel_url, "https://books.example.com/#pricing");
    }
}
