//! Billing Error Types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, BillingError>;

/// Billing-related errors
#[derive(Error, Debug)]
pub enum BillingError {
    /// Tier id is not in the catalog
    #[error("Invalid tier: {0}")]
    InvalidTier(String),

    /// Action needs a subscription the user does not have
    #[error("No active subscription")]
    NoActiveSubscription,

    /// Transient failure talking to Stripe
    #[error("Billing provider unavailable: {0}")]
    GatewayUnavailable(String),

    /// Stripe answered, but the referenced object does not exist
    #[error("Billing provider object not found: {0}")]
    GatewayNotFound(String),

    /// Event lacks the metadata needed to attribute it to a user or tier
    #[error("Attribution missing: {0}")]
    AttributionMissing(String),

    /// Webhook signature verification failed
    #[error("Webhook signature invalid: {0}")]
    SignatureInvalid(String),

    /// Event references a customer with no matching local user
    #[error("Orphan event: {0}")]
    OrphanEvent(String),

    /// Webhook payload parsing failed
    #[error("Webhook parse error: {0}")]
    WebhookParse(String),

    /// Local user record not found
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),
}

impl BillingError {
    /// Check if this error is retryable
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::GatewayUnavailable(_) | Self::Storage(_))
    }

    /// Webhook errors that are acknowledged to Stripe instead of redelivered.
    ///
    /// Redelivery cannot repair missing metadata or a customer we never saw.
    pub const fn is_acknowledged(&self) -> bool {
        matches!(self, Self::AttributionMissing(_) | Self::OrphanEvent(_))
    }

    /// Get user-friendly message
    pub const fn user_message(&self) -> &str {
        match self {
            Self::InvalidTier(_) => "That pricing tier does not exist.",
            Self::NoActiveSubscription => "No active subscription found.",
            Self::GatewayUnavailable(_) => "Payment processing failed. Please try again.",
            Self::GatewayNotFound(_) => "The billing record could not be found.",
            Self::SignatureInvalid(_) => "Invalid signature.",
            Self::UserNotFound(_) => "Account not found.",
            Self::Config(_) => "Service configuration error.",
            _ => "An error occurred processing your request.",
        }
    }
}

impl From<anyhow::Error> for BillingError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
