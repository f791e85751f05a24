//! Billing Configuration

use crate::error::{BillingError, Result};

/// Default tolerance between a webhook's signed timestamp and our clock
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// Default size of the Postgres connection pool
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

/// Stripe credentials and billing settings
#[derive(Clone, Debug)]
pub struct BillingConfig {
    pub stripe_secret_key: String,
    pub webhook_secret: String,
    pub webhook_tolerance_secs: i64,

    /// Origin used for checkout redirects when the request has none
    pub public_base_url: Option<String>,
}

impl BillingConfig {
    pub fn new(stripe_secret_key: impl Into<String>, webhook_secret: impl Into<String>) -> Self {
        Self {
            stripe_secret_key: stripe_secret_key.into(),
            webhook_secret: webhook_secret.into(),
            webhook_tolerance_secs: DEFAULT_WEBHOOK_TOLERANCE_SECS,
            public_base_url: None,
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        let secret_key = require("STRIPE_SECRET_KEY")?;
        let webhook_secret = require("STRIPE_WEBHOOK_SECRET")?;

        let webhook_tolerance_secs = match std::env::var("WEBHOOK_TOLERANCE_SECS") {
            Ok(raw) => raw.trim().parse().map_err(|_| {
                BillingError::Config(format!("WEBHOOK_TOLERANCE_SECS is not a number: {raw}"))
            })?,
            Err(_) => DEFAULT_WEBHOOK_TOLERANCE_SECS,
        };

        let public_base_url = std::env::var("PUBLIC_BASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        Ok(Self {
            stripe_secret_key: secret_key,
            webhook_secret,
            webhook_tolerance_secs,
            public_base_url,
        })
    }
}

/// Durable billing record storage
#[derive(Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: DEFAULT_DB_MAX_CONNECTIONS,
        }
    }

    /// Create from `DATABASE_URL` and `DATABASE_MAX_CONNECTIONS`
    pub fn from_env() -> Result<Self> {
        let database_url = require("DATABASE_URL")?;

        let max_connections = match std::env::var("DATABASE_MAX_CONNECTIONS") {
            Ok(raw) => raw.trim().parse().map_err(|_| {
                BillingError::Config(format!("DATABASE_MAX_CONNECTIONS is not a number: {raw}"))
            })?,
            Err(_) => DEFAULT_DB_MAX_CONNECTIONS,
        };

        Ok(Self {
            database_url,
            max_connections,
        })
    }
}

fn require(key: &str) -> Result<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| BillingError::Config(format!("{key} not set")))
}
