//! Postgres Billing Store
//!
//! One row per user in `user_billing`. The subscription triple lives in three
//! columns written by a single `UPDATE`, and a check constraint keeps them
//! present or absent together.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use uuid::Uuid;

use super::BillingStore;
use crate::config::StoreConfig;
use crate::error::{BillingError, Result};
use crate::model::{SubscriptionTriple, UserBillingRecord, UserId};

const COLUMNS: &str = "user_id, subject, email, name, billing_customer_id, \
                       active_subscription_id, tier_id, subscription_status, updated_at";

#[derive(Debug, FromRow)]
struct BillingRow {
    user_id: Uuid,
    subject: String,
    email: Option<String>,
    name: Option<String>,
    billing_customer_id: Option<String>,
    active_subscription_id: Option<String>,
    tier_id: Option<String>,
    subscription_status: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BillingRow> for UserBillingRecord {
    type Error = BillingError;

    fn try_from(row: BillingRow) -> Result<Self> {
        let subscription = match (row.active_subscription_id, row.tier_id, row.subscription_status) {
            (Some(subscription_id), Some(tier_id), Some(status)) => Some(SubscriptionTriple {
                subscription_id,
                tier_id,
                status: status.parse().map_err(BillingError::Storage)?,
            }),
            (None, None, None) => None,
            _ => {
                return Err(BillingError::Storage(format!(
                    "partial subscription triple for user {}",
                    row.user_id
                )));
            }
        };

        Ok(Self {
            user_id: UserId::from_uuid(row.user_id),
            subject: row.subject,
            email: row.email,
            name: row.name,
            billing_customer_id: row.billing_customer_id,
            subscription,
            updated_at: row.updated_at,
        })
    }
}

fn db_error(operation: &'static str) -> impl FnOnce(sqlx::Error) -> BillingError {
    move |e| BillingError::Storage(format!("{operation}: {e}"))
}

/// Postgres-backed billing store
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        tracing::info!(max_connections = config.max_connections, "Connecting to PostgreSQL");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.database_url)
            .await
            .map_err(db_error("connect"))?;

        tracing::info!("PostgreSQL connection pool established");
        Ok(Self::new(pool))
    }

    /// Create or upgrade the `user_billing` table
    pub async fn migrate(&self) -> Result<()> {
        tracing::info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BillingError::Storage(format!("migrate: {e}")))?;
        tracing::info!("Database migrations completed");
        Ok(())
    }

    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_one_where(
        &self,
        operation: &'static str,
        predicate: &str,
        value: &str,
    ) -> Result<Option<UserBillingRecord>> {
        let row = sqlx::query_as::<_, BillingRow>(&format!(
            "SELECT {COLUMNS} FROM user_billing WHERE {predicate} = $1 LIMIT 1"
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error(operation))?;

        row.map(UserBillingRecord::try_from).transpose()
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn upsert_user(
        &self,
        subject: &str,
        email: Option<&str>,
        name: Option<&str>,
    ) -> Result<UserBillingRecord> {
        let row = sqlx::query_as::<_, BillingRow>(&format!(
            r"
            INSERT INTO user_billing (user_id, subject, email, name, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (subject) DO UPDATE SET
                email = COALESCE(EXCLUDED.email, user_billing.email),
                name = COALESCE(EXCLUDED.name, user_billing.name)
            RETURNING {COLUMNS}
            "
        ))
        .bind(Uuid::new_v4())
        .bind(subject)
        .bind(email)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("upsert user"))?;

        UserBillingRecord::try_from(row)
    }

    async fn get(&self, user_id: UserId) -> Result<Option<UserBillingRecord>> {
        let row = sqlx::query_as::<_, BillingRow>(&format!(
            "SELECT {COLUMNS} FROM user_billing WHERE user_id = $1"
        ))
        .bind(*user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get user"))?;

        row.map(UserBillingRecord::try_from).transpose()
    }

    async fn find_by_customer(&self, customer_id: &str) -> Result<Option<UserBillingRecord>> {
        self.fetch_one_where("find by customer", "billing_customer_id", customer_id)
            .await
    }

    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<UserBillingRecord>> {
        self.fetch_one_where("find by subscription", "active_subscription_id", subscription_id)
            .await
    }

    async fn set_customer(&self, user_id: UserId, customer_id: &str) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE user_billing
            SET billing_customer_id = $2, updated_at = NOW()
            WHERE user_id = $1
            ",
        )
        .bind(*user_id.as_uuid())
        .bind(customer_id)
        .execute(&self.pool)
        .await
        .map_err(db_error("set customer"))?;

        if result.rows_affected() == 0 {
            return Err(BillingError::UserNotFound(user_id.to_string()));
        }
        Ok(())
    }

    async fn set_subscription(
        &self,
        user_id: UserId,
        subscription: Option<SubscriptionTriple>,
    ) -> Result<()> {
        let (subscription_id, tier_id, status) = match &subscription {
            Some(t) => (
                Some(t.subscription_id.as_str()),
                Some(t.tier_id.as_str()),
                Some(t.status.as_str()),
            ),
            None => (None, None, None),
        };

        let result = sqlx::query(
            r"
            UPDATE user_billing
            SET active_subscription_id = $2,
                tier_id = $3,
                subscription_status = $4,
                updated_at = NOW()
            WHERE user_id = $1
            ",
        )
        .bind(*user_id.as_uuid())
        .bind(subscription_id)
        .bind(tier_id)
        .bind(status)
        .execute(&self.pool)
        .await
        .map_err(db_error("set subscription"))?;

        if result.rows_affected() == 0 {
            return Err(BillingError::UserNotFound(user_id.to_string()));
        }
        Ok(())
    }

    async fn subscribed_users(&self) -> Result<Vec<UserBillingRecord>> {
        let rows = sqlx::query_as::<_, BillingRow>(&format!(
            "SELECT {COLUMNS} FROM user_billing \
             WHERE active_subscription_id IS NOT NULL ORDER BY updated_at"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list subscribed users"))?;

        rows.into_iter().map(UserBillingRecord::try_from).collect()
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SubscriptionStatus;

    fn row() -> BillingRow {
        BillingRow {
            user_id: Uuid::new_v4(),
            subject: "oauth|ada".into(),
            email: Some("ada@example.com".into()),
            name: None,
            billing_customer_id: Some("cus_1".into()),
            active_subscription_id: None,
            tier_id: None,
            subscription_status: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_row_without_subscription() {
        let row = row();
        let user_id = row.user_id;

        let record = UserBillingRecord::try_from(row).unwrap();
        assert_eq!(record.user_id.as_uuid(), &user_id);
        assert_eq!(record.billing_customer_id.as_deref(), Some("cus_1"));
        assert!(record.subscription.is_none());
    }

    #[test]
    fn test_row_with_subscription() {
        let row = BillingRow {
            active_subscription_id: Some("sub_1".into()),
            tier_id: Some("startups".into()),
            subscription_status: Some("past_due".into()),
            ..row()
        };

        let record = UserBillingRecord::try_from(row).unwrap();
        assert_eq!(
            record.subscription,
            Some(SubscriptionTriple {
                subscription_id: "sub_1".into(),
                tier_id: "startups".into(),
                status: SubscriptionStatus::PastDue,
            })
        );
    }

    #[test]
    fn test_partial_triple_rejected() {
        let row = BillingRow {
            active_subscription_id: Some("sub_1".into()),
            ..row()
        };
        assert!(matches!(
            UserBillingRecord::try_from(row),
            Err(BillingError::Storage(_))
        ));

        let row = BillingRow {
            active_subscription_id: Some("sub_1".into()),
            tier_id: Some("startups".into()),
            subscription_status: Some("mystery".into()),
            ..self::row()
        };
        assert!(matches!(
            UserBillingRecord::try_from(row),
            Err(BillingError::Storage(_))
        ));
    }

    /// Run with `DATABASE_URL` pointing at a scratch database
    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_postgres_round_trip() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let store = PgBillingStore::connect(&StoreConfig::new(url)).await.unwrap();
        store.migrate().await.unwrap();

        let subject = format!("oauth|{}", Uuid::new_v4());
        let user = store.upsert_user(&subject, Some("ada@example.com"), None).await.unwrap();
        let again = store.upsert_user(&subject, None, Some("Ada")).await.unwrap();
        assert_eq!(user.user_id, again.user_id);
        assert_eq!(again.email.as_deref(), Some("ada@example.com"));

        let customer_id = format!("cus_{}", Uuid::new_v4().simple());
        let subscription_id = format!("sub_{}", Uuid::new_v4().simple());
        store.set_customer(user.user_id, &customer_id).await.unwrap();
        store
            .set_subscription(
                user.user_id,
                Some(SubscriptionTriple {
                    subscription_id: subscription_id.clone(),
                    tier_id: "startups".into(),
                    status: SubscriptionStatus::Active,
                }),
            )
            .await
            .unwrap();

        let by_customer = store.find_by_customer(&customer_id).await.unwrap().unwrap();
        let by_subscription = store.find_by_subscription(&subscription_id).await.unwrap().unwrap();
        assert_eq!(by_customer, by_subscription);
        assert_eq!(by_customer.tier_id(), Some("startups"));

        store.set_subscription(user.user_id, None).await.unwrap();
        let cleared = store.get(user.user_id).await.unwrap().unwrap();
        assert!(cleared.subscription.is_none());
        assert!(matches!(
            store.set_customer(UserId::generate(), "cus_missing").await,
            Err(BillingError::UserNotFound(_))
        ));
    }
}
