//! Postgres-backed store implementation

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::store::{
    BillingDetails, BillingStore, CustomerRecord, PriceRecord, ProductRecord, StoreError,
    StoreResult, SubscriptionRecord,
};

/// Embedded migrations for the billing mirror tables.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// `BillingStore` over a Postgres pool. Upserts use `ON CONFLICT ... DO
/// UPDATE` so concurrent writers for the same key both succeed and the last
/// commit wins.
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db) = err {
        match db.kind() {
            sqlx::error::ErrorKind::ForeignKeyViolation => {
                return StoreError::ForeignKeyViolation(db.message().to_string());
            }
            sqlx::error::ErrorKind::UniqueViolation => {
                return StoreError::UniqueViolation(db.message().to_string());
            }
            _ => {}
        }
    }
    StoreError::Database(err.to_string())
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn upsert_product(&self, product: &ProductRecord) -> StoreResult<()> {
        // Full replace of all mutable fields; no merge/patch semantics.
        sqlx::query(
            r#"
            INSERT INTO products (id, active, name, description, image_url, metadata, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (id) DO UPDATE SET
                active = EXCLUDED.active,
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                image_url = EXCLUDED.image_url,
                metadata = EXCLUDED.metadata,
                updated_at = NOW()
            "#,
        )
        .bind(&product.id)
        .bind(product.active)
        .bind(&product.name)
        .bind(&product.description)
        .bind(&product.image_url)
        .bind(&product.metadata)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    async fn upsert_price(&self, price: &PriceRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO prices (
                id, product_id, active, currency, type, unit_amount,
                interval, interval_count, trial_period_days, metadata, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            ON CONFLICT (id) DO UPDATE SET
                product_id = EXCLUDED.product_id,
                active = EXCLUDED.active,
                currency = EXCLUDED.currency,
                type = EXCLUDED.type,
                unit_amount = EXCLUDED.unit_amount,
                interval = EXCLUDED.interval,
                interval_count = EXCLUDED.interval_count,
                trial_period_days = EXCLUDED.trial_period_days,
                metadata = EXCLUDED.metadata,
                updated_at = NOW()
            "#,
        )
        .bind(&price.id)
        .bind(&price.product_id)
        .bind(price.active)
        .bind(&price.currency)
        .bind(price.kind.as_str())
        .bind(price.unit_amount)
        .bind(&price.interval)
        .bind(price.interval_count)
        .bind(price.trial_period_days)
        .bind(&price.metadata)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    async fn delete_product(&self, product_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM products WHERE id = $1")
            .bind(product_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;

        Ok(())
    }

    async fn delete_price(&self, price_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM prices WHERE id = $1")
            .bind(price_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;

        Ok(())
    }

    async fn get_customer_by_user(&self, user_id: Uuid) -> StoreResult<Option<CustomerRecord>> {
        let row: Option<(Uuid, String)> = sqlx::query_as(
            "SELECT user_id, processor_customer_id FROM billing_customers WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(row.map(|(user_id, processor_customer_id)| CustomerRecord {
            user_id,
            processor_customer_id,
        }))
    }

    async fn get_customer_by_processor_id(
        &self,
        processor_customer_id: &str,
    ) -> StoreResult<Option<CustomerRecord>> {
        let row: Option<(Uuid, String)> = sqlx::query_as(
            "SELECT user_id, processor_customer_id FROM billing_customers WHERE processor_customer_id = $1",
        )
        .bind(processor_customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(row.map(|(user_id, processor_customer_id)| CustomerRecord {
            user_id,
            processor_customer_id,
        }))
    }

    async fn insert_customer(&self, record: &CustomerRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_customers (user_id, processor_customer_id, created_at, updated_at)
            VALUES ($1, $2, NOW(), NOW())
            "#,
        )
        .bind(record.user_id)
        .bind(&record.processor_customer_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    async fn update_customer_processor_id(
        &self,
        user_id: Uuid,
        processor_customer_id: &str,
    ) -> StoreResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE billing_customers
            SET processor_customer_id = $1, updated_at = NOW()
            WHERE user_id = $2
            "#,
        )
        .bind(processor_customer_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?
        .rows_affected();

        if rows == 0 {
            return Err(StoreError::NotFound(format!(
                "billing customer for user {user_id}"
            )));
        }

        Ok(())
    }

    async fn upsert_subscription(&self, subscription: &SubscriptionRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, user_id, price_id, status, quantity, cancel_at_period_end,
                cancel_at, canceled_at, current_period_start, current_period_end,
                created, ended_at, trial_start, trial_end, metadata, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW()
            )
            ON CONFLICT (id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                price_id = EXCLUDED.price_id,
                status = EXCLUDED.status,
                quantity = EXCLUDED.quantity,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                cancel_at = EXCLUDED.cancel_at,
                canceled_at = EXCLUDED.canceled_at,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                created = EXCLUDED.created,
                ended_at = EXCLUDED.ended_at,
                trial_start = EXCLUDED.trial_start,
                trial_end = EXCLUDED.trial_end,
                metadata = EXCLUDED.metadata,
                updated_at = NOW()
            "#,
        )
        .bind(&subscription.id)
        .bind(subscription.user_id)
        .bind(&subscription.price_id)
        .bind(&subscription.status)
        .bind(subscription.quantity)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.cancel_at)
        .bind(subscription.canceled_at)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.created)
        .bind(subscription.ended_at)
        .bind(subscription.trial_start)
        .bind(subscription.trial_end)
        .bind(&subscription.metadata)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    async fn update_user_billing_details(
        &self,
        user_id: Uuid,
        details: &BillingDetails,
    ) -> StoreResult<()> {
        let address = details
            .address
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Database(format!("serialize billing address: {e}")))?;
        let payment_method = details
            .payment_method
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Database(format!("serialize payment method: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO billing_details (user_id, billing_name, billing_phone, address, payment_method, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                billing_name = EXCLUDED.billing_name,
                billing_phone = EXCLUDED.billing_phone,
                address = EXCLUDED.address,
                payment_method = EXCLUDED.payment_method,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(&details.name)
        .bind(&details.phone)
        .bind(address)
        .bind(payment_method)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }
}
