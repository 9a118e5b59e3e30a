//! Relational store capability
//!
//! The billing engine owns four mirror entities (customers, products, prices,
//! subscriptions) plus a best-effort billing-details denormalization. All of
//! them reflect processor-side truth; a local write is never authoritative
//! against a later processor event.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Store-level error, classified so the conflict-retry policy can single out
/// foreign-key races from everything else.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("foreign key constraint violated: {0}")]
    ForeignKeyViolation(String),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("row not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    /// True for the one error class the retry policy is allowed to retry:
    /// a write that depends on a row not yet committed.
    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(self, StoreError::ForeignKeyViolation(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Mapping from a local user to exactly one processor-side customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub user_id: Uuid,
    pub processor_customer_id: String,
}

/// Catalog product master record, keyed by the processor-assigned id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: String,
    pub active: bool,
    pub name: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub metadata: serde_json::Value,
}

/// Whether a price bills once or on a recurring interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceKind {
    OneTime,
    Recurring,
}

impl PriceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceKind::OneTime => "one_time",
            PriceKind::Recurring => "recurring",
        }
    }
}

/// Catalog price master record. `interval` is passed through opaque from the
/// processor (`day`, `week`, `month`, `year`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub id: String,
    pub product_id: String,
    pub active: bool,
    pub currency: String,
    pub kind: PriceKind,
    pub unit_amount: Option<i64>,
    pub interval: Option<String>,
    pub interval_count: Option<i64>,
    pub trial_period_days: Option<i32>,
    pub metadata: serde_json::Value,
}

/// Canonical subscription snapshot, keyed by the processor subscription id.
/// `status` is an opaque passthrough of the processor's enumeration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: String,
    pub user_id: Uuid,
    pub price_id: Option<String>,
    pub status: String,
    pub quantity: Option<i64>,
    pub cancel_at_period_end: bool,
    pub cancel_at: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub created: OffsetDateTime,
    pub ended_at: Option<OffsetDateTime>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub metadata: serde_json::Value,
}

/// Billing address captured from a default payment method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingAddress {
    pub line1: Option<String>,
    pub line2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

/// Summary of a payment method, enough to render "Visa ending 4242".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethodSummary {
    pub kind: String,
    pub brand: Option<String>,
    pub last4: Option<String>,
}

/// The one-time billing-detail copy persisted after first subscription
/// creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingDetails {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<BillingAddress>,
    pub payment_method: Option<PaymentMethodSummary>,
}

/// Relational store capability consumed by every billing service.
///
/// Implementations must surface row-level constraint violations as the
/// distinguishable `StoreError::ForeignKeyViolation` class; the conflict-
/// retry policy depends on it.
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn upsert_product(&self, product: &ProductRecord) -> StoreResult<()>;
    async fn upsert_price(&self, price: &PriceRecord) -> StoreResult<()>;
    async fn delete_product(&self, product_id: &str) -> StoreResult<()>;
    async fn delete_price(&self, price_id: &str) -> StoreResult<()>;

    async fn get_customer_by_user(&self, user_id: Uuid) -> StoreResult<Option<CustomerRecord>>;
    async fn get_customer_by_processor_id(
        &self,
        processor_customer_id: &str,
    ) -> StoreResult<Option<CustomerRecord>>;
    async fn insert_customer(&self, record: &CustomerRecord) -> StoreResult<()>;
    async fn update_customer_processor_id(
        &self,
        user_id: Uuid,
        processor_customer_id: &str,
    ) -> StoreResult<()>;

    /// Upsert keyed by the subscription id; an id seen before is always an
    /// update, never a second insert.
    async fn upsert_subscription(&self, subscription: &SubscriptionRecord) -> StoreResult<()>;

    async fn update_user_billing_details(
        &self,
        user_id: Uuid,
        details: &BillingDetails,
    ) -> StoreResult<()>;
}
