//! Payment processor capability
//!
//! Processor-neutral view of the operations this engine consumes. The Stripe
//! implementation lives in `client`; tests substitute an in-memory mock.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{BillingAddress, PaymentMethodSummary};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessorError {
    #[error("processor API error: {0}")]
    Api(String),

    #[error("invalid processor id {0:?}")]
    InvalidId(String),
}

pub type ProcessorResult<T> = Result<T, ProcessorError>;

/// Processor-side customer as this engine sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorCustomer {
    pub id: String,
    pub email: Option<String>,
}

/// Default payment method expanded off a newly created subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorPaymentMethod {
    pub summary: PaymentMethodSummary,
    pub billing_name: Option<String>,
    pub billing_phone: Option<String>,
    pub billing_address: Option<BillingAddress>,
}

/// Full processor subscription object, timestamps in epoch seconds exactly as
/// the processor reports them. Nullable fields stay `None` when absent
/// upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorSubscription {
    pub id: String,
    pub customer_id: String,
    pub status: String,
    pub item_id: Option<String>,
    pub price_id: Option<String>,
    pub quantity: Option<i64>,
    pub cancel_at_period_end: bool,
    pub cancel_at: Option<i64>,
    pub canceled_at: Option<i64>,
    pub current_period_start: i64,
    pub current_period_end: i64,
    pub created: i64,
    pub ended_at: Option<i64>,
    pub trial_start: Option<i64>,
    pub trial_end: Option<i64>,
    pub metadata: HashMap<String, String>,
    pub default_payment_method: Option<ProcessorPaymentMethod>,
}

/// Whether a checkout session collects a single payment or starts a
/// subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutMode {
    Payment,
    Subscription,
}

/// Parameters for a hosted checkout session. Promotion codes and required
/// billing-address collection are always enabled by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSessionParams {
    pub customer_id: String,
    pub price_id: String,
    pub quantity: u64,
    pub mode: CheckoutMode,
    pub trial_end: Option<i64>,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: HashMap<String, String>,
}

/// Handle to a created checkout session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionHandle {
    pub id: String,
    pub url: Option<String>,
}

/// Price replacement applied to an existing subscription in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionPriceChange {
    pub item_id: String,
    pub price_id: String,
    pub trial_end: Option<i64>,
}

/// Payment processor capability consumed by the resolver, reconciler and
/// checkout orchestrator.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Create a processor customer tagged with the local user id in its
    /// metadata; returns the processor-assigned customer id.
    async fn create_customer(&self, email: &str, user_id: Uuid) -> ProcessorResult<String>;

    /// All processor customer ids matching an email, for fallback discovery.
    async fn list_customers_by_email(&self, email: &str) -> ProcessorResult<Vec<String>>;

    /// Fetch a customer to confirm it still exists. `Ok(None)` means the id
    /// is stale (deleted or unknown); transport and API failures are `Err`.
    async fn retrieve_customer(
        &self,
        customer_id: &str,
    ) -> ProcessorResult<Option<ProcessorCustomer>>;

    async fn list_active_subscriptions(
        &self,
        customer_id: &str,
    ) -> ProcessorResult<Vec<ProcessorSubscription>>;

    /// Fetch the full subscription object, expanding its default payment
    /// method when requested.
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
        expand_payment_method: bool,
    ) -> ProcessorResult<ProcessorSubscription>;

    /// Replace the single line item's price in place, with prorations, and
    /// reset the trial end.
    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        change: SubscriptionPriceChange,
    ) -> ProcessorResult<ProcessorSubscription>;

    async fn create_checkout_session(
        &self,
        params: CheckoutSessionParams,
    ) -> ProcessorResult<CheckoutSessionHandle>;

    /// Billing-portal session scoped to a return URL; returns the portal URL.
    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> ProcessorResult<String>;
}
