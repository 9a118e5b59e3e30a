// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries full store error context
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Paymirror Billing
//!
//! Keeps a local relational mirror of payment-processor state in sync and
//! drives the user-facing purchase flows. The processor is authoritative for
//! everything money-related; this crate reconciles its events into queryable
//! local rows.
//!
//! ## Features
//!
//! - **Catalog Sync**: Mirror product and price records from webhook events
//! - **Customer Identity**: Map local users to processor customers, with
//!   self-healing for stale mappings
//! - **Subscription Reconciliation**: Upsert full subscription state, with
//!   bounded retry over webhook-ordering races
//! - **Checkout**: Hosted checkout sessions and in-place plan switches
//! - **Billing Portal**: Processor-hosted self-service links
//! - **Webhooks**: Signature verification and event routing

pub mod catalog;
pub mod checkout;
pub mod client;
pub mod customer;
pub mod error;
pub mod portal;
pub mod postgres;
pub mod processor;
pub mod retry;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
pub(crate) mod mocks;

// Catalog
pub use catalog::CatalogService;

// Checkout
pub use checkout::{calculate_trial_end, CheckoutResponse, CheckoutService, UserIdentity};

// Client
pub use client::{StripeClient, StripeConfig};

// Customer
pub use customer::CustomerService;

// Error
pub use error::{BillingError, BillingResult};

// Portal
pub use portal::{PortalResponse, PortalService};

// Postgres store
pub use postgres::{PgBillingStore, MIGRATOR};

// Processor capability
pub use processor::{
    CheckoutMode, CheckoutSessionHandle, CheckoutSessionParams, PaymentProcessor,
    ProcessorCustomer, ProcessorError, ProcessorPaymentMethod, ProcessorResult,
    ProcessorSubscription, SubscriptionPriceChange,
};

// Retry
pub use retry::{with_conflict_retry, DEFAULT_DELAY, DEFAULT_MAX_ATTEMPTS};

// Store capability
pub use store::{
    BillingAddress, BillingDetails, BillingStore, CustomerRecord, PaymentMethodSummary, PriceKind,
    PriceRecord, ProductRecord, StoreError, StoreResult, SubscriptionRecord,
};

// Subscriptions
pub use subscriptions::SubscriptionService;

// Webhooks
pub use webhooks::WebhookHandler;

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all reconciliation and checkout paths.
pub struct BillingService {
    pub catalog: CatalogService,
    pub customers: CustomerService,
    pub subscriptions: SubscriptionService,
    pub checkout: CheckoutService,
    pub portal: PortalService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Wire all services on top of explicit store and processor capabilities.
    pub fn new(
        store: Arc<dyn BillingStore>,
        processor: Arc<dyn PaymentProcessor>,
        webhook_secret: String,
    ) -> Self {
        let catalog = CatalogService::new(store.clone());
        let customers = CustomerService::new(store.clone(), processor.clone());
        let subscriptions = SubscriptionService::new(store.clone(), processor.clone());
        let checkout = CheckoutService::new(customers.clone(), processor.clone());
        let portal = PortalService::new(customers.clone(), processor);
        let webhooks = WebhookHandler::new(webhook_secret, catalog.clone(), subscriptions.clone());

        Self {
            catalog,
            customers,
            subscriptions,
            checkout,
            portal,
            webhooks,
        }
    }

    /// Production wiring: Postgres store plus Stripe client from environment
    /// variables.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let webhook_secret = stripe.config().webhook_secret.clone();

        Ok(Self::new(
            Arc::new(PgBillingStore::new(pool)),
            Arc::new(stripe),
            webhook_secret,
        ))
    }
}
