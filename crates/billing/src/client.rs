//! Stripe client wrapper and the production `PaymentProcessor` implementation

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use stripe::{
    BillingPortalSession, CheckoutSession, CheckoutSessionMode, CreateBillingPortalSession,
    CreateCheckoutSession, CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData,
    CreateCustomer, Customer, CustomerId, ListCustomers, ListSubscriptions, Subscription,
    SubscriptionId, SubscriptionStatus as StripeSubStatus, SubscriptionStatusFilter,
    UpdateSubscription, UpdateSubscriptionItems,
};
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::processor::{
    CheckoutMode, CheckoutSessionHandle, PaymentProcessor, ProcessorCustomer, ProcessorError,
    ProcessorPaymentMethod, ProcessorResult, ProcessorSubscription, SubscriptionPriceChange,
};
use crate::store::{BillingAddress, PaymentMethodSummary, PriceKind, PriceRecord, ProductRecord};

/// Stripe configuration read from the environment.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        Ok(Self {
            secret_key,
            webhook_secret,
        })
    }
}

/// Shared Stripe API client. Cheap to clone; each billing service holds its
/// own handle.
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(&config.secret_key);
        Self {
            client,
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

fn map_stripe(err: stripe::StripeError) -> ProcessorError {
    ProcessorError::Api(err.to_string())
}

fn parse_customer_id(customer_id: &str) -> ProcessorResult<CustomerId> {
    customer_id
        .parse::<CustomerId>()
        .map_err(|_| ProcessorError::InvalidId(customer_id.to_string()))
}

fn parse_subscription_id(subscription_id: &str) -> ProcessorResult<SubscriptionId> {
    subscription_id
        .parse::<SubscriptionId>()
        .map_err(|_| ProcessorError::InvalidId(subscription_id.to_string()))
}

fn metadata_json(metadata: Option<&HashMap<String, String>>) -> serde_json::Value {
    metadata
        .map(|m| serde_json::to_value(m).unwrap_or_default())
        .unwrap_or_else(|| serde_json::Value::Object(Default::default()))
}

/// Map a Stripe product (as delivered in catalog webhook events) onto the
/// local master record.
pub fn product_record(product: &stripe::Product) -> ProductRecord {
    ProductRecord {
        id: product.id.to_string(),
        active: product.active.unwrap_or(true),
        name: product.name.clone(),
        description: product.description.clone(),
        image_url: product
            .images
            .as_ref()
            .and_then(|images| images.first().cloned()),
        metadata: metadata_json(product.metadata.as_ref()),
    }
}

/// Map a Stripe price onto the local master record. The owning product id is
/// required; catalog events always carry it.
pub fn price_record(price: &stripe::Price) -> BillingResult<PriceRecord> {
    let product_id = match &price.product {
        Some(stripe::Expandable::Id(id)) => id.to_string(),
        Some(stripe::Expandable::Object(product)) => product.id.to_string(),
        None => {
            return Err(BillingError::WebhookEventNotSupported(format!(
                "price {} carries no product reference",
                price.id
            )))
        }
    };

    let kind = if price.recurring.is_some() {
        PriceKind::Recurring
    } else {
        PriceKind::OneTime
    };

    Ok(PriceRecord {
        id: price.id.to_string(),
        product_id,
        active: price.active.unwrap_or(true),
        currency: price
            .currency
            .map(|c| c.to_string())
            .unwrap_or_else(|| "usd".to_string()),
        kind,
        unit_amount: price.unit_amount,
        interval: price
            .recurring
            .as_ref()
            .map(|r| r.interval.to_string()),
        interval_count: price.recurring.as_ref().map(|r| r.interval_count as i64),
        trial_period_days: price
            .recurring
            .as_ref()
            .and_then(|r| r.trial_period_days)
            .map(|d| d as i32),
        metadata: metadata_json(price.metadata.as_ref()),
    })
}

fn subscription_status(status: StripeSubStatus) -> &'static str {
    match status {
        StripeSubStatus::Active => "active",
        StripeSubStatus::PastDue => "past_due",
        StripeSubStatus::Canceled => "canceled",
        StripeSubStatus::Unpaid => "unpaid",
        StripeSubStatus::Trialing => "trialing",
        StripeSubStatus::Incomplete => "incomplete",
        StripeSubStatus::IncompleteExpired => "incomplete_expired",
        StripeSubStatus::Paused => "paused",
    }
}

fn payment_method_details(pm: &stripe::PaymentMethod) -> ProcessorPaymentMethod {
    let details = &pm.billing_details;

    ProcessorPaymentMethod {
        summary: PaymentMethodSummary {
            kind: pm.type_.to_string(),
            brand: pm.card.as_ref().map(|card| card.brand.clone()),
            last4: pm.card.as_ref().map(|card| card.last4.clone()),
        },
        billing_name: details.name.clone(),
        billing_phone: details.phone.clone(),
        billing_address: details.address.as_ref().map(|addr| BillingAddress {
            line1: addr.line1.clone(),
            line2: addr.line2.clone(),
            city: addr.city.clone(),
            state: addr.state.clone(),
            postal_code: addr.postal_code.clone(),
            country: addr.country.clone(),
        }),
    }
}

fn processor_subscription(subscription: &Subscription) -> ProcessorSubscription {
    let customer_id = match &subscription.customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(customer) => customer.id.to_string(),
    };

    let item = subscription.items.data.first();

    let default_payment_method =
        subscription
            .default_payment_method
            .as_ref()
            .and_then(|pm| match pm {
                stripe::Expandable::Object(pm) => Some(payment_method_details(pm)),
                stripe::Expandable::Id(_) => None,
            });

    ProcessorSubscription {
        id: subscription.id.to_string(),
        customer_id,
        status: subscription_status(subscription.status).to_string(),
        item_id: item.map(|item| item.id.to_string()),
        price_id: item
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.to_string()),
        quantity: item.and_then(|item| item.quantity).map(|q| q as i64),
        cancel_at_period_end: subscription.cancel_at_period_end,
        cancel_at: subscription.cancel_at,
        canceled_at: subscription.canceled_at,
        current_period_start: subscription.current_period_start,
        current_period_end: subscription.current_period_end,
        created: subscription.created,
        ended_at: subscription.ended_at,
        trial_start: subscription.trial_start,
        trial_end: subscription.trial_end,
        metadata: subscription.metadata.clone(),
        default_payment_method,
    }
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn create_customer(&self, email: &str, user_id: Uuid) -> ProcessorResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());

        let mut params = CreateCustomer::new();
        params.email = Some(email);
        params.metadata = Some(metadata);

        let customer = Customer::create(self.inner(), params)
            .await
            .map_err(map_stripe)?;

        Ok(customer.id.to_string())
    }

    async fn list_customers_by_email(&self, email: &str) -> ProcessorResult<Vec<String>> {
        let params = ListCustomers {
            email: Some(email),
            ..Default::default()
        };

        let customers = Customer::list(self.inner(), &params)
            .await
            .map_err(map_stripe)?;

        Ok(customers
            .data
            .into_iter()
            .map(|customer| customer.id.to_string())
            .collect())
    }

    async fn retrieve_customer(
        &self,
        customer_id: &str,
    ) -> ProcessorResult<Option<ProcessorCustomer>> {
        let id = parse_customer_id(customer_id)?;

        match Customer::retrieve(self.inner(), &id, &[]).await {
            Ok(customer) if customer.deleted => Ok(None),
            Ok(customer) => Ok(Some(ProcessorCustomer {
                id: customer.id.to_string(),
                email: customer.email.clone(),
            })),
            // A stale local id resolves to "no such customer", not a failure.
            Err(stripe::StripeError::Stripe(err)) if err.http_status == 404 => Ok(None),
            Err(err) => Err(map_stripe(err)),
        }
    }

    async fn list_active_subscriptions(
        &self,
        customer_id: &str,
    ) -> ProcessorResult<Vec<ProcessorSubscription>> {
        let customer_id = parse_customer_id(customer_id)?;

        let params = ListSubscriptions {
            customer: Some(customer_id),
            status: Some(SubscriptionStatusFilter::Active),
            ..Default::default()
        };

        let subscriptions = Subscription::list(self.inner(), &params)
            .await
            .map_err(map_stripe)?;

        Ok(subscriptions
            .data
            .iter()
            .map(processor_subscription)
            .collect())
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
        expand_payment_method: bool,
    ) -> ProcessorResult<ProcessorSubscription> {
        let id = parse_subscription_id(subscription_id)?;

        let expand: &[&str] = if expand_payment_method {
            &["default_payment_method"]
        } else {
            &[]
        };

        let subscription = Subscription::retrieve(self.inner(), &id, expand)
            .await
            .map_err(map_stripe)?;

        Ok(processor_subscription(&subscription))
    }

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        change: SubscriptionPriceChange,
    ) -> ProcessorResult<ProcessorSubscription> {
        let id = parse_subscription_id(subscription_id)?;

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(change.item_id),
                price: Some(change.price_id),
                ..Default::default()
            }]),
            proration_behavior: Some(SubscriptionProrationBehavior::CreateProrations),
            trial_end: change.trial_end.map(stripe::Scheduled::Timestamp),
            ..Default::default()
        };

        let subscription = Subscription::update(self.inner(), &id, params)
            .await
            .map_err(map_stripe)?;

        Ok(processor_subscription(&subscription))
    }

    async fn create_checkout_session(
        &self,
        session: crate::processor::CheckoutSessionParams,
    ) -> ProcessorResult<CheckoutSessionHandle> {
        let customer_id = parse_customer_id(&session.customer_id)?;

        let mut params = CreateCheckoutSession::new();
        params.customer = Some(customer_id);
        params.mode = Some(match session.mode {
            CheckoutMode::Payment => CheckoutSessionMode::Payment,
            CheckoutMode::Subscription => CheckoutSessionMode::Subscription,
        });
        params.success_url = Some(&session.success_url);
        params.cancel_url = Some(&session.cancel_url);
        params.allow_promotion_codes = Some(true);
        params.billing_address_collection =
            Some(stripe::CheckoutSessionBillingAddressCollection::Required);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(session.price_id.clone()),
            quantity: Some(session.quantity),
            ..Default::default()
        }]);
        if session.mode == CheckoutMode::Subscription {
            if let Some(trial_end) = session.trial_end {
                params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
                    trial_end: Some(trial_end),
                    ..Default::default()
                });
            }
        }
        if !session.metadata.is_empty() {
            params.metadata = Some(session.metadata.clone());
        }

        let created = CheckoutSession::create(self.inner(), params)
            .await
            .map_err(map_stripe)?;

        Ok(CheckoutSessionHandle {
            id: created.id.to_string(),
            url: created.url.clone(),
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> ProcessorResult<String> {
        let customer_id = parse_customer_id(customer_id)?;

        let mut params = CreateBillingPortalSession::new(customer_id);
        params.return_url = Some(return_url);

        let session = BillingPortalSession::create(self.inner(), params)
            .await
            .map_err(map_stripe)?;

        Ok(session.url)
    }
}
