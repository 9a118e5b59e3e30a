//! Checkout orchestration
//!
//! User-facing entry point for purchasing a price. Unlike the reconciliation
//! paths, nothing here is allowed to escape as an error: a live user is
//! waiting on a navigable response, so every failure is folded into an
//! error-redirect URL.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::customer::CustomerService;
use crate::error::BillingResult;
use crate::processor::{
    CheckoutMode, CheckoutSessionParams, PaymentProcessor, ProcessorError, SubscriptionPriceChange,
};
use crate::store::{PriceKind, PriceRecord};

/// The application user on whose behalf checkout runs.
#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub id: Uuid,
    pub email: String,
}

/// Discriminated checkout outcome handed back to the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CheckoutResponse {
    /// An existing subscription was updated in place; no redirect needed.
    Success,
    /// A checkout session was created; send the user to it.
    Redirect { session_id: String },
    /// Something failed; send the user to the error redirect.
    Error { error_redirect: String },
}

/// Append `error` and `error_description` query parameters to `base`.
pub(crate) fn error_redirect(base: &str, message: &str, hint: &str) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("error", message)
        .append_pair("error_description", hint)
        .finish();
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}{query}")
}

/// Trial end as epoch seconds, or `None` when the price carries no usable
/// trial. Days below two would produce a same-day trial, so they are treated
/// as no trial; one extra grace day is always added. A day count that would
/// push the date out of representable range also yields no trial.
pub fn calculate_trial_end(trial_period_days: Option<i32>, now: OffsetDateTime) -> Option<i64> {
    match trial_period_days {
        Some(days) if days >= 2 => now
            .checked_add(Duration::days(i64::from(days) + 1))
            .map(OffsetDateTime::unix_timestamp),
        _ => None,
    }
}

#[derive(Clone)]
pub struct CheckoutService {
    customers: CustomerService,
    processor: Arc<dyn PaymentProcessor>,
}

impl CheckoutService {
    pub fn new(customers: CustomerService, processor: Arc<dyn PaymentProcessor>) -> Self {
        Self {
            customers,
            processor,
        }
    }

    /// Start a checkout for `price`. Returns `Success` when an existing
    /// active subscription was switched to the price in place, `Redirect`
    /// with a new session otherwise. Failures become `Error` with a redirect
    /// built on `cancel_url`.
    pub async fn start_checkout(
        &self,
        user: &UserIdentity,
        price: &PriceRecord,
        success_url: &str,
        cancel_url: &str,
    ) -> CheckoutResponse {
        match self
            .checkout_inner(user, price, success_url, cancel_url)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(
                    user_id = %user.id,
                    price_id = %price.id,
                    error = %err,
                    "checkout failed"
                );
                CheckoutResponse::Error {
                    error_redirect: error_redirect(
                        cancel_url,
                        &err.to_string(),
                        "Please try again later or contact support.",
                    ),
                }
            }
        }
    }

    async fn checkout_inner(
        &self,
        user: &UserIdentity,
        price: &PriceRecord,
        success_url: &str,
        cancel_url: &str,
    ) -> BillingResult<CheckoutResponse> {
        let customer_id = self.customers.resolve(user.id, &user.email).await?;

        let active = self.processor.list_active_subscriptions(&customer_id).await?;

        // An active subscription is switched in place rather than stacked
        // with a second one through a new session.
        if let Some(subscription) = active.first() {
            let item_id = subscription.item_id.clone().ok_or_else(|| {
                ProcessorError::Api(format!(
                    "subscription {} has no line item to update",
                    subscription.id
                ))
            })?;

            self.processor
                .update_subscription_price(
                    &subscription.id,
                    SubscriptionPriceChange {
                        item_id,
                        price_id: price.id.clone(),
                        trial_end: calculate_trial_end(
                            price.trial_period_days,
                            OffsetDateTime::now_utc(),
                        ),
                    },
                )
                .await?;

            tracing::info!(
                user_id = %user.id,
                subscription_id = %subscription.id,
                price_id = %price.id,
                "switched active subscription to requested price"
            );

            return Ok(CheckoutResponse::Success);
        }

        let (mode, trial_end) = match price.kind {
            PriceKind::OneTime => (CheckoutMode::Payment, None),
            PriceKind::Recurring => (
                CheckoutMode::Subscription,
                calculate_trial_end(price.trial_period_days, OffsetDateTime::now_utc()),
            ),
        };

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("user_id".to_string(), user.id.to_string());

        let session = self
            .processor
            .create_checkout_session(CheckoutSessionParams {
                customer_id,
                price_id: price.id.clone(),
                quantity: 1,
                mode,
                trial_end,
                success_url: success_url.to_string(),
                cancel_url: cancel_url.to_string(),
                metadata,
            })
            .await?;

        tracing::info!(
            user_id = %user.id,
            price_id = %price.id,
            session_id = %session.id,
            "created checkout session"
        );

        Ok(CheckoutResponse::Redirect {
            session_id: session.id,
        })
    }
}
