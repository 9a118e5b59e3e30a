//! Subscription state reconciliation
//!
//! Every subscription lifecycle notification funnels into [`SubscriptionService::reconcile`]:
//! fetch the authoritative state from the processor, map it onto the local
//! row, and upsert. The upsert is wrapped in the conflict retry so an event
//! racing ahead of its customer row settles once the parent lands.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::processor::{PaymentProcessor, ProcessorSubscription};
use crate::retry::{with_conflict_retry, DEFAULT_DELAY, DEFAULT_MAX_ATTEMPTS};
use crate::store::{BillingDetails, BillingStore, SubscriptionRecord};

#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    processor: Arc<dyn PaymentProcessor>,
}

fn timestamp(epoch: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(epoch).unwrap_or(OffsetDateTime::now_utc())
}

fn optional_timestamp(epoch: Option<i64>) -> Option<OffsetDateTime> {
    epoch.map(timestamp)
}

/// Map the processor's view of a subscription onto the local row for `user_id`.
fn subscription_record(user_id: Uuid, subscription: &ProcessorSubscription) -> SubscriptionRecord {
    SubscriptionRecord {
        id: subscription.id.clone(),
        user_id,
        price_id: subscription.price_id.clone(),
        status: subscription.status.clone(),
        quantity: subscription.quantity,
        cancel_at_period_end: subscription.cancel_at_period_end,
        cancel_at: optional_timestamp(subscription.cancel_at),
        canceled_at: optional_timestamp(subscription.canceled_at),
        current_period_start: timestamp(subscription.current_period_start),
        current_period_end: timestamp(subscription.current_period_end),
        created: timestamp(subscription.created),
        ended_at: optional_timestamp(subscription.ended_at),
        trial_start: optional_timestamp(subscription.trial_start),
        trial_end: optional_timestamp(subscription.trial_end),
        metadata: serde_json::to_value(&subscription.metadata)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default())),
    }
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn BillingStore>, processor: Arc<dyn PaymentProcessor>) -> Self {
        Self { store, processor }
    }

    /// Reconcile the local row for `subscription_id` with the processor.
    ///
    /// `is_new` marks the first lifecycle event for a subscription; only then
    /// is the default payment method expanded and its billing details copied
    /// onto the owning user. The copy runs after the subscription row is
    /// durable, so it happens at most once per subscription.
    pub async fn reconcile(
        &self,
        subscription_id: &str,
        customer_processor_id: &str,
        is_new: bool,
    ) -> BillingResult<()> {
        // The customer mapping must already exist; a subscription for an
        // unknown customer cannot be attributed to a user and is fatal.
        let user_id = self
            .store
            .get_customer_by_processor_id(customer_processor_id)
            .await?
            .map(|record| record.user_id)
            .ok_or_else(|| BillingError::CustomerNotFound(customer_processor_id.to_string()))?;

        let subscription = self
            .processor
            .retrieve_subscription(subscription_id, is_new)
            .await?;

        let record = subscription_record(user_id, &subscription);

        let store = self.store.clone();
        with_conflict_retry(DEFAULT_MAX_ATTEMPTS, DEFAULT_DELAY, move || {
            let store = store.clone();
            let record = record.clone();
            async move { store.upsert_subscription(&record).await }
        })
        .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            user_id = %user_id,
            status = %subscription.status,
            "subscription state reconciled"
        );

        if is_new {
            if let Some(payment_method) = &subscription.default_payment_method {
                self.store
                    .update_user_billing_details(
                        user_id,
                        &BillingDetails {
                            name: payment_method.billing_name.clone(),
                            phone: payment_method.billing_phone.clone(),
                            address: payment_method.billing_address.clone(),
                            payment_method: Some(payment_method.summary.clone()),
                        },
                    )
                    .await?;

                tracing::info!(
                    user_id = %user_id,
                    "copied billing details from default payment method"
                );
            }
        }

        Ok(())
    }
}
