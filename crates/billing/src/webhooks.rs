//! Stripe webhook handling
//!
//! Verifies event signatures and routes catalog, subscription, and checkout
//! events into the reconciliation services. Handler errors propagate to the
//! HTTP layer so the sender's redelivery picks them up.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{Event, EventObject, EventType};

use crate::catalog::CatalogService;
use crate::client::{price_record, product_record};
use crate::error::{BillingError, BillingResult};
use crate::subscriptions::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock skew between the signature timestamp and now.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verify a `Stripe-Signature` header against the raw payload.
///
/// The header carries `t=<timestamp>,v1=<hex hmac>`; the signed message is
/// `<timestamp>.<payload>` keyed with the endpoint secret (minus its
/// `whsec_` prefix).
fn verify_signature(payload: &str, signature: &str, secret: &str, now: i64) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature.split(',') {
        match part.split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1_signature = Some(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "webhook signature timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{timestamp}.{payload}");

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

fn customer_id_of(subscription: &stripe::Subscription) -> String {
    match &subscription.customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(customer) => customer.id.to_string(),
    }
}

pub struct WebhookHandler {
    secret: String,
    catalog: CatalogService,
    subscriptions: SubscriptionService,
}

impl WebhookHandler {
    pub fn new(secret: String, catalog: CatalogService, subscriptions: SubscriptionService) -> Self {
        Self {
            secret,
            catalog,
            subscriptions,
        }
    }

    /// Verify the signature header and parse the payload into an event.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|_| BillingError::WebhookSignatureInvalid)?
            .as_secs() as i64;

        verify_signature(payload, signature, &self.secret, now)?;

        // A payload that authenticated but does not parse is a content
        // problem, not a signature problem.
        let event: Event = serde_json::from_str(payload).map_err(|err| {
            tracing::error!(parse_error = %err, "failed to parse webhook event payload");
            BillingError::WebhookEventNotSupported(format!("unparseable event payload: {err}"))
        })?;

        Ok(event)
    }

    /// Route a verified event into the matching reconciliation path.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "processing webhook event"
        );

        match event.type_ {
            EventType::ProductCreated | EventType::ProductUpdated => {
                let product = self.extract_product(event)?;
                self.catalog.upsert_product(&product_record(&product)).await?;
            }
            EventType::ProductDeleted => {
                let product = self.extract_product(event)?;
                self.catalog.delete_product(product.id.as_str()).await?;
            }
            EventType::PriceCreated | EventType::PriceUpdated => {
                let price = self.extract_price(event)?;
                self.catalog.upsert_price(&price_record(&price)?).await?;
            }
            EventType::PriceDeleted => {
                let price = self.extract_price(event)?;
                self.catalog.delete_price(price.id.as_str()).await?;
            }
            EventType::CustomerSubscriptionCreated => {
                let subscription = self.extract_subscription(event)?;
                self.subscriptions
                    .reconcile(subscription.id.as_str(), &customer_id_of(&subscription), true)
                    .await?;
            }
            EventType::CustomerSubscriptionUpdated | EventType::CustomerSubscriptionDeleted => {
                let subscription = self.extract_subscription(event)?;
                self.subscriptions
                    .reconcile(
                        subscription.id.as_str(),
                        &customer_id_of(&subscription),
                        false,
                    )
                    .await?;
            }
            EventType::CheckoutSessionCompleted => {
                self.handle_checkout_completed(event).await?;
            }
            _ => {
                // Track event types arriving without a handler so new ones
                // surface in the logs.
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "received unhandled webhook event type"
                );
            }
        }

        Ok(())
    }

    /// A completed subscription-mode checkout is the first lifecycle event
    /// for its subscription; payment-mode sessions carry no state to mirror.
    async fn handle_checkout_completed(&self, event: Event) -> BillingResult<()> {
        let session = match event.data.object {
            EventObject::CheckoutSession(session) => session,
            other => {
                return Err(BillingError::WebhookEventNotSupported(format!(
                    "expected checkout session payload, got {other:?}"
                )))
            }
        };

        if session.mode != stripe::CheckoutSessionMode::Subscription {
            tracing::info!(
                session_id = %session.id,
                "checkout session completed without a subscription, nothing to reconcile"
            );
            return Ok(());
        }

        let subscription_id = match &session.subscription {
            Some(stripe::Expandable::Id(id)) => id.to_string(),
            Some(stripe::Expandable::Object(subscription)) => subscription.id.to_string(),
            None => {
                return Err(BillingError::WebhookEventNotSupported(format!(
                    "subscription-mode session {} carries no subscription id",
                    session.id
                )))
            }
        };

        let customer_id = match &session.customer {
            Some(stripe::Expandable::Id(id)) => id.to_string(),
            Some(stripe::Expandable::Object(customer)) => customer.id.to_string(),
            None => {
                return Err(BillingError::WebhookEventNotSupported(format!(
                    "session {} carries no customer id",
                    session.id
                )))
            }
        };

        self.subscriptions
            .reconcile(&subscription_id, &customer_id, true)
            .await
    }

    fn extract_product(&self, event: Event) -> BillingResult<stripe::Product> {
        match event.data.object {
            EventObject::Product(product) => Ok(product),
            other => Err(BillingError::WebhookEventNotSupported(format!(
                "expected product payload, got {other:?}"
            ))),
        }
    }

    fn extract_price(&self, event: Event) -> BillingResult<stripe::Price> {
        match event.data.object {
            EventObject::Price(price) => Ok(price),
            other => Err(BillingError::WebhookEventNotSupported(format!(
                "expected price payload, got {other:?}"
            ))),
        }
    }

    fn extract_subscription(&self, event: Event) -> BillingResult<stripe::Subscription> {
        match event.data.object {
            EventObject::Subscription(subscription) => Ok(subscription),
            other => Err(BillingError::WebhookEventNotSupported(format!(
                "expected subscription payload, got {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &str, timestamp: i64, secret: &str) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn valid_signature_passes() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = format!("t={},v1={}", now, sign(payload, now, SECRET));

        verify_signature(payload, &header, SECRET, now).unwrap();
    }

    #[test]
    fn skewed_timestamp_within_tolerance_passes() {
        let payload = r#"{"id":"evt_1"}"#;
        let signed_at = 1_700_000_000;
        let header = format!("t={},v1={}", signed_at, sign(payload, signed_at, SECRET));

        verify_signature(payload, &header, SECRET, signed_at + 299).unwrap();
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let signed_at = 1_700_000_000;
        let header = format!("t={},v1={}", signed_at, sign(payload, signed_at, SECRET));

        let err = verify_signature(payload, &header, SECRET, signed_at + 301).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = format!("t={},v1={}", now, sign(payload, now, SECRET));

        let err =
            verify_signature(r#"{"id":"evt_2"}"#, &header, SECRET, now).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = format!("t={},v1={}", now, sign(payload, now, "whsec_other"));

        let err = verify_signature(payload, &header, SECRET, now).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[tokio::test]
    async fn authenticated_but_unparseable_payload_is_a_content_error() {
        use std::sync::Arc;

        use crate::mocks::{MemoryStore, MockProcessor};

        let store = Arc::new(MemoryStore::new());
        let processor = Arc::new(MockProcessor::new());
        let handler = WebhookHandler::new(
            SECRET.to_string(),
            CatalogService::new(store.clone()),
            SubscriptionService::new(store, processor),
        );

        let payload = "not an event";
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let header = format!("t={},v1={}", now, sign(payload, now, SECRET));

        let err = handler.verify_event(payload, &header).unwrap_err();
        assert!(matches!(err, BillingError::WebhookEventNotSupported(_)));
    }

    #[test]
    fn malformed_header_is_rejected() {
        let payload = r#"{"id":"evt_1"}"#;

        for header in ["", "t=not-a-number,v1=abc", "v1=abc", "t=1700000000"] {
            let err = verify_signature(payload, header, SECRET, 1_700_000_000).unwrap_err();
            assert!(matches!(err, BillingError::WebhookSignatureInvalid));
        }
    }
}
