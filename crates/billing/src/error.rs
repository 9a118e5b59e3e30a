//! Billing error types

use uuid::Uuid;

use crate::store::StoreError;

pub type BillingResult<T> = Result<T, BillingError>;

/// Errors produced by the billing reconciliation engine.
///
/// Reconciliation entry points propagate these to the webhook layer, which
/// signals redelivery by failing the HTTP response. User-facing flows
/// (checkout, portal) never surface these directly; they convert every
/// failure into an error redirect instead.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// A catalog upsert or delete failed. Never retried; the webhook sender
    /// redelivers the event.
    #[error("catalog sync failed during {op} of {entity_id}: {source}")]
    CatalogSync {
        op: &'static str,
        entity_id: String,
        #[source]
        source: StoreError,
    },

    /// Customer identity resolution failed; the calling operation aborts.
    #[error("could not resolve billing customer for user {user_id}: {reason}")]
    CustomerResolution { user_id: Uuid, reason: String },

    /// No local customer row matches the processor customer id carried by a
    /// subscription event.
    #[error("no customer mapping for processor customer {0}")]
    CustomerNotFound(String),

    /// The conflict-retry budget ran out while a write kept hitting a
    /// foreign-key race.
    #[error("retry budget exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("payment processor error: {0}")]
    Processor(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("unsupported webhook payload: {0}")]
    WebhookEventNotSupported(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<crate::processor::ProcessorError> for BillingError {
    fn from(err: crate::processor::ProcessorError) -> Self {
        BillingError::Processor(err.to_string())
    }
}
