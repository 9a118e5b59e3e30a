//! Maps application users onto processor customers.
//!
//! The mapping table can drift: a locally recorded customer id may have been
//! deleted on the processor side, or the customer may exist remotely with no
//! local row. `resolve` repairs both directions and always hands back an id
//! that was live on the processor at resolution time.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::processor::PaymentProcessor;
use crate::store::{BillingStore, CustomerRecord};

#[derive(Clone)]
pub struct CustomerService {
    store: Arc<dyn BillingStore>,
    processor: Arc<dyn PaymentProcessor>,
}

impl CustomerService {
    pub fn new(store: Arc<dyn BillingStore>, processor: Arc<dyn PaymentProcessor>) -> Self {
        Self { store, processor }
    }

    /// Resolve the processor customer id for `user_id`, creating or repairing
    /// the mapping as needed.
    pub async fn resolve(&self, user_id: Uuid, email: &str) -> BillingResult<String> {
        let existing = self.store.get_customer_by_user(user_id).await?;

        // A recorded id only counts if the processor still knows it.
        if let Some(record) = &existing {
            if self
                .processor
                .retrieve_customer(&record.processor_customer_id)
                .await?
                .is_some()
            {
                return Ok(record.processor_customer_id.clone());
            }

            tracing::warn!(
                user_id = %user_id,
                processor_customer_id = %record.processor_customer_id,
                "recorded processor customer no longer exists, re-resolving"
            );
        }

        let processor_customer_id = self.find_or_create(user_id, email).await?;

        match existing {
            Some(_) => {
                // Stale mapping: repair in place so old references keep working.
                self.store
                    .update_customer_processor_id(user_id, &processor_customer_id)
                    .await?;
                tracing::warn!(
                    user_id = %user_id,
                    processor_customer_id = %processor_customer_id,
                    "repaired stale customer mapping"
                );
            }
            None => {
                self.store
                    .insert_customer(&CustomerRecord {
                        user_id,
                        processor_customer_id: processor_customer_id.clone(),
                    })
                    .await?;
                tracing::info!(
                    user_id = %user_id,
                    processor_customer_id = %processor_customer_id,
                    "created customer mapping"
                );
            }
        }

        Ok(processor_customer_id)
    }

    /// Adopt an existing processor customer when the email matches exactly
    /// one, otherwise create a fresh one tagged with the user id.
    async fn find_or_create(&self, user_id: Uuid, email: &str) -> BillingResult<String> {
        let matches = self.processor.list_customers_by_email(email).await?;

        if matches.len() == 1 {
            if let Some(id) = matches.into_iter().next() {
                return Ok(id);
            }
        }

        let created = self.processor.create_customer(email, user_id).await?;
        if created.is_empty() {
            return Err(BillingError::CustomerResolution {
                user_id,
                reason: "processor returned an empty customer id".to_string(),
            });
        }

        Ok(created)
    }

    /// Reverse lookup: which user owns this processor customer id.
    pub async fn user_for_processor_customer(
        &self,
        processor_customer_id: &str,
    ) -> BillingResult<Uuid> {
        self.store
            .get_customer_by_processor_id(processor_customer_id)
            .await?
            .map(|record| record.user_id)
            .ok_or_else(|| BillingError::CustomerNotFound(processor_customer_id.to_string()))
    }
}
