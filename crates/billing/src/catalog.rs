//! Mirrors the processor's product and price catalog into the local store.
//!
//! The processor is the source of truth; every operation here is an
//! idempotent full-record replace keyed by the processor id, so replayed
//! events converge on the same row.

use std::sync::Arc;

use crate::error::{BillingError, BillingResult};
use crate::store::{BillingStore, PriceRecord, ProductRecord, StoreError};

#[derive(Clone)]
pub struct CatalogService {
    store: Arc<dyn BillingStore>,
}

impl CatalogService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    fn sync_error(op: &'static str, entity_id: &str, source: StoreError) -> BillingError {
        BillingError::CatalogSync {
            op,
            entity_id: entity_id.to_string(),
            source,
        }
    }

    pub async fn upsert_product(&self, product: &ProductRecord) -> BillingResult<()> {
        self.store
            .upsert_product(product)
            .await
            .map_err(|err| Self::sync_error("product upsert", &product.id, err))?;

        tracing::info!(product_id = %product.id, "product record synced");
        Ok(())
    }

    pub async fn upsert_price(&self, price: &PriceRecord) -> BillingResult<()> {
        self.store
            .upsert_price(price)
            .await
            .map_err(|err| Self::sync_error("price upsert", &price.id, err))?;

        tracing::info!(price_id = %price.id, "price record synced");
        Ok(())
    }

    pub async fn delete_product(&self, product_id: &str) -> BillingResult<()> {
        self.store
            .delete_product(product_id)
            .await
            .map_err(|err| Self::sync_error("product delete", product_id, err))?;

        tracing::info!(product_id = %product_id, "product record deleted");
        Ok(())
    }

    pub async fn delete_price(&self, price_id: &str) -> BillingResult<()> {
        self.store
            .delete_price(price_id)
            .await
            .map_err(|err| Self::sync_error("price delete", price_id, err))?;

        tracing::info!(price_id = %price_id, "price record deleted");
        Ok(())
    }
}
