//! In-memory test doubles for the store and processor capabilities.

#![allow(clippy::unwrap_used)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::processor::{
    CheckoutSessionHandle, CheckoutSessionParams, PaymentProcessor, ProcessorCustomer,
    ProcessorError, ProcessorResult, ProcessorSubscription, SubscriptionPriceChange,
};
use crate::store::{
    BillingDetails, BillingStore, CustomerRecord, PriceRecord, ProductRecord, StoreError,
    StoreResult, SubscriptionRecord,
};

/// `BillingStore` backed by hash maps, with injectable failures for a queued
/// number of writes.
#[derive(Default)]
pub(crate) struct MemoryStore {
    customers: Mutex<HashMap<Uuid, CustomerRecord>>,
    products: Mutex<HashMap<String, ProductRecord>>,
    prices: Mutex<HashMap<String, PriceRecord>>,
    subscriptions: Mutex<HashMap<String, SubscriptionRecord>>,
    billing_details: Mutex<HashMap<Uuid, BillingDetails>>,
    product_upsert_failures: Mutex<VecDeque<StoreError>>,
    subscription_upsert_failures: Mutex<VecDeque<StoreError>>,
    subscription_upsert_attempts: AtomicU32,
    billing_details_writes: AtomicU32,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn seed_customer(&self, user_id: Uuid, processor_customer_id: &str) {
        self.customers.lock().unwrap().insert(
            user_id,
            CustomerRecord {
                user_id,
                processor_customer_id: processor_customer_id.to_string(),
            },
        );
    }

    pub(crate) fn fail_next_product_upsert(&self, err: StoreError) {
        self.product_upsert_failures.lock().unwrap().push_back(err);
    }

    pub(crate) fn fail_next_subscription_upserts(&self, errs: Vec<StoreError>) {
        self.subscription_upsert_failures
            .lock()
            .unwrap()
            .extend(errs);
    }

    pub(crate) fn customers(&self) -> HashMap<Uuid, CustomerRecord> {
        self.customers.lock().unwrap().clone()
    }

    pub(crate) fn products(&self) -> HashMap<String, ProductRecord> {
        self.products.lock().unwrap().clone()
    }

    pub(crate) fn prices(&self) -> HashMap<String, PriceRecord> {
        self.prices.lock().unwrap().clone()
    }

    pub(crate) fn subscriptions(&self) -> HashMap<String, SubscriptionRecord> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub(crate) fn billing_details(&self) -> HashMap<Uuid, BillingDetails> {
        self.billing_details.lock().unwrap().clone()
    }

    pub(crate) fn subscription_upsert_attempts(&self) -> u32 {
        self.subscription_upsert_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn billing_details_writes(&self) -> u32 {
        self.billing_details_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn upsert_product(&self, product: &ProductRecord) -> StoreResult<()> {
        if let Some(err) = self.product_upsert_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.products
            .lock()
            .unwrap()
            .insert(product.id.clone(), product.clone());
        Ok(())
    }

    async fn upsert_price(&self, price: &PriceRecord) -> StoreResult<()> {
        self.prices
            .lock()
            .unwrap()
            .insert(price.id.clone(), price.clone());
        Ok(())
    }

    async fn delete_product(&self, product_id: &str) -> StoreResult<()> {
        self.products.lock().unwrap().remove(product_id);
        Ok(())
    }

    async fn delete_price(&self, price_id: &str) -> StoreResult<()> {
        self.prices.lock().unwrap().remove(price_id);
        Ok(())
    }

    async fn get_customer_by_user(&self, user_id: Uuid) -> StoreResult<Option<CustomerRecord>> {
        Ok(self.customers.lock().unwrap().get(&user_id).cloned())
    }

    async fn get_customer_by_processor_id(
        &self,
        processor_customer_id: &str,
    ) -> StoreResult<Option<CustomerRecord>> {
        Ok(self
            .customers
            .lock()
            .unwrap()
            .values()
            .find(|record| record.processor_customer_id == processor_customer_id)
            .cloned())
    }

    async fn insert_customer(&self, record: &CustomerRecord) -> StoreResult<()> {
        let mut customers = self.customers.lock().unwrap();
        if customers.contains_key(&record.user_id) {
            return Err(StoreError::UniqueViolation(
                "billing_customers_pkey".to_string(),
            ));
        }
        customers.insert(record.user_id, record.clone());
        Ok(())
    }

    async fn update_customer_processor_id(
        &self,
        user_id: Uuid,
        processor_customer_id: &str,
    ) -> StoreResult<()> {
        let mut customers = self.customers.lock().unwrap();
        match customers.get_mut(&user_id) {
            Some(record) => {
                record.processor_customer_id = processor_customer_id.to_string();
                Ok(())
            }
            None => Err(StoreError::NotFound(user_id.to_string())),
        }
    }

    async fn upsert_subscription(&self, subscription: &SubscriptionRecord) -> StoreResult<()> {
        self.subscription_upsert_attempts
            .fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self
            .subscription_upsert_failures
            .lock()
            .unwrap()
            .pop_front()
        {
            return Err(err);
        }
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription.id.clone(), subscription.clone());
        Ok(())
    }

    async fn update_user_billing_details(
        &self,
        user_id: Uuid,
        details: &BillingDetails,
    ) -> StoreResult<()> {
        self.billing_details_writes.fetch_add(1, Ordering::SeqCst);
        self.billing_details
            .lock()
            .unwrap()
            .insert(user_id, details.clone());
        Ok(())
    }
}

/// `PaymentProcessor` double that records its calls and serves configured
/// customers and subscriptions.
#[derive(Default)]
pub(crate) struct MockProcessor {
    customers: Mutex<Vec<ProcessorCustomer>>,
    subscriptions: Mutex<HashMap<String, ProcessorSubscription>>,
    created_customers: AtomicU32,
    expanded_retrievals: AtomicU32,
    created_sessions: Mutex<Vec<CheckoutSessionParams>>,
    price_updates: Mutex<Vec<(String, SubscriptionPriceChange)>>,
    session_failure: Mutex<Option<ProcessorError>>,
    portal_failure: Mutex<Option<ProcessorError>>,
}

impl MockProcessor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_customer(&self, id: &str, email: &str) {
        self.customers.lock().unwrap().push(ProcessorCustomer {
            id: id.to_string(),
            email: Some(email.to_string()),
        });
    }

    pub(crate) fn add_subscription(&self, subscription: ProcessorSubscription) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription.id.clone(), subscription);
    }

    pub(crate) fn fail_next_session(&self, err: ProcessorError) {
        *self.session_failure.lock().unwrap() = Some(err);
    }

    pub(crate) fn fail_next_portal(&self, err: ProcessorError) {
        *self.portal_failure.lock().unwrap() = Some(err);
    }

    pub(crate) fn created_customer_count(&self) -> u32 {
        self.created_customers.load(Ordering::SeqCst)
    }

    pub(crate) fn expanded_retrievals(&self) -> u32 {
        self.expanded_retrievals.load(Ordering::SeqCst)
    }

    pub(crate) fn created_sessions(&self) -> Vec<CheckoutSessionParams> {
        self.created_sessions.lock().unwrap().clone()
    }

    pub(crate) fn price_updates(&self) -> Vec<(String, SubscriptionPriceChange)> {
        self.price_updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentProcessor for MockProcessor {
    async fn create_customer(&self, email: &str, _user_id: Uuid) -> ProcessorResult<String> {
        let n = self.created_customers.fetch_add(1, Ordering::SeqCst);
        let id = format!("cus_mock_{n}");
        self.customers.lock().unwrap().push(ProcessorCustomer {
            id: id.clone(),
            email: Some(email.to_string()),
        });
        Ok(id)
    }

    async fn list_customers_by_email(&self, email: &str) -> ProcessorResult<Vec<String>> {
        Ok(self
            .customers
            .lock()
            .unwrap()
            .iter()
            .filter(|customer| customer.email.as_deref() == Some(email))
            .map(|customer| customer.id.clone())
            .collect())
    }

    async fn retrieve_customer(
        &self,
        customer_id: &str,
    ) -> ProcessorResult<Option<ProcessorCustomer>> {
        Ok(self
            .customers
            .lock()
            .unwrap()
            .iter()
            .find(|customer| customer.id == customer_id)
            .cloned())
    }

    async fn list_active_subscriptions(
        &self,
        customer_id: &str,
    ) -> ProcessorResult<Vec<ProcessorSubscription>> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .filter(|sub| sub.customer_id == customer_id && sub.status == "active")
            .cloned()
            .collect())
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
        expand_payment_method: bool,
    ) -> ProcessorResult<ProcessorSubscription> {
        let mut subscription = self
            .subscriptions
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| {
                ProcessorError::Api(format!("no such subscription: {subscription_id}"))
            })?;

        if expand_payment_method {
            self.expanded_retrievals.fetch_add(1, Ordering::SeqCst);
        } else {
            // An unexpanded retrieval never carries payment method details.
            subscription.default_payment_method = None;
        }

        Ok(subscription)
    }

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        change: SubscriptionPriceChange,
    ) -> ProcessorResult<ProcessorSubscription> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let subscription = subscriptions.get_mut(subscription_id).ok_or_else(|| {
            ProcessorError::Api(format!("no such subscription: {subscription_id}"))
        })?;

        subscription.price_id = Some(change.price_id.clone());
        subscription.trial_end = change.trial_end;

        self.price_updates
            .lock()
            .unwrap()
            .push((subscription_id.to_string(), change));

        Ok(subscription.clone())
    }

    async fn create_checkout_session(
        &self,
        params: CheckoutSessionParams,
    ) -> ProcessorResult<CheckoutSessionHandle> {
        if let Some(err) = self.session_failure.lock().unwrap().take() {
            return Err(err);
        }

        let mut sessions = self.created_sessions.lock().unwrap();
        let id = format!("cs_mock_{}", sessions.len());
        sessions.push(params);

        Ok(CheckoutSessionHandle {
            url: Some(format!("https://checkout.mock/{id}")),
            id,
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> ProcessorResult<String> {
        if let Some(err) = self.portal_failure.lock().unwrap().take() {
            return Err(err);
        }

        Ok(format!(
            "https://portal.mock/{customer_id}?return_url={return_url}"
        ))
    }
}
