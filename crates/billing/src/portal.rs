//! Billing portal links
//!
//! Same contract as checkout: a live user is waiting, so failures come back
//! as an error-redirect URL instead of propagating.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::checkout::{error_redirect, UserIdentity};
use crate::customer::CustomerService;
use crate::error::BillingResult;
use crate::processor::PaymentProcessor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PortalResponse {
    Redirect { url: String },
    Error { error_redirect: String },
}

#[derive(Clone)]
pub struct PortalService {
    customers: CustomerService,
    processor: Arc<dyn PaymentProcessor>,
}

impl PortalService {
    pub fn new(customers: CustomerService, processor: Arc<dyn PaymentProcessor>) -> Self {
        Self {
            customers,
            processor,
        }
    }

    /// Processor-hosted portal URL for `user`, returning there via `return_url`.
    pub async fn portal_link(&self, user: &UserIdentity, return_url: &str) -> PortalResponse {
        match self.portal_inner(user, return_url).await {
            Ok(url) => PortalResponse::Redirect { url },
            Err(err) => {
                tracing::error!(user_id = %user.id, error = %err, "portal link failed");
                PortalResponse::Error {
                    error_redirect: error_redirect(
                        return_url,
                        &err.to_string(),
                        "Please try again later or contact support.",
                    ),
                }
            }
        }
    }

    async fn portal_inner(&self, user: &UserIdentity, return_url: &str) -> BillingResult<String> {
        let customer_id = self.customers.resolve(user.id, &user.email).await?;
        let url = self
            .processor
            .create_portal_session(&customer_id, return_url)
            .await?;

        tracing::info!(user_id = %user.id, "created billing portal session");
        Ok(url)
    }
}
