//! Stripe client wrapper
//!
//! One client is constructed at process start and passed into each service;
//! no ambient global state.

use std::sync::Arc;

use crate::error::{BillingError, BillingResult};

/// Stripe configuration resolved from the environment.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Redirect target after a completed checkout.
    pub checkout_success_url: String,
    /// Redirect target when the buyer abandons checkout.
    pub checkout_cancel_url: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Internal("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Internal("STRIPE_WEBHOOK_SECRET not set".to_string()))?;
        let checkout_success_url = std::env::var("CHECKOUT_SUCCESS_URL")
            .unwrap_or_else(|_| "http://localhost:3000/sponsor/success".to_string());
        let checkout_cancel_url = std::env::var("CHECKOUT_CANCEL_URL")
            .unwrap_or_else(|_| "http://localhost:3000/sponsor/cancelled".to_string());

        Ok(Self {
            secret_key,
            webhook_secret,
            checkout_success_url,
            checkout_cancel_url,
        })
    }
}

/// Cloneable handle around the Stripe SDK client plus config.
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self {
            inner,
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
