// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Checkout session creation takes the full purchase context
#![allow(clippy::type_complexity)] // Complex return types for sqlx row tuples
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Patchmap Billing Module
//!
//! Handles the sponsored-placement billing core: availability, pricing,
//! checkout, and webhook reconciliation against the sponsorship ledger.
//!
//! ## Features
//!
//! - **Availability**: authoritative remaining-area computation per placement
//! - **Pricing**: area-based monthly pricing with a configurable floor
//! - **Checkout**: dynamically priced recurring Stripe checkout sessions
//! - **Ledger**: constraint-backed claim records (disjoint, single-owner)
//! - **Reconciliation**: idempotent webhook handling with conflict rollback
//! - **Locks**: advisory checkout locks with TTL
//! - **Invariants**: runnable consistency checks over the ledger
//! - **Audit**: billing event trail for every mutation and outcome

pub mod availability;
pub mod checkout;
pub mod client;
pub mod customer;
pub mod error;
pub mod events;
pub mod invariants;
pub mod invoices;
pub mod ledger;
pub mod locks;
pub mod pricing;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Availability
pub use availability::{AvailabilityService, RemainingArea};

// Checkout
pub use checkout::{CheckoutResponse, CheckoutService, PlacementPreview};

// Client
pub use client::{StripeClient, StripeConfig};

// Customer
pub use customer::CustomerService;

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Invoices
pub use invoices::{InvoiceLink, InvoiceService, InvoiceUpsert};

// Ledger
pub use ledger::{LedgerWriteError, Sponsorship, SponsorshipLedger, SponsorshipWrite};

// Locks
pub use locks::{LockManager, LOCK_TTL_MINUTES};

// Pricing
pub use pricing::{PricingConfig, RateCard};

// Subscriptions
pub use subscriptions::{CancelAction, CancelToggleResult, SubscriptionService};

// Webhooks
pub use webhooks::{CheckoutContext, ReconcileOutcome, WebhookHandler};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub availability: AvailabilityService,
    pub checkout: CheckoutService,
    pub customer: CustomerService,
    pub invariants: InvariantChecker,
    pub invoices: InvoiceService,
    pub ledger: SponsorshipLedger,
    pub locks: LockManager,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let pricing = PricingConfig::from_env();
        Ok(Self::new(stripe, pricing, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(stripe: StripeClient, pricing: PricingConfig, pool: PgPool) -> Self {
        Self {
            availability: AvailabilityService::new(pool.clone()),
            checkout: CheckoutService::new(stripe.clone(), pool.clone(), pricing.clone()),
            customer: CustomerService::new(stripe.clone(), pool.clone()),
            invariants: InvariantChecker::new(pool.clone()),
            invoices: InvoiceService::new(pool.clone()),
            ledger: SponsorshipLedger::new(pool.clone()),
            locks: LockManager::new(pool.clone()),
            subscriptions: SubscriptionService::new(stripe.clone(), pool.clone()),
            webhooks: WebhookHandler::new(stripe, pool, pricing),
        }
    }
}
