//! Billing error types

use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("database error: {0}")]
    Database(String),

    #[error("stripe error: {0}")]
    Stripe(#[from] stripe::StripeError),

    #[error("webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("customer not found: {0}")]
    CustomerNotFound(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Another business already holds an active-like claim on the placement.
    #[error("slot already taken by another business")]
    SlotTaken { owner_business_id: Uuid },

    /// The caller already holds an active-like claim on the placement.
    #[error("business already sponsors this placement")]
    AlreadySponsored,

    /// Nothing purchasable remains in the region for this placement.
    #[error("no remaining area to sponsor")]
    NoRemaining,

    /// A concurrent checkout holds the advisory lock for this placement.
    #[error("a checkout for this placement is already in progress")]
    CheckoutInProgress,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl BillingError {
    /// Machine-readable code for the HTTP surface.
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::SlotTaken { .. } => "slot_taken",
            BillingError::AlreadySponsored => "already_sponsored",
            BillingError::NoRemaining => "no_remaining",
            BillingError::CheckoutInProgress => "checkout_in_progress",
            BillingError::WebhookSignatureInvalid => "invalid_signature",
            BillingError::InvalidInput(_) => "invalid_input",
            BillingError::NotFound(_)
            | BillingError::CustomerNotFound(_)
            | BillingError::SubscriptionNotFound(_) => "not_found",
            _ => "internal_error",
        }
    }

    /// True for the expected availability-conflict outcomes (HTTP 409).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            BillingError::SlotTaken { .. }
                | BillingError::AlreadySponsored
                | BillingError::NoRemaining
                | BillingError::CheckoutInProgress
        )
    }
}

/// SQLSTATE 23505, raised by the partial unique indexes.
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// SQLSTATE 23P01, raised by the disjointness constraint trigger.
pub fn is_exclusion_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23P01"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_codes() {
        let e = BillingError::SlotTaken {
            owner_business_id: Uuid::new_v4(),
        };
        assert_eq!(e.code(), "slot_taken");
        assert!(e.is_conflict());

        assert_eq!(BillingError::NoRemaining.code(), "no_remaining");
        assert!(BillingError::NoRemaining.is_conflict());
        assert!(!BillingError::Internal("x".into()).is_conflict());
    }
}
