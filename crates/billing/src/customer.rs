//! Stripe customer resolution

use sqlx::PgPool;
use stripe::{CreateCustomer, Customer};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Resolves the Stripe customer backing a business, creating one on first
/// use. Idempotent: a stored customer id is always reused.
#[derive(Clone)]
pub struct CustomerService {
    stripe: StripeClient,
    pool: PgPool,
}

impl CustomerService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    pub async fn get_or_create(&self, business_id: Uuid) -> BillingResult<String> {
        let row: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT name, stripe_customer_id FROM businesses WHERE id = $1")
                .bind(business_id)
                .fetch_optional(&self.pool)
                .await?;

        let (name, existing) = row.ok_or_else(|| {
            BillingError::NotFound(format!("business {business_id} not found"))
        })?;

        if let Some(customer_id) = existing {
            return Ok(customer_id);
        }

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("business_id".to_string(), business_id.to_string());

        let customer = Customer::create(
            self.stripe.inner(),
            CreateCustomer {
                name: Some(&name),
                metadata: Some(metadata),
                ..Default::default()
            },
        )
        .await?;

        let customer_id = customer.id.to_string();

        // A concurrent request may have won the race; keep whichever id was
        // persisted first so the business never flips between customers.
        let updated = sqlx::query(
            "UPDATE businesses SET stripe_customer_id = $1, updated_at = NOW()
             WHERE id = $2 AND stripe_customer_id IS NULL",
        )
        .bind(&customer_id)
        .bind(business_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            let winner: Option<(Option<String>,)> =
                sqlx::query_as("SELECT stripe_customer_id FROM businesses WHERE id = $1")
                    .bind(business_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some((Some(winner_id),)) = winner {
                tracing::debug!(
                    business_id = %business_id,
                    "Concurrent customer creation, reusing persisted id"
                );
                return Ok(winner_id);
            }
        }

        tracing::info!(
            business_id = %business_id,
            customer_id = %customer_id,
            "Stripe customer created"
        );
        Ok(customer_id)
    }

    /// Resolve a business by its Stripe customer id. Fallback path used by
    /// the reconciler when subscription metadata is absent.
    pub async fn business_for_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM businesses WHERE stripe_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }
}
