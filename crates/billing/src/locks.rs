//! Checkout lock manager
//!
//! Short-lived advisory locks over a (region, category, slot) placement.
//! A lock narrows the race window between "availability says yes" and
//! "checkout session created"; the ledger's constraints remain the
//! correctness guarantee. Mutual exclusion comes from a partial unique index
//! over active rows, so two concurrent acquires cannot both succeed.

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{is_unique_violation, BillingError, BillingResult};

/// Locks outlive the longest plausible external payment flow, then expire so
/// a crashed request never blocks a placement permanently.
pub const LOCK_TTL_MINUTES: i64 = 30;

#[derive(Clone)]
pub struct LockManager {
    pool: PgPool,
}

impl LockManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Acquire the placement lock for a business.
    ///
    /// Expired locks on the placement are lazily deactivated first. Returns
    /// `CheckoutInProgress` when another live lock holds the placement.
    pub async fn acquire(
        &self,
        region_id: Uuid,
        category_id: Uuid,
        slot: i32,
        business_id: Uuid,
    ) -> BillingResult<Uuid> {
        sqlx::query(
            r#"
            UPDATE sponsorship_locks
            SET active = FALSE
            WHERE active AND expires_at < NOW()
              AND region_id = $1 AND category_id = $2 AND slot = $3
            "#,
        )
        .bind(region_id)
        .bind(category_id)
        .bind(slot)
        .execute(&self.pool)
        .await?;

        let expires_at = OffsetDateTime::now_utc() + Duration::minutes(LOCK_TTL_MINUTES);

        let inserted: Result<(Uuid,), sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO sponsorship_locks
                (region_id, category_id, slot, business_id, active, expires_at)
            VALUES ($1, $2, $3, $4, TRUE, $5)
            RETURNING id
            "#,
        )
        .bind(region_id)
        .bind(category_id)
        .bind(slot)
        .bind(business_id)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok((lock_id,)) => {
                tracing::debug!(
                    lock_id = %lock_id,
                    region_id = %region_id,
                    business_id = %business_id,
                    "Checkout lock acquired"
                );
                Ok(lock_id)
            }
            Err(e) if is_unique_violation(&e) => Err(BillingError::CheckoutInProgress),
            Err(e) => Err(e.into()),
        }
    }

    /// Release a lock. Idempotent: releasing an unknown or already-released
    /// lock is a no-op.
    pub async fn release(&self, lock_id: Uuid) -> BillingResult<()> {
        let result = sqlx::query("UPDATE sponsorship_locks SET active = FALSE WHERE id = $1")
            .bind(lock_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            tracing::debug!(lock_id = %lock_id, "Checkout lock released");
        }
        Ok(())
    }

    /// Deactivate every expired lock. Worker sweep.
    pub async fn release_expired(&self) -> BillingResult<u64> {
        let result =
            sqlx::query("UPDATE sponsorship_locks SET active = FALSE WHERE active AND expires_at < NOW()")
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }
}
