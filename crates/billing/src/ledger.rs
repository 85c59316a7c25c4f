//! Sponsorship ledger
//!
//! The persisted record of who owns which geometry in which (region,
//! category, slot). `upsert` is the ONLY writer of owned geometry; every
//! confirmation path goes through it so the database constraints see every
//! write. Postgres enforces the two invariants the availability check and
//! the eventual write cannot guarantee on their own across the payment-flow
//! gap:
//!
//! - single-owner: partial unique index over (business, region, category,
//!   slot) for active-like rows (SQLSTATE 23505);
//! - disjointness: constraint trigger rejecting materially overlapping
//!   active-like geometries in the same placement (SQLSTATE 23P01).
//!
//! Either rejection surfaces as `LedgerWriteError::Conflict`, which the
//! reconciler must treat as "cancel the billing subscription". Retrying a
//! conflicting write would conflict again.

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use patchmap_shared::SponsorshipStatus;

use crate::error::{is_exclusion_violation, is_unique_violation, BillingResult};

/// A sponsorship row. Geometry travels as GeoJSON text.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Sponsorship {
    pub id: Uuid,
    pub business_id: Uuid,
    pub region_id: Uuid,
    pub category_id: Uuid,
    pub slot: i32,
    pub status: String,
    pub owned_geojson: String,
    pub monthly_price_pence: i64,
    pub currency: String,
    pub stripe_subscription_id: String,
    pub stripe_customer_id: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

impl Sponsorship {
    pub fn status(&self) -> Option<SponsorshipStatus> {
        SponsorshipStatus::parse(&self.status)
    }
}

/// Everything needed to create or refresh a claim. Keyed on the external
/// subscription id, so replayed webhook events and in-place top-ups land on
/// the same row.
#[derive(Debug, Clone)]
pub struct SponsorshipWrite {
    pub business_id: Uuid,
    pub region_id: Uuid,
    pub category_id: Uuid,
    pub slot: i32,
    pub status: SponsorshipStatus,
    pub owned_geojson: String,
    pub monthly_price_pence: i64,
    pub currency: String,
    pub stripe_subscription_id: String,
    pub stripe_customer_id: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerWriteError {
    /// The write would violate single-owner or disjointness. Hard signal to
    /// cancel the underlying billing subscription.
    #[error("ledger rejected write: {detail}")]
    Conflict { detail: String },

    #[error("database error: {0}")]
    Database(String),
}

const SELECT_COLUMNS: &str = r#"
    id, business_id, region_id, category_id, slot, status,
    ST_AsGeoJSON(owned_geom) AS owned_geojson,
    monthly_price_pence, currency, stripe_subscription_id, stripe_customer_id,
    current_period_end, cancel_at_period_end
"#;

#[derive(Clone)]
pub struct SponsorshipLedger {
    pool: PgPool,
}

impl SponsorshipLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Atomic write-with-overlap-check.
    ///
    /// The insert is keyed on `stripe_subscription_id`: a replayed event or a
    /// re-priced upgrade updates the existing row in place rather than
    /// creating a second claim. Constraint rejections map to `Conflict`.
    pub async fn upsert(&self, write: &SponsorshipWrite) -> Result<Uuid, LedgerWriteError> {
        let result: Result<(Uuid,), sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO sponsorships
                (business_id, region_id, category_id, slot, status, owned_geom,
                 monthly_price_pence, currency, stripe_subscription_id,
                 stripe_customer_id, current_period_end, cancel_at_period_end)
            VALUES
                ($1, $2, $3, $4, $5,
                 ST_Multi(ST_CollectionExtract(ST_SetSRID(ST_GeomFromGeoJSON($6), 4326), 3)),
                 $7, $8, $9, $10, $11, $12)
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                status = EXCLUDED.status,
                owned_geom = EXCLUDED.owned_geom,
                monthly_price_pence = EXCLUDED.monthly_price_pence,
                currency = EXCLUDED.currency,
                stripe_customer_id = COALESCE(EXCLUDED.stripe_customer_id, sponsorships.stripe_customer_id),
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(write.business_id)
        .bind(write.region_id)
        .bind(write.category_id)
        .bind(write.slot)
        .bind(write.status.as_str())
        .bind(&write.owned_geojson)
        .bind(write.monthly_price_pence)
        .bind(&write.currency)
        .bind(&write.stripe_subscription_id)
        .bind(&write.stripe_customer_id)
        .bind(write.current_period_end)
        .bind(write.cancel_at_period_end)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok((id,)) => Ok(id),
            Err(e) if is_unique_violation(&e) || is_exclusion_violation(&e) => {
                Err(LedgerWriteError::Conflict {
                    detail: e.to_string(),
                })
            }
            Err(e) => Err(LedgerWriteError::Database(e.to_string())),
        }
    }

    /// Terminal cancellation keyed on the external subscription id.
    /// Idempotent: returns false when no row matched or it was already
    /// canceled.
    pub async fn mark_canceled(&self, stripe_subscription_id: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sponsorships
            SET status = 'canceled', updated_at = NOW()
            WHERE stripe_subscription_id = $1 AND status <> 'canceled'
            "#,
        )
        .bind(stripe_subscription_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Soft-cancel toggle: `active <-> canceling` on the same row. Geometry
    /// stays reserved through the paid period either way. Returns the
    /// affected row so the caller can sync the flag to the billing provider.
    pub async fn set_cancel_at_period_end(
        &self,
        business_id: Uuid,
        region_id: Uuid,
        slot: i32,
        cancel: bool,
    ) -> BillingResult<Option<Sponsorship>> {
        let query = format!(
            r#"
            UPDATE sponsorships
            SET cancel_at_period_end = $1,
                status = CASE WHEN $1 THEN 'canceling' ELSE 'active' END,
                updated_at = NOW()
            WHERE business_id = $2 AND region_id = $3 AND slot = $4
              AND status IN ('active', 'canceling')
            RETURNING {SELECT_COLUMNS}
            "#
        );

        let row: Option<Sponsorship> = sqlx::query_as(&query)
            .bind(cancel)
            .bind(business_id)
            .bind(region_id)
            .bind(slot)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    /// All live claims blocking a placement.
    pub async fn find_active_like(
        &self,
        region_id: Uuid,
        category_id: Uuid,
        slot: i32,
    ) -> BillingResult<Vec<Sponsorship>> {
        let query = format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM sponsorships
            WHERE region_id = $1 AND category_id = $2 AND slot = $3
              AND status NOT IN ('canceled', 'provisional')
            "#
        );

        let rows = sqlx::query_as(&query)
            .bind(region_id)
            .bind(category_id)
            .bind(slot)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    pub async fn find_by_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Sponsorship>> {
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM sponsorships WHERE stripe_subscription_id = $1"
        );

        let row = sqlx::query_as(&query)
            .bind(stripe_subscription_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    /// Expire scheduled cancellations whose paid period has ended. The
    /// geometry is released by the status flip; Stripe deletes the
    /// subscription on its own schedule.
    pub async fn expire_period_ended(&self) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sponsorships
            SET status = 'canceled', updated_at = NOW()
            WHERE status NOT IN ('canceled', 'provisional')
              AND cancel_at_period_end
              AND current_period_end IS NOT NULL
              AND current_period_end < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Cancel provisional rows that never received a confirming billing
    /// event. These hold no geometry claim, but leaving them around has
    /// previously confused upgrade lookups.
    pub async fn expire_stale_provisional(&self, older_than_hours: i64) -> BillingResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - Duration::hours(older_than_hours);

        let result = sqlx::query(
            r#"
            UPDATE sponsorships
            SET status = 'canceled', updated_at = NOW()
            WHERE status = 'provisional' AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
