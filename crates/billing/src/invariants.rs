//! Sponsorship Invariants Module
//!
//! Provides runnable consistency checks for the sponsored-placement system.
//! These invariants can be run after any mutation or webhook replay to ensure
//! the system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write
//! 4. **Complete**: Covers the consistency requirements the constraints enforce

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Business(es) affected
    pub business_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - two businesses may be billed for the same area
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for overlapping-geometry violation
#[derive(Debug, sqlx::FromRow)]
struct OverlapRow {
    first_id: Uuid,
    second_id: Uuid,
    first_business: Uuid,
    second_business: Uuid,
    region_id: Uuid,
    slot: i32,
    overlap_m2: f64,
}

/// Row type for multiple-claims violation
#[derive(Debug, sqlx::FromRow)]
struct MultipleClaimsRow {
    business_id: Uuid,
    region_id: Uuid,
    slot: i32,
    claim_count: i64,
}

/// Row type for canceled without period end violation
#[derive(Debug, sqlx::FromRow)]
struct CanceledNoPeriodEndRow {
    sponsorship_id: Uuid,
    business_id: Uuid,
    status: String,
}

/// Row type for stale provisional violation
#[derive(Debug, sqlx::FromRow)]
struct StaleProvisionalRow {
    sponsorship_id: Uuid,
    business_id: Uuid,
    created_at: OffsetDateTime,
}

/// Row type for missing subscription id violation
#[derive(Debug, sqlx::FromRow)]
struct MissingSubscriptionRow {
    sponsorship_id: Uuid,
    business_id: Uuid,
    status: String,
}

/// Service for running sponsorship invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_disjoint_geometries().await?);
        violations.extend(self.check_single_claim_per_placement().await?);
        violations.extend(self.check_canceled_has_period_end().await?);
        violations.extend(self.check_no_stale_provisional().await?);
        violations.extend(self.check_active_has_subscription().await?);

        let checks_run = 5;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: active-like geometries are pairwise disjoint
    ///
    /// Two overlapping live claims in the same (region, category, slot)
    /// mean two businesses are being billed for the same physical area.
    /// The constraint trigger should make this unrepresentable; this check
    /// is the audit that it did.
    async fn check_disjoint_geometries(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OverlapRow> = sqlx::query_as(
            r#"
            SELECT
                a.id AS first_id,
                b.id AS second_id,
                a.business_id AS first_business,
                b.business_id AS second_business,
                a.region_id,
                a.slot,
                ST_Area(ST_Intersection(a.owned_geom, b.owned_geom)::geography) AS overlap_m2
            FROM sponsorships a
            JOIN sponsorships b
              ON a.id < b.id
             AND a.region_id = b.region_id
             AND a.category_id = b.category_id
             AND a.slot = b.slot
            WHERE a.status NOT IN ('canceled', 'provisional')
              AND b.status NOT IN ('canceled', 'provisional')
              AND ST_Intersects(a.owned_geom, b.owned_geom)
              AND ST_Area(ST_Intersection(a.owned_geom, b.owned_geom)::geography) > 1.0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "disjoint_geometries".to_string(),
                business_ids: vec![row.first_business, row.second_business],
                description: format!(
                    "Two live sponsorships overlap by {:.1} m² in region {} slot {}",
                    row.overlap_m2, row.region_id, row.slot
                ),
                context: serde_json::json!({
                    "first_sponsorship": row.first_id,
                    "second_sponsorship": row.second_id,
                    "overlap_m2": row.overlap_m2,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: at most one live claim per (business, region, category, slot)
    ///
    /// A duplicate claim means the business has two subscriptions billing
    /// for the same placement.
    async fn check_single_claim_per_placement(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleClaimsRow> = sqlx::query_as(
            r#"
            SELECT business_id, region_id, slot, COUNT(*) AS claim_count
            FROM sponsorships
            WHERE status NOT IN ('canceled', 'provisional')
            GROUP BY business_id, region_id, category_id, slot
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_claim_per_placement".to_string(),
                business_ids: vec![row.business_id],
                description: format!(
                    "Business has {} live claims on region {} slot {} (expected 1)",
                    row.claim_count, row.region_id, row.slot
                ),
                context: serde_json::json!({
                    "claim_count": row.claim_count,
                    "region_id": row.region_id,
                    "slot": row.slot,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: canceled sponsorships that went through a billing cycle
    /// have a period_end, so access revocation is datable.
    async fn check_canceled_has_period_end(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledNoPeriodEndRow> = sqlx::query_as(
            r#"
            SELECT s.id AS sponsorship_id, s.business_id, s.status
            FROM sponsorships s
            WHERE s.status = 'canceled'
              AND s.current_period_end IS NULL
              AND EXISTS (SELECT 1 FROM invoices i WHERE i.sponsorship_id = s.id)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_has_period_end".to_string(),
                business_ids: vec![row.business_id],
                description: "Canceled sponsorship with invoices has no period_end date"
                    .to_string(),
                context: serde_json::json!({
                    "sponsorship_id": row.sponsorship_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: provisional rows do not linger
    ///
    /// A provisional row older than a day means a checkout session was
    /// created but no confirming or canceling event ever arrived, or the
    /// worker sweep is not running.
    async fn check_no_stale_provisional(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleProvisionalRow> = sqlx::query_as(
            r#"
            SELECT id AS sponsorship_id, business_id, created_at
            FROM sponsorships
            WHERE status = 'provisional'
              AND created_at < NOW() - INTERVAL '24 hours'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stale_provisional".to_string(),
                business_ids: vec![row.business_id],
                description: format!(
                    "Provisional sponsorship created {} never confirmed",
                    row.created_at
                ),
                context: serde_json::json!({
                    "sponsorship_id": row.sponsorship_id,
                    "created_at": row.created_at.to_string(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 5: live claims carry a billing subscription id
    async fn check_active_has_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingSubscriptionRow> = sqlx::query_as(
            r#"
            SELECT id AS sponsorship_id, business_id, status
            FROM sponsorships
            WHERE status NOT IN ('canceled', 'provisional')
              AND stripe_subscription_id = ''
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_has_subscription".to_string(),
                business_ids: vec![row.business_id],
                description: format!(
                    "Live sponsorship in status '{}' has no billing subscription",
                    row.status
                ),
                context: serde_json::json!({
                    "sponsorship_id": row.sponsorship_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "disjoint_geometries" => self.check_disjoint_geometries().await,
            "single_claim_per_placement" => self.check_single_claim_per_placement().await,
            "canceled_has_period_end" => self.check_canceled_has_period_end().await,
            "no_stale_provisional" => self.check_no_stale_provisional().await,
            "active_has_subscription" => self.check_active_has_subscription().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "disjoint_geometries",
            "single_claim_per_placement",
            "canceled_has_period_end",
            "no_stale_provisional",
            "active_has_subscription",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"disjoint_geometries"));
        assert!(checks.contains(&"single_claim_per_placement"));
    }
}
