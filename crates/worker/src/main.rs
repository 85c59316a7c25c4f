// Worker clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Patchmap Background Worker
//!
//! Handles scheduled maintenance including:
//! - Expired checkout-lock release (every minute)
//! - Period-end expiry of scheduled cancellations (every 15 minutes)
//! - Stale provisional sponsorship cleanup (hourly)
//! - Ledger invariant sweep (hourly)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use patchmap_billing::{BillingService, InvariantCheckSummary};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Log the outcome of an invariant sweep
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(
            checks_run = summary.checks_run,
            "Invariant sweep complete, ledger healthy"
        );
        return;
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Invariant sweep found violations"
    );

    for violation in &summary.violations {
        error!(
            invariant = %violation.invariant,
            severity = %violation.severity,
            business_ids = ?violation.business_ids,
            context = %violation.context,
            "{}",
            violation.description
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Patchmap Worker");

    let pool = create_db_pool().await?;

    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Without Stripe the sweeps below are still safe to run against
            // the database, but a misconfigured worker usually means a
            // misconfigured deployment; fail fast instead of limping.
            anyhow::bail!("Failed to create billing service: {e}");
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: release expired checkout locks (every minute)
    let lock_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = lock_billing.clone();
            Box::pin(async move {
                match billing.locks.release_expired().await {
                    Ok(0) => {}
                    Ok(released) => info!(released = released, "Expired checkout locks released"),
                    Err(e) => error!(error = %e, "Failed to release expired locks"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: expired lock release (every minute)");

    // Job 2: expire scheduled cancellations past period end (every 15 minutes)
    let expiry_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = expiry_billing.clone();
            Box::pin(async move {
                match billing.ledger.expire_period_ended().await {
                    Ok(0) => {}
                    Ok(expired) => {
                        info!(expired = expired, "Period-ended sponsorships expired")
                    }
                    Err(e) => error!(error = %e, "Failed to expire period-ended sponsorships"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: period-end expiry (every 15 minutes)");

    // Job 3: cancel stale provisional sponsorships (hourly)
    let provisional_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 10 * * * *", move |_uuid, _l| {
            let billing = provisional_billing.clone();
            Box::pin(async move {
                match billing.ledger.expire_stale_provisional(24).await {
                    Ok(0) => {}
                    Ok(cleaned) => {
                        info!(cleaned = cleaned, "Stale provisional sponsorships canceled")
                    }
                    Err(e) => error!(error = %e, "Failed to clean stale provisional rows"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: stale provisional cleanup (hourly)");

    // Job 4: ledger invariant sweep (hourly)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 25 * * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                match billing.invariants.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: invariant sweep (hourly)");

    // Job 5: health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: health check heartbeat (every 5 minutes)");

    scheduler.start().await?;
    info!("Worker scheduler started");

    // Keep the process alive; jobs run on the scheduler's own tasks.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
