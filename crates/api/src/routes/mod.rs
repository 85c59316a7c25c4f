//! HTTP routes

pub mod sponsorship;
pub mod webhook;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/sponsored-checkout",
            post(sponsorship::create_sponsored_checkout),
        )
        .route("/sponsored-preview", post(sponsorship::sponsored_preview))
        .route("/area-preview", post(sponsorship::sponsored_preview))
        .route(
            "/subscription-cancel",
            post(sponsorship::subscription_cancel),
        )
        .route("/stripe-webhook", post(webhook::stripe_webhook))
        .with_state(state)
}

async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<serde_json::Value> {
    let db_ok = sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .is_ok();

    axum::Json(serde_json::json!({
        "ok": db_ok,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
