//! Stripe webhook endpoint
//!
//! Signature verification runs against the raw request body before any
//! processing; an invalid signature is a hard 400. Every handled outcome,
//! including conflict cancellations, answers 200 so Stripe does not retry
//! events the system has already resolved.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<serde_json::Value>, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing stripe-signature header".to_string()))?;

    let event = state.billing.webhooks.verify_event(&body, signature)?;

    let outcome = state.billing.webhooks.handle_event(event).await?;

    tracing::debug!(outcome = %outcome.label(), "Webhook event handled");

    Ok(Json(serde_json::json!({ "ok": true })))
}
