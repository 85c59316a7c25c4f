//! Sponsored-placement endpoints
//!
//! Thin request/response wrappers around the billing crate. The preview
//! endpoint is read-only and must not touch locks or the ledger.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use patchmap_billing::CancelAction;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CheckoutRequest {
    pub business_id: Uuid,
    /// The region being sponsored. `area_id` on the wire.
    pub area_id: Uuid,
    pub category_id: Uuid,
    pub slot: i32,
}

pub async fn create_sponsored_checkout(
    State(state): State<AppState>,
    Json(req): Json<CheckoutRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.slot < 1 {
        return Err(ApiError::BadRequest(format!("invalid slot {}", req.slot)));
    }

    let checkout = state
        .billing
        .checkout
        .create_sponsored_checkout(req.business_id, req.area_id, req.category_id, req.slot)
        .await?;

    Ok(Json(serde_json::json!({
        "ok": true,
        "url": checkout.url,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PreviewRequest {
    pub area_id: Uuid,
    pub category_id: Uuid,
    pub slot: i32,
    /// When set, that business's own claims are excluded, previewing an
    /// upgrade of its existing placement.
    pub business_id: Option<Uuid>,
}

pub async fn sponsored_preview(
    State(state): State<AppState>,
    Json(req): Json<PreviewRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.slot < 1 {
        return Err(ApiError::BadRequest(format!("invalid slot {}", req.slot)));
    }

    let preview = state
        .billing
        .checkout
        .preview_placement(req.area_id, req.category_id, req.slot, req.business_id)
        .await?;

    Ok(Json(serde_json::json!({
        "ok": true,
        "geojson": preview.geojson,
        "area_km2": preview.area_km2,
        "monthly_price_pence": preview.monthly_price_pence,
        "sold_out": preview.sold_out,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CancelRequest {
    pub business_id: Uuid,
    pub area_id: Uuid,
    pub slot: i32,
    /// "cancel" schedules cancellation at period end; "reactivate" reverts
    /// it before the period actually ends.
    pub action: String,
}

pub async fn subscription_cancel(
    State(state): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let action = CancelAction::parse(&req.action)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid action '{}'", req.action)))?;

    let result = state
        .billing
        .subscriptions
        .toggle_cancel_at_period_end(req.business_id, req.area_id, req.slot, action)
        .await?;

    Ok(Json(serde_json::json!({
        "ok": true,
        "status": result.status,
        "cancel_at_period_end": result.cancel_at_period_end,
        "current_period_end": result.current_period_end.map(|t| t.unix_timestamp()),
    })))
}
