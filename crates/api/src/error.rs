//! API error mapping
//!
//! Availability conflicts are expected business outcomes and surface as 409
//! with a machine-readable code (and the conflicting owner where known), so
//! the UI can tell a buyer who owns the placement or that nothing remains.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use patchmap_billing::BillingError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("invalid request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &message,
                None,
            ),
            ApiError::Billing(e) => billing_error_response(e),
        }
    }
}

fn billing_error_response(e: BillingError) -> Response {
    let code = e.code();
    match e {
        BillingError::SlotTaken { owner_business_id } => error_response(
            StatusCode::CONFLICT,
            code,
            "this placement is already sponsored by another business",
            Some(owner_business_id),
        ),
        BillingError::AlreadySponsored => error_response(
            StatusCode::CONFLICT,
            code,
            "you already sponsor this placement",
            None,
        ),
        BillingError::NoRemaining => error_response(
            StatusCode::CONFLICT,
            code,
            "no purchasable area remains in this placement",
            None,
        ),
        BillingError::CheckoutInProgress => error_response(
            StatusCode::CONFLICT,
            code,
            "another checkout for this placement is in progress, try again shortly",
            None,
        ),
        BillingError::WebhookSignatureInvalid => error_response(
            StatusCode::BAD_REQUEST,
            code,
            "webhook signature verification failed",
            None,
        ),
        BillingError::InvalidInput(message) => {
            error_response(StatusCode::BAD_REQUEST, code, &message, None)
        }
        BillingError::NotFound(message)
        | BillingError::CustomerNotFound(message)
        | BillingError::SubscriptionNotFound(message) => {
            error_response(StatusCode::NOT_FOUND, code, &message, None)
        }
        other => {
            tracing::error!(error = %other, "Internal error handling request");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "internal server error",
                None,
            )
        }
    }
}

fn error_response(
    status: StatusCode,
    code: &str,
    message: &str,
    owner_business_id: Option<Uuid>,
) -> Response {
    let mut body = serde_json::json!({
        "ok": false,
        "code": code,
        "message": message,
    });
    if let Some(owner) = owner_business_id {
        body["owner_business_id"] = serde_json::json!(owner);
    }
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflicts_map_to_409() {
        let response =
            ApiError::Billing(BillingError::NoRemaining).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = ApiError::Billing(BillingError::SlotTaken {
            owner_business_id: Uuid::new_v4(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_signature_failure_maps_to_400() {
        let response =
            ApiError::Billing(BillingError::WebhookSignatureInvalid).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let response =
            ApiError::Billing(BillingError::NotFound("region".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
