use axum::{extract::State, Json};
use common_http_errors::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::app::AppState;
use crate::fulfillment::FulfillmentOutcome;
use crate::providers::{self, paypal, stripe, PurchaseMetadata};
use crate::repo::FulfillmentUnit;

#[derive(Debug, Deserialize)]
pub struct VerifySessionRequest {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PayPalCaptureRequest {
    pub order_id: String,
    /// Fallback for orders created without custom_id metadata.
    #[serde(default)]
    pub metadata: Option<PurchaseMetadata>,
}

#[derive(Debug, Serialize)]
pub struct UnitSummary {
    pub id: String,
    pub tier_label: String,
    pub scannable_code: String,
    pub status: String,
}

impl From<&FulfillmentUnit> for UnitSummary {
    fn from(unit: &FulfillmentUnit) -> Self {
        UnitSummary {
            id: unit.id.clone(),
            tier_label: unit.tier_label.clone(),
            scannable_code: unit.scannable_code.clone(),
            status: unit.status.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FulfillmentResponse {
    pub success: bool,
    /// True when the idempotency guard returned a previously committed result.
    pub duplicate: bool,
    pub units: Vec<UnitSummary>,
}

impl FulfillmentResponse {
    pub fn from_outcome(outcome: &FulfillmentOutcome) -> Self {
        FulfillmentResponse {
            success: true,
            duplicate: outcome.was_duplicate(),
            units: outcome.units().iter().map(UnitSummary::from).collect(),
        }
    }
}

/// Client-triggered fallback for a slow or missed Stripe webhook. The session
/// state comes from the provider, never from the client, and the fulfillment
/// path is the same idempotent one the webhook uses.
pub async fn verify_session(
    State(state): State<AppState>,
    Json(payload): Json<VerifySessionRequest>,
) -> ApiResult<Json<FulfillmentResponse>> {
    let session = state
        .stripe
        .retrieve_session(&payload.session_id)
        .await
        .map_err(|err| {
            warn!(session_id = %payload.session_id, error = %err, "session retrieval failed");
            ApiError::internal(err)
        })?;

    if !session.is_paid() {
        return Err(ApiError::BadRequest {
            code: "payment_incomplete",
            message: Some(format!(
                "payment status: {}",
                session.payment_status.as_deref().unwrap_or("unknown")
            )),
        });
    }

    let request = stripe::request_from_session(&session)?;
    let outcome = providers::execute_purchase(&state, request).await?;
    Ok(Json(FulfillmentResponse::from_outcome(&outcome)))
}

/// Client-triggered PayPal capture. A completed capture funnels into the same
/// idempotent fulfillment path as the webhook delivery of the same capture.
pub async fn paypal_capture(
    State(state): State<AppState>,
    Json(payload): Json<PayPalCaptureRequest>,
) -> ApiResult<Json<FulfillmentResponse>> {
    let response = state
        .paypal
        .capture_order(&payload.order_id)
        .await
        .map_err(|err| {
            warn!(order_id = %payload.order_id, error = %err, "paypal capture failed");
            ApiError::internal(err)
        })?;

    if response.status != "COMPLETED" {
        return Err(ApiError::BadRequest {
            code: "capture_incomplete",
            message: Some(format!("capture status: {}", response.status)),
        });
    }

    let request = paypal::request_from_capture(&response, payload.metadata)?;
    let outcome = providers::execute_purchase(&state, request).await?;
    Ok(Json(FulfillmentResponse::from_outcome(&outcome)))
}
