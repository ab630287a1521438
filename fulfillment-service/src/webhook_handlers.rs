use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use chrono::Utc;
use common_http_errors::{ApiError, ApiResult};
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::app::AppState;
use crate::providers::{self, paypal, stripe};

/// Stripe webhook endpoint. Signature verification runs on the raw request
/// bytes before any parsing; a verified signal that routes to a no-op still
/// returns 200 so the provider stops retrying.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let header = headers
        .get(stripe::SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            state
                .metrics
                .webhook_rejections_total
                .with_label_values(&["stripe", "missing_signature"])
                .inc();
            ApiError::bad_request("invalid_signature")
        })?;

    if let Err(err) = stripe::verify_signature(
        &body,
        header,
        &state.stripe_webhook_secret,
        state.webhook_max_skew_secs,
        Utc::now().timestamp(),
    ) {
        state
            .metrics
            .webhook_rejections_total
            .with_label_values(&["stripe", "invalid_signature"])
            .inc();
        warn!(error = %err, "stripe webhook rejected");
        return Err(ApiError::bad_request("invalid_signature"));
    }

    let event: stripe::StripeEvent = serde_json::from_slice(&body).map_err(|err| {
        ApiError::BadRequest {
            code: "malformed_payload",
            message: Some(err.to_string()),
        }
    })?;
    let normalized = stripe::normalize(&event)?;
    providers::route_event(&state, normalized).await?;
    Ok(Json(json!({ "received": true })))
}

/// PayPal webhook endpoint. Authenticity is checked by handing the raw body
/// and transmission headers to the provider's verification API.
pub async fn paypal_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let transmission = paypal::TransmissionHeaders::from_headers(&headers).ok_or_else(|| {
        state
            .metrics
            .webhook_rejections_total
            .with_label_values(&["paypal", "missing_signature"])
            .inc();
        ApiError::bad_request("invalid_signature")
    })?;

    let verified = state
        .paypal
        .verify_webhook(&transmission, &body)
        .await
        .map_err(|err| {
            error!(error = %err, "paypal webhook verification call failed");
            ApiError::internal(err)
        })?;
    if !verified {
        state
            .metrics
            .webhook_rejections_total
            .with_label_values(&["paypal", "invalid_signature"])
            .inc();
        warn!("paypal webhook rejected: verification_status not SUCCESS");
        return Err(ApiError::bad_request("invalid_signature"));
    }

    let event: paypal::PayPalEvent = serde_json::from_slice(&body).map_err(|err| {
        ApiError::BadRequest {
            code: "malformed_payload",
            message: Some(err.to_string()),
        }
    })?;
    let normalized = paypal::normalize(&event)?;
    providers::route_event(&state, normalized).await?;
    Ok(Json(json!({ "received": true })))
}
