use axum::{extract::State, Json};
use common_http_errors::{ApiError, ApiResult};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::app::AppState;
use crate::codes::ScanCode;
use crate::fulfillment::{Buyer, FulfillmentRequest, ItemKind};
use crate::payment_handlers::FulfillmentResponse;
use crate::providers;
use crate::repo::{self, RedeemOutcome};

#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    pub code: String,
}

/// Check-in: validates a scannable code and transitions the unit to redeemed
/// exactly once. A second scan of the same code reports the prior state.
pub async fn redeem(
    State(state): State<AppState>,
    Json(payload): Json<RedeemRequest>,
) -> ApiResult<Json<Value>> {
    let code =
        ScanCode::decode(&payload.code).map_err(|_| ApiError::bad_request("invalid_code"))?;

    let unit = repo::find_unit(&state.db, &code.unit_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or(ApiError::not_found("unit_not_found"))?;
    if unit.entity_id != code.entity_id {
        return Err(ApiError::bad_request("code_mismatch"));
    }

    match repo::redeem(&state.db, &code.unit_id)
        .await
        .map_err(ApiError::internal)?
    {
        RedeemOutcome::Redeemed(unit) => Ok(Json(json!({ "status": "redeemed", "unit": unit }))),
        RedeemOutcome::AlreadyRedeemed => Err(ApiError::conflict("already_redeemed")),
        RedeemOutcome::Refunded => Err(ApiError::conflict("unit_refunded")),
        RedeemOutcome::NotFound => Err(ApiError::not_found("unit_not_found")),
    }
}

#[derive(Debug, Deserialize)]
pub struct GuestlistIssueRequest {
    pub entity_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    pub category: String,
    #[serde(default)]
    pub plus_one: bool,
}

/// Comp-ticket issuance: the third fulfillment call site. Runs the same
/// transaction as paid purchases under the guestlist policy, which skips the
/// inventory decrement and uses a synthetic payment reference.
pub async fn issue_guest_ticket(
    State(state): State<AppState>,
    Json(payload): Json<GuestlistIssueRequest>,
) -> ApiResult<Json<FulfillmentResponse>> {
    let request = FulfillmentRequest {
        payment_reference: format!("guest-{}", Uuid::new_v4()),
        kind: ItemKind::Guestlist,
        entity_id: payload.entity_id,
        tier_id: None,
        tier_label: format!("Guestlist ({})", payload.category),
        quantity: if payload.plus_one { 2 } else { 1 },
        buyer: Buyer {
            name: payload.name,
            email: payload.email,
        },
        amount_minor: 0,
        preallocated_unit_id: None,
    };
    let outcome = providers::execute_purchase(&state, request).await?;
    Ok(Json(FulfillmentResponse::from_outcome(&outcome)))
}
