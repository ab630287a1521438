use crate::app::AppState;
use crate::fulfillment::{
    self, Buyer, FulfillmentError, FulfillmentOutcome, FulfillmentRequest, ItemKind,
};
use crate::notify;
use common_http_errors::ApiError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

pub mod paypal;
pub mod stripe;

/// Internal event shape every provider signal is normalized into before it
/// reaches the fulfillment transaction. The transaction never branches on
/// provider identity.
#[derive(Debug)]
pub enum ProviderEvent {
    PurchaseCompleted(FulfillmentRequest),
    PurchaseFailed { payment_reference: String },
    PurchaseRefunded { payment_reference: String },
    Ignored { event_type: String },
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("missing metadata field: {0}")]
    MissingField(&'static str),
    #[error("invalid metadata field: {0}")]
    InvalidField(&'static str),
    #[error("payload decode error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<NormalizeError> for ApiError {
    fn from(err: NormalizeError) -> Self {
        ApiError::BadRequest {
            code: "malformed_payload",
            message: Some(err.to_string()),
        }
    }
}

/// Checkout metadata attached by the session creator. Both providers carry the
/// same shape: Stripe as a string map on the session, PayPal as a JSON blob in
/// the capture's custom_id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseMetadata {
    pub kind: String,
    pub entity_id: Uuid,
    #[serde(default)]
    pub tier_id: Option<Uuid>,
    #[serde(default)]
    pub tier_label: Option<String>,
    pub quantity: i32,
    pub buyer_name: String,
    #[serde(default)]
    pub buyer_email: Option<String>,
    #[serde(default)]
    pub unit_id: Option<String>,
}

impl PurchaseMetadata {
    /// Stripe metadata values are all strings; parse field by field.
    pub fn from_string_map(map: &HashMap<String, String>) -> Result<Self, NormalizeError> {
        let kind = map
            .get("kind")
            .ok_or(NormalizeError::MissingField("kind"))?
            .clone();
        let entity_id = map
            .get("entity_id")
            .ok_or(NormalizeError::MissingField("entity_id"))?
            .parse()
            .map_err(|_| NormalizeError::InvalidField("entity_id"))?;
        let tier_id = match map.get("tier_id") {
            Some(raw) => Some(
                raw.parse()
                    .map_err(|_| NormalizeError::InvalidField("tier_id"))?,
            ),
            None => None,
        };
        let quantity = map
            .get("quantity")
            .ok_or(NormalizeError::MissingField("quantity"))?
            .parse()
            .map_err(|_| NormalizeError::InvalidField("quantity"))?;
        let buyer_name = map
            .get("buyer_name")
            .ok_or(NormalizeError::MissingField("buyer_name"))?
            .clone();
        Ok(PurchaseMetadata {
            kind,
            entity_id,
            tier_id,
            tier_label: map.get("tier_label").cloned(),
            quantity,
            buyer_name,
            buyer_email: map.get("buyer_email").cloned(),
            unit_id: map.get("unit_id").cloned(),
        })
    }

    pub fn into_request(
        self,
        payment_reference: String,
        amount_minor: i64,
        fallback_email: Option<String>,
    ) -> Result<FulfillmentRequest, NormalizeError> {
        let kind = ItemKind::from_str(&self.kind).ok_or(NormalizeError::InvalidField("kind"))?;
        if kind == ItemKind::Guestlist {
            // Comp issuance is an internal path, never a provider signal.
            return Err(NormalizeError::InvalidField("kind"));
        }
        if self.quantity <= 0 {
            return Err(NormalizeError::InvalidField("quantity"));
        }
        Ok(FulfillmentRequest {
            payment_reference,
            kind,
            entity_id: self.entity_id,
            tier_id: self.tier_id,
            tier_label: self.tier_label.unwrap_or_else(|| "Standard".into()),
            quantity: self.quantity,
            buyer: Buyer {
                name: self.buyer_name,
                email: self.buyer_email.or(fallback_email),
            },
            amount_minor,
            preallocated_unit_id: self.unit_id,
        })
    }
}

#[derive(Debug)]
pub enum RoutedOutcome {
    Fulfilled(FulfillmentOutcome),
    RefundMarked { payment_reference: String, units: u64 },
    Acknowledged,
}

/// Dispatches a normalized provider event. Purchase completions funnel into
/// the fulfillment transaction; refunds flip unit status without restocking;
/// failures and unrecognized types are acknowledged without side effects.
pub async fn route_event(state: &AppState, event: ProviderEvent) -> Result<RoutedOutcome, ApiError> {
    match event {
        ProviderEvent::PurchaseCompleted(request) => {
            let outcome = execute_purchase(state, request).await?;
            Ok(RoutedOutcome::Fulfilled(outcome))
        }
        ProviderEvent::PurchaseFailed { payment_reference } => {
            info!(payment_reference = %payment_reference, "payment failed; nothing to fulfill");
            Ok(RoutedOutcome::Acknowledged)
        }
        ProviderEvent::PurchaseRefunded { payment_reference } => {
            let units = fulfillment::refund(&state.db, &payment_reference)
                .await
                .map_err(ApiError::internal)?;
            info!(
                payment_reference = %payment_reference,
                units,
                "refund recorded; inventory intentionally not restored"
            );
            Ok(RoutedOutcome::RefundMarked {
                payment_reference,
                units,
            })
        }
        ProviderEvent::Ignored { event_type } => {
            debug!(event_type = %event_type, "unhandled provider event type");
            Ok(RoutedOutcome::Acknowledged)
        }
    }
}

/// Runs the fulfillment transaction and, only after commit, the best-effort
/// side effects. Nothing downstream of the commit can make the caller believe
/// fulfillment did not happen.
pub async fn execute_purchase(
    state: &AppState,
    request: FulfillmentRequest,
) -> Result<FulfillmentOutcome, ApiError> {
    let policy = fulfillment::policy_for(request.kind);
    match fulfillment::fulfill(&state.db, policy, &request).await {
        Ok(outcome) => {
            match &outcome {
                FulfillmentOutcome::Created(batch) => {
                    state
                        .metrics
                        .fulfillments_total
                        .with_label_values(&[request.kind.as_str()])
                        .inc();
                    state
                        .metrics
                        .fulfilled_units_total
                        .with_label_values(&[request.kind.as_str()])
                        .inc_by(batch.units.len() as u64);
                    info!(
                        payment_reference = %request.payment_reference,
                        kind = request.kind.as_str(),
                        units = batch.units.len(),
                        "fulfillment committed"
                    );
                    notify::dispatch(
                        state.notifier.as_ref(),
                        &state.metrics,
                        policy.confirmation(&batch.units, &batch.entity),
                    )
                    .await;
                    propagate_after_commit(state, policy, batch).await;
                }
                FulfillmentOutcome::AlreadyFulfilled(units) => {
                    state.metrics.duplicate_requests_total.inc();
                    info!(
                        payment_reference = %request.payment_reference,
                        units = units.len(),
                        "duplicate delivery; returning original result"
                    );
                }
            }
            Ok(outcome)
        }
        Err(err) => {
            match &err {
                FulfillmentError::Oversell {
                    tier_id,
                    requested,
                    available,
                } => {
                    state.metrics.oversell_total.inc();
                    error!(
                        payment_reference = %request.payment_reference,
                        tier_id = %tier_id,
                        requested,
                        available,
                        "oversell: buyer paid for exhausted inventory; manual resolution required"
                    );
                }
                other => {
                    error!(
                        payment_reference = %request.payment_reference,
                        error = %other,
                        "fulfillment aborted"
                    );
                }
            }
            Err(api_error_from(err))
        }
    }
}

/// Cache invalidation and realtime broadcast for a committed batch. Runs
/// strictly after commit; failures here are absorbed by the stores.
async fn propagate_after_commit(
    state: &AppState,
    policy: &dyn fulfillment::FulfillmentPolicy,
    batch: &fulfillment::FulfilledBatch,
) {
    for key in policy.cache_keys(batch.entity.id) {
        state.cache.del(&key).await;
    }
    let payload = serde_json::json!({
        "entity_id": batch.entity.id,
        "kind": policy.kind().as_str(),
        "units": batch.units.len(),
        "tier": batch.tier.as_ref().map(|tier| serde_json::json!({
            "tier_id": tier.id,
            "label": tier.label,
            "available": tier.available,
        })),
    });
    state.broadcaster.publish(policy.broadcast_event(), payload);
}

pub fn api_error_from(err: FulfillmentError) -> ApiError {
    match err {
        FulfillmentError::EntityNotFound(_) => ApiError::not_found("entity_not_found"),
        FulfillmentError::TierNotFound(_) => ApiError::not_found("tier_not_found"),
        FulfillmentError::Oversell { .. } => ApiError::Conflict {
            code: "insufficient_stock",
            message: Some(err.to_string()),
        },
        FulfillmentError::Invalid(reason) => ApiError::BadRequest {
            code: "invalid_request",
            message: Some(reason.into()),
        },
        FulfillmentError::Db(err) => ApiError::internal(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata_map() -> HashMap<String, String> {
        let entity_id = Uuid::new_v4();
        let tier_id = Uuid::new_v4();
        HashMap::from([
            ("kind".to_string(), "ticket".to_string()),
            ("entity_id".to_string(), entity_id.to_string()),
            ("tier_id".to_string(), tier_id.to_string()),
            ("tier_label".to_string(), "Early Bird".to_string()),
            ("quantity".to_string(), "3".to_string()),
            ("buyer_name".to_string(), "Sam Doe".to_string()),
            ("buyer_email".to_string(), "sam@example.com".to_string()),
            ("unit_id".to_string(), "TCK-PRE-1".to_string()),
        ])
    }

    #[test]
    fn string_map_metadata_parses_typed_fields() {
        let map = metadata_map();
        let meta = PurchaseMetadata::from_string_map(&map).expect("parse");
        assert_eq!(meta.kind, "ticket");
        assert_eq!(meta.quantity, 3);
        assert_eq!(meta.unit_id.as_deref(), Some("TCK-PRE-1"));

        let request = meta
            .into_request("pi_1".into(), 7500, None)
            .expect("request");
        assert_eq!(request.kind, ItemKind::Ticket);
        assert_eq!(request.quantity, 3);
        assert_eq!(request.tier_label, "Early Bird");
        assert_eq!(request.buyer.email.as_deref(), Some("sam@example.com"));
        assert_eq!(request.preallocated_unit_id.as_deref(), Some("TCK-PRE-1"));
    }

    #[test]
    fn missing_quantity_is_rejected() {
        let mut map = metadata_map();
        map.remove("quantity");
        let err = PurchaseMetadata::from_string_map(&map).unwrap_err();
        assert!(matches!(err, NormalizeError::MissingField("quantity")));
    }

    #[test]
    fn guestlist_kind_is_not_a_provider_event() {
        let mut map = metadata_map();
        map.insert("kind".into(), "guestlist".into());
        let meta = PurchaseMetadata::from_string_map(&map).expect("parse");
        let err = meta.into_request("pi_1".into(), 0, None).unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidField("kind")));
    }

    #[test]
    fn fallback_email_fills_missing_buyer_email() {
        let mut map = metadata_map();
        map.remove("buyer_email");
        let meta = PurchaseMetadata::from_string_map(&map).expect("parse");
        let request = meta
            .into_request("pi_1".into(), 0, Some("payer@example.com".into()))
            .expect("request");
        assert_eq!(request.buyer.email.as_deref(), Some("payer@example.com"));
    }
}
