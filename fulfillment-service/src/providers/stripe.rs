use crate::fulfillment::FulfillmentRequest;
use crate::providers::{NormalizeError, ProviderEvent, PurchaseMetadata};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("missing signature header")]
    MissingHeader,
    #[error("malformed signature header")]
    MalformedHeader,
    #[error("signature mismatch")]
    Mismatch,
    #[error("timestamp outside tolerance")]
    TimestampSkew,
}

/// Verifies a `t=<unix>,v1=<hex>` signature header against the raw request
/// bytes. The check must run on the bytes as received, never a re-serialized
/// copy. Comparison is constant-time; the timestamp tolerance bounds replay.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();
    for part in header.split(',') {
        let mut kv = part.trim().splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(value)) => timestamp = value.parse().ok(),
            (Some("v1"), Some(value)) => candidates.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(SignatureError::MalformedHeader)?;
    if candidates.is_empty() {
        return Err(SignatureError::MalformedHeader);
    }

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::Mismatch)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());

    let matched = candidates.iter().any(|candidate| {
        ConstantTimeEq::ct_eq(expected.as_bytes(), candidate.as_bytes()).unwrap_u8() == 1
    });
    if !matched {
        return Err(SignatureError::Mismatch);
    }

    if (now - timestamp).abs() > tolerance_secs {
        return Err(SignatureError::TimestampSkew);
    }
    Ok(())
}

// Wire types: only the fields the pipeline reads.

#[derive(Debug, Deserialize)]
pub struct StripeEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct CustomerDetails {
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Charge {
    #[serde(default)]
    payment_intent: Option<String>,
}

impl CheckoutSession {
    pub fn is_paid(&self) -> bool {
        self.payment_status.as_deref() == Some("paid")
    }

    fn buyer_email(&self) -> Option<String> {
        self.customer_details
            .as_ref()
            .and_then(|details| details.email.clone())
            .or_else(|| self.customer_email.clone())
    }
}

/// Maps a verified event onto the internal sum type. Unrecognized types are
/// ignored without error so new provider events never break the webhook.
pub fn normalize(event: &StripeEvent) -> Result<ProviderEvent, NormalizeError> {
    match event.event_type.as_str() {
        "checkout.session.completed" => {
            let session: CheckoutSession = serde_json::from_value(event.data.object.clone())?;
            Ok(ProviderEvent::PurchaseCompleted(request_from_session(
                &session,
            )?))
        }
        "payment_intent.payment_failed" => {
            let intent: ObjectRef = serde_json::from_value(event.data.object.clone())?;
            Ok(ProviderEvent::PurchaseFailed {
                payment_reference: intent.id,
            })
        }
        "charge.refunded" => {
            let charge: Charge = serde_json::from_value(event.data.object.clone())?;
            let payment_reference = charge
                .payment_intent
                .ok_or(NormalizeError::MissingField("payment_intent"))?;
            Ok(ProviderEvent::PurchaseRefunded { payment_reference })
        }
        other => Ok(ProviderEvent::Ignored {
            event_type: other.to_string(),
        }),
    }
}

/// Builds the normalized request from a checkout session. The payment intent
/// id is the idempotency key; the session id stands in for flows where the
/// intent is not yet attached.
pub fn request_from_session(session: &CheckoutSession) -> Result<FulfillmentRequest, NormalizeError> {
    let metadata = PurchaseMetadata::from_string_map(&session.metadata)?;
    let payment_reference = session
        .payment_intent
        .clone()
        .unwrap_or_else(|| session.id.clone());
    metadata.into_request(
        payment_reference,
        session.amount_total.unwrap_or(0),
        session.buyer_email(),
    )
}

#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    secret_key: String,
    api_base: String,
}

impl StripeClient {
    pub fn new(http: reqwest::Client, secret_key: String, api_base: String) -> Self {
        Self {
            http,
            secret_key,
            api_base,
        }
    }

    /// Fallback verification path: fetch the session state directly from the
    /// provider instead of trusting the client.
    pub async fn retrieve_session(&self, session_id: &str) -> anyhow::Result<CheckoutSession> {
        let url = format!("{}/v1/checkout/sessions/{}", self.api_base, session_id);
        let session = self
            .http
            .get(url)
            .bearer_auth(&self.secret_key)
            .send()
            .await?
            .error_for_status()?
            .json::<CheckoutSession>()
            .await?;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fulfillment::ItemKind;
    use uuid::Uuid;

    fn sign(secret: &str, timestamp: i64, payload: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_passes() {
        let payload = br#"{"ok":true}"#;
        let header = sign("whsec_test", 1_700_000_000, payload);
        verify_signature(payload, &header, "whsec_test", 300, 1_700_000_000).expect("valid");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let payload = br#"{"ok":true}"#;
        let header = sign("other_secret", 1_700_000_000, payload);
        let err = verify_signature(payload, &header, "whsec_test", 300, 1_700_000_000).unwrap_err();
        assert!(matches!(err, SignatureError::Mismatch));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let header = sign("whsec_test", 1_700_000_000, br#"{"ok":true}"#);
        let err = verify_signature(br#"{"ok":false}"#, &header, "whsec_test", 300, 1_700_000_000)
            .unwrap_err();
        assert!(matches!(err, SignatureError::Mismatch));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let payload = b"{}";
        let header = sign("whsec_test", 1_700_000_000, payload);
        let err = verify_signature(payload, &header, "whsec_test", 300, 1_700_000_500).unwrap_err();
        assert!(matches!(err, SignatureError::TimestampSkew));
    }

    #[test]
    fn header_without_v1_is_malformed() {
        let err = verify_signature(b"{}", "t=123", "whsec_test", 300, 123).unwrap_err();
        assert!(matches!(err, SignatureError::MalformedHeader));
    }

    fn session_json(entity_id: Uuid, tier_id: Uuid) -> serde_json::Value {
        serde_json::json!({
            "id": "cs_test_1",
            "payment_intent": "pi_test_1",
            "payment_status": "paid",
            "amount_total": 5000,
            "customer_details": {"email": "buyer@example.com"},
            "metadata": {
                "kind": "ticket",
                "entity_id": entity_id.to_string(),
                "tier_id": tier_id.to_string(),
                "tier_label": "Early Bird",
                "quantity": "2",
                "buyer_name": "Sam Doe",
                "unit_id": "TCK-PRE-9"
            }
        })
    }

    #[test]
    fn completed_session_normalizes_to_purchase() {
        let entity_id = Uuid::new_v4();
        let tier_id = Uuid::new_v4();
        let event = StripeEvent {
            event_type: "checkout.session.completed".into(),
            data: StripeEventData {
                object: session_json(entity_id, tier_id),
            },
        };
        let normalized = normalize(&event).expect("normalize");
        let ProviderEvent::PurchaseCompleted(request) = normalized else {
            panic!("expected purchase");
        };
        assert_eq!(request.payment_reference, "pi_test_1");
        assert_eq!(request.kind, ItemKind::Ticket);
        assert_eq!(request.entity_id, entity_id);
        assert_eq!(request.tier_id, Some(tier_id));
        assert_eq!(request.quantity, 2);
        assert_eq!(request.amount_minor, 5000);
        assert_eq!(request.buyer.email.as_deref(), Some("buyer@example.com"));
        assert_eq!(request.preallocated_unit_id.as_deref(), Some("TCK-PRE-9"));
    }

    #[test]
    fn refunded_charge_normalizes_to_refund() {
        let event = StripeEvent {
            event_type: "charge.refunded".into(),
            data: StripeEventData {
                object: serde_json::json!({"id": "ch_1", "payment_intent": "pi_9"}),
            },
        };
        let normalized = normalize(&event).expect("normalize");
        assert!(matches!(
            normalized,
            ProviderEvent::PurchaseRefunded { payment_reference } if payment_reference == "pi_9"
        ));
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        let event = StripeEvent {
            event_type: "customer.created".into(),
            data: StripeEventData {
                object: serde_json::json!({}),
            },
        };
        let normalized = normalize(&event).expect("normalize");
        assert!(matches!(normalized, ProviderEvent::Ignored { .. }));
    }
}
