use crate::fulfillment::FulfillmentRequest;
use crate::providers::{NormalizeError, ProviderEvent, PurchaseMetadata};
use axum::http::HeaderMap;
use serde::Deserialize;

pub const DEFAULT_API_BASE: &str = "https://api-m.sandbox.paypal.com";

/// Transmission headers PayPal attaches to every webhook delivery. All five
/// are required for verification.
#[derive(Debug, Clone)]
pub struct TransmissionHeaders {
    pub transmission_id: String,
    pub transmission_time: String,
    pub transmission_sig: String,
    pub cert_url: String,
    pub auth_algo: String,
}

impl TransmissionHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        Some(Self {
            transmission_id: get("paypal-transmission-id")?,
            transmission_time: get("paypal-transmission-time")?,
            transmission_sig: get("paypal-transmission-sig")?,
            cert_url: get("paypal-cert-url")?,
            auth_algo: get("paypal-auth-algo")?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct PayPalEvent {
    pub event_type: String,
    pub resource: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct CaptureResource {
    pub id: String,
    #[serde(default)]
    pub custom_id: Option<String>,
    #[serde(default)]
    pub amount: Option<ResourceAmount>,
    #[serde(default)]
    pub links: Vec<ResourceLink>,
}

#[derive(Debug, Deserialize)]
pub struct ResourceAmount {
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct ResourceLink {
    pub rel: String,
    pub href: String,
}

#[derive(Debug, Deserialize)]
pub struct OrderCaptureResponse {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub purchase_units: Vec<PurchaseUnit>,
    #[serde(default)]
    pub payer: Option<Payer>,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseUnit {
    #[serde(default)]
    pub payments: Option<Payments>,
}

#[derive(Debug, Deserialize)]
pub struct Payments {
    #[serde(default)]
    pub captures: Vec<CaptureResource>,
}

#[derive(Debug, Deserialize)]
pub struct Payer {
    #[serde(default)]
    pub email_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct VerificationResponse {
    verification_status: String,
}

/// Converts a decimal amount string ("25.00") to minor units without going
/// through floating point.
fn amount_minor_from_decimal(value: &str) -> Option<i64> {
    let mut parts = value.splitn(2, '.');
    let whole: i64 = parts.next()?.parse().ok()?;
    let cents = match parts.next() {
        Some(frac) => {
            let frac = frac.get(..2).unwrap_or(frac);
            let mut cents: i64 = frac.parse().ok()?;
            if frac.len() == 1 {
                cents *= 10;
            }
            cents
        }
        None => 0,
    };
    Some(whole * 100 + cents)
}

/// Maps a verified PayPal event onto the internal sum type.
pub fn normalize(event: &PayPalEvent) -> Result<ProviderEvent, NormalizeError> {
    match event.event_type.as_str() {
        "PAYMENT.CAPTURE.COMPLETED" => {
            let capture: CaptureResource = serde_json::from_value(event.resource.clone())?;
            let raw_metadata = capture
                .custom_id
                .as_deref()
                .ok_or(NormalizeError::MissingField("custom_id"))?;
            let metadata: PurchaseMetadata = serde_json::from_str(raw_metadata)?;
            let amount_minor = capture
                .amount
                .as_ref()
                .and_then(|amount| amount_minor_from_decimal(&amount.value))
                .unwrap_or(0);
            Ok(ProviderEvent::PurchaseCompleted(metadata.into_request(
                capture.id,
                amount_minor,
                None,
            )?))
        }
        "PAYMENT.CAPTURE.DENIED" => {
            let capture: CaptureResource = serde_json::from_value(event.resource.clone())?;
            Ok(ProviderEvent::PurchaseFailed {
                payment_reference: capture.id,
            })
        }
        "PAYMENT.CAPTURE.REFUNDED" => {
            // The refund resource links back to the capture it reverses; that
            // capture id is our payment reference.
            let refund: CaptureResource = serde_json::from_value(event.resource.clone())?;
            let capture_id = refund
                .links
                .iter()
                .find(|link| link.rel == "up")
                .and_then(|link| link.href.rsplit('/').next())
                .map(str::to_string)
                .ok_or(NormalizeError::MissingField("links"))?;
            Ok(ProviderEvent::PurchaseRefunded {
                payment_reference: capture_id,
            })
        }
        other => Ok(ProviderEvent::Ignored {
            event_type: other.to_string(),
        }),
    }
}

/// Builds the normalized request from a capture response. Metadata normally
/// rides in the capture's custom_id; the client-supplied copy is only a
/// fallback for orders created without one.
pub fn request_from_capture(
    response: &OrderCaptureResponse,
    fallback_metadata: Option<PurchaseMetadata>,
) -> Result<FulfillmentRequest, NormalizeError> {
    let capture = response
        .purchase_units
        .first()
        .and_then(|unit| unit.payments.as_ref())
        .and_then(|payments| payments.captures.first())
        .ok_or(NormalizeError::MissingField("captures"))?;

    let metadata = match capture.custom_id.as_deref() {
        Some(raw) => serde_json::from_str(raw)?,
        None => fallback_metadata.ok_or(NormalizeError::MissingField("custom_id"))?,
    };
    let amount_minor = capture
        .amount
        .as_ref()
        .and_then(|amount| amount_minor_from_decimal(&amount.value))
        .unwrap_or(0);
    let payer_email = response
        .payer
        .as_ref()
        .and_then(|payer| payer.email_address.clone());

    metadata.into_request(capture.id.clone(), amount_minor, payer_email)
}

#[derive(Clone)]
pub struct PayPalClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    api_base: String,
    webhook_id: String,
}

impl PayPalClient {
    pub fn new(
        http: reqwest::Client,
        client_id: String,
        client_secret: String,
        api_base: String,
        webhook_id: String,
    ) -> Self {
        Self {
            http,
            client_id,
            client_secret,
            api_base,
            webhook_id,
        }
    }

    async fn access_token(&self) -> anyhow::Result<String> {
        let response = self
            .http
            .post(format!("{}/v1/oauth2/token", self.api_base))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?
            .error_for_status()?
            .json::<AccessTokenResponse>()
            .await?;
        Ok(response.access_token)
    }

    /// Asks PayPal to verify a webhook delivery. The event is forwarded as the
    /// raw bytes received, parsed losslessly, so the check covers exactly what
    /// was delivered.
    pub async fn verify_webhook(
        &self,
        transmission: &TransmissionHeaders,
        raw_body: &[u8],
    ) -> anyhow::Result<bool> {
        let webhook_event: serde_json::Value = serde_json::from_slice(raw_body)?;
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!(
                "{}/v1/notifications/verify-webhook-signature",
                self.api_base
            ))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "auth_algo": transmission.auth_algo,
                "cert_url": transmission.cert_url,
                "transmission_id": transmission.transmission_id,
                "transmission_sig": transmission.transmission_sig,
                "transmission_time": transmission.transmission_time,
                "webhook_id": self.webhook_id,
                "webhook_event": webhook_event,
            }))
            .send()
            .await?
            .error_for_status()?
            .json::<VerificationResponse>()
            .await?;
        Ok(response.verification_status == "SUCCESS")
    }

    /// Synchronous fallback channel: capture the approved order and report the
    /// result so the caller can funnel a completed capture into fulfillment.
    pub async fn capture_order(&self, order_id: &str) -> anyhow::Result<OrderCaptureResponse> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!("{}/v2/checkout/orders/{}/capture", self.api_base, order_id))
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await?
            .error_for_status()?
            .json::<OrderCaptureResponse>()
            .await?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fulfillment::ItemKind;
    use uuid::Uuid;

    fn metadata_json(entity_id: Uuid, tier_id: Uuid) -> String {
        serde_json::json!({
            "kind": "merch",
            "entity_id": entity_id,
            "tier_id": tier_id,
            "tier_label": "Size M",
            "quantity": 1,
            "buyer_name": "Alex Doe",
            "buyer_email": "alex@example.com"
        })
        .to_string()
    }

    #[test]
    fn amount_parsing_avoids_floats() {
        assert_eq!(amount_minor_from_decimal("25.00"), Some(2500));
        assert_eq!(amount_minor_from_decimal("25.5"), Some(2550));
        assert_eq!(amount_minor_from_decimal("25"), Some(2500));
        assert_eq!(amount_minor_from_decimal("0.99"), Some(99));
        assert_eq!(amount_minor_from_decimal("x"), None);
    }

    #[test]
    fn capture_completed_normalizes_to_purchase() {
        let entity_id = Uuid::new_v4();
        let tier_id = Uuid::new_v4();
        let event = PayPalEvent {
            event_type: "PAYMENT.CAPTURE.COMPLETED".into(),
            resource: serde_json::json!({
                "id": "8XY12345AB",
                "custom_id": metadata_json(entity_id, tier_id),
                "amount": {"value": "30.00", "currency_code": "EUR"}
            }),
        };
        let normalized = normalize(&event).expect("normalize");
        let ProviderEvent::PurchaseCompleted(request) = normalized else {
            panic!("expected purchase");
        };
        assert_eq!(request.payment_reference, "8XY12345AB");
        assert_eq!(request.kind, ItemKind::Merch);
        assert_eq!(request.amount_minor, 3000);
        assert_eq!(request.tier_id, Some(tier_id));
    }

    #[test]
    fn refund_resolves_capture_via_up_link() {
        let event = PayPalEvent {
            event_type: "PAYMENT.CAPTURE.REFUNDED".into(),
            resource: serde_json::json!({
                "id": "REFUND-1",
                "links": [
                    {"rel": "self", "href": "https://api.example.com/v2/payments/refunds/REFUND-1"},
                    {"rel": "up", "href": "https://api.example.com/v2/payments/captures/8XY12345AB"}
                ]
            }),
        };
        let normalized = normalize(&event).expect("normalize");
        assert!(matches!(
            normalized,
            ProviderEvent::PurchaseRefunded { payment_reference } if payment_reference == "8XY12345AB"
        ));
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        let event = PayPalEvent {
            event_type: "BILLING.SUBSCRIPTION.CREATED".into(),
            resource: serde_json::json!({}),
        };
        assert!(matches!(
            normalize(&event).expect("normalize"),
            ProviderEvent::Ignored { .. }
        ));
    }

    #[test]
    fn capture_response_prefers_embedded_metadata() {
        let entity_id = Uuid::new_v4();
        let tier_id = Uuid::new_v4();
        let response: OrderCaptureResponse = serde_json::from_value(serde_json::json!({
            "id": "ORDER-1",
            "status": "COMPLETED",
            "purchase_units": [{
                "payments": {"captures": [{
                    "id": "CAP-1",
                    "custom_id": metadata_json(entity_id, tier_id),
                    "amount": {"value": "30.00"}
                }]}
            }],
            "payer": {"email_address": "payer@example.com"}
        }))
        .expect("parse");
        let request = request_from_capture(&response, None).expect("request");
        assert_eq!(request.payment_reference, "CAP-1");
        assert_eq!(request.buyer.email.as_deref(), Some("alex@example.com"));
    }
}
