use crate::catalog::{self, CatalogEntity, InventoryTier};
use crate::codes::{mint_unit_id, ScanCode};
use crate::inventory::{self, InventoryError};
use crate::notify::ConfirmationMessage;
use crate::repo::{self, FulfillmentUnit, UnitStatus};
use crate::cache::keys;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Ticket,
    Merch,
    Guestlist,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Ticket => "ticket",
            ItemKind::Merch => "merch",
            ItemKind::Guestlist => "guestlist",
        }
    }

    pub fn from_str(s: &str) -> Option<ItemKind> {
        match s {
            "ticket" => Some(ItemKind::Ticket),
            "merch" => Some(ItemKind::Merch),
            "guestlist" => Some(ItemKind::Guestlist),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Buyer {
    pub name: String,
    pub email: Option<String>,
}

/// Normalized fulfillment request produced by the provider event router.
/// Owned by the router until handed to `fulfill`; the transaction never
/// branches on which provider produced it.
#[derive(Debug, Clone)]
pub struct FulfillmentRequest {
    pub payment_reference: String,
    pub kind: ItemKind,
    pub entity_id: Uuid,
    /// None only for comp issuance, which bypasses inventory.
    pub tier_id: Option<Uuid>,
    pub tier_label: String,
    pub quantity: i32,
    pub buyer: Buyer,
    pub amount_minor: i64,
    /// Checkout-time id reused for the first unit so the id the buyer saw
    /// before paying matches the issued one.
    pub preallocated_unit_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum FulfillmentError {
    #[error("catalog entity not found: {0}")]
    EntityNotFound(Uuid),
    #[error("tier not found: {0}")]
    TierNotFound(Uuid),
    #[error("oversell on tier {tier_id}: requested {requested}, available {available}")]
    Oversell {
        tier_id: Uuid,
        requested: i32,
        available: i32,
    },
    #[error("invalid fulfillment request: {0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// A committed fulfillment plus the context the post-commit side effects need.
#[derive(Debug)]
pub struct FulfilledBatch {
    pub entity: CatalogEntity,
    pub units: Vec<FulfillmentUnit>,
    /// Tier state after the decrement; None for comp issuance.
    pub tier: Option<InventoryTier>,
}

#[derive(Debug)]
pub enum FulfillmentOutcome {
    Created(FulfilledBatch),
    /// The idempotency guard found prior completion; carries the original
    /// result set unchanged. Not an error.
    AlreadyFulfilled(Vec<FulfillmentUnit>),
}

impl FulfillmentOutcome {
    pub fn units(&self) -> &[FulfillmentUnit] {
        match self {
            FulfillmentOutcome::Created(batch) => &batch.units,
            FulfillmentOutcome::AlreadyFulfilled(units) => units,
        }
    }

    pub fn was_duplicate(&self) -> bool {
        matches!(self, FulfillmentOutcome::AlreadyFulfilled(_))
    }
}

/// Kind-specific strategy for the one shared fulfillment transaction: unit-id
/// prefixes, whether tier stock is consumed, notification templating, and
/// which cache keys and realtime event the propagator touches.
pub trait FulfillmentPolicy: Send + Sync {
    fn kind(&self) -> ItemKind;

    fn unit_prefix(&self) -> &'static str;

    fn consumes_inventory(&self) -> bool {
        true
    }

    fn confirmation(
        &self,
        units: &[FulfillmentUnit],
        entity: &CatalogEntity,
    ) -> Option<ConfirmationMessage>;

    fn cache_keys(&self, entity_id: Uuid) -> Vec<String>;

    fn broadcast_event(&self) -> &'static str;
}

pub struct TicketPolicy;
pub struct MerchPolicy;
pub struct GuestlistPolicy;

static TICKET_POLICY: TicketPolicy = TicketPolicy;
static MERCH_POLICY: MerchPolicy = MerchPolicy;
static GUESTLIST_POLICY: GuestlistPolicy = GuestlistPolicy;

pub fn policy_for(kind: ItemKind) -> &'static dyn FulfillmentPolicy {
    match kind {
        ItemKind::Ticket => &TICKET_POLICY,
        ItemKind::Merch => &MERCH_POLICY,
        ItemKind::Guestlist => &GUESTLIST_POLICY,
    }
}

impl FulfillmentPolicy for TicketPolicy {
    fn kind(&self) -> ItemKind {
        ItemKind::Ticket
    }

    fn unit_prefix(&self) -> &'static str {
        "TCK"
    }

    fn confirmation(
        &self,
        units: &[FulfillmentUnit],
        entity: &CatalogEntity,
    ) -> Option<ConfirmationMessage> {
        let recipient = units.first()?.buyer_email.clone()?;
        let subject = format!("Your tickets for {}", entity.title);
        Some(render_confirmation(recipient, subject, "ticket", units, entity))
    }

    fn cache_keys(&self, entity_id: Uuid) -> Vec<String> {
        vec![keys::catalog_all("event"), keys::catalog_detail(entity_id)]
    }

    fn broadcast_event(&self) -> &'static str {
        "availability_update"
    }
}

impl FulfillmentPolicy for MerchPolicy {
    fn kind(&self) -> ItemKind {
        ItemKind::Merch
    }

    fn unit_prefix(&self) -> &'static str {
        "ORD"
    }

    fn confirmation(
        &self,
        units: &[FulfillmentUnit],
        entity: &CatalogEntity,
    ) -> Option<ConfirmationMessage> {
        let recipient = units.first()?.buyer_email.clone()?;
        let subject = format!("Order confirmation: {}", entity.title);
        Some(render_confirmation(recipient, subject, "item", units, entity))
    }

    fn cache_keys(&self, entity_id: Uuid) -> Vec<String> {
        vec![keys::catalog_all("product"), keys::catalog_detail(entity_id)]
    }

    fn broadcast_event(&self) -> &'static str {
        "availability_update"
    }
}

impl FulfillmentPolicy for GuestlistPolicy {
    fn kind(&self) -> ItemKind {
        ItemKind::Guestlist
    }

    fn unit_prefix(&self) -> &'static str {
        "GST"
    }

    // Comp tickets never touch tier stock.
    fn consumes_inventory(&self) -> bool {
        false
    }

    fn confirmation(
        &self,
        units: &[FulfillmentUnit],
        entity: &CatalogEntity,
    ) -> Option<ConfirmationMessage> {
        let recipient = units.first()?.buyer_email.clone()?;
        let subject = format!("Your guestlist ticket for {}", entity.title);
        Some(render_confirmation(recipient, subject, "ticket", units, entity))
    }

    fn cache_keys(&self, entity_id: Uuid) -> Vec<String> {
        vec![keys::guestlist(entity_id), keys::catalog_detail(entity_id)]
    }

    fn broadcast_event(&self) -> &'static str {
        "guestlist_update"
    }
}

/// One message per fulfillment, batching every unit of the purchase.
fn render_confirmation(
    recipient: String,
    subject: String,
    noun: &str,
    units: &[FulfillmentUnit],
    entity: &CatalogEntity,
) -> ConfirmationMessage {
    let when = entity
        .starts_at
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_default();

    let mut rows_html = String::new();
    let mut rows_text = String::new();
    for unit in units {
        rows_html.push_str(&format!(
            r#"<div style="border: 1px solid #333; padding: 12px; margin: 8px 0;">
  <p style="margin: 0;"><strong>{}</strong> ({})</p>
  <p style="margin: 4px 0 0; font-family: monospace; word-break: break-all;">{}</p>
</div>
"#,
            unit.id, unit.tier_label, unit.scannable_code
        ));
        rows_text.push_str(&format!("- {} ({}): {}\n", unit.id, unit.tier_label, unit.scannable_code));
    }

    let body_html = format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="UTF-8"><title>{subject}</title></head>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
  <div style="max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2>{title}</h2>
    <p>Hi {name}, thanks for your purchase. Each {noun} below has its own code; present it at the door or keep it for your records.</p>
    <p style="color: #666;">{when}</p>
    {rows_html}
  </div>
</body>
</html>
"#,
        subject = subject,
        title = entity.title,
        name = units.first().map(|u| u.buyer_name.as_str()).unwrap_or(""),
        noun = noun,
        when = when,
        rows_html = rows_html,
    );

    let body_text = format!(
        "{}\n{}\n\nYour {}s:\n{}",
        entity.title, when, noun, rows_text
    );

    ConfirmationMessage {
        recipient,
        subject,
        body_html,
        body_text,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
        }
        _ => false,
    }
}

/// The fulfillment transaction: idempotency check, entity load, atomic
/// inventory decrement, bulk unit issuance, commit. Everything before the
/// commit either fully applies or fully rolls back; notification and
/// propagation run outside, in the router layer, and cannot undo a committed
/// fulfillment.
pub async fn fulfill(
    db: &PgPool,
    policy: &dyn FulfillmentPolicy,
    request: &FulfillmentRequest,
) -> Result<FulfillmentOutcome, FulfillmentError> {
    if request.quantity <= 0 {
        return Err(FulfillmentError::Invalid("quantity must be positive"));
    }
    if policy.consumes_inventory() && request.tier_id.is_none() {
        return Err(FulfillmentError::Invalid("tier reference required"));
    }

    let mut tx = db.begin().await?;

    let existing = repo::units_for_payment(&mut *tx, &request.payment_reference).await?;
    if !existing.is_empty() {
        tx.commit().await?;
        return Ok(FulfillmentOutcome::AlreadyFulfilled(existing));
    }

    let entity = catalog::load_entity(&mut *tx, request.entity_id)
        .await?
        .ok_or(FulfillmentError::EntityNotFound(request.entity_id))?;

    let tier = match request.tier_id.filter(|_| policy.consumes_inventory()) {
        Some(tier_id) => {
            match inventory::reserve_and_decrement(&mut tx, tier_id, request.quantity).await {
                Ok(tier) => Some(tier),
                Err(InventoryError::TierNotFound(id)) => {
                    return Err(FulfillmentError::TierNotFound(id));
                }
                Err(InventoryError::InsufficientStock { requested, available }) => {
                    return Err(FulfillmentError::Oversell {
                        tier_id,
                        requested,
                        available,
                    });
                }
                Err(InventoryError::Db(err)) => return Err(err.into()),
            }
        }
        None => None,
    };

    let buyer_contact = request
        .buyer
        .email
        .clone()
        .unwrap_or_else(|| request.buyer.name.clone());

    let mut units = Vec::with_capacity(request.quantity as usize);
    for seq_index in 0..request.quantity {
        let unit_id = match (seq_index, &request.preallocated_unit_id) {
            (0, Some(id)) => id.clone(),
            _ => mint_unit_id(policy.unit_prefix()),
        };
        let code = ScanCode {
            unit_id: unit_id.clone(),
            entity_id: request.entity_id,
            buyer_contact: buyer_contact.clone(),
            seq_index,
            quantity: request.quantity,
        };
        let unit = FulfillmentUnit {
            id: unit_id,
            payment_reference: request.payment_reference.clone(),
            seq_index,
            entity_id: request.entity_id,
            tier_id: request.tier_id,
            tier_label: request.tier_label.clone(),
            buyer_email: request.buyer.email.clone(),
            buyer_name: request.buyer.name.clone(),
            scannable_code: code.encode(),
            status: UnitStatus::Confirmed.as_str().to_string(),
            amount_minor: request.amount_minor,
            created_at: Utc::now(),
            redeemed_at: None,
        };

        match repo::insert_unit(&mut tx, &unit).await {
            Ok(()) => units.push(unit),
            Err(err) if is_unique_violation(&err) => {
                // A concurrent delivery of the same payment reference won the
                // race between our idempotency check and this insert. Roll
                // back and hand back the winner's rows unchanged.
                tx.rollback().await.ok();
                warn!(
                    payment_reference = %request.payment_reference,
                    "concurrent duplicate delivery detected at insert; returning prior result"
                );
                let winners = repo::units_for_payment(db, &request.payment_reference).await?;
                if winners.is_empty() {
                    return Err(err.into());
                }
                return Ok(FulfillmentOutcome::AlreadyFulfilled(winners));
            }
            Err(err) => return Err(err.into()),
        }
    }

    tx.commit().await?;

    Ok(FulfillmentOutcome::Created(FulfilledBatch {
        entity,
        units,
        tier,
    }))
}

/// Transitions every unit of a payment reference to refunded. Inventory is
/// left untouched; restocking is a manual, administrative step.
pub async fn refund(db: &PgPool, payment_reference: &str) -> Result<u64, FulfillmentError> {
    Ok(repo::mark_refunded(db, payment_reference).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_entity() -> CatalogEntity {
        CatalogEntity {
            id: Uuid::new_v4(),
            kind: "event".into(),
            title: "Warehouse Night".into(),
            venue: Some("Hall 9".into()),
            starts_at: Some(Utc.with_ymd_and_hms(2026, 10, 3, 22, 0, 0).unwrap()),
            created_at: Utc::now(),
        }
    }

    fn sample_unit(email: Option<&str>) -> FulfillmentUnit {
        FulfillmentUnit {
            id: "TCK-1".into(),
            payment_reference: "pi_123".into(),
            seq_index: 0,
            entity_id: Uuid::new_v4(),
            tier_id: Some(Uuid::new_v4()),
            tier_label: "Early Bird".into(),
            buyer_email: email.map(Into::into),
            buyer_name: "Sam".into(),
            scannable_code: "SC1.xyz".into(),
            status: "confirmed".into(),
            amount_minor: 2500,
            created_at: Utc::now(),
            redeemed_at: None,
        }
    }

    #[test]
    fn ticket_confirmation_batches_all_units_into_one_message() {
        let entity = sample_entity();
        let mut second = sample_unit(Some("sam@example.com"));
        second.id = "TCK-2".into();
        second.seq_index = 1;
        let units = vec![sample_unit(Some("sam@example.com")), second];

        let msg = TicketPolicy
            .confirmation(&units, &entity)
            .expect("message for buyer with email");
        assert_eq!(msg.recipient, "sam@example.com");
        assert!(msg.subject.contains("Warehouse Night"));
        assert!(msg.body_html.contains("TCK-1"));
        assert!(msg.body_html.contains("TCK-2"));
        assert!(msg.body_text.contains("TCK-2"));
    }

    #[test]
    fn confirmation_skipped_without_recipient() {
        let entity = sample_entity();
        let units = vec![sample_unit(None)];
        assert!(GuestlistPolicy.confirmation(&units, &entity).is_none());
    }

    #[test]
    fn guestlist_policy_bypasses_inventory() {
        assert!(!GuestlistPolicy.consumes_inventory());
        assert!(TicketPolicy.consumes_inventory());
        assert!(MerchPolicy.consumes_inventory());
    }

    #[test]
    fn policies_invalidate_their_read_views() {
        let id = Uuid::new_v4();
        let keys = TicketPolicy.cache_keys(id);
        assert!(keys.contains(&"catalog:all:event".to_string()));
        assert!(keys.contains(&format!("catalog:detail:{id}")));
        let keys = MerchPolicy.cache_keys(id);
        assert!(keys.contains(&"catalog:all:product".to_string()));
    }

    #[test]
    fn item_kind_roundtrip() {
        for kind in [ItemKind::Ticket, ItemKind::Merch, ItemKind::Guestlist] {
            assert_eq!(ItemKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(ItemKind::from_str("bundle"), None);
    }
}
