use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgExecutor;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Event,
    Product,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Event => "event",
            EntityKind::Product => "product",
        }
    }

    pub fn from_str(s: &str) -> Option<EntityKind> {
        match s {
            "event" => Some(EntityKind::Event),
            "product" => Some(EntityKind::Product),
            _ => None,
        }
    }
}

/// Distinguishes the two catalog kinds a tier can belong to: a priced ticket
/// tier on an event, or an apparel size bucket on a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    TicketTier,
    ApparelSize,
}

impl TierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierKind::TicketTier => "ticket_tier",
            TierKind::ApparelSize => "apparel_size",
        }
    }

    pub fn from_str(s: &str) -> Option<TierKind> {
        match s {
            "ticket_tier" => Some(TierKind::TicketTier),
            "apparel_size" => Some(TierKind::ApparelSize),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CatalogEntity {
    pub id: Uuid,
    pub kind: String,
    pub title: String,
    pub venue: Option<String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One finite-capacity purchasable category. `available` is mutated only by
/// the fulfillment transaction's compare-and-decrement and by administrative
/// restock, which lives outside this service.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InventoryTier {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub kind: String,
    pub label: String,
    pub unit_price_minor: i64,
    pub available: i32,
}

pub async fn load_entity<'a, E>(executor: E, id: Uuid) -> sqlx::Result<Option<CatalogEntity>>
where
    E: PgExecutor<'a>,
{
    sqlx::query_as::<_, CatalogEntity>(
        "SELECT id, kind, title, venue, starts_at, created_at FROM catalog_entities WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(executor)
    .await
}

pub async fn tiers_for_entity<'a, E>(executor: E, entity_id: Uuid) -> sqlx::Result<Vec<InventoryTier>>
where
    E: PgExecutor<'a>,
{
    sqlx::query_as::<_, InventoryTier>(
        r#"SELECT id, entity_id, kind, label, unit_price_minor, available
           FROM inventory_tiers WHERE entity_id = $1 ORDER BY label"#,
    )
    .bind(entity_id)
    .fetch_all(executor)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_roundtrip() {
        assert_eq!(EntityKind::from_str("event"), Some(EntityKind::Event));
        assert_eq!(EntityKind::from_str("product"), Some(EntityKind::Product));
        assert_eq!(EntityKind::from_str("venue"), None);
        assert_eq!(EntityKind::Product.as_str(), "product");
    }

    #[test]
    fn tier_kind_roundtrip() {
        assert_eq!(TierKind::from_str("ticket_tier"), Some(TierKind::TicketTier));
        assert_eq!(TierKind::from_str("apparel_size"), Some(TierKind::ApparelSize));
        assert_eq!(TierKind::from_str(""), None);
    }
}
