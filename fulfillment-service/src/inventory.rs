use crate::catalog::InventoryTier;
use sqlx::{Postgres, Transaction};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("tier not found: {0}")]
    TierNotFound(Uuid),
    #[error("insufficient stock: requested {requested}, available {available}")]
    InsufficientStock { requested: i32, available: i32 },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Atomically checks and decrements a tier's remaining stock inside the
/// caller's transaction. The guarded UPDATE takes the row lock itself, so
/// concurrent fulfillments for the same tier serialize at the database and
/// no check-then-decrement window is observable to other transactions.
pub async fn reserve_and_decrement(
    tx: &mut Transaction<'_, Postgres>,
    tier_id: Uuid,
    quantity: i32,
) -> Result<InventoryTier, InventoryError> {
    let updated = sqlx::query_as::<_, InventoryTier>(
        r#"UPDATE inventory_tiers
           SET available = available - $2
           WHERE id = $1 AND available >= $2
           RETURNING id, entity_id, kind, label, unit_price_minor, available"#,
    )
    .bind(tier_id)
    .bind(quantity)
    .fetch_optional(&mut **tx)
    .await?;

    if let Some(tier) = updated {
        return Ok(tier);
    }

    // The guard failed: either the tier vanished or the quantity exceeds the
    // remaining stock. Distinguish the two inside the same transaction.
    let available = sqlx::query_scalar::<_, i32>(
        "SELECT available FROM inventory_tiers WHERE id = $1",
    )
    .bind(tier_id)
    .fetch_optional(&mut **tx)
    .await?;

    match available {
        Some(available) => Err(InventoryError::InsufficientStock {
            requested: quantity,
            available,
        }),
        None => Err(InventoryError::TierNotFound(tier_id)),
    }
}
