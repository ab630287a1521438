use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool, Postgres, Transaction};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Confirmed,
    Redeemed,
    Refunded,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Confirmed => "confirmed",
            UnitStatus::Redeemed => "redeemed",
            UnitStatus::Refunded => "refunded",
        }
    }

    pub fn from_str(s: &str) -> Option<UnitStatus> {
        match s {
            "confirmed" => Some(UnitStatus::Confirmed),
            "redeemed" => Some(UnitStatus::Redeemed),
            "refunded" => Some(UnitStatus::Refunded),
            _ => None,
        }
    }
}

/// One issued, consumable unit: a single ticket or order line item. Created in
/// bulk by the fulfillment transaction, mutated afterwards only by redemption
/// or refund.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FulfillmentUnit {
    pub id: String,
    pub payment_reference: String,
    pub seq_index: i32,
    pub entity_id: Uuid,
    pub tier_id: Option<Uuid>,
    pub tier_label: String,
    pub buyer_email: Option<String>,
    pub buyer_name: String,
    pub scannable_code: String,
    pub status: String,
    pub amount_minor: i64,
    pub created_at: DateTime<Utc>,
    pub redeemed_at: Option<DateTime<Utc>>,
}

const UNIT_COLUMNS: &str = "id, payment_reference, seq_index, entity_id, tier_id, tier_label, \
     buyer_email, buyer_name, scannable_code, status, amount_minor, created_at, redeemed_at";

/// Loads every unit issued for a payment reference, in issuance order. An
/// empty result means the reference has not been fulfilled yet.
pub async fn units_for_payment<'a, E>(
    executor: E,
    payment_reference: &str,
) -> sqlx::Result<Vec<FulfillmentUnit>>
where
    E: PgExecutor<'a>,
{
    sqlx::query_as::<_, FulfillmentUnit>(&format!(
        "SELECT {UNIT_COLUMNS} FROM fulfillment_units WHERE payment_reference = $1 ORDER BY seq_index"
    ))
    .bind(payment_reference)
    .fetch_all(executor)
    .await
}

pub async fn find_unit<'a, E>(executor: E, unit_id: &str) -> sqlx::Result<Option<FulfillmentUnit>>
where
    E: PgExecutor<'a>,
{
    sqlx::query_as::<_, FulfillmentUnit>(&format!(
        "SELECT {UNIT_COLUMNS} FROM fulfillment_units WHERE id = $1"
    ))
    .bind(unit_id)
    .fetch_optional(executor)
    .await
}

/// Inserts one unit row inside the fulfillment transaction. A unique-violation
/// here is the defense-in-depth signal that a concurrent delivery of the same
/// payment reference won the race; callers map it to the duplicate outcome.
pub async fn insert_unit(
    tx: &mut Transaction<'_, Postgres>,
    unit: &FulfillmentUnit,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"INSERT INTO fulfillment_units
           (id, payment_reference, seq_index, entity_id, tier_id, tier_label,
            buyer_email, buyer_name, scannable_code, status, amount_minor, created_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
    )
    .bind(&unit.id)
    .bind(&unit.payment_reference)
    .bind(unit.seq_index)
    .bind(unit.entity_id)
    .bind(unit.tier_id)
    .bind(&unit.tier_label)
    .bind(&unit.buyer_email)
    .bind(&unit.buyer_name)
    .bind(&unit.scannable_code)
    .bind(&unit.status)
    .bind(unit.amount_minor)
    .bind(unit.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Transitions every unit of a payment reference to refunded. Does not touch
/// inventory: restocking after a refund is an administrative decision, not an
/// automatic consequence.
pub async fn mark_refunded(db: &PgPool, payment_reference: &str) -> sqlx::Result<u64> {
    let result = sqlx::query(
        "UPDATE fulfillment_units SET status = 'refunded' WHERE payment_reference = $1 AND status <> 'refunded'",
    )
    .bind(payment_reference)
    .execute(db)
    .await?;
    Ok(result.rows_affected())
}

#[derive(Debug)]
pub enum RedeemOutcome {
    Redeemed(FulfillmentUnit),
    AlreadyRedeemed,
    Refunded,
    NotFound,
}

/// Check-in: transitions confirmed -> redeemed exactly once. The guarded
/// UPDATE makes a double scan lose the race and report the prior state.
pub async fn redeem(db: &PgPool, unit_id: &str) -> sqlx::Result<RedeemOutcome> {
    let redeemed = sqlx::query_as::<_, FulfillmentUnit>(&format!(
        r#"UPDATE fulfillment_units
           SET status = 'redeemed', redeemed_at = now()
           WHERE id = $1 AND status = 'confirmed'
           RETURNING {UNIT_COLUMNS}"#
    ))
    .bind(unit_id)
    .fetch_optional(db)
    .await?;

    if let Some(unit) = redeemed {
        return Ok(RedeemOutcome::Redeemed(unit));
    }

    let status = sqlx::query_scalar::<_, String>(
        "SELECT status FROM fulfillment_units WHERE id = $1",
    )
    .bind(unit_id)
    .fetch_optional(db)
    .await?;

    Ok(match status.as_deref() {
        Some("redeemed") => RedeemOutcome::AlreadyRedeemed,
        Some("refunded") => RedeemOutcome::Refunded,
        Some(_) => RedeemOutcome::AlreadyRedeemed,
        None => RedeemOutcome::NotFound,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_status_roundtrip() {
        for status in [UnitStatus::Confirmed, UnitStatus::Redeemed, UnitStatus::Refunded] {
            assert_eq!(UnitStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(UnitStatus::from_str("voided"), None);
    }
}
