use sqlx::PgPool;

/// Applies the service schema idempotently. Ignored integration tests call
/// this too, so local runs only need a reachable Postgres and DATABASE_URL.
pub async fn ensure_schema(pool: &PgPool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS catalog_entities (
            id         UUID PRIMARY KEY,
            kind       TEXT NOT NULL CHECK (kind IN ('event', 'product')),
            title      TEXT NOT NULL,
            venue      TEXT,
            starts_at  TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS inventory_tiers (
            id               UUID PRIMARY KEY,
            entity_id        UUID NOT NULL REFERENCES catalog_entities (id),
            kind             TEXT NOT NULL CHECK (kind IN ('ticket_tier', 'apparel_size')),
            label            TEXT NOT NULL,
            unit_price_minor BIGINT NOT NULL DEFAULT 0,
            available        INT NOT NULL CHECK (available >= 0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fulfillment_units (
            id                TEXT PRIMARY KEY,
            payment_reference TEXT NOT NULL,
            seq_index         INT NOT NULL,
            entity_id         UUID NOT NULL,
            tier_id           UUID,
            tier_label        TEXT NOT NULL,
            buyer_email       TEXT,
            buyer_name        TEXT NOT NULL,
            scannable_code    TEXT NOT NULL UNIQUE,
            status            TEXT NOT NULL CHECK (status IN ('confirmed', 'redeemed', 'refunded')),
            amount_minor      BIGINT NOT NULL DEFAULT 0,
            created_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
            redeemed_at       TIMESTAMPTZ,
            UNIQUE (payment_reference, seq_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
