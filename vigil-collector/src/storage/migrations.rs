//! Database migrations, applied on connect.

use sqlx::PgPool;
use tracing::{info, instrument};

const SCHEMA_VERSION: i32 = 1;

#[instrument(skip(pool))]
pub async fn run(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current: Option<i32> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await?;
    let current = current.unwrap_or(0);

    if current >= SCHEMA_VERSION {
        info!("Database schema is up to date (version {})", current);
        return Ok(());
    }

    info!("Migrating database from version {} to {}", current, SCHEMA_VERSION);
    if current < 1 {
        migrate_to_v1(pool).await?;
    }
    Ok(())
}

async fn migrate_to_v1(pool: &PgPool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS metrics (
            id SERIAL PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            type TEXT NOT NULL CHECK (type IN ('gauge', 'counter')),
            value DOUBLE PRECISION,
            delta BIGINT,
            updated_at TIMESTAMP NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query("INSERT INTO schema_version (version) VALUES ($1) ON CONFLICT DO NOTHING")
        .bind(1i32)
        .execute(&mut *tx)
        .await?;

    tx.commit().await
}
