use crate::error::Result;
use sqlx::{Executor, PgPool};
use tracing::info;

/// Apply pending migrations in version order
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    create_migrations_table(pool).await?;

    for (version, name, sql) in migrations() {
        if is_migration_applied(pool, version).await? {
            continue;
        }

        info!(version = version, name = name, "Applying migration");

        // simple-query protocol: migrations hold several statements
        pool.execute(sql).await?;
        record_migration(pool, version, name).await?;

        info!(version = version, name = name, "Migration applied");
    }

    Ok(())
}

async fn create_migrations_table(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn is_migration_applied(pool: &PgPool, version: i32) -> Result<bool> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM schema_migrations WHERE version = $1",
    )
    .bind(version)
    .fetch_one(pool)
    .await?;

    Ok(count > 0)
}

async fn record_migration(pool: &PgPool, version: i32, name: &str) -> Result<()> {
    sqlx::query("INSERT INTO schema_migrations (version, name) VALUES ($1, $2)")
        .bind(version)
        .bind(name)
        .execute(pool)
        .await?;

    Ok(())
}

fn migrations() -> Vec<(i32, &'static str, &'static str)> {
    vec![(1, "proxy_pool", MIGRATION_001_PROXY_POOL)]
}

const MIGRATION_001_PROXY_POOL: &str = r#"
CREATE TABLE IF NOT EXISTS proxies (
    key VARCHAR(300) PRIMARY KEY,
    host VARCHAR(255) NOT NULL,
    port INTEGER NOT NULL CHECK (port BETWEEN 1 AND 65535),
    username VARCHAR(255),
    password VARCHAR(255),
    status VARCHAR(20) NOT NULL DEFAULT 'available',
    score SMALLINT NOT NULL DEFAULT 50 CHECK (score BETWEEN 0 AND 100),
    fraud_score SMALLINT NOT NULL DEFAULT 0 CHECK (fraud_score BETWEEN 0 AND 100),
    latency_ms BIGINT,
    last_checked_at TIMESTAMPTZ,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    assigned_account_id VARCHAR(255),
    country_hint VARCHAR(8),
    last_error VARCHAR(32),
    blacklisted_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT assignment_matches_status
        CHECK ((status = 'assigned') = (assigned_account_id IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_proxies_status ON proxies(status);
CREATE INDEX IF NOT EXISTS idx_proxies_blacklisted_at ON proxies(blacklisted_at)
    WHERE blacklisted_at IS NOT NULL;

CREATE OR REPLACE FUNCTION update_updated_at_column()
RETURNS TRIGGER AS $$
BEGIN
    NEW.updated_at = NOW();
    RETURN NEW;
END;
$$ language 'plpgsql';

DROP TRIGGER IF EXISTS update_proxies_updated_at ON proxies;
CREATE TRIGGER update_proxies_updated_at
    BEFORE UPDATE ON proxies
    FOR EACH ROW
    EXECUTE FUNCTION update_updated_at_column();
"#;
