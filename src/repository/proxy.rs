use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use super::ProxyStore;
use crate::error::Result;
use crate::models::ProxyRecord;

/// Postgres-backed proxy store
#[derive(Clone)]
pub struct ProxyRepository {
    pool: PgPool,
}

impl ProxyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProxyStore for ProxyRepository {
    async fn load_all(&self) -> Result<Vec<ProxyRecord>> {
        let records = sqlx::query_as::<_, ProxyRecord>(
            r#"
            SELECT key, host, port, username, password, status,
                   score, fraud_score, latency_ms, last_checked_at,
                   consecutive_failures, assigned_account_id, country_hint,
                   last_error, blacklisted_at, created_at
            FROM proxies
            ORDER BY key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn upsert_many(&self, records: &[ProxyRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut affected = 0;

        for record in records {
            let result = sqlx::query(
                r#"
                INSERT INTO proxies (
                    key, host, port, username, password, status,
                    score, fraud_score, latency_ms, last_checked_at,
                    consecutive_failures, assigned_account_id, country_hint,
                    last_error, blacklisted_at, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                ON CONFLICT (key) DO UPDATE SET
                    host = EXCLUDED.host,
                    port = EXCLUDED.port,
                    username = EXCLUDED.username,
                    password = EXCLUDED.password,
                    status = EXCLUDED.status,
                    score = EXCLUDED.score,
                    fraud_score = EXCLUDED.fraud_score,
                    latency_ms = EXCLUDED.latency_ms,
                    last_checked_at = EXCLUDED.last_checked_at,
                    consecutive_failures = EXCLUDED.consecutive_failures,
                    assigned_account_id = EXCLUDED.assigned_account_id,
                    country_hint = EXCLUDED.country_hint,
                    last_error = EXCLUDED.last_error,
                    blacklisted_at = EXCLUDED.blacklisted_at
                "#,
            )
            .bind(&record.key)
            .bind(&record.host)
            .bind(record.port)
            .bind(&record.username)
            .bind(&record.password)
            .bind(&record.status)
            .bind(record.score)
            .bind(record.fraud_score)
            .bind(record.latency_ms)
            .bind(record.last_checked_at)
            .bind(record.consecutive_failures)
            .bind(&record.assigned_account_id)
            .bind(&record.country_hint)
            .bind(&record.last_error)
            .bind(record.blacklisted_at)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await?;

            affected += result.rows_affected();
        }

        tx.commit().await?;
        debug!(count = affected, "Upserted proxies");
        Ok(affected)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query("DELETE FROM proxies WHERE key = ANY($1)")
            .bind(keys)
            .execute(&self.pool)
            .await?;

        debug!(count = result.rows_affected(), "Deleted proxies");
        Ok(result.rows_affected())
    }
}
