//! Postgres-backed store.
//!
//! One table holds every key. Expiry is enforced inside each statement with
//! `expires_at > NOW()`, so a row past its deadline is never returned or
//! matched, whether or not it has been purged yet.

use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgPoolOptions};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, warn};

use super::{Backend, Item};
use crate::{Error, Result};

const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));

const LIVE: &str = "(expires_at IS NULL OR expires_at > NOW())";

#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
}

fn ttl_millis(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

fn ttl_from_seconds(seconds: Option<f64>) -> Option<Duration> {
    seconds.map(|s| Duration::from_secs_f64(s.max(0.0)))
}

fn span(operation: &str, statement: &str) -> tracing::Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

impl PgBackend {
    /// Connect and make sure the key/value table exists.
    ///
    /// # Errors
    /// Returns `Storage` if the connection or schema setup fails.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(10).connect(dsn).await?;
        let backend = Self { pool };
        backend.migrate().await?;
        Ok(backend)
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply `sql/schema.sql`; every statement is idempotent.
    ///
    /// # Errors
    /// Returns `Storage` if a statement fails.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA_SQL.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Delete rows past their deadline.
    ///
    /// # Errors
    /// Returns `Storage` if the statement fails.
    pub async fn purge_expired(&self) -> Result<u64> {
        let query = "DELETE FROM custos_kv WHERE expires_at IS NOT NULL AND expires_at <= NOW()";
        let result = sqlx::query(query)
            .execute(&self.pool)
            .instrument(span("DELETE", query))
            .await?;
        Ok(result.rows_affected())
    }

    /// Periodically purge expired rows until `shutdown` fires.
    pub fn spawn_reaper(&self, period: Duration, shutdown: CancellationToken) {
        let backend = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => match backend.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => debug!("purged {purged} expired rows"),
                        Err(err) => warn!("failed to purge expired rows: {err}"),
                    },
                }
            }
        });
    }
}

#[async_trait]
impl Backend for PgBackend {
    async fn get(&self, key: &str) -> Result<Item> {
        let query = format!(
            "SELECT value, EXTRACT(EPOCH FROM (expires_at - NOW()))::float8 AS ttl \
             FROM custos_kv WHERE key = $1 AND {LIVE}"
        );
        let row = sqlx::query(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .instrument(span("SELECT", &query))
            .await?
            .ok_or_else(|| Error::not_found(key))?;

        Ok(Item {
            key: key.to_string(),
            value: row.try_get("value")?,
            ttl: ttl_from_seconds(row.try_get("ttl")?),
        })
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let query = r"
            INSERT INTO custos_kv (key, value, expires_at)
            VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 millisecond'))
            ON CONFLICT (key) DO UPDATE
                SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
        ";
        sqlx::query(query)
            .bind(key)
            .bind(value)
            .bind(ttl_millis(ttl))
            .execute(&self.pool)
            .instrument(span("INSERT", query))
            .await?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<()> {
        let result = if let Some(expected) = expected {
            let query = format!(
                "UPDATE custos_kv \
                 SET value = $2, expires_at = NOW() + ($3 * INTERVAL '1 millisecond') \
                 WHERE key = $1 AND value = $4 AND {LIVE}"
            );
            sqlx::query(&query)
                .bind(key)
                .bind(value)
                .bind(ttl_millis(ttl))
                .bind(expected)
                .execute(&self.pool)
                .instrument(span("UPDATE", &query))
                .await?
        } else {
            // An expired row may still be present; it counts as absent.
            let query = r"
                INSERT INTO custos_kv (key, value, expires_at)
                VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 millisecond'))
                ON CONFLICT (key) DO UPDATE
                    SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
                    WHERE custos_kv.expires_at IS NOT NULL AND custos_kv.expires_at <= NOW()
            ";
            sqlx::query(query)
                .bind(key)
                .bind(value)
                .bind(ttl_millis(ttl))
                .execute(&self.pool)
                .instrument(span("INSERT", query))
                .await?
        };

        if result.rows_affected() == 0 {
            return Err(Error::CompareFailed(key.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let query = format!("DELETE FROM custos_kv WHERE key = $1 AND {LIVE}");
        let result = sqlx::query(&query)
            .bind(key)
            .execute(&self.pool)
            .instrument(span("DELETE", &query))
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(key));
        }
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<()> {
        let query = format!("DELETE FROM custos_kv WHERE key = $1 AND value = $2 AND {LIVE}");
        let result = sqlx::query(&query)
            .bind(key)
            .bind(expected)
            .execute(&self.pool)
            .instrument(span("DELETE", &query))
            .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }
        // Distinguish a lost race from a missing key.
        match self.get(key).await {
            Ok(_) => Err(Error::CompareFailed(key.to_string())),
            Err(err) => Err(err),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Item>> {
        let query = format!(
            "SELECT key, value, EXTRACT(EPOCH FROM (expires_at - NOW()))::float8 AS ttl \
             FROM custos_kv WHERE left(key, length($1)) = $1 AND {LIVE} ORDER BY key"
        );
        let rows = sqlx::query(&query)
            .bind(prefix)
            .fetch_all(&self.pool)
            .instrument(span("SELECT", &query))
            .await?;

        rows.into_iter()
            .map(|row| -> Result<Item> {
                Ok(Item {
                    key: row.try_get("key")?,
                    value: row.try_get("value")?,
                    ttl: ttl_from_seconds(row.try_get("ttl")?),
                })
            })
            .collect()
    }
}
