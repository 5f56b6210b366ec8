//! Postgres backend.
//!
//! The upserts only touch an existing row of the same kind (`WHERE metrics.type
//! = EXCLUDED.type`); zero affected rows therefore means the name is taken by
//! the other kind. Multi-row writes run in one transaction, and a retriable
//! failure replays the whole transaction, never a single statement of it.

use super::{migrations, MetricStore, StoreError};
use crate::retry::RetryExecutor;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Connection, PgExecutor};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use vigil_protocol::{MetricKind, MetricSample, MetricValue, WireMetric};

const UPSERT_GAUGE: &str = r#"
    INSERT INTO metrics (name, type, value, delta)
    VALUES ($1, 'gauge', $2, NULL)
    ON CONFLICT (name) DO UPDATE
    SET value = EXCLUDED.value, updated_at = NOW()
    WHERE metrics.type = EXCLUDED.type
"#;

const UPSERT_COUNTER: &str = r#"
    INSERT INTO metrics (name, type, value, delta)
    VALUES ($1, 'counter', NULL, $2)
    ON CONFLICT (name) DO UPDATE
    SET delta = COALESCE(metrics.delta, 0) + EXCLUDED.delta, updated_at = NOW()
    WHERE metrics.type = EXCLUDED.type
"#;

/// SQLSTATE numeric_value_out_of_range, raised when a counter sum leaves BIGINT.
const NUMERIC_OUT_OF_RANGE: &str = "22003";

const INSERT_REPLACING: &str = r#"
    INSERT INTO metrics (name, type, value, delta)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (name) DO UPDATE
    SET type = EXCLUDED.type, value = EXCLUDED.value, delta = EXCLUDED.delta, updated_at = NOW()
"#;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    retry: RetryExecutor,
}

impl PostgresStore {
    #[instrument(skip_all)]
    pub async fn connect(dsn: &str, retry: RetryExecutor) -> Result<Self, StoreError> {
        info!("Connecting to Postgres");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(dsn)
            .await?;

        migrations::run(&pool).await?;
        info!("Postgres store ready");
        Ok(Self { pool, retry })
    }

    async fn apply_batch(&self, samples: &[MetricSample]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for sample in samples {
            if let Err(e) = upsert_on(&mut *tx, &sample.id, sample.value).await {
                warn!(metric = %sample.id, error = %e, "batch aborted, rolling back");
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                return Err(e);
            }
        }
        tx.commit().await?;
        debug!(count = samples.len(), "batch committed");
        Ok(())
    }

    async fn replace_in_tx(&self, samples: &[MetricSample]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM metrics").execute(&mut *tx).await?;
        for sample in samples {
            let (value, delta) = match sample.value {
                MetricValue::Gauge(v) => (Some(v), None),
                MetricValue::Counter(d) => (None, Some(d)),
            };
            sqlx::query(INSERT_REPLACING)
                .bind(sample.id.as_str())
                .bind(sample.kind().as_str())
                .bind(value)
                .bind(delta)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn upsert_on<'e, E>(executor: E, name: &str, value: MetricValue) -> Result<(), StoreError>
where
    E: PgExecutor<'e>,
{
    let outcome = match value {
        MetricValue::Gauge(v) => sqlx::query(UPSERT_GAUGE).bind(name).bind(v).execute(executor).await,
        MetricValue::Counter(d) => sqlx::query(UPSERT_COUNTER).bind(name).bind(d).execute(executor).await,
    };
    let result = outcome.map_err(|e| write_error(name, e))?;
    if result.rows_affected() == 0 {
        let existing = match value.kind() {
            MetricKind::Gauge => MetricKind::Counter,
            MetricKind::Counter => MetricKind::Gauge,
        };
        return Err(StoreError::KindConflict { name: name.to_string(), existing });
    }
    Ok(())
}

/// A BIGINT overflow is reported like the in-memory store reports it.
fn write_error(name: &str, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(NUMERIC_OUT_OF_RANGE) => {
            StoreError::Overflow { name: name.to_string() }
        }
        _ => StoreError::Database(err),
    }
}

#[async_trait]
impl MetricStore for PostgresStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self))]
    async fn get_gauge(&self, name: &str) -> Result<Option<f64>, StoreError> {
        let value: Option<Option<f64>> = self
            .retry
            .run(|| {
                sqlx::query_scalar("SELECT value FROM metrics WHERE type = 'gauge' AND name = $1")
                    .bind(name)
                    .fetch_optional(&self.pool)
            })
            .await?;
        Ok(value.flatten())
    }

    #[instrument(skip(self))]
    async fn get_counter(&self, name: &str) -> Result<Option<i64>, StoreError> {
        let delta: Option<Option<i64>> = self
            .retry
            .run(|| {
                sqlx::query_scalar("SELECT delta FROM metrics WHERE type = 'counter' AND name = $1")
                    .bind(name)
                    .fetch_optional(&self.pool)
            })
            .await?;
        Ok(delta.flatten())
    }

    #[instrument(skip(self))]
    async fn upsert_gauge(&self, name: &str, value: f64) -> Result<(), StoreError> {
        self.retry.run(|| upsert_on(&self.pool, name, MetricValue::Gauge(value))).await
    }

    #[instrument(skip(self))]
    async fn upsert_counter(&self, name: &str, delta: i64) -> Result<(), StoreError> {
        self.retry.run(|| upsert_on(&self.pool, name, MetricValue::Counter(delta))).await
    }

    #[instrument(skip(self))]
    async fn list_all(&self) -> Result<Vec<MetricSample>, StoreError> {
        let rows: Vec<(String, String, Option<f64>, Option<i64>)> = self
            .retry
            .run(|| {
                sqlx::query_as("SELECT name, type, value, delta FROM metrics ORDER BY name")
                    .fetch_all(&self.pool)
            })
            .await?;

        rows.into_iter()
            .map(|(id, kind, value, delta)| {
                MetricSample::try_from(WireMetric { id, kind, delta, value }).map_err(StoreError::from)
            })
            .collect()
    }

    #[instrument(skip_all, fields(count = samples.len()))]
    async fn replace_all(&self, samples: Vec<MetricSample>) -> Result<(), StoreError> {
        self.retry.run(|| self.replace_in_tx(&samples)).await
    }

    #[instrument(skip_all, fields(count = samples.len()))]
    async fn batch_upsert(&self, samples: &[MetricSample]) -> Result<(), StoreError> {
        if samples.is_empty() {
            return Ok(());
        }
        self.retry.run(|| self.apply_batch(samples)).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        conn.ping().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect() -> PostgresStore {
        let dsn = std::env::var("DATABASE_DSN").expect("DATABASE_DSN must point at a scratch database");
        let store = PostgresStore::connect(&dsn, RetryExecutor::new(Vec::new())).await.unwrap();
        sqlx::query("DELETE FROM metrics").execute(&store.pool).await.unwrap();
        store
    }

    /// Server error carrying only a SQLSTATE.
    #[derive(Debug)]
    struct CodedError(&'static str);

    impl std::fmt::Display for CodedError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "sqlstate {}", self.0)
        }
    }

    impl std::error::Error for CodedError {}

    impl sqlx::error::DatabaseError for CodedError {
        fn message(&self) -> &str {
            "coded error"
        }
        fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
            Some(self.0.into())
        }
        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }
        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }
        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }
        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }
    }

    #[test]
    fn test_bigint_overflow_maps_to_store_overflow() {
        let err = sqlx::Error::Database(Box::new(CodedError("22003")));
        assert!(matches!(write_error("hits", err), StoreError::Overflow { name } if name == "hits"));

        let err = sqlx::Error::Database(Box::new(CodedError("23505")));
        assert!(matches!(write_error("hits", err), StoreError::Database(_)));
        assert!(matches!(write_error("hits", sqlx::Error::PoolTimedOut), StoreError::Database(_)));
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_dsn() {
        let result = PostgresStore::connect("definitely not a dsn", RetryExecutor::new(Vec::new())).await;
        assert!(matches!(result, Err(StoreError::Database(_))));
    }

    #[tokio::test]
    #[ignore = "needs a Postgres instance in DATABASE_DSN"]
    async fn test_postgres_store_semantics() {
        let store = connect().await;
        store.ping().await.unwrap();

        store.upsert_gauge("cpu", 10.0).await.unwrap();
        store.upsert_gauge("cpu", 55.5).await.unwrap();
        assert_eq!(store.get_gauge("cpu").await.unwrap(), Some(55.5));

        store.upsert_counter("hits", 5).await.unwrap();
        store.upsert_counter("hits", 5).await.unwrap();
        assert_eq!(store.get_counter("hits").await.unwrap(), Some(10));
        assert_eq!(store.get_gauge("hits").await.unwrap(), None);

        assert!(matches!(
            store.upsert_counter("cpu", 1).await,
            Err(StoreError::KindConflict { .. })
        ));

        store.upsert_counter("big", i64::MAX).await.unwrap();
        assert!(matches!(store.upsert_counter("big", 1).await, Err(StoreError::Overflow { .. })));
        assert_eq!(store.get_counter("big").await.unwrap(), Some(i64::MAX));

        let before = store.list_all().await.unwrap();
        let batch = vec![
            MetricSample::counter("hits", 1),
            MetricSample::counter("cpu", 1),
            MetricSample::gauge("fresh", 1.0),
        ];
        assert!(store.batch_upsert(&batch).await.is_err());
        assert_eq!(store.list_all().await.unwrap(), before);

        store
            .batch_upsert(&[MetricSample::gauge("cpu", 99.9), MetricSample::counter("req", 10)])
            .await
            .unwrap();
        assert_eq!(store.get_gauge("cpu").await.unwrap(), Some(99.9));
        assert_eq!(store.get_counter("req").await.unwrap(), Some(10));

        store
            .replace_all(vec![MetricSample::counter("a", 3), MetricSample::gauge("b", 0.5)])
            .await
            .unwrap();
        assert_eq!(
            store.list_all().await.unwrap(),
            vec![MetricSample::counter("a", 3), MetricSample::gauge("b", 0.5)]
        );
    }
}
