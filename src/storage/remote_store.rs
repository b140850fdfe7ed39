use super::{clamp_count, StorageBackend, ACTIVITY_COLUMNS};
use crate::error::StorageError;
use crate::models::{ActivityEvent, BackendKind, DbStats, RemoteConnectionParams};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::path::Path;
use std::time::Duration;
use tokio::sync::OnceCell;

const MAX_CONNECTIONS: u32 = 4;
/// Bounds each write attempt against an unreachable server
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);
/// Attempts per write before a transient failure is reported as persistent
const WRITE_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS activity (
        id BIGSERIAL PRIMARY KEY,
        transaction_id TEXT NOT NULL,
        tool_source TEXT NOT NULL,
        method TEXT NOT NULL,
        scheme TEXT NOT NULL,
        host TEXT NOT NULL,
        port INTEGER NOT NULL,
        path TEXT NOT NULL,
        captured_at BIGINT NOT NULL,
        capture_second BIGINT NOT NULL,
        request_header_size BIGINT NOT NULL,
        request_body_size BIGINT NOT NULL,
        request_body BYTEA,
        response_status INTEGER,
        response_size BIGINT,
        response_body BYTEA,
        in_scope BOOLEAN NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_activity_capture_second ON activity(capture_second)",
];

/// PostgreSQL-backed store reached through a connection pool.
///
/// The pool connects lazily, so an unreachable server surfaces on the first
/// write instead of at construction.
pub struct RemoteStore {
    pool: PgPool,
    schema_ready: OnceCell<()>,
    target: String,
}

impl RemoteStore {
    /// Build the pool without contacting the server.
    pub fn connect_lazy(params: &RemoteConnectionParams) -> Result<Self, StorageError> {
        params.validate().map_err(StorageError::Persistent)?;
        let options = PgConnectOptions::new()
            .host(&params.host)
            .port(params.port)
            .database(&params.database)
            .username(&params.username)
            .password(&params.password);
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy_with(options);
        Ok(Self {
            pool,
            schema_ready: OnceCell::new(),
            target: format!("{}:{}/{}", params.host, params.port, params.database),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        self.schema_ready
            .get_or_try_init(|| async {
                for statement in SCHEMA {
                    sqlx::query(statement).execute(&self.pool).await?;
                }
                Ok::<_, StorageError>(())
            })
            .await?;
        Ok(())
    }

    async fn insert(&self, event: &ActivityEvent) -> Result<(), StorageError> {
        self.ensure_schema().await?;
        let response = event.response.as_ref();
        sqlx::query(&format!(
            "INSERT INTO activity ({ACTIVITY_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
        ))
        .bind(&event.transaction_id)
        .bind(event.tool.as_str())
        .bind(&event.method)
        .bind(&event.scheme)
        .bind(&event.host)
        .bind(i32::from(event.port))
        .bind(&event.path)
        .bind(event.captured_at_ms)
        .bind(event.capture_second())
        .bind(event.request_header_size as i64)
        .bind(event.request_body_size as i64)
        .bind(event.request_body.as_deref())
        .bind(response.map(|r| i32::from(r.status_code)))
        .bind(response.map(|r| r.size as i64))
        .bind(response.and_then(|r| r.body.as_deref()))
        .bind(event.in_scope)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for RemoteStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn supports_relocation(&self) -> bool {
        false
    }

    async fn persist(&self, event: ActivityEvent) -> Result<(), StorageError> {
        let mut attempt = 1;
        loop {
            match self.insert(&event).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < WRITE_ATTEMPTS => {
                    tracing::warn!(
                        "Remote write attempt {}/{} failed: {}",
                        attempt,
                        WRITE_ATTEMPTS,
                        err
                    );
                    attempt += 1;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(err) if err.is_transient() => {
                    return Err(StorageError::Persistent(format!(
                        "{} unreachable after {} attempts: {}",
                        self.target, WRITE_ATTEMPTS, err
                    )));
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn query_stats(&self) -> Result<DbStats, StorageError> {
        self.ensure_schema().await?;
        let (count, biggest, total): (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*)::BIGINT,
                    COALESCE(MAX(request_header_size + request_body_size), 0)::BIGINT,
                    COALESCE(SUM(request_header_size + request_body_size), 0)::BIGINT
             FROM activity",
        )
        .fetch_one(&self.pool)
        .await?;
        let max_hits: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(hits), 0)::BIGINT
             FROM (SELECT COUNT(*) AS hits FROM activity GROUP BY capture_second) AS per_second",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(DbStats {
            size_on_disk: None,
            biggest_request_size: clamp_count(biggest),
            total_requests_size: clamp_count(total),
            total_record_count: clamp_count(count),
            max_hits_by_second: clamp_count(max_hits),
        })
    }

    fn size_on_disk(&self) -> Option<u64> {
        None
    }

    async fn relocate(&self, _target: &Path) -> Result<(), StorageError> {
        Err(StorageError::Unsupported {
            operation: "relocate",
            backend: BackendKind::Remote.as_str(),
        })
    }

    async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Remote store connections to {} closed", self.target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relocation_is_unsupported() {
        let store = RemoteStore::connect_lazy(&RemoteConnectionParams::default())
            .expect("lazy pool builds");
        assert!(!store.supports_relocation());
        assert_eq!(store.kind(), BackendKind::Remote);
        assert_eq!(store.size_on_disk(), None);

        let err = store
            .relocate(Path::new("/tmp/elsewhere.db"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Unsupported");
        store.close().await;
    }

    #[tokio::test]
    async fn unreachable_server_fails_fast_as_persistent() {
        let params = RemoteConnectionParams {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..Default::default()
        };
        let store = RemoteStore::connect_lazy(&params).expect("lazy pool builds");

        let started = std::time::Instant::now();
        let err = store
            .persist(crate::models::sample_event("tx", "/"))
            .await
            .expect_err("nothing listens on port 1");
        assert!(err.is_persistent(), "got {err:?}");
        assert!(err.to_string().contains("after 3 attempts"));
        assert!(started.elapsed() < Duration::from_secs(8));
        store.close().await;
    }

    #[tokio::test]
    async fn invalid_params_are_rejected() {
        let params = RemoteConnectionParams {
            database: String::new(),
            ..Default::default()
        };
        let err = RemoteStore::connect_lazy(&params).err().expect("rejected");
        assert!(err.is_persistent());
    }

    #[tokio::test]
    async fn target_hides_credentials() {
        let params = RemoteConnectionParams {
            host: "db.internal".to_string(),
            port: 6543,
            database: "audit".to_string(),
            username: "logger".to_string(),
            password: "hunter2".to_string(),
        };
        let store = RemoteStore::connect_lazy(&params).expect("lazy pool builds");
        assert_eq!(store.target(), "db.internal:6543/audit");
    }
}
