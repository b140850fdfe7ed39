use super::{clamp_count, StorageBackend, ACTIVITY_COLUMNS};
use crate::error::StorageError;
use crate::models::{ActivityEvent, BackendKind, DbStats};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Version written to `store_meta`; files with any other version are rejected
pub const SCHEMA_VERSION: i64 = 1;

/// File name used when no custom store location is configured
pub const DEFAULT_STORE_FILE_NAME: &str = "ProxyActivityLog.db";

/// How long a write waits on a locked file before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS store_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS activity (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        transaction_id TEXT NOT NULL,
        tool_source TEXT NOT NULL,
        method TEXT NOT NULL,
        scheme TEXT NOT NULL,
        host TEXT NOT NULL,
        port INTEGER NOT NULL,
        path TEXT NOT NULL,
        captured_at INTEGER NOT NULL,
        capture_second INTEGER NOT NULL,
        request_header_size INTEGER NOT NULL,
        request_body_size INTEGER NOT NULL,
        request_body BLOB,
        response_status INTEGER,
        response_size INTEGER,
        response_body BLOB,
        in_scope INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_activity_capture_second
        ON activity(capture_second);
";

struct EmbeddedState {
    conn: Option<Connection>,
    path: PathBuf,
}

impl EmbeddedState {
    fn conn(&self) -> Result<&Connection, StorageError> {
        self.conn
            .as_ref()
            .ok_or_else(|| StorageError::Persistent("embedded store is closed".to_string()))
    }
}

/// Single-file SQLite store. Writes are serialized on one connection.
pub struct EmbeddedStore {
    state: Arc<Mutex<EmbeddedState>>,
    /// Current file, readable without waiting for an in-flight write
    location: ArcSwap<PathBuf>,
}

impl EmbeddedStore {
    /// Open or create the store at `path`, rejecting files with an incompatible schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path)?;
        tracing::info!("Embedded store opened at {}", path.display());
        Ok(Self {
            location: ArcSwap::from_pointee(path.clone()),
            state: Arc::new(Mutex::new(EmbeddedState {
                conn: Some(conn),
                path,
            })),
        })
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::clone(&self.location.load())
    }

    async fn with_state<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut EmbeddedState) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&state);
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Database(format!("storage task failed: {e}")))?
    }
}

fn lock(state: &Mutex<EmbeddedState>) -> MutexGuard<'_, EmbeddedState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn open_connection(path: &Path) -> Result<Connection, StorageError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    ensure_schema(&conn, path)?;
    Ok(conn)
}

/// Initialize an empty file, or verify that an existing one is an activity store
fn ensure_schema(conn: &Connection, path: &Path) -> Result<(), StorageError> {
    let incompatible = |reason: String| StorageError::Incompatible {
        path: path.to_path_buf(),
        reason,
    };
    let not_a_store = |err: rusqlite::Error| match err.sqlite_error_code() {
        Some(ErrorCode::NotADatabase) => incompatible("not a SQLite database".to_string()),
        _ => StorageError::from(err),
    };

    let tables: Vec<String> = {
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            )
            .map_err(not_a_store)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(not_a_store)?;
        rows.collect::<Result<_, _>>().map_err(not_a_store)?
    };

    if tables.iter().any(|t| t == "store_meta") {
        let version: Option<String> = conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match version.as_deref().map(str::parse::<i64>) {
            Some(Ok(SCHEMA_VERSION)) => {}
            Some(Ok(other)) => return Err(incompatible(format!("schema version {other}"))),
            _ => return Err(incompatible("missing schema version".to_string())),
        }
    } else if !tables.is_empty() {
        return Err(incompatible(format!(
            "unrecognized tables: {}",
            tables.join(", ")
        )));
    }

    conn.execute_batch(SCHEMA)?;
    conn.execute(
        "INSERT OR IGNORE INTO store_meta (key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

fn insert_event(conn: &Connection, event: &ActivityEvent) -> Result<(), StorageError> {
    let response = event.response.as_ref();
    conn.prepare_cached(&format!(
        "INSERT INTO activity ({ACTIVITY_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
    ))?
    .execute(params![
        event.transaction_id,
        event.tool.as_str(),
        event.method,
        event.scheme,
        event.host,
        event.port as i64,
        event.path,
        event.captured_at_ms,
        event.capture_second(),
        event.request_header_size as i64,
        event.request_body_size as i64,
        event.request_body,
        response.map(|r| r.status_code as i64),
        response.map(|r| r.size as i64),
        response.and_then(|r| r.body.as_deref()),
        event.in_scope,
    ])?;
    Ok(())
}

fn compute_stats(conn: &Connection) -> Result<DbStats, StorageError> {
    let (count, biggest, total): (i64, i64, i64) = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(MAX(request_header_size + request_body_size), 0),
                COALESCE(SUM(request_header_size + request_body_size), 0)
         FROM activity",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    let max_hits: i64 = conn.query_row(
        "SELECT COALESCE(MAX(hits), 0)
         FROM (SELECT COUNT(*) AS hits FROM activity GROUP BY capture_second)",
        [],
        |row| row.get(0),
    )?;
    Ok(DbStats {
        size_on_disk: None,
        biggest_request_size: clamp_count(biggest),
        total_requests_size: clamp_count(total),
        total_record_count: clamp_count(count),
        max_hits_by_second: clamp_count(max_hits),
    })
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn relocate_locked(state: &mut EmbeddedState, target: PathBuf) -> Result<(), StorageError> {
    if same_file(&state.path, &target) {
        tracing::info!("Store already located at {}", target.display());
        return Ok(());
    }

    let has_content = fs::metadata(&target).map(|m| m.len() > 0).unwrap_or(false);
    let conn = if has_content {
        // Adopt an existing store; open_connection rejects anything incompatible.
        open_connection(&target)?
    } else {
        if let Some(dir) = target.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        let copied = state
            .conn()?
            .execute("VACUUM INTO ?1", params![target.to_string_lossy().into_owned()])
            .map_err(StorageError::from)
            .and_then(|_| open_connection(&target));
        match copied {
            Ok(conn) => conn,
            Err(err) => {
                let _ = fs::remove_file(&target);
                return Err(err);
            }
        }
    };

    let previous = std::mem::replace(&mut state.path, target);
    if let Some(old) = state.conn.replace(conn) {
        if let Err((_, err)) = old.close() {
            tracing::warn!("Failed to close previous store {}: {}", previous.display(), err);
        }
    }
    tracing::info!(
        "Embedded store relocated from {} to {}",
        previous.display(),
        state.path.display()
    );
    Ok(())
}

#[async_trait]
impl StorageBackend for EmbeddedStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    fn supports_relocation(&self) -> bool {
        true
    }

    async fn persist(&self, event: ActivityEvent) -> Result<(), StorageError> {
        self.with_state(move |state| insert_event(state.conn()?, &event))
            .await
    }

    async fn query_stats(&self) -> Result<DbStats, StorageError> {
        let mut stats = self.with_state(|state| compute_stats(state.conn()?)).await?;
        stats.size_on_disk = self.size_on_disk();
        Ok(stats)
    }

    fn size_on_disk(&self) -> Option<u64> {
        fs::metadata(self.location.load().as_path())
            .ok()
            .map(|m| m.len())
    }

    async fn relocate(&self, target: &Path) -> Result<(), StorageError> {
        let target = target.to_path_buf();
        let current = self
            .with_state(move |state| {
                relocate_locked(state, target)?;
                Ok(state.path.clone())
            })
            .await?;
        self.location.store(Arc::new(current));
        Ok(())
    }

    async fn close(&self) {
        let result = self
            .with_state(|state| {
                if let Some(conn) = state.conn.take() {
                    conn.close().map_err(|(_, err)| StorageError::from(err))?;
                }
                Ok(())
            })
            .await;
        match result {
            Ok(()) => tracing::info!("Embedded store closed"),
            Err(err) => tracing::warn!("Failed to close embedded store: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{sample_event, ResponseFields};
    use tempfile::tempdir;

    #[tokio::test]
    async fn size_on_disk_does_not_wait_for_the_connection() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("activity.db");
        let store = EmbeddedStore::open(&path).expect("store opens");

        let _busy = lock(&store.state);
        assert!(store.size_on_disk().unwrap_or(0) > 0);
        assert_eq!(store.path(), path);
    }

    fn event_at(id: &str, second: i64, body_len: usize) -> ActivityEvent {
        let mut event = sample_event(id, "/api/items");
        event.captured_at_ms = second * 1000;
        event.request_body = Some(vec![b'x'; body_len]);
        event.request_body_size = body_len as u64;
        event
    }

    #[tokio::test]
    async fn persist_then_query_stats() {
        let dir = tempdir().expect("temp dir");
        let store = EmbeddedStore::open(dir.path().join("activity.db")).expect("store opens");

        store.persist(event_at("a", 100, 10)).await.expect("persist a");
        store.persist(event_at("b", 100, 500)).await.expect("persist b");
        let mut answered = event_at("c", 101, 0);
        answered.response = Some(ResponseFields {
            status_code: 404,
            size: 12,
            body: None,
        });
        store.persist(answered).await.expect("persist c");

        let stats = store.query_stats().await.expect("stats");
        assert_eq!(stats.total_record_count, 3);
        assert_eq!(stats.biggest_request_size, 620);
        assert_eq!(stats.total_requests_size, 130 + 620 + 120);
        assert_eq!(stats.max_hits_by_second, 2);
        assert!(stats.size_on_disk.unwrap_or(0) > 0);
    }

    #[tokio::test]
    async fn reopen_keeps_records() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nested/dir/activity.db");
        {
            let store = EmbeddedStore::open(&path).expect("store opens");
            store.persist(event_at("a", 1, 1)).await.expect("persist");
            store.close().await;
        }
        let store = EmbeddedStore::open(&path).expect("store reopens");
        assert_eq!(store.query_stats().await.unwrap().total_record_count, 1);
    }

    #[tokio::test]
    async fn persist_after_close_fails_fast() {
        let dir = tempdir().expect("temp dir");
        let store = EmbeddedStore::open(dir.path().join("a.db")).expect("store opens");
        store.close().await;
        let err = store.persist(event_at("a", 1, 1)).await.unwrap_err();
        assert!(err.is_persistent());
    }

    #[test]
    fn rejects_foreign_sqlite_file() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("foreign.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY);")
            .unwrap();
        drop(conn);

        let err = EmbeddedStore::open(&path).err().expect("foreign file rejected");
        assert_eq!(err.kind(), "Incompatible");
    }

    #[test]
    fn rejects_other_schema_version() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("future.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE store_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);
             INSERT INTO store_meta VALUES ('schema_version', '9');",
        )
        .unwrap();
        drop(conn);

        let err = EmbeddedStore::open(&path).err().expect("version rejected");
        assert!(err.to_string().contains("schema version 9"));
    }

    #[test]
    fn rejects_non_database_file() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("notes.db");
        fs::write(&path, vec![b'z'; 4096]).unwrap();

        let err = EmbeddedStore::open(&path).err().expect("garbage rejected");
        assert_eq!(err.kind(), "Incompatible");
    }

    #[tokio::test]
    async fn relocate_copies_into_new_file() {
        let dir = tempdir().expect("temp dir");
        let original = dir.path().join("original.db");
        let target = dir.path().join("moved/target.db");
        let store = EmbeddedStore::open(&original).expect("store opens");
        for i in 0..4 {
            store.persist(event_at(&format!("e{i}"), 5, 1)).await.unwrap();
        }

        store.relocate(&target).await.expect("relocation succeeds");
        assert_eq!(store.path(), target);
        assert_eq!(store.query_stats().await.unwrap().total_record_count, 4);

        store.persist(event_at("after", 6, 1)).await.unwrap();
        assert_eq!(store.query_stats().await.unwrap().total_record_count, 5);

        // the old file is left as it was
        let old = EmbeddedStore::open(&original).unwrap();
        assert_eq!(old.query_stats().await.unwrap().total_record_count, 4);
    }

    #[tokio::test]
    async fn relocate_into_empty_file() {
        let dir = tempdir().expect("temp dir");
        let target = dir.path().join("empty.db");
        fs::write(&target, b"").unwrap();
        let store = EmbeddedStore::open(dir.path().join("a.db")).unwrap();
        store.persist(event_at("a", 1, 1)).await.unwrap();

        store.relocate(&target).await.expect("empty target accepted");
        assert_eq!(store.query_stats().await.unwrap().total_record_count, 1);
    }

    #[tokio::test]
    async fn relocate_adopts_existing_compatible_store() {
        let dir = tempdir().expect("temp dir");
        let other_path = dir.path().join("other.db");
        {
            let other = EmbeddedStore::open(&other_path).unwrap();
            for i in 0..3 {
                other.persist(event_at(&format!("o{i}"), 9, 1)).await.unwrap();
            }
            other.close().await;
        }

        let store = EmbeddedStore::open(dir.path().join("a.db")).unwrap();
        store.persist(event_at("a", 1, 1)).await.unwrap();
        store.relocate(&other_path).await.expect("compatible store adopted");
        assert_eq!(store.query_stats().await.unwrap().total_record_count, 3);
    }

    #[tokio::test]
    async fn failed_relocation_keeps_original_store() {
        let dir = tempdir().expect("temp dir");
        let original = dir.path().join("a.db");
        let target = dir.path().join("garbage.db");
        fs::write(&target, vec![b'z'; 4096]).unwrap();

        let store = EmbeddedStore::open(&original).unwrap();
        store.persist(event_at("a", 1, 1)).await.unwrap();

        let err = store.relocate(&target).await.unwrap_err();
        assert_eq!(err.kind(), "Incompatible");
        assert_eq!(store.path(), original);
        assert_eq!(fs::read(&target).unwrap(), vec![b'z'; 4096]);

        store.persist(event_at("b", 2, 1)).await.unwrap();
        assert_eq!(store.query_stats().await.unwrap().total_record_count, 2);
    }
}
