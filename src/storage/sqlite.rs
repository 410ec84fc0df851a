use super::{
    ContentTypeCount, DownloadStatus, FileOperation, NewSession, SessionRecord, SessionType,
    SessionValidation, Statistics, StatsStore, StorageError,
};
use crate::config::STATS_CACHE_TTL_SECS;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Ordered schema migrations; each runs once, tracked in `schema_migrations`.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "001_operation_log",
        r"
        CREATE TABLE downloads (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          url TEXT NOT NULL,
          content_type TEXT NOT NULL,
          status TEXT NOT NULL DEFAULT 'pending',
          file_count INTEGER NOT NULL DEFAULT 0,
          error TEXT,
          created_at TEXT NOT NULL,
          finished_at TEXT
        );
        CREATE INDEX idx_downloads_status ON downloads(status);
        CREATE TABLE file_operations (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          download_id INTEGER REFERENCES downloads(id) ON DELETE SET NULL,
          file_path TEXT NOT NULL,
          file_size INTEGER NOT NULL DEFAULT 0,
          operation TEXT NOT NULL,
          method TEXT,
          success INTEGER NOT NULL,
          error TEXT,
          created_at TEXT NOT NULL
        );
        CREATE INDEX idx_file_operations_operation ON file_operations(operation, success);
        ",
    ),
    (
        "002_sessions",
        r"
        CREATE TABLE instagram_sessions (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          user_id INTEGER NOT NULL,
          username TEXT,
          session_type TEXT NOT NULL,
          source TEXT,
          is_active INTEGER NOT NULL DEFAULT 1,
          last_validated TEXT,
          expires_at TEXT,
          created_at TEXT NOT NULL
        );
        CREATE UNIQUE INDEX idx_one_active_session
          ON instagram_sessions(user_id, session_type) WHERE is_active = 1;
        CREATE TABLE session_validations (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          session_id INTEGER NOT NULL REFERENCES instagram_sessions(id) ON DELETE CASCADE,
          is_valid INTEGER NOT NULL,
          error_message TEXT,
          checked_at TEXT NOT NULL
        );
        CREATE INDEX idx_session_validations_session ON session_validations(session_id);
        ",
    ),
];

const SESSION_COLUMNS: &str = "id, user_id, username, session_type, source, is_active, \
                               last_validated, expires_at, created_at";

/// SQLite-backed [`StatsStore`].
///
/// A single connection guarded by a mutex; queries run on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    /// Statistics snapshots keyed by the write generation they were read at
    stats_cache: Cache<u64, Statistics>,
    generation: Arc<AtomicU64>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or a migration fails.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|source| StorageError::Open {
            path: path.display().to_string(),
            source,
        })?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        let store = Self::from_connection(conn)?;
        info!(path = %path.display(), "SQLite store ready");
        Ok(store)
    }

    /// Private in-memory database, mostly for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if migrations fail.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self, StorageError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            stats_cache: Cache::builder()
                .max_capacity(4)
                .time_to_live(Duration::from_secs(STATS_CACHE_TTL_SECS))
                .build(),
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Called after every committed write that feeds [`Statistics`].
    fn stats_changed(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.stats_cache.invalidate_all();
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await?
    }
}

fn migrate(conn: &mut Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
           version TEXT PRIMARY KEY,
           applied_at TEXT NOT NULL
         );",
    )?;
    for (version, sql) in MIGRATIONS {
        let applied: Option<String> = conn
            .query_row(
                "SELECT version FROM schema_migrations WHERE version = ?",
                params![version],
                |row| row.get(0),
            )
            .optional()?;
        if applied.is_some() {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)",
            params![version, now()],
        )?;
        tx.commit()?;
        debug!(version, "Applied migration");
    }
    Ok(())
}

fn now() -> String {
    format_ts(Utc::now())
}

/// Same shape as SQLite's `CURRENT_TIMESTAMP`, so text comparison orders correctly.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let kind: String = row.get(3)?;
    let session_type = SessionType::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown session type {kind:?}").into(),
        )
    })?;
    Ok(SessionRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        username: row.get(2)?,
        session_type,
        source: row.get(4)?,
        is_active: row.get(5)?,
        last_validated: row.get(6)?,
        expires_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

#[async_trait]
impl StatsStore for SqliteStore {
    async fn record_download(&self, url: &str, content_type: &str) -> Result<i64, StorageError> {
        let url = url.to_string();
        let content_type = content_type.to_string();
        let id = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO downloads (url, content_type, status, created_at) \
                     VALUES (?, ?, 'pending', ?)",
                    params![url, content_type, now()],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        self.stats_changed();
        Ok(id)
    }

    async fn finish_download(
        &self,
        id: i64,
        status: DownloadStatus,
        file_count: usize,
        error: Option<String>,
    ) -> Result<(), StorageError> {
        let file_count = i64::try_from(file_count).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE downloads SET status = ?, file_count = ?, error = ?, finished_at = ? \
                 WHERE id = ?",
                params![status.as_str(), file_count, error, now(), id],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound {
                    entity: "download",
                    id,
                });
            }
            Ok(())
        })
        .await?;
        self.stats_changed();
        Ok(())
    }

    async fn log_file_operation(&self, op: FileOperation) -> Result<i64, StorageError> {
        let id = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO file_operations \
                     (download_id, file_path, file_size, operation, method, success, error, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        op.download_id,
                        op.file_path,
                        to_i64(op.file_size),
                        op.operation.as_str(),
                        op.method.map(|m| m.as_str()),
                        op.success,
                        op.error,
                        now()
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        self.stats_changed();
        Ok(id)
    }

    async fn get_statistics(&self) -> Result<Statistics, StorageError> {
        // Read before querying, so a snapshot racing a write is filed under
        // the old generation and never served afterwards
        let generation = self.generation.load(Ordering::Acquire);
        if let Some(stats) = self.stats_cache.get(&generation).await {
            return Ok(stats);
        }

        let stats = self
            .with_conn(|conn| {
                let mut stats = conn.query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(status = 'success'), 0),
                            COALESCE(SUM(status = 'partial'), 0),
                            COALESCE(SUM(status = 'failed'), 0)
                     FROM downloads",
                    [],
                    |row| {
                        Ok(Statistics {
                            total_downloads: to_u64(row.get(0)?),
                            successful_downloads: to_u64(row.get(1)?),
                            partial_downloads: to_u64(row.get(2)?),
                            failed_downloads: to_u64(row.get(3)?),
                            ..Statistics::default()
                        })
                    },
                )?;
                conn.query_row(
                    "SELECT
                       COALESCE(SUM(operation = 'download' AND success = 1), 0),
                       COALESCE(SUM(CASE WHEN operation = 'download' AND success = 1 THEN file_size END), 0),
                       COALESCE(SUM(operation = 'upload' AND success = 1), 0),
                       COALESCE(SUM(operation = 'upload' AND success = 0), 0),
                       COALESCE(SUM(CASE WHEN operation = 'upload' AND success = 1 THEN file_size END), 0),
                       COALESCE(SUM(operation = 'upload' AND success = 1 AND method = 'bot_api'), 0),
                       COALESCE(SUM(operation = 'upload' AND success = 1 AND method = 'large_file'), 0)
                     FROM file_operations",
                    [],
                    |row| {
                        stats.files_downloaded = to_u64(row.get(0)?);
                        stats.bytes_downloaded = to_u64(row.get(1)?);
                        stats.successful_uploads = to_u64(row.get(2)?);
                        stats.failed_uploads = to_u64(row.get(3)?);
                        stats.bytes_uploaded = to_u64(row.get(4)?);
                        stats.bot_api_uploads = to_u64(row.get(5)?);
                        stats.large_file_uploads = to_u64(row.get(6)?);
                        Ok(())
                    },
                )?;
                Ok(stats)
            })
            .await?;

        self.stats_cache.insert(generation, stats.clone()).await;
        Ok(stats)
    }

    async fn content_type_stats(&self) -> Result<Vec<ContentTypeCount>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT content_type, COUNT(*) AS n FROM downloads \
                 GROUP BY content_type ORDER BY n DESC, content_type ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ContentTypeCount {
                        content_type: row.get(0)?,
                        count: to_u64(row.get(1)?),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn store_session(&self, session: NewSession) -> Result<i64, StorageError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE instagram_sessions SET is_active = 0 \
                 WHERE user_id = ? AND session_type = ? AND is_active = 1",
                params![session.user_id, session.session_type.as_str()],
            )?;
            tx.execute(
                "INSERT INTO instagram_sessions \
                 (user_id, username, session_type, source, is_active, expires_at, created_at) \
                 VALUES (?, ?, ?, ?, 1, ?, ?)",
                params![
                    session.user_id,
                    session.username,
                    session.session_type.as_str(),
                    session.source,
                    session.expires_at.map(format_ts),
                    now()
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn active_session(
        &self,
        user_id: i64,
        session_type: SessionType,
    ) -> Result<Option<SessionRecord>, StorageError> {
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    &format!(
                        "SELECT {SESSION_COLUMNS} FROM instagram_sessions \
                         WHERE user_id = ? AND session_type = ? AND is_active = 1"
                    ),
                    params![user_id, session_type.as_str()],
                    session_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn list_sessions(&self, user_id: i64) -> Result<Vec<SessionRecord>, StorageError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM instagram_sessions \
                 WHERE user_id = ? ORDER BY id DESC"
            ))?;
            let rows = stmt
                .query_map(params![user_id], session_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn log_session_validation(
        &self,
        session_id: i64,
        is_valid: bool,
        error_message: Option<String>,
    ) -> Result<i64, StorageError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT id FROM instagram_sessions WHERE id = ?",
                    params![session_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(StorageError::NotFound {
                    entity: "session",
                    id: session_id,
                });
            }
            let checked_at = now();
            tx.execute(
                "INSERT INTO session_validations (session_id, is_valid, error_message, checked_at) \
                 VALUES (?, ?, ?, ?)",
                params![session_id, is_valid, error_message, checked_at],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE instagram_sessions SET last_validated = ? WHERE id = ?",
                params![checked_at, session_id],
            )?;
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn recent_validations(
        &self,
        session_id: i64,
        limit: usize,
    ) -> Result<Vec<SessionValidation>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, is_valid, error_message, checked_at \
                 FROM session_validations WHERE session_id = ? ORDER BY id DESC LIMIT ?",
            )?;
            let rows = stmt
                .query_map(params![session_id, limit], |row| {
                    Ok(SessionValidation {
                        id: row.get(0)?,
                        session_id: row.get(1)?,
                        is_valid: row.get(2)?,
                        error_message: row.get(3)?,
                        checked_at: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn cleanup_expired_sessions(&self) -> Result<usize, StorageError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE instagram_sessions SET is_active = 0 \
                 WHERE is_active = 1 AND expires_at IS NOT NULL AND expires_at <= ?",
                params![now()],
            )?;
            Ok(changed)
        })
        .await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::OperationKind;
    use crate::upload::UploadMethod;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().expect("in-memory store")
    }

    fn session(user_id: i64, session_type: SessionType, source: &str) -> NewSession {
        NewSession {
            user_id,
            username: Some("someone".into()),
            session_type,
            source: Some(source.into()),
            expires_at: None,
        }
    }

    fn upload_op(download_id: i64, size: u64, method: UploadMethod, success: bool) -> FileOperation {
        FileOperation {
            download_id: Some(download_id),
            file_path: "downloads/x/a.jpg".into(),
            file_size: size,
            operation: OperationKind::Upload,
            method: success.then_some(method),
            success,
            error: (!success).then(|| "boom".to_string()),
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let store = store();
        let mut conn = store.conn.lock();
        migrate(&mut conn).expect("second migrate");
        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .expect("count");
        assert_eq!(applied, i64::try_from(MIGRATIONS.len()).expect("fits"));
    }

    #[tokio::test]
    async fn snapshot_taken_before_a_write_is_not_served_after_it() {
        let store = store();
        let before = store.get_statistics().await.expect("stats");

        store
            .record_download("https://instagram.com/p/a", "post")
            .await
            .expect("rec");
        // A reader that started before the write files its snapshot late
        store.stats_cache.insert(0, before).await;

        let after = store.get_statistics().await.expect("stats");
        assert_eq!(after.total_downloads, 1);
    }

    #[tokio::test]
    async fn statistics_follow_the_operation_log() {
        let store = store();
        assert_eq!(
            store.get_statistics().await.expect("stats"),
            Statistics::default()
        );

        let ok = store.record_download("https://instagram.com/p/a", "post").await.expect("rec");
        let bad = store.record_download("https://instagram.com/reel/b", "reel").await.expect("rec");
        store
            .finish_download(ok, DownloadStatus::Success, 2, None)
            .await
            .expect("finish");
        store
            .finish_download(bad, DownloadStatus::Failed, 0, Some("login required".into()))
            .await
            .expect("finish");
        store
            .log_file_operation(upload_op(ok, 100, UploadMethod::BotApi, true))
            .await
            .expect("log");
        store
            .log_file_operation(upload_op(ok, 300, UploadMethod::LargeFile, true))
            .await
            .expect("log");
        store
            .log_file_operation(upload_op(ok, 5, UploadMethod::BotApi, false))
            .await
            .expect("log");

        let stats = store.get_statistics().await.expect("stats");
        assert_eq!(stats.total_downloads, 2);
        assert_eq!(stats.successful_downloads, 1);
        assert_eq!(stats.failed_downloads, 1);
        assert_eq!(stats.successful_uploads, 2);
        assert_eq!(stats.failed_uploads, 1);
        assert_eq!(stats.bytes_uploaded, 400);
        assert_eq!(stats.bot_api_uploads, 1);
        assert_eq!(stats.large_file_uploads, 1);

        let kinds = store.content_type_stats().await.expect("kinds");
        assert_eq!(kinds.len(), 2);
        assert_eq!(kinds[0].count, 1);
    }

    #[tokio::test]
    async fn finishing_unknown_download_is_not_found() {
        let store = store();
        let err = store
            .finish_download(999, DownloadStatus::Success, 0, None)
            .await
            .expect_err("missing row");
        assert!(matches!(err, StorageError::NotFound { entity: "download", id: 999 }));
    }

    #[tokio::test]
    async fn only_one_active_session_per_user_and_type() {
        let store = store();
        let first = store
            .store_session(session(7, SessionType::CookiesFile, "old.txt"))
            .await
            .expect("first");
        let second = store
            .store_session(session(7, SessionType::CookiesFile, "new.txt"))
            .await
            .expect("second");
        // Other type and other user are independent
        store
            .store_session(session(7, SessionType::Browser, "firefox"))
            .await
            .expect("browser");
        store
            .store_session(session(8, SessionType::CookiesFile, "other.txt"))
            .await
            .expect("other user");

        let active = store
            .active_session(7, SessionType::CookiesFile)
            .await
            .expect("query")
            .expect("active session");
        assert_eq!(active.id, second);
        assert_eq!(active.source.as_deref(), Some("new.txt"));

        let all = store.list_sessions(7).await.expect("list");
        assert_eq!(all.len(), 3);
        assert!(all.iter().any(|s| s.id == first && !s.is_active));
    }

    #[tokio::test]
    async fn unique_index_rejects_second_active_row() {
        let store = store();
        store
            .store_session(session(1, SessionType::CookiesFile, "a"))
            .await
            .expect("store");
        let conn = store.conn.lock();
        let result = conn.execute(
            "INSERT INTO instagram_sessions (user_id, session_type, is_active, created_at) \
             VALUES (1, 'cookies_file', 1, '2024-01-01 00:00:00')",
            [],
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn validations_require_existing_session() {
        let store = store();
        let err = store
            .log_session_validation(42, true, None)
            .await
            .expect_err("no such session");
        assert!(matches!(err, StorageError::NotFound { entity: "session", .. }));

        // The foreign key holds even for raw inserts
        let raw = store.conn.lock().execute(
            "INSERT INTO session_validations (session_id, is_valid, checked_at) \
             VALUES (42, 1, '2024-01-01 00:00:00')",
            [],
        );
        assert!(raw.is_err());
    }

    #[tokio::test]
    async fn validations_are_recorded_newest_first() {
        let store = store();
        let id = store
            .store_session(session(1, SessionType::CookiesFile, "c.txt"))
            .await
            .expect("store");
        store
            .log_session_validation(id, false, Some("login required".into()))
            .await
            .expect("log");
        store.log_session_validation(id, true, None).await.expect("log");

        let history = store.recent_validations(id, 10).await.expect("history");
        assert_eq!(history.len(), 2);
        assert!(history[0].is_valid);
        assert_eq!(history[1].error_message.as_deref(), Some("login required"));

        let active = store
            .active_session(1, SessionType::CookiesFile)
            .await
            .expect("query")
            .expect("session");
        assert!(active.last_validated.is_some());
    }

    #[tokio::test]
    async fn expired_sessions_are_deactivated() {
        let store = store();
        let mut expired = session(1, SessionType::CookiesFile, "c.txt");
        expired.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        store.store_session(expired).await.expect("store");
        let mut fresh = session(2, SessionType::CookiesFile, "d.txt");
        fresh.expires_at = Some(Utc::now() + chrono::Duration::days(1));
        store.store_session(fresh).await.expect("store");

        assert_eq!(store.cleanup_expired_sessions().await.expect("cleanup"), 1);
        assert!(store
            .active_session(1, SessionType::CookiesFile)
            .await
            .expect("query")
            .is_none());
        assert!(store
            .active_session(2, SessionType::CookiesFile)
            .await
            .expect("query")
            .is_some());
    }

    #[tokio::test]
    async fn database_file_and_parent_are_created() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("bot.db");
        let store = SqliteStore::open(&path).expect("open");
        store.ping().await.expect("ping");
        assert!(path.exists());
    }
}
