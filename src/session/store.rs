use crate::session::error::{StorageError, StorageResult};
use crate::session::types::{UploadSession, UploadStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

/// Passive persistence for [`UploadSession`] records, one row per upload id.
///
/// Each write is a single statement, so concurrent `put`/`delete` on the same
/// key are atomic and different keys never contend on an application lock.
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Open (or create) a session store at the given SQLite URL
    pub async fn new(db_url: &str) -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);
        let in_memory = db_url.contains(":memory:");

        // An in-memory database lives only as long as its connections, so
        // keep exactly one open for the lifetime of the pool.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS upload_sessions (
                upload_id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                status TEXT NOT NULL,
                record TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                last_activity INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_upload_sessions_project ON upload_sessions(project_id)",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_upload_sessions_status ON upload_sessions(status)",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_upload_sessions_activity ON upload_sessions(last_activity)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Create session store with in-memory database (for testing)
    pub async fn new_in_memory() -> StorageResult<Self> {
        Self::new("sqlite::memory:").await
    }

    /// Upsert by upload id
    pub async fn put(&self, session: &UploadSession) -> StorageResult<()> {
        let record = serde_json::to_string(session)?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO upload_sessions
            (upload_id, project_id, status, record, started_at, last_activity)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.upload_id)
        .bind(&session.project_id)
        .bind(session.status.as_str())
        .bind(record)
        .bind(session.started_at.timestamp_millis())
        .bind(session.last_activity.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, upload_id: &str) -> StorageResult<Option<UploadSession>> {
        let row = sqlx::query("SELECT upload_id, record FROM upload_sessions WHERE upload_id = ?")
            .bind(upload_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| decode_row(&r)).transpose()
    }

    /// Most recently active session for a project, if any.
    ///
    /// Ties on `last_activity` are broken by upload id so the choice is stable.
    pub async fn find_by_project_id(&self, project_id: &str) -> StorageResult<Option<UploadSession>> {
        let row = sqlx::query(
            r#"
            SELECT upload_id, record FROM upload_sessions
            WHERE project_id = ?
            ORDER BY last_activity DESC, upload_id DESC
            LIMIT 1
            "#,
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| decode_row(&r)).transpose()
    }

    pub async fn list_by_status(&self, status: UploadStatus) -> StorageResult<Vec<UploadSession>> {
        let rows = sqlx::query(
            "SELECT upload_id, record FROM upload_sessions WHERE status = ? ORDER BY last_activity DESC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_row).collect()
    }

    pub async fn list_all(&self) -> StorageResult<Vec<UploadSession>> {
        let rows =
            sqlx::query("SELECT upload_id, record FROM upload_sessions ORDER BY last_activity DESC")
                .fetch_all(&self.pool)
                .await?;

        rows.iter().map(decode_row).collect()
    }

    /// Delete a session; returns whether a record existed
    pub async fn delete(&self, upload_id: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM upload_sessions WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete every session whose last activity predates `now - max_age`,
    /// regardless of status.
    pub async fn reap_older_than(&self, max_age: Duration) -> StorageResult<u64> {
        // An age beyond the representable time range reaps nothing.
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| chrono::Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };
        let cutoff = cutoff.timestamp_millis();

        let result = sqlx::query("DELETE FROM upload_sessions WHERE last_activity < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> StorageResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM upload_sessions")
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("count")?)
    }

    /// Close database connection
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn decode_row(row: &SqliteRow) -> StorageResult<UploadSession> {
    let upload_id: String = row.try_get("upload_id")?;
    let record: String = row.try_get("record")?;
    serde_json::from_str(&record).map_err(|e| StorageError::CorruptRecord {
        upload_id,
        reason: e.to_string(),
    })
}
