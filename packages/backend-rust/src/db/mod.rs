pub mod daily_aggregate;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use study_analytics::DeltaValidationError;

pub use daily_aggregate::LedgerPruneReport;

const SCHEMA_VERSION: &str = "1";

const SCHEMA_SQL: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS "_db_metadata" (
        "key" TEXT PRIMARY KEY,
        "value" TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS "daily_aggregates" (
        "user_id" TEXT NOT NULL,
        "date" TEXT NOT NULL,
        "total_time_spent" INTEGER NOT NULL DEFAULT 0,
        "total_activities" INTEGER NOT NULL DEFAULT 0,
        "questions_attempted" INTEGER NOT NULL DEFAULT 0,
        "questions_correct" INTEGER NOT NULL DEFAULT 0,
        "session_count" INTEGER NOT NULL DEFAULT 0,
        "dashboard_visits" INTEGER NOT NULL DEFAULT 0,
        "ai_tutor_interactions" INTEGER NOT NULL DEFAULT 0,
        "lessons_completed" INTEGER NOT NULL DEFAULT 0,
        "mock_exams_taken" INTEGER NOT NULL DEFAULT 0,
        "average_session_length" INTEGER NOT NULL DEFAULT 0,
        "productivity_score" REAL NOT NULL DEFAULT 0,
        "updated_at" TEXT NOT NULL,
        PRIMARY KEY ("user_id", "date")
    )"#,
    r#"CREATE TABLE IF NOT EXISTS "daily_aggregate_sequences" (
        "user_id" TEXT NOT NULL,
        "date" TEXT NOT NULL,
        "client_id" TEXT NOT NULL,
        "last_sequence" INTEGER NOT NULL,
        "updated_at" TEXT NOT NULL,
        PRIMARY KEY ("user_id", "date", "client_id")
    )"#,
    r#"CREATE INDEX IF NOT EXISTS "idx_daily_aggregate_sequences_updated"
        ON "daily_aggregate_sequences" ("updated_at")"#,
];

/// 服务端日汇总存储，唯一的共享可变资源
#[derive(Clone)]
pub struct AggregateStore {
    pool: SqlitePool,
}

impl AggregateStore {
    pub async fn connect(path: &Path) -> Result<Self, AggregateError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| AggregateError::Io(e.to_string()))?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        tracing::info!(path = %path.display(), "aggregate store ready");
        Ok(store)
    }

    /// 单连接内存库，测试用
    pub async fn in_memory() -> Result<Self, AggregateError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ping(&self) -> Result<(), AggregateError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<(), AggregateError> {
        for statement in SCHEMA_SQL {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        sqlx::query(
            r#"INSERT OR REPLACE INTO "_db_metadata" ("key", "value") VALUES ('schema_version', ?)"#,
        )
        .bind(SCHEMA_VERSION)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error(transparent)]
    Validation(#[from] DeltaValidationError),
    #[error("sequence 超出范围: {0}")]
    SequenceOutOfRange(u64),
    #[error("IO error: {0}")]
    Io(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl AggregateError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::SequenceOutOfRange(_))
    }
}
