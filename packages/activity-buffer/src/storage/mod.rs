//! SQLite 本地缓冲存储模块
//!
//! 提供学习活动缓冲区的本地持久化，支持：
//! - 按 (用户, 日期) 存储未同步的学习时长与活动计数
//! - 进程重启（页面刷新）后恢复缓冲区
//! - 客户端标识与同步元数据

// ============================================================
// 子模块声明
// ============================================================

pub mod buffer_repo;
pub mod migrations;
pub mod models;

// ============================================================
// 重新导出主要类型
// ============================================================

pub use buffer_repo::BufferRepository;
pub use migrations::run_migrations;
pub use models::*;

// ============================================================
// 依赖导入
// ============================================================

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

// ============================================================
// 错误类型定义
// ============================================================

/// 存储模块错误类型
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("迁移错误: {0}")]
    Migration(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("锁获取失败: {0}")]
    LockError(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// 客户端标识在 sync_metadata 中的键名
const CLIENT_ID_KEY: &str = "client_id";

// ============================================================
// Database - 数据库连接管理器
// ============================================================

/// 数据库连接管理器
///
/// 可克隆，所有克隆共享同一个连接。连接只在同步代码段中持有，
/// 不会跨越 await。
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    db_path: String,
}

impl Database {
    /// 打开（或创建）数据库文件
    ///
    /// 自动启用 WAL 模式并运行数据库迁移。
    ///
    /// # Example
    /// ```ignore
    /// let db = Database::open("./data/activity.db")?;
    /// ```
    pub fn open<P: AsRef<Path>>(db_path: P) -> StorageResult<Self> {
        let path_str = db_path.as_ref().to_string_lossy().to_string();

        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Migration(format!("创建数据目录失败: {}", e)))?;
            }
        }

        let connection = Connection::open(&db_path)?;

        // 启用 WAL 模式以提高并发性能
        connection.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )?;

        Self::initialize(connection, path_str)
    }

    /// 创建内存数据库（用于测试）
    pub fn in_memory() -> StorageResult<Self> {
        let connection = Connection::open_in_memory()?;
        connection.execute_batch("PRAGMA foreign_keys=ON;")?;

        Self::initialize(connection, ":memory:".to_string())
    }

    fn initialize(connection: Connection, db_path: String) -> StorageResult<Self> {
        migrations::run_migrations(&connection)?;

        let db = Self {
            conn: Arc::new(Mutex::new(connection)),
            db_path,
        };

        // 首次打开时生成客户端标识
        db.client_id()?;

        Ok(db)
    }

    /// 获取数据库路径
    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    /// 获取数据库连接的锁
    pub fn get_connection(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StorageError::LockError(e.to_string()))
    }

    /// 获取缓冲区仓储
    pub fn buffers(&self) -> BufferRepository {
        BufferRepository::new(Arc::clone(&self.conn))
    }

    /// 执行事务
    ///
    /// # Example
    /// ```ignore
    /// let result = db.transaction(|conn| {
    ///     conn.execute("INSERT INTO ...", [])?;
    ///     Ok(42)
    /// })?;
    /// ```
    pub fn transaction<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Connection) -> StorageResult<T>,
    {
        let mut conn = self.get_connection()?;

        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;

        Ok(result)
    }

    /// 获取本安装的客户端标识
    ///
    /// 服务端按 (用户, 日期, 客户端) 记录已应用的序号，
    /// 因此标识必须在重启后保持不变。不存在时生成 UUID v4。
    pub fn client_id(&self) -> StorageResult<String> {
        let conn = self.get_connection()?;

        conn.execute(
            "INSERT OR IGNORE INTO sync_metadata (key, value, updated_at) VALUES (?1, ?2, datetime('now'))",
            [CLIENT_ID_KEY, &uuid::Uuid::new_v4().to_string()],
        )?;

        let id: String = conn.query_row(
            "SELECT value FROM sync_metadata WHERE key = ?1",
            [CLIENT_ID_KEY],
            |row| row.get(0),
        )?;

        Ok(id)
    }
}

// ============================================================
// 测试
// ============================================================
