//! 缓冲区仓储
//!
//! 提供 buffer_state 表的数据库操作。`&Connection` 级别的函数
//! 可以在调用方的事务中组合使用。

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use study_analytics::format_day_key;

use crate::storage::models::BufferState;
use crate::storage::{StorageError, StorageResult};

/// 缓冲区仓储
pub struct BufferRepository {
    conn: Arc<Mutex<Connection>>,
}

impl BufferRepository {
    /// 创建新的仓储实例
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_connection(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StorageError::LockError(e.to_string()))
    }

    // ========== 基本操作 ==========

    /// 获取指定日期的缓冲区
    pub fn get(&self, user_id: &str, date: NaiveDate) -> StorageResult<Option<BufferState>> {
        let conn = self.get_connection()?;
        load(&conn, user_id, date)
    }

    /// 获取用户的全部缓冲区（按日期升序）
    pub fn list_for_user(&self, user_id: &str) -> StorageResult<Vec<BufferState>> {
        let conn = self.get_connection()?;
        list_for_user(&conn, user_id)
    }

    /// 获取已封存的缓冲区（按日期升序）
    pub fn list_sealed(&self, user_id: &str) -> StorageResult<Vec<BufferState>> {
        let conn = self.get_connection()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM buffer_state
            WHERE user_id = ?1 AND sealed = 1
            ORDER BY date ASC
            "#,
        )?;

        let states = stmt
            .query_map(params![user_id], BufferState::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(states)
    }
}

// ========== 事务内可用的函数 ==========

/// 读取单个缓冲区
pub fn load(conn: &Connection, user_id: &str, date: NaiveDate) -> StorageResult<Option<BufferState>> {
    let state = conn
        .query_row(
            "SELECT * FROM buffer_state WHERE user_id = ?1 AND date = ?2",
            params![user_id, format_day_key(date)],
            BufferState::from_row,
        )
        .optional()?;

    Ok(state)
}

/// 读取用户的全部缓冲区
pub fn list_for_user(conn: &Connection, user_id: &str) -> StorageResult<Vec<BufferState>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT * FROM buffer_state
        WHERE user_id = ?1
        ORDER BY date ASC
        "#,
    )?;

    let states = stmt
        .query_map(params![user_id], BufferState::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(states)
}

/// 封存早于 `today` 的缓冲区，返回本次新封存的日期
pub fn seal_before(conn: &Connection, user_id: &str, today: NaiveDate) -> StorageResult<Vec<NaiveDate>> {
    let today_key = format_day_key(today);

    let mut stmt = conn.prepare(
        r#"
        SELECT * FROM buffer_state
        WHERE user_id = ?1 AND date < ?2 AND sealed = 0
        ORDER BY date ASC
        "#,
    )?;
    let dates: Vec<NaiveDate> = stmt
        .query_map(params![user_id, today_key], BufferState::from_row)?
        .map(|r| r.map(|state| state.date))
        .collect::<Result<Vec<_>, _>>()?;

    if !dates.is_empty() {
        conn.execute(
            r#"
            UPDATE buffer_state
            SET sealed = 1, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            WHERE user_id = ?1 AND date < ?2 AND sealed = 0
            "#,
            params![user_id, today_key],
        )?;
    }

    Ok(dates)
}

/// 删除单个缓冲区
pub fn delete(conn: &Connection, user_id: &str, date: NaiveDate) -> StorageResult<bool> {
    let affected = conn.execute(
        "DELETE FROM buffer_state WHERE user_id = ?1 AND date = ?2",
        params![user_id, format_day_key(date)],
    )?;

    Ok(affected > 0)
}
