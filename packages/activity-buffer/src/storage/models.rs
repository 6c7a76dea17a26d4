//! 数据模型定义
//!
//! 缓冲区状态、缓冲区健康度以及与数据库交互的方法。

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Result as SqliteResult, Row};
use serde::{Deserialize, Serialize};
use study_analytics::{format_day_key, parse_day_key, ActivityCounts};

use crate::storage::StorageResult;

// ============================================================
// BufferState - 每用户每日缓冲区
// ============================================================

/// 每用户每日的未同步活动缓冲区
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferState {
    /// 用户 ID
    pub user_id: String,
    /// 本地日期
    pub date: NaiveDate,
    /// 已记录的学习秒数（单调不减）
    pub elapsed_seconds: u64,
    /// 服务端已确认的秒数
    pub synced_seconds: u64,
    /// 最近一次发送使用的序号（幂等令牌）
    pub pending_sequence: u64,
    /// 今日已开启会话的页面
    pub active_pages: BTreeSet<String>,
    /// 未同步的活动计数
    pub pending_counts: ActivityCounts,
    /// 未同步的会话数
    pub pending_sessions: u32,
    /// 最近一次活动时间，用于空闲判定
    pub last_active_at: Option<DateTime<Utc>>,
    /// 最近打开的页面
    pub current_page: Option<String>,
    /// 日期已翻篇，只等最后一次同步
    pub sealed: bool,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 更新时间
    pub updated_at: DateTime<Utc>,
}

impl BufferState {
    /// 创建空缓冲区
    pub fn new(user_id: &str, date: NaiveDate, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            date,
            elapsed_seconds: 0,
            synced_seconds: 0,
            pending_sequence: 0,
            active_pages: BTreeSet::new(),
            pending_counts: ActivityCounts::new(),
            pending_sessions: 0,
            last_active_at: None,
            current_page: None,
            sealed: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// 未同步秒数
    pub fn unsynced_seconds(&self) -> u64 {
        self.elapsed_seconds.saturating_sub(self.synced_seconds)
    }

    /// 是否还有需要发送的内容
    pub fn has_unsynced(&self) -> bool {
        self.unsynced_seconds() > 0 || !self.pending_counts.is_empty() || self.pending_sessions > 0
    }

    pub fn day_key(&self) -> String {
        format_day_key(self.date)
    }

    /// 从数据库行解析
    pub fn from_row(row: &Row) -> SqliteResult<Self> {
        let date_raw: String = row.get("date")?;
        let date = parse_day_key(&date_raw).map_err(|e| conversion_error(1, e))?;

        let counts_raw: String = row.get("pending_counts")?;
        let pending_counts: ActivityCounts =
            serde_json::from_str(&counts_raw).map_err(|e| conversion_error(5, e))?;

        let pages_raw: String = row.get("active_pages")?;
        let active_pages: BTreeSet<String> =
            serde_json::from_str(&pages_raw).map_err(|e| conversion_error(6, e))?;

        Ok(Self {
            user_id: row.get("user_id")?,
            date,
            elapsed_seconds: row.get::<_, i64>("elapsed_seconds")?.max(0) as u64,
            synced_seconds: row.get::<_, i64>("synced_seconds")?.max(0) as u64,
            pending_sequence: row.get::<_, i64>("pending_sequence")?.max(0) as u64,
            active_pages,
            pending_counts,
            pending_sessions: row.get::<_, i64>("pending_sessions")?.max(0) as u32,
            last_active_at: row
                .get::<_, Option<String>>("last_active_at")?
                .and_then(parse_datetime),
            current_page: row.get("current_page")?,
            sealed: row.get::<_, i32>("sealed")? != 0,
            created_at: parse_datetime(row.get::<_, String>("created_at")?).unwrap_or_else(Utc::now),
            updated_at: parse_datetime(row.get::<_, String>("updated_at")?).unwrap_or_else(Utc::now),
        })
    }

    /// 插入或整行更新到数据库
    pub fn upsert(&self, conn: &Connection) -> StorageResult<()> {
        let counts = serde_json::to_string(&self.pending_counts)
            .map_err(|e| crate::storage::StorageError::Serialization(e.to_string()))?;
        let pages = serde_json::to_string(&self.active_pages)
            .map_err(|e| crate::storage::StorageError::Serialization(e.to_string()))?;

        conn.execute(
            r#"
            INSERT INTO buffer_state (
                user_id, date, elapsed_seconds, synced_seconds, pending_sequence,
                pending_counts, active_pages, pending_sessions, last_active_at,
                current_page, sealed, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13
            )
            ON CONFLICT(user_id, date) DO UPDATE SET
                elapsed_seconds = excluded.elapsed_seconds,
                synced_seconds = excluded.synced_seconds,
                pending_sequence = excluded.pending_sequence,
                pending_counts = excluded.pending_counts,
                active_pages = excluded.active_pages,
                pending_sessions = excluded.pending_sessions,
                last_active_at = excluded.last_active_at,
                current_page = excluded.current_page,
                sealed = excluded.sealed,
                updated_at = excluded.updated_at
            "#,
            params![
                self.user_id,
                self.day_key(),
                self.elapsed_seconds as i64,
                self.synced_seconds as i64,
                self.pending_sequence as i64,
                counts,
                pages,
                self.pending_sessions as i64,
                self.last_active_at.map(format_datetime),
                self.current_page,
                self.sealed as i32,
                format_datetime(self.created_at),
                format_datetime(self.updated_at),
            ],
        )?;

        Ok(())
    }
}

// ============================================================
// BufferHealth - 缓冲区健康度
// ============================================================

/// 缓冲区健康度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferHealth {
    Good,
    Warning,
    Critical,
}

/// 健康度阈值（秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    /// 低于此值为 good
    pub warning_secs: u64,
    /// 低于此值为 warning，否则 critical
    pub critical_secs: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            warning_secs: 30,
            critical_secs: 120,
        }
    }
}

impl HealthThresholds {
    pub fn classify(&self, unsynced_seconds: u64) -> BufferHealth {
        if unsynced_seconds < self.warning_secs {
            BufferHealth::Good
        } else if unsynced_seconds < self.critical_secs {
            BufferHealth::Warning
        } else {
            BufferHealth::Critical
        }
    }
}

// ============================================================
// BufferSnapshot - 供 UI 读取的只读快照
// ============================================================

/// 缓冲区只读快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferSnapshot {
    /// 今日日期
    pub date: NaiveDate,
    /// 今日已记录秒数
    pub elapsed_seconds: u64,
    /// 今日已确认秒数
    pub synced_seconds: u64,
    /// 今日未同步秒数
    pub unsynced_seconds: u64,
    /// 之前日期尚未送达的秒数
    pub sealed_unsynced_seconds: u64,
    /// 今日未同步活动计数
    pub pending_counts: ActivityCounts,
    /// 今日未同步会话数
    pub pending_sessions: u32,
    /// 健康度（按全部未同步秒数计算）
    pub buffer_health: BufferHealth,
}

// ============================================================
// 辅助函数
// ============================================================

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

/// 解析日期时间字符串
fn parse_datetime(s: String) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }

    None
}

/// 格式化日期时间为字符串
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::run_migrations;
    use study_analytics::ActivityKind;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
    }

    #[test]
    fn test_health_classification() {
        let thresholds = HealthThresholds::default();
        assert_eq!(thresholds.classify(0), BufferHealth::Good);
        assert_eq!(thresholds.classify(29), BufferHealth::Good);
        assert_eq!(thresholds.classify(30), BufferHealth::Warning);
        assert_eq!(thresholds.classify(119), BufferHealth::Warning);
        assert_eq!(thresholds.classify(120), BufferHealth::Critical);
    }

    #[test]
    fn test_unsynced_and_pending_flags() {
        let mut state = BufferState::new("user-1", day(), Utc::now());
        assert!(!state.has_unsynced());

        state.elapsed_seconds = 50;
        state.synced_seconds = 20;
        assert_eq!(state.unsynced_seconds(), 30);
        assert!(state.has_unsynced());

        state.synced_seconds = 50;
        assert!(!state.has_unsynced());
        state.pending_sessions = 1;
        assert!(state.has_unsynced());
    }

    #[test]
    fn test_row_round_trip() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let mut state = BufferState::new("user-1", day(), Utc::now());
        state.elapsed_seconds = 45;
        state.pending_sequence = 3;
        state.active_pages.insert("ai-tutor".to_string());
        state.pending_counts.add(ActivityKind::AiInteraction, 2);
        state.pending_sessions = 1;
        state.last_active_at = Some(Utc::now());
        state.current_page = Some("ai-tutor".to_string());
        state.upsert(&conn).unwrap();

        let loaded = conn
            .query_row(
                "SELECT * FROM buffer_state WHERE user_id = ?1 AND date = ?2",
                params!["user-1", "2026-03-14"],
                |row| BufferState::from_row(row),
            )
            .unwrap();

        assert_eq!(loaded.elapsed_seconds, 45);
        assert_eq!(loaded.pending_sequence, 3);
        assert!(loaded.active_pages.contains("ai-tutor"));
        assert_eq!(loaded.pending_counts.get(ActivityKind::AiInteraction), 2);
        assert_eq!(loaded.pending_sessions, 1);
        assert_eq!(loaded.current_page.as_deref(), Some("ai-tutor"));
        assert!(loaded.last_active_at.is_some());
        assert!(!loaded.sealed);
    }
}
