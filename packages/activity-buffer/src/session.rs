//! 会话边界判定
//!
//! 每个 (用户, 页面, 日期) 只开启一次会话：页面第一次打开时
//! `pending_sessions` 加一，之后的活动、同步以及同日重启都不会再计数。
//! 超过空闲时限没有 record_time 后再次活动，会清空 `active_pages`，
//! 于是下一次活动重新开启会话。

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::storage::BufferState;

/// 会话状态转换结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionTransition {
    /// 今日首次在该页面活动
    Started,
    /// 空闲之后重新开始
    Resumed,
    /// 沿用已有会话
    Continued,
}

impl SessionTransition {
    pub fn starts_session(&self) -> bool {
        !matches!(self, SessionTransition::Continued)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionTracker {
    idle_timeout: Duration,
}

impl SessionTracker {
    pub fn new(idle_timeout: std::time::Duration) -> Self {
        Self {
            idle_timeout: Duration::from_std(idle_timeout).unwrap_or_else(|_| Duration::weeks(52)),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    fn is_idle(&self, state: &BufferState, now: DateTime<Utc>) -> bool {
        match state.last_active_at {
            Some(last) => now.signed_duration_since(last) > self.idle_timeout,
            None => false,
        }
    }

    /// 页面打开
    pub fn on_page_open(
        &self,
        state: &mut BufferState,
        page_id: &str,
        now: DateTime<Utc>,
    ) -> SessionTransition {
        let idle = self.is_idle(state, now);
        if idle {
            log::debug!("空闲超时后重新打开页面 {}, 清空今日活动页面", page_id);
            state.active_pages.clear();
        }

        state.current_page = Some(page_id.to_string());
        state.last_active_at = Some(now);

        if !state.active_pages.insert(page_id.to_string()) {
            return SessionTransition::Continued;
        }

        state.pending_sessions = state.pending_sessions.saturating_add(1);
        if idle {
            SessionTransition::Resumed
        } else {
            SessionTransition::Started
        }
    }

    /// 记录学习时长时调用
    ///
    /// 空闲之后的第一次 record_time 会在最近打开的页面上重新开启会话。
    pub fn on_activity(&self, state: &mut BufferState, now: DateTime<Utc>) -> SessionTransition {
        let idle = self.is_idle(state, now);
        state.last_active_at = Some(now);

        if !idle {
            return SessionTransition::Continued;
        }

        state.active_pages.clear();
        match state.current_page.clone() {
            Some(page) => {
                log::debug!("空闲后恢复活动, 在页面 {} 上开启新会话", page);
                state.active_pages.insert(page);
                state.pending_sessions = state.pending_sessions.saturating_add(1);
                SessionTransition::Resumed
            }
            None => SessionTransition::Continued,
        }
    }
}
