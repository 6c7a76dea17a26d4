//! 本地缓冲区
//!
//! 每个 (用户, 日期) 一行，持久化未同步的学习秒数、活动计数与会话数。
//! 所有写操作都在单个 SQLite 事务中完成读-改-写，连接只在同步代码段中
//! 持有，记录接口从不等待网络。
//!
//! 日期翻篇时旧缓冲区被封存，等待最后一次同步成功后删除；新的一天
//! 从空缓冲区开始，会话与活动页面不会延续。

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use serde::Serialize;
use study_analytics::{
    format_day_key, ActivityKind, ApplyDeltaRequest, ApplyDeltaResponse, DailyAggregate,
    MAX_DELTA_SECONDS,
};

use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::session::{SessionTracker, SessionTransition};
use crate::storage::buffer_repo;
use crate::storage::{
    BufferHealth, BufferSnapshot, BufferState, Database, HealthThresholds, StorageResult,
};

// ============================================================
// 操作结果
// ============================================================

/// 被拒绝的时长增量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "reason", content = "seconds")]
pub enum TimeRejection {
    /// 零或负数
    NonPositive(i64),
    /// 超过单次上限
    TooLarge(i64),
    /// 当日累计已达上限
    DayLimitReached(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TimeRecord {
    Accepted {
        seconds: u64,
        session: SessionTransition,
    },
    Rejected(TimeRejection),
}

impl TimeRecord {
    pub fn is_accepted(&self) -> bool {
        matches!(self, TimeRecord::Accepted { .. })
    }
}

/// 一次记录操作的结果
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded<T> {
    pub outcome: T,
    /// 本次操作触发日期翻篇而新封存的日期
    pub sealed: Vec<NaiveDate>,
    /// 操作后全部未同步秒数对应的健康度
    pub health: BufferHealth,
}

impl<T> Recorded<T> {
    pub fn rolled_over(&self) -> bool {
        !self.sealed.is_empty()
    }
}

/// 已分配序号、等待发送的增量
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedDelta {
    pub date: NaiveDate,
    pub request: ApplyDeltaRequest,
}

impl PreparedDelta {
    pub fn sequence(&self) -> u64 {
        self.request.sequence
    }
}

/// 服务端确认的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// 增量已落地，本地已扣减
    Applied {
        aggregate: DailyAggregate,
        /// 已封存的缓冲区同步完毕并被删除
        discarded: bool,
    },
    /// 服务端已见过该序号，增量保持待发送
    Replayed { last_applied_sequence: u64 },
    /// 确认与当前缓冲区不匹配，丢弃
    Stale,
}

// ============================================================
// LocalBufferStore
// ============================================================

/// 本地缓冲区存储
///
/// 可克隆，所有克隆共享同一个数据库连接。
#[derive(Clone)]
pub struct LocalBufferStore {
    db: Database,
    user_id: String,
    client_id: String,
    clock: Arc<dyn Clock>,
    sessions: SessionTracker,
    thresholds: HealthThresholds,
    max_tick_secs: u64,
}

impl LocalBufferStore {
    pub fn new(
        db: Database,
        user_id: impl Into<String>,
        clock: Arc<dyn Clock>,
        config: &TrackerConfig,
    ) -> StorageResult<Self> {
        let client_id = db.client_id()?;

        Ok(Self {
            db,
            user_id: user_id.into(),
            client_id,
            clock,
            sessions: SessionTracker::new(config.idle_timeout),
            thresholds: config.thresholds(),
            max_tick_secs: config.max_tick_secs,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    // ========== 记录接口 ==========

    /// 记录学习时长
    ///
    /// 零、负数以及超过单次上限的增量被丢弃并记录日志，不作为错误返回。
    /// 当日累计时长不超过 `MAX_DELTA_SECONDS`，超出部分被截断。
    pub fn record_time(&self, seconds: i64) -> StorageResult<Recorded<TimeRecord>> {
        let rejection = if seconds <= 0 {
            Some(TimeRejection::NonPositive(seconds))
        } else if seconds as u64 > self.max_tick_secs {
            Some(TimeRejection::TooLarge(seconds))
        } else {
            None
        };

        let sessions = self.sessions;
        let recorded = self.with_today(move |state, now| {
            if let Some(rejection) = rejection {
                return TimeRecord::Rejected(rejection);
            }

            let room = MAX_DELTA_SECONDS.saturating_sub(state.elapsed_seconds);
            if room == 0 {
                return TimeRecord::Rejected(TimeRejection::DayLimitReached(seconds));
            }

            let accepted = (seconds as u64).min(room);
            let session = sessions.on_activity(state, now);
            state.elapsed_seconds += accepted;
            TimeRecord::Accepted {
                seconds: accepted,
                session,
            }
        })?;

        match recorded.outcome {
            TimeRecord::Rejected(rejection) => log::warn!(
                "丢弃异常学习时长增量: user={}, seconds={}, reason={:?}",
                self.user_id,
                seconds,
                rejection
            ),
            TimeRecord::Accepted { seconds: accepted, .. } if accepted < seconds as u64 => {
                log::warn!(
                    "当日学习时长已达上限, 截断增量: user={}, seconds={}, accepted={}",
                    self.user_id,
                    seconds,
                    accepted
                )
            }
            TimeRecord::Accepted { .. } => {}
        }

        Ok(recorded)
    }

    /// 记录活动计数
    pub fn record_activity(&self, kind: ActivityKind, count: u32) -> StorageResult<Recorded<u32>> {
        self.with_today(move |state, _| {
            state.pending_counts.add(kind, count);
            state.pending_counts.get(kind)
        })
    }

    /// 打开页面，由会话追踪器决定是否开启新会话
    pub fn open_page(&self, page_id: &str) -> StorageResult<Recorded<SessionTransition>> {
        let sessions = self.sessions;
        let transition = self.with_today(|state, now| sessions.on_page_open(state, page_id, now))?;

        if transition.outcome.starts_session() {
            log::info!(
                "开启学习会话: user={}, page={}, transition={:?}",
                self.user_id,
                page_id,
                transition.outcome
            );
        }

        Ok(transition)
    }

    /// 检查日期翻篇，返回新封存的日期
    pub fn roll_over(&self) -> StorageResult<Vec<NaiveDate>> {
        let today = self.clock.today();
        let sealed = self
            .db
            .transaction(|conn| buffer_repo::seal_before(conn, &self.user_id, today))?;
        self.log_sealed(&sealed);
        Ok(sealed)
    }

    // ========== 只读接口 ==========

    /// 今日缓冲区快照
    pub fn snapshot(&self) -> StorageResult<BufferSnapshot> {
        let today = self.clock.today();
        let buffers = self.db.buffers().list_for_user(&self.user_id)?;

        let mut snapshot = BufferSnapshot {
            date: today,
            elapsed_seconds: 0,
            synced_seconds: 0,
            unsynced_seconds: 0,
            sealed_unsynced_seconds: 0,
            pending_counts: Default::default(),
            pending_sessions: 0,
            buffer_health: BufferHealth::Good,
        };

        for state in buffers {
            if state.date == today {
                snapshot.elapsed_seconds = state.elapsed_seconds;
                snapshot.synced_seconds = state.synced_seconds;
                snapshot.unsynced_seconds = state.unsynced_seconds();
                snapshot.pending_counts = state.pending_counts;
                snapshot.pending_sessions = state.pending_sessions;
            } else {
                snapshot.sealed_unsynced_seconds += state.unsynced_seconds();
            }
        }

        snapshot.buffer_health = self
            .thresholds
            .classify(snapshot.unsynced_seconds + snapshot.sealed_unsynced_seconds);

        Ok(snapshot)
    }

    /// 指定日期的缓冲区
    pub fn buffer(&self, date: NaiveDate) -> StorageResult<Option<BufferState>> {
        self.db.buffers().get(&self.user_id, date)
    }

    /// 有待发送内容的日期，早的日期（已封存）在前
    pub fn pending_dates(&self) -> StorageResult<Vec<NaiveDate>> {
        Ok(self
            .pending_buffers()?
            .into_iter()
            .map(|state| state.date)
            .collect())
    }

    /// 有待发送内容的缓冲区
    pub fn pending_buffers(&self) -> StorageResult<Vec<BufferState>> {
        let mut buffers: Vec<BufferState> = self
            .db
            .buffers()
            .list_for_user(&self.user_id)?
            .into_iter()
            .filter(BufferState::has_unsynced)
            .collect();
        buffers.sort_by_key(|state| (!state.sealed, state.date));
        Ok(buffers)
    }

    // ========== 同步接口 ==========

    /// 为指定日期分配新序号并构造增量请求
    ///
    /// 序号在发送前持久化。没有待发送内容时返回 `None`，
    /// 已封存且已清空的缓冲区顺带删除。超过单次上限的时长分多次发送。
    pub fn prepare_delta(&self, date: NaiveDate) -> StorageResult<Option<PreparedDelta>> {
        let now = self.clock.now();

        self.db.transaction(|conn| {
            let Some(mut state) = buffer_repo::load(conn, &self.user_id, date)? else {
                return Ok(None);
            };

            if !state.has_unsynced() {
                if state.sealed {
                    buffer_repo::delete(conn, &self.user_id, date)?;
                    log::debug!("删除已同步完毕的封存缓冲区: date={}", date);
                }
                return Ok(None);
            }

            state.pending_sequence += 1;
            state.updated_at = now;
            state.upsert(conn)?;

            let request = ApplyDeltaRequest {
                user_id: self.user_id.clone(),
                client_id: self.client_id.clone(),
                date: format_day_key(date),
                sequence: state.pending_sequence,
                delta_seconds: state.unsynced_seconds().min(MAX_DELTA_SECONDS),
                delta_counts: state.pending_counts.clone(),
                delta_sessions: state.pending_sessions,
            };

            Ok(Some(PreparedDelta { date, request }))
        })
    }

    /// 处理服务端确认
    ///
    /// 只扣减本次发送的部分，发送期间新记录的活动保持待发送。
    pub fn acknowledge(
        &self,
        prepared: &PreparedDelta,
        response: &ApplyDeltaResponse,
    ) -> StorageResult<AckOutcome> {
        let now = self.clock.now();

        self.db.transaction(|conn| {
            let Some(mut state) = buffer_repo::load(conn, &self.user_id, prepared.date)? else {
                return Ok(AckOutcome::Stale);
            };

            if response.sequence != prepared.sequence()
                || state.pending_sequence != prepared.sequence()
            {
                log::debug!(
                    "丢弃过期确认: date={}, sent={}, echoed={}, current={}",
                    prepared.date,
                    prepared.sequence(),
                    response.sequence,
                    state.pending_sequence
                );
                return Ok(AckOutcome::Stale);
            }

            if !response.applied {
                state.pending_sequence = state.pending_sequence.max(response.last_applied_sequence);
                state.updated_at = now;
                state.upsert(conn)?;
                return Ok(AckOutcome::Replayed {
                    last_applied_sequence: response.last_applied_sequence,
                });
            }

            let request = &prepared.request;
            state.synced_seconds = state
                .synced_seconds
                .saturating_add(request.delta_seconds)
                .min(state.elapsed_seconds);
            state.pending_counts.subtract(&request.delta_counts);
            state.pending_sessions = state.pending_sessions.saturating_sub(request.delta_sessions);
            state.updated_at = now;

            let discarded = state.sealed && !state.has_unsynced();
            if discarded {
                buffer_repo::delete(conn, &self.user_id, prepared.date)?;
            } else {
                state.upsert(conn)?;
            }

            Ok(AckOutcome::Applied {
                aggregate: response.aggregate.clone(),
                discarded,
            })
        })
    }

    /// 删除已封存且无待发送内容的缓冲区
    pub fn discard_if_flushed(&self, date: NaiveDate) -> StorageResult<bool> {
        self.db.transaction(|conn| {
            match buffer_repo::load(conn, &self.user_id, date)? {
                Some(state) if state.sealed && !state.has_unsynced() => {
                    buffer_repo::delete(conn, &self.user_id, date)
                }
                _ => Ok(false),
            }
        })
    }

    /// 清理所有已同步完毕的封存缓冲区，返回删除数量
    pub fn sweep_sealed(&self) -> StorageResult<usize> {
        let mut removed = 0;
        for state in self.db.buffers().list_sealed(&self.user_id)? {
            if self.discard_if_flushed(state.date)? {
                log::debug!("删除已同步完毕的封存缓冲区: date={}", state.date);
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ========== 内部辅助 ==========

    /// 在事务中对今日缓冲区执行读-改-写
    fn with_today<T, F>(&self, f: F) -> StorageResult<Recorded<T>>
    where
        F: FnOnce(&mut BufferState, DateTime<Utc>) -> T,
    {
        let now = self.clock.now();
        let today = self.clock.today();

        let (outcome, sealed, unsynced) = self.db.transaction(|conn| {
            let sealed = buffer_repo::seal_before(conn, &self.user_id, today)?;

            let mut state = buffer_repo::load(conn, &self.user_id, today)?
                .unwrap_or_else(|| BufferState::new(&self.user_id, today, now));
            if state.sealed {
                // 时钟回拨到已封存的日期
                log::warn!("时钟回拨, 重新打开已封存的缓冲区: date={}", today);
                state.sealed = false;
            }

            let outcome = f(&mut state, now);
            state.updated_at = now;
            state.upsert(conn)?;

            let unsynced = total_unsynced(conn, &self.user_id)?;
            Ok((outcome, sealed, unsynced))
        })?;

        self.log_sealed(&sealed);

        Ok(Recorded {
            outcome,
            sealed,
            health: self.thresholds.classify(unsynced),
        })
    }

    fn log_sealed(&self, sealed: &[NaiveDate]) {
        for date in sealed {
            log::info!("日期翻篇, 封存缓冲区: user={}, date={}", self.user_id, date);
        }
    }
}

fn total_unsynced(conn: &Connection, user_id: &str) -> StorageResult<u64> {
    Ok(buffer_repo::list_for_user(conn, user_id)?
        .iter()
        .map(BufferState::unsynced_seconds)
        .sum())
}
