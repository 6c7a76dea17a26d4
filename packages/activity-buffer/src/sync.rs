//! 同步客户端
//!
//! 把缓冲区中的增量转换成幂等请求发送到汇总接口，并根据确认结果
//! 推进本地的已同步指针。
//!
//! ## 错误分类
//! - 暂时性错误（网络、超时、5xx、408、429）：缓冲区不变，指数退避重试
//! - 永久性拒绝（其它 4xx）：状态变为 `Degraded`，跳过该日期继续发送
//!   其余日期，本地继续累积，下一次定时刷新成功后恢复
//! - 过期确认：静默丢弃

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use study_analytics::{ApplyDeltaRequest, ApplyDeltaResponse, DailyAggregate};
use thiserror::Error;

use crate::buffer::{AckOutcome, LocalBufferStore, PreparedDelta};
use crate::storage::StorageError;

/// 同一日期在一次刷新中最多发送的次数（重放后立即用新序号补发一次）
const MAX_SENDS_PER_DATE: usize = 2;

// ============================================================
// 错误类型
// ============================================================

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("同步暂时失败: {0}")]
    Transient(String),

    #[error("服务端拒绝请求 ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("本地存储错误: {0}")]
    Storage(String),

    #[error("同步已停止")]
    ShuttingDown,
}

impl SyncError {
    /// 是否应当退避重试
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }
}

impl From<StorageError> for SyncError {
    fn from(e: StorageError) -> Self {
        SyncError::Storage(e.to_string())
    }
}

// ============================================================
// 传输层抽象
// ============================================================

/// 汇总接口的传输层
#[async_trait]
pub trait AggregationTransport: Send + Sync + 'static {
    async fn apply_delta(&self, request: &ApplyDeltaRequest)
        -> Result<ApplyDeltaResponse, SyncError>;
}

// ============================================================
// 同步状态
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// 尚未同步过
    Idle,
    /// 最近一次刷新成功
    Synced,
    /// 暂时性失败，等待退避重试
    Retrying,
    /// 请求被服务端拒绝，暂停同步
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub status: SyncStatus,
    pub last_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// 连续暂时性失败次数，用于计算退避
    pub consecutive_failures: u32,
    /// 服务端返回的今日权威汇总
    pub today: Option<DailyAggregate>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            status: SyncStatus::Idle,
            last_error: None,
            last_synced_at: None,
            consecutive_failures: 0,
            today: None,
        }
    }
}

/// 一次刷新的统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub applied: usize,
    pub replayed: usize,
    pub stale: usize,
    /// 同步完毕后删除的封存缓冲区
    pub discarded: usize,
}

impl FlushReport {
    pub fn is_noop(&self) -> bool {
        self.sent == 0
    }
}

// ============================================================
// SyncClient
// ============================================================

#[derive(Clone)]
pub struct SyncClient {
    store: LocalBufferStore,
    transport: Arc<dyn AggregationTransport>,
    state: Arc<Mutex<SyncState>>,
}

impl SyncClient {
    pub fn new(store: LocalBufferStore, transport: Arc<dyn AggregationTransport>) -> Self {
        Self {
            store,
            transport,
            state: Arc::new(Mutex::new(SyncState::default())),
        }
    }

    pub fn store(&self) -> &LocalBufferStore {
        &self.store
    }

    pub fn state(&self) -> SyncState {
        self.state.lock().clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.state.lock().status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// 发送全部待同步的缓冲区，已封存的日期在前
    ///
    /// 暂时性错误或存储错误立即停止，剩余日期留给下一次刷新；
    /// 某个日期被服务端拒绝时跳过该日期继续发送其余日期，
    /// 刷新结束后以 `Degraded` 状态返回第一个拒绝。
    pub async fn flush(&self) -> Result<FlushReport, SyncError> {
        let mut report = FlushReport::default();
        let mut rejected: Option<SyncError> = None;

        let dates = match self.store.pending_dates() {
            Ok(dates) => dates,
            Err(e) => return Err(self.fail(e.into())),
        };

        for date in dates {
            for _ in 0..MAX_SENDS_PER_DATE {
                let prepared = match self.store.prepare_delta(date) {
                    Ok(Some(prepared)) => prepared,
                    Ok(None) => break,
                    Err(e) => return Err(self.fail(e.into())),
                };

                report.sent += 1;
                let outcome = match self.send(&prepared).await {
                    Ok(outcome) => outcome,
                    Err(e @ SyncError::Rejected { .. }) => {
                        log::warn!("跳过被拒绝的日期, 继续发送其余日期: date={}", date);
                        let e = self.fail(e);
                        if rejected.is_none() {
                            rejected = Some(e);
                        }
                        break;
                    }
                    Err(e) => return Err(self.fail(e)),
                };

                match outcome {
                    AckOutcome::Applied { aggregate, discarded } => {
                        report.applied += 1;
                        if discarded {
                            report.discarded += 1;
                        }
                        self.reconcile(&prepared, aggregate);
                        break;
                    }
                    AckOutcome::Replayed { last_applied_sequence } => {
                        log::warn!(
                            "服务端已应用更高序号, 使用新序号重发: date={}, sent={}, server={}",
                            date,
                            prepared.sequence(),
                            last_applied_sequence
                        );
                        report.replayed += 1;
                    }
                    AckOutcome::Stale => {
                        report.stale += 1;
                        break;
                    }
                }
            }
        }

        match self.store.sweep_sealed() {
            Ok(removed) => report.discarded += removed,
            Err(e) => return Err(self.fail(e.into())),
        }

        if let Some(e) = rejected {
            return Err(e);
        }

        self.succeed(&report);
        Ok(report)
    }

    async fn send(&self, prepared: &PreparedDelta) -> Result<AckOutcome, SyncError> {
        log::debug!(
            "发送增量: date={}, sequence={}, seconds={}, sessions={}",
            prepared.date,
            prepared.sequence(),
            prepared.request.delta_seconds,
            prepared.request.delta_sessions
        );

        let response = self.transport.apply_delta(&prepared.request).await?;
        Ok(self.store.acknowledge(prepared, &response)?)
    }

    /// 用服务端权威汇总核对本地会话增量
    fn reconcile(&self, prepared: &PreparedDelta, aggregate: DailyAggregate) {
        if prepared.request.delta_sessions > 0 {
            log::debug!(
                "会话增量已落地: date={}, sent={}, server_session_count={}",
                prepared.date,
                prepared.request.delta_sessions,
                aggregate.session_count
            );
        }

        if prepared.date == self.store.today() {
            self.state.lock().today = Some(aggregate);
        }
    }

    fn succeed(&self, report: &FlushReport) {
        let mut state = self.state.lock();
        if state.status != SyncStatus::Synced {
            log::info!("同步恢复正常: {:?}", report);
        }
        state.status = SyncStatus::Synced;
        state.last_error = None;
        state.consecutive_failures = 0;
        state.last_synced_at = Some(Utc::now());
    }

    fn fail(&self, error: SyncError) -> SyncError {
        let mut state = self.state.lock();
        match &error {
            SyncError::Transient(_) => {
                state.status = SyncStatus::Retrying;
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                log::warn!(
                    "同步失败, 将退避重试 (第 {} 次): {}",
                    state.consecutive_failures,
                    error
                );
            }
            SyncError::Rejected { .. } => {
                state.status = SyncStatus::Degraded;
                state.consecutive_failures = 0;
                log::error!("同步请求被拒绝, 暂停同步直到下一次定时刷新: {}", error);
            }
            SyncError::Storage(_) => {
                state.status = SyncStatus::Degraded;
                log::error!("本地存储异常, 同步中止: {}", error);
            }
            SyncError::ShuttingDown => {
                log::error!("同步中止: {}", error);
            }
        }
        state.last_error = Some(error.to_string());
        error
    }
}

// ============================================================
// 退避计算
// ============================================================

/// 第 `attempt` 次失败后的退避上限：`min(cap, base * 2^(attempt-1))`
pub fn backoff_ceiling(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(cap)
}

/// 全抖动：在 `[0, ceiling]` 中均匀取值
pub fn full_jitter(ceiling: Duration) -> Duration {
    let max_ms = ceiling.as_millis().min(u64::MAX as u128) as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}
