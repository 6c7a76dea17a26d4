//! 学习活动追踪器
//!
//! UI 层的唯一入口：记录时长、活动与页面打开，读取缓冲区快照，
//! 并把页面隐藏、卸载前、critical 阈值与日期翻篇转换成刷新触发。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use study_analytics::ActivityKind;

use crate::buffer::{LocalBufferStore, Recorded, TimeRecord};
use crate::clock::{Clock, SystemClock};
use crate::config::TrackerConfig;
use crate::scheduler::{FlushScheduler, FlushTrigger};
use crate::session::SessionTransition;
use crate::storage::{BufferHealth, BufferSnapshot, Database, StorageResult};
use crate::sync::{AggregationTransport, FlushReport, SyncClient, SyncError, SyncState};
use crate::transport::HttpTransport;

/// UI 读取的追踪器快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerSnapshot {
    pub buffer: BufferSnapshot,
    pub sync: SyncState,
}

pub struct ActivityTracker {
    store: LocalBufferStore,
    client: SyncClient,
    scheduler: FlushScheduler,
    critical: AtomicBool,
}

impl ActivityTracker {
    /// 使用系统时钟与 HTTP 传输层启动，必须在 tokio 运行时内调用
    pub fn start(
        db: Database,
        user_id: impl Into<String>,
        config: &TrackerConfig,
    ) -> Result<Self, SyncError> {
        let transport = Arc::new(HttpTransport::new(config)?);
        Self::with_parts(db, user_id, Arc::new(SystemClock), transport, config)
            .map_err(Into::into)
    }

    pub fn with_parts(
        db: Database,
        user_id: impl Into<String>,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn AggregationTransport>,
        config: &TrackerConfig,
    ) -> StorageResult<Self> {
        let store = LocalBufferStore::new(db, user_id, clock, config)?;
        let client = SyncClient::new(store.clone(), transport);
        let scheduler = FlushScheduler::spawn(client.clone(), config);

        let tracker = Self {
            store,
            client,
            scheduler,
            critical: AtomicBool::new(false),
        };
        tracker.resume()?;

        Ok(tracker)
    }

    /// 上一次运行留下的未同步数据立即安排发送
    fn resume(&self) -> StorageResult<()> {
        let sealed = self.store.roll_over()?;
        let pending = self.store.pending_dates()?;

        if !pending.is_empty() {
            log::info!(
                "发现 {} 个待同步的缓冲区 (新封存 {} 个), 安排刷新",
                pending.len(),
                sealed.len()
            );
            self.scheduler.trigger(FlushTrigger::DayRollover);
        }

        Ok(())
    }

    pub fn store(&self) -> &LocalBufferStore {
        &self.store
    }

    // ========== 记录接口 ==========

    pub fn record_time(&self, seconds: i64) -> StorageResult<TimeRecord> {
        let recorded = self.store.record_time(seconds)?;
        self.after_record(&recorded);
        Ok(recorded.outcome)
    }

    pub fn record_activity(&self, kind: ActivityKind, count: u32) -> StorageResult<u32> {
        let recorded = self.store.record_activity(kind, count)?;
        self.after_record(&recorded);
        Ok(recorded.outcome)
    }

    pub fn open_page(&self, page_id: &str) -> StorageResult<SessionTransition> {
        let recorded = self.store.open_page(page_id)?;
        self.after_record(&recorded);
        Ok(recorded.outcome)
    }

    // ========== 刷新触发 ==========

    pub fn page_hidden(&self) {
        self.scheduler.trigger(FlushTrigger::PageHidden);
    }

    /// 卸载前尽力刷新，不等待结果
    pub fn before_unload(&self) {
        self.scheduler.trigger(FlushTrigger::BeforeUnload);
    }

    pub async fn force_flush(&self) -> Result<FlushReport, SyncError> {
        self.scheduler.force_flush().await
    }

    // ========== 只读接口 ==========

    pub fn snapshot(&self) -> StorageResult<TrackerSnapshot> {
        Ok(TrackerSnapshot {
            buffer: self.store.snapshot()?,
            sync: self.client.state(),
        })
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    fn after_record<T>(&self, recorded: &Recorded<T>) {
        if recorded.rolled_over() {
            self.scheduler.trigger(FlushTrigger::DayRollover);
        }

        // 只在进入 critical 的边沿触发一次
        if recorded.health == BufferHealth::Critical {
            if !self.critical.swap(true, Ordering::AcqRel) {
                log::debug!("未同步时长进入 critical, 触发刷新");
                self.scheduler.trigger(FlushTrigger::CriticalThreshold);
            }
        } else {
            self.critical.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::LedgerTransport;

    fn tracker(
        transport: Arc<LedgerTransport>,
        clock: Arc<ManualClock>,
        db: Database,
    ) -> ActivityTracker {
        ActivityTracker::with_parts(db, "user-1", clock, transport, &TrackerConfig::default())
            .unwrap()
    }

    fn morning() -> Arc<ManualClock> {
        Arc::new(ManualClock::utc(
            Utc.with_ymd_and_hms(2026, 3, 14, 10, 0, 0).unwrap(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_crossing_critical_triggers_one_flush() {
        let transport = Arc::new(LedgerTransport::new());
        transport.set_latency(Duration::from_millis(500));
        let tracker = tracker(transport.clone(), morning(), Database::in_memory().unwrap());

        tracker.record_time(60).unwrap();
        tracker.record_time(60).unwrap();
        tracker.record_time(60).unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(transport.requests()[0].delta_seconds, 180);

        let snapshot = tracker.snapshot().unwrap();
        assert_eq!(snapshot.buffer.buffer_health, BufferHealth::Good);

        tracker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_hidden_flushes() {
        let transport = Arc::new(LedgerTransport::new());
        let clock = morning();
        let tracker = tracker(transport.clone(), clock.clone(), Database::in_memory().unwrap());

        assert_eq!(
            tracker.open_page("ai-tutor").unwrap(),
            SessionTransition::Started
        );
        tracker.record_time(15).unwrap();
        tracker.record_activity(ActivityKind::AiInteraction, 1).unwrap();
        tracker.page_hidden();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let aggregate = transport.aggregate("user-1", clock.today()).unwrap();
        assert_eq!(aggregate.total_time_spent, 15);
        assert_eq!(aggregate.session_count, 1);
        assert_eq!(aggregate.ai_tutor_interactions, 1);

        tracker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_before_unload_flushes_pending_time() {
        let transport = Arc::new(LedgerTransport::new());
        let clock = morning();
        let tracker = tracker(transport.clone(), clock.clone(), Database::in_memory().unwrap());

        tracker.open_page("mock-exam").unwrap();
        tracker.record_time(20).unwrap();
        tracker.record_activity(ActivityKind::MockExamTaken, 1).unwrap();
        assert!(transport.requests().is_empty());

        tracker.before_unload();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].delta_seconds, 20);

        let aggregate = transport.aggregate("user-1", clock.today()).unwrap();
        assert_eq!(aggregate.mock_exams_taken, 1);
        assert_eq!(tracker.snapshot().unwrap().buffer.unsynced_seconds, 0);

        tracker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_day_rollover_flushes_previous_day() {
        let transport = Arc::new(LedgerTransport::new());
        let clock = Arc::new(ManualClock::utc(
            Utc.with_ymd_and_hms(2026, 3, 14, 23, 59, 0).unwrap(),
        ));
        let tracker = tracker(transport.clone(), clock.clone(), Database::in_memory().unwrap());
        let yesterday = clock.today();

        tracker.open_page("ai-tutor").unwrap();
        tracker.record_time(12).unwrap();

        clock.advance(chrono::Duration::minutes(2));
        tracker.open_page("ai-tutor").unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let previous = transport.aggregate("user-1", yesterday).unwrap();
        assert_eq!(previous.total_time_spent, 12);
        assert_eq!(previous.session_count, 1);

        let today = transport.aggregate("user-1", clock.today()).unwrap();
        assert_eq!(today.total_time_spent, 0);
        assert_eq!(today.session_count, 1);

        let snapshot = tracker.snapshot().unwrap();
        assert_eq!(snapshot.buffer.elapsed_seconds, 0);
        assert_eq!(snapshot.buffer.sealed_unsynced_seconds, 0);

        tracker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_sends_residue_without_new_session() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("activity.db");
        let transport = Arc::new(LedgerTransport::new());
        let clock = morning();

        {
            let offline = Arc::new(LedgerTransport::new());
            offline.set_latency(Duration::from_secs(3600));
            let tracker = tracker(offline, clock.clone(), Database::open(&path).unwrap());
            tracker.open_page("ai-tutor").unwrap();
            tracker.record_time(45).unwrap();
            // 进程在刷新前被关闭
        }

        let tracker = tracker(transport.clone(), clock.clone(), Database::open(&path).unwrap());
        assert_eq!(
            tracker.open_page("ai-tutor").unwrap(),
            SessionTransition::Continued
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].delta_seconds, 45);
        assert_eq!(requests[0].delta_sessions, 1);

        tracker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_time_is_not_an_error() {
        let transport = Arc::new(LedgerTransport::new());
        let tracker = tracker(transport, morning(), Database::in_memory().unwrap());

        assert!(!tracker.record_time(-3).unwrap().is_accepted());
        assert!(!tracker.record_time(100_000).unwrap().is_accepted());
        assert_eq!(tracker.snapshot().unwrap().buffer.elapsed_seconds, 0);

        tracker.shutdown().await;
    }
}
