//! # activity-buffer - 学习活动本地缓冲与日汇总同步
//!
//! 在客户端持久化未同步的学习时长与活动计数，并以幂等增量的方式
//! 同步到服务端的日汇总接口:
//!
//! - [`storage`] - SQLite 本地缓冲区 (按用户、日期)
//! - [`session`] - 会话边界判定
//! - [`buffer`] - 缓冲区读写、日期翻篇与确认处理
//! - [`sync`] - 同步客户端、错误分类与退避
//! - [`scheduler`] - 定时与边沿触发的刷新调度
//! - [`tracker`] - 面向 UI 的追踪器入口
//!
//! 记录接口只做同步的本地写入，从不等待网络。网络中断时数据保留在
//! 本地缓冲区，恢复后由下一次刷新补发。

pub mod buffer;
pub mod clock;
pub mod config;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod sync;
pub mod tracker;
pub mod transport;

#[cfg(test)]
mod testing;

pub use buffer::{AckOutcome, LocalBufferStore, PreparedDelta, Recorded, TimeRecord, TimeRejection};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TrackerConfig;
pub use scheduler::{FlushGate, FlushScheduler, FlushTrigger, GateDecision};
pub use session::{SessionTracker, SessionTransition};
pub use storage::{BufferHealth, BufferSnapshot, BufferState, Database, HealthThresholds, StorageError, StorageResult};
pub use sync::{AggregationTransport, FlushReport, SyncClient, SyncError, SyncState, SyncStatus};
pub use tracker::{ActivityTracker, TrackerSnapshot};
pub use transport::HttpTransport;
