//! # study-analytics - 学习活动日汇总共享库
//!
//! 客户端缓冲区与服务端汇总接口共用的类型与计算:
//!
//! - [`types`] - 活动类型、增量请求/响应、日汇总行
//! - [`metrics`] - 派生指标 (平均会话时长、生产力评分)
//! - [`ledger`] - 内存版加法汇总账本 (幂等、可交换)
//!
//! ## 使用示例
//!
//! ```rust
//! use study_analytics::{ActivityKind, AggregateLedger, ApplyDeltaRequest, ActivityCounts};
//!
//! let mut counts = ActivityCounts::new();
//! counts.add(ActivityKind::AiInteraction, 1);
//!
//! let mut ledger = AggregateLedger::new();
//! let resp = ledger
//!     .apply(&ApplyDeltaRequest {
//!         user_id: "user-1".into(),
//!         client_id: "tab-a".into(),
//!         date: "2026-03-14".into(),
//!         sequence: 1,
//!         delta_seconds: 45,
//!         delta_counts: counts,
//!         delta_sessions: 1,
//!     })
//!     .unwrap();
//! assert!(resp.applied);
//! assert_eq!(resp.aggregate.total_time_spent, 45);
//! ```

pub mod ledger;
pub mod metrics;
pub mod types;

pub use ledger::AggregateLedger;
pub use metrics::{average_session_length, productivity_score, MAX_PRODUCTIVITY_SCORE};
pub use types::{
    format_day_key, parse_day_key, ActivityCounts, ActivityKind, ApplyDeltaRequest,
    ApplyDeltaResponse, DailyAggregate, DeltaValidationError, DAY_KEY_FORMAT, MAX_DELTA_COUNT,
    MAX_DELTA_SECONDS,
};
