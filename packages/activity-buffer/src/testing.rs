//! 测试用传输层：内存汇总账本 + 故障注入

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use study_analytics::{
    format_day_key, ActivityCounts, AggregateLedger, ApplyDeltaRequest, ApplyDeltaResponse,
    DailyAggregate,
};

use crate::sync::{AggregationTransport, SyncError};

#[derive(Default)]
struct Inner {
    ledger: AggregateLedger,
    requests: Vec<ApplyDeltaRequest>,
    failures: VecDeque<SyncError>,
    dropped_responses: usize,
    latency: Option<Duration>,
}

#[derive(Default)]
pub struct LedgerTransport {
    inner: Mutex<Inner>,
}

impl LedgerTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 下一次请求直接失败，不到达账本
    pub fn fail_next(&self, error: SyncError) {
        self.inner.lock().failures.push_back(error);
    }

    /// 下一次请求落地但响应丢失
    pub fn drop_next_response(&self) {
        self.inner.lock().dropped_responses += 1;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = Some(latency);
    }

    /// 让账本认为该客户端已应用到 `sequence`
    pub fn preload_sequence(&self, user_id: &str, date: NaiveDate, client_id: &str, sequence: u64) {
        let request = ApplyDeltaRequest {
            user_id: user_id.to_string(),
            client_id: client_id.to_string(),
            date: format_day_key(date),
            sequence,
            delta_seconds: 0,
            delta_counts: ActivityCounts::new(),
            delta_sessions: 0,
        };
        self.inner
            .lock()
            .ledger
            .apply(&request)
            .expect("preload request is valid");
    }

    pub fn requests(&self) -> Vec<ApplyDeltaRequest> {
        self.inner.lock().requests.clone()
    }

    pub fn aggregate(&self, user_id: &str, date: NaiveDate) -> Option<DailyAggregate> {
        self.inner
            .lock()
            .ledger
            .get(user_id, &format_day_key(date))
            .cloned()
    }
}

#[async_trait]
impl AggregationTransport for LedgerTransport {
    async fn apply_delta(
        &self,
        request: &ApplyDeltaRequest,
    ) -> Result<ApplyDeltaResponse, SyncError> {
        let latency = self.inner.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.inner.lock();
        inner.requests.push(request.clone());

        if let Some(error) = inner.failures.pop_front() {
            return Err(error);
        }

        let response = inner.ledger.apply(request).map_err(|e| SyncError::Rejected {
            status: 400,
            message: e.to_string(),
        })?;

        if inner.dropped_responses > 0 {
            inner.dropped_responses -= 1;
            return Err(SyncError::Transient("response lost".to_string()));
        }

        Ok(response)
    }
}
