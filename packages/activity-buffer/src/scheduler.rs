//! 刷新调度器
//!
//! 单个 tokio 任务上的协作式定时循环：固定间隔触发，另有页面隐藏、
//! 卸载前、未同步时长进入 critical、显式 `force_flush`、日期翻篇
//! 以及退避重试等边沿触发。
//!
//! 同一时刻最多一个刷新在进行；刷新期间到达的触发只置位一个
//! “完成后再刷一次”的槽位，不会并发发出请求。

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::TrackerConfig;
use crate::sync::{backoff_ceiling, full_jitter, FlushReport, SyncClient, SyncError};

type FlushResult = Result<FlushReport, SyncError>;

/// 刷新触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlushTrigger {
    Interval,
    PageHidden,
    BeforeUnload,
    CriticalThreshold,
    Forced,
    DayRollover,
    Retry,
}

// ============================================================
// FlushGate - 刷新合并
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// 立即开始刷新
    Start,
    /// 已有刷新在进行，完成后再刷一次
    Coalesced,
}

/// 刷新进行中标记 + 单个重跑槽位
#[derive(Debug, Default)]
pub struct FlushGate {
    in_flight: bool,
    rerun: bool,
}

impl FlushGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&mut self) -> GateDecision {
        if self.in_flight {
            self.rerun = true;
            GateDecision::Coalesced
        } else {
            self.in_flight = true;
            GateDecision::Start
        }
    }

    /// 刷新完成。返回 `true` 表示需要立即重跑，此时仍处于进行中状态。
    pub fn complete(&mut self) -> bool {
        if self.rerun {
            self.rerun = false;
            true
        } else {
            self.in_flight = false;
            false
        }
    }

    /// 放弃进行中的刷新（关闭时）
    pub fn reset(&mut self) {
        self.in_flight = false;
        self.rerun = false;
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn has_rerun(&self) -> bool {
        self.rerun
    }
}

// ============================================================
// FlushScheduler
// ============================================================

enum Command {
    Trigger(FlushTrigger),
    Force(oneshot::Sender<FlushResult>),
    Shutdown(oneshot::Sender<()>),
}

/// 刷新调度器句柄
pub struct FlushScheduler {
    tx: mpsc::UnboundedSender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FlushScheduler {
    /// 启动调度循环，必须在 tokio 运行时内调用
    pub fn spawn(client: SyncClient, config: &TrackerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let runner = Runner {
            client,
            gate: FlushGate::new(),
            in_flight: None,
            waiting: Vec::new(),
            attached: Vec::new(),
            retry_at: None,
            flush_interval: config.flush_interval,
            backoff_base: config.backoff_base,
            backoff_cap: config.backoff_cap,
            shutdown_timeout: config.shutdown_timeout,
        };

        let handle = tokio::spawn(runner.run(rx));

        Self {
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// 请求一次刷新，不等待结果
    pub fn trigger(&self, trigger: FlushTrigger) {
        if self.tx.send(Command::Trigger(trigger)).is_err() {
            log::debug!("调度器已停止, 忽略触发: {:?}", trigger);
        }
    }

    /// 请求刷新并等待一次在调用之后开始的刷新完成
    pub async fn force_flush(&self) -> Result<FlushReport, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Force(tx))
            .map_err(|_| SyncError::ShuttingDown)?;
        rx.await.map_err(|_| SyncError::ShuttingDown)?
    }

    /// 最后一次尽力刷新后停止循环
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("调度任务异常退出: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

struct Runner {
    client: SyncClient,
    gate: FlushGate,
    in_flight: Option<JoinHandle<FlushResult>>,
    /// 等待下一次开始的刷新
    waiting: Vec<oneshot::Sender<FlushResult>>,
    /// 等待当前刷新
    attached: Vec<oneshot::Sender<FlushResult>>,
    retry_at: Option<Instant>,
    flush_interval: Duration,
    backoff_base: Duration,
    backoff_cap: Duration,
    shutdown_timeout: Duration,
}

impl Runner {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::debug!("刷新调度器启动, 间隔 {:?}", self.flush_interval);

        loop {
            let retry_at = self.retry_at;

            tokio::select! {
                _ = ticker.tick() => {
                    if self.retry_at.is_some() {
                        // 退避期间由重试计时器负责
                        continue;
                    }
                    self.request(FlushTrigger::Interval);
                }
                cmd = rx.recv() => match cmd {
                    Some(Command::Trigger(trigger)) => self.request(trigger),
                    Some(Command::Force(tx)) => {
                        self.waiting.push(tx);
                        self.request(FlushTrigger::Forced);
                    }
                    Some(Command::Shutdown(done)) => {
                        self.finish().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.finish().await;
                        break;
                    }
                },
                result = join_in_flight(&mut self.in_flight) => self.on_complete(result),
                _ = sleep_until_opt(retry_at) => {
                    self.retry_at = None;
                    self.request(FlushTrigger::Retry);
                }
            }
        }

        log::debug!("刷新调度器已停止");
    }

    fn request(&mut self, trigger: FlushTrigger) {
        match self.gate.request() {
            GateDecision::Start => {
                log::debug!("开始刷新: trigger={:?}", trigger);
                self.start_flush();
            }
            GateDecision::Coalesced => {
                log::debug!("刷新进行中, 合并触发: trigger={:?}", trigger);
            }
        }
    }

    fn start_flush(&mut self) {
        self.attached.append(&mut self.waiting);
        let client = self.client.clone();
        self.in_flight = Some(tokio::spawn(async move { client.flush().await }));
    }

    fn on_complete(&mut self, joined: Result<FlushResult, JoinError>) {
        self.in_flight = None;

        let result = joined.unwrap_or_else(|e| Err(SyncError::Storage(format!("刷新任务异常: {e}"))));

        match &result {
            Ok(report) => {
                self.retry_at = None;
                if !report.is_noop() {
                    log::debug!("刷新完成: {:?}", report);
                }
            }
            Err(e) if e.is_transient() => {
                let attempt = self.client.consecutive_failures().max(1);
                let delay = full_jitter(backoff_ceiling(self.backoff_base, self.backoff_cap, attempt));
                log::debug!("第 {} 次重试将在 {:?} 后进行", attempt, delay);
                self.retry_at = Some(Instant::now() + delay);
            }
            Err(_) => {
                self.retry_at = None;
            }
        }

        for waiter in self.attached.drain(..) {
            let _ = waiter.send(result.clone());
        }

        if self.gate.complete() {
            log::debug!("执行合并的刷新请求");
            self.start_flush();
        }
    }

    /// 关闭：等待进行中的刷新，再尽力刷新一次，总时长受限
    async fn finish(&mut self) {
        let client = self.client.clone();
        let in_flight = self.in_flight.take();

        let outcome = tokio::time::timeout(self.shutdown_timeout, async move {
            if let Some(handle) = in_flight {
                let _ = handle.await;
            }
            client.flush().await
        })
        .await;

        match outcome {
            Ok(Ok(report)) => log::info!("关闭前刷新完成: {:?}", report),
            Ok(Err(e)) => log::warn!("关闭前刷新失败, 剩余数据保留在本地缓冲区: {}", e),
            Err(_) => log::warn!(
                "关闭前刷新超时 ({:?}), 剩余数据保留在本地缓冲区",
                self.shutdown_timeout
            ),
        }

        self.gate.reset();
        self.retry_at = None;
        for waiter in self.attached.drain(..).chain(self.waiting.drain(..)) {
            let _ = waiter.send(Err(SyncError::ShuttingDown));
        }
    }
}

async fn join_in_flight(
    in_flight: &mut Option<JoinHandle<FlushResult>>,
) -> Result<FlushResult, JoinError> {
    match in_flight {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
