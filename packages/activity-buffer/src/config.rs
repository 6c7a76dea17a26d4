use std::time::Duration;

use crate::storage::HealthThresholds;

/// 默认同步服务地址
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:3000";

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// 汇总服务根地址
    pub endpoint: String,
    /// 定时刷新间隔
    pub flush_interval: Duration,
    /// 超过此时长无 record_time 视为空闲，之后的活动开启新会话
    pub idle_timeout: Duration,
    /// 单次 record_time 允许的最大秒数
    pub max_tick_secs: u64,
    pub warning_threshold_secs: u64,
    pub critical_threshold_secs: u64,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub request_timeout: Duration,
    /// 关闭时最后一次刷新的时限
    pub shutdown_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            flush_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30 * 60),
            max_tick_secs: 3600,
            warning_threshold_secs: 30,
            critical_threshold_secs: 120,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

impl TrackerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let endpoint = std::env::var("ACTIVITY_SYNC_ENDPOINT")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or(defaults.endpoint);

        Self {
            endpoint,
            flush_interval: env_secs("ACTIVITY_FLUSH_INTERVAL_SECS").unwrap_or(defaults.flush_interval),
            idle_timeout: env_secs("ACTIVITY_IDLE_TIMEOUT_SECS").unwrap_or(defaults.idle_timeout),
            max_tick_secs: env_u64("ACTIVITY_MAX_TICK_SECS").unwrap_or(defaults.max_tick_secs),
            warning_threshold_secs: env_u64("ACTIVITY_WARNING_THRESHOLD_SECS")
                .unwrap_or(defaults.warning_threshold_secs),
            critical_threshold_secs: env_u64("ACTIVITY_CRITICAL_THRESHOLD_SECS")
                .unwrap_or(defaults.critical_threshold_secs),
            ..defaults
        }
    }

    pub fn thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            warning_secs: self.warning_threshold_secs,
            critical_secs: self.critical_threshold_secs.max(self.warning_threshold_secs),
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn env_secs(key: &str) -> Option<Duration> {
    env_u64(key).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TrackerConfig::default();
        assert_eq!(config.flush_interval, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.max_tick_secs, 3600);
        assert_eq!(config.thresholds(), HealthThresholds::default());
    }

    #[test]
    fn test_critical_threshold_never_below_warning() {
        let config = TrackerConfig {
            warning_threshold_secs: 90,
            critical_threshold_secs: 60,
            ..TrackerConfig::default()
        };
        let thresholds = config.thresholds();
        assert_eq!(thresholds.warning_secs, 90);
        assert_eq!(thresholds.critical_secs, 90);
    }
}
