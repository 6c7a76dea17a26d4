use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub log_level: String,
    pub sqlite_path: PathBuf,
    /// 设置后额外写入按天滚动的文件日志
    pub log_dir: Option<PathBuf>,
    /// 序号账本保留天数
    pub ledger_retention_days: u32,
    pub enable_retention_worker: bool,
    pub retention_schedule: String,
}

impl Config {
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(3000);

        let host = std::env::var("HOST")
            .ok()
            .and_then(|value| value.parse::<IpAddr>().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));

        let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        let sqlite_path = std::env::var("SQLITE_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_sqlite_path);

        let file_logs = std::env::var("ENABLE_FILE_LOGS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let log_dir = file_logs.then(|| {
            std::env::var("LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./logs"))
        });

        let ledger_retention_days = std::env::var("LEDGER_RETENTION_DAYS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|days| *days > 0)
            .unwrap_or(30);

        let enable_retention_worker = std::env::var("ENABLE_RETENTION_WORKER")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let retention_schedule = std::env::var("LEDGER_RETENTION_SCHEDULE")
            .unwrap_or_else(|_| "0 30 3 * * *".to_string());

        Self {
            host,
            port,
            log_level,
            sqlite_path,
            log_dir,
            ledger_retention_days,
            enable_retention_worker,
            retention_schedule,
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

pub fn default_sqlite_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("study-analytics")
        .join("analytics.db")
}
