//! HTTP 传输层
//!
//! `POST {endpoint}/api/analytics/daily/apply`，响应格式为
//! `{success, data}` 或 `{success: false, error, code}`。

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use study_analytics::{ApplyDeltaRequest, ApplyDeltaResponse};

use crate::config::TrackerConfig;
use crate::sync::{AggregationTransport, SyncError};

pub const APPLY_PATH: &str = "/api/analytics/daily/apply";

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    apply_url: String,
}

impl HttpTransport {
    pub fn new(config: &TrackerConfig) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Transient(format!("failed to build http client: {e}")))?;

        Ok(Self::with_client(client, &config.endpoint))
    }

    pub fn with_client(client: reqwest::Client, endpoint: &str) -> Self {
        Self {
            client,
            apply_url: format!("{}{}", endpoint.trim_end_matches('/'), APPLY_PATH),
        }
    }

    pub fn apply_url(&self) -> &str {
        &self.apply_url
    }
}

#[async_trait]
impl AggregationTransport for HttpTransport {
    async fn apply_delta(
        &self,
        request: &ApplyDeltaRequest,
    ) -> Result<ApplyDeltaResponse, SyncError> {
        let resp = self
            .client
            .post(&self.apply_url)
            .json(request)
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;

        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;

        if status.is_success() {
            return decode_data(status, &bytes);
        }

        let message = error_message(&bytes);
        if is_retryable(status) {
            Err(SyncError::Transient(format!("{status}: {message}")))
        } else {
            Err(SyncError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }
}

fn decode_data<T: DeserializeOwned>(status: StatusCode, bytes: &[u8]) -> Result<T, SyncError> {
    let envelope: ApiEnvelope<T> = serde_json::from_slice(bytes).map_err(|e| {
        log::error!(
            "无法解析汇总接口响应: {}. Body: {}",
            e,
            String::from_utf8_lossy(bytes)
        );
        SyncError::Rejected {
            status: status.as_u16(),
            message: format!("invalid response body: {e}"),
        }
    })?;

    match envelope {
        ApiEnvelope {
            success: true,
            data: Some(data),
            ..
        } => Ok(data),
        other => Err(SyncError::Rejected {
            status: status.as_u16(),
            message: other
                .error
                .or(other.code)
                .unwrap_or_else(|| "response without data".to_string()),
        }),
    }
}

fn error_message(bytes: &[u8]) -> String {
    match serde_json::from_slice::<ApiEnvelope<serde_json::Value>>(bytes) {
        Ok(envelope) => match (envelope.code, envelope.error) {
            (Some(code), Some(error)) => format!("{code}: {error}"),
            (Some(code), None) => code,
            (None, Some(error)) => error,
            (None, None) => String::new(),
        },
        Err(_) => String::from_utf8_lossy(bytes).chars().take(200).collect(),
    }
}

pub fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}
