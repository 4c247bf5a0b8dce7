use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

static LAST_ID_MICROS: AtomicU64 = AtomicU64::new(0);

/// Returns a process-unique id whose lexical order follows creation order.
///
/// The first 16 hex digits are a strictly increasing microsecond clock; the
/// random suffix keeps ids from different instances sharing one external
/// store apart.
pub fn next_log_id() -> String {
    let now = Utc::now().timestamp_micros().max(0) as u64;
    let prev = match LAST_ID_MICROS.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
        Some(now.max(last + 1))
    }) {
        Ok(prev) => prev,
        Err(prev) => prev,
    };
    let micros = now.max(prev + 1);
    format!("{:016x}{:04x}", micros, fastrand::u16(..))
}

/// One captured request/response exchange. Immutable once saved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub url: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub request_body: String,
    #[serde(default)]
    pub response_body: Option<String>,
    #[serde(default)]
    pub response_status: Option<u16>,
    #[serde(rename = "clientIP")]
    pub client_ip: String,
}

impl LogEntry {
    /// Starts an entry with a fresh id. Build it right before saving so that
    /// id order matches insertion order.
    pub fn new(method: impl Into<String>, url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: next_log_id(),
            timestamp: Utc::now(),
            method: method.into(),
            url: url.into(),
            path: path.into(),
            headers: BTreeMap::new(),
            request_body: String::new(),
            response_body: None,
            response_status: None,
            client_ip: "unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DebugState {
    pub enabled: bool,
    pub target_url: String,
}

/// Body of `GET /api/debug/status` and `POST /api/debug/toggle`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub is_debug_mode: bool,
    pub log_count: usize,
    pub target_url: String,
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Upstream request failed: {0}")]
    UpstreamFetch(#[from] reqwest::Error),

    #[error("Failed to read body: {0}")]
    BodyRead(String),

    #[error("Invalid target URL: {0}")]
    InvalidTargetUrl(String),

    #[error("Malformed viewer message: {0}")]
    MalformedViewerMessage(serde_json::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl axum::response::IntoResponse for RelayError {
    fn into_response(self) -> axum::response::Response {
        let (status, error) = match &self {
            RelayError::UpstreamFetch(_) | RelayError::BodyRead(_) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "Proxy request failed",
            ),
            RelayError::InvalidTargetUrl(_) => {
                (axum::http::StatusCode::BAD_REQUEST, "Invalid target URL")
            }
            RelayError::MalformedViewerMessage(_) => {
                (axum::http::StatusCode::BAD_REQUEST, "Malformed message")
            }
            RelayError::Serialization(_) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error",
            ),
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": error,
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}
