//! Messages exchanged with live viewers over `/ws`.

use crate::types::RelayError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry of the live event feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewerEvent {
    pub category: String,
    pub content: Value,
    pub timestamp: DateTime<Utc>,
}

impl ViewerEvent {
    pub fn new(category: impl Into<String>, content: Value) -> Self {
        Self {
            category: category.into(),
            content,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    GetStatus,
    SetDebug { enabled: bool },
    ClearLogs,
    TestRequest,
}

impl ClientMessage {
    /// Anything that is not one of the known shapes is rejected.
    pub fn parse(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(RelayError::MalformedViewerMessage)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Status {
        debug_mode: bool,
        logs: Vec<ViewerEvent>,
        request_count: u64,
    },
    Log(ViewerEvent),
    #[serde(rename_all = "camelCase")]
    DebugUpdate { debug_mode: bool },
    ClearLogs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_known_client_messages() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"getStatus"}"#).unwrap(),
            ClientMessage::GetStatus
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"setDebug","enabled":true}"#).unwrap(),
            ClientMessage::SetDebug { enabled: true }
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"clearLogs"}"#).unwrap(),
            ClientMessage::ClearLogs
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"testRequest"}"#).unwrap(),
            ClientMessage::TestRequest
        );
    }

    #[test]
    fn test_parse_rejects_unknown_shapes() {
        for bad in [
            "not json",
            r#"{"type":"dropTables"}"#,
            r#"{"type":"setDebug"}"#,
            r#"{"type":"setDebug","enabled":"yes"}"#,
            r#"{"enabled":true}"#,
            "[]",
        ] {
            let err = ClientMessage::parse(bad).unwrap_err();
            assert!(matches!(err, RelayError::MalformedViewerMessage(_)), "{}", bad);
        }
    }

    #[test]
    fn test_server_messages_wire_format() {
        let event = ViewerEvent::new("request", json!({"method": "GET"}));
        let log = serde_json::to_value(ServerMessage::Log(event.clone())).unwrap();
        assert_eq!(log["type"], "log");
        assert_eq!(log["category"], "request");
        assert_eq!(log["content"]["method"], "GET");
        assert!(log["timestamp"].is_string());

        let status = serde_json::to_value(ServerMessage::Status {
            debug_mode: true,
            logs: vec![event],
            request_count: 3,
        })
        .unwrap();
        assert_eq!(status["type"], "status");
        assert_eq!(status["debugMode"], true);
        assert_eq!(status["requestCount"], 3);
        assert_eq!(status["logs"].as_array().unwrap().len(), 1);

        assert_eq!(
            serde_json::to_value(ServerMessage::DebugUpdate { debug_mode: false }).unwrap(),
            json!({"type": "debugUpdate", "debugMode": false})
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::ClearLogs).unwrap(),
            json!({"type": "clearLogs"})
        );
    }
}
