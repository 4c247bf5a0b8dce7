use crate::broadcaster::{Broadcaster, ViewerId};
use crate::constants::VIEWER_QUEUE_DEPTH;
use crate::debug_state::DebugStateController;
use crate::kv::KvStore;
use crate::log_store::{LogStore, LogStoreConfig};
use crate::protocol::ClientMessage;
use crate::types::{DebugState, LogEntry, Result, StatusReport};
use std::sync::Arc;

/// The observability core: one per process, shared by the HTTP handlers, the
/// viewer connections and the forwarder. Commands that both the HTTP API and
/// viewers can issue are defined here once.
pub struct DebugHub {
    pub control: Arc<DebugStateController>,
    pub logs: Arc<LogStore>,
    pub viewers: Arc<Broadcaster>,
}

impl DebugHub {
    pub fn new(control: DebugStateController, config: LogStoreConfig, kv: Option<Arc<dyn KvStore>>) -> Self {
        let control = Arc::new(control);
        let capacity = config.max_logs;
        Self {
            logs: Arc::new(LogStore::new(config, control.clone(), kv)),
            viewers: Arc::new(Broadcaster::new(control.clone(), capacity, VIEWER_QUEUE_DEPTH)),
            control,
        }
    }

    /// Seeds the debug state from the external store when one is configured.
    pub async fn bootstrap(defaults: DebugState, config: LogStoreConfig, kv: Option<Arc<dyn KvStore>>) -> Self {
        let control = DebugStateController::load(defaults, kv.clone()).await;
        Self::new(control, config, kv)
    }

    pub fn status(&self) -> StatusReport {
        let state = self.control.get_state();
        StatusReport {
            is_debug_mode: state.enabled,
            log_count: self.logs.len(),
            target_url: state.target_url,
        }
    }

    pub async fn toggle_debug(&self) -> StatusReport {
        let state = self.control.toggle().await;
        self.announce_debug(state.enabled);
        self.status()
    }

    pub async fn set_debug(&self, enabled: bool) -> StatusReport {
        let (state, changed) = self.control.set_enabled(enabled).await;
        if changed {
            self.announce_debug(state.enabled);
        } else {
            self.viewers.publish_status();
        }
        self.status()
    }

    fn announce_debug(&self, enabled: bool) {
        self.viewers.publish_debug_update(enabled);
        self.viewers.publish_status();
    }

    /// Clears the stored logs and the viewers' feed. Returns whether the
    /// external deletion succeeded.
    pub async fn clear_logs(&self) -> bool {
        let external_ok = self.logs.clear().await;
        self.viewers.publish_clear();
        external_ok
    }

    pub async fn set_target(&self, url: &str) -> Result<DebugState> {
        let state = self.control.set_target(url).await?;
        self.viewers.publish_log(
            "config",
            serde_json::json!({ "targetUrl": state.target_url }),
        );
        Ok(state)
    }

    /// Stores a captured exchange and pushes it to viewers.
    pub fn record_exchange(&self, entry: LogEntry) -> String {
        let content = match serde_json::to_value(&entry) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Failed to serialize log entry: {}", e);
                serde_json::Value::Null
            }
        };
        let id = self.logs.save(entry);
        self.viewers.publish_log("request", content);
        id
    }

    pub fn record_error(&self, message: impl Into<String>, detail: serde_json::Value) {
        self.viewers.publish_log(
            "error",
            serde_json::json!({ "message": message.into(), "detail": detail }),
        );
    }

    /// Dispatches one inbound viewer message.
    pub async fn handle_viewer_message(&self, viewer: ViewerId, message: ClientMessage) {
        match message {
            ClientMessage::GetStatus => {
                self.viewers.send_to(viewer, self.viewers.snapshot());
            }
            ClientMessage::SetDebug { enabled } => {
                self.set_debug(enabled).await;
            }
            ClientMessage::ClearLogs => {
                self.clear_logs().await;
            }
            ClientMessage::TestRequest => {
                self.viewers.publish_log(
                    "test",
                    serde_json::json!({
                        "message": "Test event from viewer",
                        "viewer": viewer.to_string(),
                    }),
                );
            }
        }
    }
}
