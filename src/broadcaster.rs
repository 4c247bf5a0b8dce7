use crate::debug_state::DebugStateController;
use crate::protocol::{ServerMessage, ViewerEvent};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewerId(pub u64);

impl std::fmt::Display for ViewerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "viewer-{}", self.0)
    }
}

/// Registry of live viewers plus the recent event feed they are shown on
/// connect.
///
/// Sends never wait: each viewer has a bounded queue drained by its own
/// connection task, and a full queue drops the message for that viewer only.
pub struct Broadcaster {
    viewers: RwLock<HashMap<ViewerId, mpsc::Sender<ServerMessage>>>,
    history: RwLock<VecDeque<ViewerEvent>>,
    capacity: usize,
    queue_depth: usize,
    next_id: AtomicU64,
    debug: Arc<DebugStateController>,
}

impl Broadcaster {
    pub fn new(debug: Arc<DebugStateController>, capacity: usize, queue_depth: usize) -> Self {
        Self {
            viewers: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
            queue_depth: queue_depth.max(1),
            next_id: AtomicU64::new(1),
            debug,
        }
    }

    /// Adds a viewer and queues the full snapshot as its first message.
    pub fn register(&self) -> (ViewerId, mpsc::Receiver<ServerMessage>) {
        let id = ViewerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let _ = tx.try_send(self.snapshot());

        let mut viewers = match self.viewers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        viewers.insert(id, tx);
        tracing::debug!(%id, viewers = viewers.len(), "Viewer registered");
        (id, rx)
    }

    /// Idempotent.
    pub fn unregister(&self, id: ViewerId) {
        let mut viewers = match self.viewers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if viewers.remove(&id).is_some() {
            tracing::debug!(%id, viewers = viewers.len(), "Viewer unregistered");
        }
    }

    pub fn viewer_count(&self) -> usize {
        match self.viewers.read() {
            Ok(viewers) => viewers.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn snapshot(&self) -> ServerMessage {
        ServerMessage::Status {
            debug_mode: self.debug.is_enabled(),
            logs: self.history(),
            request_count: self.debug.request_count(),
        }
    }

    /// Recent events, newest first.
    pub fn history(&self) -> Vec<ViewerEvent> {
        match self.history.read() {
            Ok(history) => history.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn publish_log(&self, category: &str, content: serde_json::Value) {
        let event = ViewerEvent::new(category, content);
        {
            let mut history = match self.history.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            history.push_front(event.clone());
            history.truncate(self.capacity);
        }
        self.send_all(ServerMessage::Log(event));
    }

    pub fn publish_status(&self) {
        self.send_all(self.snapshot());
    }

    pub fn publish_debug_update(&self, debug_mode: bool) {
        self.send_all(ServerMessage::DebugUpdate { debug_mode });
    }

    /// Drops the event feed and tells every viewer to clear its view.
    pub fn publish_clear(&self) {
        {
            let mut history = match self.history.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            history.clear();
        }
        self.send_all(ServerMessage::ClearLogs);
    }

    /// Sends to a single viewer, e.g. in reply to `getStatus`.
    pub fn send_to(&self, id: ViewerId, message: ServerMessage) {
        let tx = match self.viewers.read() {
            Ok(viewers) => viewers.get(&id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&id).cloned(),
        };
        if let Some(tx) = tx {
            if let Err(TrySendError::Closed(_)) = tx.try_send(message) {
                self.unregister(id);
            }
        }
    }

    fn send_all(&self, message: ServerMessage) {
        let mut closed = Vec::new();
        {
            let viewers = match self.viewers.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            for (id, tx) in viewers.iter() {
                match tx.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(%id, "Viewer queue full, dropping message");
                    }
                    Err(TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        for id in closed {
            self.unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DebugState;
    use serde_json::json;

    fn broadcaster(capacity: usize, depth: usize) -> Broadcaster {
        let debug = Arc::new(DebugStateController::new(
            DebugState {
                enabled: true,
                target_url: "https://api.example.com".into(),
            },
            None,
        ));
        Broadcaster::new(debug, capacity, depth)
    }

    #[tokio::test]
    async fn test_register_sends_snapshot_first() {
        let b = broadcaster(10, 8);
        b.publish_log("info", json!("earlier"));

        let (_id, mut rx) = b.register();
        match rx.try_recv().unwrap() {
            ServerMessage::Status {
                debug_mode, logs, ..
            } => {
                assert!(debug_mode);
                assert_eq!(logs.len(), 1);
                assert_eq!(logs[0].content, json!("earlier"));
            }
            other => panic!("expected status, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_reaches_registered_viewers_only() {
        let b = broadcaster(10, 8);
        let (_a, mut rx_a) = b.register();
        let (id_b, mut rx_b) = b.register();
        rx_a.try_recv().unwrap();
        rx_b.try_recv().unwrap();
        b.unregister(id_b);
        b.unregister(id_b);

        b.publish_log("request", json!({"path": "/v1"}));

        match rx_a.try_recv().unwrap() {
            ServerMessage::Log(event) => {
                assert_eq!(event.category, "request");
                assert_eq!(event.content["path"], "/v1");
            }
            other => panic!("expected log, got {:?}", other),
        }
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_viewers_are_pruned() {
        let b = broadcaster(10, 8);
        let (_id, rx) = b.register();
        drop(rx);
        assert_eq!(b.viewer_count(), 1);
        b.publish_status();
        assert_eq!(b.viewer_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_viewer_does_not_block_publishing() {
        let b = broadcaster(100, 2);
        let (_id, mut rx) = b.register();
        for i in 0..10 {
            b.publish_log("info", json!(i));
        }
        assert_eq!(b.viewer_count(), 1);
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Status { .. }));
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Log(_)));
        assert!(rx.try_recv().is_err());
        assert_eq!(b.history().len(), 10);
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_cleared() {
        let b = broadcaster(3, 8);
        for i in 0..5 {
            b.publish_log("info", json!(i));
        }
        let history = b.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, json!(4));

        let (_id, mut rx) = b.register();
        rx.try_recv().unwrap();
        b.publish_clear();
        assert!(b.history().is_empty());
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::ClearLogs);
    }
}
