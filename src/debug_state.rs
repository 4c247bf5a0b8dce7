use crate::constants::{
    DEBUG_OFF_TTL_SECS, DEBUG_ON_TTL_SECS, DEBUG_STATE_KEY, PROXY_CONFIG_KEY,
    PROXY_CONFIG_TTL_SECS,
};
use crate::kv::{KvCommand, KvStore, StoreError};
use crate::types::{DebugState, RelayError, Result};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Serialize, Deserialize)]
struct PersistedDebugFlag {
    enabled: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedProxyConfig {
    target_url: String,
}

/// Owns the debug flag and the upstream target for this process.
///
/// The in-memory value is authoritative. Successful mutations are mirrored to
/// the external store so other instances can pick them up on start; a failed
/// mirror is logged and otherwise ignored.
pub struct DebugStateController {
    state: RwLock<DebugState>,
    request_count: AtomicU64,
    kv: Option<Arc<dyn KvStore>>,
}

impl DebugStateController {
    pub fn new(defaults: DebugState, kv: Option<Arc<dyn KvStore>>) -> Self {
        Self {
            state: RwLock::new(defaults),
            request_count: AtomicU64::new(0),
            kv,
        }
    }

    /// Builds the controller, seeding it from the external store when that is
    /// reachable. Stale values are accepted as-is.
    pub async fn load(defaults: DebugState, kv: Option<Arc<dyn KvStore>>) -> Self {
        let mut seeded = defaults;
        if let Some(store) = &kv {
            match read_persisted(store.as_ref()).await {
                Ok((flag, config)) => {
                    if let Some(flag) = flag {
                        seeded.enabled = flag.enabled;
                    }
                    if let Some(config) = config {
                        match validate_target(&config.target_url) {
                            Ok(url) => seeded.target_url = url,
                            Err(e) => tracing::warn!("Ignoring persisted target: {}", e),
                        }
                    }
                    tracing::info!(
                        enabled = seeded.enabled,
                        target = %seeded.target_url,
                        "Debug state seeded from external store"
                    );
                }
                Err(e) => {
                    tracing::warn!("Could not read debug state from external store: {}", e);
                }
            }
        }
        Self::new(seeded, kv)
    }

    pub fn get_state(&self) -> DebugState {
        match self.state.read() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.get_state().enabled
    }

    pub fn target_url(&self) -> String {
        self.get_state().target_url
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn record_request(&self) -> u64 {
        self.request_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Flips the flag. Turning debug mode on resets the request counter.
    pub async fn toggle(&self) -> DebugState {
        let next = self.mutate(|state| state.enabled = !state.enabled);
        self.after_flag_change(&next).await;
        next
    }

    /// Sets the flag to `enabled`. The comparison and the write happen under
    /// one lock; the returned bool says whether this call changed the flag.
    pub async fn set_enabled(&self, enabled: bool) -> (DebugState, bool) {
        let mut changed = false;
        let next = self.mutate(|state| {
            changed = state.enabled != enabled;
            state.enabled = enabled;
        });
        if changed {
            self.after_flag_change(&next).await;
        }
        (next, changed)
    }

    /// Replaces the upstream target after checking it is an absolute http(s)
    /// URL. On rejection the previous target stays active.
    pub async fn set_target(&self, url: &str) -> Result<DebugState> {
        let target = validate_target(url)?;
        let next = self.mutate(|state| state.target_url = target.clone());
        tracing::info!(target = %next.target_url, "Upstream target updated");

        let persisted = PersistedProxyConfig {
            target_url: next.target_url.clone(),
        };
        self.mirror(PROXY_CONFIG_KEY, &persisted, PROXY_CONFIG_TTL_SECS)
            .await;
        Ok(next)
    }

    fn mutate(&self, f: impl FnOnce(&mut DebugState)) -> DebugState {
        let mut guard = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
        guard.clone()
    }

    async fn after_flag_change(&self, next: &DebugState) {
        if next.enabled {
            self.request_count.store(0, Ordering::Relaxed);
        }
        tracing::info!(enabled = next.enabled, "Debug mode changed");

        let ttl = if next.enabled {
            DEBUG_ON_TTL_SECS
        } else {
            DEBUG_OFF_TTL_SECS
        };
        let persisted = PersistedDebugFlag {
            enabled: next.enabled,
        };
        self.mirror(DEBUG_STATE_KEY, &persisted, ttl).await;
    }

    async fn mirror<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) {
        let Some(kv) = &self.kv else {
            return;
        };
        let value = match serde_json::to_string(value) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Failed to serialize {}: {}", key, e);
                return;
            }
        };
        let expire_at = Utc::now() + Duration::seconds(ttl_secs as i64);
        if let Err(e) = kv.commit(vec![KvCommand::set(key, value, expire_at)]).await {
            tracing::warn!(key, "Failed to mirror debug state: {}", e);
        }
    }
}

async fn read_persisted(
    kv: &dyn KvStore,
) -> std::result::Result<(Option<PersistedDebugFlag>, Option<PersistedProxyConfig>), StoreError> {
    let flag = match kv.get(DEBUG_STATE_KEY).await? {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    };
    let config = match kv.get(PROXY_CONFIG_KEY).await? {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    };
    Ok((flag, config))
}

/// Accepts absolute `http`/`https` URLs with a host; returns the normalized
/// form without a trailing slash.
pub fn validate_target(url: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url.trim())
        .map_err(|e| RelayError::InvalidTargetUrl(format!("{}: {}", url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(RelayError::InvalidTargetUrl(format!(
            "{}: expected an absolute http(s) URL",
            url
        )));
    }
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use async_trait::async_trait;

    struct BrokenKv;

    #[async_trait]
    impl KvStore for BrokenKv {
        async fn get(&self, _key: &str) -> std::result::Result<Option<String>, StoreError> {
            Err(StoreError::Command("down".into()))
        }
        async fn get_many(
            &self,
            _keys: &[String],
        ) -> std::result::Result<Vec<Option<String>>, StoreError> {
            Err(StoreError::Command("down".into()))
        }
        async fn commit(&self, _commands: Vec<KvCommand>) -> std::result::Result<(), StoreError> {
            Err(StoreError::Command("down".into()))
        }
    }

    fn defaults() -> DebugState {
        DebugState {
            enabled: false,
            target_url: "https://api.example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn test_toggle_twice_restores_state_and_mirror() {
        let kv = Arc::new(MemoryKv::new());
        let controller = DebugStateController::new(defaults(), Some(kv.clone()));

        let on = controller.toggle().await;
        assert!(on.enabled);
        assert_eq!(
            kv.get(DEBUG_STATE_KEY).await.unwrap().as_deref(),
            Some(r#"{"enabled":true}"#)
        );

        let off = controller.toggle().await;
        assert_eq!(off, defaults());
        let after_two = kv.get(DEBUG_STATE_KEY).await.unwrap();

        controller.toggle().await;
        controller.toggle().await;
        assert_eq!(kv.get(DEBUG_STATE_KEY).await.unwrap(), after_two);
        assert_eq!(after_two.as_deref(), Some(r#"{"enabled":false}"#));
    }

    #[tokio::test]
    async fn test_enabling_resets_request_count() {
        let controller = DebugStateController::new(defaults(), None);
        controller.record_request();
        controller.record_request();
        assert_eq!(controller.request_count(), 2);

        controller.set_enabled(true).await;
        assert_eq!(controller.request_count(), 0);

        controller.record_request();
        let (_, changed) = controller.set_enabled(true).await;
        assert!(!changed);
        assert_eq!(controller.request_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_set_enabled_changes_flag_once() {
        for _ in 0..50 {
            let controller = Arc::new(DebugStateController::new(defaults(), None));
            let mut tasks = Vec::new();
            for _ in 0..8 {
                let controller = controller.clone();
                tasks.push(tokio::spawn(async move {
                    controller.set_enabled(true).await.1
                }));
            }
            let mut changes = 0;
            for task in tasks {
                if task.await.unwrap() {
                    changes += 1;
                }
            }
            assert_eq!(changes, 1);
            assert!(controller.is_enabled());
        }
    }

    #[tokio::test]
    async fn test_set_target_rejects_invalid_url() {
        let controller = DebugStateController::new(defaults(), None);
        for bad in ["not a url", "/relative/path", "ftp://files.example.com", "mailto:a@b.c"] {
            let err = controller.set_target(bad).await.unwrap_err();
            assert!(matches!(err, RelayError::InvalidTargetUrl(_)), "{}", bad);
        }
        assert_eq!(controller.target_url(), "https://api.example.com");

        let next = controller.set_target("http://localhost:9000/").await.unwrap();
        assert_eq!(next.target_url, "http://localhost:9000");
    }

    #[tokio::test]
    async fn test_load_seeds_from_store() {
        let kv = Arc::new(MemoryKv::new());
        let exp = Utc::now() + Duration::hours(1);
        kv.commit(vec![
            KvCommand::set(DEBUG_STATE_KEY, r#"{"enabled":true}"#, exp),
            KvCommand::set(PROXY_CONFIG_KEY, r#"{"targetUrl":"https://other.example"}"#, exp),
        ])
        .await
        .unwrap();

        let controller = DebugStateController::load(defaults(), Some(kv)).await;
        assert_eq!(
            controller.get_state(),
            DebugState {
                enabled: true,
                target_url: "https://other.example".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_store_failures_do_not_block_mutations() {
        let kv: Arc<dyn KvStore> = Arc::new(BrokenKv);
        let controller = DebugStateController::load(defaults(), Some(kv)).await;
        assert_eq!(controller.get_state(), defaults());

        assert!(controller.toggle().await.enabled);
        let next = controller.set_target("https://b.example").await.unwrap();
        assert_eq!(next.target_url, "https://b.example");
        assert!(controller.is_enabled());
    }
}
