//! Bounded store of captured exchanges.
//!
//! The in-memory ring buffer is the source of truth. While debug mode is on,
//! each saved entry is also mirrored, capped to the entry byte budget, into the
//! external store so that other instances can read a combined view. The id
//! list is read, updated and written back without a compare-and-swap, so two
//! instances saving at the same moment can drop each other's id from the list.
//! Logs are diagnostics; that loss is accepted.

use crate::constants::{
    DEFAULT_ENTRY_BUDGET_BYTES, DEFAULT_LOG_TTL_SECS, DEFAULT_MAX_LOGS, ENTRY_HEADROOM_BYTES,
    LOG_ENTRY_PREFIX, LOG_IDS_KEY,
};
use crate::debug_state::DebugStateController;
use crate::kv::{KvCommand, KvStore, StoreError};
use crate::sanitizer::truncate;
use crate::str_utils::char_len;
use crate::types::LogEntry;
use chrono::{Duration, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone)]
pub struct LogStoreConfig {
    pub max_logs: usize,
    pub ttl_secs: u64,
    pub entry_budget_bytes: usize,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            max_logs: DEFAULT_MAX_LOGS,
            ttl_secs: DEFAULT_LOG_TTL_SECS,
            entry_budget_bytes: DEFAULT_ENTRY_BUDGET_BYTES,
        }
    }
}

impl LogStoreConfig {
    /// Starting character cap for each body in the external projection: half
    /// of what is left after reserving headroom for the other fields.
    pub fn body_cap(&self) -> usize {
        self.entry_budget_bytes.saturating_sub(ENTRY_HEADROOM_BYTES) / 2
    }
}

pub fn entry_key(id: &str) -> String {
    format!("{}{}", LOG_ENTRY_PREFIX, id)
}

pub struct LogStore {
    entries: RwLock<VecDeque<LogEntry>>,
    config: LogStoreConfig,
    debug: Arc<DebugStateController>,
    kv: Option<Arc<dyn KvStore>>,
}

impl LogStore {
    pub fn new(
        config: LogStoreConfig,
        debug: Arc<DebugStateController>,
        kv: Option<Arc<dyn KvStore>>,
    ) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(config.max_logs)),
            config,
            debug,
            kv,
        }
    }

    pub fn config(&self) -> &LogStoreConfig {
        &self.config
    }

    /// Puts `entry` at the head, evicts the oldest entries beyond capacity and,
    /// while debug mode is on, mirrors it to the external store in the
    /// background. Must be called from within a tokio runtime.
    pub fn save(&self, entry: LogEntry) -> String {
        let id = entry.id.clone();
        let mirror = if self.debug.is_enabled() {
            self.kv.clone().map(|kv| (kv, entry.clone()))
        } else {
            None
        };

        self.insert(entry);

        if let Some((kv, entry)) = mirror {
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = mirror_entry(kv.as_ref(), &config, &entry).await {
                    tracing::warn!(id = %entry.id, "Failed to mirror log entry: {}", e);
                }
            });
        }
        id
    }

    fn insert(&self, entry: LogEntry) {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.push_front(entry);
        entries.truncate(self.config.max_logs);
    }

    /// In-memory entries, newest first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        match self.entries.read() {
            Ok(entries) => entries.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(entries) => entries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Prefers the external view while debug mode is on so that entries
    /// captured by other instances show up too; falls back to memory when the
    /// store is absent, unreachable or has no id list.
    pub async fn get_all(&self) -> Vec<LogEntry> {
        if self.debug.is_enabled() {
            if let Some(kv) = &self.kv {
                match read_external(kv.as_ref()).await {
                    Ok(Some(entries)) => return entries,
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!("External log read failed, using memory: {}", e);
                    }
                }
            }
        }
        self.snapshot()
    }

    /// Empties memory and deletes every mirrored entry plus the id list.
    /// Returns whether the external deletion succeeded (true with no store).
    pub async fn clear(&self) -> bool {
        {
            let mut entries = match self.entries.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            entries.clear();
        }

        let Some(kv) = &self.kv else {
            return true;
        };
        match clear_external(kv.as_ref()).await {
            Ok(removed) => {
                tracing::info!(removed, "Cleared mirrored logs");
                true
            }
            Err(e) => {
                tracing::warn!("Failed to clear mirrored logs: {}", e);
                false
            }
        }
    }
}

/// Serialized copy written to the external store, at most
/// `entry_budget_bytes` long.
///
/// Headers beyond half the headroom are dropped in name order. Both bodies
/// are then truncated to a shared character cap, which shrinks in proportion
/// to the overflow until the encoded entry fits.
pub fn project(entry: &LogEntry, config: &LogStoreConfig) -> Result<String, StoreError> {
    let budget = config.entry_budget_bytes;
    let mut projected = entry.clone();
    projected.headers = cap_headers(&entry.headers, ENTRY_HEADROOM_BYTES / 2);

    let longest = char_len(&entry.request_body).max(
        entry
            .response_body
            .as_deref()
            .map(char_len)
            .unwrap_or(0),
    );
    let mut cap = config.body_cap().min(longest);
    loop {
        projected.request_body = truncate(&entry.request_body, cap).into_owned();
        projected.response_body = entry
            .response_body
            .as_deref()
            .map(|body| truncate(body, cap).into_owned());

        let encoded = serde_json::to_string(&projected)?;
        if encoded.len() <= budget {
            return Ok(encoded);
        }
        if cap == 0 {
            return Err(StoreError::TooLarge {
                size: encoded.len(),
                budget,
            });
        }
        let scaled = (cap as u128 * budget as u128 / encoded.len() as u128) as usize;
        cap = scaled.min(cap - 1);
    }
}

/// Keeps headers in name order while their encoded size stays within `limit`.
fn cap_headers(headers: &BTreeMap<String, String>, limit: usize) -> BTreeMap<String, String> {
    let mut kept = BTreeMap::new();
    let mut used = 0usize;
    for (name, value) in headers {
        // "name":"value", with escapes
        let cost = encoded_len(name) + encoded_len(value) + 2;
        if used + cost > limit {
            tracing::debug!(
                kept = kept.len(),
                dropped = headers.len() - kept.len(),
                "Dropping headers from mirrored entry"
            );
            break;
        }
        used += cost;
        kept.insert(name.clone(), value.clone());
    }
    kept
}

fn encoded_len(s: &str) -> usize {
    serde_json::to_string(s).map(|e| e.len()).unwrap_or(usize::MAX / 4)
}

async fn read_ids(kv: &dyn KvStore) -> Result<Option<Vec<String>>, StoreError> {
    match kv.get(LOG_IDS_KEY).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Writes the projection of `entry` and the updated id list in one atomic
/// commit, both with the same expiry. Ids pushed off the list are deleted in
/// the same commit.
pub async fn mirror_entry(
    kv: &dyn KvStore,
    config: &LogStoreConfig,
    entry: &LogEntry,
) -> Result<(), StoreError> {
    let projection = project(entry, config)?;

    let mut ids = read_ids(kv).await?.unwrap_or_default();
    ids.retain(|id| id != &entry.id);
    ids.insert(0, entry.id.clone());
    let evicted: Vec<String> = if ids.len() > config.max_logs {
        ids.split_off(config.max_logs)
    } else {
        Vec::new()
    };

    let expire_at = Utc::now() + Duration::seconds(config.ttl_secs as i64);

    let mut commands = vec![
        KvCommand::set(entry_key(&entry.id), projection, expire_at),
        KvCommand::set(LOG_IDS_KEY, serde_json::to_string(&ids)?, expire_at),
    ];
    commands.extend(evicted.iter().map(|id| KvCommand::del(entry_key(id))));
    kv.commit(commands).await
}

async fn read_external(kv: &dyn KvStore) -> Result<Option<Vec<LogEntry>>, StoreError> {
    let Some(ids) = read_ids(kv).await? else {
        return Ok(None);
    };
    let keys: Vec<String> = ids.iter().map(|id| entry_key(id)).collect();
    let values = kv.get_many(&keys).await?;

    let mut entries = Vec::with_capacity(values.len());
    for (id, raw) in ids.iter().zip(values) {
        // Entries may expire or be deleted before the id list catches up.
        let Some(raw) = raw else { continue };
        match serde_json::from_str::<LogEntry>(&raw) {
            Ok(entry) => entries.push(entry),
            Err(e) => tracing::warn!(%id, "Skipping unreadable mirrored entry: {}", e),
        }
    }
    Ok(Some(entries))
}

async fn clear_external(kv: &dyn KvStore) -> Result<usize, StoreError> {
    let ids = read_ids(kv).await?.unwrap_or_default();
    let mut commands: Vec<KvCommand> = ids.iter().map(|id| KvCommand::del(entry_key(id))).collect();
    commands.push(KvCommand::del(LOG_IDS_KEY));
    kv.commit(commands).await?;
    Ok(ids.len())
}
