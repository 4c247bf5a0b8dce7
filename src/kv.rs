//! External expiring key/value store.
//!
//! The store is a best-effort mirror shared between instances. Every call can
//! fail with [`StoreError`]; callers log the failure and keep going with their
//! in-memory state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("store returned status {0}: {1}")]
    Status(u16, String),

    #[error("store command failed: {0}")]
    Command(String),

    #[error("store payload error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("value of {size} bytes exceeds the {budget} byte budget")]
    TooLarge { size: usize, budget: usize },
}

/// One write inside an atomic [`KvStore::commit`].
#[derive(Debug, Clone, PartialEq)]
pub enum KvCommand {
    Set {
        key: String,
        value: String,
        expire_at: DateTime<Utc>,
    },
    Del {
        key: String,
    },
}

impl KvCommand {
    pub fn set(key: impl Into<String>, value: impl Into<String>, expire_at: DateTime<Utc>) -> Self {
        KvCommand::Set {
            key: key.into(),
            value: value.into(),
            expire_at,
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        KvCommand::Del { key: key.into() }
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Values in the order of `keys`; missing or expired keys yield `None`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    /// Applies all commands atomically, or none of them.
    async fn commit(&self, commands: Vec<KvCommand>) -> Result<(), StoreError>;
}

/// In-process store honoring expiry. Used for tests and single-instance runs.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expiry recorded for `key`, if it is live.
    pub async fn expiry_of(&self, key: &str) -> Option<DateTime<Utc>> {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|(_, exp)| *exp > Utc::now())
            .map(|(_, exp)| *exp)
    }

    pub async fn len(&self) -> usize {
        let now = Utc::now();
        let entries = self.entries.lock().await;
        entries.values().filter(|(_, exp)| *exp > now).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, exp)) if *exp > Utc::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let now = Utc::now();
        let entries = self.entries.lock().await;
        Ok(keys
            .iter()
            .map(|k| {
                entries
                    .get(k)
                    .filter(|(_, exp)| *exp > now)
                    .map(|(v, _)| v.clone())
            })
            .collect())
    }

    async fn commit(&self, commands: Vec<KvCommand>) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        for command in commands {
            match command {
                KvCommand::Set {
                    key,
                    value,
                    expire_at,
                } => {
                    entries.insert(key, (value, expire_at));
                }
                KvCommand::Del { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// Redis-over-REST client (Upstash / Vercel KV wire format).
///
/// Single commands are POSTed as a JSON array to the base URL, transactions
/// as an array of arrays to `/multi-exec`.
pub struct UpstashKv {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl UpstashKv {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            token: token.into(),
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, StoreError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(StoreError::Status(status.as_u16(), text));
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn command(&self, args: Vec<Value>) -> Result<Value, StoreError> {
        let reply = self.post("", &Value::Array(args)).await?;
        unwrap_reply(reply)
    }
}

/// Extracts `result` from a `{"result": ..}` / `{"error": ..}` reply.
fn unwrap_reply(reply: Value) -> Result<Value, StoreError> {
    if let Some(err) = reply.get("error").and_then(|e| e.as_str()) {
        return Err(StoreError::Command(err.to_string()));
    }
    match reply {
        Value::Object(mut map) => Ok(map.remove("result").unwrap_or(Value::Null)),
        other => Err(StoreError::Command(format!("unexpected reply: {}", other))),
    }
}

fn encode_command(command: &KvCommand) -> Value {
    match command {
        KvCommand::Set {
            key,
            value,
            expire_at,
        } => serde_json::json!(["SET", key, value, "EXAT", expire_at.timestamp().to_string()]),
        KvCommand::Del { key } => serde_json::json!(["DEL", key]),
    }
}

#[async_trait]
impl KvStore for UpstashKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let result = self
            .command(vec![Value::from("GET"), Value::from(key)])
            .await?;
        Ok(result.as_str().map(str::to_string))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec![Value::from("MGET")];
        args.extend(keys.iter().map(|k| Value::from(k.as_str())));
        match self.command(args).await? {
            Value::Array(items) => Ok(items
                .into_iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect()),
            other => Err(StoreError::Command(format!("unexpected MGET reply: {}", other))),
        }
    }

    async fn commit(&self, commands: Vec<KvCommand>) -> Result<(), StoreError> {
        if commands.is_empty() {
            return Ok(());
        }
        let body = Value::Array(commands.iter().map(encode_command).collect());
        match self.post("/multi-exec", &body).await? {
            Value::Array(replies) => {
                for reply in replies {
                    unwrap_reply(reply)?;
                }
                Ok(())
            }
            other => unwrap_reply(other).map(|_| ()),
        }
    }
}
