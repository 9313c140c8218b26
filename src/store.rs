//! Script registry storage.
//!
//! Operators register resolution scripts under opaque lookup keys; the
//! resolver pulls them back out by key at request time. The store holds
//! source text only — scripts are never compiled or cached between
//! invocations.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;

/// Length of generated lookup keys.
const KEY_LEN: usize = 12;

/// A registered resolution script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRecord {
    /// Lookup key the script is registered under.
    pub key: String,
    /// Script source, verbatim as registered.
    pub script: String,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

impl ScriptRecord {
    pub fn new(key: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            script: script.into(),
            created_at: Utc::now(),
        }
    }
}

/// Keyed storage for resolution scripts.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Store a record under its key, replacing any previous registration.
    async fn insert(&self, record: ScriptRecord) -> Result<()>;

    /// Fetch the record registered under `key`.
    async fn lookup(&self, key: &str) -> Result<Option<ScriptRecord>>;

    /// Remove the record under `key`, reporting whether one existed.
    async fn remove(&self, key: &str) -> Result<bool>;
}

/// In-memory store. Registrations last for the life of the process.
#[derive(Default)]
pub struct MemoryScriptStore {
    records: RwLock<HashMap<String, ScriptRecord>>,
}

impl MemoryScriptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScriptStore for MemoryScriptStore {
    async fn insert(&self, record: ScriptRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.key.clone(), record);
        Ok(())
    }

    async fn lookup(&self, key: &str) -> Result<Option<ScriptRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.records.write().await.remove(key).is_some())
    }
}

/// Generate a random alphanumeric lookup key.
pub fn generate_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_LEN)
        .map(char::from)
        .collect()
}
