use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::core::error::{EngineError, EngineResult};
use crate::swarm::state::SwarmState;

/// What the state store knows about a swarm outside its blackboard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmRecord {
    pub swarm_id: String,

    pub state: SwarmState,

    pub goal: String,

    /// Notification channel (chat or session) that receives swarm events
    pub channel_id: Option<String>,

    pub updated_at: DateTime<Utc>,
}

/// Shared, multi-writer key-value store scoped by swarm.
///
/// Writes are last-write-wins per key. Counters must go through
/// [`ContextStore::increment`], never read-modify-write.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn get(&self, swarm_id: &str, key: &str) -> EngineResult<Option<Value>>;

    async fn set(&self, swarm_id: &str, key: &str, value: Value) -> EngineResult<()>;

    /// Returns true if the key existed
    async fn delete(&self, swarm_id: &str, key: &str) -> EngineResult<bool>;

    /// Atomically add `by` to an integer counter, creating it at zero
    async fn increment(&self, swarm_id: &str, key: &str, by: i64) -> EngineResult<i64>;

    /// Keys under a prefix, sorted
    async fn keys(&self, swarm_id: &str, prefix: &str) -> EngineResult<Vec<String>>;

    async fn get_swarm(&self, swarm_id: &str) -> EngineResult<Option<SwarmRecord>>;

    async fn put_swarm(&self, record: SwarmRecord) -> EngineResult<()>;
}

/// Process-local context store
#[derive(Debug, Default)]
pub struct InMemoryContextStore {
    entries: RwLock<HashMap<String, HashMap<String, Value>>>,
    swarms: RwLock<HashMap<String, SwarmRecord>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn get(&self, swarm_id: &str, key: &str) -> EngineResult<Option<Value>> {
        let entries = self.entries.read().await;
        Ok(entries.get(swarm_id).and_then(|m| m.get(key)).cloned())
    }

    async fn set(&self, swarm_id: &str, key: &str, value: Value) -> EngineResult<()> {
        let mut entries = self.entries.write().await;
        entries
            .entry(swarm_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, swarm_id: &str, key: &str) -> EngineResult<bool> {
        let mut entries = self.entries.write().await;
        Ok(entries
            .get_mut(swarm_id)
            .map(|m| m.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn increment(&self, swarm_id: &str, key: &str, by: i64) -> EngineResult<i64> {
        let mut entries = self.entries.write().await;
        let slot = entries
            .entry(swarm_id.to_string())
            .or_default()
            .entry(key.to_string())
            .or_insert(Value::from(0));
        let current = slot.as_i64().ok_or_else(|| {
            EngineError::Serialization(format!("counter {} holds a non-integer value", key))
        })?;
        let next = current + by;
        *slot = Value::from(next);
        Ok(next)
    }

    async fn keys(&self, swarm_id: &str, prefix: &str) -> EngineResult<Vec<String>> {
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .get(swarm_id)
            .map(|m| m.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    async fn get_swarm(&self, swarm_id: &str) -> EngineResult<Option<SwarmRecord>> {
        let swarms = self.swarms.read().await;
        Ok(swarms.get(swarm_id).cloned())
    }

    async fn put_swarm(&self, record: SwarmRecord) -> EngineResult<()> {
        let mut swarms = self.swarms.write().await;
        swarms.insert(record.swarm_id.clone(), record);
        Ok(())
    }
}
