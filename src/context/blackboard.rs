//! Typed view over one swarm's slice of the context store.
//!
//! Key layout:
//!
//! | Key | Contents |
//! |-----|----------|
//! | `facts.<name>` | facts recorded by any tier |
//! | `orientation` | latest [`Orientation`](crate::reasoning::Orientation) |
//! | `decisions` | latest decision list |
//! | `progress.<counter>` | atomic counters |
//! | `runs.<run_id>.steps.<node_id>` | step outputs |
//! | `review` | performance review written before a terminal state |

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use super::store::ContextStore;
use crate::core::error::EngineResult;

/// Handle on one swarm's blackboard
#[derive(Clone)]
pub struct SwarmContext {
    store: Arc<dyn ContextStore>,
    swarm_id: String,
}

impl SwarmContext {
    pub fn new(store: Arc<dyn ContextStore>, swarm_id: impl Into<String>) -> Self {
        Self {
            store,
            swarm_id: swarm_id.into(),
        }
    }

    pub fn swarm_id(&self) -> &str {
        &self.swarm_id
    }

    pub fn store(&self) -> Arc<dyn ContextStore> {
        self.store.clone()
    }

    pub async fn get(&self, key: &str) -> EngineResult<Option<Value>> {
        self.store.get(&self.swarm_id, key).await
    }

    pub async fn set(&self, key: &str, value: Value) -> EngineResult<()> {
        self.store.set(&self.swarm_id, key, value).await
    }

    /// Store a serializable value
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> EngineResult<()> {
        self.set(key, serde_json::to_value(value)?).await
    }

    /// Load and deserialize a value
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> EngineResult<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn record_fact(&self, name: &str, value: Value) -> EngineResult<()> {
        self.set(&format!("facts.{}", name), value).await
    }

    pub async fn fact(&self, name: &str) -> EngineResult<Option<Value>> {
        self.get(&format!("facts.{}", name)).await
    }

    /// Atomically bump a progress counter
    pub async fn add_progress(&self, counter: &str, by: i64) -> EngineResult<i64> {
        self.store
            .increment(&self.swarm_id, &format!("progress.{}", counter), by)
            .await
    }

    pub async fn progress(&self, counter: &str) -> EngineResult<i64> {
        Ok(self
            .get(&format!("progress.{}", counter))
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0))
    }

    pub async fn record_step_output(
        &self,
        run_id: &str,
        node_id: &str,
        output: Value,
    ) -> EngineResult<()> {
        self.set(&step_output_key(run_id, node_id), output).await
    }

    pub async fn step_output(&self, run_id: &str, node_id: &str) -> EngineResult<Option<Value>> {
        self.get(&step_output_key(run_id, node_id)).await
    }
}

fn step_output_key(run_id: &str, node_id: &str) -> String {
    format!("runs.{}.steps.{}", run_id, node_id)
}
