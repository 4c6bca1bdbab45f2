use chrono::Utc;
use log::{debug, warn};
use lru::LruCache;
use serde::Serialize;
use serde_json::{json, Value};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::sink::{EventSink, SwarmEvent, SwarmEventKind};
use crate::context::ContextStore;
use crate::resources::Allocation;
use crate::swarm::state::{SwarmConfig, SwarmState};

/// Hit and miss counters of the channel cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Relays swarm updates to the channel each swarm reports to.
///
/// Channels are looked up through the state store's `get_swarm` and kept in a
/// bounded LRU cache. A per-call override skips the lookup entirely. Without
/// a state store nothing resolves and every emission is skipped.
pub struct EventEmitter {
    store: RwLock<Option<Arc<dyn ContextStore>>>,
    cache: Mutex<LruCache<String, Option<String>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    sink: Arc<dyn EventSink>,
}

impl EventEmitter {
    pub fn new(
        store: Option<Arc<dyn ContextStore>>,
        sink: Arc<dyn EventSink>,
        cache_capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store: RwLock::new(store),
            cache: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sink,
        }
    }

    /// Swap the state store. Cached channels came from the old one and are dropped.
    pub async fn set_state_store(&self, store: Option<Arc<dyn ContextStore>>) {
        *self.store.write().await = store;
        self.clear_cache().await;
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub async fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.cache.lock().await.len(),
        }
    }

    /// Channel for a swarm; never fails
    pub async fn resolve_channel(
        &self,
        swarm_id: &str,
        channel_override: Option<&str>,
    ) -> Option<String> {
        if let Some(channel) = channel_override {
            return Some(channel.to_string());
        }

        let store = self.store.read().await.clone()?;

        if let Some(cached) = self.cache.lock().await.get(swarm_id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return cached.clone();
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        match store.get_swarm(swarm_id).await {
            Ok(Some(record)) => {
                self.cache
                    .lock()
                    .await
                    .put(swarm_id.to_string(), record.channel_id.clone());
                record.channel_id
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Channel lookup for swarm {} failed: {}", swarm_id, e);
                None
            }
        }
    }

    /// Returns whether the event was handed to the sink
    async fn emit(
        &self,
        kind: SwarmEventKind,
        swarm_id: &str,
        message: Option<String>,
        payload: Value,
        channel_override: Option<&str>,
    ) -> bool {
        let Some(channel_id) = self.resolve_channel(swarm_id, channel_override).await else {
            debug!("No channel for swarm {}, {:?} not emitted", swarm_id, kind);
            return false;
        };
        self.sink.deliver(SwarmEvent {
            swarm_id: swarm_id.to_string(),
            channel_id,
            kind,
            message,
            payload,
            emitted_at: Utc::now(),
        });
        true
    }

    pub async fn emit_swarm_state_update(
        &self,
        swarm_id: &str,
        state: SwarmState,
        message: Option<String>,
        channel_override: Option<&str>,
    ) -> bool {
        self.emit(
            SwarmEventKind::StateUpdate,
            swarm_id,
            message,
            json!({ "state": state }),
            channel_override,
        )
        .await
    }

    pub async fn emit_swarm_config_update(
        &self,
        swarm_id: &str,
        config: &SwarmConfig,
        channel_override: Option<&str>,
    ) -> bool {
        let payload = serde_json::to_value(config).unwrap_or(Value::Null);
        self.emit(
            SwarmEventKind::ConfigUpdate,
            swarm_id,
            None,
            payload,
            channel_override,
        )
        .await
    }

    pub async fn emit_swarm_resource_update(
        &self,
        swarm_id: &str,
        pool: &Allocation,
        channel_override: Option<&str>,
    ) -> bool {
        self.emit(
            SwarmEventKind::ResourceUpdate,
            swarm_id,
            None,
            json!({ "allocated": pool.allocated, "remaining": pool.remaining }),
            channel_override,
        )
        .await
    }

    pub async fn emit_swarm_team_update(
        &self,
        swarm_id: &str,
        members: &[String],
        channel_override: Option<&str>,
    ) -> bool {
        self.emit(
            SwarmEventKind::TeamUpdate,
            swarm_id,
            None,
            json!({ "members": members }),
            channel_override,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{InMemoryContextStore, SwarmRecord};
    use crate::events::BroadcastEventSink;

    async fn store_with(swarm_id: &str, channel: Option<&str>) -> Arc<dyn ContextStore> {
        let store = Arc::new(InMemoryContextStore::new());
        store
            .put_swarm(SwarmRecord {
                swarm_id: swarm_id.to_string(),
                state: SwarmState::Executing,
                goal: "g".to_string(),
                channel_id: channel.map(str::to_string),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_no_store_resolves_nothing_and_skips() {
        let sink = Arc::new(BroadcastEventSink::new(8));
        let mut rx = sink.subscribe();
        let emitter = EventEmitter::new(None, sink, 4);

        assert_eq!(emitter.resolve_channel("s1", None).await, None);
        assert!(
            !emitter
                .emit_swarm_state_update("s1", SwarmState::Analyzing, None, None)
                .await
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_second_lookup_hits_cache() {
        let emitter = EventEmitter::new(
            Some(store_with("s1", Some("chat-1")).await),
            Arc::new(BroadcastEventSink::new(8)),
            4,
        );
        assert_eq!(emitter.resolve_channel("s1", None).await.as_deref(), Some("chat-1"));
        assert_eq!(emitter.resolve_channel("s1", None).await.as_deref(), Some("chat-1"));

        let stats = emitter.cache_stats().await;
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 1, 1));
        assert!((stats.hit_rate() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_override_bypasses_lookup() {
        let sink = Arc::new(BroadcastEventSink::new(8));
        let mut rx = sink.subscribe();
        let emitter = EventEmitter::new(Some(store_with("s1", Some("chat-1")).await), sink, 4);

        assert!(
            emitter
                .emit_swarm_team_update("s1", &["a".to_string()], Some("session-9"))
                .await
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.channel_id, "session-9");
        assert_eq!(event.payload["members"][0], "a");
        assert_eq!(emitter.cache_stats().await, CacheStats::default());
    }

    #[tokio::test]
    async fn test_store_swap_clears_cache() {
        let emitter = EventEmitter::new(
            Some(store_with("s1", Some("old")).await),
            Arc::new(BroadcastEventSink::new(8)),
            4,
        );
        emitter.resolve_channel("s1", None).await;
        emitter
            .set_state_store(Some(store_with("s1", Some("new")).await))
            .await;
        assert_eq!(emitter.cache_stats().await.size, 0);
        assert_eq!(emitter.resolve_channel("s1", None).await.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let store = Arc::new(InMemoryContextStore::new());
        for id in ["a", "b", "c"] {
            store
                .put_swarm(SwarmRecord {
                    swarm_id: id.to_string(),
                    state: SwarmState::Initializing,
                    goal: String::new(),
                    channel_id: Some(format!("chan-{}", id)),
                    updated_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let emitter = EventEmitter::new(Some(store), Arc::new(BroadcastEventSink::new(8)), 2);
        for id in ["a", "b", "c"] {
            emitter.resolve_channel(id, None).await;
        }
        assert_eq!(emitter.cache_stats().await.size, 2);
    }
}
