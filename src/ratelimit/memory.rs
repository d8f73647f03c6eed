//! In-process sliding window store.
//!
//! One map per limiter, each behind its own lock. This is the fallback when the
//! distributed store cannot answer, and it only limits traffic seen by this
//! process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::backend::{BackendError, CounterBackend};
use super::window::{admit, LimiterConfig, WindowSnapshot};

/// Timestamps recorded per identifier for one limiter.
#[derive(Debug, Default)]
struct LocalStore {
    /// Window of the limiter writing to this store; sweeps never cut below it
    window_ms: u64,
    entries: HashMap<String, Vec<u64>>,
}

/// Process-local counter backend.
#[derive(Default)]
pub struct InProcessBackend {
    /// Store maps indexed by limiter key prefix
    stores: DashMap<String, Arc<Mutex<LocalStore>>>,
}

impl InProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, store_id: &str) -> Arc<Mutex<LocalStore>> {
        if let Some(store) = self.stores.get(store_id) {
            return store.clone();
        }
        self.stores
            .entry(store_id.to_string())
            .or_default()
            .clone()
    }

    /// Record a request in the local window. Never fails.
    pub fn record_local(&self, config: &LimiterConfig, identifier: &str, now_ms: u64) -> WindowSnapshot {
        let store = self.store(&config.key_prefix);
        let mut store = store.lock();
        store.window_ms = config.window_ms;

        let timestamps = store.entries.entry(identifier.to_string()).or_default();
        let snapshot = admit(timestamps, config, now_ms);
        if timestamps.is_empty() {
            store.entries.remove(identifier);
        }

        trace!(
            store = %config.key_prefix,
            identifier = %identifier,
            admitted = snapshot.admitted,
            count = snapshot.count,
            "Recorded request in process-local window"
        );
        snapshot
    }

    /// Drop `identifier` from one store.
    pub fn clear_local(&self, store_id: &str, identifier: &str) {
        if let Some(store) = self.stores.get(store_id) {
            store.lock().entries.remove(identifier);
        }
    }

    /// Remove timestamps older than `max_age` from every store, and every
    /// identifier left with none.
    ///
    /// A store whose window is longer than `max_age` is swept with its window
    /// instead, so no entry that still counts is dropped. Returns the number of
    /// identifiers removed.
    pub fn sweep(&self, now_ms: u64, max_age: Duration) -> usize {
        let max_age_ms = max_age.as_millis() as u64;
        let stores: Vec<(String, Arc<Mutex<LocalStore>>)> = self
            .stores
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut removed = 0;
        for (store_id, store) in stores {
            let mut store = store.lock();
            let bound_ms = max_age_ms.max(store.window_ms);
            let before = store.entries.len();
            store.entries.retain(|_, timestamps| {
                timestamps.retain(|&ts| now_ms.saturating_sub(ts) < bound_ms);
                !timestamps.is_empty()
            });
            let pruned = before - store.entries.len();
            if pruned > 0 {
                debug!(
                    store = %store_id,
                    pruned,
                    bound_ms,
                    remaining = store.entries.len(),
                    "Swept stale identifiers"
                );
            }
            removed += pruned;
        }
        removed
    }

    /// Number of identifiers tracked in one store.
    pub fn identifier_count(&self, store_id: &str) -> usize {
        self.stores
            .get(store_id)
            .map(|store| store.lock().entries.len())
            .unwrap_or(0)
    }

    /// Number of identifiers tracked across all stores.
    pub fn total_identifiers(&self) -> usize {
        self.stores
            .iter()
            .map(|store| store.value().lock().entries.len())
            .sum()
    }
}

#[async_trait]
impl CounterBackend for InProcessBackend {
    fn name(&self) -> &'static str {
        "in_process"
    }

    async fn record(
        &self,
        config: &LimiterConfig,
        identifier: &str,
        now_ms: u64,
    ) -> Result<WindowSnapshot, BackendError> {
        Ok(self.record_local(config, identifier, now_ms))
    }

    async fn clear(&self, config: &LimiterConfig, identifier: &str) -> Result<(), BackendError> {
        self.clear_local(&config.key_prefix, identifier);
        Ok(())
    }
}
