//! Shared state + trigger channel (spec §4.8, C8): the only process-wide
//! mutable surface bridging the engine driver (C9) and the reconciliation
//! controller (C10). Modeled directly on the teacher's
//! `ReconciliationState`/event-channel pattern in `controller_manager.rs`:
//! `RwLock`-guarded maps, deep copies on every write, a bounded `mpsc`
//! channel for cross-worker signaling.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::debug;

use crate::config::ModelScalingConfigMap;
use crate::types::{ResourceKey, VariantDecision, VariantSpec};

pub const TRIGGER_CHANNEL_CAPACITY: usize = 1000;

/// A lightweight event carrying just enough to look the decision back up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionTriggerEvent {
    pub name: String,
    pub namespace: String,
}

/// One entry in the VA (variant-allocation) cache: a deep copy of the spec
/// plus the last-observed current replica count.
#[derive(Debug, Clone, PartialEq)]
pub struct VaEntry {
    pub spec: VariantSpec,
    pub current_replicas: u32,
}

#[derive(Default)]
struct VaCache {
    entries: RwLock<BTreeMap<ResourceKey, VaEntry>>,
}

impl VaCache {
    fn upsert(&self, key: ResourceKey, entry: VaEntry) {
        self.entries.write().unwrap().insert(key, entry);
    }

    fn remove(&self, key: &ResourceKey) {
        self.entries.write().unwrap().remove(key);
    }

    fn get(&self, key: &ResourceKey) -> Option<VaEntry> {
        self.entries.read().unwrap().get(key).cloned()
    }

    /// Deep-copy snapshot of every ready (non-deleted) variant, grouped
    /// implicitly — callers group by `model_id` themselves.
    fn all(&self) -> Vec<(ResourceKey, VaEntry)> {
        self.entries.read().unwrap().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

#[derive(Default)]
struct DecisionCache {
    entries: RwLock<BTreeMap<ResourceKey, VariantDecision>>,
}

impl DecisionCache {
    fn set(&self, key: ResourceKey, decision: VariantDecision) {
        self.entries.write().unwrap().insert(key, decision);
    }

    fn get(&self, key: &ResourceKey) -> Option<VariantDecision> {
        self.entries.read().unwrap().get(key).cloned()
    }

    fn remove(&self, key: &ResourceKey) {
        self.entries.write().unwrap().remove(key);
    }
}

#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub optimization_interval: std::time::Duration,
    pub model_scaling: Arc<ModelScalingConfigMap>,
}

struct GlobalConfigCell {
    inner: RwLock<GlobalConfig>,
}

/// Process-wide shared state: VA cache, decision cache, global config, and
/// the `DecisionTrigger` event channel. Construct one instance and clone its
/// `Arc`-wrapped handles into every worker.
pub struct SharedState {
    va_cache: VaCache,
    decision_cache: DecisionCache,
    global_config: GlobalConfigCell,
    trigger_tx: mpsc::Sender<DecisionTriggerEvent>,
    trigger_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<DecisionTriggerEvent>>>,
}

impl SharedState {
    pub fn new(initial_config: GlobalConfig) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);
        Self {
            va_cache: VaCache::default(),
            decision_cache: DecisionCache::default(),
            global_config: GlobalConfigCell { inner: RwLock::new(initial_config) },
            trigger_tx,
            trigger_rx: Arc::new(tokio::sync::Mutex::new(trigger_rx)),
        }
    }

    // --- VA cache -------------------------------------------------------

    pub fn upsert_variant(&self, key: ResourceKey, spec: VariantSpec, current_replicas: u32) {
        self.va_cache.upsert(key, VaEntry { spec, current_replicas });
    }

    pub fn evict_variant(&self, key: &ResourceKey) {
        self.va_cache.remove(key);
        self.decision_cache.remove(key);
    }

    pub fn get_variant(&self, key: &ResourceKey) -> Option<VaEntry> {
        self.va_cache.get(key)
    }

    /// Deep-copy snapshot of every variant currently tracked (excludes
    /// anything already evicted for deletion).
    pub fn get_ready_vas(&self) -> Vec<(ResourceKey, VaEntry)> {
        self.va_cache.all()
    }

    // --- Decision cache ---------------------------------------------------

    pub fn set_decision(&self, key: ResourceKey, decision: VariantDecision) {
        self.decision_cache.set(key, decision);
    }

    pub fn get_decision(&self, key: &ResourceKey) -> Option<VariantDecision> {
        self.decision_cache.get(key)
    }

    // --- Global config ----------------------------------------------------

    pub fn get_global_config(&self) -> GlobalConfig {
        self.global_config.inner.read().unwrap().clone()
    }

    pub fn set_global_config(&self, config: GlobalConfig) {
        *self.global_config.inner.write().unwrap() = config;
    }

    // --- Trigger channel ---------------------------------------------------

    /// Non-blocking send from the engine's perspective: if the buffer is
    /// full the event is dropped (the decision is already written; the next
    /// reconcile tick observes it regardless, spec §4.8).
    pub fn fire_trigger(&self, event: DecisionTriggerEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.trigger_tx.try_send(event) {
            debug!("decision trigger channel full, dropping event");
        }
    }

    pub async fn recv_trigger(&self) -> Option<DecisionTriggerEvent> {
        self.trigger_rx.lock().await.recv().await
    }
}
