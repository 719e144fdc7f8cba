//! Model-scaling config parser (spec §4.6, C6): turns a string-keyed
//! ConfigMap-shaped mapping into a typed, validated, defaults-merged
//! per-model threshold table. Invalid entries are dropped with a log, never
//! fatal, mirroring the teacher's tolerant parsing style in
//! `controller_manager.rs`'s event ingestion.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_KV_CACHE_THRESHOLD: f64 = 0.80;
pub const DEFAULT_QUEUE_LENGTH_THRESHOLD: f64 = 5.0;
pub const DEFAULT_KV_SPARE_TRIGGER: f64 = 0.10;
pub const DEFAULT_QUEUE_SPARE_TRIGGER: f64 = 3.0;
pub const DEFAULT_SCALE_TO_ZERO_RETENTION: Duration = Duration::from_secs(10 * 60);

const RESERVED_DEFAULT_KEY: &str = "default";

/// Raw shape of one ConfigMap `data` entry, deserialized from a YAML blob.
/// All scalar fields are optional so that an override only needs to name
/// the fields it actually changes (spec §4.6: "override field non-zero =>
/// wins").
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct RawEntry {
    model_id: Option<String>,
    kv_cache_threshold: Option<f64>,
    queue_length_threshold: Option<f64>,
    kv_spare_trigger: Option<f64>,
    queue_spare_trigger: Option<f64>,
    enable_scale_to_zero: Option<bool>,
    scale_to_zero_retention_period: Option<String>,
}

/// Fully resolved, validated config for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelScalingConfig {
    pub kv_cache_threshold: f64,
    pub queue_length_threshold: f64,
    pub kv_spare_trigger: f64,
    pub queue_spare_trigger: f64,
    pub enable_scale_to_zero: bool,
    pub scale_to_zero_retention_period: Duration,
}

impl Default for ModelScalingConfig {
    fn default() -> Self {
        Self {
            kv_cache_threshold: DEFAULT_KV_CACHE_THRESHOLD,
            queue_length_threshold: DEFAULT_QUEUE_LENGTH_THRESHOLD,
            kv_spare_trigger: DEFAULT_KV_SPARE_TRIGGER,
            queue_spare_trigger: DEFAULT_QUEUE_SPARE_TRIGGER,
            enable_scale_to_zero: false,
            scale_to_zero_retention_period: DEFAULT_SCALE_TO_ZERO_RETENTION,
        }
    }
}

impl ModelScalingConfig {
    fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.kv_cache_threshold) {
            return Err(format!("kvCacheThreshold out of range [0,1]: {}", self.kv_cache_threshold));
        }
        if self.queue_length_threshold < 0.0 {
            return Err(format!("queueLengthThreshold must be >= 0: {}", self.queue_length_threshold));
        }
        if !(0.0..=1.0).contains(&self.kv_spare_trigger) {
            return Err(format!("kvSpareTrigger out of range [0,1]: {}", self.kv_spare_trigger));
        }
        if self.queue_spare_trigger < 0.0 {
            return Err(format!("queueSpareTrigger must be >= 0: {}", self.queue_spare_trigger));
        }
        if self.kv_cache_threshold < self.kv_spare_trigger {
            return Err(format!(
                "kvCacheThreshold ({}) must be >= kvSpareTrigger ({})",
                self.kv_cache_threshold, self.kv_spare_trigger
            ));
        }
        Ok(())
    }

    fn merge_override(defaults: &ModelScalingConfig, raw: &RawEntry) -> ModelScalingConfig {
        ModelScalingConfig {
            kv_cache_threshold: raw.kv_cache_threshold.unwrap_or(defaults.kv_cache_threshold),
            queue_length_threshold: raw.queue_length_threshold.unwrap_or(defaults.queue_length_threshold),
            kv_spare_trigger: raw.kv_spare_trigger.unwrap_or(defaults.kv_spare_trigger),
            queue_spare_trigger: raw.queue_spare_trigger.unwrap_or(defaults.queue_spare_trigger),
            enable_scale_to_zero: raw.enable_scale_to_zero.unwrap_or(defaults.enable_scale_to_zero),
            scale_to_zero_retention_period: raw
                .scale_to_zero_retention_period
                .as_deref()
                .and_then(|s| humantime::parse_duration(s).ok())
                .unwrap_or(defaults.scale_to_zero_retention_period),
        }
    }
}

/// The parsed, merged config table, keyed by `model_id`.
#[derive(Debug, Clone)]
pub struct ModelScalingConfigMap {
    defaults: ModelScalingConfig,
    overrides: BTreeMap<String, ModelScalingConfig>,
}

impl ModelScalingConfigMap {
    /// Parses a ConfigMap-shaped `data` map. Each value is a YAML blob.
    /// `default` is reserved for global defaults; every other entry must
    /// declare `model_id`. Invalid or malformed entries are dropped with a
    /// log, never fatal (spec §4.6).
    pub fn parse(data: &BTreeMap<String, String>) -> Self {
        let mut defaults = ModelScalingConfig::default();
        if let Some(raw_default) = data.get(RESERVED_DEFAULT_KEY) {
            match serde_yaml::from_str::<RawEntry>(raw_default) {
                Ok(raw) => {
                    let candidate = ModelScalingConfig::merge_override(&ModelScalingConfig::default(), &raw);
                    match candidate.validate() {
                        Ok(()) => defaults = candidate,
                        Err(reason) => warn!(key = RESERVED_DEFAULT_KEY, %reason, "dropping invalid default model-scaling entry"),
                    }
                }
                Err(e) => warn!(key = RESERVED_DEFAULT_KEY, error = %e, "failed to parse default model-scaling entry"),
            }
        }

        let mut overrides: BTreeMap<String, ModelScalingConfig> = BTreeMap::new();
        let mut seen_model_ids: BTreeMap<String, String> = BTreeMap::new();

        // BTreeMap iteration is already key-sorted, giving deterministic
        // first-wins semantics on duplicate model_id (spec §4.6).
        for (key, raw_value) in data {
            if key == RESERVED_DEFAULT_KEY {
                continue;
            }
            let raw: RawEntry = match serde_yaml::from_str(raw_value) {
                Ok(r) => r,
                Err(e) => {
                    warn!(%key, error = %e, "dropping unparsable model-scaling entry");
                    continue;
                }
            };
            let Some(model_id) = raw.model_id.clone() else {
                warn!(%key, "dropping model-scaling entry with no model_id");
                continue;
            };
            if let Some(existing_key) = seen_model_ids.get(&model_id) {
                warn!(%key, %model_id, winning_key = %existing_key, "duplicate model_id, first entry by sorted key wins");
                continue;
            }

            let resolved = ModelScalingConfig::merge_override(&defaults, &raw);
            if let Err(reason) = resolved.validate() {
                warn!(%key, %model_id, %reason, "dropping invalid model-scaling entry");
                continue;
            }

            seen_model_ids.insert(model_id.clone(), key.clone());
            overrides.insert(model_id, resolved);
        }

        Self { defaults, overrides }
    }

    /// Defaults merged with any per-model override.
    pub fn get_model_config(&self, model_id: &str) -> ModelScalingConfig {
        self.overrides.get(model_id).copied().unwrap_or(self.defaults)
    }

    pub fn is_scale_to_zero_enabled(&self, model_id: &str) -> bool {
        self.get_model_config(model_id).enable_scale_to_zero
    }

    pub fn get_retention_period(&self, model_id: &str) -> Duration {
        self.get_model_config(model_id).scale_to_zero_retention_period
    }

    pub fn get_min_replicas(&self, model_id: &str) -> u32 {
        if self.is_scale_to_zero_enabled(model_id) {
            0
        } else {
            1
        }
    }

    pub fn defaults(&self) -> ModelScalingConfig {
        self.defaults
    }
}
