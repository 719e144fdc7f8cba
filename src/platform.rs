//! External platform interface (spec §6): the orchestration platform's
//! resource-watch machinery, CRD serialization, and RBAC are explicitly out
//! of scope (spec §1) — only this trait's contract matters to the core. A
//! process embedding this crate supplies a concrete implementation; this
//! module ships only an in-memory fake for tests, grounded on the teacher's
//! `TeeMemoryStore` (`memory_store.rs`) as a stand-in key-value backing
//! store.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{CoreError, CoreResult};
use crate::types::{ResourceKey, ScaleTargetRef, VariantSpec, VariantStatus};

#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn get_variant(&self, key: &ResourceKey) -> CoreResult<Option<VariantSpec>>;
    async fn list_ready_variants(&self) -> CoreResult<Vec<VariantSpec>>;
    async fn get_scale_target_replicas(&self, target: &ScaleTargetRef, namespace: &str) -> CoreResult<u32>;
    async fn set_scale_target_replicas(&self, target: &ScaleTargetRef, namespace: &str, replicas: u32) -> CoreResult<()>;
    async fn write_variant_status(&self, key: &ResourceKey, status: VariantStatus) -> CoreResult<()>;
}

#[derive(Default)]
pub struct FakePlatformClient {
    variants: RwLock<HashMap<ResourceKey, VariantSpec>>,
    statuses: RwLock<HashMap<ResourceKey, VariantStatus>>,
    deployments: RwLock<HashMap<String, u32>>,
}

impl FakePlatformClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_variant(&self, key: ResourceKey, spec: VariantSpec) {
        self.variants.write().unwrap().insert(key, spec);
    }

    pub fn remove_variant(&self, key: &ResourceKey) {
        self.variants.write().unwrap().remove(key);
        self.statuses.write().unwrap().remove(key);
    }

    pub fn set_deployment_replicas(&self, namespace: &str, name: &str, replicas: u32) {
        self.deployments.write().unwrap().insert(format!("{namespace}/{name}"), replicas);
    }

    pub fn get_status(&self, key: &ResourceKey) -> Option<VariantStatus> {
        self.statuses.read().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl PlatformClient for FakePlatformClient {
    async fn get_variant(&self, key: &ResourceKey) -> CoreResult<Option<VariantSpec>> {
        Ok(self.variants.read().unwrap().get(key).cloned())
    }

    async fn list_ready_variants(&self) -> CoreResult<Vec<VariantSpec>> {
        Ok(self.variants.read().unwrap().values().cloned().collect())
    }

    async fn get_scale_target_replicas(&self, target: &ScaleTargetRef, namespace: &str) -> CoreResult<u32> {
        let key = format!("{namespace}/{}", target.name);
        self.deployments.read().unwrap().get(&key).copied().ok_or_else(|| CoreError::PlatformTransient(key, "deployment not found".into()))
    }

    async fn set_scale_target_replicas(&self, target: &ScaleTargetRef, namespace: &str, replicas: u32) -> CoreResult<()> {
        let key = format!("{namespace}/{}", target.name);
        if !self.deployments.read().unwrap().contains_key(&key) {
            return Err(CoreError::ActuationError(key, "deployment not found".into()));
        }
        self.deployments.write().unwrap().insert(key, replicas);
        Ok(())
    }

    async fn write_variant_status(&self, key: &ResourceKey, status: VariantStatus) -> CoreResult<()> {
        self.statuses.write().unwrap().insert(key.clone(), status);
        Ok(())
    }
}
