//! Model version registry
//!
//! Versions are never deleted: a rolled-back candidate stays in history
//! flagged `discarded`. Exactly one version is active. The active pointer is
//! an `ArcSwap` so goals read it without locks; it is written only after the
//! store transaction that flips the flag has committed. Writers are crate
//! internal: the evolution pipeline is the only caller, under its run lock.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::store::Store;

/// Id of the version created from the configured base model
pub const BASE_VERSION_ID: &str = "base";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub id: String,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub active: bool,
    /// Deployable artifact reference; unset until merged
    pub artifact: Option<String>,
    pub score: Option<f64>,
    /// Rolled back or abandoned; kept for history
    pub discarded: bool,
}

impl ModelVersion {
    /// Root version for the configured base model
    pub fn base(artifact: &str) -> Self {
        Self {
            id: BASE_VERSION_ID.to_string(),
            parent_id: None,
            created_at: Utc::now(),
            active: false,
            artifact: Some(artifact.to_string()),
            score: None,
            discarded: false,
        }
    }

    /// Inactive candidate derived from `parent_id`
    pub fn candidate(id: &str, parent_id: &str) -> Self {
        Self {
            id: id.to_string(),
            parent_id: Some(parent_id.to_string()),
            created_at: Utc::now(),
            active: false,
            artifact: None,
            score: None,
            discarded: false,
        }
    }

    /// What inference collaborators are given as the model reference
    pub fn model_ref(&self) -> &str {
        self.artifact.as_deref().unwrap_or(&self.id)
    }
}

pub struct ModelRegistry {
    store: Arc<Store>,
    active: ArcSwap<ModelVersion>,
    /// Held across a store write and the matching pointer swap
    write: Mutex<()>,
}

impl ModelRegistry {
    /// Load the registry, creating and activating the base version on first start
    pub fn open(store: Arc<Store>, base_artifact: &str) -> Result<Self, StoreError> {
        let versions = store.load_versions()?;
        let active = match versions.iter().find(|v| v.active) {
            Some(active) => active.clone(),
            None => {
                let base = match versions.iter().find(|v| v.id == BASE_VERSION_ID) {
                    Some(base) => base.clone(),
                    None => {
                        let base = ModelVersion::base(base_artifact);
                        store.save_version(&base)?;
                        base
                    }
                };
                store.activate_version(&base.id)?;
                info!("Activated base model {}", base.model_ref());
                ModelVersion { active: true, ..base }
            }
        };

        if active.id == BASE_VERSION_ID && active.artifact.as_deref() != Some(base_artifact) {
            warn!(
                "Configured base model {} differs from stored base {}; keeping stored version",
                base_artifact,
                active.model_ref()
            );
        }

        Ok(Self {
            store,
            active: ArcSwap::from_pointee(active),
            write: Mutex::new(()),
        })
    }

    /// Current active version (lock-free)
    pub fn active(&self) -> Arc<ModelVersion> {
        self.active.load_full()
    }

    /// Model reference for inference calls
    pub fn active_ref(&self) -> String {
        self.active.load().model_ref().to_string()
    }

    pub fn get(&self, id: &str) -> Result<Option<ModelVersion>, StoreError> {
        Ok(self.store.load_versions()?.into_iter().find(|v| v.id == id))
    }

    /// All versions, oldest first
    pub fn history(&self) -> Result<Vec<ModelVersion>, StoreError> {
        self.store.load_versions()
    }

    /// Register an inactive candidate. Re-registering an existing id returns the stored version.
    pub(crate) fn register_candidate(&self, id: &str, parent_id: &str) -> Result<ModelVersion, StoreError> {
        if let Some(existing) = self.get(id)? {
            return Ok(existing);
        }
        let candidate = ModelVersion::candidate(id, parent_id);
        self.store.save_version(&candidate)?;
        info!(version = id, parent = parent_id, "Registered candidate model");
        Ok(candidate)
    }

    pub(crate) fn set_artifact(&self, id: &str, artifact: &str) -> Result<(), StoreError> {
        self.update(id, |v| v.artifact = Some(artifact.to_string()))
    }

    pub(crate) fn set_score(&self, id: &str, score: f64) -> Result<(), StoreError> {
        self.update(id, |v| v.score = Some(score))
    }

    /// Flag a candidate as discarded. The active version cannot be discarded.
    pub(crate) fn discard(&self, id: &str) -> Result<(), StoreError> {
        let _write = self.write.lock();
        if self.active.load().id == id {
            return Err(StoreError::Corrupt {
                table: "model_versions",
                reason: format!("refusing to discard active version {}", id),
            });
        }
        self.update_locked(id, |v| v.discarded = true)?;
        info!(version = id, "Discarded model version");
        Ok(())
    }

    /// Make `id` the active version: one transaction, then one pointer swap
    pub(crate) fn activate(&self, id: &str) -> Result<Arc<ModelVersion>, StoreError> {
        let _write = self.write.lock();
        let version = self.get(id)?.ok_or_else(|| StoreError::Corrupt {
            table: "model_versions",
            reason: format!("unknown version {}", id),
        })?;
        self.store.activate_version(id)?;
        let active = Arc::new(ModelVersion { active: true, ..version });
        let previous = self.active.swap(active.clone());
        info!(version = id, previous = %previous.id, "Activated model version");
        Ok(active)
    }

    fn update(&self, id: &str, change: impl FnOnce(&mut ModelVersion)) -> Result<(), StoreError> {
        let _write = self.write.lock();
        self.update_locked(id, change)
    }

    fn update_locked(&self, id: &str, change: impl FnOnce(&mut ModelVersion)) -> Result<(), StoreError> {
        let mut version = self.get(id)?.ok_or_else(|| StoreError::Corrupt {
            table: "model_versions",
            reason: format!("unknown version {}", id),
        })?;
        change(&mut version);
        self.store.save_version(&version)?;
        if self.active.load().id == id {
            self.active.store(Arc::new(ModelVersion { active: true, ..version }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (ModelRegistry, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        (ModelRegistry::open(store.clone(), "qwen2.5:7b").unwrap(), store)
    }

    #[test]
    fn test_base_version_created_once() {
        let (registry, store) = registry();
        assert_eq!(registry.active().id, BASE_VERSION_ID);
        assert_eq!(registry.active_ref(), "qwen2.5:7b");

        let reopened = ModelRegistry::open(store, "other").unwrap();
        assert_eq!(reopened.active_ref(), "qwen2.5:7b");
        assert_eq!(reopened.history().unwrap().len(), 1);
    }

    #[test]
    fn test_activate_swaps_pointer_and_keeps_history() {
        let (registry, store) = registry();
        registry.register_candidate("v2", BASE_VERSION_ID).unwrap();
        registry.set_artifact("v2", "/models/v2.gguf").unwrap();
        registry.activate("v2").unwrap();

        assert_eq!(registry.active_ref(), "/models/v2.gguf");
        let active: Vec<_> = store.load_versions().unwrap().into_iter().filter(|v| v.active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "v2");

        assert_eq!(registry.history().unwrap().len(), 2);
        assert!(!registry.get(BASE_VERSION_ID).unwrap().unwrap().active);
    }

    #[test]
    fn test_concurrent_activations_keep_store_and_pointer_in_step() {
        let (registry, store) = registry();
        let registry = Arc::new(registry);
        registry.register_candidate("v2", BASE_VERSION_ID).unwrap();

        std::thread::scope(|scope| {
            for i in 0..8 {
                let registry = registry.clone();
                scope.spawn(move || {
                    let id = if i % 2 == 0 { "v2" } else { BASE_VERSION_ID };
                    for _ in 0..20 {
                        registry.activate(id).unwrap();
                    }
                });
            }
        });

        let active: Vec<_> = store.load_versions().unwrap().into_iter().filter(|v| v.active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, registry.active().id);
    }

    #[test]
    fn test_discard_keeps_active() {
        let (registry, _) = registry();
        registry.register_candidate("v2", BASE_VERSION_ID).unwrap();
        registry.discard("v2").unwrap();
        assert!(registry.get("v2").unwrap().unwrap().discarded);
        assert!(registry.discard(BASE_VERSION_ID).is_err());
        assert_eq!(registry.active().id, BASE_VERSION_ID);
    }

    #[test]
    fn test_register_candidate_is_idempotent() {
        let (registry, _) = registry();
        registry.register_candidate("run-1-candidate", BASE_VERSION_ID).unwrap();
        registry.set_score("run-1-candidate", 0.5).unwrap();
        let again = registry.register_candidate("run-1-candidate", BASE_VERSION_ID).unwrap();
        assert_eq!(again.score, Some(0.5));
    }
}
