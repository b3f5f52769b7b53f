//! Persisted instance list: a single JSON file holding an array of instance
//! descriptors, written on every create/update/delete so a restart can
//! restore each instance without operator intervention.
//!
//! Writes are overwrite-with-rename, funneled entirely through
//! `InstanceManager` so concurrent writers never race.

use std::path::PathBuf;

use tokio::sync::RwLock;
use tracing::warn;
use wa_hub_model::Instance;

pub struct InstanceStore {
    path: PathBuf,
    instances: RwLock<Vec<Instance>>,
}

impl InstanceStore {
    /// Load (or tolerate an absent) instance list from `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let instances = Self::load_from_disk(&path).await;
        Self {
            path,
            instances: RwLock::new(instances),
        }
    }

    async fn load_from_disk(path: &std::path::Path) -> Vec<Instance> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(error = %err, path = %path.display(), "failed to read instance list, starting empty");
                return Vec::new();
            }
        };
        if bytes.is_empty() {
            return Vec::new();
        }
        match serde_json::from_slice(&bytes) {
            Ok(list) => list,
            Err(err) => {
                warn!(error = %err, "instance list corrupted, starting empty");
                Vec::new()
            }
        }
    }

    pub async fn list(&self) -> Vec<Instance> {
        self.instances.read().await.clone()
    }

    /// Insert or replace `instance` by id and persist (best-effort).
    pub async fn upsert(&self, instance: Instance) {
        {
            let mut instances = self.instances.write().await;
            if let Some(slot) = instances.iter_mut().find(|i| i.id == instance.id) {
                *slot = instance;
            } else {
                instances.push(instance);
            }
        }
        self.save_now().await;
    }

    pub async fn remove(&self, id: &wa_hub_model::InstanceId) {
        {
            let mut instances = self.instances.write().await;
            instances.retain(|i| &i.id != id);
        }
        self.save_now().await;
    }

    async fn save_now(&self) {
        let snapshot = self.instances.read().await.clone();
        let body = match serde_json::to_vec_pretty(&snapshot) {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "failed to serialize instance list");
                return;
            }
        };
        let tmp = self.path.with_extension("tmp");
        if let Err(err) = tokio::fs::write(&tmp, body).await {
            warn!(error = %err, "failed to write instance list temp file");
            return;
        }
        if let Err(err) = tokio::fs::rename(&tmp, &self.path).await {
            warn!(error = %err, "failed to rename instance list temp file into place");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use wa_hub_model::{InstanceId, WebhookConfig};

    fn instance(id: &str) -> Instance {
        Instance {
            id: InstanceId::parse(id).unwrap(),
            name: id.to_string(),
            created_at: chrono::Utc::now(),
            webhook: WebhookConfig::new("http://example.invalid").unwrap(),
            typing_enabled: true,
            typing_apply_to: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.json");

        let store = InstanceStore::open(&path).await;
        store.upsert(instance("a")).await;
        store.upsert(instance("b")).await;
        drop(store);

        let reopened = InstanceStore::open(&path).await;
        let listed = reopened.list().await;
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let store = InstanceStore::open(&path).await;
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn remove_drops_only_the_matching_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::open(dir.path().join("instances.json")).await;
        store.upsert(instance("a")).await;
        store.upsert(instance("b")).await;
        store.remove(&InstanceId::parse("a").unwrap()).await;
        let listed = store.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id.as_str(), "b");
    }
}
