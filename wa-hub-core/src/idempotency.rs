//! Persistent idempotency-key store.
//!
//! Backing store is a single JSON file, read once lazily into memory and
//! rewritten on change through a debounced background save task.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, warn};

use wa_hub_model::{IdempotencyRecord, IdempotencyStatus};

const SAVE_DEBOUNCE: Duration = Duration::from_millis(250);
const DEFAULT_MAX_AGE: chrono::Duration = chrono::Duration::days(7);
const DEFAULT_STALE_QUEUED: chrono::Duration = chrono::Duration::hours(1);

pub struct IdempotencyStore {
    path: PathBuf,
    records: RwLock<HashMap<String, IdempotencyRecord>>,
    save_tx: mpsc::UnboundedSender<()>,
}

impl IdempotencyStore {
    /// Load (or lazily create) the store at `path` and spawn its debounced
    /// save task.
    pub async fn open(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();
        let records = Self::load_from_disk(&path).await;

        let (save_tx, mut save_rx) = mpsc::unbounded_channel::<()>();
        let store = Arc::new(Self {
            path: path.clone(),
            records: RwLock::new(records),
            save_tx,
        });

        let background = Arc::clone(&store);
        tokio::spawn(async move {
            while save_rx.recv().await.is_some() {
                // Debounce: drain any additional pending signals that arrived
                // while we were waiting, then sleep once before writing.
                tokio::time::sleep(SAVE_DEBOUNCE).await;
                while save_rx.try_recv().is_ok() {}
                if let Err(err) = background.save_now().await {
                    // Save errors are logged but never throw — at-most-once
                    // is preserved in memory for the life of the process.
                    error!(error = %err, "failed to persist idempotency store");
                }
            }
        });

        store
    }

    async fn load_from_disk(path: &Path) -> HashMap<String, IdempotencyRecord> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
            Err(err) => {
                warn!(error = %err, path = %path.display(), "failed to read idempotency store, starting empty");
                return HashMap::new();
            }
        };

        match serde_json::from_slice::<Vec<IdempotencyRecord>>(&bytes) {
            Ok(list) => list.into_iter().map(|r| (r.key.clone(), r)).collect(),
            Err(err) => {
                warn!(error = %err, "idempotency store corrupted, quarantining and starting empty");
                let corrupted = path.with_extension(format!(
                    "corrupted.{}",
                    Utc::now().timestamp()
                ));
                if let Err(rename_err) = tokio::fs::rename(path, &corrupted).await {
                    warn!(error = %rename_err, "failed to quarantine corrupted idempotency store");
                }
                HashMap::new()
            }
        }
    }

    fn schedule_save(&self) {
        // An unbounded sender never blocks; a full channel can't happen, and
        // a closed receiver only happens during shutdown, in which case the
        // final in-memory state is lost along with the process — at-most-once
        // is only preserved for the lifetime of the process, not across a
        // crash between the last upsert and the next debounced save.
        let _ = self.save_tx.send(());
    }

    async fn save_now(&self) -> std::io::Result<()> {
        let snapshot: Vec<IdempotencyRecord> = {
            let records = self.records.read().await;
            records.values().cloned().collect()
        };
        let body = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }

    pub async fn get(&self, key: &str) -> Option<IdempotencyRecord> {
        self.records.read().await.get(key).cloned()
    }

    pub async fn is_sent(&self, key: &str) -> bool {
        matches!(
            self.records.read().await.get(key),
            Some(r) if r.status == IdempotencyStatus::Sent
        )
    }

    pub async fn is_queued(&self, key: &str) -> bool {
        self.is_queued_stale(key, DEFAULT_STALE_QUEUED).await
    }

    pub async fn is_queued_stale(&self, key: &str, stale: chrono::Duration) -> bool {
        match self.records.read().await.get(key) {
            Some(r) if r.status == IdempotencyStatus::Queued => {
                Utc::now() - r.created_at < stale
            }
            _ => false,
        }
    }

    /// Create or merge a record by key, enforcing the "never regress from
    /// SENT" invariant.
    pub async fn upsert(&self, mut record: IdempotencyRecord) {
        {
            let mut records = self.records.write().await;
            if let Some(existing) = records.get(&record.key) {
                if !existing.status.may_transition_to(record.status) {
                    return;
                }
            }
            record.updated_at = Utc::now();
            records.insert(record.key.clone(), record);
        }
        self.schedule_save();
    }

    pub async fn mark_sent(&self, key: &str, provider_id: impl Into<String>) {
        self.mutate_status(key, IdempotencyStatus::Sent, |r| {
            r.provider_message_id = Some(provider_id.into());
            r.sent_at = Some(Utc::now());
        })
        .await;
    }

    pub async fn mark_failed(&self, key: &str, err: impl Into<String>) {
        self.mutate_status(key, IdempotencyStatus::Failed, |r| {
            r.error = Some(err.into());
        })
        .await;
    }

    pub async fn mark_skipped(&self, key: &str, reason: impl Into<String>) {
        self.mutate_status(key, IdempotencyStatus::Skipped, |r| {
            r.error = Some(reason.into());
        })
        .await;
    }

    async fn mutate_status(
        &self,
        key: &str,
        status: IdempotencyStatus,
        apply: impl FnOnce(&mut IdempotencyRecord),
    ) {
        let changed = {
            let mut records = self.records.write().await;
            match records.get_mut(key) {
                Some(record) if record.status.may_transition_to(status) => {
                    record.status = status;
                    record.updated_at = Utc::now();
                    apply(record);
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.schedule_save();
        }
    }

    /// Remove records older than `max_age`. Called once at startup.
    pub async fn cleanup(&self, max_age: chrono::Duration) -> usize {
        let removed = {
            let mut records = self.records.write().await;
            let before = records.len();
            let cutoff = Utc::now() - max_age;
            records.retain(|_, r| r.created_at >= cutoff);
            before - records.len()
        };
        if removed > 0 {
            self.schedule_save();
        }
        removed
    }

    pub async fn cleanup_default(&self) -> usize {
        self.cleanup(DEFAULT_MAX_AGE).await
    }

    /// Remove all records for a deleted instance.
    pub async fn delete_by_instance_name(&self, instance_name: &str) {
        {
            let mut records = self.records.write().await;
            records.retain(|_, r| r.instance_name != instance_name);
        }
        self.schedule_save();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn store_at(dir: &tempfile::TempDir) -> Arc<IdempotencyStore> {
        IdempotencyStore::open(dir.path().join("idempotency.json")).await
    }

    #[tokio::test]
    async fn sent_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(&dir).await;
        let record = IdempotencyRecord::new_queued("k1", "inst", Uuid::now_v7());
        store.upsert(record).await;
        store.mark_sent("k1", "provider-1").await;
        assert!(store.is_sent("k1").await);

        store.mark_failed("k1", "should not apply").await;
        assert!(store.is_sent("k1").await);
        assert_eq!(
            store.get("k1").await.unwrap().provider_message_id.as_deref(),
            Some("provider-1")
        );
    }

    #[tokio::test]
    async fn delete_by_instance_removes_only_matching_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(&dir).await;
        store
            .upsert(IdempotencyRecord::new_queued("a", "inst-1", Uuid::now_v7()))
            .await;
        store
            .upsert(IdempotencyRecord::new_queued("b", "inst-2", Uuid::now_v7()))
            .await;

        store.delete_by_instance_name("inst-1").await;

        assert!(store.get("a").await.is_none());
        assert!(store.get("b").await.is_some());
    }

    #[tokio::test]
    async fn corrupted_file_starts_empty_and_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idempotency.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let store = IdempotencyStore::open(&path).await;
        assert!(store.get("anything").await.is_none());

        let mut saw_quarantine = false;
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if entry
                .file_name()
                .to_string_lossy()
                .contains("corrupted")
            {
                saw_quarantine = true;
            }
        }
        assert!(saw_quarantine);
    }
}
