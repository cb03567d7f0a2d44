//! Durable checkpoint store for jobs and items
//!
//! Every item state transition is written through this store, and restart
//! recovery rebuilds all in-memory state purely from what it holds. The
//! trait demands only atomic-claim and durable-write semantics; the bundled
//! implementation keeps one JSON document per job and makes writes durable
//! with a temp-file-then-rename.

use crate::error::CaptureError;
use crate::job::{Item, ItemState, Job, Lease};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a new job together with its enumerated pending items.
    async fn create_job(&self, job: &Job, items: &[Item]) -> Result<(), CaptureError>;

    async fn load_job(&self, job_id: &str) -> Result<Job, CaptureError>;

    async fn save_job(&self, job: &Job) -> Result<(), CaptureError>;

    /// Atomically claim an item for `owner`: compare-and-swap from Pending
    /// (or InProgress with an expired lease) to InProgress with a fresh
    /// lease. Returns false when another worker owns the item or the item is
    /// already terminal.
    async fn claim_item(
        &self,
        job_id: &str,
        item_id: &str,
        owner: &str,
        lease_ttl: Duration,
    ) -> Result<bool, CaptureError>;

    /// Durably record an item's latest state. Clears the lease once the
    /// item is terminal.
    async fn write_checkpoint(&self, job_id: &str, item: &Item) -> Result<(), CaptureError>;

    /// All item records for a job, in enumeration order. Used on resume.
    async fn list_items(&self, job_id: &str) -> Result<Vec<Item>, CaptureError>;
}

/// On-disk layout: the whole job in one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobDocument {
    job: Job,
    items: Vec<Item>,
}

/// File-backed checkpoint store: one JSON document per job under `data_dir`.
///
/// A single lock guards the working set so claims are CAS against the same
/// state that gets persisted; writes go to a temp file and are renamed into
/// place so a crash mid-write never corrupts the previous checkpoint.
pub struct FileCheckpointStore {
    data_dir: PathBuf,
    docs: Mutex<HashMap<String, JobDocument>>,
}

impl FileCheckpointStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            docs: Mutex::new(HashMap::new()),
        }
    }

    fn doc_path(&self, job_id: &str) -> PathBuf {
        self.data_dir.join(format!("{job_id}.json"))
    }

    async fn persist(&self, doc: &JobDocument) -> Result<(), CaptureError> {
        let path = self.doc_path(&doc.job.job_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|e| CaptureError::CheckpointWrite(e.to_string()))?;

        fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| CaptureError::CheckpointWrite(e.to_string()))?;
        fs::write(&tmp, &bytes)
            .await
            .map_err(|e| CaptureError::CheckpointWrite(e.to_string()))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| CaptureError::CheckpointWrite(e.to_string()))
    }

    /// Load a job document into the working set if it is not there yet.
    async fn ensure_loaded(
        &self,
        docs: &mut HashMap<String, JobDocument>,
        job_id: &str,
    ) -> Result<(), CaptureError> {
        if docs.contains_key(job_id) {
            return Ok(());
        }
        let path = self.doc_path(job_id);
        let bytes = fs::read(&path)
            .await
            .map_err(|_| CaptureError::JobNotFound(job_id.to_string()))?;
        let doc: JobDocument = serde_json::from_slice(&bytes)?;
        docs.insert(job_id.to_string(), doc);
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn create_job(&self, job: &Job, items: &[Item]) -> Result<(), CaptureError> {
        let mut docs = self.docs.lock().await;
        let doc = JobDocument {
            job: job.clone(),
            items: items.to_vec(),
        };
        self.persist(&doc).await?;
        docs.insert(job.job_id.clone(), doc);
        debug!("Created job document {} with {} items", job.job_id, items.len());
        Ok(())
    }

    async fn load_job(&self, job_id: &str) -> Result<Job, CaptureError> {
        let mut docs = self.docs.lock().await;
        self.ensure_loaded(&mut docs, job_id).await?;
        Ok(docs[job_id].job.clone())
    }

    async fn save_job(&self, job: &Job) -> Result<(), CaptureError> {
        let mut docs = self.docs.lock().await;
        self.ensure_loaded(&mut docs, &job.job_id).await?;
        let doc = docs
            .get_mut(&job.job_id)
            .ok_or_else(|| CaptureError::JobNotFound(job.job_id.clone()))?;
        doc.job = job.clone();
        let snapshot = doc.clone();
        self.persist(&snapshot).await
    }

    async fn claim_item(
        &self,
        job_id: &str,
        item_id: &str,
        owner: &str,
        lease_ttl: Duration,
    ) -> Result<bool, CaptureError> {
        let mut docs = self.docs.lock().await;
        self.ensure_loaded(&mut docs, job_id).await?;
        let doc = docs
            .get_mut(job_id)
            .ok_or_else(|| CaptureError::JobNotFound(job_id.to_string()))?;

        let now = Utc::now();
        let item = doc
            .items
            .iter_mut()
            .find(|i| i.item_id == item_id)
            .ok_or_else(|| CaptureError::ItemNotFound(item_id.to_string()))?;

        if !item.is_claimable(now) {
            return Ok(false);
        }

        item.state = ItemState::InProgress;
        item.lease = Some(Lease {
            owner: owner.to_string(),
            expires_at: now
                + chrono::Duration::from_std(lease_ttl)
                    .map_err(|e| CaptureError::CheckpointWrite(e.to_string()))?,
        });
        item.checkpoint_version += 1;
        item.updated_at = now;

        let snapshot = doc.clone();
        self.persist(&snapshot).await?;
        debug!("Item {} claimed by {}", item_id, owner);
        Ok(true)
    }

    async fn write_checkpoint(&self, job_id: &str, item: &Item) -> Result<(), CaptureError> {
        let mut docs = self.docs.lock().await;
        self.ensure_loaded(&mut docs, job_id).await?;
        let doc = docs
            .get_mut(job_id)
            .ok_or_else(|| CaptureError::JobNotFound(job_id.to_string()))?;

        let slot = doc
            .items
            .iter_mut()
            .find(|i| i.item_id == item.item_id)
            .ok_or_else(|| CaptureError::ItemNotFound(item.item_id.clone()))?;

        let mut record = item.clone();
        record.checkpoint_version = slot.checkpoint_version + 1;
        record.updated_at = Utc::now();
        if record.state.is_terminal() {
            record.lease = None;
        }
        *slot = record;

        let snapshot = doc.clone();
        self.persist(&snapshot).await
    }

    async fn list_items(&self, job_id: &str) -> Result<Vec<Item>, CaptureError> {
        let mut docs = self.docs.lock().await;
        self.ensure_loaded(&mut docs, job_id).await?;
        Ok(docs[job_id].items.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobSpec;
    use crate::job::{ItemKind, Tweet};

    fn sample_job_and_items(n: usize) -> (Job, Vec<Item>) {
        let spec = JobSpec {
            accounts: vec!["nasa".to_string()],
            days_back: 7,
            max_tweets_per_account: 50,
            concurrency: None,
        };
        let mut job = Job::new(&spec);
        let items: Vec<Item> = (0..n)
            .map(|i| {
                Item::from_tweet(&Tweet {
                    id: format!("id-{i}"),
                    account: "nasa".to_string(),
                    kind: ItemKind::Tweet,
                    created_at: Utc::now(),
                })
            })
            .collect();
        job.total_items = items.len();
        (job, items)
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let (job, items) = sample_job_and_items(1);
        store.create_job(&job, &items).await.unwrap();

        let ttl = Duration::from_secs(60);
        assert!(store.claim_item(&job.job_id, "id-0", "w1", ttl).await.unwrap());
        assert!(!store.claim_item(&job.job_id, "id-0", "w2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let (job, items) = sample_job_and_items(1);
        store.create_job(&job, &items).await.unwrap();

        assert!(store
            .claim_item(&job.job_id, "id-0", "w1", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store
            .claim_item(&job.job_id, "id-0", "w2", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn claim_on_succeeded_item_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let (job, mut items) = sample_job_and_items(1);
        store.create_job(&job, &items).await.unwrap();

        items[0].state = ItemState::Succeeded;
        store.write_checkpoint(&job.job_id, &items[0]).await.unwrap();

        assert!(!store
            .claim_item(&job.job_id, "id-0", "w1", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn checkpoints_survive_a_new_store_instance() {
        let dir = tempfile::tempdir().unwrap();
        let (job, mut items) = sample_job_and_items(2);

        {
            let store = FileCheckpointStore::new(dir.path());
            store.create_job(&job, &items).await.unwrap();
            items[0].state = ItemState::Succeeded;
            items[0].artifact_keys = vec!["k1".to_string()];
            store.write_checkpoint(&job.job_id, &items[0]).await.unwrap();
        }

        // Fresh instance over the same directory, as after a process restart.
        let store = FileCheckpointStore::new(dir.path());
        let restored = store.list_items(&job.job_id).await.unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].state, ItemState::Succeeded);
        assert_eq!(restored[0].artifact_keys, vec!["k1".to_string()]);
        assert_eq!(restored[1].state, ItemState::Pending);
        assert!(store.load_job(&job.job_id).await.is_ok());
    }

    #[tokio::test]
    async fn write_checkpoint_bumps_version_and_clears_terminal_lease() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let (job, mut items) = sample_job_and_items(1);
        store.create_job(&job, &items).await.unwrap();

        store
            .claim_item(&job.job_id, "id-0", "w1", Duration::from_secs(60))
            .await
            .unwrap();

        items[0].state = ItemState::Succeeded;
        store.write_checkpoint(&job.job_id, &items[0]).await.unwrap();

        let restored = store.list_items(&job.job_id).await.unwrap();
        assert!(restored[0].lease.is_none());
        assert_eq!(restored[0].checkpoint_version, 2);
    }

    #[tokio::test]
    async fn unknown_job_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let err = store.load_job("nope").await.unwrap_err();
        assert!(matches!(err, CaptureError::JobNotFound(_)));
    }
}
