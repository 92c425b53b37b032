//! Sled-backed document store for durable single-node persistence.
//!
//! Documents and history snapshots live in separate named trees, encoded
//! with bincode. History keys are `{document_id}:{version:020}` so a
//! prefix scan yields entries in version order.

use chrono::Utc;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use super::{
    Collaborator, Document, DocumentDefaults, DocumentPatch, DocumentStore, HistoryEntry,
    StoreError, StoreResult,
};

const TREE_DOCUMENTS: &str = "documents";
const TREE_HISTORY: &str = "history";

/// Configuration for the sled storage layer.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the sled database directory.
    pub path: String,
    /// Cache size in bytes.
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = sled default).
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/documents.sled".to_string(),
            cache_size: 64 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }
}

/// Sled-based document store.
///
/// Update operations are plain read-modify-write; concurrent updates to
/// the same document resolve last-writer-wins, which is the documented
/// conflict policy of the session layer.
#[derive(Clone)]
pub struct SledStore {
    db: Arc<Db>,
    documents: Tree,
    history: Tree,
}

impl SledStore {
    /// Open or create a store at the configured path.
    pub fn open(config: StorageConfig) -> StoreResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let documents = db.open_tree(TREE_DOCUMENTS)?;
        let history = db.open_tree(TREE_HISTORY)?;

        Ok(Self {
            db: Arc::new(db),
            documents,
            history,
        })
    }

    /// Open with default configuration.
    pub fn open_default() -> StoreResult<Self> {
        Self::open(StorageConfig::default())
    }

    /// Force flush all pending writes to disk.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn read_document(&self, id: &str) -> StoreResult<Option<Document>> {
        match self.documents.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_document(&self, doc: &Document) -> StoreResult<()> {
        let bytes = bincode::serialize(doc)?;
        self.documents.insert(doc.id.as_bytes(), bytes)?;
        Ok(())
    }

    fn append_history(&self, id: &str, entry: &HistoryEntry) -> StoreResult<()> {
        let key = format!("{}:{:020}", id, entry.version);
        let bytes = bincode::serialize(entry)?;
        self.history.insert(key.as_bytes(), bytes)?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SledStore {
    async fn find_or_create(&self, id: &str, defaults: DocumentDefaults) -> StoreResult<Document> {
        if let Some(doc) = self.read_document(id)? {
            return Ok(doc);
        }

        let doc = Document::new(id, defaults);
        self.write_document(&doc)?;
        Ok(doc)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Document>> {
        self.read_document(id)
    }

    async fn update(
        &self,
        id: &str,
        patch: DocumentPatch,
        modified_by: &str,
    ) -> StoreResult<Document> {
        let mut doc = self
            .read_document(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if let Some(displaced) = doc.apply(&patch, modified_by, Utc::now()) {
            self.append_history(id, &displaced)?;
        }

        self.write_document(&doc)?;
        Ok(doc)
    }

    async fn add_collaborator(&self, id: &str, email: &str) -> StoreResult<Vec<Collaborator>> {
        let mut doc = self
            .read_document(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if doc.enroll(Collaborator::writer(email)) {
            doc.updated_at = Utc::now();
            self.write_document(&doc)?;
        }

        Ok(doc.collaborators)
    }

    async fn history(&self, id: &str) -> StoreResult<Vec<HistoryEntry>> {
        let prefix = format!("{}:", id);
        let mut entries = Vec::new();

        for item in self.history.scan_prefix(prefix.as_bytes()) {
            let (_, value) = item?;
            entries.push(bincode::deserialize(&value)?);
        }

        Ok(entries)
    }
}

impl Drop for SledStore {
    fn drop(&mut self) {
        // Best-effort flush; never panic on teardown.
        let _ = self.flush();
    }
}
