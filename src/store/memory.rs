//! In-memory document store for tests and ephemeral deployments.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::{
    Collaborator, Document, DocumentDefaults, DocumentPatch, DocumentStore, HistoryEntry,
    StoreError, StoreResult,
};

/// DashMap-backed store; nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    documents: DashMap<String, Document>,
    histories: DashMap<String, Vec<HistoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_or_create(&self, id: &str, defaults: DocumentDefaults) -> StoreResult<Document> {
        let doc = self
            .documents
            .entry(id.to_string())
            .or_insert_with(|| Document::new(id, defaults))
            .clone();
        Ok(doc)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Document>> {
        Ok(self.documents.get(id).map(|d| d.clone()))
    }

    async fn update(
        &self,
        id: &str,
        patch: DocumentPatch,
        modified_by: &str,
    ) -> StoreResult<Document> {
        let mut entry = self
            .documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if let Some(displaced) = entry.apply(&patch, modified_by, Utc::now()) {
            self.histories
                .entry(id.to_string())
                .or_default()
                .push(displaced);
        }

        Ok(entry.clone())
    }

    async fn add_collaborator(&self, id: &str, email: &str) -> StoreResult<Vec<Collaborator>> {
        let mut entry = self
            .documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        entry.enroll(Collaborator::writer(email));
        entry.updated_at = Utc::now();

        Ok(entry.collaborators.clone())
    }

    async fn history(&self, id: &str) -> StoreResult<Vec<HistoryEntry>> {
        Ok(self
            .histories
            .get(id)
            .map(|h| h.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> DocumentDefaults {
        DocumentDefaults::new("Untitled Document", "<p></p>")
    }

    #[tokio::test]
    async fn test_find_or_create_is_idempotent() {
        let store = MemoryStore::new();

        let first = store.find_or_create("d1", defaults()).await.unwrap();
        store
            .update("d1", DocumentPatch::content("<p>edited</p>"), "alice")
            .await
            .unwrap();

        // Second call must return the existing document, not recreate it.
        let second = store.find_or_create("d1", defaults()).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.content, "<p>edited</p>");
        assert_eq!(store.document_count(), 1);
    }

    #[tokio::test]
    async fn test_get_unknown_is_none() {
        let store = MemoryStore::new();
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_is_not_found() {
        let store = MemoryStore::new();
        let result = store
            .update("missing", DocumentPatch::content("x"), "alice")
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_appends_history_only_on_change() {
        let store = MemoryStore::new();
        store.find_or_create("d1", defaults()).await.unwrap();

        store
            .update("d1", DocumentPatch::content("<p>v2</p>"), "alice")
            .await
            .unwrap();
        store
            .update("d1", DocumentPatch::content("<p>v2</p>"), "bob")
            .await
            .unwrap();
        let doc = store
            .update("d1", DocumentPatch::content("<p>v3</p>"), "bob")
            .await
            .unwrap();

        assert_eq!(doc.version, 3);

        let history = store.history("d1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "<p></p>");
        assert_eq!(history[0].modified_by, "alice");
        assert_eq!(history[1].content, "<p>v2</p>");
        assert_eq!(history[1].modified_by, "bob");
    }

    #[tokio::test]
    async fn test_add_collaborator_idempotent() {
        let store = MemoryStore::new();
        store.find_or_create("d1", defaults()).await.unwrap();

        let list = store.add_collaborator("d1", "a@b.c").await.unwrap();
        assert_eq!(list.len(), 1);

        let list = store.add_collaborator("d1", "a@b.c").await.unwrap();
        assert_eq!(list.len(), 1);

        let list = store.add_collaborator("d1", "d@e.f").await.unwrap();
        assert_eq!(list.len(), 2);
    }
}
