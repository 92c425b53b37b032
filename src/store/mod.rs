//! Persistent document storage behind an async CRUD contract.
//!
//! The session layer never talks to a database directly; it consumes the
//! [`DocumentStore`] trait. Two adapters are provided: an in-memory store
//! for tests and ephemeral deployments, and a sled-backed store for
//! durable single-node persistence.
//!
//! The version/history invariant lives in one place — [`Document::apply`] —
//! so every adapter appends history exactly when persisted content changes.

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::{SledStore, StorageConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::Identity;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Permission level granted to a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

impl Permission {
    pub fn can_edit(self) -> bool {
        matches!(self, Permission::Write | Permission::Admin)
    }
}

/// An identity granted some permission level on a document, distinct from
/// transient room membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub email: String,
    pub permission: Permission,
}

impl Collaborator {
    pub fn writer(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            permission: Permission::Write,
        }
    }
}

/// One prior content snapshot, appended when a persisted update changed
/// the content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The version the document reached when this snapshot was displaced.
    pub version: u64,
    /// The content as it was before the update.
    pub content: String,
    /// Identity key of the editor whose update displaced it.
    pub modified_by: String,
    pub timestamp: DateTime<Utc>,
}

/// A stored document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
    /// Identity key of the creator; None for anonymous creations without
    /// an email.
    pub owner: Option<String>,
    pub is_public: bool,
    pub collaborators: Vec<Collaborator>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(id: impl Into<String>, defaults: DocumentDefaults) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: defaults.title,
            content: defaults.content,
            owner: defaults.owner,
            is_public: defaults.is_public,
            collaborators: defaults.collaborators,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a patch, returning the history entry to append when the
    /// content actually changed. `version` increments exactly once per
    /// returned entry; a patch carrying identical content returns None
    /// and leaves the version untouched.
    pub fn apply(
        &mut self,
        patch: &DocumentPatch,
        modified_by: &str,
        now: DateTime<Utc>,
    ) -> Option<HistoryEntry> {
        let mut displaced = None;

        if let Some(content) = &patch.content {
            if *content != self.content {
                displaced = Some(HistoryEntry {
                    version: self.version + 1,
                    content: std::mem::replace(&mut self.content, content.clone()),
                    modified_by: modified_by.to_string(),
                    timestamp: now,
                });
                self.version += 1;
            }
        }

        if let Some(title) = &patch.title {
            self.title = title.clone();
        }

        self.updated_at = now;
        displaced
    }

    /// Enroll a collaborator; returns false when the email is already
    /// present (dedup by identity).
    pub fn enroll(&mut self, collaborator: Collaborator) -> bool {
        if self
            .collaborators
            .iter()
            .any(|c| c.email == collaborator.email)
        {
            return false;
        }
        self.collaborators.push(collaborator);
        true
    }

    fn collaborator(&self, email: &str) -> Option<&Collaborator> {
        self.collaborators.iter().find(|c| c.email == email)
    }

    /// Owner, enrolled collaborator, or public document.
    pub fn can_read(&self, identity: &Identity) -> bool {
        match identity {
            Identity::Anonymous { .. } => true,
            Identity::Authenticated { id, email, .. } => {
                self.owner.as_deref() == Some(id)
                    || self.collaborator(email).is_some()
                    || self.is_public
            }
        }
    }

    /// Owner, or collaborator holding write/admin permission.
    pub fn can_edit(&self, identity: &Identity) -> bool {
        match identity {
            Identity::Anonymous { .. } => true,
            Identity::Authenticated { id, email, .. } => {
                self.owner.as_deref() == Some(id)
                    || self
                        .collaborator(email)
                        .map(|c| c.permission.can_edit())
                        .unwrap_or(false)
            }
        }
    }
}

/// Initial field values for documents created on first access.
#[derive(Debug, Clone, Default)]
pub struct DocumentDefaults {
    pub title: String,
    pub content: String,
    pub owner: Option<String>,
    pub is_public: bool,
    pub collaborators: Vec<Collaborator>,
}

impl DocumentDefaults {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_collaborator(mut self, collaborator: Collaborator) -> Self {
        self.collaborators.push(collaborator);
        self
    }
}

/// Partial update applied by [`DocumentStore::update`].
#[derive(Debug, Clone, Default)]
pub struct DocumentPatch {
    pub title: Option<String>,
    pub content: Option<String>,
}

impl DocumentPatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            title: None,
            content: Some(content.into()),
        }
    }

    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            content: None,
        }
    }
}

/// Async CRUD contract consumed by the collaboration core.
///
/// No transactional multi-document guarantees; single-document
/// read-modify-write races resolve last-writer-wins.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch the document, creating it with the given defaults when the
    /// id is unknown.
    async fn find_or_create(&self, id: &str, defaults: DocumentDefaults) -> StoreResult<Document>;

    /// Fetch the document, or None for an unknown id.
    async fn get(&self, id: &str) -> StoreResult<Option<Document>>;

    /// Durably apply a patch, performing the version/history invariant.
    /// Fails with [`StoreError::NotFound`] for an unknown id.
    async fn update(
        &self,
        id: &str,
        patch: DocumentPatch,
        modified_by: &str,
    ) -> StoreResult<Document>;

    /// Idempotently enroll an email on the collaborator list; returns the
    /// updated list.
    async fn add_collaborator(&self, id: &str, email: &str) -> StoreResult<Vec<Collaborator>>;

    /// Prior content snapshots, ordered by version.
    async fn history(&self, id: &str) -> StoreResult<Vec<HistoryEntry>>;
}
