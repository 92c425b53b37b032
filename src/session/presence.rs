//! Presence and cursor tracking for document rooms.
//!
//! All state here is ephemeral: membership and cursor positions live for
//! the process lifetime at most and are torn down when the last member
//! of a document leaves. Nothing in this module is persisted.

use dashmap::DashMap;
use std::sync::Arc;

use super::protocol::{CursorBroadcast, PresenceEntry, SelectionRange};
use super::{ConnectionId, DocumentId, Identity};

/// One active connection's membership in a document room.
#[derive(Debug, Clone)]
pub struct Member {
    pub connection_id: ConnectionId,
    /// Stable identity key (principal id or email).
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub color: String,
}

impl Member {
    pub fn new(connection_id: impl Into<String>, identity: &Identity) -> Self {
        Self {
            connection_id: connection_id.into(),
            user_id: identity.key().to_string(),
            username: identity.display_name().to_string(),
            email: identity.email().to_string(),
            color: identity.color().to_string(),
        }
    }

    pub fn to_entry(&self) -> PresenceEntry {
        PresenceEntry {
            id: self.user_id.clone(),
            username: self.username.clone(),
            email: self.email.clone(),
            color: self.color.clone(),
        }
    }
}

/// Last known cursor position for one connection. Never persisted;
/// removed silently when the connection leaves.
#[derive(Debug, Clone)]
pub struct CursorEntry {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub username: String,
    pub position: SelectionRange,
    pub color: String,
}

impl CursorEntry {
    pub fn to_broadcast(&self) -> CursorBroadcast {
        CursorBroadcast {
            id: self.user_id.clone(),
            username: self.username.clone(),
            position: self.position,
            color: self.color.clone(),
        }
    }
}

/// Membership and cursor state for one document room.
#[derive(Debug)]
pub struct DocumentSession {
    document_id: DocumentId,
    members: DashMap<ConnectionId, Member>,
    cursors: DashMap<ConnectionId, CursorEntry>,
}

impl DocumentSession {
    fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            members: DashMap::new(),
            cursors: DashMap::new(),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Insert membership; idempotent per connection.
    pub fn add_member(&self, member: Member) {
        self.members.insert(member.connection_id.clone(), member);
    }

    /// Delete membership; returns false when the connection was not a member.
    pub fn remove_member(&self, connection_id: &str) -> bool {
        self.members.remove(connection_id).is_some()
    }

    pub fn is_member(&self, connection_id: &str) -> bool {
        self.members.contains_key(connection_id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member_connection_ids(&self) -> Vec<ConnectionId> {
        self.members.iter().map(|m| m.key().clone()).collect()
    }

    pub fn presence_entries(&self) -> Vec<PresenceEntry> {
        self.members.iter().map(|m| m.to_entry()).collect()
    }

    /// Overwrite the single stored cursor position for a connection.
    pub fn update_cursor(&self, entry: CursorEntry) {
        self.cursors.insert(entry.connection_id.clone(), entry);
    }

    /// Remove a connection's cursor; no broadcast is owed for removal.
    pub fn clear_cursor(&self, connection_id: &str) {
        self.cursors.remove(connection_id);
    }

    pub fn cursors(&self) -> Vec<CursorBroadcast> {
        self.cursors.iter().map(|c| c.to_broadcast()).collect()
    }
}

/// Owner of all per-document session state, keyed by document id.
///
/// One instance per process; the collaboration gateway's join/leave hooks
/// are the only writers. No ambient static state — tests construct and
/// tear down their own manager.
#[derive(Default)]
pub struct SessionManager {
    documents: DashMap<DocumentId, Arc<DocumentSession>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, document_id: &str) -> Arc<DocumentSession> {
        self.documents
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(DocumentSession::new(document_id)))
            .clone()
    }

    pub fn get(&self, document_id: &str) -> Option<Arc<DocumentSession>> {
        self.documents.get(document_id).map(|s| s.clone())
    }

    /// Tear down the map entry when the room has emptied, bounding memory.
    /// Returns true when an entry was removed.
    pub fn remove_if_empty(&self, document_id: &str) -> bool {
        self.documents
            .remove_if(document_id, |_, session| session.is_empty())
            .is_some()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn total_member_count(&self) -> usize {
        self.documents.iter().map(|s| s.member_count()).sum()
    }

    /// Teardown hook for tests.
    pub fn clear(&self) {
        self.documents.clear();
    }
}
