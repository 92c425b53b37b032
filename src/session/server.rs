//! CollabServer: the per-document collaboration gateway.
//!
//! One instance per process owns every keyed collection in the session
//! layer: connection outboxes, per-document presence and cursors, and the
//! pending-write map. Handlers run on the tokio runtime and suspend only
//! at persistence calls; any handler that re-reads document state after a
//! suspension re-validates the permission it depends on.
//!
//! Conflict policy: concurrent edits fan out independently and the
//! debouncer keeps the last-scheduled snapshot, so persisted content is
//! last-writer-wins. This is a deliberate design choice, not a merge.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::debounce::ChangeDebouncer;
use super::presence::{CursorEntry, DocumentSession, Member, SessionManager};
use super::protocol::{ClientEvent, SelectionRange, ServerEvent};
use super::{CollabError, CollabResult, ConnectionId, DocumentId, Identity, SessionConfig};
use crate::store::{Collaborator, DocumentDefaults, DocumentPatch, DocumentStore};

/// One registered WebSocket connection with its outbox.
pub struct ConnectionHandle {
    pub connection_id: ConnectionId,
    /// Resolved at handshake in authenticated mode; may arrive with the
    /// join event in anonymous mode.
    pub identity: Option<Identity>,
    /// The single document this connection has joined, if any.
    pub document_id: Option<DocumentId>,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnectionHandle {
    fn new(
        connection_id: impl Into<String>,
        identity: Option<Identity>,
        tx: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            identity,
            document_id: None,
            tx,
        }
    }

    /// Fire-and-forget send; a closed channel means the transport is
    /// already tearing the connection down.
    fn send(&self, event: ServerEvent) -> CollabResult<()> {
        self.tx
            .send(event)
            .map_err(|_| CollabError::Closed(self.connection_id.clone()))
    }
}

/// Server statistics for the health endpoint.
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub active_documents: usize,
    pub active_connections: usize,
    pub total_members: usize,
}

/// The collaboration gateway: binds connections to document rooms and
/// dispatches named events to presence, fan-out, and persistence.
pub struct CollabServer {
    config: SessionConfig,
    connections: DashMap<ConnectionId, Arc<RwLock<ConnectionHandle>>>,
    sessions: SessionManager,
    debouncer: ChangeDebouncer,
    store: Arc<dyn DocumentStore>,
}

impl CollabServer {
    pub fn new(store: Arc<dyn DocumentStore>, config: SessionConfig) -> Self {
        let debouncer = ChangeDebouncer::new(store.clone(), config.debounce_quiet_period);
        Self {
            config,
            connections: DashMap::new(),
            sessions: SessionManager::new(),
            debouncer,
            store,
        }
    }

    /// Create with default configuration.
    pub fn with_store(store: Arc<dyn DocumentStore>) -> Self {
        Self::new(store, SessionConfig::default())
    }

    /// Bind a new connection's outbox. Identity is present for
    /// authenticated handshakes and for anonymous handshakes that carried
    /// an email; otherwise it must arrive with the join event.
    pub fn register(
        &self,
        connection_id: &str,
        identity: Option<Identity>,
        tx: mpsc::UnboundedSender<ServerEvent>,
    ) {
        let handle = ConnectionHandle::new(connection_id, identity, tx);
        self.connections
            .insert(connection_id.to_string(), Arc::new(RwLock::new(handle)));
        debug!("Connection registered: {}", connection_id);
    }

    /// Route one inbound event. Errors degrade to an `error` event on the
    /// triggering connection plus a log line; they never propagate out.
    pub async fn dispatch(&self, connection_id: &str, event: ClientEvent) {
        let result = match event {
            ClientEvent::JoinDocument {
                document_id,
                user_email,
            } => self.join_document(connection_id, &document_id, user_email).await,
            ClientEvent::ContentChange {
                document_id,
                content,
                sender,
            } => {
                self.content_change(connection_id, &document_id, content, sender)
                    .await
            }
            ClientEvent::TitleChange {
                document_id,
                title,
                sender,
            } => {
                self.title_change(connection_id, &document_id, title, sender)
                    .await
            }
            ClientEvent::CursorPosition {
                document_id,
                position,
            } => self.cursor_position(connection_id, &document_id, position),
            ClientEvent::SaveDocument {
                document_id,
                title,
                content,
            } => {
                self.save_document(connection_id, &document_id, title, content)
                    .await
            }
            ClientEvent::AddCollaborator { document_id, email } => {
                self.add_collaborator(connection_id, &document_id, &email).await
            }
        };

        if let Err(e) = result {
            warn!("Event from connection {} rejected: {}", connection_id, e);
            self.send_to(
                connection_id,
                ServerEvent::Error {
                    message: e.to_string(),
                },
            );
        }
    }

    /// Join a connection to a document room.
    ///
    /// Authenticated mode requires the document to exist and the identity
    /// to hold read access. Anonymous mode creates the document on first
    /// access and auto-enrolls the email as a collaborator.
    pub async fn join_document(
        &self,
        connection_id: &str,
        document_id: &str,
        user_email: Option<String>,
    ) -> CollabResult<()> {
        let handle = self.connection(connection_id)?;

        let identity = self.resolve_identity(&handle, user_email)?;

        // One join per socket lifetime; re-joining the same room is a no-op
        // short of refreshing state.
        if let Some(joined) = handle.read().document_id.clone() {
            if joined != document_id {
                return Err(CollabError::Forbidden(
                    "Connection already joined another document".to_string(),
                ));
            }
        }

        let document = match &identity {
            Identity::Anonymous { email } => {
                let defaults =
                    DocumentDefaults::new(&self.config.default_title, &self.config.default_content)
                        .with_owner(email.clone())
                        .with_collaborator(Collaborator::writer(email.clone()));
                let document = self.store.find_or_create(document_id, defaults).await?;

                // Pre-existing documents may not know this email yet.
                if !document.collaborators.iter().any(|c| c.email == *email) {
                    self.store.add_collaborator(document_id, email).await?;
                    self.store
                        .get(document_id)
                        .await?
                        .ok_or_else(|| CollabError::NotFound(document_id.to_string()))?
                } else {
                    document
                }
            }
            Identity::Authenticated { .. } => {
                let document = self
                    .store
                    .get(document_id)
                    .await?
                    .ok_or_else(|| CollabError::NotFound(document_id.to_string()))?;

                if !document.can_read(&identity) {
                    return Err(CollabError::Forbidden(
                        "Not authorized to access this document".to_string(),
                    ));
                }
                document
            }
        };

        let session = self.sessions.get_or_create(document_id);
        if !session.is_member(connection_id)
            && session.member_count() >= self.config.max_members_per_document
        {
            return Err(CollabError::Forbidden("Document room is full".to_string()));
        }

        session.add_member(Member::new(connection_id, &identity));
        handle.write().document_id = Some(document_id.to_string());

        // Initial state push to the joiner only: persisted state overlaid
        // with any pending debounced write, so the joiner never reads a
        // snapshot staler than the newest broadcast edit.
        let content = self
            .debouncer
            .pending_content(document_id)
            .unwrap_or(document.content);
        self.send_to(
            connection_id,
            ServerEvent::DocumentData {
                title: document.title,
                content,
            },
        );

        let cursors = session.cursors();
        if !cursors.is_empty() {
            self.send_to(connection_id, ServerEvent::CursorPositions { positions: cursors });
        }

        self.broadcast_presence(&session);

        if !identity.is_authenticated() {
            let document = self
                .store
                .get(document_id)
                .await?
                .ok_or_else(|| CollabError::NotFound(document_id.to_string()))?;
            self.broadcast_to_document(
                document_id,
                None,
                &ServerEvent::CollaboratorsUpdated {
                    collaborators: document.collaborators,
                },
            );
        }

        info!(
            "{} joined document {}",
            identity.display_name(),
            document_id
        );
        Ok(())
    }

    /// Full-content edit: fan out to peers, then coalesce into the
    /// debounced pending write. Fan-out is independent of durability.
    pub async fn content_change(
        &self,
        connection_id: &str,
        document_id: &str,
        content: String,
        sender: Option<String>,
    ) -> CollabResult<()> {
        let identity = self.member_identity(connection_id, document_id)?;
        self.authorize_edit(&identity, document_id).await?;

        let sender = sender.unwrap_or_else(|| identity.display_name().to_string());
        self.broadcast_to_document(
            document_id,
            Some(connection_id),
            &ServerEvent::ContentChange {
                document_id: document_id.to_string(),
                content: content.clone(),
                sender: Some(sender),
            },
        );

        self.debouncer.schedule(document_id, content, identity.key());
        Ok(())
    }

    /// Title edit: fan out to peers and persist immediately.
    pub async fn title_change(
        &self,
        connection_id: &str,
        document_id: &str,
        title: String,
        sender: Option<String>,
    ) -> CollabResult<()> {
        let identity = self.member_identity(connection_id, document_id)?;
        self.authorize_edit(&identity, document_id).await?;

        let sender = sender.unwrap_or_else(|| identity.display_name().to_string());
        self.broadcast_to_document(
            document_id,
            Some(connection_id),
            &ServerEvent::TitleChange {
                document_id: document_id.to_string(),
                title: title.clone(),
                sender: Some(sender),
            },
        );

        self.store
            .update(document_id, DocumentPatch::title(title), identity.key())
            .await?;
        Ok(())
    }

    /// Ephemeral cursor update: overwrite the tracked position and fan it
    /// out to every other member. Nothing here is persisted.
    pub fn cursor_position(
        &self,
        connection_id: &str,
        document_id: &str,
        position: SelectionRange,
    ) -> CollabResult<()> {
        let identity = self.member_identity(connection_id, document_id)?;
        let session = self.member_session(connection_id, document_id)?;

        let entry = CursorEntry {
            connection_id: connection_id.to_string(),
            user_id: identity.key().to_string(),
            username: identity.display_name().to_string(),
            position,
            color: identity.color().to_string(),
        };
        let broadcast = entry.to_broadcast();
        session.update_cursor(entry);

        self.broadcast_to_document(
            document_id,
            Some(connection_id),
            &ServerEvent::CursorPosition(broadcast),
        );
        Ok(())
    }

    /// Explicit flush request: persist immediately, outside the debounce
    /// window, and acknowledge to the whole room.
    pub async fn save_document(
        &self,
        connection_id: &str,
        document_id: &str,
        title: Option<String>,
        content: Option<String>,
    ) -> CollabResult<()> {
        let identity = self.member_identity(connection_id, document_id)?;
        self.authorize_edit(&identity, document_id).await?;

        // An explicit payload supersedes the pending write; otherwise the
        // pending snapshot is what gets saved.
        let pending = self.debouncer.take(document_id).map(|(content, _)| content);
        let patch = DocumentPatch {
            title,
            content: content.or(pending),
        };

        if patch.title.is_some() || patch.content.is_some() {
            self.store.update(document_id, patch, identity.key()).await?;
        }

        self.broadcast_to_document(
            document_id,
            None,
            &ServerEvent::DocumentSaved {
                document_id: document_id.to_string(),
            },
        );
        Ok(())
    }

    /// Enroll an email on the persisted collaborator list and re-broadcast
    /// the list to the room.
    pub async fn add_collaborator(
        &self,
        connection_id: &str,
        document_id: &str,
        email: &str,
    ) -> CollabResult<()> {
        self.member_identity(connection_id, document_id)?;

        if email.is_empty() {
            return Ok(());
        }

        let collaborators = self.store.add_collaborator(document_id, email).await?;
        self.broadcast_to_document(
            document_id,
            None,
            &ServerEvent::CollaboratorsUpdated { collaborators },
        );
        Ok(())
    }

    /// Transport-level disconnect: deterministic cleanup.
    ///
    /// The stale cursor entry is cleared before the presence update goes
    /// out, so the broadcast list never references a departed cursor.
    pub async fn disconnect(&self, connection_id: &str) {
        let Some((_, handle)) = self.connections.remove(connection_id) else {
            return;
        };

        let (identity, document_id) = {
            let handle = handle.read();
            (handle.identity.clone(), handle.document_id.clone())
        };

        if let Some(document_id) = document_id {
            if let Some(session) = self.sessions.get(&document_id) {
                session.clear_cursor(connection_id);
                session.remove_member(connection_id);

                if session.is_empty() {
                    self.sessions.remove_if_empty(&document_id);
                    // Don't leave the last edits hostage to a dead timer.
                    if let Err(e) = self.debouncer.flush(&document_id).await {
                        warn!("Flush on empty room {} failed: {}", document_id, e);
                    }
                } else {
                    self.broadcast_presence(&session);
                }
            }

            if let Some(identity) = identity {
                info!(
                    "{} left document {}",
                    identity.display_name(),
                    document_id
                );
            }
        }
    }

    /// Deliver an event to every member of a document room except the
    /// optionally excluded sender. Best-effort per connection; FIFO per
    /// sender is inherited from the per-connection outbox.
    pub fn broadcast_to_document(
        &self,
        document_id: &str,
        exclude: Option<&str>,
        event: &ServerEvent,
    ) {
        let Some(session) = self.sessions.get(document_id) else {
            return;
        };

        for member_id in session.member_connection_ids() {
            if exclude == Some(member_id.as_str()) {
                continue;
            }
            if let Some(conn) = self.connections.get(&member_id) {
                let _ = conn.read().send(event.clone());
            }
        }
    }

    /// Flush all pending writes; clean-shutdown hook.
    pub async fn shutdown(&self) {
        let flushed = self.debouncer.flush_all().await;
        if flushed > 0 {
            info!("Flushed {} pending writes on shutdown", flushed);
        }
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_documents: self.sessions.document_count(),
            active_connections: self.connections.len(),
            total_members: self.sessions.total_member_count(),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn debouncer(&self) -> &ChangeDebouncer {
        &self.debouncer
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    fn connection(&self, connection_id: &str) -> CollabResult<Arc<RwLock<ConnectionHandle>>> {
        self.connections
            .get(connection_id)
            .map(|c| c.clone())
            .ok_or_else(|| CollabError::Closed(connection_id.to_string()))
    }

    /// The connection's identity, fixed at handshake or supplied with the
    /// join event for anonymous connections.
    fn resolve_identity(
        &self,
        handle: &Arc<RwLock<ConnectionHandle>>,
        user_email: Option<String>,
    ) -> CollabResult<Identity> {
        if let Some(identity) = handle.read().identity.clone() {
            return Ok(identity);
        }

        match user_email {
            Some(email) if !email.is_empty() => {
                let identity = Identity::anonymous(email);
                handle.write().identity = Some(identity.clone());
                Ok(identity)
            }
            _ => Err(CollabError::Auth(
                "No identity presented for this connection".to_string(),
            )),
        }
    }

    /// Identity of a connection that has joined the given room.
    fn member_identity(&self, connection_id: &str, document_id: &str) -> CollabResult<Identity> {
        self.member_session(connection_id, document_id)?;
        self.connection(connection_id)?
            .read()
            .identity
            .clone()
            .ok_or_else(|| CollabError::Auth("No identity presented for this connection".to_string()))
    }

    fn member_session(
        &self,
        connection_id: &str,
        document_id: &str,
    ) -> CollabResult<Arc<DocumentSession>> {
        self.sessions
            .get(document_id)
            .filter(|s| s.is_member(connection_id))
            .ok_or_else(|| CollabError::Forbidden("Not joined to this document".to_string()))
    }

    /// Re-validate edit permission against a fresh read. Handlers call
    /// this after any suspension point; membership alone is stale the
    /// moment a collaborator is revoked.
    async fn authorize_edit(&self, identity: &Identity, document_id: &str) -> CollabResult<()> {
        if !identity.is_authenticated() {
            return Ok(());
        }

        let document = self
            .store
            .get(document_id)
            .await?
            .ok_or_else(|| CollabError::NotFound(document_id.to_string()))?;

        if !document.can_edit(identity) {
            return Err(CollabError::Forbidden(
                "Not authorized to edit this document".to_string(),
            ));
        }
        Ok(())
    }

    fn broadcast_presence(&self, session: &DocumentSession) {
        let users = session.presence_entries();
        self.broadcast_to_document(
            session.document_id(),
            None,
            &ServerEvent::ActiveUsers { users },
        );
    }

    fn send_to(&self, connection_id: &str, event: ServerEvent) {
        if let Some(conn) = self.connections.get(connection_id) {
            let _ = conn.read().send(event);
        }
    }
}
