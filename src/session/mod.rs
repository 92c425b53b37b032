//! Collaborative session layer for real-time document editing.
//!
//! This module implements the server-side session core:
//! - Named-event JSON protocol over WebSocket
//! - Per-document presence and cursor tracking
//! - Room fan-out with per-sender ordering
//! - Debounced persistence through the document store

pub mod debounce;
pub mod identity;
pub mod presence;
pub mod protocol;
pub mod server;

pub use identity::Identity;
pub use server::CollabServer;

use std::time::Duration;

use crate::store::StoreError;

/// Unique identifier for a document.
pub type DocumentId = String;

/// Unique identifier for one WebSocket connection.
pub type ConnectionId = String;

/// Result type for session operations.
pub type CollabResult<T> = Result<T, CollabError>;

/// Errors surfaced by the session layer.
///
/// Handler errors degrade to an `error` event on the triggering connection
/// plus a server-side log line; they are never fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Document not found: {0}")]
    NotFound(DocumentId),

    #[error("Not authorized: {0}")]
    Forbidden(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Connection closed: {0}")]
    Closed(ConnectionId),
}

/// Configuration for the session layer.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Quiet period before a pending content change is persisted.
    pub debounce_quiet_period: Duration,
    /// Maximum members per document room.
    pub max_members_per_document: usize,
    /// Title given to documents created on first access.
    pub default_title: String,
    /// Content given to documents created on first access.
    pub default_content: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce_quiet_period: Duration::from_secs(2),
            max_members_per_document: 50,
            default_title: "Untitled Document".to_string(),
            default_content: "<p>Start typing your document here...</p>".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn with_quiet_period(mut self, period: Duration) -> Self {
        self.debounce_quiet_period = period;
        self
    }

    pub fn with_max_members(mut self, max: usize) -> Self {
        self.max_members_per_document = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.debounce_quiet_period, Duration::from_secs(2));
        assert_eq!(config.default_title, "Untitled Document");
    }

    #[test]
    fn test_config_builder() {
        let config = SessionConfig::default()
            .with_quiet_period(Duration::from_millis(300))
            .with_max_members(8);

        assert_eq!(config.debounce_quiet_period, Duration::from_millis(300));
        assert_eq!(config.max_members_per_document, 8);
    }

    #[test]
    fn test_error_display() {
        let err = CollabError::NotFound("doc-123".to_string());
        assert_eq!(err.to_string(), "Document not found: doc-123");
    }
}
