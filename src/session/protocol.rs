//! Named-event JSON protocol for client-server communication.
//!
//! Each WebSocket text frame carries one `{"event": ..., "data": ...}`
//! envelope. Event names are kebab-case and payload fields camelCase,
//! matching what the editing clients send. Unknown event names are
//! tolerated so newer clients can talk to older servers.

use serde::{Deserialize, Serialize};

use super::DocumentId;

/// Errors raised while encoding or decoding protocol frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),

    #[error("Frame has no event name")]
    MissingEvent,
}

/// Cursor/selection position within the document (Quill-style range).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub index: u32,
    pub length: u32,
}

/// One entry in an `active-users` broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub id: String,
    pub username: String,
    pub email: String,
    pub color: String,
}

/// A cursor position tagged with its owner, as broadcast to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorBroadcast {
    pub id: String,
    pub username: String,
    pub position: SelectionRange,
    pub color: String,
}

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Join a document room; anonymous connections may carry their email here.
    JoinDocument {
        document_id: DocumentId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_email: Option<String>,
    },

    /// Full-content edit, broadcast to peers and persisted after a quiet period.
    ContentChange {
        document_id: DocumentId,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },

    /// Title edit, broadcast to peers and persisted immediately.
    TitleChange {
        document_id: DocumentId,
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },

    /// Ephemeral cursor/selection update.
    CursorPosition {
        document_id: DocumentId,
        position: SelectionRange,
    },

    /// Explicit flush request, bypassing the debounce window.
    SaveDocument {
        document_id: DocumentId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },

    /// Enroll an identity on the document's collaborator list.
    AddCollaborator {
        document_id: DocumentId,
        email: String,
    },
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Initial state push to a joining connection only.
    DocumentData { title: String, content: String },

    /// Relayed content edit from another member.
    ContentChange {
        document_id: DocumentId,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },

    /// Relayed title edit from another member.
    TitleChange {
        document_id: DocumentId,
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },

    /// Relayed cursor position from another member.
    CursorPosition(CursorBroadcast),

    /// Snapshot of all current cursors, pushed to a joining connection.
    CursorPositions { positions: Vec<CursorBroadcast> },

    /// Presence sync, pushed to the whole room on every join and leave.
    ActiveUsers { users: Vec<PresenceEntry> },

    /// Persisted collaborator list after an enrollment.
    CollaboratorsUpdated {
        collaborators: Vec<crate::store::Collaborator>,
    },

    /// Acknowledgment of an explicit save.
    DocumentSaved { document_id: DocumentId },

    /// A rejected join or edit.
    Error { message: String },
}

/// Result of decoding one inbound frame.
#[derive(Debug)]
pub enum Decoded {
    Event(ClientEvent),
    /// Recognized envelope carrying an event name this server does not know.
    Unknown(String),
}

const KNOWN_CLIENT_EVENTS: [&str; 6] = [
    "join-document",
    "content-change",
    "title-change",
    "cursor-position",
    "save-document",
    "add-collaborator",
];

/// Decode an inbound text frame.
///
/// Unknown event names decode to [`Decoded::Unknown`] so the caller can
/// skip them; malformed payloads for known events are errors.
pub fn decode_client(text: &str) -> Result<Decoded, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    let event = value
        .get("event")
        .and_then(|e| e.as_str())
        .ok_or(ProtocolError::MissingEvent)?;

    if !KNOWN_CLIENT_EVENTS.contains(&event) {
        return Ok(Decoded::Unknown(event.to_string()));
    }

    let event = serde_json::from_value::<ClientEvent>(value)?;
    Ok(Decoded::Event(event))
}

/// Encode an outbound server event as a text frame.
pub fn encode_server(event: &ServerEvent) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_join() {
        let frame = r#"{"event":"join-document","data":{"documentId":"d1","userEmail":"a@b.c"}}"#;
        match decode_client(frame).unwrap() {
            Decoded::Event(ClientEvent::JoinDocument {
                document_id,
                user_email,
            }) => {
                assert_eq!(document_id, "d1");
                assert_eq!(user_email.as_deref(), Some("a@b.c"));
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_decode_content_change_without_sender() {
        let frame = r#"{"event":"content-change","data":{"documentId":"d1","content":"<p>hi</p>"}}"#;
        match decode_client(frame).unwrap() {
            Decoded::Event(ClientEvent::ContentChange {
                content, sender, ..
            }) => {
                assert_eq!(content, "<p>hi</p>");
                assert!(sender.is_none());
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_decode_cursor_position() {
        let frame =
            r#"{"event":"cursor-position","data":{"documentId":"d1","position":{"index":4,"length":0}}}"#;
        match decode_client(frame).unwrap() {
            Decoded::Event(ClientEvent::CursorPosition { position, .. }) => {
                assert_eq!(position, SelectionRange { index: 4, length: 0 });
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_is_tolerated() {
        let frame = r#"{"event":"typing-indicator","data":{"documentId":"d1"}}"#;
        match decode_client(frame).unwrap() {
            Decoded::Unknown(name) => assert_eq!(name, "typing-indicator"),
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frame_is_error() {
        assert!(decode_client("not json").is_err());
        assert!(matches!(
            decode_client(r#"{"data":{}}"#),
            Err(ProtocolError::MissingEvent)
        ));
        // Known event with a payload missing required fields.
        assert!(decode_client(r#"{"event":"content-change","data":{"documentId":"d1"}}"#).is_err());
    }

    #[test]
    fn test_encode_document_data() {
        let event = ServerEvent::DocumentData {
            title: "Untitled Document".to_string(),
            content: "<p>hi</p>".to_string(),
        };
        let text = encode_server(&event).unwrap();
        assert!(text.contains(r#""event":"document-data""#));
        assert!(text.contains(r#""title":"Untitled Document""#));
    }

    #[test]
    fn test_encode_active_users_field_names() {
        let event = ServerEvent::ActiveUsers {
            users: vec![PresenceEntry {
                id: "u1".to_string(),
                username: "alice".to_string(),
                email: "alice@example.com".to_string(),
                color: "#FF6B6B".to_string(),
            }],
        };
        let text = encode_server(&event).unwrap();
        assert!(text.contains(r#""event":"active-users""#));
        assert!(text.contains(r#""username":"alice""#));
    }

    #[test]
    fn test_client_event_round_trip() {
        let event = ClientEvent::SaveDocument {
            document_id: "d1".to_string(),
            title: Some("Notes".to_string()),
            content: None,
        };
        let text = serde_json::to_string(&event).unwrap();
        match decode_client(&text).unwrap() {
            Decoded::Event(ClientEvent::SaveDocument {
                document_id, title, ..
            }) => {
                assert_eq!(document_id, "d1");
                assert_eq!(title.as_deref(), Some("Notes"));
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }
}
