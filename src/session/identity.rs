//! Connection identity for the two deployment modes.
//!
//! A connection is identified either by a JWT-backed principal
//! (authenticated mode) or by a bare email string (anonymous mode).
//! Permission checks are written against the common capability rather
//! than branching on mode throughout the handlers.

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use super::{CollabError, CollabResult};

/// Fixed palette for deterministic per-identity colors.
const COLOR_PALETTE: [&str; 10] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#FFA5A5", "#A5FFD6",
    "#FFC145", "#FF6B8B", "#C04CFD", "#47B8FF", "#FFD166",
];

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Identity {
    /// JWT-backed principal (authenticated-principal mode).
    Authenticated {
        id: String,
        email: String,
        username: String,
    },
    /// Bare email string (anonymous-email mode); access is unconditional.
    Anonymous { email: String },
}

impl Identity {
    pub fn anonymous(email: impl Into<String>) -> Self {
        Self::Anonymous { email: email.into() }
    }

    /// Stable key for this identity: principal id when authenticated,
    /// email otherwise. Color assignment and presence entries use this.
    pub fn key(&self) -> &str {
        match self {
            Identity::Authenticated { id, .. } => id,
            Identity::Anonymous { email } => email,
        }
    }

    pub fn email(&self) -> &str {
        match self {
            Identity::Authenticated { email, .. } => email,
            Identity::Anonymous { email } => email,
        }
    }

    /// Name shown in presence lists and cursor labels.
    pub fn display_name(&self) -> &str {
        match self {
            Identity::Authenticated { username, .. } => username,
            Identity::Anonymous { email } => email,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Identity::Authenticated { .. })
    }

    /// Deterministic color, stable across reconnects and across processes.
    pub fn color(&self) -> &'static str {
        identity_color(self.key())
    }
}

/// Sum of byte values modulo the palette size.
pub fn identity_color(key: &str) -> &'static str {
    let hash: usize = key.bytes().map(|b| b as usize).sum();
    COLOR_PALETTE[hash % COLOR_PALETTE.len()]
}

/// Claims carried by the access token in authenticated mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    id: String,
    email: String,
    username: String,
    exp: usize,
}

/// Validates handshake credentials for authenticated-principal mode.
pub struct Authenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl Authenticator {
    pub fn from_secret(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Verify a token and produce the connection identity.
    ///
    /// Rejected connections never join a room; the handshake fails before
    /// any session state is touched.
    pub fn authenticate(&self, token: &str) -> CollabResult<Identity> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| CollabError::Auth(e.to_string()))?;

        Ok(Identity::Authenticated {
            id: data.claims.id,
            email: data.claims.email,
            username: data.claims.username,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn make_token(secret: &str, exp: usize) -> String {
        let claims = Claims {
            id: "user-1".to_string(),
            email: "alice@example.com".to_string(),
            username: "alice".to_string(),
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn far_future() -> usize {
        (chrono::Utc::now().timestamp() + 3600) as usize
    }

    #[test]
    fn test_authenticate_valid_token() {
        let auth = Authenticator::from_secret("test-secret");
        let token = make_token("test-secret", far_future());

        let identity = auth.authenticate(&token).unwrap();
        assert_eq!(identity.key(), "user-1");
        assert_eq!(identity.email(), "alice@example.com");
        assert_eq!(identity.display_name(), "alice");
        assert!(identity.is_authenticated());
    }

    #[test]
    fn test_authenticate_wrong_secret() {
        let auth = Authenticator::from_secret("test-secret");
        let token = make_token("other-secret", far_future());

        let result = auth.authenticate(&token);
        assert!(matches!(result, Err(CollabError::Auth(_))));
    }

    #[test]
    fn test_authenticate_garbage() {
        let auth = Authenticator::from_secret("test-secret");
        assert!(auth.authenticate("not-a-token").is_err());
    }

    #[test]
    fn test_anonymous_identity() {
        let identity = Identity::anonymous("bob@example.com");
        assert_eq!(identity.key(), "bob@example.com");
        assert_eq!(identity.display_name(), "bob@example.com");
        assert!(!identity.is_authenticated());
    }

    #[test]
    fn test_color_deterministic() {
        let a = identity_color("alice@example.com");
        let b = identity_color("alice@example.com");
        assert_eq!(a, b);
        assert!(a.starts_with('#'));
        assert_eq!(a.len(), 7);
    }

    #[test]
    fn test_color_matches_identity() {
        let identity = Identity::anonymous("carol@example.com");
        assert_eq!(identity.color(), identity_color("carol@example.com"));
    }
}
