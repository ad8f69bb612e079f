//! The Authenticator collaborator: given a bearer credential, yields a
//! verified user identity or a failure. Token minting and
//! registration/login are out of scope for the core; this module supplies
//! one concrete, intentionally narrow implementation so the attach
//! endpoint is exercisable end to end.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// A verified identity, yielded after a bearer token checks out.
#[derive(Debug, Clone)]
pub struct AuthIdentity {
    pub user_id: i64,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing or malformed Authorization header")]
    MissingCredential,
    #[error("credential not recognized")]
    InvalidCredential,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, bearer_token: &str) -> Result<AuthIdentity, AuthError>;
}

/// A fixed, in-process table of bearer tokens to identities. Stands in for
/// a real login/token-minting system, configured at startup from
/// [`crate::config::AppConfig`].
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, AuthIdentity>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, AuthIdentity>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn verify(&self, bearer_token: &str) -> Result<AuthIdentity, AuthError> {
        self.tokens
            .get(bearer_token)
            .cloned()
            .ok_or(AuthError::InvalidCredential)
    }
}

/// Extract the bearer token from an `Authorization` header value.
pub fn parse_bearer(header_value: Option<&str>) -> Result<&str, AuthError> {
    let value = header_value.ok_or(AuthError::MissingCredential)?;
    value
        .strip_prefix("Bearer ")
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingCredential)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> AuthIdentity {
        AuthIdentity {
            user_id: 1,
            username: "ada".into(),
            email: "ada@example.com".into(),
        }
    }

    #[tokio::test]
    async fn verifies_known_token() {
        let mut tokens = HashMap::new();
        tokens.insert("secret".to_string(), identity());
        let auth = StaticTokenAuthenticator::new(tokens);
        let id = auth.verify("secret").await.unwrap();
        assert_eq!(id.user_id, 1);
    }

    #[tokio::test]
    async fn rejects_unknown_token() {
        let auth = StaticTokenAuthenticator::new(HashMap::new());
        assert!(matches!(
            auth.verify("nope").await,
            Err(AuthError::InvalidCredential)
        ));
    }

    #[test]
    fn parse_bearer_requires_prefix() {
        assert!(parse_bearer(Some("Token abc")).is_err());
        assert!(parse_bearer(None).is_err());
        assert_eq!(parse_bearer(Some("Bearer abc")).unwrap(), "abc");
    }
}
