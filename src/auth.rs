//! Authentication verifier seam
//!
//! Token issuance and cryptographic checks live outside the hub. The hub
//! only consumes a verifier that maps a token to an `Identity`. It is
//! called on the connection's read pump, so it must return quickly.

use std::collections::HashMap;

use crate::error::{AppError, AuthError};
use crate::types::Identity;

/// Pluggable token verifier supplied by the embedding application
pub trait AuthVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

impl<F> AuthVerifier for F
where
    F: Fn(&str) -> Result<Identity, AuthError> + Send + Sync + 'static,
{
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self(token)
    }
}

/// Verifier backed by a fixed token table
///
/// Used by the standalone binary. Entries are `token=user` or
/// `token=user:session`; without an explicit session each successful
/// verification gets a fresh session id.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, (String, Option<String>)>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(
        mut self,
        token: impl Into<String>,
        user_id: impl Into<String>,
        session_id: Option<String>,
    ) -> Self {
        self.tokens
            .insert(token.into(), (user_id.into(), session_id));
        self
    }

    /// Parse a comma-separated `token=user[:session]` list
    pub fn parse(table: &str) -> Result<Self, AppError> {
        let mut verifier = Self::new();
        for entry in table.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (token, owner) = entry
                .split_once('=')
                .ok_or_else(|| AppError::Config(format!("invalid token entry '{}'", entry)))?;
            let (user, session) = match owner.split_once(':') {
                Some((user, session)) => (user, Some(session.to_string())),
                None => (owner, None),
            };
            if token.is_empty() || user.is_empty() {
                return Err(AppError::Config(format!("invalid token entry '{}'", entry)));
            }
            verifier = verifier.with_token(token, user, session);
        }
        Ok(verifier)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl AuthVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let (user_id, session_id) = self
            .tokens
            .get(token)
            .ok_or_else(|| AuthError::new("invalid token"))?;
        let session_id = session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Ok(Identity::new(user_id.clone(), session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token_table() {
        let verifier = StaticTokenVerifier::parse("t1=alice, t2=bob:s-9").unwrap();
        assert_eq!(verifier.len(), 2);

        let alice = verifier.verify("t1").unwrap();
        assert_eq!(alice.user_id, "alice");
        assert!(!alice.session_id.is_empty());

        let bob = verifier.verify("t2").unwrap();
        assert_eq!(bob, Identity::new("bob", "s-9"));

        assert!(verifier.verify("t3").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(StaticTokenVerifier::parse("no-equals-sign").is_err());
        assert!(StaticTokenVerifier::parse("=alice").is_err());
        assert!(StaticTokenVerifier::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_closure_verifier() {
        let verifier = |token: &str| {
            if token == "ok" {
                Ok(Identity::new("u1", "s1"))
            } else {
                Err(AuthError::new("denied"))
            }
        };
        assert!(verifier.verify("ok").is_ok());
        assert_eq!(verifier.verify("nope").unwrap_err().to_string(), "denied");
    }
}
