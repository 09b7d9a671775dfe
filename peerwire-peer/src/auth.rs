//! Handshake authentication.
//!
//! Each side may check the credentials the remote presented in its
//! handshake. Stored credentials are SHA-256 hashes of the password, never
//! the plaintext.

use crate::config::AuthConfig;
use peerwire_protocol::Credentials;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

/// Outcome of an authentication check. `Err` carries the rejection reason
/// sent back in the handshake answer.
pub type AuthFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// Decides whether a remote may use the connection.
pub trait AuthPolicy: Send + Sync {
    fn authenticate(&self, credentials: Credentials) -> AuthFuture;
}

/// Accepts any credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl AuthPolicy for AcceptAll {
    fn authenticate(&self, _credentials: Credentials) -> AuthFuture {
        Box::pin(async { Ok(()) })
    }
}

/// Adapts an async function into an [`AuthPolicy`].
pub struct AuthFn<F>(pub F);

impl<F, Fut> AuthPolicy for AuthFn<F>
where
    F: Fn(Credentials) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    fn authenticate(&self, credentials: Credentials) -> AuthFuture {
        Box::pin((self.0)(credentials))
    }
}

/// Validates user/password pairs against configured password hashes.
#[derive(Debug, Clone, Default)]
pub struct CredentialValidator {
    /// user -> SHA-256 hex of the password.
    hashes: HashMap<String, String>,
}

impl CredentialValidator {
    /// Creates a validator from `(user, password hash)` pairs.
    pub fn new(hashes: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            hashes: hashes
                .into_iter()
                .map(|(user, hash)| (user, hash.to_lowercase()))
                .collect(),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            config
                .credentials
                .iter()
                .map(|(user, hash)| (user.clone(), hash.clone())),
        )
    }

    /// Returns whether any credentials are configured.
    pub fn has_credentials(&self) -> bool {
        !self.hashes.is_empty()
    }

    /// Returns the number of configured users.
    pub fn user_count(&self) -> usize {
        self.hashes.len()
    }

    /// Validates a plaintext password by hashing and comparing.
    pub fn validate(&self, user: &str, password: &str) -> bool {
        match self.hashes.get(user) {
            Some(expected) => *expected == Self::hash_password(password),
            None => false,
        }
    }

    /// Hashes a password using SHA-256, returning a lowercase hex string.
    pub fn hash_password(password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl AuthPolicy for CredentialValidator {
    fn authenticate(&self, credentials: Credentials) -> AuthFuture {
        let valid = self.validate(&credentials.user, &credentials.password);
        let user = credentials.user;
        Box::pin(async move {
            if valid {
                Ok(())
            } else {
                tracing::debug!("Rejected credentials for user {:?}", user);
                Err("Invalid credentials".to_string())
            }
        })
    }
}
