//! Authentication hook for identifying the user behind a connection.
//!
//! Typeroom does not issue or verify credentials itself. Logins, cookies
//! and session tokens belong to whatever HTTP service fronts the rooms.
//! The server only needs to turn the token a client presents in its
//! `attach` frame into a [`UserId`], and the [`Authenticator`] trait is
//! that seam.
//!
//! [`StaticAuthenticator`] is a fixed token table for development and
//! tests.

use std::collections::HashMap;
use std::future::Future;

use typeroom_protocol::UserId;

/// A token was rejected.
#[derive(Debug, thiserror::Error)]
#[error("authentication failed: {reason}")]
pub struct AuthError {
    reason: String,
}

impl AuthError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Validates a client's token and returns who they are.
///
/// `Send + Sync + 'static` because one authenticator is shared by every
/// connection task for the lifetime of the server.
///
/// # Example
///
/// ```rust
/// use typeroom::{AuthError, Authenticator};
/// use typeroom_protocol::UserId;
///
/// /// Treats the token as the user id itself.
/// struct UuidTokens;
///
/// impl Authenticator for UuidTokens {
///     async fn authenticate(&self, token: &str) -> Result<UserId, AuthError> {
///         token
///             .parse()
///             .map_err(|_| AuthError::new("token is not a user id"))
///     }
/// }
/// ```
pub trait Authenticator: Send + Sync + 'static {
    /// Called once per connection, with the token from its `attach`
    /// frame.
    fn authenticate(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<UserId, AuthError>> + Send;
}

/// Accepts only the tokens it was built with.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    tokens: HashMap<String, UserId>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: UserId) -> Self {
        self.tokens.insert(token.into(), user_id);
        self
    }
}

impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<UserId, AuthError> {
        self.tokens
            .get(token)
            .copied()
            .ok_or_else(|| AuthError::new("unknown token"))
    }
}
