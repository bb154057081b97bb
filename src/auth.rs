//! Pluggable authentication.
//!
//! The server starts an auth exchange by answering STARTUP with AUTHENTICATE
//! naming an authenticator class; the client then sends AUTH_RESPONSE tokens
//! until the server replies AUTH_SUCCESS.

use std::sync::Arc;

use crate::error::{Error, Result};

/// Creates one [`Authenticator`] per connection attempt.
#[auto_impl::auto_impl(Arc)]
pub trait AuthenticatorProvider: Send + Sync {
    /// `class` is the server-advertised authenticator class name, e.g.
    /// `org.apache.cassandra.auth.PasswordAuthenticator`.
    fn new_authenticator(&self, class: &str) -> Result<Box<dyn Authenticator>>;
}

/// Per-connection challenge/response state.
pub trait Authenticator: Send {
    /// Token for the first AUTH_RESPONSE.
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>>;

    /// Token answering an AUTH_CHALLENGE.
    fn evaluate_challenge(&mut self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>>;

    /// Final token delivered with AUTH_SUCCESS.
    fn on_success(&mut self, _token: Option<&[u8]>) -> Result<()> {
        Ok(())
    }
}

/// Plain-text credentials, the scheme PasswordAuthenticator expects:
/// `0x00 user 0x00 password`.
#[derive(Debug, Clone)]
pub struct PlainTextAuthProvider {
    username: String,
    password: String,
}

impl PlainTextAuthProvider {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl AuthenticatorProvider for PlainTextAuthProvider {
    fn new_authenticator(&self, _class: &str) -> Result<Box<dyn Authenticator>> {
        Ok(Box::new(PlainTextAuthenticator {
            username: self.username.clone(),
            password: self.password.clone(),
        }))
    }
}

struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl Authenticator for PlainTextAuthenticator {
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>> {
        let mut token = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        token.push(0);
        token.extend_from_slice(self.username.as_bytes());
        token.push(0);
        token.extend_from_slice(self.password.as_bytes());
        Ok(Some(token))
    }

    fn evaluate_challenge(&mut self, _challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        Err(Error::Auth(
            "plain-text authenticator received an unexpected challenge".to_string(),
        ))
    }
}

/// Wire `credentials` config into a provider.
pub(crate) fn provider_from_credentials(
    username: &str,
    password: &str,
) -> Arc<dyn AuthenticatorProvider> {
    Arc::new(PlainTextAuthProvider::new(username, password))
}
