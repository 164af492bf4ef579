//! Authentication Module
//!
//! Owns the account credentials and the current cloud session.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::sync::{ApiError, TelematicsApi};

/// Account credentials used for the login form.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Lower-case hex MD5 of the password, as the login endpoint expects it.
    pub fn password_digest(&self) -> String {
        hex::encode(Md5::digest(self.password.as_bytes()))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// User id as issued by the login endpoint.
///
/// Kept in the JSON type it arrived in, since command envelopes echo it back
/// verbatim. Query strings use its `Display` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserId {
    Number(serde_json::Number),
    Text(String),
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserId::Number(n) => write!(f, "{}", n),
            UserId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId::Text(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        UserId::Text(s)
    }
}

impl From<u64> for UserId {
    fn from(n: u64) -> Self {
        UserId::Number(n.into())
    }
}

/// Authenticated context returned by a successful login
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub user_id: UserId,
    /// Issued by the server but never used for renewal.
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// Manages authentication state
pub struct AuthManager {
    credentials: Credentials,
    session: Option<Session>,
}

impl AuthManager {
    /// Create a new auth manager with no session
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            session: None,
        }
    }

    /// Log in with the stored credentials.
    ///
    /// Any failure leaves the manager without a session. No retry happens
    /// here; the coordinator tries again on its next cycle.
    pub async fn login<A>(&mut self, api: &A) -> Result<&Session, ApiError>
    where
        A: TelematicsApi + ?Sized,
    {
        self.session = None;
        match api.login(&self.credentials).await {
            Ok(session) => {
                info!("Session established for user: {}", session.user_id);
                Ok(self.session.insert(session))
            }
            Err(e) => {
                warn!("Login failed for {}: {}", self.credentials.username(), e);
                Err(e)
            }
        }
    }

    /// Get the current session if valid
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Check if currently authenticated
    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    /// Drop the current session so the next cycle logs in again
    pub fn invalidate(&mut self) {
        if self.session.take().is_some() {
            info!("Session invalidated");
        }
    }
}
