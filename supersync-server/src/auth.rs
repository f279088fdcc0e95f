//! Connection authentication.
//!
//! Clients name themselves when they open the WebSocket
//! (`/ws?username=alice&password=...`). The username is the identity used
//! for room rosters, message authorship and rate limiting. When the server
//! has a password configured, every connection must present it.

use std::sync::OnceLock;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

fn username_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]{3,20}$").expect("valid username regex"))
}

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub password: Option<String>,
}

/// Query parameters supplied with the WebSocket upgrade.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Invalid username: use 3 to 20 letters, digits or underscores")]
    InvalidUsername,

    #[error("Invalid server password")]
    InvalidPassword,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::InvalidUsername => StatusCode::BAD_REQUEST,
            AuthError::InvalidPassword => StatusCode::UNAUTHORIZED,
        };
        (status, self.to_string()).into_response()
    }
}

impl AuthConfig {
    /// Validate credentials, returning the authenticated username.
    pub fn authenticate(&self, credentials: &Credentials) -> Result<String, AuthError> {
        if !username_pattern().is_match(&credentials.username) {
            return Err(AuthError::InvalidUsername);
        }
        if let Some(expected) = &self.password {
            if credentials.password.as_deref() != Some(expected.as_str()) {
                return Err(AuthError::InvalidPassword);
            }
        }
        Ok(credentials.username.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(username: &str, password: Option<&str>) -> Credentials {
        Credentials {
            username: username.to_string(),
            password: password.map(str::to_string),
        }
    }

    #[test]
    fn test_username_rules() {
        let auth = AuthConfig::default();
        assert_eq!(auth.authenticate(&creds("alice_01", None)).unwrap(), "alice_01");
        assert_eq!(
            auth.authenticate(&creds("al", None)),
            Err(AuthError::InvalidUsername)
        );
        assert_eq!(
            auth.authenticate(&creds(&"a".repeat(21), None)),
            Err(AuthError::InvalidUsername)
        );
        assert_eq!(
            auth.authenticate(&creds("bad name", None)),
            Err(AuthError::InvalidUsername)
        );
    }

    #[test]
    fn test_password_required_when_configured() {
        let auth = AuthConfig {
            password: Some("hunter2".into()),
        };
        assert!(auth.authenticate(&creds("alice", Some("hunter2"))).is_ok());
        assert_eq!(
            auth.authenticate(&creds("alice", Some("nope"))),
            Err(AuthError::InvalidPassword)
        );
        assert_eq!(
            auth.authenticate(&creds("alice", None)),
            Err(AuthError::InvalidPassword)
        );
    }
}
