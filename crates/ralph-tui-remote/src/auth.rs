//! Token management and constant-time auth validation (spec.md §4.7, §6).
//! Grounded on the teacher's `gateway::auth` bearer-token middleware
//! (`load_or_create_token` + owner-only file permissions), generalized from
//! a single bearer token to the two-tier server/connection token scheme the
//! remote control protocol requires.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// How long an issued connection token remains valid before the client must
/// re-authenticate with the server token.
const CONNECTION_TOKEN_TTL_MINUTES: i64 = 60;

fn token_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "ralph-tui")
        .map(|dirs| dirs.config_dir().join("remote-token"))
        .unwrap_or_else(|| PathBuf::from(".ralph-tui").join("remote-token"))
}

/// Load the persisted server token, generating and persisting a new one (with
/// owner-only permissions on Unix) if none exists yet.
pub fn load_or_create_server_token() -> std::io::Result<String> {
    let path = token_path();
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim().to_string();
        if !trimmed.is_empty() {
            return Ok(trimmed);
        }
    }

    let token = Uuid::new_v4().simple().to_string();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, &token)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(&path, perms)?;
    }

    Ok(token)
}

/// Constant-time equality check, used on every hot-path auth comparison so
/// timing cannot leak how many leading bytes of a guessed token matched.
pub fn tokens_equal(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[derive(Debug, Clone)]
struct ConnectionTokenEntry {
    client_id: String,
    expires_at: DateTime<Utc>,
}

/// Issues and validates short-lived connection tokens, and tracks which
/// client each one belongs to so a disconnect can revoke all of a client's
/// tokens at once (spec.md §4.7 connection lifecycle step 5).
pub struct AuthState {
    server_token: String,
    connection_tokens: RwLock<HashMap<String, ConnectionTokenEntry>>,
}

impl AuthState {
    pub fn new(server_token: String) -> Arc<Self> {
        Arc::new(Self {
            server_token,
            connection_tokens: RwLock::new(HashMap::new()),
        })
    }

    pub fn validate_server_token(&self, provided: &str) -> bool {
        tokens_equal(provided, &self.server_token)
    }

    /// Whether a server token is configured (always true here — the server
    /// always has one — kept for parity with spec.md §4.7's bind-address
    /// rule, which branches on configuration rather than presence).
    pub fn has_server_token(&self) -> bool {
        !self.server_token.is_empty()
    }

    /// Mint a new connection token for `client_id`, valid for
    /// [`CONNECTION_TOKEN_TTL_MINUTES`].
    pub fn issue_connection_token(&self, client_id: &str) -> (String, DateTime<Utc>) {
        let token = Uuid::new_v4().to_string();
        let expires_at = Utc::now() + Duration::minutes(CONNECTION_TOKEN_TTL_MINUTES);
        self.connection_tokens.write().insert(
            token.clone(),
            ConnectionTokenEntry {
                client_id: client_id.to_string(),
                expires_at,
            },
        );
        (token, expires_at)
    }

    /// Validate a connection token, returning the client id it was issued
    /// to. Expired or unknown tokens fail, forcing server-token re-auth per
    /// spec.md §4.7 step 2.
    pub fn validate_connection_token(&self, token: &str) -> Option<String> {
        let tokens = self.connection_tokens.read();
        let entry = tokens.get(token)?;
        if entry.expires_at < Utc::now() {
            return None;
        }
        Some(entry.client_id.clone())
    }

    /// Revoke every connection token issued to `client_id`, on disconnect.
    pub fn revoke_client(&self, client_id: &str) {
        self.connection_tokens
            .write()
            .retain(|_, entry| entry.client_id != client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_compare_matches_equal_tokens() {
        assert!(tokens_equal("abc123", "abc123"));
        assert!(!tokens_equal("abc123", "abc124"));
        assert!(!tokens_equal("short", "muchlongertoken"));
    }

    #[test]
    fn connection_token_round_trips() {
        let auth = AuthState::new("server-secret".to_string());
        assert!(auth.validate_server_token("server-secret"));
        assert!(!auth.validate_server_token("wrong"));

        let (token, _expiry) = auth.issue_connection_token("client-1");
        assert_eq!(auth.validate_connection_token(&token), Some("client-1".to_string()));

        auth.revoke_client("client-1");
        assert!(auth.validate_connection_token(&token).is_none());
    }

    #[test]
    fn unknown_connection_token_fails() {
        let auth = AuthState::new("server-secret".to_string());
        assert!(auth.validate_connection_token("not-a-real-token").is_none());
    }
}
