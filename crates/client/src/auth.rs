//! Auth collaborator seen by the sync orchestrator.
//!
//! Token acquisition lives outside this crate; the orchestrator only needs the
//! current session and a way to ask for a refresh.

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use fieldsync_core::TenantId;

/// Tokens this close to expiry (in seconds) are treated as expired.
pub const EXPIRY_SKEW_SECS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    pub tenant_id: TenantId,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
}

pub fn is_token_expired(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expires_at - Duration::seconds(EXPIRY_SKEW_SECS) <= now
}

#[async_trait::async_trait]
pub trait AuthProvider: Send + Sync {
    /// Current session.
    async fn auth_state(&self) -> Result<AuthState, AuthError>;

    /// Obtain a fresh token and return the new session.
    async fn refresh(&self) -> Result<AuthState, AuthError>;

    fn is_token_expired(&self, expires_at: DateTime<Utc>) -> bool {
        is_token_expired(expires_at, Utc::now())
    }
}

/// Fixed session, for services holding a long-lived token and for tests.
#[derive(Debug)]
pub struct StaticTokenProvider {
    state: RwLock<AuthState>,
}

impl StaticTokenProvider {
    pub fn new(state: AuthState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Swap in a new session (e.g. after an out-of-band login).
    pub async fn replace(&self, state: AuthState) {
        *self.state.write().await = state;
    }
}

#[async_trait::async_trait]
impl AuthProvider for StaticTokenProvider {
    async fn auth_state(&self) -> Result<AuthState, AuthError> {
        Ok(self.state.read().await.clone())
    }

    async fn refresh(&self) -> Result<AuthState, AuthError> {
        let state = self.state.read().await.clone();
        if is_token_expired(state.expires_at, Utc::now()) {
            return Err(AuthError::RefreshFailed(
                "static token cannot be refreshed".to_string(),
            ));
        }
        Ok(state)
    }
}
