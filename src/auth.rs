//! Authentication collaborator.
//!
//! The engine only consumes the pass/fail contract: a client's `connect`
//! handshake carries an api key, `verify` answers authenticated, invalid, or
//! expired. Until a handshake succeeds a connection receives nothing but
//! connection and error events.

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Authenticated,
    Invalid,
    Expired,
}

impl AuthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authenticated => "authenticated",
            Self::Invalid => "invalid",
            Self::Expired => "expired",
        }
    }
}

#[async_trait]
pub trait AuthService: Send + Sync {
    async fn verify(&self, api_key: &str) -> AuthStatus;
}

/// Single shared-key verifier backed by `{data_dir}/auth_key`.
///
/// Keys are compared exactly; an optional expiry timestamp turns a formerly
/// valid key into `Expired` rather than `Invalid` so clients can distinguish
/// re-issue from typo.
pub struct StaticKeyAuth {
    key: String,
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl StaticKeyAuth {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            expires_at: None,
        }
    }

    pub fn with_expiry(key: &str, expires_at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            key: key.to_string(),
            expires_at: Some(expires_at),
        }
    }
}

#[async_trait]
impl AuthService for StaticKeyAuth {
    async fn verify(&self, api_key: &str) -> AuthStatus {
        if api_key != self.key || api_key.is_empty() {
            return AuthStatus::Invalid;
        }
        match self.expires_at {
            Some(expiry) if chrono::Utc::now() >= expiry => AuthStatus::Expired,
            _ => AuthStatus::Authenticated,
        }
    }
}

/// Return the shared api key for this server instance.
///
/// On first call, generates a random 32-character hex key and writes it to
/// `{data_dir}/auth_key` with user-only read/write permissions (mode 0600 on
/// Unix). On subsequent calls, reads and returns the existing key.
pub fn get_or_create_key(data_dir: &Path) -> Result<String> {
    let path = data_dir.join("auth_key");

    if path.exists() {
        let key = std::fs::read_to_string(&path)?.trim().to_string();
        if !key.is_empty() {
            return Ok(key);
        }
    }

    let key = Uuid::new_v4().to_string().replace('-', "");

    std::fs::create_dir_all(data_dir)?;
    std::fs::write(&path, &key)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(key)
}
