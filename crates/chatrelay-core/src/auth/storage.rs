//! Session token storage
//!
//! Stores the backend session token in ~/.chatrelay/tokens/session.json with
//! secure permissions. Keeps an in-memory copy to avoid per-request I/O.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::AuthProvider;
use crate::paths;

/// Stored session token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionToken {
    pub access_token: String,
    /// Unix timestamp (seconds) after which the token is rejected
    #[serde(default)]
    pub expires_at: Option<u64>,
}

impl SessionToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|at| chrono::Utc::now().timestamp() >= at as i64)
            .unwrap_or(false)
    }
}

/// File-backed token store implementing `AuthProvider`
pub struct TokenStore {
    path: PathBuf,
    cached: RwLock<Option<SessionToken>>,
}

impl TokenStore {
    /// Default token file path
    pub fn default_path() -> PathBuf {
        paths::tokens_dir().join("session.json")
    }

    /// Open the store at the default location
    pub fn open_default() -> Result<Self> {
        Self::open(&Self::default_path())
    }

    /// Open the store at a specific path, loading any existing token
    pub fn open(path: &Path) -> Result<Self> {
        let cached = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read token file {:?}", path))?;
            Some(serde_json::from_str(&contents).context("Failed to parse token file")?)
        } else {
            None
        };
        Ok(Self {
            path: path.to_path_buf(),
            cached: RwLock::new(cached),
        })
    }

    pub fn get(&self) -> Option<SessionToken> {
        self.cached.read().clone()
    }

    /// Save a token to disk with secure permissions (atomic write)
    pub fn set(&self, token: SessionToken) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Create a temporary file in the same directory for atomic rename
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, serde_json::to_string_pretty(&token)?)?;

        // Set restrictive permissions on temp file before renaming (Unix)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = fs::metadata(&temp_path) {
                let mut permissions = metadata.permissions();
                permissions.set_mode(0o600);
                fs::set_permissions(&temp_path, permissions)
                    .map_err(|e| anyhow::anyhow!("Failed to set secure file permissions: {}", e))?;
            } else {
                tracing::warn!("Could not get metadata for token temp file, permissions not set");
            }
        }

        fs::rename(&temp_path, &self.path)?;
        *self.cached.write() = Some(token);
        tracing::debug!("Session token saved to {:?}", self.path);
        Ok(())
    }

    /// Remove the stored token
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("Failed to remove token file {:?}", self.path))?;
        }
        *self.cached.write() = None;
        Ok(())
    }
}

#[async_trait]
impl AuthProvider for TokenStore {
    async fn current_token(&self) -> Option<String> {
        match self.get() {
            Some(token) if !token.is_expired() => Some(token.access_token),
            Some(_) => {
                tracing::info!("Stored session token expired, sending unauthenticated");
                None
            }
            None => None,
        }
    }
}
