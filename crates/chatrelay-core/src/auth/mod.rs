//! Authentication collaborators
//!
//! - `AuthProvider`: bearer token for backend requests (may be absent)
//! - `ToolAuthBroker`: OAuth broker for external tools (GitHub, Slack, ...)
//! - `AuthStatusPoller`: polls the broker and resumes interrupted exchanges
//!
//! Session token persistence lives in `storage`.

pub mod broker;
pub mod poller;
pub mod storage;

use std::collections::BTreeMap;

use async_trait::async_trait;

pub use broker::{AuthInit, HttpToolAuthBroker, ToolAuthBroker, ToolAuthState};
pub use poller::AuthStatusPoller;
pub use storage::{SessionToken, TokenStore};

/// Per-service authentication state sent with every request, keyed by
/// lowercase service name
pub type AuthStatus = BTreeMap<String, bool>;

/// Source of the bearer token for backend requests
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Current token, or `None` when signed out
    ///
    /// A missing token is not an error: requests go out unauthenticated and
    /// the backend decides.
    async fn current_token(&self) -> Option<String>;
}

/// Fixed token, mostly for tests and scripted use
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

#[async_trait]
impl AuthProvider for StaticToken {
    async fn current_token(&self) -> Option<String> {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token() {
        assert_eq!(
            StaticToken::new("abc").current_token().await.as_deref(),
            Some("abc")
        );
        assert!(StaticToken::none().current_token().await.is_none());
    }
}
