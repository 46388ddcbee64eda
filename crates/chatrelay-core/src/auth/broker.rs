//! Tool-auth broker
//!
//! The OAuth handshake with third-party services happens elsewhere; the
//! client only starts it and asks whether it finished.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::client::BackendClient;
use crate::constants;
use crate::error::TransportError;

/// Result of starting an auth flow
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthInit {
    /// Where the user completes the handshake
    #[serde(alias = "redirect_url")]
    pub redirect_url: String,
}

/// Whether a service is connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ToolAuthState {
    pub authenticated: bool,
}

#[async_trait]
pub trait ToolAuthBroker: Send + Sync {
    async fn init_auth(&self, service: &str) -> Result<AuthInit, TransportError>;
    async fn check_auth_status(&self, service: &str) -> Result<ToolAuthState, TransportError>;
}

/// Broker backed by the chat backend's integration endpoints
pub struct HttpToolAuthBroker {
    client: Arc<BackendClient>,
}

impl HttpToolAuthBroker {
    pub fn new(client: Arc<BackendClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ToolAuthBroker for HttpToolAuthBroker {
    async fn init_auth(&self, service: &str) -> Result<AuthInit, TransportError> {
        let url = self.client.integration_url(service, "auth")?;
        info!(service = %service, "Starting tool authentication");

        let builder = self
            .client
            .http()
            .post(url)
            .timeout(constants::http::REQUEST_TIMEOUT);
        let response = self.client.authorize(builder).await.send().await?;
        let response = self.client.check_status(response).await?;
        response
            .json::<AuthInit>()
            .await
            .map_err(|e| TransportError::Server(format!("invalid auth init response: {e}")))
    }

    async fn check_auth_status(&self, service: &str) -> Result<ToolAuthState, TransportError> {
        let url = self.client.integration_url(service, "status")?;
        let builder = self
            .client
            .http()
            .get(url)
            .timeout(constants::http::REQUEST_TIMEOUT);
        let response = self.client.authorize(builder).await.send().await?;
        let response = self.client.check_status(response).await?;
        let state = response
            .json::<ToolAuthState>()
            .await
            .map_err(|e| TransportError::Server(format!("invalid auth status response: {e}")))?;
        debug!(service = %service, authenticated = state.authenticated, "Tool auth status");
        Ok(state)
    }
}
