//! Mid-exchange interrupts
//!
//! When a tool call needs the user to authenticate a service or confirm an
//! action, the backend suspends the exchange. The relay parks on a oneshot
//! channel until the UI (or the auth poller) answers, or the wait times out.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::auth::AuthStatus;
use crate::error::RelayError;

/// What the backend is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptKind {
    Auth,
    Confirmation,
}

/// Opaque correlation id between an interrupt and its resumption
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeToken(String);

impl ResumeToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn from_backend(value: &str) -> Self {
        Self(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A suspension surfaced to the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptRequest {
    pub kind: InterruptKind,
    pub service: Option<String>,
    pub action: Option<String>,
    pub details: Option<Map<String, Value>>,
    pub resume_token: ResumeToken,
}

impl InterruptRequest {
    pub fn auth(service: &str, resume_token: ResumeToken) -> Self {
        Self {
            kind: InterruptKind::Auth,
            service: Some(service.to_lowercase()),
            action: None,
            details: None,
            resume_token,
        }
    }

    pub fn confirmation(
        action: &str,
        details: Option<Map<String, Value>>,
        resume_token: ResumeToken,
    ) -> Self {
        Self {
            kind: InterruptKind::Confirmation,
            service: None,
            action: Some(action.to_string()),
            details,
            resume_token,
        }
    }
}

/// How the UI answered an interrupt
#[derive(Debug, Clone, PartialEq)]
pub enum InterruptResolution {
    /// Service authenticated; carries the full updated auth status
    Authenticated { auth_status: AuthStatus },
    /// Action confirmed
    Confirmed,
    /// User declined or navigated away
    Cancelled,
}

impl InterruptResolution {
    /// Whether this answer is meaningful for the given interrupt kind
    pub fn fits(&self, kind: InterruptKind) -> bool {
        match self {
            InterruptResolution::Authenticated { .. } => kind == InterruptKind::Auth,
            InterruptResolution::Confirmed => kind == InterruptKind::Confirmation,
            InterruptResolution::Cancelled => true,
        }
    }
}

/// An interrupt waiting for its answer
pub(crate) struct PendingInterrupt {
    pub request: InterruptRequest,
    responder: oneshot::Sender<InterruptResolution>,
}

impl PendingInterrupt {
    pub fn new(request: InterruptRequest) -> (Self, oneshot::Receiver<InterruptResolution>) {
        let (responder, rx) = oneshot::channel();
        (Self { request, responder }, rx)
    }

    /// Deliver the answer; false when the waiting side is gone
    pub fn resolve(self, resolution: InterruptResolution) -> bool {
        self.responder.send(resolution).is_ok()
    }
}

/// Wait for an interrupt answer, bounded by `limit`
///
/// A dropped responder counts as cancellation so an abandoned interrupt
/// always reaches a terminal state.
pub(crate) async fn await_resolution(
    conversation_id: &str,
    rx: oneshot::Receiver<InterruptResolution>,
    limit: Duration,
) -> Result<InterruptResolution, RelayError> {
    match tokio::time::timeout(limit, rx).await {
        Ok(Ok(resolution)) => {
            info!(
                conversation_id = %conversation_id,
                "Interrupt resolved: {:?}",
                resolution
            );
            Ok(resolution)
        }
        Ok(Err(_)) => {
            warn!(
                conversation_id = %conversation_id,
                "Interrupt responder dropped, treating as cancelled"
            );
            Ok(InterruptResolution::Cancelled)
        }
        Err(_) => Err(RelayError::InterruptTimeout {
            conversation_id: conversation_id.to_string(),
            waited: limit,
        }),
    }
}
