//! Per-conversation status machine
//!
//! ```text
//! Idle -> Sending -> Streaming -> AwaitingAuth | AwaitingConfirmation -> Streaming -> Idle
//!                  \_____________________ Error (from any non-idle state)
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::interrupt::{InterruptKind, InterruptRequest, ResumeToken};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Idle,
    Sending,
    Streaming,
    AwaitingAuth,
    AwaitingConfirmation,
    Error,
}

impl ConversationStatus {
    pub fn is_awaiting(&self) -> bool {
        matches!(
            self,
            ConversationStatus::AwaitingAuth | ConversationStatus::AwaitingConfirmation
        )
    }
}

/// Status plus the resume token of the interrupt it is waiting on
#[derive(Debug, Clone, Default)]
pub struct ConversationStateMachine {
    status: ConversationStatus,
    resume_token: Option<ResumeToken>,
    last_error: Option<String>,
}

impl ConversationStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> ConversationStatus {
        self.status
    }

    /// Token of the interrupt the machine is suspended on
    pub fn resume_token(&self) -> Option<&ResumeToken> {
        self.resume_token.as_ref()
    }

    /// Reason recorded by the most recent `fail`
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Start an exchange; only one may be in flight per conversation
    pub fn begin_send(&mut self, conversation_id: &str) -> Result<(), RelayError> {
        if self.status != ConversationStatus::Idle {
            return Err(RelayError::ConcurrentSend(conversation_id.to_string()));
        }
        self.status = ConversationStatus::Sending;
        self.last_error = None;
        Ok(())
    }

    /// Stream opened; repeated opens while streaming are ignored
    pub fn on_open(&mut self) -> Result<(), RelayError> {
        match self.status {
            ConversationStatus::Sending => {
                self.status = ConversationStatus::Streaming;
                Ok(())
            }
            ConversationStatus::Streaming => Ok(()),
            other => Err(self.illegal("open", other)),
        }
    }

    /// Suspend on an interrupt, capturing its resume token
    pub fn suspend(&mut self, request: &InterruptRequest) -> Result<(), RelayError> {
        match self.status {
            ConversationStatus::Sending | ConversationStatus::Streaming => {
                self.status = match request.kind {
                    InterruptKind::Auth => ConversationStatus::AwaitingAuth,
                    InterruptKind::Confirmation => ConversationStatus::AwaitingConfirmation,
                };
                self.resume_token = Some(request.resume_token.clone());
                debug!("Suspended on {:?} interrupt", request.kind);
                Ok(())
            }
            other => Err(self.illegal("suspend", other)),
        }
    }

    /// Resume a suspended exchange
    ///
    /// Returns false, leaving the machine untouched, when not suspended or
    /// when the token does not match the captured one.
    pub fn resume(&mut self, token: &ResumeToken) -> bool {
        if !self.status.is_awaiting() || self.resume_token.as_ref() != Some(token) {
            warn!("Ignoring resume with stale or mismatched token");
            return false;
        }
        self.status = ConversationStatus::Streaming;
        self.resume_token = None;
        true
    }

    /// Move to `Error`; a no-op when idle
    pub fn fail(&mut self, reason: &str) {
        if self.status == ConversationStatus::Idle {
            return;
        }
        self.status = ConversationStatus::Error;
        self.resume_token = None;
        self.last_error = Some(reason.to_string());
    }

    /// End of exchange
    pub fn settle(&mut self) {
        self.status = ConversationStatus::Idle;
        self.resume_token = None;
    }

    fn illegal(&mut self, transition: &str, from: ConversationStatus) -> RelayError {
        let reason = format!("illegal {transition} while {from:?}");
        self.fail(&reason);
        RelayError::Protocol(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_request(token: &str) -> InterruptRequest {
        InterruptRequest::auth("github", ResumeToken::from_backend(token))
    }

    fn streaming() -> ConversationStateMachine {
        let mut machine = ConversationStateMachine::new();
        machine.begin_send("c1").unwrap();
        machine.on_open().unwrap();
        machine
    }

    #[test]
    fn test_happy_path() {
        let mut machine = streaming();
        assert_eq!(machine.status(), ConversationStatus::Streaming);
        machine.on_open().unwrap();
        machine.settle();
        assert_eq!(machine.status(), ConversationStatus::Idle);
    }

    #[test]
    fn test_concurrent_send_rejected() {
        let mut machine = streaming();
        assert!(matches!(
            machine.begin_send("c1"),
            Err(RelayError::ConcurrentSend(id)) if id == "c1"
        ));
        assert_eq!(machine.status(), ConversationStatus::Streaming);
    }

    #[test]
    fn test_suspend_and_resume_with_matching_token() {
        let mut machine = streaming();
        machine.suspend(&auth_request("rt-1")).unwrap();
        assert_eq!(machine.status(), ConversationStatus::AwaitingAuth);

        assert!(!machine.resume(&ResumeToken::from_backend("rt-0")));
        assert_eq!(machine.status(), ConversationStatus::AwaitingAuth);

        assert!(machine.resume(&ResumeToken::from_backend("rt-1")));
        assert_eq!(machine.status(), ConversationStatus::Streaming);

        // The same token cannot resume twice
        assert!(!machine.resume(&ResumeToken::from_backend("rt-1")));
    }

    #[test]
    fn test_confirmation_suspends_into_awaiting_confirmation() {
        let mut machine = streaming();
        let request = InterruptRequest::confirmation("delete", None, ResumeToken::generate());
        machine.suspend(&request).unwrap();
        assert_eq!(machine.status(), ConversationStatus::AwaitingConfirmation);
    }

    #[test]
    fn test_illegal_transition_moves_to_error() {
        let mut machine = streaming();
        machine.suspend(&auth_request("rt-1")).unwrap();
        let result = machine.suspend(&auth_request("rt-2"));
        assert!(matches!(result, Err(RelayError::Protocol(_))));
        assert_eq!(machine.status(), ConversationStatus::Error);
        assert!(machine.last_error().unwrap().contains("suspend"));
    }

    #[test]
    fn test_open_from_idle_is_protocol_error_but_idle_stays_idle() {
        let mut machine = ConversationStateMachine::new();
        assert!(matches!(machine.on_open(), Err(RelayError::Protocol(_))));
        assert_eq!(machine.status(), ConversationStatus::Idle);
    }

    #[test]
    fn test_fail_then_settle_keeps_reason() {
        let mut machine = streaming();
        machine.fail("connection refused");
        assert_eq!(machine.status(), ConversationStatus::Error);
        machine.settle();
        assert_eq!(machine.status(), ConversationStatus::Idle);
        assert_eq!(machine.last_error(), Some("connection refused"));

        machine.begin_send("c1").unwrap();
        assert!(machine.last_error().is_none());
    }
}
