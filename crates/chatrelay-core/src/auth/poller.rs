//! Auth-status poller
//!
//! Watches a pending auth interrupt and resolves it once the broker reports
//! the service as connected. The UI can still resolve or cancel the same
//! interrupt itself; whichever answer arrives first wins.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AuthStatus, ToolAuthBroker};
use crate::interrupt::{InterruptKind, InterruptResolution};
use crate::store::ConversationStore;

pub struct AuthStatusPoller {
    broker: Arc<dyn ToolAuthBroker>,
    store: Arc<ConversationStore>,
    interval: Duration,
}

impl AuthStatusPoller {
    pub fn new(
        broker: Arc<dyn ToolAuthBroker>,
        store: Arc<ConversationStore>,
        interval: Duration,
    ) -> Self {
        Self {
            broker,
            store,
            interval,
        }
    }

    /// Poll until the pending auth interrupt of `conversation_id` resolves
    ///
    /// `known_status` is the auth status the exchange was sent with; the
    /// resolution carries it with the newly connected service set to true.
    /// Stops as soon as the interrupt is gone or replaced.
    pub fn spawn(&self, conversation_id: &str, known_status: AuthStatus) -> JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let store = Arc::clone(&self.store);
        let interval = self.interval;
        let conversation_id = conversation_id.to_string();

        tokio::spawn(async move {
            let Some(request) = store.pending_interrupt(&conversation_id) else {
                debug!(conversation_id = %conversation_id, "No pending interrupt to poll");
                return;
            };
            let (InterruptKind::Auth, Some(service)) = (request.kind, request.service.clone())
            else {
                debug!("Pending interrupt is not an auth request, not polling");
                return;
            };
            info!(
                conversation_id = %conversation_id,
                service = %service,
                "Polling tool auth status"
            );

            loop {
                tokio::time::sleep(interval).await;

                let still_pending = store
                    .pending_interrupt(&conversation_id)
                    .is_some_and(|pending| pending.resume_token == request.resume_token);
                if !still_pending {
                    debug!(service = %service, "Interrupt resolved elsewhere, poller stopping");
                    return;
                }

                match broker.check_auth_status(&service).await {
                    Ok(state) if state.authenticated => {
                        let mut auth_status = known_status;
                        auth_status.insert(service.clone(), true);
                        let accepted = store.resolve_interrupt(
                            &conversation_id,
                            &request.resume_token,
                            InterruptResolution::Authenticated { auth_status },
                        );
                        info!(service = %service, accepted = accepted, "Tool authenticated");
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(service = %service, "Auth status check failed: {}", e),
                }
            }
        })
    }
}
