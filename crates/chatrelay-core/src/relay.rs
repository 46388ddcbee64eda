//! Message relay
//!
//! Drives one exchange end to end: show the user message and an assistant
//! placeholder, stream fragments into it, park on interrupts and resume with
//! a fresh stream, then finalize and commit exactly once.
//!
//! Persisting the user message and allocating the placeholder run in the
//! background. The stream never waits on them; finalize waits a bounded time
//! for the placeholder's server id and commits under the local id otherwise.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::auth::AuthStatus;
use crate::constants;
use crate::error::{RelayError, RelayResult};
use crate::interrupt::{await_resolution, InterruptRequest, InterruptResolution};
use crate::message::{Backing, Message, MessageFlags, MessageId, Role};
use crate::persistence::PersistenceBridge;
use crate::protocol::{self, StreamEvent};
use crate::store::ConversationStore;
use crate::transport::{
    ReconnectPolicy, RequestBody, StreamHandle, StreamRequest, StreamTransport, TransportEvent,
    WireMessage,
};

/// Per-send options supplied by the UI
#[derive(Debug, Clone, PartialEq)]
pub struct SendOptions {
    pub enabled_tools: Vec<String>,
    /// When false no tools are offered, whatever `enabled_tools` says
    pub use_tools: bool,
    pub auth_status: AuthStatus,
    pub context_data: Value,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            enabled_tools: Vec::new(),
            use_tools: true,
            auth_status: AuthStatus::new(),
            context_data: Value::Object(Map::new()),
        }
    }
}

/// Relay tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    /// How long an interrupt may wait for the UI before the exchange is cancelled
    pub interrupt_timeout: Duration,
    /// Reconnect policy handed to every stream the relay opens
    pub reconnect: ReconnectPolicy,
    /// How long finalize waits for background persistence
    pub persistence_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            interrupt_timeout: constants::conversation::INTERRUPT_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            persistence_timeout: constants::conversation::PERSISTENCE_TIMEOUT,
        }
    }
}

/// How an exchange ended
#[derive(Debug)]
enum Ending {
    Done,
    /// Transport failure or server error frame
    Failed(String),
    Cancelled,
    TimedOut(String),
    Protocol(String),
}

/// Result of driving one stream
enum Leg {
    Finished(Ending),
    Suspended(InterruptRequest, oneshot::Receiver<InterruptResolution>),
}

pub struct MessageRelay {
    store: Arc<ConversationStore>,
    transport: Arc<dyn StreamTransport>,
    bridge: Arc<PersistenceBridge>,
    settings: RelaySettings,
}

impl MessageRelay {
    pub fn new(
        store: Arc<ConversationStore>,
        transport: Arc<dyn StreamTransport>,
        bridge: Arc<PersistenceBridge>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            store,
            transport,
            bridge,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Send `text` and resolve with the final assistant message
    ///
    /// Transport failures and cancellations resolve with an `is_error`
    /// message. Rejects only on `ConcurrentSend`, `ConversationNotFound`
    /// and `Protocol`.
    pub async fn send(
        &self,
        conversation_id: &str,
        text: &str,
        options: SendOptions,
    ) -> RelayResult<Message> {
        let (backing, cancel) = self.store.begin_exchange(conversation_id)?;
        info!(
            conversation_id = %conversation_id,
            backing = ?backing,
            "Sending message ({} chars)",
            text.len()
        );

        let result = self
            .exchange(conversation_id, backing, text, &options, &cancel)
            .await;
        self.store.finish_exchange(conversation_id);

        match &result {
            Ok(message) => info!(
                conversation_id = %conversation_id,
                message_id = %message.id,
                is_error = message.is_error,
                "Exchange finished"
            ),
            Err(e) => error!(conversation_id = %conversation_id, "Exchange failed: {}", e),
        }
        result
    }

    /// Cancel the exchange in flight; false when there is none
    pub fn cancel(&self, conversation_id: &str) -> bool {
        self.store.cancel(conversation_id)
    }

    async fn exchange(
        &self,
        conversation_id: &str,
        backing: Backing,
        text: &str,
        options: &SendOptions,
        cancel: &CancellationToken,
    ) -> RelayResult<Message> {
        let user = Message::new(MessageId::local(), conversation_id, Role::User, text.to_string());
        let mut placeholder = Message::new(
            MessageId::local(),
            conversation_id,
            Role::Assistant,
            String::new(),
        );
        placeholder.is_partial = true;
        self.store.upsert_message(conversation_id, user.clone())?;
        self.store
            .upsert_message(conversation_id, placeholder.clone())?;

        let persisting = self.persist_in_background(conversation_id, backing, user);

        let mut auth_status = options.auth_status.clone();
        let mut context_data = options.context_data.clone();

        let ending = loop {
            if cancel.is_cancelled() {
                break Ending::Cancelled;
            }

            let request = self.stream_request(
                conversation_id,
                &placeholder.id,
                options,
                &auth_status,
                &context_data,
            )?;
            let mut handle = self.transport.open(request);

            let (interrupt, rx) = match self
                .drive(conversation_id, &mut handle, &mut placeholder, cancel)
                .await
            {
                Leg::Finished(ending) => {
                    handle.close();
                    break ending;
                }
                Leg::Suspended(interrupt, rx) => (interrupt, rx),
            };

            // The suspended stream stays open until the UI answers
            let resolution = self.await_interrupt(conversation_id, rx, cancel).await;
            handle.close();

            match resolution {
                Ok(InterruptResolution::Authenticated {
                    auth_status: updated,
                }) => {
                    info!(
                        conversation_id = %conversation_id,
                        service = ?interrupt.service,
                        "Resuming after tool authentication"
                    );
                    auth_status = updated;
                    context_data = with_resume_token(context_data, &interrupt);
                }
                Ok(InterruptResolution::Confirmed) => {
                    info!(
                        conversation_id = %conversation_id,
                        action = ?interrupt.action,
                        "Resuming after confirmation"
                    );
                    context_data = with_confirmed_action(context_data, &interrupt);
                }
                Ok(InterruptResolution::Cancelled) => break Ending::Cancelled,
                Err(ending) => {
                    self.store.withdraw_interrupt(conversation_id);
                    break ending;
                }
            }
        };

        self.finalize(conversation_id, backing, placeholder, ending, persisting)
            .await
    }

    /// Commit the user message, then allocate the placeholder record
    ///
    /// Runs in order so the backend sees the user message first. Resolves to
    /// the placeholder's id when one was allocated.
    fn persist_in_background(
        &self,
        conversation_id: &str,
        backing: Backing,
        user: Message,
    ) -> JoinHandle<Option<MessageId>> {
        let store = Arc::clone(&self.store);
        let bridge = Arc::clone(&self.bridge);
        let conversation_id = conversation_id.to_string();

        tokio::spawn(async move {
            match bridge
                .commit_user_message(&conversation_id, backing, &user.content)
                .await
            {
                Ok(mut committed) => {
                    committed.created_at = user.created_at;
                    if let Err(e) = store.replace_message(&conversation_id, &user.id, committed) {
                        debug!(conversation_id = %conversation_id, "User message not updated: {}", e);
                    }
                }
                Err(e) => {
                    warn!(conversation_id = %conversation_id, "Failed to commit user message: {}", e)
                }
            }

            match bridge.allocate_placeholder(&conversation_id, backing).await {
                Ok(message) => Some(message.id),
                Err(e) => {
                    warn!(conversation_id = %conversation_id, "Failed to allocate placeholder: {}", e);
                    None
                }
            }
        })
    }

    /// Wait for the placeholder's server id, giving up after the bound
    async fn allocated_id(
        &self,
        conversation_id: &str,
        mut persisting: JoinHandle<Option<MessageId>>,
    ) -> Option<MessageId> {
        match tokio::time::timeout(self.settings.persistence_timeout, &mut persisting).await {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                warn!(conversation_id = %conversation_id, "Persistence task failed: {}", e);
                None
            }
            Err(_) => {
                persisting.abort();
                warn!(
                    conversation_id = %conversation_id,
                    "Backend did not allocate a placeholder within {:?}, keeping the reply locally",
                    self.settings.persistence_timeout
                );
                None
            }
        }
    }

    fn stream_request(
        &self,
        conversation_id: &str,
        placeholder_id: &MessageId,
        options: &SendOptions,
        auth_status: &AuthStatus,
        context_data: &Value,
    ) -> RelayResult<StreamRequest> {
        // Failed replies are UI notices, not conversation
        let messages = self
            .store
            .history(conversation_id, placeholder_id)?
            .iter()
            .filter(|message| !message.is_error)
            .map(WireMessage::from)
            .collect();

        Ok(StreamRequest {
            conversation_id: conversation_id.to_string(),
            body: RequestBody {
                messages,
                enabled_tools: if options.use_tools {
                    options.enabled_tools.clone()
                } else {
                    Vec::new()
                },
                stream: true,
                auth_status: auth_status.clone(),
                context_data: context_data.clone(),
            },
            reconnect: self.settings.reconnect.clone(),
        })
    }

    /// Apply events from one stream until it ends or suspends
    async fn drive(
        &self,
        conversation_id: &str,
        handle: &mut StreamHandle,
        placeholder: &mut Message,
        cancel: &CancellationToken,
    ) -> Leg {
        let mut baseline_set = false;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Leg::Finished(Ending::Cancelled),
                event = handle.next_event() => event,
            };

            let event = match event {
                None | Some(TransportEvent::Close) => {
                    return Leg::Finished(Ending::Failed(
                        "stream closed before completion".to_string(),
                    ))
                }
                Some(event) => event,
            };

            let events = match protocol::decode(&event) {
                Ok(events) => events,
                Err(e) => return Leg::Finished(Ending::Protocol(protocol_reason(e))),
            };

            for stream_event in events {
                if cancel.is_cancelled() {
                    return Leg::Finished(Ending::Cancelled);
                }
                match stream_event {
                    StreamEvent::Open => {
                        if let Err(e) = self.store.on_open(conversation_id) {
                            return Leg::Finished(Ending::Protocol(protocol_reason(e)));
                        }
                    }
                    StreamEvent::Fragment(payload) => {
                        self.apply_fragment(conversation_id, placeholder, payload, &mut baseline_set)
                    }
                    StreamEvent::ToolAuthRequired(request)
                    | StreamEvent::ConfirmationRequired(request) => {
                        return match self.store.park_interrupt(conversation_id, request.clone()) {
                            Ok(rx) => Leg::Suspended(request, rx),
                            Err(e) => Leg::Finished(Ending::Protocol(protocol_reason(e))),
                        };
                    }
                    StreamEvent::Done => return Leg::Finished(Ending::Done),
                    StreamEvent::Error(reason) => return Leg::Finished(Ending::Failed(reason)),
                }
            }
        }
    }

    /// Apply a cumulative fragment
    ///
    /// The first fragment of each stream sets the baseline. After that a
    /// payload equal to, or a prefix of, the current content is stale.
    fn apply_fragment(
        &self,
        conversation_id: &str,
        placeholder: &mut Message,
        payload: String,
        baseline_set: &mut bool,
    ) {
        let stale = if *baseline_set {
            placeholder.content.starts_with(&payload)
        } else {
            *baseline_set = true;
            payload == placeholder.content
        };
        if stale {
            trace!("Ignoring stale fragment ({} chars)", payload.len());
            return;
        }

        placeholder.content = payload;
        if let Err(e) = self
            .store
            .upsert_message(conversation_id, placeholder.clone())
        {
            warn!(conversation_id = %conversation_id, "Failed to publish fragment: {}", e);
        }
    }

    async fn await_interrupt(
        &self,
        conversation_id: &str,
        rx: oneshot::Receiver<InterruptResolution>,
        cancel: &CancellationToken,
    ) -> Result<InterruptResolution, Ending> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Ending::Cancelled),
            result = await_resolution(conversation_id, rx, self.settings.interrupt_timeout) => {
                result.map_err(|e| {
                    warn!(conversation_id = %conversation_id, "{}", e);
                    Ending::TimedOut(e.to_string())
                })
            }
        }
    }

    async fn finalize(
        &self,
        conversation_id: &str,
        backing: Backing,
        mut placeholder: Message,
        ending: Ending,
        persisting: JoinHandle<Option<MessageId>>,
    ) -> RelayResult<Message> {
        debug!(conversation_id = %conversation_id, "Finalizing exchange: {:?}", ending);
        let content = std::mem::take(&mut placeholder.content);

        let (content, flags, rejection) = match ending {
            Ending::Done => (content, MessageFlags::COMPLETE, None),
            Ending::Failed(reason) => {
                error!(conversation_id = %conversation_id, "Stream failed: {}", reason);
                self.store.fail(conversation_id, &reason);
                if content.is_empty() {
                    let notice = constants::texts::OFFLINE_MESSAGE.to_string();
                    (notice, MessageFlags::FAILED, None)
                } else {
                    (content, MessageFlags::INTERRUPTED, None)
                }
            }
            Ending::Cancelled => {
                let flags = notice_flags(&content);
                (
                    with_notice(content, constants::texts::CANCELLED_MESSAGE),
                    flags,
                    None,
                )
            }
            Ending::TimedOut(reason) => {
                self.store.fail(conversation_id, &reason);
                let flags = notice_flags(&content);
                (
                    with_notice(content, constants::texts::INTERRUPT_TIMEOUT_MESSAGE),
                    flags,
                    None,
                )
            }
            Ending::Protocol(reason) => {
                self.store.fail(conversation_id, &reason);
                let flags = notice_flags(&content);
                (
                    with_notice(content, constants::texts::PROTOCOL_ERROR_MESSAGE),
                    flags,
                    Some(RelayError::Protocol(reason)),
                )
            }
        };

        let local_id = placeholder.id.clone();
        if let Some(id) = self.allocated_id(conversation_id, persisting).await {
            placeholder.id = id;
        }
        placeholder.content = content;
        placeholder.apply_flags(flags);
        self.store
            .replace_message(conversation_id, &local_id, placeholder.clone())?;

        if let Err(e) = self
            .bridge
            .commit_assistant_message(
                conversation_id,
                backing,
                &placeholder.id,
                &placeholder.content,
                flags,
            )
            .await
        {
            warn!(
                conversation_id = %conversation_id,
                message_id = %placeholder.id,
                "Failed to commit assistant message: {}",
                e
            );
        }

        match rejection {
            Some(e) => Err(e),
            None => Ok(placeholder),
        }
    }
}

fn protocol_reason(error: RelayError) -> String {
    match error {
        RelayError::Protocol(reason) => reason,
        other => other.to_string(),
    }
}

fn notice_flags(content: &str) -> MessageFlags {
    if content.is_empty() {
        MessageFlags::FAILED
    } else {
        MessageFlags::INTERRUPTED
    }
}

fn with_notice(content: String, notice: &str) -> String {
    if content.is_empty() {
        notice.to_string()
    } else {
        format!("{content}\n\n{notice}")
    }
}

fn context_object(context: Value) -> Map<String, Value> {
    match context {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

fn with_resume_token(context: Value, interrupt: &InterruptRequest) -> Value {
    let mut map = context_object(context);
    map.insert(
        "resumeToken".to_string(),
        Value::String(interrupt.resume_token.to_string()),
    );
    Value::Object(map)
}

fn with_confirmed_action(context: Value, interrupt: &InterruptRequest) -> Value {
    let mut map = context_object(with_resume_token(context, interrupt));
    map.insert(
        "confirmedAction".to_string(),
        json!({
            "action": interrupt.action,
            "details": interrupt.details,
        }),
    );
    Value::Object(map)
}
