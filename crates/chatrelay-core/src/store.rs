//! Conversation store
//!
//! Owned by the composition root and shared via `Arc`. Holds every
//! conversation with its state machine, the pending interrupt (at most one
//! per conversation) and the cancellation token of the exchange in flight.
//! Subscribers get read-only snapshots; callbacks run outside any lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RelayError, RelayResult};
use crate::interrupt::{InterruptRequest, InterruptResolution, PendingInterrupt, ResumeToken};
use crate::message::{Backing, Conversation, Message, MessageId};
use crate::state::{ConversationStateMachine, ConversationStatus};

/// Change notification delivered to subscribers
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    /// A message was appended or replaced in place
    MessageUpdated(Message),
    StatusChanged(ConversationStatus),
    InterruptRaised(InterruptRequest),
    InterruptCleared,
}

pub type SubscriptionId = u64;

type Callback = Arc<dyn Fn(&str, &ConversationEvent) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    /// `None` observes every conversation
    conversation_id: Option<String>,
    callback: Callback,
}

struct SlotState {
    conversation: Conversation,
    machine: ConversationStateMachine,
    pending: Option<PendingInterrupt>,
    cancel: Option<CancellationToken>,
}

struct ConversationSlot {
    state: Mutex<SlotState>,
}

impl ConversationSlot {
    fn new(conversation: Conversation) -> Self {
        Self {
            state: Mutex::new(SlotState {
                conversation,
                machine: ConversationStateMachine::new(),
                pending: None,
                cancel: None,
            }),
        }
    }
}

pub struct ConversationStore {
    slots: DashMap<String, Arc<ConversationSlot>>,
    subscribers: RwLock<Vec<Subscriber>>,
    next_subscription: AtomicU64,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Create an empty conversation with a fresh id
    pub fn create_conversation(&self, title: &str, backing: Backing) -> Conversation {
        let id = uuid::Uuid::new_v4().to_string();
        let conversation = Conversation::new(&id, title, backing);
        self.insert(conversation.clone());
        conversation
    }

    /// Add a conversation, replacing any idle one with the same id
    ///
    /// A conversation with an exchange in flight is left alone.
    pub fn insert(&self, mut conversation: Conversation) -> bool {
        if let Some(slot) = self.slot(&conversation.id) {
            let mut state = slot.state.lock();
            if state.machine.status() != ConversationStatus::Idle {
                warn!(
                    conversation_id = %conversation.id,
                    "Not replacing conversation with an exchange in flight"
                );
                return false;
            }
            conversation.status = ConversationStatus::Idle;
            state.conversation = conversation;
            return true;
        }

        conversation.status = ConversationStatus::Idle;
        debug!(conversation_id = %conversation.id, "Registering conversation");
        self.slots.insert(
            conversation.id.clone(),
            Arc::new(ConversationSlot::new(conversation)),
        );
        true
    }

    /// Snapshot of a conversation
    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.slot(conversation_id)
            .map(|slot| slot.state.lock().conversation.clone())
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        self.slots.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn status(&self, conversation_id: &str) -> Option<ConversationStatus> {
        self.slot(conversation_id)
            .map(|slot| slot.state.lock().machine.status())
    }

    /// The interrupt the UI has to answer, if any
    pub fn pending_interrupt(&self, conversation_id: &str) -> Option<InterruptRequest> {
        let slot = self.slot(conversation_id)?;
        let state = slot.state.lock();
        state.pending.as_ref().map(|pending| pending.request.clone())
    }

    /// Answer a pending interrupt
    ///
    /// Returns false without side effects when no interrupt is pending, the
    /// token is stale or mismatched, or the answer does not fit the kind of
    /// interrupt (e.g. `Confirmed` for an auth request).
    pub fn resolve_interrupt(
        &self,
        conversation_id: &str,
        token: &ResumeToken,
        resolution: InterruptResolution,
    ) -> bool {
        let Some(slot) = self.slot(conversation_id) else {
            return false;
        };

        let (delivered, status) = {
            let mut state = slot.state.lock();
            let fits = state.pending.as_ref().is_some_and(|pending| {
                &pending.request.resume_token == token && resolution.fits(pending.request.kind)
            });
            if !fits {
                warn!(
                    conversation_id = %conversation_id,
                    "Rejecting interrupt resolution with stale token or wrong kind"
                );
                return false;
            }

            let resumes = !matches!(resolution, InterruptResolution::Cancelled);
            if resumes && !state.machine.resume(token) {
                return false;
            }

            let Some(pending) = state.pending.take() else {
                return false;
            };
            state.conversation.status = state.machine.status();
            (pending.resolve(resolution), state.machine.status())
        };

        info!(
            conversation_id = %conversation_id,
            delivered = delivered,
            "Interrupt answered"
        );
        self.notify(conversation_id, &ConversationEvent::InterruptCleared);
        self.notify(conversation_id, &ConversationEvent::StatusChanged(status));
        delivered
    }

    /// Cancel the exchange in flight; false when there is none
    pub fn cancel(&self, conversation_id: &str) -> bool {
        let Some(slot) = self.slot(conversation_id) else {
            return false;
        };
        let state = slot.state.lock();
        match &state.cancel {
            Some(token) if !token.is_cancelled() => {
                info!(conversation_id = %conversation_id, "Cancelling exchange");
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Register a callback for one conversation, or all when `None`
    pub fn subscribe<F>(&self, conversation_id: Option<&str>, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &ConversationEvent) + Send + Sync + 'static,
    {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push(Subscriber {
            id,
            conversation_id: conversation_id.map(str::to_string),
            callback: Arc::new(callback),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.id != id);
        subscribers.len() != before
    }

    // Exchange plumbing used by the relay

    /// Start an exchange: `Idle -> Sending` plus a fresh cancellation token
    pub(crate) fn begin_exchange(
        &self,
        conversation_id: &str,
    ) -> RelayResult<(Backing, CancellationToken)> {
        let slot = self.require(conversation_id)?;
        let (backing, token) = {
            let mut state = slot.state.lock();
            state.machine.begin_send(conversation_id)?;
            let token = CancellationToken::new();
            state.cancel = Some(token.clone());
            state.conversation.status = state.machine.status();
            state.conversation.last_error = None;
            (state.conversation.backing, token)
        };
        self.notify(
            conversation_id,
            &ConversationEvent::StatusChanged(ConversationStatus::Sending),
        );
        Ok((backing, token))
    }

    /// Append or replace a message and notify subscribers
    pub(crate) fn upsert_message(&self, conversation_id: &str, message: Message) -> RelayResult<()> {
        let slot = self.require(conversation_id)?;
        slot.state.lock().conversation.upsert_message(message.clone());
        self.notify(conversation_id, &ConversationEvent::MessageUpdated(message));
        Ok(())
    }

    /// Swap in a message for the one stored under `old_id`, e.g. once the
    /// backend has assigned the real id
    pub(crate) fn replace_message(
        &self,
        conversation_id: &str,
        old_id: &MessageId,
        message: Message,
    ) -> RelayResult<()> {
        let slot = self.require(conversation_id)?;
        slot.state
            .lock()
            .conversation
            .replace_message(old_id, message.clone());
        self.notify(conversation_id, &ConversationEvent::MessageUpdated(message));
        Ok(())
    }

    /// Messages in send order, without the given one
    pub(crate) fn history(
        &self,
        conversation_id: &str,
        exclude: &MessageId,
    ) -> RelayResult<Vec<Message>> {
        let slot = self.require(conversation_id)?;
        let state = slot.state.lock();
        Ok(state
            .conversation
            .messages
            .iter()
            .filter(|message| &message.id != exclude)
            .cloned()
            .collect())
    }

    pub(crate) fn on_open(&self, conversation_id: &str) -> RelayResult<()> {
        self.transition(conversation_id, |machine| machine.on_open())
    }

    /// Suspend the exchange and park a responder for the UI to answer
    pub(crate) fn park_interrupt(
        &self,
        conversation_id: &str,
        request: InterruptRequest,
    ) -> RelayResult<oneshot::Receiver<InterruptResolution>> {
        let slot = self.require(conversation_id)?;
        let (rx, status) = {
            let mut state = slot.state.lock();
            let suspended = state.machine.suspend(&request);
            state.conversation.status = state.machine.status();
            suspended?;
            let (pending, rx) = PendingInterrupt::new(request.clone());
            state.pending = Some(pending);
            (rx, state.machine.status())
        };
        self.notify(conversation_id, &ConversationEvent::StatusChanged(status));
        self.notify(conversation_id, &ConversationEvent::InterruptRaised(request));
        Ok(rx)
    }

    /// Drop an unanswered interrupt (timeout or cancellation)
    pub(crate) fn withdraw_interrupt(&self, conversation_id: &str) {
        let Some(slot) = self.slot(conversation_id) else {
            return;
        };
        let withdrawn = slot.state.lock().pending.take().is_some();
        if withdrawn {
            self.notify(conversation_id, &ConversationEvent::InterruptCleared);
        }
    }

    pub(crate) fn fail(&self, conversation_id: &str, reason: &str) {
        let _ = self.transition(conversation_id, |machine| {
            machine.fail(reason);
            Ok(())
        });
    }

    /// Settle back to `Idle`, keeping the failure reason on the conversation
    pub(crate) fn finish_exchange(&self, conversation_id: &str) {
        let Some(slot) = self.slot(conversation_id) else {
            return;
        };
        let had_pending = {
            let mut state = slot.state.lock();
            let failed = state.machine.status() == ConversationStatus::Error;
            state.machine.settle();
            if failed {
                state.conversation.last_error = state.machine.last_error().map(str::to_string);
            }
            state.conversation.status = ConversationStatus::Idle;
            state.cancel = None;
            state.pending.take().is_some()
        };
        if had_pending {
            self.notify(conversation_id, &ConversationEvent::InterruptCleared);
        }
        self.notify(
            conversation_id,
            &ConversationEvent::StatusChanged(ConversationStatus::Idle),
        );
    }

    fn transition<F>(&self, conversation_id: &str, apply: F) -> RelayResult<()>
    where
        F: FnOnce(&mut ConversationStateMachine) -> RelayResult<()>,
    {
        let slot = self.require(conversation_id)?;
        let (result, before, after) = {
            let mut state = slot.state.lock();
            let before = state.machine.status();
            let result = apply(&mut state.machine);
            state.conversation.status = state.machine.status();
            (result, before, state.machine.status())
        };
        if before != after {
            self.notify(conversation_id, &ConversationEvent::StatusChanged(after));
        }
        result
    }

    fn slot(&self, conversation_id: &str) -> Option<Arc<ConversationSlot>> {
        self.slots
            .get(conversation_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn require(&self, conversation_id: &str) -> RelayResult<Arc<ConversationSlot>> {
        self.slot(conversation_id)
            .ok_or_else(|| RelayError::ConversationNotFound(conversation_id.to_string()))
    }

    fn notify(&self, conversation_id: &str, event: &ConversationEvent) {
        let callbacks: Vec<Callback> = self
            .subscribers
            .read()
            .iter()
            .filter(|subscriber| {
                subscriber
                    .conversation_id
                    .as_deref()
                    .map_or(true, |id| id == conversation_id)
            })
            .map(|subscriber| Arc::clone(&subscriber.callback))
            .collect();

        for callback in callbacks {
            callback(conversation_id, event);
        }
    }
}
