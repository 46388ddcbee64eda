//! Stream transports
//!
//! Every transport exposes the same typed event channel regardless of the
//! wire underneath:
//! - `sse`: chunked `text/event-stream` response
//! - `socket`: WebSocket channel with discrete named events
//! - `post`: buffered request/response, replayed as a one-frame stream

pub mod post;
pub mod reconnect;
pub mod socket;
pub mod sse;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::auth::AuthStatus;
use crate::constants;
use crate::error::TransportError;
use crate::message::{Message, Role};
use crate::protocol;

pub use post::PostTransport;
pub use reconnect::ReconnectPolicy;
pub use socket::SocketTransport;
pub use sse::{SseFrameParser, SseTransport};

/// One named frame off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

impl Frame {
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            event: "message".to_string(),
            data: data.into(),
        }
    }
}

/// Frame as seen by the connection loop
pub(crate) enum FrameKind {
    Message(Frame),
    Done(String),
    Error(String),
}

impl FrameKind {
    pub(crate) fn classify(frame: Frame) -> Self {
        match frame.event.as_str() {
            "done" => FrameKind::Done(frame.data),
            "error" => FrameKind::Error(protocol::error_text(&frame.data)),
            _ if frame.data.trim() == constants::transport::DONE_MARKER => {
                FrameKind::Done(String::new())
            }
            _ => FrameKind::Message(frame),
        }
    }
}

/// Events delivered by a stream handle
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connection established (emitted at most once per handle)
    Open,
    /// A complete frame
    Message(Frame),
    /// Terminal failure
    Error(TransportError),
    /// Clean end of stream; payload is the raw `done` frame data, possibly empty
    Done(String),
    /// Handle closed; always the last event
    Close,
}

/// History entry as the backend expects it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// Body of a send request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBody {
    pub messages: Vec<WireMessage>,
    pub enabled_tools: Vec<String>,
    pub stream: bool,
    pub auth_status: AuthStatus,
    pub context_data: Value,
}

/// Everything a transport needs to open one stream
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub conversation_id: String,
    pub body: RequestBody,
    pub reconnect: ReconnectPolicy,
}

/// Opens streams; implementations spawn a worker and return immediately
pub trait StreamTransport: Send + Sync {
    fn open(&self, request: StreamRequest) -> StreamHandle;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Open,
    /// Terminal event seen or close requested; `Close` not yet delivered
    Closing,
    Closed,
}

/// Receiving end of an open stream
pub struct StreamHandle {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    cancel: CancellationToken,
    state: HandleState,
}

impl StreamHandle {
    /// Build a handle around an event channel fed by a worker
    pub fn new(events: mpsc::UnboundedReceiver<TransportEvent>, cancel: CancellationToken) -> Self {
        Self {
            events,
            cancel,
            state: HandleState::Open,
        }
    }

    /// Spawn a worker task and return the handle observing it
    pub fn spawn<F, Fut>(worker: F) -> Self
    where
        F: FnOnce(EventSink, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = worker(EventSink::new(tx), cancel.clone());
        tokio::spawn(task);
        Self::new(rx, cancel)
    }

    /// Next event, or `None` once `Close` has been delivered
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        match self.state {
            HandleState::Closed => None,
            HandleState::Closing => {
                self.state = HandleState::Closed;
                Some(TransportEvent::Close)
            }
            HandleState::Open => match self.events.recv().await {
                Some(event) => {
                    if matches!(event, TransportEvent::Done(_) | TransportEvent::Error(_)) {
                        self.state = HandleState::Closing;
                    }
                    Some(event)
                }
                None => {
                    self.state = HandleState::Closed;
                    Some(TransportEvent::Close)
                }
            },
        }
    }

    /// Close the stream
    ///
    /// Idempotent: only the first call on an open handle has an effect, and
    /// it results in exactly one `Close` event. Queued events are discarded.
    pub fn close(&mut self) {
        if self.state != HandleState::Open {
            return;
        }
        debug!("Closing stream handle");
        self.cancel.cancel();
        self.events.close();
        self.state = HandleState::Closing;
    }

    pub fn is_closed(&self) -> bool {
        self.state != HandleState::Open
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Sending side used by transport workers
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
    opened: Arc<AtomicBool>,
}

impl EventSink {
    fn new(tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            tx,
            opened: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Emit `Open` unless a previous connection attempt already did
    pub fn open(&self) {
        if !self.opened.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(TransportEvent::Open);
        }
    }

    pub fn message(&self, frame: Frame) {
        let _ = self.tx.send(TransportEvent::Message(frame));
    }

    pub fn done(&self, payload: String) {
        let _ = self.tx.send(TransportEvent::Done(payload));
    }

    pub fn error(&self, error: TransportError) {
        let _ = self.tx.send(TransportEvent::Error(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scripted(events: Vec<TransportEvent>) -> StreamHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            tx.send(event).unwrap();
        }
        StreamHandle::new(rx, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_done_is_followed_by_single_close() {
        let mut handle = scripted(vec![TransportEvent::Open, TransportEvent::Done(String::new())]);
        assert!(matches!(handle.next_event().await, Some(TransportEvent::Open)));
        assert!(matches!(handle.next_event().await, Some(TransportEvent::Done(_))));
        assert!(matches!(handle.next_event().await, Some(TransportEvent::Close)));
        assert!(handle.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut handle = scripted(vec![
            TransportEvent::Open,
            TransportEvent::Message(Frame::message("{}")),
        ]);
        handle.close();
        handle.close();
        handle.close();
        assert!(matches!(handle.next_event().await, Some(TransportEvent::Close)));
        assert!(handle.next_event().await.is_none());
        handle.close();
        assert!(handle.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_close_after_done_has_no_effect() {
        let mut handle = scripted(vec![TransportEvent::Done(String::new())]);
        assert!(matches!(handle.next_event().await, Some(TransportEvent::Done(_))));
        handle.close();
        assert!(matches!(handle.next_event().await, Some(TransportEvent::Close)));
        assert!(handle.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_close_cancels_worker() {
        let mut handle = StreamHandle::spawn(|sink, cancel| async move {
            sink.open();
            cancel.cancelled().await;
        });
        assert!(matches!(handle.next_event().await, Some(TransportEvent::Open)));
        handle.close();
        assert!(handle.cancel.is_cancelled());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_sink_emits_open_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        sink.open();
        sink.clone().open();
        drop(sink);
        assert!(matches!(rx.recv().await, Some(TransportEvent::Open)));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_classify_frames() {
        assert!(matches!(
            FrameKind::classify(Frame::message("[DONE]")),
            FrameKind::Done(_)
        ));
        let error = Frame {
            event: "error".to_string(),
            data: r#"{"error":"quota exceeded"}"#.to_string(),
        };
        match FrameKind::classify(error) {
            FrameKind::Error(text) => assert_eq!(text, "quota exceeded"),
            _ => panic!("Expected error frame"),
        }
        assert!(matches!(
            FrameKind::classify(Frame::message(r#"{"content":"Hi"}"#)),
            FrameKind::Message(_)
        ));
    }
}
