//! Test doubles: a scripted transport, a recording chat backend and a
//! canned-response HTTP server for the real transports

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{PersistenceError, TransportError};
use crate::message::{Message, MessageId, Role};
use crate::persistence::{ChatBackend, ChatRecord, MessageUpdate};
use crate::auth::AuthStatus;
use crate::transport::{
    Frame, ReconnectPolicy, RequestBody, StreamHandle, StreamRequest, StreamTransport,
    TransportEvent, WireMessage,
};

/// One scripted transport action
#[derive(Debug, Clone)]
pub enum Step {
    Open,
    /// `message` frame with this data
    Message(String),
    Done,
    Fail(TransportError),
    Sleep(Duration),
    /// Stay open until the handle is closed
    Hang,
}

pub fn content(text: &str) -> Step {
    Step::Message(serde_json::json!({ "content": text }).to_string())
}

pub fn control(value: serde_json::Value) -> Step {
    Step::Message(value.to_string())
}

/// Transport replaying one script per `open`, recording every request
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().clone()
    }

    pub fn open_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl StreamTransport for ScriptedTransport {
    fn open(&self, request: StreamRequest) -> StreamHandle {
        self.requests.lock().push(request);
        let steps = self.scripts.lock().pop_front().unwrap_or_default();

        StreamHandle::spawn(move |sink, cancel| async move {
            for step in steps {
                if cancel.is_cancelled() {
                    return;
                }
                match step {
                    Step::Open => sink.open(),
                    Step::Message(data) => sink.message(Frame::message(data)),
                    Step::Done => sink.done(String::new()),
                    Step::Fail(error) => sink.error(error),
                    Step::Sleep(duration) => tokio::time::sleep(duration).await,
                    Step::Hang => {
                        cancel.cancelled().await;
                        return;
                    }
                }
            }
        })
    }
}

/// In-memory `ChatBackend` counting every call
#[derive(Default)]
pub struct RecordingBackend {
    chats: Mutex<HashMap<String, ChatRecord>>,
    unavailable: bool,
    /// `create_message` never returns
    stalled: bool,
    create_calls: AtomicUsize,
    updates: Mutex<Vec<(MessageId, MessageUpdate)>>,
    next_id: AtomicUsize,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that already knows chat `id`
    pub fn with_chat(id: &str) -> Self {
        let backend = Self::new();
        let now = Utc::now();
        backend.chats.lock().insert(
            id.to_string(),
            ChatRecord {
                id: id.to_string(),
                title: "Test".to_string(),
                created_at: now,
                updated_at: now,
                messages: Vec::new(),
            },
        );
        backend
    }

    /// Backend whose `create_message` hangs forever
    pub fn stalled(id: &str) -> Self {
        Self {
            stalled: true,
            ..Self::with_chat(id)
        }
    }

    /// Backend that rejects every call as unavailable
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.updates.lock().len()
    }

    pub fn updates(&self) -> Vec<(MessageId, MessageUpdate)> {
        self.updates.lock().clone()
    }

    pub fn messages(&self, chat_id: &str) -> Vec<Message> {
        self.chats
            .lock()
            .get(chat_id)
            .map(|chat| chat.messages.clone())
            .unwrap_or_default()
    }

    fn check(&self) -> Result<(), PersistenceError> {
        if self.unavailable {
            return Err(PersistenceError::Unavailable("backend offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatBackend for RecordingBackend {
    async fn create_chat(&self, title: &str) -> Result<ChatRecord, PersistenceError> {
        self.check()?;
        let now = Utc::now();
        let record = ChatRecord {
            id: format!("chat-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        };
        self.chats.lock().insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn create_message(
        &self,
        chat_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message, PersistenceError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.stalled {
            std::future::pending::<()>().await;
        }
        self.check()?;
        let mut chats = self.chats.lock();
        let chat = chats
            .get_mut(chat_id)
            .ok_or_else(|| PersistenceError::NotFound(format!("chat {chat_id}")))?;
        let id = MessageId::Server(format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        let message = Message::new(id, chat_id, role, content.to_string());
        chat.messages.push(message.clone());
        Ok(message)
    }

    async fn update_message(
        &self,
        id: &MessageId,
        update: MessageUpdate,
    ) -> Result<Message, PersistenceError> {
        self.updates.lock().push((id.clone(), update.clone()));
        self.check()?;
        let mut chats = self.chats.lock();
        let message = chats
            .values_mut()
            .flat_map(|chat| chat.messages.iter_mut())
            .find(|message| &message.id == id)
            .ok_or_else(|| PersistenceError::NotFound(format!("message {id}")))?;
        message.content = update.content;
        message.is_partial = update.is_partial;
        message.is_error = update.is_error;
        Ok(message.clone())
    }

    async fn get_chat_by_id(&self, id: &str) -> Result<Option<ChatRecord>, PersistenceError> {
        self.check()?;
        Ok(self.chats.lock().get(id).cloned())
    }
}

/// Request for conversation `c1` with one user message
pub fn stream_request(reconnect: ReconnectPolicy) -> StreamRequest {
    StreamRequest {
        conversation_id: "c1".to_string(),
        body: RequestBody {
            messages: vec![WireMessage {
                role: Role::User,
                content: "Hi".to_string(),
            }],
            enabled_tools: Vec::new(),
            stream: true,
            auth_status: AuthStatus::new(),
            context_data: serde_json::json!({}),
        },
        reconnect,
    }
}

/// Fast reconnects for tests against a live server
pub fn quick_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts: 3,
        delay_unit: Duration::from_millis(10),
    }
}

/// Read a handle to the end, failing the test if it stalls
pub async fn collect_events(mut handle: StreamHandle) -> Vec<TransportEvent> {
    let mut events = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(5), handle.next_event())
        .await
        .expect("stream stalled")
    {
        events.push(event);
    }
    events
}

/// One HTTP reply, delimited by the server closing the connection
#[derive(Debug, Clone)]
pub struct CannedResponse {
    raw: String,
    hold_open: bool,
}

impl CannedResponse {
    pub fn new(status: &str, content_type: &str, body: &str) -> Self {
        Self {
            raw: format!(
                "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\nconnection: close\r\n\r\n{body}"
            ),
            hold_open: false,
        }
    }

    pub fn sse(body: &str) -> Self {
        Self::new("200 OK", "text/event-stream", body)
    }

    pub fn json(status: &str, body: &str) -> Self {
        Self::new(status, "application/json", body)
    }

    /// Leave the connection open after writing, like a stalled stream
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

/// Local HTTP server answering each connection with the next canned reply
///
/// Connections beyond the script are closed without a reply.
pub struct TestServer {
    base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    pub async fn start(responses: Vec<CannedResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let script = Arc::new(Mutex::new(VecDeque::from(responses)));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let script = Arc::clone(&script);
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let request = read_request(&mut socket).await;
                    recorded.lock().push(request);
                    let Some(response) = script.lock().pop_front() else {
                        return;
                    };
                    let _ = socket.write_all(response.raw.as_bytes()).await;
                    let _ = socket.flush().await;
                    if response.hold_open {
                        std::future::pending::<()>().await;
                    }
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            requests,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Raw requests (head and body) in arrival order
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_string();
            let length = head
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while buf.len() < end + 4 + length {
                match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
            return String::from_utf8_lossy(&buf).to_string();
        }
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return String::from_utf8_lossy(&buf).to_string(),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}
