//! SSE (Server-Sent Events) stream transport
//!
//! Reads a chunked `text/event-stream` response and turns it into frames.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tracing::{debug, error, info, trace, warn};

use super::reconnect::{run_with_reconnect, StreamOutcome};
use super::{EventSink, Frame, FrameKind, StreamHandle, StreamRequest, StreamTransport};
use crate::client::BackendClient;
use crate::error::TransportError;

/// Incremental SSE frame parser
///
/// Network reads can end anywhere, including in the middle of a line or a
/// multi-byte character. The unterminated tail of each read is carried over
/// and prepended to the next one; only complete frames are returned.
#[derive(Debug, Default)]
pub struct SseFrameParser {
    /// Bytes after the last newline of the previous read
    partial_line: Vec<u8>,
    /// `event:` field of the frame being assembled
    event_name: Option<String>,
    /// `data:` lines of the frame being assembled
    data_lines: Vec<String>,
    /// Frames dispatched so far
    frame_count: usize,
    /// Bytes received counter
    bytes_received: usize,
}

impl SseFrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network read, returning every frame it completed
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.bytes_received += bytes.len();
        self.partial_line.extend_from_slice(bytes);

        let Some(last_newline) = self.partial_line.iter().rposition(|b| *b == b'\n') else {
            trace!(
                "SSE read of {} bytes has no line break, carrying over",
                bytes.len()
            );
            return Vec::new();
        };

        let tail = self.partial_line.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial_line, tail);
        let text = String::from_utf8_lossy(&complete);
        // complete always ends in '\n'; drop it so split yields only real lines
        let lines = text.strip_suffix('\n').unwrap_or(&*text);

        let mut frames = Vec::new();
        for line in lines.split('\n') {
            if let Some(frame) = self.process_line(line.strip_suffix('\r').unwrap_or(line)) {
                frames.push(frame);
            }
        }

        debug!(
            "SSE read: {} bytes, {} frames (total: {} bytes, {} frames)",
            bytes.len(),
            frames.len(),
            self.bytes_received,
            self.frame_count
        );
        frames
    }

    /// Flush at end of stream
    ///
    /// A trailing line without a newline is processed, and a frame that was
    /// never terminated by a blank line is still dispatched.
    pub fn finish(&mut self) -> Option<Frame> {
        if !self.partial_line.is_empty() {
            let rest = std::mem::take(&mut self.partial_line);
            let line = String::from_utf8_lossy(&rest).into_owned();
            if let Some(frame) = self.process_line(line.trim_end_matches('\r')) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event_name = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            // id and retry are not used by this backend
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<Frame> {
        let event = self.event_name.take();
        if self.data_lines.is_empty() {
            return None;
        }
        self.frame_count += 1;
        Some(Frame {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "message".to_string()),
            data: std::mem::take(&mut self.data_lines).join("\n"),
        })
    }
}

/// Transport reading the backend's SSE stream endpoint
pub struct SseTransport {
    client: Arc<BackendClient>,
}

impl SseTransport {
    pub fn new(client: Arc<BackendClient>) -> Self {
        Self { client }
    }
}

impl StreamTransport for SseTransport {
    fn open(&self, request: StreamRequest) -> StreamHandle {
        let client = Arc::clone(&self.client);
        StreamHandle::spawn(move |sink, cancel| async move {
            let policy = request.reconnect.clone();
            run_with_reconnect(&policy, &sink, &cancel, || {
                connect_once(Arc::clone(&client), request.clone(), sink.clone())
            })
            .await;
        })
    }
}

async fn connect_once(
    client: Arc<BackendClient>,
    request: StreamRequest,
    sink: EventSink,
) -> Result<StreamOutcome, TransportError> {
    let started = Instant::now();
    let url = client.stream_url(&request.conversation_id, &request.body)?;
    info!(
        conversation_id = %request.conversation_id,
        "Opening SSE stream ({} history messages)",
        request.body.messages.len()
    );

    let builder = client
        .http()
        .get(url)
        .header("accept", "text/event-stream");
    let response = client.authorize(builder).await.send().await?;
    let response = client.check_status(response).await?;
    info!("SSE stream open in {:?}", started.elapsed());
    sink.open();

    let mut parser = SseFrameParser::new();
    let mut stream = response.bytes_stream();
    let mut chunk_count = 0usize;

    let idle_timeout = client.idle_timeout();

    loop {
        let Ok(next) = tokio::time::timeout(idle_timeout, stream.next()).await else {
            warn!("SSE stream idle for {:?}, dropping connection", idle_timeout);
            return Err(TransportError::Disconnected(format!(
                "no data for {idle_timeout:?}"
            )));
        };
        let Some(chunk) = next else {
            break;
        };
        chunk_count += 1;
        let bytes = chunk.map_err(|e| {
            error!("SSE read error at chunk #{}: {}", chunk_count, e);
            TransportError::Disconnected(e.to_string())
        })?;
        for frame in parser.push(&bytes) {
            if let Some(outcome) = forward(frame, &sink)? {
                return Ok(outcome);
            }
        }
    }

    if let Some(frame) = parser.finish() {
        if let Some(outcome) = forward(frame, &sink)? {
            return Ok(outcome);
        }
    }

    info!(
        "SSE stream ended after {} chunks without a done frame",
        chunk_count
    );
    Ok(StreamOutcome::Ended)
}

/// Route a frame; `Some` when it ends the stream
pub(crate) fn forward(
    frame: Frame,
    sink: &EventSink,
) -> Result<Option<StreamOutcome>, TransportError> {
    match FrameKind::classify(frame) {
        FrameKind::Message(frame) => {
            sink.message(frame);
            Ok(None)
        }
        FrameKind::Done(payload) => Ok(Some(StreamOutcome::Done(payload))),
        FrameKind::Error(message) => Err(TransportError::Server(message)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::auth::StaticToken;
    use crate::testing::{
        collect_events, quick_reconnect, stream_request, CannedResponse, TestServer,
    };
    use crate::transport::{ReconnectPolicy, TransportEvent};

    fn data(frames: &[Frame]) -> Vec<&str> {
        frames.iter().map(|f| f.data.as_str()).collect()
    }

    #[test]
    fn test_single_complete_frame() {
        let mut parser = SseFrameParser::new();
        let frames = parser.push(b"data: {\"content\":\"H\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "message");
        assert_eq!(frames[0].data, "{\"content\":\"H\"}");
    }

    #[test]
    fn test_partial_line_carried_over() {
        let mut parser = SseFrameParser::new();
        assert!(parser.push(b"data: {\"cont").is_empty());
        assert!(parser.push(b"ent\":\"He\"}").is_empty());
        let frames = parser.push(b"\n\n");
        assert_eq!(data(&frames), vec!["{\"content\":\"He\"}"]);
    }

    #[test]
    fn test_frame_split_between_data_and_blank_line() {
        let mut parser = SseFrameParser::new();
        assert!(parser.push(b"event: done\ndata: {}\n").is_empty());
        let frames = parser.push(b"\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "done");
    }

    #[test]
    fn test_multibyte_character_split_across_reads() {
        let mut parser = SseFrameParser::new();
        let bytes = "data: héllo\n\n".as_bytes();
        // split inside the two-byte 'é'
        let (head, tail) = bytes.split_at(8);
        assert!(parser.push(head).is_empty());
        let frames = parser.push(tail);
        assert_eq!(data(&frames), vec!["héllo"]);
    }

    #[test]
    fn test_named_events_and_comments() {
        let mut parser = SseFrameParser::new();
        let frames = parser.push(
            b": keepalive\nevent: message\ndata: a\n\nevent: error\ndata: {\"error\":\"x\"}\n\n",
        );
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event, "message");
        assert_eq!(frames[1].event, "error");
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut parser = SseFrameParser::new();
        let frames = parser.push(b"event: message\r\ndata: hi\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "hi");
    }

    #[test]
    fn test_multiple_data_lines_joined() {
        let mut parser = SseFrameParser::new();
        let frames = parser.push(b"data: line one\ndata: line two\n\n");
        assert_eq!(data(&frames), vec!["line one\nline two"]);
    }

    #[test]
    fn test_finish_flushes_unterminated_frame() {
        let mut parser = SseFrameParser::new();
        assert!(parser.push(b"data: first\n\ndata: last").len() == 1);
        let frame = parser.finish().expect("trailing frame");
        assert_eq!(frame.data, "last");
        assert!(parser.finish().is_none());
    }

    #[test]
    fn test_blank_lines_without_data_dispatch_nothing() {
        let mut parser = SseFrameParser::new();
        assert!(parser.push(b"\n\n\n").is_empty());
        assert!(parser.finish().is_none());
    }

    fn transport(server: &TestServer, token: Option<&str>) -> SseTransport {
        let auth = match token {
            Some(token) => StaticToken::new(token),
            None => StaticToken::none(),
        };
        let client = BackendClient::new(server.base_url(), Arc::new(auth))
            .unwrap()
            .with_idle_timeout(Duration::from_millis(300));
        SseTransport::new(Arc::new(client))
    }

    fn message_data(events: &[TransportEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                TransportEvent::Message(frame) => Some(frame.data.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_stream_delivers_frames_then_done() {
        let server = TestServer::start(vec![CannedResponse::sse(
            "data: {\"content\":\"H\"}\n\n: keep-alive\n\ndata: {\"content\":\"Hi\"}\r\n\r\nevent: done\ndata: {}\n\n",
        )])
        .await;

        let handle = transport(&server, Some("secret-token"))
            .open(stream_request(ReconnectPolicy::disabled()));
        let events = collect_events(handle).await;

        assert!(matches!(events[0], TransportEvent::Open));
        assert_eq!(
            message_data(&events),
            vec![r#"{"content":"H"}"#, r#"{"content":"Hi"}"#]
        );
        assert!(matches!(&events[3], TransportEvent::Done(payload) if payload == "{}"));
        assert!(matches!(events[4], TransportEvent::Close));
        assert_eq!(events.len(), 5);

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        let request = requests[0].to_lowercase();
        assert!(request.starts_with("get /api/chats/c1/messages/stream?"));
        assert!(request.contains("authorization: bearer secret-token"));
    }

    #[tokio::test]
    async fn test_request_without_token_is_unauthenticated() {
        let server = TestServer::start(vec![CannedResponse::sse("data: [DONE]\n\n")]).await;

        let handle = transport(&server, None).open(stream_request(ReconnectPolicy::disabled()));
        let events = collect_events(handle).await;

        assert!(matches!(events.last(), Some(TransportEvent::Close)));
        assert!(events.iter().any(|e| matches!(e, TransportEvent::Done(_))));
        assert!(!server.requests()[0].to_lowercase().contains("authorization:"));
    }

    #[tokio::test]
    async fn test_error_status_is_single_error_without_retry() {
        let server = TestServer::start(vec![
            CannedResponse::json("503 Service Unavailable", r#"{"error":"busy"}"#),
            CannedResponse::sse("data: [DONE]\n\n"),
        ])
        .await;

        let handle = transport(&server, None).open(stream_request(quick_reconnect()));
        let events = collect_events(handle).await;

        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            TransportEvent::Error(TransportError::Status { status: 503, body })
                if body.contains("busy")
        ));
        assert!(matches!(events[1], TransportEvent::Close));
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_eof_without_done_reconnects() {
        let server = TestServer::start(vec![
            CannedResponse::sse("data: {\"content\":\"H\"}\n\n"),
            CannedResponse::sse("data: {\"content\":\"Hi\"}\n\ndata: [DONE]\n\n"),
        ])
        .await;

        let handle = transport(&server, None).open(stream_request(quick_reconnect()));
        let events = collect_events(handle).await;

        let opens = events
            .iter()
            .filter(|e| matches!(e, TransportEvent::Open))
            .count();
        assert_eq!(opens, 1);
        assert_eq!(
            message_data(&events),
            vec![r#"{"content":"H"}"#, r#"{"content":"Hi"}"#]
        );
        assert!(matches!(events[events.len() - 2], TransportEvent::Done(_)));
        assert_eq!(server.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_idle_stream_is_dropped() {
        let server = TestServer::start(vec![
            CannedResponse::sse("data: {\"content\":\"H\"}\n\n").hold_open(),
        ])
        .await;

        let handle = transport(&server, None).open(stream_request(ReconnectPolicy::disabled()));
        let events = collect_events(handle).await;

        assert_eq!(message_data(&events), vec![r#"{"content":"H"}"#]);
        assert!(matches!(
            &events[events.len() - 2],
            TransportEvent::Error(TransportError::Disconnected(_))
        ));
        assert!(matches!(events.last(), Some(TransportEvent::Close)));
    }
}
