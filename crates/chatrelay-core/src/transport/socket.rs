//! WebSocket stream transport
//!
//! The request body goes out as the first text message; the backend answers
//! with `{"event": "message"|"error"|"done", "data": ...}` text messages.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, trace, warn};

use super::reconnect::{run_with_reconnect, StreamOutcome};
use super::sse::forward;
use super::{EventSink, Frame, StreamHandle, StreamRequest, StreamTransport};
use crate::client::BackendClient;
use crate::constants;
use crate::error::TransportError;

/// Transport over the backend's socket endpoint
pub struct SocketTransport {
    client: Arc<BackendClient>,
}

impl SocketTransport {
    pub fn new(client: Arc<BackendClient>) -> Self {
        Self { client }
    }
}

impl StreamTransport for SocketTransport {
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

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default = "default_event")]
    event: String,
    #[serde(default)]
    data: Value,
}

fn default_event() -> String {
    "message".to_string()
}

/// Turn one text message into a frame; anything that isn't an envelope is
/// taken as message data
fn socket_frame(text: &str) -> Frame {
    match serde_json::from_str::<Envelope>(text) {
        Ok(envelope) => Frame {
            event: envelope.event,
            data: match envelope.data {
                Value::String(data) => data,
                Value::Null => String::new(),
                other => other.to_string(),
            },
        },
        Err(_) => Frame::message(text),
    }
}

async fn connect_once(
    client: Arc<BackendClient>,
    request: StreamRequest,
    sink: EventSink,
) -> Result<StreamOutcome, TransportError> {
    let url = client.socket_url(&request.conversation_id)?;
    let mut ws_request = url.as_str().into_client_request()?;
    if let Some(token) = client.bearer_token().await {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        ws_request.headers_mut().insert(AUTHORIZATION, value);
    }

    info!(
        conversation_id = %request.conversation_id,
        "Opening socket stream to {}",
        url
    );
    let (ws_stream, _response) =
        tokio::time::timeout(constants::http::CONNECT_TIMEOUT, connect_async(ws_request))
            .await
            .map_err(|_| TransportError::Connect("socket connect timed out".to_string()))??;
    sink.open();

    let (mut write, mut read) = ws_stream.split();
    let body = serde_json::to_string(&request.body)
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
    write.send(Message::Text(body.into())).await?;

    let idle_timeout = client.idle_timeout();

    loop {
        let Ok(next) = tokio::time::timeout(idle_timeout, read.next()).await else {
            warn!("Socket idle for {:?}, dropping connection", idle_timeout);
            return Err(TransportError::Disconnected(format!(
                "no data for {idle_timeout:?}"
            )));
        };
        let Some(message) = next else {
            break;
        };
        match message? {
            Message::Text(text) => {
                trace!("Socket message: {} bytes", text.len());
                if let Some(outcome) = forward(socket_frame(text.as_str()), &sink)? {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(outcome);
                }
            }
            Message::Close(frame) => {
                info!("Socket closed by backend: {:?}", frame);
                return Ok(StreamOutcome::Ended);
            }
            Message::Binary(data) => debug!("Ignoring {} byte binary socket message", data.len()),
            // Ping/Pong are answered by tungstenite
            _ => {}
        }
    }

    Ok(StreamOutcome::Ended)
}
