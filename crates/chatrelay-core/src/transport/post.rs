//! Buffered POST transport
//!
//! For backends or networks where streaming is unavailable. The whole reply
//! arrives in one response and is replayed as `Open`, one `Message`, `Done`.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use super::reconnect::{run_with_reconnect, StreamOutcome};
use super::sse::forward;
use super::{EventSink, Frame, StreamHandle, StreamRequest, StreamTransport};
use crate::client::BackendClient;
use crate::constants;
use crate::error::TransportError;
use crate::protocol;

pub struct PostTransport {
    client: Arc<BackendClient>,
}

impl PostTransport {
    pub fn new(client: Arc<BackendClient>) -> Self {
        Self { client }
    }
}

impl StreamTransport for PostTransport {
    fn open(&self, request: StreamRequest) -> StreamHandle {
        let client = Arc::clone(&self.client);
        StreamHandle::spawn(move |sink, cancel| async move {
            let policy = request.reconnect.clone();
            run_with_reconnect(&policy, &sink, &cancel, || {
                post_once(Arc::clone(&client), request.clone(), sink.clone())
            })
            .await;
        })
    }
}

/// A 2xx reply can still carry `{ "error": ... }` instead of content
fn reply_error(body: &str) -> Option<String> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) if map.contains_key("error") && !map.contains_key("content") => {
            Some(protocol::error_text(body))
        }
        _ => None,
    }
}

async fn post_once(
    client: Arc<BackendClient>,
    request: StreamRequest,
    sink: EventSink,
) -> Result<StreamOutcome, TransportError> {
    let url = client.messages_url(&request.conversation_id)?;
    let mut body = request.body;
    body.stream = false;

    info!(
        conversation_id = %request.conversation_id,
        "Posting message ({} history messages)",
        body.messages.len()
    );
    let builder = client
        .http()
        .post(url)
        .timeout(constants::http::REQUEST_TIMEOUT)
        .json(&body);
    let response = client.authorize(builder).await.send().await?;
    let response = client.check_status(response).await?;
    sink.open();

    let reply = response
        .text()
        .await
        .map_err(|e| TransportError::Disconnected(e.to_string()))?;
    if let Some(message) = reply_error(&reply) {
        return Err(TransportError::Server(message));
    }

    match forward(Frame::message(reply), &sink)? {
        Some(outcome) => Ok(outcome),
        None => Ok(StreamOutcome::Done(String::new())),
    }
}
