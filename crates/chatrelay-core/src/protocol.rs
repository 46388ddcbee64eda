//! Wire protocol decoding
//!
//! Turns transport events into typed stream events. Control signals arrive
//! either as JSON control objects or as inline `[AUTH_REQUEST:<SERVICE>]`
//! markers inside assistant text; both become `InterruptRequest`s here and
//! no raw markup leaves this module.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::constants;
use crate::error::RelayError;
use crate::interrupt::{InterruptRequest, ResumeToken};
use crate::transport::TransportEvent;

/// Inline auth marker embedded in assistant content
static RE_AUTH_REQUEST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[AUTH_REQUEST:([A-Za-z0-9_.\-]+)\]").unwrap());

/// The marker together with the whitespace that separates it from the text
static RE_AUTH_REQUEST_SPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\[AUTH_REQUEST:[A-Za-z0-9_.\-]+\]").unwrap());

/// Typed event consumed by the relay
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Open,
    /// Full cumulative assistant text so far
    Fragment(String),
    ToolAuthRequired(InterruptRequest),
    ConfirmationRequired(InterruptRequest),
    Done,
    Error(String),
}

/// Decode one transport event
///
/// `Close` yields nothing; the relay treats a close before any terminal
/// event as a disconnect.
pub fn decode(event: &TransportEvent) -> Result<Vec<StreamEvent>, RelayError> {
    match event {
        TransportEvent::Open => Ok(vec![StreamEvent::Open]),
        TransportEvent::Message(frame) => parse_message(&frame.data),
        TransportEvent::Done(payload) => parse_done(payload),
        TransportEvent::Error(e) => Ok(vec![StreamEvent::Error(e.to_string())]),
        TransportEvent::Close => Ok(Vec::new()),
    }
}

/// Parse the data of a `message` frame
///
/// Malformed control objects (missing required fields) are protocol errors.
/// Data that is not JSON is taken as raw assistant text.
pub fn parse_message(data: &str) -> Result<Vec<StreamEvent>, RelayError> {
    let trimmed = data.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => parse_object(&map),
        Ok(Value::String(text)) => Ok(content_events(&text)),
        _ => Ok(content_events(data)),
    }
}

/// Parse the payload of a `done` frame
///
/// A done payload may carry the final content.
pub fn parse_done(payload: &str) -> Result<Vec<StreamEvent>, RelayError> {
    let payload = payload.trim();
    if payload.is_empty() || payload == constants::transport::DONE_MARKER {
        return Ok(vec![StreamEvent::Done]);
    }

    let mut events = match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => match map.get("content") {
            Some(Value::String(text)) => content_events(text),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    events.push(StreamEvent::Done);
    Ok(events)
}

/// Human-readable text of an error frame
pub fn error_text(data: &str) -> String {
    let data = data.trim();
    let from_json = match serde_json::from_str::<Value>(data) {
        Ok(Value::Object(map)) => error_field(&map),
        Ok(Value::String(text)) => Some(text),
        _ => None,
    };

    match from_json {
        Some(text) if !text.trim().is_empty() => text,
        _ if !data.is_empty() => data.to_string(),
        _ => "unknown backend error".to_string(),
    }
}

fn error_field(map: &Map<String, Value>) -> Option<String> {
    match (map.get("error"), map.get("message")) {
        (Some(Value::String(text)), _) => Some(text.clone()),
        (Some(Value::Object(inner)), _) => inner
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        (_, Some(Value::String(text))) => Some(text.clone()),
        _ => None,
    }
}

fn parse_object(map: &Map<String, Value>) -> Result<Vec<StreamEvent>, RelayError> {
    if let Some(kind) = map.get("type") {
        let kind = kind
            .as_str()
            .ok_or_else(|| RelayError::Protocol("control event type must be a string".into()))?;
        match kind {
            "auth_required" | "tool_auth_required" => {
                let service = required_str(map, "service", kind)?;
                let token = resume_token(map)?;
                debug!(service = %service, "Backend requested tool authentication");
                return Ok(vec![StreamEvent::ToolAuthRequired(InterruptRequest::auth(
                    service, token,
                ))]);
            }
            "confirmation_required" => {
                let action = required_str(map, "action", kind)?;
                let details = match map.get("details") {
                    None | Some(Value::Null) => None,
                    Some(Value::Object(details)) => Some(details.clone()),
                    Some(_) => {
                        return Err(RelayError::Protocol(
                            "confirmation_required details must be an object".into(),
                        ))
                    }
                };
                let token = resume_token(map)?;
                debug!(action = %action, "Backend requested confirmation");
                return Ok(vec![StreamEvent::ConfirmationRequired(
                    InterruptRequest::confirmation(action, details, token),
                )]);
            }
            "error" => {
                let text = error_field(map).unwrap_or_else(|| "unknown backend error".into());
                return Ok(vec![StreamEvent::Error(text)]);
            }
            "done" => return Ok(vec![StreamEvent::Done]),
            other => trace!("Treating control type {:?} as content", other),
        }
    }

    match map.get("content") {
        Some(Value::String(text)) => Ok(content_events(text)),
        None | Some(Value::Null) => {
            trace!("Message frame without content, skipping");
            Ok(Vec::new())
        }
        Some(_) => Err(RelayError::Protocol("content must be a string".into())),
    }
}

fn required_str<'a>(
    map: &'a Map<String, Value>,
    field: &str,
    kind: &str,
) -> Result<&'a str, RelayError> {
    map.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| RelayError::Protocol(format!("{kind} event without {field}")))
}

fn resume_token(map: &Map<String, Value>) -> Result<ResumeToken, RelayError> {
    match map.get("resumeToken") {
        None | Some(Value::Null) => Ok(ResumeToken::generate()),
        Some(Value::String(token)) if !token.is_empty() => Ok(ResumeToken::from_backend(token)),
        Some(_) => Err(RelayError::Protocol(
            "resumeToken must be a non-empty string".into(),
        )),
    }
}

/// Split assistant text into the visible fragment and any inline auth request
fn content_events(text: &str) -> Vec<StreamEvent> {
    let service = RE_AUTH_REQUEST
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());

    let Some(service) = service else {
        return vec![StreamEvent::Fragment(text.to_string())];
    };

    let visible = RE_AUTH_REQUEST_SPAN.replace_all(text, "");
    let mut events = Vec::with_capacity(2);
    if !visible.is_empty() {
        events.push(StreamEvent::Fragment(visible.to_string()));
    }
    debug!(service = %service, "Inline auth request in content");
    events.push(StreamEvent::ToolAuthRequired(InterruptRequest::auth(
        &service,
        ResumeToken::generate(),
    )));
    events
}
