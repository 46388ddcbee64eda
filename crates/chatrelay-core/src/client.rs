//! Backend HTTP client
//!
//! Builds endpoint URLs and authorized requests for the chat backend.
//! Transports and the tool-auth broker share one instance.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, error};
use url::Url;

use crate::auth::AuthProvider;
use crate::constants;
use crate::error::TransportError;
use crate::transport::RequestBody;

/// Client for the chat backend
pub struct BackendClient {
    http: Client,
    base_url: Url,
    auth: Arc<dyn AuthProvider>,
    idle_timeout: Duration,
}

impl BackendClient {
    /// Create the HTTP client
    ///
    /// No total timeout: a stream may legitimately run for a long time.
    /// Streams enforce `idle_timeout` between reads instead, and buffered
    /// requests set `REQUEST_TIMEOUT` per request.
    fn create_http_client() -> Client {
        Client::builder()
            .user_agent(constants::http::USER_AGENT)
            .connect_timeout(constants::http::CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                error!("Failed to build HTTP client: {}. Using default client.", e);
                Client::new()
            })
    }

    pub fn new(base_url: &str, auth: Arc<dyn AuthProvider>) -> Result<Self, TransportError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| TransportError::InvalidRequest(format!("bad base url {base_url}: {e}")))?;
        // Endpoints are joined relative to the base, which drops a last
        // segment without a trailing slash
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: Self::create_http_client(),
            base_url,
            auth,
            idle_timeout: constants::http::STREAM_IDLE_TIMEOUT,
        })
    }

    /// Override the silence allowed between stream reads
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|e| TransportError::InvalidRequest(format!("bad endpoint {path}: {e}")))
    }

    /// `POST /api/chats/{chatId}/messages`
    pub fn messages_url(&self, chat_id: &str) -> Result<Url, TransportError> {
        self.endpoint(&format!("api/chats/{}/messages", encode_segment(chat_id)))
    }

    /// `GET /api/chats/{chatId}/messages/stream?...` with every body field JSON-encoded
    pub fn stream_url(&self, chat_id: &str, body: &RequestBody) -> Result<Url, TransportError> {
        let mut url =
            self.endpoint(&format!("api/chats/{}/messages/stream", encode_segment(chat_id)))?;
        let encode = |value: serde_json::Result<String>| {
            value.map_err(|e| TransportError::InvalidRequest(e.to_string()))
        };
        let messages = encode(serde_json::to_string(&body.messages))?;
        let tools = encode(serde_json::to_string(&body.enabled_tools))?;
        let auth_status = encode(serde_json::to_string(&body.auth_status))?;
        let context = encode(serde_json::to_string(&body.context_data))?;
        url.query_pairs_mut()
            .append_pair("messages", &messages)
            .append_pair("enabledTools", &tools)
            .append_pair("authStatus", &auth_status)
            .append_pair("contextData", &context);
        Ok(url)
    }

    /// `ws(s)://.../api/chats/{chatId}/messages/socket`
    pub fn socket_url(&self, chat_id: &str) -> Result<Url, TransportError> {
        let mut url =
            self.endpoint(&format!("api/chats/{}/messages/socket", encode_segment(chat_id)))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| TransportError::InvalidRequest(format!("cannot use {scheme} for {url}")))?;
        Ok(url)
    }

    /// Integration endpoint for the tool-auth broker
    pub fn integration_url(&self, service: &str, action: &str) -> Result<Url, TransportError> {
        self.endpoint(&format!(
            "api/integrations/{}/{}",
            encode_segment(service),
            action
        ))
    }

    /// Current bearer token, if the auth collaborator has one
    pub async fn bearer_token(&self) -> Option<String> {
        self.auth.current_token().await
    }

    /// Attach the bearer token; without one the request goes out unauthenticated
    pub async fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.bearer_token().await {
            Some(token) => request.bearer_auth(token),
            None => {
                debug!("No auth token available, sending unauthenticated request");
                request
            }
        }
    }

    /// Turn a non-2xx response into a transport error
    pub async fn check_status(
        &self,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        error!("Backend error response: {} - {}", status, body);
        Err(TransportError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn encode_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthStatus, StaticToken};
    use crate::message::Role;
    use crate::transport::WireMessage;

    fn client(base: &str) -> BackendClient {
        BackendClient::new(base, Arc::new(StaticToken::none())).unwrap()
    }

    fn body() -> RequestBody {
        let mut auth_status = AuthStatus::new();
        auth_status.insert("github".to_string(), true);
        RequestBody {
            messages: vec![WireMessage {
                role: Role::User,
                content: "hello & goodbye".to_string(),
            }],
            enabled_tools: vec!["github".to_string()],
            stream: true,
            auth_status,
            context_data: serde_json::json!({"timezone": "UTC"}),
        }
    }

    #[test]
    fn test_stream_url_encodes_json_query() {
        let url = client("https://api.example.com/")
            .stream_url("c1", &body())
            .unwrap();
        assert_eq!(url.path(), "/api/chats/c1/messages/stream");

        let pairs: std::collections::HashMap<String, String> =
            url.query_pairs().into_owned().collect();
        let messages: Vec<WireMessage> = serde_json::from_str(&pairs["messages"]).unwrap();
        assert_eq!(messages[0].content, "hello & goodbye");
        assert_eq!(pairs["enabledTools"], r#"["github"]"#);
        assert_eq!(pairs["authStatus"], r#"{"github":true}"#);
        assert_eq!(pairs["contextData"], r#"{"timezone":"UTC"}"#);
    }

    #[test]
    fn test_socket_url_scheme() {
        assert_eq!(
            client("https://api.example.com").socket_url("c1").unwrap().as_str(),
            "wss://api.example.com/api/chats/c1/messages/socket"
        );
        assert_eq!(
            client("http://localhost:3000").socket_url("c1").unwrap().scheme(),
            "ws"
        );
    }

    #[test]
    fn test_chat_id_is_path_encoded() {
        let url = client("http://localhost:3000").messages_url("a/b").unwrap();
        assert_eq!(url.path(), "/api/chats/a%2Fb/messages");
    }

    #[test]
    fn test_base_url_path_prefix_kept() {
        let prefixed = client("https://host.example.com/chat-api");
        assert_eq!(
            prefixed.messages_url("c1").unwrap().as_str(),
            "https://host.example.com/chat-api/api/chats/c1/messages"
        );
        assert_eq!(
            prefixed.integration_url("github", "status").unwrap().path(),
            "/chat-api/api/integrations/github/status"
        );

        let slashed = client("https://host.example.com/chat-api/");
        assert_eq!(
            slashed.messages_url("c1").unwrap().path(),
            "/chat-api/api/chats/c1/messages"
        );
    }

    #[test]
    fn test_bad_base_url_rejected() {
        assert!(BackendClient::new("not a url", Arc::new(StaticToken::none())).is_err());
    }
}
