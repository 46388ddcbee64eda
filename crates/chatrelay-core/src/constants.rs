//! Application constants and configuration defaults
//!
//! Centralized location for magic numbers, default values and canned texts

use std::time::Duration;

/// HTTP client configuration
pub mod http {
    use super::*;

    /// Connection timeout for HTTP requests
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Longest silence tolerated between two reads of an open stream
    pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

    /// Total timeout for buffered (non-streaming) requests
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

    /// User agent sent with every backend request
    pub const USER_AGENT: &str = "chatrelay/0.1";

    /// Default backend base URL
    pub const DEFAULT_BASE_URL: &str = "http://localhost:3000";
}

/// Stream transport configuration
pub mod transport {
    use super::*;

    /// Maximum reconnect attempts after a transport-level disconnect
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

    /// Backoff unit; attempt N waits N times this
    pub const RECONNECT_DELAY_UNIT: Duration = Duration::from_millis(1000);

    /// End-of-stream marker some backends send as a data payload
    pub const DONE_MARKER: &str = "[DONE]";
}

/// Conversation and interrupt configuration
pub mod conversation {
    use super::*;

    /// How long an auth/confirmation interrupt may stay unresolved
    pub const INTERRUPT_TIMEOUT: Duration = Duration::from_secs(60);

    /// How long finalize waits for the placeholder's server id
    pub const PERSISTENCE_TIMEOUT: Duration = Duration::from_secs(5);

    /// How often the auth-status poller asks the broker
    pub const AUTH_POLL_INTERVAL: Duration = Duration::from_secs(2);

    /// Title given to conversations created without one
    pub const DEFAULT_TITLE: &str = "New chat";

    /// Prefix of locally generated message ids
    pub const MOCK_ID_PREFIX: &str = "mock-msg-";

    /// Number of random characters after the mock prefix
    pub const MOCK_ID_LEN: usize = 6;
}

/// User-facing texts for terminal failures
pub mod texts {
    /// Shown when the backend cannot be reached before any content arrived
    pub const OFFLINE_MESSAGE: &str = "I can't reach the assistant service right now, so this reply was generated offline. Check your internet connection and try sending your message again in a moment.";

    /// Shown when the user cancels an interrupted exchange
    pub const CANCELLED_MESSAGE: &str = "The request was cancelled before the assistant could finish.";

    /// Shown when an interrupt was left unanswered past the bound
    pub const INTERRUPT_TIMEOUT_MESSAGE: &str = "The request was cancelled because it waited too long for your response.";

    /// Shown when the backend sent a control event the client can't understand
    pub const PROTOCOL_ERROR_MESSAGE: &str = "The assistant sent a response this app could not understand. Please try again.";
}

/// Local directory layout
pub mod ui {
    /// Config directory name
    pub const CONFIG_DIR_NAME: &str = ".chatrelay";

    /// Config file name inside the config directory
    pub const CONFIG_FILE_NAME: &str = "config.toml";

    /// Log file name inside the logs directory
    pub const LOG_FILE_NAME: &str = "chatrelay.log";
}
