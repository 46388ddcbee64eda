//! Reconnection with linear backoff
//!
//! Transport-level disconnects that happen before the stream's `done` frame
//! are retried a bounded number of times. HTTP status errors, server error
//! frames and clean completions are never retried.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::EventSink;
use crate::constants;
use crate::error::TransportError;

/// Configuration for reconnect behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnect attempts
    pub max_attempts: u32,
    /// Attempt N waits N times this
    pub delay_unit: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: constants::transport::MAX_RECONNECT_ATTEMPTS,
            delay_unit: constants::transport::RECONNECT_DELAY_UNIT,
        }
    }
}

impl ReconnectPolicy {
    /// No reconnects; the first failure is final
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            delay_unit: Duration::ZERO,
        }
    }

    /// Delay before the given (1-based) attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_unit * attempt
    }
}

/// How a single connection ended when it did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Backend sent its done frame; payload is the frame data
    Done(String),
    /// Connection ended without a done frame
    Ended,
}

/// Drive connection attempts until done, a final error, or cancellation
///
/// Emits exactly one terminal event (`Done` or `Error`) on the sink unless
/// cancelled first.
pub(crate) async fn run_with_reconnect<F, Fut>(
    policy: &ReconnectPolicy,
    sink: &EventSink,
    cancel: &CancellationToken,
    mut connect: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<StreamOutcome, TransportError>>,
{
    let mut attempt = 0;

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Stream cancelled during connection attempt {}", attempt);
                return;
            }
            result = connect() => result,
        };

        let error = match result {
            Ok(StreamOutcome::Done(payload)) => {
                sink.done(payload);
                return;
            }
            Ok(StreamOutcome::Ended) => {
                TransportError::Disconnected("stream ended before completion".to_string())
            }
            Err(e) => e,
        };

        if !error.is_reconnectable() || attempt >= policy.max_attempts {
            sink.error(error);
            return;
        }

        attempt += 1;
        let delay = policy.delay_for(attempt);
        warn!(
            attempt = attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting after transport error: {}",
            error
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use super::*;
    use crate::transport::TransportEvent;

    fn sink() -> (EventSink, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink::new(tx), rx)
    }

    #[test]
    fn test_default_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_backoff_then_error() {
        let (sink, mut rx) = sink();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let started = Instant::now();

        run_with_reconnect(
            &ReconnectPolicy::default(),
            &sink,
            &CancellationToken::new(),
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(TransportError::Connect("refused".to_string())) }
            },
        )
        .await;

        // initial attempt + 3 reconnects, waiting 1s + 2s + 3s
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Error(TransportError::Connect(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_disconnect() {
        let (sink, mut rx) = sink();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        run_with_reconnect(
            &ReconnectPolicy::default(),
            &sink,
            &CancellationToken::new(),
            || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Ok(StreamOutcome::Ended)
                    } else {
                        Ok(StreamOutcome::Done(String::new()))
                    }
                }
            },
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(matches!(rx.recv().await, Some(TransportEvent::Done(_))));
    }

    #[tokio::test]
    async fn test_never_reconnects_after_done() {
        let (sink, mut rx) = sink();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        run_with_reconnect(
            &ReconnectPolicy::default(),
            &sink,
            &CancellationToken::new(),
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(StreamOutcome::Done("{}".to_string())) }
            },
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        match rx.recv().await {
            Some(TransportEvent::Done(payload)) => assert_eq!(payload, "{}"),
            other => panic!("Expected Done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_status_error_not_retried() {
        let (sink, mut rx) = sink();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        run_with_reconnect(
            &ReconnectPolicy::default(),
            &sink,
            &CancellationToken::new(),
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(TransportError::Status {
                        status: 401,
                        body: "unauthorized".to_string(),
                    })
                }
            },
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Error(TransportError::Status { status: 401, .. }))
        ));
    }

    #[tokio::test]
    async fn test_disabled_policy_fails_immediately() {
        let (sink, mut rx) = sink();
        run_with_reconnect(
            &ReconnectPolicy::disabled(),
            &sink,
            &CancellationToken::new(),
            || async { Ok(StreamOutcome::Ended) },
        )
        .await;
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Error(TransportError::Disconnected(_)))
        ));
    }
}
