//! Message Router — envelopes in both directions.
//!
//! Outbound: one-way events and correlated requests handed to a [`FrameSink`].
//! Inbound (on the read loop): responses complete their pending request, the
//! rest is dispatched to the handlers registered for its type.

pub mod envelope;
pub mod pending;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::connection::{FrameHandler, FrameSink};
use crate::error::BridgeError;
pub use envelope::Envelope;
use pending::PendingRequests;

/// Callback for one-way events of a given type. Runs on the read loop, so it
/// must not block.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

pub struct MessageRouter {
    next_id: AtomicU64,
    pending: PendingRequests,
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the pending entry when the request future ends for any reason,
/// including being dropped by the caller.
struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: PendingRequests::new(),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler; handlers for one type run in registration order.
    pub fn on_event<F>(&self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.entry(event_type.into()).or_default().push(Arc::new(handler));
    }

    fn handlers_for(&self, event_type: &str) -> Vec<EventHandler> {
        let handlers = match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.get(event_type).cloned().unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn next_correlation_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Fire-and-forget.
    pub fn send(&self, sink: &dyn FrameSink, event_type: &str, payload: Value) -> Result<(), BridgeError> {
        let frame = Envelope::event(event_type, payload).encode()?;
        sink.send_frame(frame)
    }

    /// Send a correlated request and wait for its response.
    pub async fn request(
        &self,
        sink: &dyn FrameSink,
        event_type: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        self.request_inner(sink, event_type, payload, timeout, None).await
    }

    /// Like [`request`](Self::request), but also ends with `Cancelled` when
    /// `cancel` fires first.
    pub async fn request_cancellable(
        &self,
        sink: &dyn FrameSink,
        event_type: &str,
        payload: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, BridgeError> {
        self.request_inner(sink, event_type, payload, timeout, Some(cancel)).await
    }

    async fn request_inner(
        &self,
        sink: &dyn FrameSink,
        event_type: &str,
        payload: Value,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, BridgeError> {
        let id = self.next_correlation_id();
        let frame = Envelope::request(event_type, id, payload).encode()?;
        let deadline = Instant::now() + timeout;

        // 응답이 send 직후 도착해도 놓치지 않도록 전송 전에 등록
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, event_type, deadline, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        sink.send_frame(frame)?;

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            res = rx => match res {
                Ok(result) => result,
                Err(_) => Err(BridgeError::ConnectionLost),
            },
            _ = tokio::time::sleep_until(deadline) => {
                tracing::debug!("Request '{}' ({}) timed out", event_type, id);
                Err(BridgeError::RequestTimeout {
                    event_type: event_type.to_string(),
                    timeout,
                })
            }
            _ = cancelled => Err(BridgeError::Cancelled),
        }
    }

    /// Handle one inbound frame.
    pub fn dispatch(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Dropping inbound frame: {}", e);
                return;
            }
        };

        if let Some(id) = envelope.correlation_id {
            let result = match envelope.error {
                Some(message) => Err(BridgeError::Remote {
                    event_type: envelope.event_type.clone(),
                    message,
                }),
                None => Ok(envelope.payload),
            };
            if !self.pending.complete(id, result) {
                tracing::debug!(
                    "No pending request for '{}' ({}), dropping response",
                    envelope.event_type,
                    id
                );
            }
            return;
        }

        let handlers = self.handlers_for(&envelope.event_type);
        if handlers.is_empty() {
            tracing::debug!("No handler for event '{}'", envelope.event_type);
            return;
        }
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&envelope.payload))).is_err() {
                tracing::error!("Handler for '{}' panicked", envelope.event_type);
            }
        }
    }
}

impl FrameHandler for MessageRouter {
    fn on_frame(&self, text: &str) {
        self.dispatch(text);
    }

    fn on_disconnect(&self) {
        let failed = self.pending.fail_all(|| BridgeError::ConnectionLost);
        if failed > 0 {
            tracing::warn!("Failed {} pending request(s): connection lost", failed);
        }
    }
}
