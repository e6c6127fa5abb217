use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::BridgeError;

pub type Responder = oneshot::Sender<Result<Value, BridgeError>>;

struct PendingRequest {
    event_type: String,
    deadline: Instant,
    responder: Responder,
}

/// In-flight requests keyed by correlation id. Every entry leaves the table
/// exactly once: completed, removed, or failed.
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<u64, PendingRequest>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingRequest>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn insert(&self, id: u64, event_type: &str, deadline: Instant, responder: Responder) {
        let previous = self.lock().insert(
            id,
            PendingRequest {
                event_type: event_type.to_string(),
                deadline,
                responder,
            },
        );
        debug_assert!(previous.is_none(), "correlation id {} reused", id);
    }

    /// Resolve the entry for `id`. Returns `false` if nothing was waiting.
    pub fn complete(&self, id: u64, result: Result<Value, BridgeError>) -> bool {
        let Some(entry) = self.lock().remove(&id) else {
            return false;
        };
        if Instant::now() > entry.deadline {
            tracing::debug!("Response for '{}' ({}) arrived past its deadline", entry.event_type, id);
        }
        if entry.responder.send(result).is_err() {
            // 호출자가 이미 future를 drop함
            tracing::debug!("Response for '{}' ({}) had no receiver", entry.event_type, id);
        }
        true
    }

    pub fn remove(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Fail every entry, e.g. with `ConnectionLost`. Returns how many were failed.
    pub fn fail_all(&self, make_error: impl Fn() -> BridgeError) -> usize {
        let drained: Vec<(u64, PendingRequest)> = self.lock().drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.responder.send(Err(make_error()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_complete_resolves_once() {
        let table = PendingRequests::new();
        let (tx, rx) = oneshot::channel();
        table.insert(1, "link", Instant::now() + Duration::from_secs(5), tx);
        assert!(table.complete(1, Ok(json!({"ok": true}))));
        assert!(!table.complete(1, Ok(json!({"ok": false}))));
        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok": true}));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all() {
        let table = PendingRequests::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        let deadline = Instant::now() + Duration::from_secs(5);
        table.insert(1, "a", deadline, tx1);
        table.insert(2, "b", deadline, tx2);
        assert_eq!(table.fail_all(|| BridgeError::ConnectionLost), 2);
        assert!(matches!(rx1.await.unwrap(), Err(BridgeError::ConnectionLost)));
        assert!(matches!(rx2.await.unwrap(), Err(BridgeError::ConnectionLost)));
        assert_eq!(table.len(), 0);
    }
}
