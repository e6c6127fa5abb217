//! Blocking facade for hosts that do not run tokio themselves.
//!
//! `HostBridge` owns a small multi-threaded runtime. `start` and `shutdown`
//! block the calling thread; everything else returns immediately.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::{Builder, Runtime};
use tokio_util::sync::CancellationToken;

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::console::ConsoleLines;
use crate::connection::ConnectionState;
use crate::error::BridgeError;
use crate::resource::ResourceBundle;
use crate::supervisor::BackendStatus;

const WORKER_THREADS: usize = 2;

pub struct HostBridge {
    runtime: Option<Runtime>,
    bridge: Arc<Bridge>,
}

impl HostBridge {
    pub fn new(config: BridgeConfig, bundle: Arc<dyn ResourceBundle>) -> Result<Self, BridgeError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(WORKER_THREADS)
            .thread_name("beacon-bridge")
            .enable_all()
            .build()
            .map_err(|e| BridgeError::Internal(e.into()))?;
        let bridge = Arc::new(Bridge::new(config, bundle)?);
        Ok(Self {
            runtime: Some(runtime),
            bridge,
        })
    }

    fn runtime(&self) -> Result<&Runtime, BridgeError> {
        self.runtime
            .as_ref()
            .ok_or_else(|| BridgeError::Internal(anyhow::anyhow!("bridge runtime already shut down")))
    }

    /// The async bridge, for hosts that want to drive it from their own tasks.
    pub fn bridge(&self) -> Arc<Bridge> {
        self.bridge.clone()
    }

    /// Blocks until the backend is running. Must not be called from inside
    /// an async context.
    pub fn start(&self) -> Result<u16, BridgeError> {
        self.runtime()?.block_on(self.bridge.start())
    }

    /// Blocks until the connection is closed and the backend stopped.
    pub fn shutdown(&self) -> Result<(), BridgeError> {
        self.runtime()?.block_on(self.bridge.shutdown())
    }

    pub fn wait_connected(&self, timeout: Duration) -> Result<(), BridgeError> {
        self.runtime()?.block_on(self.bridge.wait_connected(timeout))
    }

    pub fn send_event(&self, event_type: &str, payload: Value) -> Result<(), BridgeError> {
        self.bridge.send_event(event_type, payload)
    }

    /// Runs the request on the bridge runtime; `callback` receives the outcome
    /// on one of its worker threads.
    pub fn request<F>(&self, event_type: impl Into<String>, payload: Value, timeout: Duration, callback: F)
    where
        F: FnOnce(Result<Value, BridgeError>) + Send + 'static,
    {
        let runtime = match self.runtime() {
            Ok(runtime) => runtime,
            Err(e) => return callback(Err(e)),
        };
        let bridge = self.bridge.clone();
        let event_type = event_type.into();
        runtime.spawn(async move {
            let result = bridge.request_response(&event_type, payload, timeout).await;
            callback(result);
        });
    }

    pub fn on_event<F>(&self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.bridge.on_event(event_type, handler);
    }

    pub fn publish_every<F>(
        &self,
        event_type: impl Into<String>,
        interval: Duration,
        producer: F,
    ) -> Result<CancellationToken, BridgeError>
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        let _guard = self.runtime()?.enter();
        self.bridge.publish_every(event_type, interval, producer)
    }

    pub fn stream_console(&self, lines: ConsoleLines) -> Result<CancellationToken, BridgeError> {
        let _guard = self.runtime()?.enter();
        Ok(self.bridge.stream_console(lines))
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.bridge.connection_state()
    }

    pub fn backend_status(&self) -> BackendStatus {
        self.bridge.backend_status()
    }

    pub fn is_available(&self) -> bool {
        self.bridge.is_available()
    }
}

impl Drop for HostBridge {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            // 비동기 컨텍스트 안에서는 block_on 불가, kill_on_drop에 맡김
            tracing::warn!("HostBridge dropped inside an async context; backend is killed without a graceful stop");
            runtime.shutdown_background();
            return;
        }
        if let Err(e) = runtime.block_on(self.bridge.shutdown()) {
            tracing::warn!("Bridge shutdown on drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::EmbeddedBundle;
    use serde_json::json;
    use std::sync::mpsc;

    fn host() -> HostBridge {
        let dir = std::env::temp_dir().join("beacon-host-test");
        let mut config = BridgeConfig::default();
        config.backend.runtime_dir = dir;
        HostBridge::new(config, Arc::new(EmbeddedBundle::new())).unwrap()
    }

    #[test]
    fn test_start_with_empty_bundle_fails_fatally() {
        let host = host();
        let err = host.start().unwrap_err();
        assert!(err.is_fatal(), "{:?}", err);
        assert!(host.shutdown().is_ok());
    }

    #[test]
    fn test_calls_before_start() {
        let host = host();
        assert!(matches!(
            host.send_event("playerJoin", json!({"name": "Alex"})),
            Err(BridgeError::NotConnected)
        ));
        assert_eq!(host.connection_state(), ConnectionState::Disconnected);
        assert!(!host.is_available());

        let (tx, rx) = mpsc::channel();
        host.request("link", json!({}), Duration::from_secs(1), move |result| {
            let _ = tx.send(result);
        });
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, Err(BridgeError::NotConnected)));
    }

    #[test]
    fn test_publish_every_outside_runtime() {
        let host = host();
        let token = host
            .publish_every("serverStats", Duration::from_millis(20), || json!({"players": 0}))
            .unwrap();
        std::thread::sleep(Duration::from_millis(60));
        drop(host);
        assert!(token.is_cancelled());
    }
}
