//! The bridge context: resolves, extracts, supervises and connects.
//!
//! A `Bridge` is constructed and owned by the host; there is no global
//! instance. All methods are safe to call from any task.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::console::{ConsoleLines, CONSOLE_EVENT};
use crate::connection::{ConnectionManager, ConnectionState, ConnectionTask};
use crate::error::BridgeError;
use crate::platform::{self, BackendTarget};
use crate::resource::extract::extract;
use crate::resource::ResourceBundle;
use crate::router::MessageRouter;
use crate::supervisor::process::LaunchSpec;
use crate::supervisor::{BackendStatus, Supervisor, SupervisorSettings};

pub struct Bridge {
    config: BridgeConfig,
    bundle: Arc<dyn ResourceBundle>,
    supervisor: Supervisor,
    router: Arc<MessageRouter>,
    connection: Arc<ConnectionManager>,
    session: tokio::sync::Mutex<Option<ConnectionTask>>,
    publishers: Mutex<CancellationToken>,
    /// Lives as long as the bridge; console streams survive restarts.
    streams: CancellationToken,
}

impl Bridge {
    pub fn new(config: BridgeConfig, bundle: Arc<dyn ResourceBundle>) -> Result<Self, BridgeError> {
        config.validate()?;
        let supervisor = Supervisor::new(SupervisorSettings::from_config(&config)?);
        let router = Arc::new(MessageRouter::new());
        let connection = Arc::new(ConnectionManager::new(
            config.connection.clone(),
            config.backend.ws_path.clone(),
            router.clone(),
        ));
        Ok(Self {
            config,
            bundle,
            supervisor,
            router,
            connection,
            session: tokio::sync::Mutex::new(None),
            publishers: Mutex::new(CancellationToken::new()),
            streams: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Host platform, or the configured override.
    pub fn target(&self) -> Result<BackendTarget, BridgeError> {
        let os = self.config.backend.os.as_deref().unwrap_or(std::env::consts::OS);
        let arch = self.config.backend.arch.as_deref().unwrap_or(std::env::consts::ARCH);
        platform::resolve(os, arch)
    }

    /// Bring the backend up and start following it with the connection task.
    /// Resolves with the backend's port. Calling it while running is a no-op.
    pub async fn start(&self) -> Result<u16, BridgeError> {
        if let Some(port) = self.supervisor.status().live_port() {
            let session = self.session.lock().await;
            if session.as_ref().map_or(false, |task| !task.is_finished()) {
                return Ok(port);
            }
        }

        let target = self.target()?;
        tracing::info!("Starting beacon bridge for {} from {}", target, self.bundle.describe());

        let bundle = self.bundle.clone();
        let runtime_dir = self.config.backend.runtime_dir.clone();
        let program = tokio::task::spawn_blocking(move || {
            let extracted = extract(bundle.as_ref(), &target, &runtime_dir)?;
            if !extracted.written {
                tracing::debug!("Reusing extracted backend {}", extracted.path.display());
            }
            // 자식은 runtime_dir에서 실행되므로 상대 경로는 쓸 수 없음
            std::fs::canonicalize(&extracted.path).map_err(|e| BridgeError::ExtractionFailed {
                resource: extracted.path.display().to_string(),
                reason: format!("cannot resolve absolute path: {}", e),
            })
        })
        .await
        .map_err(|e| BridgeError::Internal(e.into()))??;

        // 재시작 대기 중에도 shutdown()이 끼어들 수 있도록 세션 락 없이 기다림
        self.supervisor.start(self.launch_spec(program)).await?;

        let mut session = self.session.lock().await;
        self.attach_session(&mut session)
    }

    /// Spawn the connection task unless one is already following the backend.
    /// A `shutdown()` that ran after the supervisor came up leaves no live port;
    /// that start is reported as cancelled.
    fn attach_session(&self, session: &mut Option<ConnectionTask>) -> Result<u16, BridgeError> {
        let Some(port) = self.supervisor.status().live_port() else {
            return Err(BridgeError::Cancelled);
        };
        if session.as_ref().map_or(true, |task| task.is_finished()) {
            *session = Some(self.connection.spawn(self.supervisor.subscribe()));
        }
        Ok(port)
    }

    fn launch_spec(&self, program: PathBuf) -> LaunchSpec {
        let backend = &self.config.backend;
        let working_dir = program
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| backend.runtime_dir.clone());
        let mut spec = LaunchSpec::new(program, backend.ws_path.clone()).with_args(backend.args.iter().cloned());
        for (key, value) in &backend.env {
            spec = spec.with_env(key.clone(), value.clone());
        }
        spec.working_dir = Some(working_dir);
        spec
    }

    /// Close the connection, then stop the backend. Idempotent.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        let mut session = self.session.lock().await;
        {
            let mut publishers = match self.publishers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            publishers.cancel();
            *publishers = CancellationToken::new();
        }
        if let Some(task) = session.take() {
            task.close().await;
        }
        self.supervisor.stop().await?;
        tracing::info!("Beacon bridge shut down");
        Ok(())
    }

    fn ensure_available(&self) -> Result<(), BridgeError> {
        let status = self.supervisor.status();
        if status.unavailable {
            return Err(BridgeError::BackendUnavailable {
                attempts: status.restarts,
            });
        }
        Ok(())
    }

    /// Fire-and-forget; never blocks.
    pub fn send_event(&self, event_type: &str, payload: Value) -> Result<(), BridgeError> {
        self.ensure_available()?;
        self.router.send(self.connection.as_ref(), event_type, payload)
    }

    pub async fn request_response(
        &self,
        event_type: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        self.ensure_available()?;
        self.router
            .request(self.connection.as_ref(), event_type, payload, timeout)
            .await
    }

    /// `request_response` with `requests.default_timeout_ms`.
    pub async fn request(&self, event_type: &str, payload: Value) -> Result<Value, BridgeError> {
        self.request_response(event_type, payload, self.config.requests.default_timeout())
            .await
    }

    pub async fn request_cancellable(
        &self,
        event_type: &str,
        payload: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, BridgeError> {
        self.ensure_available()?;
        self.router
            .request_cancellable(self.connection.as_ref(), event_type, payload, timeout, cancel)
            .await
    }

    pub fn on_event<F>(&self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.router.on_event(event_type, handler);
    }

    /// Send `producer()` as `event_type` every `interval` while connected.
    /// Ticks while disconnected are skipped. Must be called inside a tokio
    /// runtime; the task ends on `shutdown()` or when the returned token is
    /// cancelled.
    pub fn publish_every<F>(
        &self,
        event_type: impl Into<String>,
        interval: Duration,
        producer: F,
    ) -> Result<CancellationToken, BridgeError>
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        if interval.is_zero() {
            return Err(BridgeError::Config("publish interval must be non-zero".to_string()));
        }
        let token = match self.publishers.lock() {
            Ok(guard) => guard.child_token(),
            Err(poisoned) => poisoned.into_inner().child_token(),
        };
        let event_type = event_type.into();
        let router = self.router.clone();
        let connection = self.connection.clone();
        let cancel = token.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if connection.state() != ConnectionState::Connected {
                    continue;
                }
                if let Err(e) = router.send(connection.as_ref(), &event_type, producer()) {
                    tracing::debug!("Skipped '{}' tick: {}", event_type, e);
                }
            }
            tracing::debug!("Publisher for '{}' stopped", event_type);
        });
        Ok(token)
    }

    /// Forward host console lines as `console_log` events. Only lines produced
    /// while connected are sent. Must be called inside a tokio runtime; the task
    /// ends when the bridge is dropped or the returned token is cancelled.
    pub fn stream_console(&self, mut lines: ConsoleLines) -> CancellationToken {
        let token = self.streams.child_token();
        let router = self.router.clone();
        let connection = self.connection.clone();
        let cancel = token.clone();

        tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.recv() => match line {
                        Some(line) => line,
                        None => break,
                    },
                };
                if connection.state() != ConnectionState::Connected {
                    continue;
                }
                if let Err(e) = router.send(connection.as_ref(), CONSOLE_EVENT, line.to_payload()) {
                    tracing::debug!("Dropped console line: {}", e);
                }
            }
            tracing::debug!("Console stream stopped");
        });
        token
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub fn backend_status(&self) -> BackendStatus {
        self.supervisor.status()
    }

    pub fn subscribe_backend(&self) -> watch::Receiver<BackendStatus> {
        self.supervisor.subscribe()
    }

    /// Connected, and the restart budget is not exhausted.
    pub fn is_available(&self) -> bool {
        !self.supervisor.status().unavailable && self.connection.state() == ConnectionState::Connected
    }

    pub fn pending_requests(&self) -> usize {
        self.router.pending_count()
    }

    /// Wait until the connection is up. Fails early once the backend is
    /// marked unavailable.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), BridgeError> {
        let mut connection = self.connection.subscribe();
        let mut backend = self.supervisor.subscribe();
        let wait = async {
            tokio::select! {
                res = connection.wait_for(|s| *s == ConnectionState::Connected) => {
                    res.map(|_| ()).map_err(|_| BridgeError::NotConnected)
                }
                res = backend.wait_for(|s| s.unavailable) => match res {
                    Ok(status) => Err(BridgeError::BackendUnavailable { attempts: status.restarts }),
                    Err(_) => Err(BridgeError::NotConnected),
                },
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| BridgeError::NotConnected)?
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.streams.cancel();
    }
}
