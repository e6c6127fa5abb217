//! Connection Manager — the single WebSocket link to the backend.
//!
//! One long-lived task follows the supervisor's status channel: it dials as soon
//! as the backend is `Running`, runs the read and write loops for the session,
//! and reconnects with backoff while the backend keeps serving the same port.

pub mod backoff;

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::error::BridgeError;
use crate::supervisor::BackendStatus;
use backoff::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl ConnectionState {
    pub fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Connected, Closing)
                | (Closing, Disconnected)
        )
    }
}

/// Outbound side: hands one encoded frame to the link without blocking.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, text: String) -> Result<(), BridgeError>;
}

/// Inbound side: invoked on the read loop.
pub trait FrameHandler: Send + Sync {
    fn on_frame(&self, text: &str);
    /// The session ended; no response for anything in flight will arrive.
    fn on_disconnect(&self);
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Link {
    state: ConnectionState,
    outbound: Option<mpsc::Sender<Message>>,
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    ws_path: String,
    handler: Arc<dyn FrameHandler>,
    link: Mutex<Link>,
    state_tx: watch::Sender<ConnectionState>,
}

/// Handle to the running connection task.
pub struct ConnectionTask {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ConnectionTask {
    /// Close the session gracefully and wait for the task to finish.
    pub async fn close(mut self) {
        self.cancel.cancel();
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Err(e) = handle.await {
            tracing::warn!("Connection task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |handle| handle.is_finished())
    }
}

impl Drop for ConnectionTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, ws_path: impl Into<String>, handler: Arc<dyn FrameHandler>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            ws_path: ws_path.into(),
            handler,
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                outbound: None,
            }),
            state_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn url_for(&self, port: u16) -> String {
        format!("ws://127.0.0.1:{}{}", port, self.ws_path)
    }

    /// Start the connection task following `backend`.
    pub fn spawn(self: &Arc<Self>, backend: watch::Receiver<BackendStatus>) -> ConnectionTask {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.clone().run(backend, cancel.clone()));
        ConnectionTask {
            cancel,
            handle: Some(handle),
        }
    }

    fn lock_link(&self) -> MutexGuard<'_, Link> {
        match self.link.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_state(&self, link: &mut Link, to: ConnectionState) -> bool {
        if link.state == to {
            return true;
        }
        if !link.state.can_transition(to) {
            tracing::error!("Connection state error: {:?} -> {:?}", link.state, to);
            return false;
        }
        tracing::debug!("Connection state: {:?} -> {:?}", link.state, to);
        link.state = to;
        if to != ConnectionState::Connected {
            link.outbound = None;
        }
        self.state_tx.send_replace(to);
        true
    }

    fn transition(&self, to: ConnectionState) -> bool {
        let mut link = self.lock_link();
        self.set_state(&mut link, to)
    }

    async fn run(self: Arc<Self>, mut backend: watch::Receiver<BackendStatus>, cancel: CancellationToken) {
        loop {
            let port = tokio::select! {
                res = backend.wait_for(|s| s.live_port().is_some()) => match res {
                    Ok(status) => status.live_port(),
                    Err(_) => return,
                },
                _ = cancel.cancelled() => return,
            };
            let Some(port) = port else { continue };

            if self.serve_port(port, &mut backend, &cancel).await.is_break() {
                return;
            }
            tracing::info!("Backend left port {}, waiting for it to come back", port);
        }
    }

    /// Keep a session open against `port` until shutdown (`Break`) or until the
    /// backend stops serving that port (`Continue`).
    async fn serve_port(
        &self,
        port: u16,
        backend: &mut watch::Receiver<BackendStatus>,
        cancel: &CancellationToken,
    ) -> ControlFlow<()> {
        let url = self.url_for(port);
        let mut backoff = Backoff::new(self.config.initial_backoff(), self.config.max_backoff());

        loop {
            self.transition(ConnectionState::Connecting);
            let dial = tokio::time::timeout(self.config.handshake_timeout(), connect_async(url.as_str()));
            let dialed = tokio::select! {
                res = dial => res,
                _ = cancel.cancelled() => {
                    self.transition(ConnectionState::Disconnected);
                    return ControlFlow::Break(());
                }
            };

            match dialed {
                Ok(Ok((stream, _response))) => {
                    backoff.reset();
                    tracing::info!("Connected to backend at {}", url);
                    match self.run_session(stream, cancel).await {
                        SessionEnd::Shutdown => return ControlFlow::Break(()),
                        SessionEnd::Dropped(reason) => {
                            tracing::warn!("Backend connection lost: {}", reason);
                        }
                    }
                }
                Ok(Err(e)) => {
                    self.transition(ConnectionState::Disconnected);
                    tracing::warn!("Handshake with {} failed: {}", url, e);
                }
                Err(_) => {
                    self.transition(ConnectionState::Disconnected);
                    tracing::warn!(
                        "Handshake with {} timed out after {:?}",
                        url,
                        self.config.handshake_timeout()
                    );
                }
            }
            // 연결 실패 시점에 대기 중인 요청은 모두 ConnectionLost
            self.handler.on_disconnect();

            if backend.borrow().live_port() != Some(port) {
                return ControlFlow::Continue(());
            }
            let delay = backoff.next_delay();
            tracing::warn!("Reconnecting to backend in {:?} (attempt {})", delay, backoff.attempts());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return ControlFlow::Break(()),
                res = backend.wait_for(|s| s.live_port() != Some(port)) => {
                    return match res {
                        Ok(_) => ControlFlow::Continue(()),
                        Err(_) => ControlFlow::Break(()),
                    };
                }
            }
        }
    }

    async fn run_session(&self, stream: WsStream, cancel: &CancellationToken) -> SessionEnd {
        let (mut write, mut read) = stream.split();
        let (tx, mut rx) = mpsc::channel::<Message>(self.config.send_queue_capacity);
        {
            let mut link = self.lock_link();
            if !self.set_state(&mut link, ConnectionState::Connected) {
                return SessionEnd::Dropped("connection state out of sync".to_string());
            }
            link.outbound = Some(tx);
        }

        let end = loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handler.on_frame(text.as_str()),
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => self.handler.on_frame(text),
                        Err(_) => tracing::warn!("Dropping non-UTF-8 binary frame ({} bytes)", data.len()),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break SessionEnd::Dropped(match frame {
                            Some(frame) => format!("closed by backend ({:?} {})", frame.code, frame.reason.as_str()),
                            None => "closed by backend".to_string(),
                        });
                    }
                    // Ping/Pong은 tungstenite가 처리
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break SessionEnd::Dropped(e.to_string()),
                    None => break SessionEnd::Dropped("stream ended".to_string()),
                },
                outbound = rx.recv() => match outbound {
                    Some(message) => {
                        if let Err(e) = write.send(message).await {
                            break SessionEnd::Dropped(format!("write failed: {}", e));
                        }
                    }
                    None => break SessionEnd::Dropped("outbound queue closed".to_string()),
                },
                _ = cancel.cancelled() => break SessionEnd::Shutdown,
            }
        };

        match end {
            SessionEnd::Shutdown => {
                // Closing에서 sender가 drop되므로 rx는 남은 프레임을 내주고 끝남
                self.transition(ConnectionState::Closing);
                let flush = async {
                    while let Some(message) = rx.recv().await {
                        write.send(message).await?;
                    }
                    write.send(Message::Close(None)).await?;
                    while let Some(frame) = read.next().await {
                        if matches!(frame, Ok(Message::Close(_)) | Err(_)) {
                            break;
                        }
                    }
                    Ok::<(), tokio_tungstenite::tungstenite::Error>(())
                };
                match tokio::time::timeout(self.config.close_timeout(), flush).await {
                    Ok(Ok(())) => tracing::info!("Backend connection closed"),
                    Ok(Err(e)) => tracing::debug!("Close handshake interrupted: {}", e),
                    Err(_) => tracing::warn!(
                        "Backend did not acknowledge close within {:?}",
                        self.config.close_timeout()
                    ),
                }
                self.transition(ConnectionState::Disconnected);
                self.handler.on_disconnect();
                SessionEnd::Shutdown
            }
            dropped => {
                self.transition(ConnectionState::Disconnected);
                dropped
            }
        }
    }
}

impl FrameSink for ConnectionManager {
    fn send_frame(&self, text: String) -> Result<(), BridgeError> {
        let link = self.lock_link();
        if link.state != ConnectionState::Connected {
            return Err(BridgeError::NotConnected);
        }
        let Some(tx) = link.outbound.as_ref() else {
            return Err(BridgeError::NotConnected);
        };
        tx.try_send(Message::text(text)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BridgeError::SendQueueFull,
            mpsc::error::TrySendError::Closed(_) => BridgeError::NotConnected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::state_machine::ProcessState;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<String>>,
        disconnects: Mutex<u32>,
    }

    impl FrameHandler for Recorder {
        fn on_frame(&self, text: &str) {
            self.frames.lock().unwrap().push(text.to_string());
        }
        fn on_disconnect(&self) {
            *self.disconnects.lock().unwrap() += 1;
        }
    }

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            handshake_timeout_ms: 1_000,
            initial_backoff_ms: 50,
            max_backoff_ms: 200,
            send_queue_capacity: 4,
            close_timeout_ms: 500,
        }
    }

    fn running(port: u16) -> BackendStatus {
        BackendStatus {
            state: ProcessState::Running,
            port: Some(port),
            pid: Some(1),
            restarts: 0,
            unavailable: false,
        }
    }

    async fn wait_state(rx: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .expect("state change in time")
            .unwrap();
    }

    /// Echo server: sends every text frame back prefixed with `echo:`.
    async fn echo_server() -> (u16, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else { return };
                    let (mut write, mut read) = ws.split();
                    while let Some(Ok(msg)) = read.next().await {
                        match msg {
                            Message::Text(text) => {
                                let reply = format!("echo:{}", text.as_str());
                                if write.send(Message::text(reply)).await.is_err() {
                                    break;
                                }
                            }
                            Message::Close(_) => {
                                let _ = write.send(Message::Close(None)).await;
                                break;
                            }
                            _ => {}
                        }
                    }
                });
            }
        });
        (port, handle)
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition(Connecting));
        assert!(Connecting.can_transition(Connected));
        assert!(Connected.can_transition(Closing));
        assert!(Closing.can_transition(Disconnected));
        assert!(!Disconnected.can_transition(Connected));
        assert!(!Closing.can_transition(Connected));
        assert!(!Connected.can_transition(Connecting));
    }

    #[tokio::test]
    async fn test_send_while_disconnected() {
        let manager = ConnectionManager::new(fast_config(), "/ws", Arc::new(Recorder::default()));
        assert!(matches!(
            manager.send_frame("{}".to_string()),
            Err(BridgeError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connects_once_backend_runs() {
        let (port, server) = echo_server().await;
        let recorder = Arc::new(Recorder::default());
        let manager = Arc::new(ConnectionManager::new(fast_config(), "/ws", recorder.clone()));
        let (status_tx, status_rx) = watch::channel(BackendStatus::default());
        let mut state_rx = manager.subscribe();
        let task = manager.spawn(status_rx);

        // Starting 상태에서는 연결하지 않음
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        status_tx.send_replace(running(port));
        wait_state(&mut state_rx, ConnectionState::Connected).await;

        manager.send_frame("first".to_string()).unwrap();
        manager.send_frame("second".to_string()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.frames.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            *recorder.frames.lock().unwrap(),
            vec!["echo:first".to_string(), "echo:second".to_string()]
        );

        task.close().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(*recorder.disconnects.lock().unwrap(), 1);
        assert!(manager.send_frame("late".to_string()).is_err());
        server.abort();
    }

    #[tokio::test]
    async fn test_drop_is_reported_and_not_retried_after_backend_exit() {
        // 한 번 받아들이고 바로 끊는 서버
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                    let _ = ws.close(None).await;
                }
            }
        });

        let recorder = Arc::new(Recorder::default());
        let manager = Arc::new(ConnectionManager::new(fast_config(), "/ws", recorder.clone()));
        let (status_tx, status_rx) = watch::channel(running(port));
        let task = manager.spawn(status_rx);

        tokio::time::timeout(Duration::from_secs(5), async {
            while *recorder.disconnects.lock().unwrap() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let mut crashed = running(port);
        crashed.state = ProcessState::Crashed;
        crashed.port = None;
        status_tx.send_replace(crashed);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!task.is_finished());
        task.close().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_dropping_task_handle_closes_session() {
        let (port, server) = echo_server().await;
        let recorder = Arc::new(Recorder::default());
        let manager = Arc::new(ConnectionManager::new(fast_config(), "/ws", recorder.clone()));
        let (_status_tx, status_rx) = watch::channel(running(port));
        let mut state_rx = manager.subscribe();
        let task = manager.spawn(status_rx);
        wait_state(&mut state_rx, ConnectionState::Connected).await;
        assert!(!task.is_finished());

        // close()를 거치지 않아도 Drop에서 취소됨
        drop(task);
        wait_state(&mut state_rx, ConnectionState::Disconnected).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while *recorder.disconnects.lock().unwrap() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn test_full_queue_is_rejected() {
        let (port, server) = echo_server().await;
        let manager = Arc::new(ConnectionManager::new(
            ConnectionConfig {
                send_queue_capacity: 1,
                ..fast_config()
            },
            "/ws",
            Arc::new(Recorder::default()),
        ));
        let (_status_tx, status_rx) = watch::channel(running(port));
        let mut state_rx = manager.subscribe();
        let task = manager.spawn(status_rx);
        wait_state(&mut state_rx, ConnectionState::Connected).await;

        let mut saw_full = false;
        for i in 0..10_000 {
            match manager.send_frame(format!("frame-{}", i)) {
                Ok(()) => {}
                Err(BridgeError::SendQueueFull) => {
                    saw_full = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {:?}", e),
            }
        }
        assert!(saw_full);
        task.close().await;
        server.abort();
    }
}
