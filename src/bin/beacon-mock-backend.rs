//! Stand-in backend speaking the bridge's readiness and wire protocol.
//!
//! `BEACON_MOCK_MODE`:
//! - `serve` (default): echo requests, ack events
//! - `silent`: accept connections and events, never answer requests
//! - `crash`: exit 1 before reporting readiness
//! - `clean-exit`: report readiness, then exit 0
//!
//! `BEACON_MOCK_COUNTER`, if set, names a file that gets one line per launch.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use beacon_bridge::{logging, Envelope};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Serve,
    Silent,
    Crash,
    CleanExit,
}

impl Mode {
    fn from_env() -> anyhow::Result<Self> {
        match std::env::var("BEACON_MOCK_MODE").as_deref() {
            Err(_) | Ok("serve") => Ok(Self::Serve),
            Ok("silent") => Ok(Self::Silent),
            Ok("crash") => Ok(Self::Crash),
            Ok("clean-exit") => Ok(Self::CleanExit),
            Ok(other) => anyhow::bail!("unknown BEACON_MOCK_MODE '{}'", other),
        }
    }
}

fn record_launch() -> anyhow::Result<()> {
    let Ok(path) = std::env::var("BEACON_MOCK_COUNTER") else {
        return Ok(());
    };
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "launch {}", std::process::id())?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_with("debug");
    let mode = Mode::from_env()?;
    record_launch()?;

    if mode == Mode::Crash {
        tracing::error!("crash mode: exiting before readiness");
        std::process::exit(1);
    }

    let bind = std::env::var("BEACON_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:0".to_string());
    let ws_path: Arc<str> = std::env::var("BEACON_WS_PATH")
        .unwrap_or_else(|_| "/ws".to_string())
        .into();

    let listener = TcpListener::bind(&bind).await?;
    let port = listener.local_addr()?.port();
    let mut stdout = std::io::stdout();
    writeln!(stdout, "LISTENING {}", port)?;
    stdout.flush()?;
    tracing::info!("mock backend serving ws://127.0.0.1:{}{} ({:?})", port, ws_path, mode);

    if mode == Mode::CleanExit {
        tokio::time::sleep(Duration::from_millis(200)).await;
        tracing::info!("clean-exit mode: leaving");
        return Ok(());
    }

    loop {
        let (stream, peer) = listener.accept().await?;
        let ws_path = ws_path.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, ws_path, mode).await {
                tracing::warn!("connection from {} ended: {}", peer, e);
            }
        });
    }
}

async fn serve_connection(stream: TcpStream, ws_path: Arc<str>, mode: Mode) -> anyhow::Result<()> {
    let expected = ws_path.clone();
    let ws = accept_hdr_async(stream, move |req: &Request, resp: Response| {
        if req.uri().path() == &*expected {
            Ok(resp)
        } else {
            let mut rejection = ErrorResponse::new(Some(format!("no endpoint at {}", req.uri().path())));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    })
    .await?;
    let (mut write, mut read) = ws.split();

    while let Some(message) = read.next().await {
        let text = match message? {
            Message::Text(text) => text.as_str().to_string(),
            Message::Close(_) => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            _ => continue,
        };
        let envelope = match Envelope::decode(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("{}", e);
                continue;
            }
        };

        let reply = match envelope.correlation_id {
            None => Envelope::event(
                "ack",
                json!({"received": envelope.event_type, "payload": envelope.payload}),
            ),
            Some(_) if mode == Mode::Silent => {
                tracing::debug!("silent mode: ignoring request '{}'", envelope.event_type);
                continue;
            }
            Some(id) => match envelope.event_type.as_str() {
                // 응답 없이 소켓을 끊음
                "drop" => return Ok(()),
                "fail" => {
                    let mut reply = Envelope::request("fail", id, Value::Null);
                    reply.error = Some("requested failure".to_string());
                    reply
                }
                _ => Envelope::request(envelope.event_type.clone(), id, json!({"echo": envelope.payload})),
            },
        };
        write.send(Message::text(reply.encode()?)).await?;
    }
    Ok(())
}
