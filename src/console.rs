//! Host console streaming.
//!
//! [`ConsoleLayer`] is a `tracing_subscriber` layer the host installs next to
//! its own formatter. Every event it sees becomes a [`ConsoleLine`] on a bounded
//! buffer; `Bridge::stream_console` drains that buffer and sends each line as a
//! `console_log` event while the backend link is up. Lines produced while the
//! link is down are discarded.

use std::fmt::Write as _;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

pub const CONSOLE_EVENT: &str = "console_log";
pub const DEFAULT_CAPACITY: usize = 512;

/// Targets never streamed: the bridge's own logs and forwarded backend output
/// would otherwise echo back to the backend.
const SKIPPED_TARGETS: &[&str] = &["beacon_bridge", "beacon::", "tokio_tungstenite", "tungstenite"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsoleLine {
    pub level: String,
    /// `[HH:MM:SS LEVEL]: text`, ANSI escapes removed.
    pub message: String,
}

impl ConsoleLine {
    pub fn to_payload(&self) -> Value {
        serde_json::json!({ "level": self.level, "message": self.message })
    }
}

/// Create a connected layer / buffer pair holding at most `capacity` lines.
pub fn channel(capacity: usize) -> (ConsoleLayer, ConsoleLines) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ConsoleLayer { tx }, ConsoleLines { rx })
}

#[derive(Clone)]
pub struct ConsoleLayer {
    tx: mpsc::Sender<ConsoleLine>,
}

pub struct ConsoleLines {
    rx: mpsc::Receiver<ConsoleLine>,
}

impl ConsoleLines {
    pub async fn recv(&mut self) -> Option<ConsoleLine> {
        self.rx.recv().await
    }
}

fn ansi_escape() -> Option<&'static Regex> {
    static ANSI: OnceLock<Option<Regex>> = OnceLock::new();
    ANSI.get_or_init(|| Regex::new(r"\x1B\[[0-9;]*[a-zA-Z]").ok()).as_ref()
}

fn strip_ansi(text: &str) -> String {
    match ansi_escape() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn push_field(&mut self, name: &str, value: std::fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={}", name, value);
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.push_field(field.name(), format_args!("{}", value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            self.push_field(field.name(), format_args!("{:?}", value));
        }
    }
}

impl<S> Layer<S> for ConsoleLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if SKIPPED_TARGETS.iter().any(|t| meta.target().starts_with(t)) {
            return;
        }
        // 스트림이 닫혔으면 포맷할 필요 없음
        if self.tx.is_closed() {
            return;
        }

        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let mut text = visitor.message;
        if !visitor.fields.is_empty() {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&visitor.fields);
        }

        let level = meta.level().to_string();
        let message = format!(
            "[{} {}]: {}",
            chrono::Local::now().format("%H:%M:%S"),
            level,
            strip_ansi(&text)
        );
        // 버퍼가 가득 차면 버림; 여기서 로그를 남기면 재귀
        let _ = self.tx.try_send(ConsoleLine { level, message });
    }
}
