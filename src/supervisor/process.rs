//! Backend process - spawning with the readiness handshake and stdio forwarding
//!
//! The child is told where to bind through its environment and announces the
//! port it actually bound by printing `LISTENING <port>` on stdout. Every
//! stdout/stderr line is re-emitted through `tracing` under the
//! `beacon::backend` target so backend failures show up in the host's log.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Environment variable carrying the requested bind address.
pub const BIND_ADDR_ENV: &str = "BEACON_BIND_ADDR";
/// Environment variable carrying the WebSocket path the child must serve.
pub const WS_PATH_ENV: &str = "BEACON_WS_PATH";
/// Port 0: the child picks a free port and reports it back.
pub const REQUESTED_BIND_ADDR: &str = "127.0.0.1:0";

const READY_PREFIX: &str = "LISTENING";
const LOG_TARGET: &str = "beacon::backend";
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub ws_path: String,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>, ws_path: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            ws_path: ws_path.into(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }
}

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("exited before reporting readiness ({0})")]
    ExitedEarly(String),

    #[error("no readiness line within {0:?}")]
    ReadinessTimeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputSource {
    Stdout,
    Stderr,
}

/// A running backend child. Owned by exactly one supervisor task.
#[derive(Debug)]
pub struct BackendProcess {
    child: Child,
    pid: u32,
    port: u16,
    output_tasks: Vec<JoinHandle<()>>,
}

enum Readiness {
    Ready(u16),
    Exited(io::Result<ExitStatus>),
    TimedOut,
}

impl BackendProcess {
    /// Spawn the child and wait until it reports its port.
    pub async fn launch(
        spec: &LaunchSpec,
        readiness_timeout: Duration,
        log_pattern: Option<Arc<Regex>>,
    ) -> Result<Self, LaunchError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .env(BIND_ADDR_ENV, REQUESTED_BIND_ADDR)
            .env(WS_PATH_ENV, &spec.ws_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        hide_console_window(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| LaunchError::Spawn {
            program: spec.program.display().to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id().unwrap_or(0);
        tracing::info!("Spawned backend {} (pid {})", spec.program.display(), pid);

        let (ready_tx, ready_rx) = oneshot::channel::<u16>();
        let mut output_tasks = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            output_tasks.push(tokio::spawn(forward_output(
                stdout,
                OutputSource::Stdout,
                pid,
                log_pattern.clone(),
                Some(ready_tx),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            output_tasks.push(tokio::spawn(forward_output(
                stderr,
                OutputSource::Stderr,
                pid,
                log_pattern,
                None,
            )));
        }

        // stdout가 readiness 없이 닫히면 종료/타임아웃 중 먼저 오는 쪽을 기다림
        let ready = async {
            match ready_rx.await {
                Ok(port) => port,
                Err(_) => std::future::pending::<u16>().await,
            }
        };
        let outcome = tokio::select! {
            biased;
            port = ready => Readiness::Ready(port),
            status = child.wait() => Readiness::Exited(status),
            _ = tokio::time::sleep(readiness_timeout) => Readiness::TimedOut,
        };

        match outcome {
            Readiness::Ready(port) => Ok(Self {
                child,
                pid,
                port,
                output_tasks,
            }),
            Readiness::Exited(status) => {
                let detail = match status {
                    Ok(status) => status.to_string(),
                    Err(e) => e.to_string(),
                };
                Err(LaunchError::ExitedEarly(detail))
            }
            Readiness::TimedOut => {
                if let Err(e) = child.kill().await {
                    tracing::warn!("Failed to kill unresponsive backend (pid {}): {}", pid, e);
                }
                Err(LaunchError::ReadinessTimeout(readiness_timeout))
            }
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolves when the child exits, after its remaining output was forwarded.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait().await;
        self.drain_output().await;
        status
    }

    async fn drain_output(&mut self) {
        for task in self.output_tasks.drain(..) {
            // 손자 프로세스가 파이프를 잡고 있으면 무한 대기하므로 상한을 둠
            let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await;
        }
    }

    /// Ask the child to exit, then force it after `grace`.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }
        tracing::info!("Sending termination request to backend (pid {})", self.pid);
        if let Err(e) = request_exit(&mut self.child) {
            tracing::warn!("Graceful termination of pid {} failed: {}", self.pid, e);
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!(
                    "Backend (pid {}) still alive after {:?}, killing",
                    self.pid,
                    grace
                );
                self.child.kill().await?;
                self.child.wait().await
            }
        }
    }
}

#[cfg(unix)]
fn request_exit(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    // id()가 None이면 이미 회수된 프로세스
    let Some(pid) = child.id() else {
        return Ok(());
    };
    signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

#[cfg(target_os = "windows")]
fn hide_console_window(cmd: &mut Command) {
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(target_os = "windows"))]
fn hide_console_window(_cmd: &mut Command) {}

async fn forward_output<R>(
    reader: R,
    source: OutputSource,
    pid: u32,
    pattern: Option<Arc<Regex>>,
    mut ready: Option<oneshot::Sender<u16>>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(target: LOG_TARGET, "Output stream of pid {} closed: {}", pid, e);
                break;
            }
        };
        if ready.is_some() {
            if let Some(port) = parse_listening_line(&line) {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(port);
                }
            }
        }
        let mut level = parse_log_level(&line, pattern.as_deref());
        // stderr lines default to at least Warn
        if source == OutputSource::Stderr && level == LogLevel::Info {
            level = LogLevel::Warn;
        }
        emit(level, pid, &line);
    }
}

fn emit(level: LogLevel, pid: u32, line: &str) {
    match level {
        LogLevel::Error => tracing::error!(target: LOG_TARGET, pid, "[backend] {}", line),
        LogLevel::Warn => tracing::warn!(target: LOG_TARGET, pid, "[backend] {}", line),
        LogLevel::Info => tracing::info!(target: LOG_TARGET, pid, "[backend] {}", line),
        LogLevel::Debug => tracing::debug!(target: LOG_TARGET, pid, "[backend] {}", line),
    }
}

/// Parse `LISTENING <port>`. Anything else, including port 0, is not a readiness line.
pub fn parse_listening_line(line: &str) -> Option<u16> {
    let rest = line.trim().strip_prefix(READY_PREFIX)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    match rest.trim().parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

/// Parse the log level from a backend output line using an optional regex pattern.
///
/// The pattern should contain a named capture group `level`. Without a pattern
/// (or without a match) the line is Info.
fn parse_log_level(line: &str, pattern: Option<&Regex>) -> LogLevel {
    let Some(re) = pattern else {
        return LogLevel::Info;
    };
    let Some(level) = re.captures(line).and_then(|caps| caps.name("level")) else {
        return LogLevel::Info;
    };
    match level.as_str().to_uppercase().as_str() {
        "ERROR" | "FATAL" | "PANIC" => LogLevel::Error,
        "WARN" | "WARNING" => LogLevel::Warn,
        "DEBUG" | "TRACE" => LogLevel::Debug,
        _ => LogLevel::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listening_line() {
        assert_eq!(parse_listening_line("LISTENING 54321"), Some(54321));
        assert_eq!(parse_listening_line("LISTENING   8080  "), Some(8080));
        assert_eq!(parse_listening_line("LISTENING 0"), None);
        assert_eq!(parse_listening_line("LISTENING 70000"), None);
        assert_eq!(parse_listening_line("LISTENING54321"), None);
        assert_eq!(parse_listening_line("LISTENING"), None);
        assert_eq!(parse_listening_line("listening 54321"), None);
        assert_eq!(parse_listening_line("Beacon Backend running on http://localhost:8080/"), None);
    }

    #[test]
    fn test_parse_log_level_with_pattern() {
        // Go log / slog style
        let pattern = Regex::new(r"level=(?P<level>INFO|WARN|ERROR|DEBUG)").unwrap();
        assert_eq!(
            parse_log_level("time=12:00 level=ERROR msg=\"store failed\"", Some(&pattern)),
            LogLevel::Error
        );
        assert_eq!(parse_log_level("level=WARN msg=slow", Some(&pattern)), LogLevel::Warn);
        assert_eq!(parse_log_level("level=DEBUG msg=tick", Some(&pattern)), LogLevel::Debug);
        assert_eq!(parse_log_level("plain output", Some(&pattern)), LogLevel::Info);
    }

    #[test]
    fn test_parse_log_level_without_pattern() {
        assert_eq!(parse_log_level("level=ERROR msg=x", None), LogLevel::Info);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_reads_port_from_stdout() {
        let spec = LaunchSpec::new("/bin/sh", "/ws")
            .with_args(["-c".to_string(), "echo booting; echo LISTENING 40123; sleep 30".to_string()]);
        let mut process = BackendProcess::launch(&spec, Duration::from_secs(5), None)
            .await
            .unwrap();
        assert_eq!(process.port(), 40123);
        assert!(process.pid() > 0);
        let status = process.terminate(Duration::from_secs(2)).await.unwrap();
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_sets_bind_env() {
        let spec = LaunchSpec::new("/bin/sh", "/custom")
            .with_args([
                "-c".to_string(),
                "[ \"$BEACON_BIND_ADDR\" = 127.0.0.1:0 ] && [ \"$BEACON_WS_PATH\" = /custom ] && echo LISTENING 1234 && sleep 30".to_string(),
            ]);
        let mut process = BackendProcess::launch(&spec, Duration::from_secs(5), None)
            .await
            .unwrap();
        assert_eq!(process.port(), 1234);
        process.terminate(Duration::from_secs(2)).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_early_exit() {
        let spec = LaunchSpec::new("/bin/sh", "/ws").with_args(["-c".to_string(), "exit 3".to_string()]);
        let err = BackendProcess::launch(&spec, Duration::from_secs(5), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::ExitedEarly(_)), "{:?}", err);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_readiness_timeout() {
        let spec = LaunchSpec::new("/bin/sh", "/ws").with_args(["-c".to_string(), "sleep 30".to_string()]);
        let err = BackendProcess::launch(&spec, Duration::from_millis(200), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::ReadinessTimeout(_)), "{:?}", err);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_forces_after_grace() {
        let spec = LaunchSpec::new("/bin/sh", "/ws").with_args([
            "-c".to_string(),
            "trap '' TERM; echo LISTENING 4000; while true; do sleep 1; done".to_string(),
        ]);
        let mut process = BackendProcess::launch(&spec, Duration::from_secs(5), None)
            .await
            .unwrap();
        let started = std::time::Instant::now();
        let status = process.terminate(Duration::from_millis(300)).await.unwrap();
        assert!(!status.success());
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let spec = LaunchSpec::new("/definitely/not/a/beacon-backend", "/ws");
        let err = BackendProcess::launch(&spec, Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }
}
