//! Process Supervisor — owns the backend child for the lifetime of the bridge.
//!
//! A single supervision task holds the [`BackendProcess`]; everyone else sees
//! the process only through the [`BackendStatus`] watch channel.

pub mod process;
pub mod restart;
pub mod state_machine;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{BridgeConfig, RestartConfig};
use crate::error::BridgeError;
use process::{BackendProcess, LaunchSpec};
use restart::RestartPolicy;
use state_machine::{ProcessState, StateMachine};

/// Snapshot of the supervised backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStatus {
    pub state: ProcessState,
    /// Live port, only while `Running`.
    pub port: Option<u16>,
    pub pid: Option<u32>,
    /// Restarts performed in the current start cycle.
    pub restarts: u32,
    /// Set once the restart budget is exhausted.
    pub unavailable: bool,
}

impl Default for BackendStatus {
    fn default() -> Self {
        Self {
            state: ProcessState::NotStarted,
            port: None,
            pid: None,
            restarts: 0,
            unavailable: false,
        }
    }
}

impl BackendStatus {
    /// Running with a known port.
    pub fn live_port(&self) -> Option<u16> {
        match self.state {
            ProcessState::Running => self.port,
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub readiness_timeout: Duration,
    pub stop_grace: Duration,
    pub restart: RestartConfig,
    pub log_pattern: Option<Arc<Regex>>,
}

impl SupervisorSettings {
    pub fn from_config(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let log_pattern = match &config.backend.log_pattern {
            Some(pattern) => Some(Arc::new(Regex::new(pattern).map_err(|e| {
                BridgeError::Config(format!("backend.log_pattern: {}", e))
            })?)),
            None => None,
        };
        Ok(Self {
            readiness_timeout: config.backend.readiness_timeout(),
            stop_grace: config.backend.stop_grace(),
            restart: config.restart.clone(),
            log_pattern,
        })
    }
}

/// State machine and the watch channel it publishes to, updated together.
struct StatusCell {
    machine: Mutex<StateMachine>,
    tx: watch::Sender<BackendStatus>,
}

impl StatusCell {
    fn new() -> Self {
        let (tx, _) = watch::channel(BackendStatus::default());
        Self {
            machine: Mutex::new(StateMachine::new()),
            tx,
        }
    }

    fn current(&self) -> BackendStatus {
        self.tx.borrow().clone()
    }

    fn transition(&self, to: ProcessState) -> bool {
        self.transition_with(to, |_| {})
    }

    fn transition_with(&self, to: ProcessState, update: impl FnOnce(&mut BackendStatus)) -> bool {
        let mut machine = match self.machine.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = machine.transition(to) {
            tracing::error!("Supervisor state error: {}", e);
            return false;
        }
        self.tx.send_modify(|status| {
            status.state = to;
            if to != ProcessState::Running {
                status.port = None;
                status.pid = None;
            }
            update(status);
        });
        true
    }
}

struct SupervisorTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Supervisor {
    settings: SupervisorSettings,
    status: Arc<StatusCell>,
    task: tokio::sync::Mutex<Option<SupervisorTask>>,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            status: Arc::new(StatusCell::new()),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn status(&self) -> BackendStatus {
        self.status.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<BackendStatus> {
        self.status.tx.subscribe()
    }

    /// Launch the backend and resolve with its live port.
    ///
    /// Idempotent: while a start cycle is active this waits for (or returns) the
    /// current port instead of spawning a second child. Fails with
    /// `BackendUnavailable` once the restart budget runs out before any launch
    /// reported readiness, or `Cancelled` if `stop()` cuts the wait short.
    pub async fn start(&self, spec: LaunchSpec) -> Result<u16, BridgeError> {
        {
            let mut task = self.task.lock().await;
            let active = task.as_ref().map_or(false, |t| !t.handle.is_finished());
            if !active {
                if let Some(old) = task.take() {
                    old.cancel.cancel();
                    let _ = old.handle.await;
                }
                let status = self.status.current();
                if status.state == ProcessState::Crashed {
                    // 이전 사이클이 재시작 한도를 소진한 상태
                    self.status.transition(ProcessState::Stopped);
                }
                self.status.transition_with(ProcessState::Starting, |s| {
                    s.restarts = 0;
                    s.unavailable = false;
                });

                let cancel = CancellationToken::new();
                let handle = tokio::spawn(supervise(
                    spec,
                    self.settings.clone(),
                    self.status.clone(),
                    cancel.clone(),
                ));
                *task = Some(SupervisorTask { cancel, handle });
            }
        }
        self.wait_until_running().await
    }

    async fn wait_until_running(&self) -> Result<u16, BridgeError> {
        let mut rx = self.subscribe();
        let status = rx
            .wait_for(|s| {
                s.live_port().is_some() || s.unavailable || s.state == ProcessState::Stopped
            })
            .await
            .map(|s| s.clone())
            .map_err(|_| BridgeError::BackendUnavailable { attempts: 0 })?;
        match status.live_port() {
            Some(port) => Ok(port),
            None if status.unavailable => Err(BridgeError::BackendUnavailable {
                attempts: status.restarts,
            }),
            // stop()이 기동 대기를 끊음
            None => Err(BridgeError::Cancelled),
        }
    }

    /// Stop the backend: graceful signal, then force after the grace period.
    /// Returns once the state is `Stopped`. No-op when nothing is running.
    pub async fn stop(&self) -> Result<(), BridgeError> {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                tracing::warn!("Supervisor task ended abnormally: {}", e);
            }
        }
        if self.status.current().state == ProcessState::Crashed {
            self.status.transition(ProcessState::Stopped);
        }
        Ok(())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // 호스트가 stop() 없이 내려도 자식 프로세스가 남지 않도록
        if let Ok(mut task) = self.task.try_lock() {
            if let Some(task) = task.take() {
                task.cancel.cancel();
            }
        }
    }
}

enum RunOutcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    StopRequested,
}

async fn supervise(
    spec: LaunchSpec,
    settings: SupervisorSettings,
    status: Arc<StatusCell>,
    cancel: CancellationToken,
) {
    let mut policy = RestartPolicy::new(&settings.restart);

    loop {
        let launched = tokio::select! {
            res = BackendProcess::launch(&spec, settings.readiness_timeout, settings.log_pattern.clone()) => Some(res),
            _ = cancel.cancelled() => None,
        };
        let Some(launched) = launched else {
            // 기동 중 취소: launch future drop → kill_on_drop
            status.transition(ProcessState::Stopping);
            status.transition(ProcessState::Stopped);
            return;
        };

        match launched {
            Ok(mut process) => {
                let (pid, port) = (process.pid(), process.port());
                status.transition_with(ProcessState::Running, |s| {
                    s.port = Some(port);
                    s.pid = Some(pid);
                });
                tracing::info!("Backend running (pid {}, port {})", pid, port);

                let outcome = tokio::select! {
                    res = process.wait() => RunOutcome::Exited(res),
                    _ = cancel.cancelled() => RunOutcome::StopRequested,
                };
                match outcome {
                    RunOutcome::StopRequested => {
                        status.transition(ProcessState::Stopping);
                        match process.terminate(settings.stop_grace).await {
                            Ok(exit) => tracing::info!("Backend stopped ({})", exit),
                            Err(e) => tracing::warn!("Error while stopping backend: {}", e),
                        }
                        status.transition(ProcessState::Stopped);
                        return;
                    }
                    RunOutcome::Exited(Ok(exit)) if exit.success() => {
                        tracing::info!("Backend exited cleanly, not restarting");
                        status.transition(ProcessState::Stopped);
                        return;
                    }
                    RunOutcome::Exited(Ok(exit)) => {
                        tracing::warn!("Backend (pid {}) crashed: {}", pid, exit);
                    }
                    RunOutcome::Exited(Err(e)) => {
                        tracing::warn!("Lost track of backend (pid {}): {}", pid, e);
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Backend launch failed: {}", e);
            }
        }
        status.transition(ProcessState::Crashed);

        match policy.on_crash(Instant::now()) {
            Some(delay) => {
                let attempt = policy.total_restarts();
                status.tx.send_modify(|s| s.restarts = attempt);
                tracing::warn!(
                    "Restarting backend in {:?} (attempt {}/{})",
                    delay,
                    attempt,
                    policy.max_restarts()
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        status.transition(ProcessState::Stopped);
                        return;
                    }
                }
                status.transition(ProcessState::Starting);
            }
            None => {
                tracing::error!(
                    "Backend crashed {} times within {:?}; giving up, bridge disabled",
                    policy.max_restarts() + 1,
                    settings.restart.window()
                );
                status.tx.send_modify(|s| s.unavailable = true);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_settings(max_restarts: u32) -> SupervisorSettings {
        SupervisorSettings {
            readiness_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(2),
            restart: RestartConfig {
                max_restarts,
                window_secs: 300,
                initial_delay_ms: 10,
                max_delay_ms: 40,
            },
            log_pattern: None,
        }
    }

    #[test]
    fn test_settings_reject_bad_pattern() {
        let mut cfg = BridgeConfig::default();
        cfg.backend.log_pattern = Some("(".to_string());
        assert!(SupervisorSettings::from_config(&cfg).is_err());
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let sup = Supervisor::new(fast_settings(1));
        assert!(sup.stop().await.is_ok());
        assert!(sup.stop().await.is_ok());
        assert_eq!(sup.status().state, ProcessState::NotStarted);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_stop_cycle() {
        let sup = Supervisor::new(fast_settings(1));
        let spec = LaunchSpec::new("/bin/sh", "/ws")
            .with_args(["-c".to_string(), "echo LISTENING 41000; exec sleep 30".to_string()]);

        let port = sup.start(spec.clone()).await.unwrap();
        assert_eq!(port, 41000);
        assert_eq!(sup.status().state, ProcessState::Running);
        assert!(sup.status().pid.is_some());

        // 실행 중 재호출은 같은 포트 반환
        assert_eq!(sup.start(spec.clone()).await.unwrap(), 41000);

        sup.stop().await.unwrap();
        assert_eq!(sup.status().state, ProcessState::Stopped);
        assert_eq!(sup.status().port, None);
        sup.stop().await.unwrap();

        // fresh cycle after stop
        assert_eq!(sup.start(spec).await.unwrap(), 41000);
        sup.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_loop_gives_up_after_cap() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("launches");
        let script = format!("echo launch >> '{}'; exit 1", counter.display());
        let spec = LaunchSpec::new("/bin/sh", "/ws").with_args(["-c".to_string(), script]);

        let sup = Supervisor::new(fast_settings(3));
        match sup.start(spec).await {
            Err(BridgeError::BackendUnavailable { attempts }) => assert_eq!(attempts, 3),
            other => panic!("expected BackendUnavailable, got {:?}", other),
        }
        let launches = std::fs::read_to_string(&counter).unwrap().lines().count();
        assert_eq!(launches, 4, "initial launch plus exactly 3 restarts");
        let status = sup.status();
        assert!(status.unavailable);
        assert_eq!(status.state, ProcessState::Crashed);

        sup.stop().await.unwrap();
        assert_eq!(sup.status().state, ProcessState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_while_running_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran-once");
        // 첫 실행은 준비 후 곧 크래시, 두 번째 실행은 계속 유지
        let script = format!(
            "if [ -e '{m}' ]; then echo LISTENING 42002; exec sleep 30; else touch '{m}'; echo LISTENING 42001; sleep 0.2; exit 7; fi",
            m = marker.display()
        );
        let spec = LaunchSpec::new("/bin/sh", "/ws").with_args(["-c".to_string(), script]);
        let sup = Supervisor::new(fast_settings(2));
        let mut rx = sup.subscribe();

        assert_eq!(sup.start(spec).await.unwrap(), 42001);
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.live_port() == Some(42002)),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(status.restarts, 1);
        assert!(!status.unavailable);
        sup.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clean_exit_is_not_restarted() {
        let spec = LaunchSpec::new("/bin/sh", "/ws")
            .with_args(["-c".to_string(), "echo LISTENING 43000; sleep 0.1; exit 0".to_string()]);
        let sup = Supervisor::new(fast_settings(3));
        let mut rx = sup.subscribe();
        sup.start(spec).await.unwrap();
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.state == ProcessState::Stopped),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(status.restarts, 0);
        assert!(!status.unavailable);
    }
}
