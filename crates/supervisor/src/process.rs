//! Process supervisor.
//!
//! Owns every agent CLI subprocess: spawn with a sanitized environment, pipe
//! stdout/stderr into line events, detect readiness markers, escalate kills
//! (close stdin, wait the grace period, hard-kill), and consult a per-key
//! circuit breaker before every spawn.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};

use bc_domain::config::{BreakerConfig, SupervisorConfig};
use bc_domain::error::{Error, Result};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::env::sanitized_env;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events & spawn spec
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The supervisor's observable output.  External code never touches the PID
/// table or breaker state directly.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Spawned { key: String, pid: u32 },
    Stdout { key: String, line: String },
    Stderr { key: String, line: String },
    Exited { key: String, code: Option<i32>, quick: bool },
    /// A `--resume` launch exited inside the quick-exit window; the stored
    /// upstream session id must be cleared so the next launch is fresh.
    ResumeFailed { key: String },
    Error { key: String, message: String },
}

/// Everything needed to launch one backend process.
#[derive(Debug, Clone, Default)]
pub struct SpawnSpec {
    /// Session key the process belongs to.
    pub key: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Extra environment on top of the sanitized inherited one.
    pub env: Vec<(String, String)>,
    /// This launch is a resume attempt.
    pub resume: bool,
    /// Substring of a stdout line that signals readiness.
    pub ready_marker: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ManagedProcess {
    pid: u32,
    /// Dropped to signal a graceful shutdown.
    stdin: Option<ChildStdin>,
    /// Commands the monitor task to hard-kill.
    kill_tx: Option<oneshot::Sender<()>>,
    exited_rx: watch::Receiver<bool>,
    /// Fulfilled once the ready marker is observed on stdout.
    ready_rx: Option<oneshot::Receiver<()>>,
    /// Set by `kill` so an operator-initiated exit never counts as a failure.
    killed: Arc<AtomicBool>,
}

struct Inner {
    config: SupervisorConfig,
    breaker_config: BreakerConfig,
    procs: Mutex<HashMap<String, ManagedProcess>>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl Inner {
    fn with_breaker<R>(&self, key: &str, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(key.to_owned())
            .or_insert_with(|| CircuitBreaker::new(self.breaker_config.clone()));
        f(breaker)
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(
        config: SupervisorConfig,
        breaker_config: BreakerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(Inner {
                    config,
                    breaker_config,
                    procs: Mutex::new(HashMap::new()),
                    breakers: Mutex::new(HashMap::new()),
                    events,
                }),
            },
            rx,
        )
    }

    /// Spawn a backend process.  Refused with `CircuitOpen` while the key's
    /// breaker rejects restarts.
    pub fn spawn(&self, spec: SpawnSpec) -> Result<u32> {
        let now = Instant::now();
        if !self.inner.with_breaker(&spec.key, |b| b.allow(now)) {
            return Err(Error::CircuitOpen(spec.key.clone()));
        }
        if self.inner.procs.lock().contains_key(&spec.key) {
            return Err(Error::Other(format!(
                "process already running for {}",
                spec.key
            )));
        }

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .envs(sanitized_env(&self.inner.config.env_deny_list, &spec.env))
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.inner.with_breaker(&spec.key, |b| b.record_failure(now));
                self.inner.emit(SupervisorEvent::Error {
                    key: spec.key.clone(),
                    message: format!("spawn {}: {e}", spec.command),
                });
                return Err(Error::Io(e));
            }
        };

        let pid = child.id().unwrap_or(0);
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let killed = Arc::new(AtomicBool::new(false));

        // Stdout reader: line events + readiness detection.
        if let Some(stdout) = stdout {
            let inner = self.inner.clone();
            let key = spec.key.clone();
            let marker = spec.ready_marker.clone();
            let ready_tx = Arc::new(Mutex::new(Some(ready_tx)));
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(marker) = &marker {
                        if line.contains(marker.as_str()) {
                            if let Some(tx) = ready_tx.lock().take() {
                                let _ = tx.send(());
                            }
                        }
                    }
                    inner.emit(SupervisorEvent::Stdout {
                        key: key.clone(),
                        line,
                    });
                }
            });
        }

        // Stderr reader.
        if let Some(stderr) = stderr {
            let inner = self.inner.clone();
            let key = spec.key.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    inner.emit(SupervisorEvent::Stderr {
                        key: key.clone(),
                        line,
                    });
                }
            });
        }

        // Monitor: reap on natural exit or hard-kill command.
        {
            let inner = self.inner.clone();
            let key = spec.key.clone();
            let resume = spec.resume;
            let killed = killed.clone();
            let quick_window = Duration::from_millis(self.inner.config.quick_exit_window_ms);
            tokio::spawn(async move {
                let status = monitor_child(&mut child, kill_rx).await;
                let code = status.and_then(|s| s.code());
                let elapsed = now.elapsed();
                let was_killed = killed.load(Ordering::SeqCst);
                let quick = !was_killed && elapsed < quick_window;

                if quick {
                    inner.with_breaker(&key, |b| b.record_failure(Instant::now()));
                    if resume {
                        inner.emit(SupervisorEvent::ResumeFailed { key: key.clone() });
                    }
                }

                inner.procs.lock().remove(&key);
                let _ = exited_tx.send(true);
                tracing::info!(
                    key = %key,
                    code = ?code,
                    elapsed_ms = elapsed.as_millis() as u64,
                    quick,
                    "backend process exited"
                );
                inner.emit(SupervisorEvent::Exited { key, code, quick });
            });
        }

        self.inner.procs.lock().insert(
            spec.key.clone(),
            ManagedProcess {
                pid,
                stdin,
                kill_tx: Some(kill_tx),
                exited_rx,
                ready_rx: Some(ready_rx),
                killed,
            },
        );

        tracing::info!(key = %spec.key, pid, command = %spec.command, "backend process spawned");
        self.inner.emit(SupervisorEvent::Spawned {
            key: spec.key,
            pid,
        });
        Ok(pid)
    }

    /// Await the stdout readiness marker.  Counts as a breaker success.
    pub async fn wait_ready(&self, key: &str) -> Result<()> {
        let ready_rx = {
            let mut procs = self.inner.procs.lock();
            let proc = procs
                .get_mut(key)
                .ok_or_else(|| Error::Other(format!("no process for {key}")))?;
            proc.ready_rx
                .take()
                .ok_or_else(|| Error::Other(format!("readiness already awaited for {key}")))?
        };

        let timeout = Duration::from_millis(self.inner.config.readiness_timeout_ms);
        match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(())) => {
                self.mark_ready(key);
                Ok(())
            }
            Ok(Err(_)) => Err(Error::BackendConnect(format!(
                "{key} exited before becoming ready"
            ))),
            Err(_) => Err(Error::Timeout(format!(
                "{key} not ready within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Record an out-of-band readiness signal (e.g. the CLI connected back
    /// over WebSocket) as a breaker success.
    pub fn mark_ready(&self, key: &str) {
        self.inner
            .with_breaker(key, |b| b.record_success(Instant::now()));
    }

    /// Graceful-to-forceful kill escalation: close stdin, wait up to the
    /// grace period, then hard-kill.  No-op when the key is unknown.
    pub async fn kill(&self, key: &str) {
        let (mut exited_rx, kill_tx) = {
            let mut procs = self.inner.procs.lock();
            let Some(proc) = procs.get_mut(key) else {
                return;
            };
            proc.killed.store(true, Ordering::SeqCst);
            // Closing stdin is the soft terminate signal.
            proc.stdin.take();
            (proc.exited_rx.clone(), proc.kill_tx.take())
        };

        let grace = Duration::from_millis(self.inner.config.kill_grace_period_ms);
        let timed_out = {
            let exited = tokio::time::timeout(grace, exited_rx.wait_for(|done| *done)).await;
            exited.is_err()
        };
        if !timed_out {
            return;
        }

        tracing::warn!(key = %key, grace_ms = grace.as_millis() as u64, "grace period elapsed, hard-killing");
        if let Some(tx) = kill_tx {
            let _ = tx.send(());
        }
        let _ = exited_rx.wait_for(|done| *done).await;
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.inner.procs.lock().contains_key(key)
    }

    pub fn pid(&self, key: &str) -> Option<u32> {
        self.inner.procs.lock().get(key).map(|p| p.pid)
    }

    pub fn breaker_state(&self, key: &str) -> BreakerState {
        self.inner.with_breaker(key, |b| b.state())
    }
}

/// Wait for natural exit, or hard-kill when commanded and then reap.
async fn monitor_child(
    child: &mut Child,
    kill_rx: oneshot::Receiver<()>,
) -> Option<std::process::ExitStatus> {
    tokio::select! {
        status = child.wait() => status.ok(),
        _ = kill_rx => {
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn make_supervisor() -> (ProcessSupervisor, mpsc::UnboundedReceiver<SupervisorEvent>) {
        ProcessSupervisor::new(
            SupervisorConfig {
                kill_grace_period_ms: 500,
                readiness_timeout_ms: 2000,
                quick_exit_window_ms: 100,
                env_deny_list: vec![],
            },
            BreakerConfig {
                failure_threshold: 2,
                window_ms: 60_000,
                recovery_time_ms: 60_000,
                success_threshold: 1,
            },
        )
    }

    async fn next_matching(
        rx: &mut mpsc::UnboundedReceiver<SupervisorEvent>,
        mut pred: impl FnMut(&SupervisorEvent) -> bool,
    ) -> SupervisorEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn spawn_pipes_stdout_lines() {
        let (supervisor, mut rx) = make_supervisor();
        supervisor
            .spawn(SpawnSpec {
                key: "s1".into(),
                command: "sh".into(),
                args: vec!["-c".into(), "echo hello; sleep 0.2".into()],
                ..Default::default()
            })
            .unwrap();

        let event = next_matching(&mut rx, |e| matches!(e, SupervisorEvent::Stdout { .. })).await;
        match event {
            SupervisorEvent::Stdout { key, line } => {
                assert_eq!(key, "s1");
                assert_eq!(line, "hello");
            }
            _ => unreachable!(),
        }
        let event = next_matching(&mut rx, |e| matches!(e, SupervisorEvent::Exited { .. })).await;
        match event {
            SupervisorEvent::Exited { code, .. } => assert_eq!(code, Some(0)),
            _ => unreachable!(),
        }
        assert!(!supervisor.is_running("s1"));
    }

    #[tokio::test]
    async fn ready_marker_detected() {
        let (supervisor, _rx) = make_supervisor();
        supervisor
            .spawn(SpawnSpec {
                key: "s1".into(),
                command: "sh".into(),
                args: vec!["-c".into(), "echo listening on 4096; sleep 0.5".into()],
                ready_marker: Some("listening on".into()),
                ..Default::default()
            })
            .unwrap();
        supervisor.wait_ready("s1").await.unwrap();
    }

    #[tokio::test]
    async fn quick_exits_trip_breaker() {
        let (supervisor, mut rx) = make_supervisor();
        for _ in 0..2 {
            supervisor
                .spawn(SpawnSpec {
                    key: "s1".into(),
                    command: "false".into(),
                    ..Default::default()
                })
                .unwrap();
            let event =
                next_matching(&mut rx, |e| matches!(e, SupervisorEvent::Exited { .. })).await;
            match event {
                SupervisorEvent::Exited { quick, .. } => assert!(quick),
                _ => unreachable!(),
            }
        }
        assert_eq!(supervisor.breaker_state("s1"), BreakerState::Open);
        let err = supervisor
            .spawn(SpawnSpec {
                key: "s1".into(),
                command: "true".into(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen(_)));
    }

    #[tokio::test]
    async fn resume_quick_exit_emits_resume_failed() {
        let (supervisor, mut rx) = make_supervisor();
        supervisor
            .spawn(SpawnSpec {
                key: "s1".into(),
                command: "false".into(),
                resume: true,
                ..Default::default()
            })
            .unwrap();
        next_matching(&mut rx, |e| matches!(e, SupervisorEvent::ResumeFailed { .. })).await;
    }

    #[tokio::test]
    async fn kill_escalates_to_hard_kill() {
        let (supervisor, mut rx) = make_supervisor();
        // Trap-less sleep ignores stdin close; forces escalation.
        supervisor
            .spawn(SpawnSpec {
                key: "s1".into(),
                command: "sleep".into(),
                args: vec!["30".into()],
                ..Default::default()
            })
            .unwrap();
        next_matching(&mut rx, |e| matches!(e, SupervisorEvent::Spawned { .. })).await;

        let started = Instant::now();
        supervisor.kill("s1").await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!supervisor.is_running("s1"));

        // Operator kill is not a breaker failure.
        let event = next_matching(&mut rx, |e| matches!(e, SupervisorEvent::Exited { .. })).await;
        match event {
            SupervisorEvent::Exited { quick, .. } => assert!(!quick),
            _ => unreachable!(),
        }
        assert_eq!(supervisor.breaker_state("s1"), BreakerState::Closed);
    }

    #[tokio::test]
    async fn kill_unknown_key_is_noop() {
        let (supervisor, _rx) = make_supervisor();
        supervisor.kill("ghost").await;
    }

    #[tokio::test]
    async fn double_spawn_same_key_rejected() {
        let (supervisor, _rx) = make_supervisor();
        supervisor
            .spawn(SpawnSpec {
                key: "s1".into(),
                command: "sleep".into(),
                args: vec!["5".into()],
                ..Default::default()
            })
            .unwrap();
        let err = supervisor
            .spawn(SpawnSpec {
                key: "s1".into(),
                command: "sleep".into(),
                args: vec!["5".into()],
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::Other(_)));
        supervisor.kill("s1").await;
    }
}
