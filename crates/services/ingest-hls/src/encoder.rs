//! Encoder process supervision
//!
//! Spawns the external encoder for a session, watches it from a background
//! task and applies a bounded restart policy when it fails.
//!
//! # State machine
//!
//! ```text
//! NotStarted -> Starting (warm-up) -> Running -> Stopped
//!                                       |
//!                                       +--> Restarting -> Running   (up to max_restarts)
//!                                       +--> Dead                    (restarts exhausted)
//! ```
//!
//! `Stopped` and `Dead` are terminal. The caller owns an [`EncoderHandle`];
//! stopping or dropping it signals the supervision task, which terminates the
//! process on its own time so the caller never waits for exit.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::key::SessionKey;
use crate::metrics::global_metrics;

/// Number of stderr lines kept for failure reports
const STDERR_TAIL_LINES: usize = 20;

/// Program, arguments and working directory of an encoder invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Command line for log output
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Spawn a process according to its specification
///
/// stdout is discarded and stderr is piped so the caller can drain it.
pub fn spawn(spec: &ProcessSpec) -> Result<Child, EncoderError> {
    let mut cmd = Command::new(&spec.program);

    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    cmd.spawn().map_err(|e| EncoderError::Spawn {
        program: spec.program.display().to_string(),
        reason: e.to_string(),
    })
}

/// Run a process to completion, failing with its stderr tail on a non-zero exit
pub async fn run_to_completion(spec: &ProcessSpec, label: &str) -> Result<(), EncoderError> {
    let mut child = spawn(spec)?;
    let stderr = drain_stderr(child.stderr.take(), label.to_string());

    let status = child.wait().await?;
    let tail = stderr.await.unwrap_or_default();

    if status.success() {
        Ok(())
    } else {
        Err(EncoderError::Exited {
            code: status.code(),
            stderr: tail.join("\n"),
        })
    }
}

/// Log every stderr line at debug level and keep the last few for error reports
fn drain_stderr(stderr: Option<ChildStderr>, label: String) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let Some(stderr) = stderr else {
            return Vec::new();
        };

        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(encoder = %label, "{}", line);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into_iter().collect()
    })
}

/// Bounded restart policy for the live encoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restarts allowed after the first spawn; exhausting them is terminal
    pub max_restarts: u32,

    /// Fixed delay before each restart
    pub backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 1,
            backoff: Duration::from_secs(3),
        }
    }
}

/// Supervisor timing configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Delay between session creation and the first spawn, so the ingest
    /// file holds enough bytes for format probing
    pub warmup: Duration,

    /// Restart behaviour on encoder failure
    pub restart: RestartPolicy,

    /// Time a terminated encoder gets to exit before it is killed
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(5),
            restart: RestartPolicy::default(),
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl SupervisorConfig {
    /// Upper bound on the time from a stop signal to a terminal state
    ///
    /// Covers the grace period plus the kill and reap that follow it.
    pub fn termination_timeout(&self) -> Duration {
        self.stop_grace + Duration::from_secs(1)
    }
}

/// Supervisor state, published on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SupervisorState {
    NotStarted,
    /// Waiting out the warm-up delay
    Starting,
    /// Encoder process alive; attempt 0 is the initial spawn
    Running { attempt: u32 },
    /// Encoder failed, waiting out the backoff before `attempt`
    Restarting { attempt: u32 },
    Stopped,
    Dead,
}

impl SupervisorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SupervisorState::Stopped | SupervisorState::Dead)
    }
}

/// Callback invoked on every supervisor state transition
pub type StateCallback = Arc<dyn Fn(SupervisorState) + Send + Sync>;

/// Owned handle to a supervised encoder
///
/// Dropping the handle has the same effect as [`EncoderHandle::stop`].
pub struct EncoderHandle {
    key: SessionKey,
    stop_tx: Option<oneshot::Sender<()>>,
    state_rx: watch::Receiver<SupervisorState>,
}

impl EncoderHandle {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Current supervisor state
    pub fn state(&self) -> SupervisorState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every subsequent state change
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state_rx.clone()
    }

    /// Signal the encoder to terminate and release the handle
    ///
    /// Returns immediately; termination completes in the background.
    pub fn stop(mut self) {
        self.signal_stop();
    }

    /// Wait until the supervisor reaches `Stopped` or `Dead`
    pub async fn wait_terminal(&self) -> SupervisorState {
        wait_terminal(self.state_rx.clone()).await
    }

    fn signal_stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            tracing::debug!(session_key = %self.key, "Signalling encoder stop");
            let _ = tx.send(());
        }
    }
}

impl Drop for EncoderHandle {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

impl std::fmt::Debug for EncoderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderHandle")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

/// Wait on a state receiver until the supervisor reaches a terminal state
pub async fn wait_terminal(mut rx: watch::Receiver<SupervisorState>) -> SupervisorState {
    match rx.wait_for(SupervisorState::is_terminal).await {
        Ok(state) => *state,
        // Sender gone without a terminal state means the task was aborted
        Err(_) => SupervisorState::Dead,
    }
}

/// Spawns and supervises live encoders
#[derive(Debug, Clone, Default)]
pub struct TranscodeSupervisor {
    config: SupervisorConfig,
}

impl TranscodeSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Schedule the encoder for `key` to start after the warm-up delay
    pub fn start(
        &self,
        key: SessionKey,
        spec: ProcessSpec,
        on_state: Option<StateCallback>,
    ) -> EncoderHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(SupervisorState::NotStarted);

        let supervision = Supervision {
            key: key.clone(),
            spec,
            config: self.config.clone(),
            state_tx,
            on_state,
        };
        tokio::spawn(supervision.run(stop_rx));

        EncoderHandle {
            key,
            stop_tx: Some(stop_tx),
            state_rx,
        }
    }
}

/// Outcome of one encoder run
enum RunOutcome {
    /// Stop was requested while the encoder ran
    Stopped,
    /// Encoder exited cleanly (input ended)
    Finished,
    Failed(EncoderError),
}

struct Supervision {
    key: SessionKey,
    spec: ProcessSpec,
    config: SupervisorConfig,
    state_tx: watch::Sender<SupervisorState>,
    on_state: Option<StateCallback>,
}

impl Supervision {
    async fn run(self, mut stop_rx: oneshot::Receiver<()>) {
        self.transition(SupervisorState::Starting);

        tokio::select! {
            _ = tokio::time::sleep(self.config.warmup) => {}
            _ = &mut stop_rx => {
                tracing::debug!(session_key = %self.key, "Encoder stopped during warm-up");
                self.transition(SupervisorState::Stopped);
                return;
            }
        }

        let mut attempt = 0u32;
        loop {
            let failure = match self.run_once(attempt, &mut stop_rx).await {
                RunOutcome::Stopped => {
                    self.transition(SupervisorState::Stopped);
                    return;
                }
                RunOutcome::Finished => {
                    tracing::info!(session_key = %self.key, attempt, "Encoder finished");
                    self.transition(SupervisorState::Stopped);
                    return;
                }
                RunOutcome::Failed(err) => err,
            };

            global_metrics().encoder_failed();

            if attempt >= self.config.restart.max_restarts {
                tracing::error!(
                    session_key = %self.key,
                    attempts = attempt + 1,
                    error = %failure,
                    "Encoder failed permanently, live playlist will stop advancing"
                );
                self.transition(SupervisorState::Dead);
                return;
            }

            attempt += 1;
            tracing::warn!(
                session_key = %self.key,
                attempt,
                max_restarts = self.config.restart.max_restarts,
                backoff_ms = self.config.restart.backoff.as_millis() as u64,
                error = %failure,
                "Encoder failed, restarting after backoff"
            );
            self.transition(SupervisorState::Restarting { attempt });

            tokio::select! {
                _ = tokio::time::sleep(self.config.restart.backoff) => {}
                _ = &mut stop_rx => {
                    self.transition(SupervisorState::Stopped);
                    return;
                }
            }
            global_metrics().encoder_restarted();
        }
    }

    async fn run_once(&self, attempt: u32, stop_rx: &mut oneshot::Receiver<()>) -> RunOutcome {
        let mut child = match spawn(&self.spec) {
            Ok(child) => child,
            Err(e) => return RunOutcome::Failed(e),
        };

        global_metrics().encoder_spawned();
        tracing::info!(
            session_key = %self.key,
            pid = ?child.id(),
            attempt,
            command = %self.spec.command_line(),
            "Encoder started"
        );
        self.transition(SupervisorState::Running { attempt });

        let stderr = drain_stderr(child.stderr.take(), self.key.to_string());

        tokio::select! {
            status = child.wait() => {
                let tail = stderr.await.unwrap_or_default();
                match status {
                    Ok(status) if status.success() => RunOutcome::Finished,
                    Ok(status) => RunOutcome::Failed(EncoderError::Exited {
                        code: status.code(),
                        stderr: tail.join("\n"),
                    }),
                    Err(e) => RunOutcome::Failed(e.into()),
                }
            }
            _ = stop_rx => {
                terminate(&mut child, self.config.stop_grace, &self.key).await;
                RunOutcome::Stopped
            }
        }
    }

    fn transition(&self, state: SupervisorState) {
        self.state_tx.send_replace(state);
        if let Some(callback) = &self.on_state {
            callback(state);
        }
    }
}

/// Ask the encoder to exit, killing it if it outlives the grace period
async fn terminate(child: &mut Child, grace: Duration, key: &SessionKey) {
    if send_terminate(child, key) {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => {
                tracing::debug!(session_key = %key, "Encoder exited after terminate");
                return;
            }
            Err(_) => {
                tracing::warn!(
                    session_key = %key,
                    grace_ms = grace.as_millis() as u64,
                    "Encoder ignored terminate, killing"
                );
            }
        }
    }

    if let Err(e) = child.kill().await {
        tracing::warn!(session_key = %key, error = %e, "Failed to kill encoder");
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child, key: &SessionKey) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(session_key = %key, pid, error = %e, "Failed to send SIGTERM to encoder");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child, _key: &SessionKey) -> bool {
    false
}

/// Encoder errors
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("Failed to spawn encoder {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Encoder exited with {}: {stderr}", describe_exit(*code))]
    Exited { code: Option<i32>, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "signal".to_string(),
    }
}
