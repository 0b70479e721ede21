use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::descriptor::TestId;
use crate::environment::Environment;
use crate::error::{EngineError, Result};
use crate::verdict::AssertionOutcome;

/// How long to wait for the OS to reap a force-killed process before
/// declaring it leaked.
const KILL_CONFIRM_MARGIN: Duration = Duration::from_secs(2);

/// Declarative policy for judging a process's exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPolicy {
    /// The process must exit with exactly this code.
    Exact(i32),
    /// Any exit code is acceptable, but the exit is still recorded as a
    /// passing check.
    Any,
    /// The exit code is not evaluated at all.
    Ignore,
}

impl ExitPolicy {
    /// Produces the assertion outcome for a naturally exited process, or
    /// `None` when the policy says not to look.
    pub fn evaluate(self, display_name: &str, exit_code: Option<i32>) -> Option<AssertionOutcome> {
        let description = format!("exit status of {display_name}");
        match self {
            ExitPolicy::Ignore => None,
            ExitPolicy::Any => Some(AssertionOutcome::passed(description)),
            ExitPolicy::Exact(expected) => match exit_code {
                Some(code) if code == expected => Some(AssertionOutcome::passed(description)),
                Some(code) => Some(AssertionOutcome::failed(
                    description,
                    format!("expected exit code {expected}, got {code}"),
                )),
                None => Some(AssertionOutcome::failed(
                    description,
                    format!("expected exit code {expected}, process was terminated by a signal"),
                )),
            },
        }
    }
}

/// Declaration of one external process a test needs.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub command: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub environment: Environment,
    pub exit_policy: ExitPolicy,
    pub timeout: Duration,
    pub display_name: Option<String>,
    pub pipe_stdin: bool,
}

impl ProcessSpec {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            environment: Environment::new(),
            exit_policy: ExitPolicy::Ignore,
            timeout: Duration::from_secs(600),
            display_name: None,
            pipe_stdin: false,
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

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.set(key, value);
        self
    }

    /// Requires the process to exit with exactly `code`.
    pub fn expect_exit(mut self, code: i32) -> Self {
        self.exit_policy = ExitPolicy::Exact(code);
        self
    }

    /// Accepts any exit code but records the exit as a check.
    pub fn expect_any_exit(mut self) -> Self {
        self.exit_policy = ExitPolicy::Any;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Names the process in logs and artifact files; defaults to the
    /// executable's file stem.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Keeps stdin open so the test can write to the process.
    pub fn pipe_stdin(mut self) -> Self {
        self.pipe_stdin = true;
        self
    }

    fn resolve_display_name(&self) -> String {
        let raw = self.display_name.clone().unwrap_or_else(|| {
            self.command
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "process".to_string())
        });
        raw.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }
}

/// Lifecycle state of a supervised process. Transitions are monotonic:
/// Starting → Running → one terminal state, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    Exited,
    Killed,
    TimedOut,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Exited | ProcessState::Killed | ProcessState::TimedOut
        )
    }

    fn rank(self) -> u8 {
        match self {
            ProcessState::Starting => 0,
            ProcessState::Running => 1,
            ProcessState::Exited | ProcessState::Killed | ProcessState::TimedOut => 2,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited => write!(f, "exited"),
            ProcessState::Killed => write!(f, "killed"),
            ProcessState::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Runtime state of one launched process, owned by its supervisor.
struct SupervisedProcess {
    display_name: String,
    state: ProcessState,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    exit_code: Option<i32>,
    exit_policy: ExitPolicy,
    timeout: Duration,
    /// Pending assertion outcome from exit evaluation, drained at validate.
    exit_check: Option<AssertionOutcome>,
    /// Set by the timeout watchdog before it starts killing, so whichever
    /// path captures the exit records the terminal state as TimedOut.
    timed_out: Arc<AtomicBool>,
}

impl SupervisedProcess {
    fn advance(&mut self, next: ProcessState) {
        // Terminal states are sticky and transitions never go backwards.
        if !self.state.is_terminal() && next.rank() >= self.state.rank() {
            self.state = next;
        }
    }

    fn record_exit(&mut self, status: std::process::ExitStatus, requested: ProcessState) {
        self.exit_code = status.code();
        self.child = None;
        self.stdin = None;

        let terminal = if self.timed_out.load(Ordering::SeqCst) {
            ProcessState::TimedOut
        } else {
            requested
        };
        self.advance(terminal);

        self.exit_check = match self.state {
            ProcessState::Exited => self.exit_policy.evaluate(&self.display_name, self.exit_code),
            ProcessState::TimedOut => Some(AssertionOutcome::timed_out(
                format!("process {} completed within its timeout", self.display_name),
                self.timeout,
            )),
            // A deliberate kill is not an exit-status failure.
            _ => None,
        };
    }
}

/// Shared reference to a supervised process. Handles stay within the test
/// that started the process; they are never shared across tests.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: u32,
    display_name: String,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
    started_at: Instant,
    timed_out: Arc<AtomicBool>,
    inner: Arc<Mutex<SupervisedProcess>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// File the process's standard output is captured to.
    pub fn stdout_path(&self) -> &Path {
        &self.stdout_path
    }

    /// File the process's standard error is captured to.
    pub fn stderr_path(&self) -> &Path {
        &self.stderr_path
    }

    pub fn runtime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub async fn state(&self) -> ProcessState {
        self.inner.lock().await.state
    }

    pub async fn is_running(&self) -> bool {
        !self.inner.lock().await.state.is_terminal()
    }

    /// Exit code, once the exit has been captured. `None` while running or
    /// when the process was terminated by a signal.
    pub async fn exit_code(&self) -> Option<i32> {
        self.inner.lock().await.exit_code
    }

    /// Lock-free-ish liveness check for the timeout watchdog. A held lock
    /// means a wait is in flight, which itself means the process has not
    /// been seen exiting yet.
    fn probably_running(&self) -> bool {
        match self.inner.try_lock() {
            Ok(process) => !process.state.is_terminal(),
            Err(_) => true,
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("display_name", &self.display_name)
            .finish()
    }
}

/// What cleanup found and did about the processes of one test.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Processes that had to be stopped during cleanup.
    pub stopped: Vec<String>,
    /// Processes still alive after forced termination: a true leak.
    pub leaked: Vec<String>,
    /// Non-fatal problems hit while stopping processes.
    pub warnings: Vec<String>,
}

impl CleanupReport {
    pub fn has_leak(&self) -> bool {
        !self.leaked.is_empty()
    }
}

/// Owns the lifecycle of every external process one test launches.
///
/// Each started process is registered here so cleanup can iterate the
/// registry and force-kill anything still alive, whatever path the test
/// took to completion. Killing a supervised process kills its entire
/// descendant tree: processes are placed in their own process group on
/// Unix, and the Windows path walks the tree via `taskkill /T`.
pub struct ProcessSupervisor {
    test_id: TestId,
    artifact_dir: PathBuf,
    grace_period: Duration,
    instance_counts: HashMap<String, u32>,
    registry: Vec<ProcessHandle>,
    watchdogs: Vec<JoinHandle<()>>,
    watchdog_cancel: CancellationToken,
}

impl ProcessSupervisor {
    pub fn new(
        test_id: TestId,
        artifact_dir: impl Into<PathBuf>,
        grace_period: Duration,
        test_cancel: &CancellationToken,
    ) -> Self {
        Self {
            test_id,
            artifact_dir: artifact_dir.into(),
            grace_period,
            instance_counts: HashMap::new(),
            registry: Vec::new(),
            watchdogs: Vec::new(),
            watchdog_cancel: test_cancel.child_token(),
        }
    }

    /// Launches a process per its spec, capturing stdout/stderr to artifact
    /// files named from the test id, and registers it for cleanup.
    ///
    /// # Arguments
    /// * `spec` - Declaration of the executable, arguments, environment,
    ///   working directory, exit policy and timeout
    ///
    /// # Returns
    /// * `Result<ProcessHandle>` - Handle to the running process, or
    ///   `LaunchFailure` if the OS refused to start it
    pub async fn start(&mut self, spec: ProcessSpec) -> Result<ProcessHandle> {
        let display_name = spec.resolve_display_name();
        let instance = {
            let n = self.instance_counts.entry(display_name.clone()).or_insert(0);
            *n += 1;
            *n
        };

        let stdout_path = self.artifact_path(&display_name, instance, "out");
        let stderr_path = self.artifact_path(&display_name, instance, "err");
        let stdout_file = std::fs::File::create(&stdout_path)?;
        let stderr_file = std::fs::File::create(&stderr_path)?;

        let command_text = spec.command.display().to_string();
        info!(
            test = %self.test_id,
            command = %command_text,
            args = ?spec.args,
            "starting process {display_name}"
        );

        let mut command = Command::new(&spec.command);
        command.args(&spec.args);
        command.env_clear();
        for (key, value) in spec.environment.iter() {
            command.env(key, value);
        }
        command.current_dir(
            spec.working_dir
                .clone()
                .unwrap_or_else(|| self.artifact_dir.clone()),
        );
        command.stdout(Stdio::from(stdout_file));
        command.stderr(Stdio::from(stderr_file));
        command.stdin(if spec.pipe_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        // The child leads its own process group so terminating it takes its
        // descendants with it.
        #[cfg(unix)]
        command.process_group(0);
        command.kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| EngineError::LaunchFailure {
            command: command_text.clone(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| EngineError::LaunchFailure {
            command: command_text,
            source: io::Error::new(io::ErrorKind::Other, "process exited before a pid was seen"),
        })?;
        let stdin = child.stdin.take();

        let timed_out = Arc::new(AtomicBool::new(false));
        let mut process = SupervisedProcess {
            display_name: display_name.clone(),
            state: ProcessState::Starting,
            child: Some(child),
            stdin,
            exit_code: None,
            exit_policy: spec.exit_policy,
            timeout: spec.timeout,
            exit_check: None,
            timed_out: Arc::clone(&timed_out),
        };
        process.advance(ProcessState::Running);

        let handle = ProcessHandle {
            pid,
            display_name: display_name.clone(),
            stdout_path,
            stderr_path,
            started_at: Instant::now(),
            timed_out,
            inner: Arc::new(Mutex::new(process)),
        };
        self.registry.push(handle.clone());
        self.spawn_watchdog(&handle, spec.timeout);

        debug!(test = %self.test_id, pid, "process {display_name} running");
        Ok(handle)
    }

    /// Enforces the per-process timeout without holding the state lock, so
    /// it can fire even while a wait on the same process is in flight.
    fn spawn_watchdog(&mut self, handle: &ProcessHandle, limit: Duration) {
        let handle = handle.clone();
        let cancel = self.watchdog_cancel.clone();
        let grace = self.grace_period;

        self.watchdogs.push(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(limit) => {
                    if handle.probably_running() {
                        warn!(
                            pid = handle.pid,
                            "process {} exceeded its {limit:?} timeout, terminating",
                            handle.display_name
                        );
                        handle.timed_out.store(true, Ordering::SeqCst);
                        let _ = terminate_tree(handle.pid, false);
                        sleep(grace).await;
                        if handle.probably_running() {
                            let _ = terminate_tree(handle.pid, true);
                        }
                    }
                }
            }
        }));
    }

    /// Blocks until the process exits or the limit elapses, returning the
    /// captured exit code. Exit-code evaluation per the spec's policy is
    /// recorded here, not left to the caller.
    pub async fn wait(
        &self,
        handle: &ProcessHandle,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<i32>> {
        let mut process = handle.inner.lock().await;
        if process.state.is_terminal() {
            return Ok(process.exit_code);
        }
        let display_name = process.display_name.clone();
        let mut child = match process.child.take() {
            Some(child) => child,
            None => return Ok(process.exit_code),
        };

        tokio::select! {
            result = child.wait() => {
                match result {
                    Ok(status) => {
                        info!(pid = handle.pid, ?status, "process {display_name} exited");
                        process.record_exit(status, ProcessState::Exited);
                        Ok(process.exit_code)
                    }
                    Err(e) => {
                        process.child = Some(child);
                        Err(e.into())
                    }
                }
            }
            _ = sleep(limit) => {
                process.child = Some(child);
                Err(EngineError::Timeout {
                    operation: format!("wait for process {display_name}"),
                    limit,
                })
            }
            _ = cancel.cancelled() => {
                process.child = Some(child);
                Err(EngineError::Cancelled)
            }
        }
    }

    /// Requests termination of the process and its descendant tree.
    ///
    /// Graceful sends the platform's polite termination first and escalates
    /// to a forced kill after the grace period; ungraceful goes straight to
    /// the forced kill.
    ///
    /// # Arguments
    /// * `handle` - The process to terminate
    /// * `graceful` - Whether to attempt polite termination first
    ///
    /// # Returns
    /// * `Result<()>` - `CleanupFailure` if the process is confirmed still
    ///   alive after the forced kill
    pub async fn stop(&self, handle: &ProcessHandle, graceful: bool) -> Result<()> {
        if !handle.is_running().await {
            return Ok(());
        }
        info!(pid = handle.pid, graceful, "stopping process {}", handle.display_name());

        let dead = terminate_and_reap(handle, graceful, self.grace_period).await;
        if dead {
            Ok(())
        } else {
            Err(EngineError::CleanupFailure(format!(
                "process {} (pid {}) survived forced termination",
                handle.display_name(),
                handle.pid
            )))
        }
    }

    /// Writes a line to the process's stdin. The spec must have piped stdin
    /// and the process must still be running.
    pub async fn write_stdin(&self, handle: &ProcessHandle, data: &str) -> Result<()> {
        let mut process = handle.inner.lock().await;
        if process.state.is_terminal() {
            return Err(EngineError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("process {} has already exited", handle.display_name()),
            )));
        }
        let stdin = process.stdin.as_mut().ok_or_else(|| {
            EngineError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("stdin of {} is not piped", handle.display_name()),
            ))
        })?;
        stdin.write_all(data.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Every process started for this test, in start order.
    pub fn processes(&self) -> &[ProcessHandle] {
        &self.registry
    }

    /// Collects pending exit-policy assertion outcomes, capturing exits of
    /// processes that finished on their own without an explicit wait.
    pub async fn drain_exit_checks(&self) -> Vec<AssertionOutcome> {
        let mut checks = Vec::new();
        for handle in &self.registry {
            let mut process = handle.inner.lock().await;
            reap_if_exited(&mut process);
            if let Some(check) = process.exit_check.take() {
                checks.push(check);
            }
        }
        checks
    }

    /// Stops everything still alive. Called unconditionally at the end of a
    /// test, on every exit path.
    pub async fn cleanup(&mut self) -> CleanupReport {
        self.watchdog_cancel.cancel();
        for watchdog in self.watchdogs.drain(..) {
            watchdog.abort();
        }

        let mut report = CleanupReport::default();
        for handle in &self.registry {
            reap_if_exited(&mut *handle.inner.lock().await);
            if !handle.is_running().await {
                continue;
            }

            info!(
                test = %self.test_id,
                pid = handle.pid,
                "cleanup stopping leftover process {}",
                handle.display_name()
            );
            if terminate_and_reap(handle, true, self.grace_period).await {
                report.stopped.push(handle.display_name().to_string());
            } else {
                warn!(
                    pid = handle.pid,
                    "process {} leaked past forced termination",
                    handle.display_name()
                );
                report.leaked.push(handle.display_name().to_string());
            }
        }
        report
    }

    fn artifact_path(&self, display_name: &str, instance: u32, ext: &str) -> PathBuf {
        self.artifact_dir
            .join(format!("{}.{display_name}.{instance}.{ext}", self.test_id))
    }
}

/// Captures the exit of a process that finished on its own, if it has.
fn reap_if_exited(process: &mut SupervisedProcess) {
    if let Some(mut child) = process.child.take() {
        match child.try_wait() {
            Ok(Some(status)) => process.record_exit(status, ProcessState::Exited),
            _ => process.child = Some(child),
        }
    }
}

/// Terminates a process, graceful first when asked, and reaps it. Returns
/// whether the process is confirmed gone.
async fn terminate_and_reap(handle: &ProcessHandle, graceful: bool, grace: Duration) -> bool {
    let mut process = handle.inner.lock().await;
    if process.state.is_terminal() {
        return true;
    }
    let mut child = match process.child.take() {
        Some(child) => child,
        None => {
            process.advance(ProcessState::Killed);
            return true;
        }
    };

    if graceful {
        if let Err(e) = terminate_tree(handle.pid, false) {
            debug!(pid = handle.pid, "polite termination failed: {e}");
        }
        if let Ok(Ok(status)) = timeout(grace, child.wait()).await {
            process.record_exit(status, ProcessState::Killed);
            return true;
        }
    }

    if let Err(e) = terminate_tree(handle.pid, true) {
        warn!(pid = handle.pid, "forced termination failed: {e}");
    }
    // Backstop in case the group/tree kill missed the direct child.
    let _ = child.start_kill();
    match timeout(KILL_CONFIRM_MARGIN, child.wait()).await {
        Ok(Ok(status)) => {
            process.record_exit(status, ProcessState::Killed);
            true
        }
        _ => {
            process.child = Some(child);
            false
        }
    }
}

/// Sends a termination request to the process and its whole descendant
/// tree, presenting one behavior across platforms.
#[cfg(unix)]
fn terminate_tree(pid: u32, force: bool) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::{getpgid, Pid};

    let pid = Pid::from_raw(pid as i32);
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    let pgid = match getpgid(Some(pid)) {
        Ok(pgid) => pgid,
        // Already gone.
        Err(nix::Error::ESRCH) => return Ok(()),
        Err(e) => {
            return Err(EngineError::CleanupFailure(format!(
                "could not resolve process group of pid {pid}: {e}"
            )))
        }
    };
    match kill(Pid::from_raw(-pgid.as_raw()), signal) {
        Ok(()) | Err(nix::Error::ESRCH) => Ok(()),
        Err(e) => Err(EngineError::CleanupFailure(format!(
            "could not signal process group {pgid}: {e}"
        ))),
    }
}

#[cfg(windows)]
fn terminate_tree(pid: u32, force: bool) -> Result<()> {
    let mut command = std::process::Command::new("taskkill");
    command.args(["/T", "/PID", &pid.to_string()]);
    if force {
        command.arg("/F");
    }
    // taskkill reports an error for an already-gone pid; that is fine here.
    let _ = command.output()?;
    Ok(())
}
