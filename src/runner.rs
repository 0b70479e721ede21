use chrono::Utc;
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::RunEvent;
use crate::allocator::{DirLease, PortLease, ResourceAllocator};
use crate::descriptor::{RunRequest, TestId};
use crate::error::{EngineError, Result};
use crate::monitor::{self, AbortMonitor, TextWait};
use crate::perfmon::{
    AggregationHint, MemorySample, PerformanceSample, PerformanceUnit, ProcessMonitor,
};
use crate::supervisor::{CleanupReport, ProcessHandle, ProcessSpec, ProcessSupervisor};
use crate::verdict::{AssertionOutcome, Outcome, Verdict};

/// Test-specific logic, implemented outside the engine.
///
/// The engine drives each case through setup, execute and validate, hands it
/// a [`TestContext`] for starting processes and gating on conditions, and
/// turns whatever happens into exactly one [`Verdict`]. Returning an error
/// from any phase stops the test; recording a failed check and returning
/// `Ok` lets it continue and fail at the end.
pub trait TestCase: Send + Sync {
    /// Prepares fixtures before any process starts.
    fn setup<'a>(&'a self, _ctx: &'a mut TestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Starts and drives the processes under test.
    fn execute<'a>(&'a self, ctx: &'a mut TestContext) -> BoxFuture<'a, Result<()>>;

    /// Runs assertion checks once execution is done.
    fn validate<'a>(&'a self, _ctx: &'a mut TestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Everything one running test is allowed to touch: resource leases,
/// process supervision, condition waits and the assertion record.
///
/// Relative file paths given to the wait methods resolve against the test's
/// output directory, where process stdout/stderr artifacts land.
pub struct TestContext {
    request: RunRequest,
    allocator: Arc<ResourceAllocator>,
    supervisor: ProcessSupervisor,
    cancel: CancellationToken,
    events: UnboundedSender<RunEvent>,
    memory_tx: UnboundedSender<MemorySample>,
    memory_forwarder: JoinHandle<()>,
    port_leases: Vec<PortLease>,
    dir_leases: Vec<DirLease>,
    aborts: Vec<AbortMonitor>,
    monitors: Vec<ProcessMonitor>,
    assertions: Vec<AssertionOutcome>,
}

impl TestContext {
    fn new(
        request: RunRequest,
        allocator: Arc<ResourceAllocator>,
        grace_period: Duration,
        global_cancel: &CancellationToken,
        events: UnboundedSender<RunEvent>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&request.output_dir)?;
        let cancel = global_cancel.child_token();
        let supervisor = ProcessSupervisor::new(
            request.test_id().clone(),
            &request.output_dir,
            grace_period,
            &cancel,
        );

        let (memory_tx, mut memory_rx) = unbounded_channel();
        let memory_forwarder = {
            let events = events.clone();
            tokio::spawn(async move {
                while let Some(sample) = memory_rx.recv().await {
                    if events.send(RunEvent::Memory(sample)).is_err() {
                        return;
                    }
                }
            })
        };

        Ok(Self {
            request,
            allocator,
            supervisor,
            cancel,
            events,
            memory_tx,
            memory_forwarder,
            port_leases: Vec::new(),
            dir_leases: Vec::new(),
            aborts: Vec::new(),
            monitors: Vec::new(),
            assertions: Vec::new(),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.request.run_id
    }

    pub fn test_id(&self) -> &TestId {
        self.request.test_id()
    }

    /// Directory this run's artifacts and scratch files live in.
    pub fn output_dir(&self) -> &Path {
        &self.request.output_dir
    }

    /// Token cancelled when this test is aborted, for test logic that runs
    /// its own loops.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Leases a free TCP port for the life of this test.
    pub async fn acquire_port(&mut self) -> Result<u16> {
        let lease = self
            .allocator
            .acquire_port(self.request.run_id, &self.cancel)
            .await?;
        let port = lease.port();
        self.port_leases.push(lease);
        Ok(port)
    }

    /// Creates and leases a scratch directory under the test's output
    /// directory.
    pub fn acquire_dir(&mut self, base_name: &str) -> Result<PathBuf> {
        let lease =
            self.allocator
                .acquire_dir(self.request.run_id, &self.request.output_dir, base_name)?;
        let path = lease.path().to_path_buf();
        self.dir_leases.push(lease);
        Ok(path)
    }

    /// Starts a process under supervision, with the run's environment
    /// overrides layered over the spec's declared environment.
    pub async fn start_process(&mut self, mut spec: ProcessSpec) -> Result<ProcessHandle> {
        spec.environment.extend(&self.request.env_overrides);
        self.supervisor.start(spec).await
    }

    /// Stops a supervised process, gracefully or not.
    pub async fn stop_process(&self, handle: &ProcessHandle, graceful: bool) -> Result<()> {
        self.supervisor.stop(handle, graceful).await
    }

    /// Writes a line to a supervised process's stdin.
    pub async fn write_stdin(&self, handle: &ProcessHandle, data: &str) -> Result<()> {
        self.supervisor.write_stdin(handle, data).await
    }

    /// Blocks until the process exits, recording a timed-out check if it
    /// does not make the deadline.
    pub async fn wait_for_exit(
        &mut self,
        handle: &ProcessHandle,
        limit: Duration,
    ) -> Result<Option<i32>> {
        let description = format!("process {} exited", handle.display_name());
        let result = self.supervisor.wait(handle, limit, &self.cancel).await;
        match self.conclude_wait(&description, result.as_ref().map(|_| ())) {
            Ok(()) => result,
            Err(e) => Err(e),
        }
    }

    /// Waits for a local TCP server to accept connections on `port`.
    pub async fn wait_for_port(&mut self, port: u16, limit: Duration) -> Result<()> {
        self.wait_for_port_on("127.0.0.1", port, limit).await
    }

    pub async fn wait_for_port_on(
        &mut self,
        host: &str,
        port: u16,
        limit: Duration,
    ) -> Result<()> {
        let description = format!("port {host}:{port} ready");
        let result = monitor::wait_for_port(host, port, limit, &self.cancel).await;
        self.conclude_wait(&description, result.as_ref().copied())
            .and(result)
    }

    /// Waits for `pattern` to appear in a file, tolerating a file that does
    /// not exist yet.
    pub async fn wait_for_text(
        &mut self,
        file: impl AsRef<Path>,
        pattern: &str,
        limit: Duration,
    ) -> Result<usize> {
        self.wait_for_text_matches(file, pattern, 1, limit).await
    }

    /// Waits for `pattern` to appear on at least `min_matches` lines.
    pub async fn wait_for_text_matches(
        &mut self,
        file: impl AsRef<Path>,
        pattern: &str,
        min_matches: usize,
        limit: Duration,
    ) -> Result<usize> {
        let path = self.resolve(file.as_ref());
        let description = format!("`{pattern}` present in {}", path.display());
        let mut wait = TextWait::new(path, pattern)?.with_min_matches(min_matches);
        let result = wait.wait(limit, &self.cancel).await;
        match self.conclude_wait(&description, result.as_ref().map(|_| ())) {
            Ok(()) => result,
            Err(e) => Err(e),
        }
    }

    /// Waits for a file to exist on disk.
    pub async fn wait_for_file(&mut self, file: impl AsRef<Path>, limit: Duration) -> Result<()> {
        let path = self.resolve(file.as_ref());
        let description = format!("file {} present", path.display());
        let result = monitor::wait_for_file(&path, limit, &self.cancel).await;
        self.conclude_wait(&description, result.as_ref().copied())
            .and(result)
    }

    /// Fails this test the moment `pattern` appears in the given file,
    /// short-circuiting every wait still in flight. Active until the test
    /// completes.
    pub fn abort_on_pattern(&mut self, file: impl AsRef<Path>, pattern: &str) -> Result<()> {
        let path = self.resolve(file.as_ref());
        let monitor = AbortMonitor::spawn(path, pattern, self.cancel.clone())?;
        self.aborts.push(monitor);
        Ok(())
    }

    /// Records a pass/fail check, returning the condition for chaining.
    pub fn check(&mut self, description: impl Into<String>, condition: bool) -> bool {
        self.check_detail(description, condition, "")
    }

    pub fn check_detail(
        &mut self,
        description: impl Into<String>,
        condition: bool,
        detail: impl Into<String>,
    ) -> bool {
        let description = description.into();
        if condition {
            self.assertions.push(AssertionOutcome::passed(description));
        } else {
            let detail = detail.into();
            warn!(test = %self.test_id(), "check failed: {description}");
            self.assertions
                .push(AssertionOutcome::failed(description, detail));
        }
        condition
    }

    /// Records an assertion outcome produced outside the built-in checks.
    pub fn record(&mut self, outcome: AssertionOutcome) {
        self.assertions.push(outcome);
    }

    /// Sends a performance measurement to the outcome aggregator.
    pub fn report_performance(
        &self,
        metric: impl Into<String>,
        value: f64,
        unit: PerformanceUnit,
        hint: AggregationHint,
    ) {
        let sample = PerformanceSample {
            run_id: self.request.run_id,
            test_id: self.test_id().clone(),
            metric: metric.into(),
            value,
            unit,
            hint,
            recorded_at: Utc::now(),
        };
        let _ = self.events.send(RunEvent::Performance(sample));
    }

    /// Starts periodic memory sampling of a supervised process; samples
    /// stream to the aggregator until the process dies or the test ends.
    pub fn monitor_memory(&mut self, handle: &ProcessHandle, interval: Duration) {
        let monitor = ProcessMonitor::spawn(
            self.request.run_id,
            self.test_id().clone(),
            handle.pid(),
            interval,
            self.memory_tx.clone(),
            &self.cancel,
        );
        self.monitors.push(monitor);
    }

    /// Applies the documented tie-break between an abort pattern and a
    /// concurrently satisfied wait: if the abort has fired, it wins even
    /// when the wait itself came back successful in the same poll cycle.
    fn conclude_wait(
        &mut self,
        description: &str,
        result: std::result::Result<(), &EngineError>,
    ) -> Result<()> {
        if let Some(abort) = self.abort_error() {
            return Err(abort);
        }
        match result {
            Ok(()) => {
                self.assertions
                    .push(AssertionOutcome::passed(description.to_string()));
                Ok(())
            }
            Err(EngineError::Timeout { limit, .. }) => {
                self.assertions
                    .push(AssertionOutcome::timed_out(description.to_string(), *limit));
                Ok(())
            }
            // The caller surfaces the original error; nothing to record for
            // cancellation or engine faults.
            Err(_) => Ok(()),
        }
    }

    pub(crate) fn abort_error(&self) -> Option<EngineError> {
        self.aborts
            .iter()
            .find(|a| a.fired().is_some())
            .map(|a| EngineError::AbortDetected {
                pattern: a.pattern().to_string(),
                file: a.path().to_path_buf(),
            })
    }

    pub(crate) fn abort_message(&self) -> Option<String> {
        self.aborts
            .iter()
            .find_map(|a| a.fired().map(str::to_string))
    }

    pub(crate) async fn collect_exit_checks(&mut self) {
        let mut checks = self.supervisor.drain_exit_checks().await;
        self.assertions.append(&mut checks);
    }

    pub(crate) fn take_assertions(&mut self) -> Vec<AssertionOutcome> {
        std::mem::take(&mut self.assertions)
    }

    /// Tears the test down on every exit path: stops monitors, kills
    /// leftover processes, releases leases.
    pub(crate) async fn cleanup(&mut self) -> CleanupReport {
        self.cancel.cancel();
        self.monitors.clear();
        self.aborts.clear();
        self.memory_forwarder.abort();

        // Judge natural exits before killing what is left.
        self.collect_exit_checks().await;
        let mut report = self.supervisor.cleanup().await;

        for lease in self.port_leases.drain(..) {
            lease.release();
        }
        for lease in self.dir_leases.drain(..) {
            if let Err(e) = lease.release() {
                report.warnings.push(e.to_string());
            }
        }
        report
    }

    fn resolve(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.request.output_dir.join(file)
        }
    }
}

/// Phase of the per-test state machine an error surfaced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Setup,
    Execute,
    Validate,
}

impl Phase {
    fn describe(self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Execute => "execute",
            Phase::Validate => "validate",
        }
    }
}

/// Executes one run request to a verdict: setup, execute, validate, then
/// unconditional cleanup.
pub struct TestRunner {
    allocator: Arc<ResourceAllocator>,
    grace_period: Duration,
    global_cancel: CancellationToken,
    events: UnboundedSender<RunEvent>,
}

impl TestRunner {
    pub fn new(
        allocator: Arc<ResourceAllocator>,
        grace_period: Duration,
        global_cancel: CancellationToken,
        events: UnboundedSender<RunEvent>,
    ) -> Self {
        Self {
            allocator,
            grace_period,
            global_cancel,
            events,
        }
    }

    /// Runs the request to completion and produces its single verdict.
    pub async fn run(&self, request: RunRequest, logic: Arc<dyn TestCase>) -> Verdict {
        let started_at = Utc::now();
        let start = Instant::now();
        let run_id = request.run_id;
        let test_id = request.test_id().clone();
        let deadline = request.descriptor.timeout;
        info!(test = %test_id, %run_id, "test starting");

        let mut ctx = match TestContext::new(
            request,
            Arc::clone(&self.allocator),
            self.grace_period,
            &self.global_cancel,
            self.events.clone(),
        ) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(test = %test_id, "could not prepare test context: {e}");
                return Verdict {
                    run_id,
                    test_id,
                    outcome: Outcome::Errored,
                    assertions: vec![AssertionOutcome::errored(
                        "prepare output directory",
                        e.to_string(),
                    )],
                    cleanup_warnings: Vec::new(),
                    started_at,
                    finished_at: Utc::now(),
                    duration: start.elapsed(),
                };
            }
        };

        let test_cancel = ctx.cancel.clone();
        let mut deadline_hit = false;
        let driven: std::result::Result<(), (Phase, EngineError)> = tokio::select! {
            result = Self::drive(logic.as_ref(), &mut ctx) => result,
            _ = test_cancel.cancelled() => Err((Phase::Execute, EngineError::Cancelled)),
            _ = sleep(deadline) => {
                deadline_hit = true;
                Err((Phase::Execute, EngineError::Timeout {
                    operation: format!("test {test_id}"),
                    limit: deadline,
                }))
            }
        };
        if deadline_hit {
            // The per-test deadline rides the same cancellation path as a
            // global abort, scoped to this one test.
            test_cancel.cancel();
        }

        // An abort pattern that fired between the last wait and completion
        // still fails the test.
        let driven = match driven {
            Ok(()) => match ctx.abort_error() {
                Some(abort) => Err((Phase::Validate, abort)),
                None => Ok(()),
            },
            err => err,
        };

        let (mut base, error_note) = self.classify(&ctx, deadline_hit, deadline, driven);

        let report = ctx.cleanup().await;
        let mut cleanup_warnings = report.warnings.clone();
        if !report.stopped.is_empty() {
            debug!(test = %test_id, stopped = ?report.stopped, "cleanup stopped leftover processes");
        }
        if report.has_leak() {
            // A confirmed leak is the one cleanup problem that overturns
            // the verdict.
            cleanup_warnings.push(format!("leaked processes: {}", report.leaked.join(", ")));
            base = base.worst(Outcome::Errored);
        }

        let mut assertions = ctx.take_assertions();
        if let Some(note) = error_note {
            assertions.push(note);
        }
        let outcome = Verdict::combine(base, &assertions);

        let verdict = Verdict {
            run_id,
            test_id,
            outcome,
            assertions,
            cleanup_warnings,
            started_at,
            finished_at: Utc::now(),
            duration: start.elapsed(),
        };
        info!("{verdict}");
        verdict
    }

    async fn drive(
        logic: &dyn TestCase,
        ctx: &mut TestContext,
    ) -> std::result::Result<(), (Phase, EngineError)> {
        logic.setup(ctx).await.map_err(|e| (Phase::Setup, e))?;
        logic.execute(ctx).await.map_err(|e| (Phase::Execute, e))?;
        // Exit-code checks captured by the supervisor feed validation.
        ctx.collect_exit_checks().await;
        logic.validate(ctx).await.map_err(|e| (Phase::Validate, e))?;
        Ok(())
    }

    /// Maps the driven result onto a base outcome and an optional assertion
    /// note describing what stopped the test.
    fn classify(
        &self,
        ctx: &TestContext,
        deadline_hit: bool,
        deadline: Duration,
        driven: std::result::Result<(), (Phase, EngineError)>,
    ) -> (Outcome, Option<AssertionOutcome>) {
        let (phase, error) = match driven {
            Ok(()) => return (Outcome::Passed, None),
            Err(pair) => pair,
        };

        // An abort pattern outranks the generic cancellation it triggers.
        let error = match error {
            EngineError::Cancelled => ctx.abort_error().unwrap_or(EngineError::Cancelled),
            other => other,
        };
        let error_text = error.to_string();

        match error {
            EngineError::Cancelled => {
                let reason = if self.global_cancel.is_cancelled() {
                    "global abort requested"
                } else {
                    "test cancelled"
                };
                (
                    Outcome::Skipped,
                    Some(AssertionOutcome {
                        description: "test execution".to_string(),
                        outcome: Outcome::Skipped,
                        detail: Some(reason.to_string()),
                    }),
                )
            }
            EngineError::Timeout { .. } if deadline_hit => (
                Outcome::TimedOut,
                Some(AssertionOutcome::timed_out(
                    "test completed within its deadline",
                    deadline,
                )),
            ),
            EngineError::Timeout { .. } => {
                // A wait already recorded its own timed-out check; make
                // sure the verdict reflects it even if it did not.
                (Outcome::TimedOut, None)
            }
            EngineError::AbortDetected { .. } => (
                Outcome::Failed,
                Some(AssertionOutcome::failed(
                    "no fatal error pattern in monitored output",
                    ctx.abort_message().unwrap_or(error_text),
                )),
            ),
            EngineError::AssertionFailure(message) if phase != Phase::Setup => (
                Outcome::Failed,
                Some(AssertionOutcome::failed("assertion", message)),
            ),
            _ => (
                Outcome::Errored,
                Some(AssertionOutcome::errored(
                    format!("{} phase", phase.describe()),
                    error_text,
                )),
            ),
        }
    }
}
