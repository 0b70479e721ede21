//! Core testing harness wiring a full engine instance against a temporary
//! output directory.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

use testrig::{
    CollectedResults, CollectingWriter, OutcomeAggregator, PortRange, RunConfig, RunSummary,
    ScheduledTest, Scheduler,
};
#[cfg(unix)]
use testrig::{Environment, ProcessSpec};

/// Port slice reserved for integration scenarios, clear of the ranges the
/// unit tests probe.
const INTEGRATION_PORTS: PortRange = PortRange {
    low: 25000,
    high: 26999,
};

/// One fully wired engine: scheduler, allocator, aggregator and a
/// collecting writer, all running against a temporary output root.
pub struct EngineTestHarness {
    pub scheduler: Scheduler,
    pub aggregator: OutcomeAggregator,
    pub results: CollectedResults,
    temp_dir: TempDir,
}

impl EngineTestHarness {
    pub fn new(workers: usize) -> Result<Self> {
        Self::with_config(workers, |_| {})
    }

    pub fn with_config(workers: usize, tweak: impl FnOnce(&mut RunConfig)) -> Result<Self> {
        init_tracing();
        let temp_dir = TempDir::new().context("failed to create temporary output root")?;

        let mut config = RunConfig::default();
        config.workers = workers;
        config.output_root = temp_dir.path().join("output");
        config.port_range = INTEGRATION_PORTS;
        config.grace_period = Duration::from_millis(500);
        tweak(&mut config);

        let scheduler = Scheduler::new(config);
        let (writer, results) = CollectingWriter::new();
        let mut aggregator = OutcomeAggregator::new();
        aggregator.register(writer);

        Ok(Self {
            scheduler,
            aggregator,
            results,
            temp_dir,
        })
    }

    /// Runs a batch through the engine and returns the aggregate summary.
    pub async fn run(&mut self, tests: Vec<ScheduledTest>) -> RunSummary {
        self.scheduler.run(tests, &mut self.aggregator).await
    }

    /// Root of this harness's temporary directory tree.
    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }
}

/// A process spec running a short shell script, with the host environment
/// so the shell can find its tools.
#[cfg(unix)]
pub fn sh_spec(script: &str) -> ProcessSpec {
    ProcessSpec::new("/bin/sh")
        .arg("-c")
        .arg(script)
        .environment(Environment::inherited())
}

/// Whether a pid still refers to a live process, per the host's process
/// table.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // A null signal probes for existence without touching the process.
    nix_kill_probe(pid)
}

#[cfg(unix)]
fn nix_kill_probe(pid: u32) -> bool {
    use std::process::Command;
    // `kill -0` through the shell keeps this test crate free of direct
    // libc bindings.
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
