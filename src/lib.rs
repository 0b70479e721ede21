//! testrig is a system-test orchestration engine: it schedules test cases
//! across a bounded worker pool, supervises the external processes each test
//! launches, gates test progression on polling condition waits (port ready,
//! text in a log file, fatal-pattern abort), and streams one immutable
//! verdict per test to registered result writers.
//!
//! The engine is the execution core only. Suite discovery, descriptor file
//! parsing, the command line and concrete report formats are external
//! collaborators built on top of these interfaces.
//!
//! A test is a [`TestCase`] implementation driven by the engine through
//! setup, execute and validate, with unconditional cleanup afterwards:
//! every process started through the [`TestContext`] is tracked, and
//! nothing a test launches outlives it.

pub mod aggregator;
pub mod allocator;
pub mod descriptor;
pub mod environment;
pub mod error;
pub mod monitor;
pub mod perfmon;
pub mod runner;
pub mod scheduler;
pub mod supervisor;
pub mod verdict;

pub use aggregator::{
    CollectedResults, CollectingWriter, LogWriter, OutcomeAggregator, ResultWriter, RunEvent,
};
pub use allocator::{DirLease, PortLease, ResourceAllocator};
pub use descriptor::{
    ExecutionMode, PortRange, RunConfig, RunRequest, TestDescriptor, TestId,
};
pub use environment::Environment;
pub use error::{EngineError, ResourceKind, Result};
pub use monitor::{wait_for_file, wait_for_port, AbortMonitor, TextWait};
pub use perfmon::{
    AggregationHint, MemorySample, PerformanceSample, PerformanceUnit, ProcessMonitor,
};
pub use runner::{TestCase, TestContext, TestRunner};
pub use scheduler::{ScheduledTest, Scheduler};
pub use supervisor::{
    CleanupReport, ExitPolicy, ProcessHandle, ProcessSpec, ProcessState, ProcessSupervisor,
};
pub use verdict::{AssertionOutcome, Outcome, RunSummary, Verdict};
