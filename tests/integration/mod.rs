//! Integration testing support for the testrig engine.
//!
//! Scenarios drive the full engine (scheduler, runner, supervisor,
//! allocator) against real external processes and assert on the verdicts
//! that come out the other end.

pub mod infrastructure;
pub mod scenarios;

pub use infrastructure::EngineTestHarness;
