//! End-to-end scenarios exercising the engine against real processes.
//!
//! These lean on a POSIX shell for the processes under test, so they are
//! compiled on Unix hosts only; the engine's platform-neutral behavior is
//! covered by the in-crate unit tests.

#[cfg(unix)]
pub mod abort_pattern_tests;
#[cfg(unix)]
pub mod cancellation_tests;
#[cfg(unix)]
pub mod exclusive_tests;
#[cfg(unix)]
pub mod port_ready_tests;
#[cfg(unix)]
pub mod reporting_tests;
