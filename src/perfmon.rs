//! Performance and memory sample records, and the background sampler that
//! watches a supervised process's memory usage.
//!
//! The engine only collects samples and forwards them to writer
//! collaborators; statistical analysis of the series happens outside.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::descriptor::TestId;

/// Unit a performance value is expressed in, with the polarity that says
/// which direction is an improvement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerformanceUnit {
    pub name: String,
    pub bigger_is_better: bool,
}

impl PerformanceUnit {
    pub fn of(name: impl Into<String>, bigger_is_better: bool) -> Self {
        Self {
            name: name.into(),
            bigger_is_better,
        }
    }

    /// Elapsed-time unit; smaller is better.
    pub fn seconds() -> Self {
        Self::of("s", false)
    }

    /// Rate unit; bigger is better.
    pub fn per_second() -> Self {
        Self::of("/s", true)
    }
}

impl fmt::Display for PerformanceUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// How a writer should fold repeated samples of the same metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationHint {
    Mean,
    Max,
    Throughput,
}

/// A single performance measurement reported by test logic.
#[derive(Debug, Clone)]
pub struct PerformanceSample {
    pub run_id: Uuid,
    pub test_id: TestId,
    pub metric: String,
    pub value: f64,
    pub unit: PerformanceUnit,
    pub hint: AggregationHint,
    pub recorded_at: DateTime<Utc>,
}

/// One point in a supervised process's memory-usage series.
#[derive(Debug, Clone)]
pub struct MemorySample {
    pub run_id: Uuid,
    pub test_id: TestId,
    pub pid: u32,
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Background sampler polling one process's memory usage at a fixed
/// interval for the life of the test.
///
/// The sampler stops on its own when the process disappears or the test is
/// cancelled; where the platform offers no cheap usage source it degrades
/// to producing no samples rather than failing the test.
pub struct ProcessMonitor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ProcessMonitor {
    pub fn spawn(
        run_id: Uuid,
        test_id: TestId,
        pid: u32,
        interval: Duration,
        sender: UnboundedSender<MemorySample>,
        test_cancel: &CancellationToken,
    ) -> Self {
        let cancel = test_cancel.child_token();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {}
                    }
                    match read_memory_usage(pid).await {
                        Some((resident_bytes, virtual_bytes)) => {
                            let sample = MemorySample {
                                run_id,
                                test_id: test_id.clone(),
                                pid,
                                resident_bytes,
                                virtual_bytes,
                                recorded_at: Utc::now(),
                            };
                            if sender.send(sample).is_err() {
                                return;
                            }
                        }
                        None => {
                            debug!(pid, "memory sampling stopped, process gone or unsupported");
                            return;
                        }
                    }
                }
            })
        };
        Self { cancel, task }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Resident and virtual size of a process in bytes.
#[cfg(target_os = "linux")]
async fn read_memory_usage(pid: u32) -> Option<(u64, u64)> {
    let status = tokio::fs::read_to_string(format!("/proc/{pid}/status"))
        .await
        .ok()?;
    let mut resident = None;
    let mut virtual_size = None;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            resident = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("VmSize:") {
            virtual_size = parse_kb(rest);
        }
    }
    Some((resident?, virtual_size?))
}

#[cfg(not(target_os = "linux"))]
async fn read_memory_usage(_pid: u32) -> Option<(u64, u64)> {
    None
}

#[cfg(target_os = "linux")]
fn parse_kb(field: &str) -> Option<u64> {
    field
        .trim()
        .strip_suffix("kB")?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|kb| kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_polarity() {
        assert!(!PerformanceUnit::seconds().bigger_is_better);
        assert!(PerformanceUnit::per_second().bigger_is_better);
        assert_eq!(PerformanceUnit::of("MB", false).to_string(), "MB");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_kb_field() {
        assert_eq!(parse_kb("	  1024 kB"), Some(1024 * 1024));
        assert_eq!(parse_kb(" 0 kB"), Some(0));
        assert_eq!(parse_kb("garbage"), None);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_sample_own_process() {
        let (resident, virtual_size) = read_memory_usage(std::process::id())
            .await
            .expect("own process is sampleable");
        assert!(resident > 0);
        assert!(virtual_size >= resident);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_monitor_emits_samples_until_stopped() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let monitor = ProcessMonitor::spawn(
            Uuid::new_v4(),
            TestId::new("perfmon_test"),
            std::process::id(),
            Duration::from_millis(20),
            tx,
            &cancel,
        );

        let sample = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("sampler produces a first sample quickly")
            .expect("channel open");
        assert!(sample.resident_bytes > 0);
        assert_eq!(sample.pid, std::process::id());

        monitor.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Drain whatever arrived before the stop; the channel then stays
        // quiet.
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }
}
