use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::perfmon::{MemorySample, PerformanceSample};
use crate::verdict::Verdict;

/// Everything the engine streams out of a run, in arrival order.
#[derive(Debug)]
pub enum RunEvent {
    Verdict(Verdict),
    Performance(PerformanceSample),
    Memory(MemorySample),
}

/// Narrow interface writer collaborators implement to receive results.
///
/// Concrete report formats (XML, CSV, CI annotations) live outside the
/// engine; the engine depends only on this trait. Sample hooks default to
/// no-ops since most writers only care about verdicts.
pub trait ResultWriter: Send {
    fn verdict(&mut self, verdict: &Verdict);

    fn performance_sample(&mut self, _sample: &PerformanceSample) {}

    fn memory_sample(&mut self, _sample: &MemorySample) {}
}

/// Collects verdicts and samples as they are produced, unordered across
/// workers, and republishes each to every registered writer in arrival
/// order, exactly once.
#[derive(Default)]
pub struct OutcomeAggregator {
    writers: Vec<Box<dyn ResultWriter>>,
    forwarded: HashSet<Uuid>,
}

impl OutcomeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, writer: impl ResultWriter + 'static) {
        self.writers.push(Box::new(writer));
    }

    pub fn publish(&mut self, event: RunEvent) {
        match event {
            RunEvent::Verdict(verdict) => {
                self.publish_verdict(&verdict);
            }
            RunEvent::Performance(sample) => self.publish_performance(&sample),
            RunEvent::Memory(sample) => self.publish_memory(&sample),
        }
    }

    /// Forwards a verdict to every writer. Returns false (and forwards
    /// nothing) if a verdict for the same run was already published.
    pub fn publish_verdict(&mut self, verdict: &Verdict) -> bool {
        if !self.forwarded.insert(verdict.run_id) {
            warn!(
                run_id = %verdict.run_id,
                test = %verdict.test_id,
                "duplicate verdict suppressed"
            );
            return false;
        }
        for writer in &mut self.writers {
            writer.verdict(verdict);
        }
        true
    }

    pub fn publish_performance(&mut self, sample: &PerformanceSample) {
        for writer in &mut self.writers {
            writer.performance_sample(sample);
        }
    }

    pub fn publish_memory(&mut self, sample: &MemorySample) {
        for writer in &mut self.writers {
            writer.memory_sample(sample);
        }
    }

    /// Number of verdicts forwarded so far.
    pub fn verdict_count(&self) -> usize {
        self.forwarded.len()
    }
}

/// Writer that narrates results to the tracing log.
#[derive(Debug, Default)]
pub struct LogWriter;

impl ResultWriter for LogWriter {
    fn verdict(&mut self, verdict: &Verdict) {
        info!("{verdict}");
        for assertion in &verdict.assertions {
            debug!(test = %verdict.test_id, "  {assertion}");
        }
        for warning in &verdict.cleanup_warnings {
            warn!(test = %verdict.test_id, "cleanup: {warning}");
        }
    }

    fn performance_sample(&mut self, sample: &PerformanceSample) {
        info!(
            test = %sample.test_id,
            metric = %sample.metric,
            value = sample.value,
            unit = %sample.unit,
            "performance sample"
        );
    }
}

/// Writer that stores everything it receives, for embedding the engine and
/// inspecting results programmatically.
#[derive(Default)]
pub struct CollectingWriter {
    collected: Arc<Mutex<Collected>>,
}

#[derive(Default)]
struct Collected {
    verdicts: Vec<Verdict>,
    performance: Vec<PerformanceSample>,
    memory: Vec<MemorySample>,
}

/// Read side of a [`CollectingWriter`], usable after the aggregator has
/// taken ownership of the writer itself.
#[derive(Clone)]
pub struct CollectedResults {
    collected: Arc<Mutex<Collected>>,
}

impl CollectingWriter {
    pub fn new() -> (Self, CollectedResults) {
        let collected = Arc::new(Mutex::new(Collected::default()));
        (
            Self {
                collected: Arc::clone(&collected),
            },
            CollectedResults { collected },
        )
    }
}

impl ResultWriter for CollectingWriter {
    fn verdict(&mut self, verdict: &Verdict) {
        self.lock().verdicts.push(verdict.clone());
    }

    fn performance_sample(&mut self, sample: &PerformanceSample) {
        self.lock().performance.push(sample.clone());
    }

    fn memory_sample(&mut self, sample: &MemorySample) {
        self.lock().memory.push(sample.clone());
    }
}

impl CollectingWriter {
    fn lock(&self) -> std::sync::MutexGuard<'_, Collected> {
        match self.collected.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl CollectedResults {
    pub fn verdicts(&self) -> Vec<Verdict> {
        self.lock().verdicts.clone()
    }

    pub fn performance_samples(&self) -> Vec<PerformanceSample> {
        self.lock().performance.clone()
    }

    pub fn memory_samples(&self) -> Vec<MemorySample> {
        self.lock().memory.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Collected> {
        match self.collected.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::TestId;

    #[test]
    fn test_verdicts_forwarded_exactly_once() {
        let (writer, results) = CollectingWriter::new();
        let mut aggregator = OutcomeAggregator::new();
        aggregator.register(writer);

        let verdict = Verdict::skipped(Uuid::new_v4(), TestId::new("t1"), "filtered");
        assert!(aggregator.publish_verdict(&verdict));
        assert!(!aggregator.publish_verdict(&verdict));

        assert_eq!(results.verdicts().len(), 1);
        assert_eq!(aggregator.verdict_count(), 1);
    }

    #[test]
    fn test_arrival_order_preserved() {
        let (writer, results) = CollectingWriter::new();
        let mut aggregator = OutcomeAggregator::new();
        aggregator.register(writer);

        for name in ["first", "second", "third"] {
            aggregator.publish(RunEvent::Verdict(Verdict::skipped(
                Uuid::new_v4(),
                TestId::new(name),
                "n/a",
            )));
        }

        let ids: Vec<String> = results
            .verdicts()
            .iter()
            .map(|v| v.test_id.to_string())
            .collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_all_registered_writers_receive_each_verdict() {
        let (writer_a, results_a) = CollectingWriter::new();
        let (writer_b, results_b) = CollectingWriter::new();
        let mut aggregator = OutcomeAggregator::new();
        aggregator.register(writer_a);
        aggregator.register(writer_b);

        aggregator.publish_verdict(&Verdict::skipped(
            Uuid::new_v4(),
            TestId::new("shared"),
            "n/a",
        ));

        assert_eq!(results_a.verdicts().len(), 1);
        assert_eq!(results_b.verdicts().len(), 1);
    }
}
