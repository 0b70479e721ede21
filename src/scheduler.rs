use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregator::{OutcomeAggregator, RunEvent};
use crate::allocator::ResourceAllocator;
use crate::descriptor::{ExecutionMode, RunConfig, RunRequest, TestDescriptor};
use crate::runner::{TestCase, TestRunner};
use crate::verdict::{RunSummary, Verdict};

/// A descriptor paired with the logic that implements it, ready to
/// dispatch.
pub struct ScheduledTest {
    pub descriptor: Arc<TestDescriptor>,
    pub logic: Arc<dyn TestCase>,
}

impl ScheduledTest {
    pub fn new(descriptor: TestDescriptor, logic: impl TestCase + 'static) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            logic: Arc::new(logic),
        }
    }

    pub fn from_parts(descriptor: Arc<TestDescriptor>, logic: Arc<dyn TestCase>) -> Self {
        Self { descriptor, logic }
    }
}

/// Distributes a batch of tests across a bounded worker pool.
///
/// Requests are assigned to free worker slots greedily in submission order.
/// Tests declared [`ExecutionMode::Exclusive`] additionally serialize on a
/// shared lock, so no two of them ever run concurrently while non-exclusive
/// tests keep running alongside. Verdicts stream to the aggregator in the
/// order they complete; no cross-test completion order is promised.
pub struct Scheduler {
    config: RunConfig,
    allocator: Arc<ResourceAllocator>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(config: RunConfig) -> Self {
        let allocator = Arc::new(ResourceAllocator::from_config(&config));
        Self {
            config,
            allocator,
            cancel: CancellationToken::new(),
        }
    }

    /// Token observed by every dispatch decision, wait and poll loop under
    /// this scheduler.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests a global abort: no new tests are dispatched, and every
    /// active test runner is asked to cancel. Already-produced verdicts are
    /// preserved.
    pub fn abort(&self) {
        warn!("global abort requested");
        self.cancel.cancel();
    }

    pub fn allocator(&self) -> Arc<ResourceAllocator> {
        Arc::clone(&self.allocator)
    }

    /// Runs the batch to completion, forwarding every verdict and sample to
    /// the aggregator, and returns the aggregate counts.
    pub async fn run(
        &self,
        tests: Vec<ScheduledTest>,
        aggregator: &mut OutcomeAggregator,
    ) -> RunSummary {
        let start = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let exclusive_lock = Arc::new(Mutex::new(()));
        let (events_tx, mut events_rx) = unbounded_channel::<RunEvent>();

        info!(
            tests = tests.len(),
            workers = self.config.workers,
            "scheduling batch"
        );

        let dispatch = async {
            let mut join = JoinSet::new();
            let events_tx = events_tx;

            for test in tests {
                let descriptor = test.descriptor;
                let request = RunRequest::new(Arc::clone(&descriptor), &self.config);

                // Filtered requests complete immediately without occupying
                // a worker slot.
                if let Some(reason) = self.config.filter_reason(&descriptor) {
                    let _ = events_tx.send(RunEvent::Verdict(Verdict::skipped(
                        request.run_id,
                        request.test_id().clone(),
                        reason,
                    )));
                    continue;
                }
                if self.cancel.is_cancelled() {
                    let _ = events_tx.send(RunEvent::Verdict(Verdict::skipped(
                        request.run_id,
                        request.test_id().clone(),
                        "run aborted before dispatch",
                    )));
                    continue;
                }

                // Greedy submission-order assignment to free worker slots.
                let permit = tokio::select! {
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    _ = self.cancel.cancelled() => {
                        let _ = events_tx.send(RunEvent::Verdict(Verdict::skipped(
                            request.run_id,
                            request.test_id().clone(),
                            "run aborted before dispatch",
                        )));
                        continue;
                    }
                };

                let runner = TestRunner::new(
                    Arc::clone(&self.allocator),
                    self.config.grace_period,
                    self.cancel.clone(),
                    events_tx.clone(),
                );
                let logic = test.logic;
                let exclusive = (descriptor.mode == ExecutionMode::Exclusive)
                    .then(|| Arc::clone(&exclusive_lock));
                let events = events_tx.clone();
                let run_id = request.run_id;
                let test_id = request.test_id().clone();

                join.spawn(async move {
                    let _permit = permit;
                    let _exclusive_guard = match &exclusive {
                        Some(lock) => Some(lock.lock().await),
                        None => None,
                    };

                    let verdict = AssertUnwindSafe(runner.run(request, logic))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            warn!(test = %test_id, "test worker panicked");
                            Verdict::blocked(run_id, test_id, "test worker panicked")
                        });
                    let _ = events.send(RunEvent::Verdict(verdict));
                });
            }

            // Dropping the dispatcher's sender lets the event stream close
            // once the last worker finishes.
            drop(events_tx);
            while join.join_next().await.is_some() {}
        };

        let drain = async {
            let mut summary = RunSummary::default();
            while let Some(event) = events_rx.recv().await {
                if let RunEvent::Verdict(verdict) = &event {
                    summary.record(verdict);
                }
                aggregator.publish(event);
            }
            summary
        };

        let ((), mut summary) = tokio::join!(dispatch, drain);
        summary.duration = start.elapsed();
        info!(%summary, "batch complete");
        summary
    }
}
