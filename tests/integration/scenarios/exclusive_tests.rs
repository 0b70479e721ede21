//! Scenario for mutual exclusion: tests declared exclusive serialize among
//! themselves while ordinary tests keep running beside them.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::integration::infrastructure::{sh_spec, EngineTestHarness};
use testrig::{Result, ScheduledTest, TestCase, TestContext, TestDescriptor};

/// An exclusive test that runs a real process and tracks how many exclusive
/// bodies are active at once.
struct ExclusiveWorkload {
    active: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
}

impl TestCase for ExclusiveWorkload {
    fn execute<'a>(&'a self, ctx: &'a mut TestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);

            let handle = ctx.start_process(sh_spec("sleep 0.3").named("tool")).await?;
            ctx.wait_for_exit(&handle, Duration::from_secs(5)).await?;

            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// A normal test that records whether it ever ran while an exclusive test
/// was active.
struct BystanderWorkload {
    exclusive_active: Arc<AtomicUsize>,
    saw_overlap: Arc<AtomicBool>,
}

impl TestCase for BystanderWorkload {
    fn execute<'a>(&'a self, _ctx: &'a mut TestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for _ in 0..25 {
                if self.exclusive_active.load(Ordering::SeqCst) > 0 {
                    self.saw_overlap.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_exclusive_tests_serialize_on_a_four_worker_pool() -> anyhow::Result<()> {
    let mut harness = EngineTestHarness::new(4)?;

    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let saw_overlap = Arc::new(AtomicBool::new(false));

    let tests = vec![
        ScheduledTest::new(
            TestDescriptor::new("exclusive_one", Duration::from_secs(30)).exclusive(),
            ExclusiveWorkload {
                active: Arc::clone(&active),
                max_seen: Arc::clone(&max_seen),
            },
        ),
        ScheduledTest::new(
            TestDescriptor::new("exclusive_two", Duration::from_secs(30)).exclusive(),
            ExclusiveWorkload {
                active: Arc::clone(&active),
                max_seen: Arc::clone(&max_seen),
            },
        ),
        ScheduledTest::new(
            TestDescriptor::new("bystander", Duration::from_secs(30)),
            BystanderWorkload {
                exclusive_active: Arc::clone(&active),
                saw_overlap: Arc::clone(&saw_overlap),
            },
        ),
    ];

    let summary = harness.run(tests).await;

    assert_eq!(summary.passed, 3, "all three should pass: {summary}");
    assert_eq!(
        max_seen.load(Ordering::SeqCst),
        1,
        "two exclusive tests must never run concurrently"
    );
    assert!(
        saw_overlap.load(Ordering::SeqCst),
        "the non-exclusive test should have run alongside an exclusive one"
    );
    Ok(())
}
