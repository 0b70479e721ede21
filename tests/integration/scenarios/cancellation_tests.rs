//! Scenario for global abort mid-execute: in-flight tests wind down
//! promptly and leave no processes behind.

use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::integration::infrastructure::{pid_alive, sh_spec, EngineTestHarness};
use testrig::{Outcome, Result, ScheduledTest, TestCase, TestContext, TestDescriptor};

/// Starts a long-lived process and then blocks on a file that never
/// appears, leaving plenty of time for the abort to land mid-wait.
struct HangsUntilCancelled {
    pid: Arc<Mutex<Option<u32>>>,
}

impl TestCase for HangsUntilCancelled {
    fn execute<'a>(&'a self, ctx: &'a mut TestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let handle = ctx
                .start_process(sh_spec("sleep 30").named("daemon"))
                .await?;
            *self.pid.lock().unwrap() = Some(handle.pid());

            ctx.wait_for_file("never-created.flag", Duration::from_secs(20))
                .await?;
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_global_abort_leaves_no_processes_behind() -> anyhow::Result<()> {
    let mut harness = EngineTestHarness::new(2)?;
    let pid = Arc::new(Mutex::new(None));

    let cancel = harness.scheduler.cancel_token();
    let aborter = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
    });

    let tests = vec![ScheduledTest::new(
        TestDescriptor::new("hangs_until_cancelled", Duration::from_secs(60)),
        HangsUntilCancelled {
            pid: Arc::clone(&pid),
        },
    )];
    let summary = harness.run(tests).await;
    aborter.await?;

    assert_eq!(summary.skipped, 1, "cancelled test becomes skipped: {summary}");
    assert!(
        summary.duration < Duration::from_secs(10),
        "abort must not wait out the 20s file wait"
    );

    let verdicts = harness.results.verdicts();
    assert_eq!(verdicts[0].outcome, Outcome::Skipped);

    // External process-table inspection: the daemon is gone after cleanup.
    let pid = pid.lock().unwrap().expect("process was started");
    assert!(!pid_alive(pid), "daemon pid {pid} survived the abort");
    Ok(())
}
