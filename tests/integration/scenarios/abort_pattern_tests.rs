//! Scenario for early failure on a fatal log pattern: the abort must fire
//! long before the test's own waits would time out, and must stop those
//! waits.

use futures::future::BoxFuture;
use std::time::Duration;
use tokio::time::Instant;

use crate::integration::infrastructure::{sh_spec, EngineTestHarness};
use testrig::{Outcome, Result, ScheduledTest, TestCase, TestContext, TestDescriptor};

/// Watches the server log for a fatal pattern while waiting on a readiness
/// line that never comes.
struct FatalErrorInLog;

impl TestCase for FatalErrorInLog {
    fn execute<'a>(&'a self, ctx: &'a mut TestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            ctx.abort_on_pattern("server.log", "FATAL ERROR")?;

            // The server writes its fatal error ~50ms in, then hangs.
            ctx.start_process(
                sh_spec(
                    "sleep 0.05; echo 'FATAL ERROR: broker unreachable' >> server.log; sleep 30",
                )
                .named("server"),
            )
            .await?;

            // Without the abort this would idle for its full 10 seconds.
            ctx.wait_for_text("server.log", "server ready", Duration::from_secs(10))
                .await?;
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_abort_pattern_short_circuits_pending_waits() -> anyhow::Result<()> {
    let mut harness = EngineTestHarness::new(2)?;
    let started = Instant::now();

    let tests = vec![ScheduledTest::new(
        TestDescriptor::new("fatal_error_in_log", Duration::from_secs(60)),
        FatalErrorInLog,
    )];
    let summary = harness.run(tests).await;
    let elapsed = started.elapsed();

    assert_eq!(summary.failed, 1, "expected a failure: {summary}");
    assert!(
        elapsed < Duration::from_secs(5),
        "abort should beat the 10s text wait, took {elapsed:?}"
    );

    let verdicts = harness.results.verdicts();
    assert_eq!(verdicts[0].outcome, Outcome::Failed);
    let abort_note = verdicts[0]
        .assertions
        .iter()
        .find(|a| !a.is_pass())
        .expect("the abort must surface as a failed assertion");
    assert!(
        abort_note
            .detail
            .as_deref()
            .unwrap_or_default()
            .contains("FATAL ERROR"),
        "failure detail should carry the matched pattern: {abort_note}"
    );
    Ok(())
}
