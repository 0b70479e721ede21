//! Scenarios around server-readiness gating: a test that waits for a port a
//! process opens, and one whose server never comes up.

use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

use crate::integration::infrastructure::{pid_alive, sh_spec, EngineTestHarness};
use testrig::{Outcome, Result, ScheduledTest, TestCase, TestContext, TestDescriptor};

/// Starts a supervised worker process, brings a listener up on the leased
/// port after a startup delay, and gates on port readiness.
struct ServerComesUp {
    pid: Arc<Mutex<Option<u32>>>,
}

impl TestCase for ServerComesUp {
    fn execute<'a>(&'a self, ctx: &'a mut TestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let port = ctx.acquire_port().await?;

            let handle = ctx.start_process(sh_spec("sleep 5").named("server")).await?;
            *self.pid.lock().unwrap() = Some(handle.pid());

            // The "server" opens its socket 200ms after launch.
            let listener = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let listener = TcpListener::bind(("127.0.0.1", port)).await?;
                // Hold the socket open long enough for the wait to see it.
                tokio::time::sleep(Duration::from_secs(5)).await;
                drop(listener);
                Ok::<(), std::io::Error>(())
            });

            ctx.wait_for_port(port, Duration::from_millis(2000)).await?;
            listener.abort();
            Ok(())
        })
    }
}

/// Same shape, but nothing ever listens on the leased port.
struct ServerNeverListens {
    pid: Arc<Mutex<Option<u32>>>,
}

impl TestCase for ServerNeverListens {
    fn execute<'a>(&'a self, ctx: &'a mut TestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let port = ctx.acquire_port().await?;

            let handle = ctx
                .start_process(sh_spec("sleep 30").named("server"))
                .await?;
            *self.pid.lock().unwrap() = Some(handle.pid());

            ctx.wait_for_port(port, Duration::from_millis(500)).await?;
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_port_ready_within_deadline_passes() -> anyhow::Result<()> {
    let mut harness = EngineTestHarness::new(2)?;
    let pid = Arc::new(Mutex::new(None));

    let tests = vec![ScheduledTest::new(
        TestDescriptor::new("server_comes_up", Duration::from_secs(30)),
        ServerComesUp {
            pid: Arc::clone(&pid),
        },
    )];
    let summary = harness.run(tests).await;

    assert_eq!(summary.passed, 1, "expected a pass: {summary}");

    let verdicts = harness.results.verdicts();
    assert_eq!(verdicts[0].outcome, Outcome::Passed);
    let port_check = verdicts[0]
        .assertions
        .iter()
        .find(|a| a.description.contains("ready"))
        .expect("port readiness must be recorded as an assertion");
    assert!(port_check.is_pass());

    // The supervised worker must not survive the test.
    let pid = pid.lock().unwrap().expect("process was started");
    assert!(!pid_alive(pid), "worker pid {pid} outlived its test");
    Ok(())
}

#[tokio::test]
async fn test_port_never_ready_times_out_and_kills_process() -> anyhow::Result<()> {
    let mut harness = EngineTestHarness::new(2)?;
    let pid = Arc::new(Mutex::new(None));

    let tests = vec![ScheduledTest::new(
        TestDescriptor::new("server_never_listens", Duration::from_secs(30)),
        ServerNeverListens {
            pid: Arc::clone(&pid),
        },
    )];
    let summary = harness.run(tests).await;

    assert_eq!(summary.timed_out, 1, "expected a timeout: {summary}");

    let verdicts = harness.results.verdicts();
    assert_eq!(verdicts[0].outcome, Outcome::TimedOut);
    assert!(
        verdicts[0].duration < Duration::from_secs(10),
        "the wait deadline, not the test deadline, should decide this"
    );

    // Cleanup must have force-killed the never-ready server.
    let pid = pid.lock().unwrap().expect("process was started");
    assert!(!pid_alive(pid), "server pid {pid} survived cleanup");
    Ok(())
}
