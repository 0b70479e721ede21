//! Scenarios for the outcome stream: performance samples and memory samples
//! reach the registered writers alongside verdicts.

use futures::future::BoxFuture;
use std::time::Duration;

use crate::integration::infrastructure::{sh_spec, EngineTestHarness};
use testrig::{
    AggregationHint, PerformanceUnit, Result, ScheduledTest, TestCase, TestContext, TestDescriptor,
};

struct ReportsSamples;

impl TestCase for ReportsSamples {
    fn execute<'a>(&'a self, ctx: &'a mut TestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let handle = ctx
                .start_process(sh_spec("sleep 1").named("workload"))
                .await?;
            ctx.monitor_memory(&handle, Duration::from_millis(50));

            let started = tokio::time::Instant::now();
            ctx.wait_for_exit(&handle, Duration::from_secs(10)).await?;
            ctx.report_performance(
                "workload runtime",
                started.elapsed().as_secs_f64(),
                PerformanceUnit::seconds(),
                AggregationHint::Mean,
            );
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_samples_flow_to_writers() -> anyhow::Result<()> {
    let mut harness = EngineTestHarness::new(2)?;

    let tests = vec![ScheduledTest::new(
        TestDescriptor::new("reports_samples", Duration::from_secs(30)),
        ReportsSamples,
    )];
    let summary = harness.run(tests).await;
    assert_eq!(summary.passed, 1, "expected a pass: {summary}");

    let performance = harness.results.performance_samples();
    assert_eq!(performance.len(), 1);
    assert_eq!(performance[0].metric, "workload runtime");
    assert!(performance[0].value >= 0.9, "sleep 1 takes about a second");
    assert!(!performance[0].unit.bigger_is_better);

    // Memory sampling only has a cheap source on Linux; elsewhere the
    // sampler degrades to producing nothing.
    if cfg!(target_os = "linux") {
        let memory = harness.results.memory_samples();
        assert!(
            !memory.is_empty(),
            "a 1s workload sampled at 50ms should yield memory samples"
        );
        assert!(memory.iter().all(|m| m.resident_bytes > 0));
    }
    Ok(())
}
