use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::descriptor::TestId;

/// Final outcome classification of one test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Passed,
    Failed,
    TimedOut,
    Errored,
    Skipped,
    Blocked,
}

impl Outcome {
    /// Dominance rank used when combining several recorded outcomes into a
    /// single verdict. A higher rank wins: a skipped test stays skipped no
    /// matter what else was recorded, an engine error outranks a timeout,
    /// and a timeout outranks a plain assertion failure.
    fn precedence(self) -> u8 {
        match self {
            Outcome::Passed => 0,
            Outcome::Failed => 1,
            Outcome::TimedOut => 2,
            Outcome::Blocked => 3,
            Outcome::Errored => 4,
            Outcome::Skipped => 5,
        }
    }

    /// Combines two outcomes, keeping the dominant one.
    pub fn worst(self, other: Outcome) -> Outcome {
        if other.precedence() > self.precedence() {
            other
        } else {
            self
        }
    }

    /// Whether this outcome counts against the run. Skipped tests do not.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Outcome::Failed | Outcome::TimedOut | Outcome::Errored | Outcome::Blocked
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Outcome::Passed => "✓",
            Outcome::Failed => "✗",
            Outcome::TimedOut => "⏱",
            Outcome::Errored => "!",
            Outcome::Skipped => "○",
            Outcome::Blocked => "▣",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Passed => write!(f, "PASSED"),
            Outcome::Failed => write!(f, "FAILED"),
            Outcome::TimedOut => write!(f, "TIMED OUT"),
            Outcome::Errored => write!(f, "ERRORED"),
            Outcome::Skipped => write!(f, "SKIPPED"),
            Outcome::Blocked => write!(f, "BLOCKED"),
        }
    }
}

/// One validation check's result, with a human-readable reason.
#[derive(Debug, Clone)]
pub struct AssertionOutcome {
    pub description: String,
    pub outcome: Outcome,
    pub detail: Option<String>,
}

impl AssertionOutcome {
    pub fn passed(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            outcome: Outcome::Passed,
            detail: None,
        }
    }

    pub fn failed(description: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            outcome: Outcome::Failed,
            detail: Some(detail.into()),
        }
    }

    pub fn timed_out(description: impl Into<String>, limit: Duration) -> Self {
        Self {
            description: description.into(),
            outcome: Outcome::TimedOut,
            detail: Some(format!("deadline of {limit:?} elapsed")),
        }
    }

    pub fn errored(description: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            outcome: Outcome::Errored,
            detail: Some(detail.into()),
        }
    }

    pub fn is_pass(&self) -> bool {
        self.outcome == Outcome::Passed
    }
}

impl fmt::Display for AssertionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.outcome.symbol(), self.description)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

/// The final, immutable outcome of one scheduled test execution.
///
/// Produced exactly once per run request and never mutated after being
/// handed to the outcome aggregator.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub run_id: Uuid,
    pub test_id: TestId,
    pub outcome: Outcome,
    pub assertions: Vec<AssertionOutcome>,
    /// Non-fatal problems hit while tearing the test down. These never
    /// overturn the outcome on their own; a confirmed process leak is
    /// escalated to [`Outcome::Errored`] before the verdict is built.
    pub cleanup_warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
}

impl Verdict {
    /// Combines recorded assertion outcomes into a final outcome, starting
    /// from `base`. With no assertions the base stands; a fresh run with an
    /// empty record is a pass.
    pub fn combine(base: Outcome, assertions: &[AssertionOutcome]) -> Outcome {
        assertions
            .iter()
            .fold(base, |acc, a| acc.worst(a.outcome))
    }

    /// A verdict for a request that never ran (group filtering, cancellation
    /// before dispatch).
    pub fn skipped(run_id: Uuid, test_id: TestId, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            test_id,
            outcome: Outcome::Skipped,
            assertions: vec![AssertionOutcome {
                description: "test skipped".to_string(),
                outcome: Outcome::Skipped,
                detail: Some(reason.into()),
            }],
            cleanup_warnings: Vec::new(),
            started_at: now,
            finished_at: now,
            duration: Duration::ZERO,
        }
    }

    /// A verdict for a request whose worker died without producing one.
    pub fn blocked(run_id: Uuid, test_id: TestId, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            test_id,
            outcome: Outcome::Blocked,
            assertions: vec![AssertionOutcome {
                description: "test blocked".to_string(),
                outcome: Outcome::Blocked,
                detail: Some(reason.into()),
            }],
            cleanup_warnings: Vec::new(),
            started_at: now,
            finished_at: now,
            duration: Duration::ZERO,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} [{}ms]",
            self.outcome.symbol(),
            self.test_id,
            self.outcome,
            self.duration.as_millis()
        )
    }
}

/// Aggregate counts over a completed batch, in the order verdicts arrived.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub errored: usize,
    pub skipped: usize,
    pub blocked: usize,
    pub duration: Duration,
}

impl RunSummary {
    pub fn record(&mut self, verdict: &Verdict) {
        self.total += 1;
        match verdict.outcome {
            Outcome::Passed => self.passed += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::TimedOut => self.timed_out += 1,
            Outcome::Errored => self.errored += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Blocked => self.blocked += 1,
        }
    }

    /// True when every test either passed or was deliberately skipped; this
    /// is what the surrounding tool maps to a zero exit status.
    pub fn all_passed(&self) -> bool {
        self.passed + self.skipped == self.total
    }

    pub fn pass_rate(&self) -> f64 {
        let considered = self.total - self.skipped;
        if considered == 0 {
            100.0
        } else {
            (self.passed as f64 / considered as f64) * 100.0
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total: {} | passed: {} | failed: {} | timed out: {} | errored: {} | blocked: {} | skipped: {}",
            self.total, self.passed, self.failed, self.timed_out, self.errored, self.blocked, self.skipped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_precedence() {
        assert_eq!(Outcome::Passed.worst(Outcome::Failed), Outcome::Failed);
        assert_eq!(Outcome::Failed.worst(Outcome::TimedOut), Outcome::TimedOut);
        assert_eq!(Outcome::TimedOut.worst(Outcome::Errored), Outcome::Errored);
        assert_eq!(Outcome::Errored.worst(Outcome::Skipped), Outcome::Skipped);
        assert_eq!(Outcome::Failed.worst(Outcome::Passed), Outcome::Failed);
    }

    #[test]
    fn test_combine_defaults_to_base() {
        assert_eq!(Verdict::combine(Outcome::Passed, &[]), Outcome::Passed);
        assert_eq!(Verdict::combine(Outcome::TimedOut, &[]), Outcome::TimedOut);
    }

    #[test]
    fn test_combine_picks_dominant_assertion() {
        let assertions = vec![
            AssertionOutcome::passed("server started"),
            AssertionOutcome::failed("log content", "expected 3 matches, found 1"),
            AssertionOutcome::timed_out("port ready", Duration::from_millis(500)),
        ];
        assert_eq!(
            Verdict::combine(Outcome::Passed, &assertions),
            Outcome::TimedOut
        );
    }

    #[test]
    fn test_summary_counts_and_exit_mapping() {
        let mut summary = RunSummary::default();
        summary.record(&Verdict::skipped(
            Uuid::new_v4(),
            TestId::new("t1"),
            "excluded group",
        ));
        assert!(summary.all_passed());

        summary.record(&Verdict::blocked(
            Uuid::new_v4(),
            TestId::new("t2"),
            "worker panicked",
        ));
        assert!(!summary.all_passed());
        assert_eq!(summary.total, 2);
        assert_eq!(summary.blocked, 1);
    }
}
