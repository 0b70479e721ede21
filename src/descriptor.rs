use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::environment::Environment;

/// Unique identity of one test case, assigned by the suite loader.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestId(String);

impl TestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Whether a test may share the host with other running tests.
///
/// Exclusive tests contend for host-level resources that cannot be leased
/// per-test, so the scheduler never runs two of them at the same time.
/// Non-exclusive tests keep running alongside either kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Normal,
    Exclusive,
}

/// Static metadata describing one test: identity, grouping, execution mode
/// and overall deadline. Owned by the external suite loader and read-only
/// to the engine.
#[derive(Debug, Clone)]
pub struct TestDescriptor {
    pub id: TestId,
    pub title: String,
    pub groups: BTreeSet<String>,
    pub mode: ExecutionMode,
    pub timeout: Duration,
}

impl TestDescriptor {
    pub fn new(id: impl Into<TestId>, timeout: Duration) -> Self {
        let id = id.into();
        Self {
            title: id.as_str().to_string(),
            id,
            groups: BTreeSet::new(),
            mode: ExecutionMode::Normal,
            timeout,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Marks this test as requiring exclusive host resources.
    pub fn exclusive(mut self) -> Self {
        self.mode = ExecutionMode::Exclusive;
        self
    }
}

/// Inclusive TCP port range the allocator draws server ports from.
///
/// The default stays clear of the privileged range and of the ephemeral
/// ranges Linux and Windows hand to outgoing connections, to minimise
/// collisions with the host's own allocations.
#[derive(Debug, Clone, Copy)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            low: 16_384,
            high: 28_671,
        }
    }
}

impl PortRange {
    pub fn len(&self) -> usize {
        (self.high as usize).saturating_sub(self.low as usize) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.high < self.low
    }
}

/// Global run configuration supplied by the suite loader.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Number of concurrent worker lanes.
    pub workers: usize,
    /// Root directory test output directories are created under.
    pub output_root: PathBuf,
    /// Port range the resource allocator draws from.
    pub port_range: PortRange,
    /// How long resource acquisition may retry before reporting exhaustion.
    pub allocation_deadline: Duration,
    /// Grace period between polite termination and force kill.
    pub grace_period: Duration,
    /// Only run tests carrying at least one of these groups, if non-empty.
    pub include_groups: BTreeSet<String>,
    /// Never run tests carrying any of these groups.
    pub exclude_groups: BTreeSet<String>,
    /// Environment overrides applied on top of every process spec.
    pub env_overrides: Environment,
    /// Remove scratch directories when their lease is released.
    pub purge_scratch: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            output_root: PathBuf::from("testrig-output"),
            port_range: PortRange::default(),
            allocation_deadline: Duration::from_secs(180),
            grace_period: Duration::from_secs(5),
            include_groups: BTreeSet::new(),
            exclude_groups: BTreeSet::new(),
            env_overrides: Environment::new(),
            purge_scratch: false,
        }
    }
}

impl RunConfig {
    /// Applies include/exclude group filtering to a descriptor. Returns the
    /// reason the test is filtered out, or `None` if it should run.
    pub fn filter_reason(&self, descriptor: &TestDescriptor) -> Option<String> {
        if let Some(group) = descriptor
            .groups
            .iter()
            .find(|g| self.exclude_groups.contains(*g))
        {
            return Some(format!("group `{group}` is excluded"));
        }
        if !self.include_groups.is_empty()
            && descriptor
                .groups
                .iter()
                .all(|g| !self.include_groups.contains(g))
        {
            return Some("no group matches the include filter".to_string());
        }
        None
    }
}

/// One scheduled execution of a test: the descriptor plus run-time
/// parameters. Created per dispatch and consumed by exactly one test runner.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: Uuid,
    pub descriptor: std::sync::Arc<TestDescriptor>,
    /// Directory process artifacts and scratch files for this run land in.
    pub output_dir: PathBuf,
    pub env_overrides: Environment,
}

impl RunRequest {
    pub fn new(descriptor: std::sync::Arc<TestDescriptor>, config: &RunConfig) -> Self {
        let run_id = Uuid::new_v4();
        let output_dir = config.output_root.join(descriptor.id.as_str());
        Self {
            run_id,
            descriptor,
            output_dir,
            env_overrides: config.env_overrides.clone(),
        }
    }

    pub fn test_id(&self) -> &TestId {
        &self.descriptor.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(groups: &[&str]) -> TestDescriptor {
        TestDescriptor::new("sample_test", Duration::from_secs(30)).with_groups(groups.to_vec())
    }

    #[test]
    fn test_filter_allows_by_default() {
        let config = RunConfig::default();
        assert!(config.filter_reason(&descriptor(&["smoke"])).is_none());
        assert!(config.filter_reason(&descriptor(&[])).is_none());
    }

    #[test]
    fn test_exclude_group_wins() {
        let mut config = RunConfig::default();
        config.exclude_groups.insert("slow".to_string());
        config.include_groups.insert("slow".to_string());

        let reason = config.filter_reason(&descriptor(&["slow", "smoke"]));
        assert!(reason.is_some());
        assert!(reason.unwrap().contains("excluded"));
    }

    #[test]
    fn test_include_filter_requires_membership() {
        let mut config = RunConfig::default();
        config.include_groups.insert("smoke".to_string());

        assert!(config.filter_reason(&descriptor(&["smoke"])).is_none());
        assert!(config.filter_reason(&descriptor(&["nightly"])).is_some());
        assert!(config.filter_reason(&descriptor(&[])).is_some());
    }

    #[test]
    fn test_run_request_output_dir_is_per_test() {
        let config = RunConfig::default();
        let desc = std::sync::Arc::new(descriptor(&[]));
        let request = RunRequest::new(desc.clone(), &config);

        assert_eq!(
            request.output_dir,
            config.output_root.join("sample_test")
        );
        assert_eq!(request.test_id(), &desc.id);

        // Each dispatch gets a fresh run identity.
        let second = RunRequest::new(desc, &config);
        assert_ne!(request.run_id, second.run_id);
    }

    #[test]
    fn test_port_range_len() {
        let range = PortRange::default();
        assert_eq!(range.len(), 12_288);
        assert!(!range.is_empty());
    }
}
