//! Polling condition waits used by tests to gate progression.
//!
//! Every wait here is an explicit poll loop against a monotonic clock with a
//! deadline, and every loop observes a cancellation token each iteration, so
//! cancelling a test stops its waits within one poll interval. Process-exit
//! waiting lives with the process supervisor, which owns the child handles.
//!
//! When an [`AbortMonitor`] and a [`TextWait`] could both be satisfied by the
//! same poll cycle, the abort wins: the monitor cancels the test-scoped
//! token the moment its pattern appears, and the test context re-checks the
//! abort state before reporting any wait as successful.

use regex::Regex;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Default interval between poll attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Blocks until a TCP connection to `host:port` is accepted, confirming a
/// server process is ready for clients.
pub async fn wait_for_port(
    host: &str,
    port: u16,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let deadline = Instant::now() + limit;
    let addr = format!("{host}:{port}");
    debug!(%addr, "waiting for listening socket");

    loop {
        if let Ok(Ok(_stream)) = timeout(DEFAULT_POLL_INTERVAL, TcpStream::connect(addr.as_str())).await {
            debug!(%addr, "socket accepted a connection");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(EngineError::Timeout {
                operation: format!("wait for port {addr}"),
                limit,
            });
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            _ = sleep(DEFAULT_POLL_INTERVAL) => {}
        }
    }
}

/// Blocks until `path` exists on disk, for components that signal readiness
/// by creating a file.
pub async fn wait_for_file(
    path: impl AsRef<Path>,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let path = path.as_ref();
    let deadline = Instant::now() + limit;
    debug!(path = %path.display(), "waiting for file creation");

    loop {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(EngineError::Timeout {
                operation: format!("wait for file {}", path.display()),
                limit,
            });
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            _ = sleep(DEFAULT_POLL_INTERVAL) => {}
        }
    }
}

/// A wait for a regular expression to appear in a growing text file.
///
/// The file may not exist yet when the wait starts, and may keep growing
/// while it runs. Scanning keeps a monotonic byte offset so each poll only
/// reads content appended since the last one; a pattern confined entirely to
/// already-scanned content is never matched twice, and cost stays
/// proportional to file growth rather than file size.
pub struct TextWait {
    path: PathBuf,
    pattern: Regex,
    min_matches: usize,
    poll: Duration,
    offset: u64,
    tail: String,
    tail_matched: bool,
    matches: usize,
}

impl TextWait {
    pub fn new(path: impl Into<PathBuf>, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|source| EngineError::BadPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            path: path.into(),
            pattern: regex,
            min_matches: 1,
            poll: DEFAULT_POLL_INTERVAL,
            offset: 0,
            tail: String::new(),
            tail_matched: false,
            matches: 0,
        })
    }

    /// Requires the pattern on at least `n` lines before the wait succeeds.
    pub fn with_min_matches(mut self, n: usize) -> Self {
        self.min_matches = n.max(1);
        self
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Matching lines seen so far across all polls.
    pub fn matches(&self) -> usize {
        self.matches
    }

    /// Polls until the pattern has been seen on `min_matches` lines, the
    /// deadline elapses, or the wait is cancelled.
    pub async fn wait(&mut self, limit: Duration, cancel: &CancellationToken) -> Result<usize> {
        let deadline = Instant::now() + limit;
        debug!(
            path = %self.path.display(),
            pattern = self.pattern.as_str(),
            min_matches = self.min_matches,
            "waiting for text in file"
        );

        loop {
            self.scan_new_content().await?;
            if self.matches >= self.min_matches {
                debug!(
                    path = %self.path.display(),
                    matches = self.matches,
                    "text wait satisfied"
                );
                return Ok(self.matches);
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout {
                    operation: format!(
                        "wait for `{}` in {} ({} of {} matches)",
                        self.pattern.as_str(),
                        self.path.display(),
                        self.matches,
                        self.min_matches
                    ),
                    limit,
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = sleep(self.poll) => {}
            }
        }
    }

    /// Reads and scans any content appended since the previous call.
    async fn scan_new_content(&mut self) -> Result<()> {
        let mut file = match File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        if len < self.offset {
            // The file was truncated or replaced underneath us; start over.
            self.offset = 0;
            self.tail.clear();
            self.tail_matched = false;
        }
        if len == self.offset {
            return Ok(());
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        // The file is reopened every poll, so limiting the read keeps one
        // scan from racing a writer past the length we sized for.
        let read = file.take(len - self.offset).read_to_end(&mut buf).await?;
        self.offset += read as u64;

        let chunk = String::from_utf8_lossy(&buf);
        self.ingest(&chunk);
        Ok(())
    }

    fn ingest(&mut self, chunk: &str) {
        self.tail.push_str(chunk);

        while let Some(pos) = self.tail.find('\n') {
            let line: String = self.tail.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            // tail_matched means the leading part of this line was already
            // counted while it sat unterminated in the buffer.
            if !self.tail_matched && self.pattern.is_match(line) {
                self.matches += 1;
            }
            self.tail_matched = false;
        }

        // Count an unterminated final line at most once, so a process that
        // writes its message without a trailing newline is still detected.
        if !self.tail_matched && !self.tail.is_empty() && self.pattern.is_match(&self.tail) {
            self.matches += 1;
            self.tail_matched = true;
        }
    }
}

/// Background check that fails a test the moment a fatal pattern appears in
/// monitored output, instead of letting the test idle to its full timeout.
///
/// On a match the monitor records the message and cancels the test-scoped
/// token, which stops every other wait belonging to the same test within
/// one poll interval.
pub struct AbortMonitor {
    fired: Arc<OnceLock<String>>,
    path: PathBuf,
    pattern: String,
    task: JoinHandle<()>,
}

impl AbortMonitor {
    pub fn spawn(
        path: impl Into<PathBuf>,
        pattern: &str,
        test_cancel: CancellationToken,
    ) -> Result<Self> {
        let path = path.into();
        let mut watch = TextWait::new(&path, pattern)?;
        let fired = Arc::new(OnceLock::new());

        let task = {
            let fired = Arc::clone(&fired);
            let path = path.clone();
            let pattern = pattern.to_string();
            tokio::spawn(async move {
                loop {
                    if let Err(e) = watch.scan_new_content().await {
                        // A transiently unreadable file is not fatal to the
                        // monitor itself; keep polling.
                        debug!(path = %path.display(), "abort monitor scan error: {e}");
                    }
                    if watch.matches() > 0 {
                        let message = format!(
                            "abort pattern `{pattern}` matched in {}",
                            path.display()
                        );
                        warn!("{message}");
                        let _ = fired.set(message);
                        test_cancel.cancel();
                        return;
                    }
                    tokio::select! {
                        _ = test_cancel.cancelled() => return,
                        _ = sleep(DEFAULT_POLL_INTERVAL) => {}
                    }
                }
            })
        };

        Ok(Self {
            fired,
            path,
            pattern: pattern.to_string(),
            task,
        })
    }

    /// The abort message, if the pattern has appeared.
    pub fn fired(&self) -> Option<&str> {
        self.fired.get().map(String::as_str)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl Drop for AbortMonitor {
    fn drop(&mut self) {
        // No poll loop may outlive its test.
        self.task.abort();
    }
}
