use rand::seq::SliceRandom;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::descriptor::{PortRange, RunConfig};
use crate::error::{EngineError, ResourceKind, Result};

/// How long to wait before retrying when every port is currently leased.
const POOL_EMPTY_RETRY: Duration = Duration::from_secs(2);
/// How long to wait after a probe found a port busy outside our control.
const BUSY_PORT_RETRY: Duration = Duration::from_millis(500);

/// Hands out collision-free TCP ports and scratch directories to
/// concurrently running tests.
///
/// The port pool is a shuffled LRU queue drawn from a wide configurable
/// range: popping a candidate is the serialized "check availability and mark
/// leased" step, so two workers can never be handed the same port. The
/// OS-level bind probe stays best-effort because processes outside this
/// engine can grab a port between the probe and the test binding it; callers
/// should retry once on a launch failure caused by a still-busy port.
pub struct ResourceAllocator {
    state: Arc<Mutex<PoolState>>,
    deadline: Duration,
    purge_scratch: bool,
}

struct PoolState {
    ports: VecDeque<u16>,
    leased_ports: HashSet<u16>,
    leased_dirs: HashSet<PathBuf>,
}

impl PoolState {
    fn return_port(&mut self, port: u16) {
        if !self.leased_ports.remove(&port) {
            warn!(port, "released a port that was not leased");
            return;
        }
        self.ports.push_back(port);
    }
}

impl ResourceAllocator {
    pub fn new(range: PortRange, deadline: Duration, purge_scratch: bool) -> Self {
        let mut pool: Vec<u16> = (range.low..=range.high).collect();
        // Shuffling reduces clashes between simultaneous engine runs on the
        // same host.
        pool.shuffle(&mut rand::rng());

        Self {
            state: Arc::new(Mutex::new(PoolState {
                ports: pool.into(),
                leased_ports: HashSet::new(),
                leased_dirs: HashSet::new(),
            })),
            deadline,
            purge_scratch,
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(
            config.port_range,
            config.allocation_deadline,
            config.purge_scratch,
        )
    }

    /// Acquires an OS-verified free TCP port not currently leased by this
    /// allocator.
    ///
    /// # Arguments
    /// * `owner` - Run id the lease is tagged with
    /// * `cancel` - Token observed while waiting for a port to free up
    ///
    /// # Returns
    /// * `Result<PortLease>` - The lease, or `ResourceExhausted` once the
    ///   acquisition deadline elapses
    pub async fn acquire_port(&self, owner: Uuid, cancel: &CancellationToken) -> Result<PortLease> {
        self.acquire_port_matching(owner, None, cancel).await
    }

    /// Like [`acquire_port`](Self::acquire_port) but only returns ports
    /// inside the given sub-range, for tests that need e.g. a low port.
    pub async fn acquire_port_in(
        &self,
        owner: Uuid,
        hint: PortRange,
        cancel: &CancellationToken,
    ) -> Result<PortLease> {
        self.acquire_port_matching(owner, Some(hint), cancel).await
    }

    async fn acquire_port_matching(
        &self,
        owner: Uuid,
        hint: Option<PortRange>,
        cancel: &CancellationToken,
    ) -> Result<PortLease> {
        let started = Instant::now();
        loop {
            let candidate = self.pop_candidate(hint);

            let retry = match candidate {
                Some(port) => {
                    if port_is_free(port) {
                        let mut state = self.lock_state();
                        state.leased_ports.insert(port);
                        debug!(port, %owner, "leased port");
                        return Ok(PortLease {
                            state: Arc::clone(&self.state),
                            port,
                            owner,
                            released: false,
                        });
                    }
                    // Someone outside the engine holds it; toss it to the
                    // back of the queue and try another.
                    self.lock_state().ports.push_back(port);
                    BUSY_PORT_RETRY
                }
                None => POOL_EMPTY_RETRY,
            };

            if started.elapsed() >= self.deadline {
                return Err(EngineError::ResourceExhausted {
                    kind: ResourceKind::Port,
                    waited: started.elapsed(),
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = sleep(retry) => {}
            }
        }
    }

    /// Creates and leases a scratch directory under `base`, unique per run.
    ///
    /// If `base_name` is already leased, a numeric suffix is appended until
    /// a free name is found.
    pub fn acquire_dir(&self, owner: Uuid, base: &Path, base_name: &str) -> Result<DirLease> {
        let path = {
            let mut state = self.lock_state();
            let mut path = base.join(base_name);
            let mut suffix = 1u32;
            while state.leased_dirs.contains(&path) {
                suffix += 1;
                path = base.join(format!("{base_name}-{suffix}"));
            }
            state.leased_dirs.insert(path.clone());
            path
        };

        if let Err(source) = std::fs::create_dir_all(&path) {
            self.lock_state().leased_dirs.remove(&path);
            return Err(EngineError::Io(source));
        }
        debug!(path = %path.display(), %owner, "leased scratch directory");

        Ok(DirLease {
            state: Arc::clone(&self.state),
            purge: self.purge_scratch,
            path,
            owner,
            released: false,
        })
    }

    /// Number of ports currently available for lease.
    pub fn available_ports(&self) -> usize {
        self.lock_state().ports.len()
    }

    /// Number of live leases (ports and directories) not yet released.
    pub fn outstanding_leases(&self) -> usize {
        let state = self.lock_state();
        state.leased_ports.len() + state.leased_dirs.len()
    }

    fn pop_candidate(&self, hint: Option<PortRange>) -> Option<u16> {
        let mut state = self.lock_state();
        match hint {
            None => state.ports.pop_front(),
            Some(range) => {
                // Rotate through at most one full pass looking for a port
                // inside the hinted sub-range.
                for _ in 0..state.ports.len() {
                    let port = match state.ports.pop_front() {
                        Some(p) => p,
                        None => break,
                    };
                    if port >= range.low && port <= range.high {
                        return Some(port);
                    }
                    state.ports.push_back(port);
                }
                None
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        lock_pool(&self.state)
    }
}

// Lease bookkeeping never panics while holding the lock, so a poisoned
// mutex only happens if the process is already going down.
fn lock_pool(state: &Arc<Mutex<PoolState>>) -> std::sync::MutexGuard<'_, PoolState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn release_dir(state: &Arc<Mutex<PoolState>>, path: &Path, purge: bool) -> Result<()> {
    let was_leased = lock_pool(state).leased_dirs.remove(path);
    if !was_leased {
        warn!(path = %path.display(), "released a directory that was not leased");
        return Ok(());
    }
    if purge {
        std::fs::remove_dir_all(path).map_err(|e| {
            EngineError::CleanupFailure(format!(
                "could not purge scratch directory {}: {e}",
                path.display()
            ))
        })?;
    }
    Ok(())
}

/// Probe whether anything on the host is currently bound to `port`.
fn port_is_free(port: u16) -> bool {
    let socket = match Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)) {
        Ok(s) => s,
        Err(e) => {
            warn!("port probe could not create socket: {e}");
            return false;
        }
    };
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    if socket.bind(&addr.into()).is_err() {
        return false;
    }
    // Listening flushes out platforms where bind alone does not conflict.
    socket.listen(1).is_ok()
}

/// An exclusive claim on one TCP port, released back to the pool exactly
/// once. Dropping an unreleased lease returns the port and logs a warning,
/// so a leaked lease never permanently shrinks the pool.
pub struct PortLease {
    state: Arc<Mutex<PoolState>>,
    port: u16,
    owner: Uuid,
    released: bool,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Returns the port to the pool. Consuming `self` makes a double
    /// release unrepresentable.
    pub fn release(mut self) {
        self.released = true;
        lock_pool(&self.state).return_port(self.port);
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(port = self.port, owner = %self.owner, "port lease leaked, returning to pool");
            lock_pool(&self.state).return_port(self.port);
        }
    }
}

impl std::fmt::Debug for PortLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLease")
            .field("port", &self.port)
            .field("owner", &self.owner)
            .finish()
    }
}

/// An exclusive claim on a scratch directory.
pub struct DirLease {
    state: Arc<Mutex<PoolState>>,
    purge: bool,
    path: PathBuf,
    owner: Uuid,
    released: bool,
}

impl DirLease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Releases the directory, purging it if the allocator is configured to.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        release_dir(&self.state, &self.path, self.purge)
    }
}

impl Drop for DirLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(path = %self.path.display(), owner = %self.owner, "directory lease leaked");
            if let Err(e) = release_dir(&self.state, &self.path, self.purge) {
                warn!("failed to release leaked directory lease: {e}");
            }
        }
    }
}

impl std::fmt::Debug for DirLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirLease")
            .field("path", &self.path)
            .field("owner", &self.owner)
            .finish()
    }
}
