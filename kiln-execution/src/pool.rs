//! Pool of reusable workers keyed by their requirements

use async_trait::async_trait;
use kiln_config::{IsolationMode, WorkerPoolConfig};
use kiln_ipc::{IpcError, WorkItem, WorkResult, WorkerProtocol, WorkerStatus};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::compiler::CompilerRegistry;
use crate::error::ExecutionError;
use crate::provision::{InProcessProvisioner, ProcessProvisioner, WorkerProvisioner};
use crate::requirements::ForkRequirements;
use crate::worker::{WorkerProcess, WorkerStats};

/// Grace period for a worker to exit after `Shutdown`
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A worker borrowed for one or more work items
#[async_trait]
pub trait WorkerHandle: Send {
    fn id(&self) -> &str;

    /// Requirements the worker was provisioned with
    fn requirements(&self) -> &ForkRequirements;

    /// Directory the worker is parked at between items
    fn idle_working_dir(&self) -> &Path {
        self.requirements().idle_working_dir()
    }

    /// Run one item; a failed item is returned as a failed [`WorkResult`]
    async fn execute(&mut self, item: WorkItem) -> Result<WorkResult, ExecutionError>;
}

/// Hands out workers compatible with a set of requirements
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn get_worker(
        &self,
        protocol: WorkerProtocol,
        requirements: &ForkRequirements,
    ) -> Result<Box<dyn WorkerHandle>, ExecutionError>;
}

/// Sizing and retirement settings of a [`WorkerPool`]
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_workers: usize,
    pub idle_timeout: Duration,
    pub reaper_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&WorkerPoolConfig::default())
    }
}

impl PoolSettings {
    pub fn from_config(config: &WorkerPoolConfig) -> Self {
        Self {
            max_workers: config.max_workers.max(1),
            idle_timeout: config.idle_timeout,
            reaper_interval: config.reaper_interval,
        }
    }
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub max_workers: usize,
    pub live: usize,
    pub idle: usize,
    pub busy: usize,
    /// Counters of the idle workers
    pub workers: Vec<WorkerStats>,
}

struct PoolState {
    idle: Vec<WorkerProcess>,
    /// Idle plus leased plus being provisioned
    live: usize,
    closed: bool,
}

struct PoolInner {
    settings: PoolSettings,
    provisioner: Arc<dyn WorkerProvisioner>,
    state: Mutex<PoolState>,
    released: Notify,
    next_id: AtomicU64,
}

enum Slot {
    Reuse(WorkerProcess),
    Provision,
    Evict(WorkerProcess),
    Wait,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim_slot(&self, protocol: WorkerProtocol, requirements: &ForkRequirements) -> Result<Slot, ExecutionError> {
        let mut state = self.lock();
        if state.closed {
            return Err(ExecutionError::PoolClosed);
        }

        // Most recently used compatible worker first
        let compatible = state
            .idle
            .iter()
            .enumerate()
            .filter(|(_, worker)| {
                worker.supports(protocol) && worker.requirements().is_compatible_with(requirements)
            })
            .max_by_key(|(_, worker)| worker.last_used())
            .map(|(index, _)| index);
        if let Some(index) = compatible {
            return Ok(Slot::Reuse(state.idle.swap_remove(index)));
        }

        if state.live < self.settings.max_workers {
            state.live += 1;
            return Ok(Slot::Provision);
        }

        let lru = state
            .idle
            .iter()
            .enumerate()
            .min_by_key(|(_, worker)| worker.last_used())
            .map(|(index, _)| index);
        match lru {
            // The evicted worker's slot passes to the new one
            Some(index) => Ok(Slot::Evict(state.idle.swap_remove(index))),
            None => Ok(Slot::Wait),
        }
    }

    /// Give up a slot whose worker is gone
    fn forget(&self) {
        let mut state = self.lock();
        state.live = state.live.saturating_sub(1);
        drop(state);
        self.released.notify_waiters();
    }

    fn release(&self, mut worker: WorkerProcess) {
        let healthy = worker.is_healthy();
        let mut state = self.lock();
        if healthy && !state.closed {
            worker.touch();
            state.idle.push(worker);
            drop(state);
        } else {
            state.live = state.live.saturating_sub(1);
            drop(state);
            debug!(worker_id = %worker.id(), "Discarding worker");
            stop_in_background(worker);
        }
        self.released.notify_waiters();
    }

    fn next_worker_id(&self) -> String {
        format!("worker-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// A counted slot with no worker in it yet.
///
/// Dropped unkept, for example when `acquire` is cancelled mid-provision,
/// it gives the slot back.
struct SlotReservation {
    pool: Arc<PoolInner>,
    armed: bool,
}

impl SlotReservation {
    fn new(pool: &Arc<PoolInner>) -> Self {
        Self {
            pool: Arc::clone(pool),
            armed: true,
        }
    }

    /// The slot now belongs to a provisioned worker
    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if self.armed {
            self.pool.forget();
        }
    }
}

fn stop_in_background(worker: WorkerProcess) {
    // Without a runtime the worker is killed when dropped
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(worker.shutdown(SHUTDOWN_GRACE));
    }
}

/// Bounded pool of workers, reused across compatible requests.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(settings: PoolSettings, provisioner: Arc<dyn WorkerProvisioner>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                settings,
                provisioner,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    live: 0,
                    closed: false,
                }),
                released: Notify::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Build a pool whose provisioner follows the configured isolation mode.
    ///
    /// `registry` serves in-process workers; process workers bring their own.
    pub fn from_config(config: &WorkerPoolConfig, registry: CompilerRegistry) -> Result<Self, ExecutionError> {
        let provisioner: Arc<dyn WorkerProvisioner> = match config.isolation {
            IsolationMode::Process => Arc::new(ProcessProvisioner::from_config(config)?),
            IsolationMode::InProcess => Arc::new(InProcessProvisioner::from_config(config, registry)),
        };
        Ok(Self::new(PoolSettings::from_config(config), provisioner))
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Borrow a worker compatible with `requirements`, waiting for capacity if needed
    pub async fn acquire(
        &self,
        protocol: WorkerProtocol,
        requirements: &ForkRequirements,
    ) -> Result<WorkerLease, ExecutionError> {
        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            // Register before looking so a release in between is not missed
            released.as_mut().enable();

            match self.inner.claim_slot(protocol, requirements)? {
                Slot::Reuse(mut worker) => {
                    if worker.is_healthy() {
                        debug!(worker_id = %worker.id(), "Reusing idle worker");
                        return Ok(self.lease(worker));
                    }
                    warn!(worker_id = %worker.id(), "Dropping dead idle worker");
                    self.inner.forget();
                    stop_in_background(worker);
                }
                Slot::Provision => {
                    let reservation = SlotReservation::new(&self.inner);
                    return self.provision(reservation, protocol, requirements).await;
                }
                Slot::Evict(worker) => {
                    let reservation = SlotReservation::new(&self.inner);
                    info!(worker_id = %worker.id(), "Evicting idle worker to make room");
                    stop_in_background(worker);
                    return self.provision(reservation, protocol, requirements).await;
                }
                Slot::Wait => {
                    debug!("All workers busy, waiting for a release");
                    released.await;
                }
            }
        }
    }

    async fn provision(
        &self,
        reservation: SlotReservation,
        protocol: WorkerProtocol,
        requirements: &ForkRequirements,
    ) -> Result<WorkerLease, ExecutionError> {
        let worker_id = self.inner.next_worker_id();
        match self.inner.provisioner.provision(&worker_id, protocol, requirements).await {
            Ok(worker) => {
                reservation.keep();
                Ok(self.lease(worker))
            }
            Err(e) => {
                warn!(worker_id = %worker_id, "Failed to provision worker: {}", e);
                Err(e)
            }
        }
    }

    fn lease(&self, worker: WorkerProcess) -> WorkerLease {
        WorkerLease {
            id: worker.id().to_string(),
            requirements: worker.requirements().clone(),
            worker: Some(worker),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Stop idle workers unused for longer than the idle timeout
    pub async fn retire_idle(&self) -> usize {
        let idle_timeout = self.inner.settings.idle_timeout;
        let expired: Vec<WorkerProcess> = {
            let mut state = self.inner.lock();
            let (expired, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|worker| worker.last_used().elapsed() >= idle_timeout);
            state.idle = keep;
            state.live = state.live.saturating_sub(expired.len());
            expired
        };

        let retired = expired.len();
        if retired > 0 {
            info!("Retiring {} idle worker(s)", retired);
            self.inner.released.notify_waiters();
            for worker in expired {
                worker.shutdown(SHUTDOWN_GRACE).await;
            }
        }
        retired
    }

    /// Retire idle workers periodically until the pool is dropped or shut down
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let period = self.inner.settings.reaper_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = pool.upgrade() else { break };
                if inner.lock().closed {
                    break;
                }
                WorkerPool { inner }.retire_idle().await;
            }
            debug!("Worker reaper stopped");
        })
    }

    /// Stop every idle worker and refuse further requests.
    ///
    /// Leased workers are stopped as their leases are dropped.
    pub async fn shutdown(&self) {
        let idle = {
            let mut state = self.inner.lock();
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.live = state.live.saturating_sub(idle.len());
            idle
        };
        self.inner.released.notify_waiters();

        info!("Shutting down {} idle worker(s)", idle.len());
        for worker in idle {
            worker.shutdown(SHUTDOWN_GRACE).await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            max_workers: self.inner.settings.max_workers,
            live: state.live,
            idle: state.idle.len(),
            busy: state.live.saturating_sub(state.idle.len()),
            workers: state.idle.iter().map(WorkerProcess::stats).collect(),
        }
    }
}

#[async_trait]
impl WorkerFactory for WorkerPool {
    async fn get_worker(
        &self,
        protocol: WorkerProtocol,
        requirements: &ForkRequirements,
    ) -> Result<Box<dyn WorkerHandle>, ExecutionError> {
        Ok(Box::new(self.acquire(protocol, requirements).await?))
    }
}

/// Exclusive use of a pooled worker.
///
/// Dropping the lease hands a healthy worker back to the pool and stops a
/// broken one.
pub struct WorkerLease {
    id: String,
    requirements: ForkRequirements,
    worker: Option<WorkerProcess>,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("id", &self.id)
            .field("requirements", &self.requirements)
            .field("attached", &self.worker.is_some())
            .finish()
    }
}

impl WorkerLease {
    fn detached(&self) -> ExecutionError {
        ExecutionError::Transport {
            worker_id: self.id.clone(),
            source: IpcError::NotConnected,
        }
    }

    pub async fn ping(&mut self) -> Result<WorkerStatus, ExecutionError> {
        match self.worker.as_mut() {
            Some(worker) => worker.ping().await,
            None => Err(self.detached()),
        }
    }

    pub fn stats(&self) -> Option<WorkerStats> {
        self.worker.as_ref().map(WorkerProcess::stats)
    }
}

#[async_trait]
impl WorkerHandle for WorkerLease {
    fn id(&self) -> &str {
        &self.id
    }

    fn requirements(&self) -> &ForkRequirements {
        &self.requirements
    }

    async fn execute(&mut self, item: WorkItem) -> Result<WorkResult, ExecutionError> {
        match self.worker.as_mut() {
            Some(worker) => worker.execute(item).await,
            None => Err(self.detached()),
        }
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.release(worker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompileContext, CompileOutcome, Compiler};
    use serde_json::{json, Value as JsonValue};
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct Quick;

    impl Compiler for Quick {
        type Spec = JsonValue;
        type Error = std::io::Error;

        fn execute(&self, _spec: JsonValue, _context: &CompileContext<'_>) -> Result<CompileOutcome, std::io::Error> {
            Ok(CompileOutcome::did_work())
        }
    }

    /// Counts provisions and delegates to an in-process provisioner
    struct CountingProvisioner {
        inner: InProcessProvisioner,
        provisioned: AtomicUsize,
        /// The next provision never completes
        hang_next: AtomicBool,
    }

    #[async_trait]
    impl WorkerProvisioner for CountingProvisioner {
        async fn provision(
            &self,
            worker_id: &str,
            protocol: WorkerProtocol,
            requirements: &ForkRequirements,
        ) -> Result<WorkerProcess, ExecutionError> {
            self.provisioned.fetch_add(1, Ordering::SeqCst);
            if self.hang_next.swap(false, Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.provision(worker_id, protocol, requirements).await
        }
    }

    fn pool(max_workers: usize, idle_timeout: Duration) -> (WorkerPool, Arc<CountingProvisioner>) {
        let provisioner = Arc::new(CountingProvisioner {
            inner: InProcessProvisioner::new(CompilerRegistry::new().with("quick", Quick)),
            provisioned: AtomicUsize::new(0),
            hang_next: AtomicBool::new(false),
        });
        let settings = PoolSettings {
            max_workers,
            idle_timeout,
            reaper_interval: Duration::from_millis(20),
        };
        (WorkerPool::new(settings, provisioner.clone()), provisioner)
    }

    const DAEMON: WorkerProtocol = WorkerProtocol::CompilerDaemon;

    #[tokio::test]
    async fn test_lease_returns_worker_to_pool() {
        let idle = tempfile::tempdir().unwrap();
        let (pool, provisioner) = pool(2, Duration::from_secs(60));
        let requirements = ForkRequirements::new(idle.path());

        let mut lease = pool.acquire(DAEMON, &requirements).await.unwrap();
        let first_id = lease.id().to_string();
        let result = lease
            .execute(WorkItem::new("quick", json!({}), idle.path(), idle.path()))
            .await
            .unwrap();
        assert!(result.is_success());

        let stats = pool.stats();
        assert_eq!((stats.live, stats.idle, stats.busy), (1, 0, 1));
        drop(lease);
        let stats = pool.stats();
        assert_eq!((stats.live, stats.idle, stats.busy), (1, 1, 0));
        assert_eq!(stats.workers[0].items_executed, 1);

        let lease = pool.acquire(DAEMON, &requirements).await.unwrap();
        assert_eq!(lease.id(), first_id);
        assert_eq!(provisioner.provisioned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_incompatible_request_provisions_new_worker() {
        let idle = tempfile::tempdir().unwrap();
        let (pool, provisioner) = pool(4, Duration::from_secs(60));

        let small = ForkRequirements::new(idle.path()).with_max_memory_mb(128);
        let large = ForkRequirements::new(idle.path()).with_max_memory_mb(1024);

        let lease = pool.acquire(DAEMON, &small).await.unwrap();
        let small_id = lease.id().to_string();
        drop(lease);

        let lease = pool.acquire(DAEMON, &large).await.unwrap();
        assert_ne!(lease.id(), small_id);
        drop(lease);

        // The large worker can also serve small requests
        let lease = pool.acquire(DAEMON, &small).await.unwrap();
        assert_eq!(provisioner.provisioned.load(Ordering::SeqCst), 2);
        drop(lease);
        assert_eq!(pool.stats().live, 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let idle_a = tempfile::tempdir().unwrap();
        let idle_b = tempfile::tempdir().unwrap();
        let (pool, provisioner) = pool(1, Duration::from_secs(60));

        let lease = pool.acquire(DAEMON, &ForkRequirements::new(idle_a.path())).await.unwrap();
        drop(lease);

        let lease = pool.acquire(DAEMON, &ForkRequirements::new(idle_b.path())).await.unwrap();
        assert_eq!(lease.idle_working_dir(), idle_b.path());
        assert_eq!(provisioner.provisioned.load(Ordering::SeqCst), 2);

        let stats = pool.stats();
        assert_eq!((stats.live, stats.idle), (1, 0));
    }

    #[tokio::test]
    async fn test_waits_for_release_at_capacity() {
        let idle = tempfile::tempdir().unwrap();
        let (pool, provisioner) = pool(1, Duration::from_secs(60));
        let requirements = ForkRequirements::new(idle.path());

        let lease = pool.acquire(DAEMON, &requirements).await.unwrap();
        let held_id = lease.id().to_string();

        let waiter = {
            let pool = pool.clone();
            let requirements = requirements.clone();
            tokio::spawn(async move {
                let lease = pool.acquire(DAEMON, &requirements).await.unwrap();
                lease.id().to_string()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(lease);
        assert_eq!(waiter.await.unwrap(), held_id);
        assert_eq!(provisioner.provisioned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_provisioning_failure_frees_slot() {
        let idle = tempfile::tempdir().unwrap();
        let (pool, _) = pool(1, Duration::from_secs(60));

        let err = pool
            .acquire(DAEMON, &ForkRequirements::new(idle.path().join("missing")))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Provisioning { .. }));
        assert_eq!(pool.stats().live, 0);

        assert!(pool.acquire(DAEMON, &ForkRequirements::new(idle.path())).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_acquire_frees_slot() {
        let idle = tempfile::tempdir().unwrap();
        let (pool, provisioner) = pool(1, Duration::from_secs(60));
        let requirements = ForkRequirements::new(idle.path());

        provisioner.hang_next.store(true, Ordering::SeqCst);
        let attempt = tokio::time::timeout(Duration::from_millis(20), pool.acquire(DAEMON, &requirements)).await;
        assert!(attempt.is_err());
        assert_eq!(pool.stats().live, 0);

        let lease = tokio::time::timeout(Duration::from_secs(5), pool.acquire(DAEMON, &requirements))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.idle_working_dir(), idle.path());
        assert_eq!(pool.stats().live, 1);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_after_eviction_frees_slot() {
        let idle_a = tempfile::tempdir().unwrap();
        let idle_b = tempfile::tempdir().unwrap();
        let (pool, provisioner) = pool(1, Duration::from_secs(60));

        drop(pool.acquire(DAEMON, &ForkRequirements::new(idle_a.path())).await.unwrap());
        assert_eq!(pool.stats().idle, 1);

        // The idle worker is evicted before the replacement stalls
        provisioner.hang_next.store(true, Ordering::SeqCst);
        let attempt = tokio::time::timeout(
            Duration::from_millis(20),
            pool.acquire(DAEMON, &ForkRequirements::new(idle_b.path())),
        )
        .await;
        assert!(attempt.is_err());
        let stats = pool.stats();
        assert_eq!((stats.live, stats.idle), (0, 0));

        let lease = tokio::time::timeout(
            Duration::from_secs(5),
            pool.acquire(DAEMON, &ForkRequirements::new(idle_b.path())),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(lease.idle_working_dir(), idle_b.path());
        assert_eq!(provisioner.provisioned.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_lease_debug_names_worker() {
        let idle = tempfile::tempdir().unwrap();
        let (pool, _) = pool(1, Duration::from_secs(60));

        let lease = pool.acquire(DAEMON, &ForkRequirements::new(idle.path())).await.unwrap();
        let rendered = format!("{:?}", lease);
        assert!(rendered.contains(lease.id()));
        assert!(rendered.contains("attached: true"));
    }

    #[tokio::test]
    async fn test_retire_idle_workers() {
        let idle = tempfile::tempdir().unwrap();
        let (pool, provisioner) = pool(2, Duration::from_millis(30));
        let requirements = ForkRequirements::new(idle.path());

        drop(pool.acquire(DAEMON, &requirements).await.unwrap());
        assert_eq!(pool.retire_idle().await, 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pool.retire_idle().await, 1);
        assert_eq!(pool.stats().live, 0);

        drop(pool.acquire(DAEMON, &requirements).await.unwrap());
        assert_eq!(provisioner.provisioned.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reaper_retires_in_background() {
        let idle = tempfile::tempdir().unwrap();
        let (pool, _) = pool(2, Duration::from_millis(10));

        drop(pool.acquire(DAEMON, &ForkRequirements::new(idle.path())).await.unwrap());
        let reaper = pool.spawn_reaper();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(pool.stats().live, 0);

        pool.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), reaper)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_refuses_requests() {
        let idle = tempfile::tempdir().unwrap();
        let (pool, _) = pool(2, Duration::from_secs(60));
        let requirements = ForkRequirements::new(idle.path());

        let leased = pool.acquire(DAEMON, &requirements).await.unwrap();
        drop(pool.acquire(DAEMON, &requirements).await.unwrap());
        assert_eq!(pool.stats().idle, 1);

        pool.shutdown().await;
        assert_eq!(pool.stats().idle, 0);
        assert!(matches!(
            pool.acquire(DAEMON, &requirements).await,
            Err(ExecutionError::PoolClosed)
        ));

        // A lease returned after shutdown is not pooled again
        drop(leased);
        let stats = pool.stats();
        assert_eq!((stats.live, stats.idle), (0, 0));
    }
}
