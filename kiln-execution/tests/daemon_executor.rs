//! End-to-end runs of the daemon executor over in-process workers

use kiln_execution::{
    CompileContext, CompileOutcome, Compiler, CompilerRegistry, DaemonCompiler, ExecutionError,
    ForkRequirements, InProcessProvisioner, PoolSettings, WorkerHandle, WorkerPool, WorkerProtocol,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BuildSpec {
    label: String,
    #[serde(default)]
    fail_with: Option<String>,
    #[serde(default)]
    up_to_date: bool,
    #[serde(default)]
    sleep_ms: u64,
}

impl BuildSpec {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            fail_with: None,
            up_to_date: false,
            sleep_ms: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct OutOfMemoryError(String);

#[derive(Debug, Clone)]
struct Observation {
    label: String,
    process_dir: PathBuf,
    started: Instant,
    finished: Instant,
}

/// Records the directory it runs in and writes a marker into it
struct RecordingCompiler {
    log: Arc<Mutex<Vec<Observation>>>,
}

impl Compiler for RecordingCompiler {
    type Spec = BuildSpec;
    type Error = OutOfMemoryError;

    fn execute(&self, spec: BuildSpec, context: &CompileContext<'_>) -> Result<CompileOutcome, OutOfMemoryError> {
        let started = Instant::now();
        let process_dir = context.process_dir().map_err(|e| OutOfMemoryError(e.to_string()))?;
        std::fs::write(context.resolve(format!("{}.out", spec.label)).unwrap(), &spec.label).unwrap();
        std::thread::sleep(Duration::from_millis(spec.sleep_ms));

        self.log.lock().unwrap().push(Observation {
            label: spec.label.clone(),
            process_dir,
            started,
            finished: Instant::now(),
        });

        if let Some(message) = spec.fail_with {
            return Err(OutOfMemoryError(message));
        }
        Ok(CompileOutcome { did_work: !spec.up_to_date })
    }
}

struct Harness {
    idle: TempDir,
    pool: WorkerPool,
    log: Arc<Mutex<Vec<Observation>>>,
}

impl Harness {
    fn new(max_workers: usize) -> Self {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = CompilerRegistry::new().with("recording", RecordingCompiler { log: Arc::clone(&log) });
        let settings = PoolSettings {
            max_workers,
            idle_timeout: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(60),
        };
        Self {
            idle: tempfile::tempdir().unwrap(),
            pool: WorkerPool::new(settings, Arc::new(InProcessProvisioner::new(registry))),
            log,
        }
    }

    fn compiler(&self, execution_dir: &Path) -> DaemonCompiler<BuildSpec> {
        let idle = self.idle.path().to_path_buf();
        DaemonCompiler::new(
            "recording",
            execution_dir,
            Arc::new(self.pool.clone()),
            move |_: &BuildSpec| ForkRequirements::new(idle.clone()),
        )
    }

    fn observations(&self) -> Vec<Observation> {
        self.log.lock().unwrap().clone()
    }

    /// Process directory of the worker a fresh lease hands out
    async fn parked_dir(&self) -> PathBuf {
        let mut lease = self
            .pool
            .acquire(WorkerProtocol::CompilerDaemon, &ForkRequirements::new(self.idle.path()))
            .await
            .unwrap();
        lease.ping().await.unwrap().process_dir.unwrap()
    }
}

#[tokio::test]
async fn test_successful_compile_returns_did_work() {
    let harness = Harness::new(2);
    let work = tempfile::tempdir().unwrap();
    let compiler = harness.compiler(work.path());

    let result = compiler.execute(&BuildSpec::new("a")).await.unwrap();
    assert!(result.is_success());
    assert!(result.did_work);

    let mut spec = BuildSpec::new("b");
    spec.up_to_date = true;
    let result = compiler.execute(&spec).await.unwrap();
    assert!(!result.did_work);

    let observations = harness.observations();
    assert!(observations.iter().all(|o| o.process_dir == work.path()));
    assert!(work.path().join("a.out").exists());
    assert_eq!(harness.parked_dir().await, harness.idle.path());
}

#[tokio::test]
async fn test_failing_compile_raises_cause_and_restores_directory() {
    let harness = Harness::new(1);
    let work = tempfile::tempdir().unwrap();
    let compiler = harness.compiler(work.path());

    let mut spec = BuildSpec::new("oom");
    spec.fail_with = Some("Java heap space".to_string());

    let err = compiler.execute(&spec).await.unwrap_err();
    match &err {
        ExecutionError::WorkFailed { display_name, cause } => {
            assert_eq!(display_name, "recording");
            assert_eq!(cause.type_tag, "OutOfMemoryError");
            assert_eq!(cause.message, "Java heap space");
        }
        other => panic!("Expected WorkFailed, got {:?}", other),
    }
    assert!(!err.is_transport_failure());

    assert_eq!(harness.observations()[0].process_dir, work.path());
    // Same worker, parked back at its idle directory
    assert_eq!(harness.parked_dir().await, harness.idle.path());

    // The worker survives the failure
    assert!(compiler.execute(&BuildSpec::new("after")).await.is_ok());
    assert_eq!(harness.pool.stats().live, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_keep_their_directories() {
    let harness = Harness::new(2);
    let work_a = tempfile::tempdir().unwrap();
    let work_b = tempfile::tempdir().unwrap();
    let compiler_a = harness.compiler(work_a.path());
    let compiler_b = harness.compiler(work_b.path());

    let mut spec_a = BuildSpec::new("a");
    spec_a.sleep_ms = 50;
    let mut spec_b = BuildSpec::new("b");
    spec_b.sleep_ms = 50;

    let (a, b) = tokio::join!(compiler_a.execute(&spec_a), compiler_b.execute(&spec_b));
    assert!(a.unwrap().is_success());
    assert!(b.unwrap().is_success());

    for observation in harness.observations() {
        let expected = if observation.label == "a" { work_a.path() } else { work_b.path() };
        assert_eq!(observation.process_dir, expected);
    }
    assert!(work_a.path().join("a.out").exists());
    assert!(work_b.path().join("b.out").exists());
    assert!(!work_a.path().join("b.out").exists());
    assert!(!work_b.path().join("a.out").exists());
    assert!(harness.pool.stats().live <= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_worker_runs_items_sequentially() {
    let harness = Harness::new(1);
    let work = tempfile::tempdir().unwrap();
    let compiler = Arc::new(harness.compiler(work.path()));

    let mut tasks = Vec::new();
    for label in ["first", "second"] {
        let compiler = Arc::clone(&compiler);
        tasks.push(tokio::spawn(async move {
            let mut spec = BuildSpec::new(label);
            spec.sleep_ms = 40;
            compiler.execute(&spec).await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }

    let mut observations = harness.observations();
    observations.sort_by_key(|o| o.started);
    assert_eq!(observations.len(), 2);
    assert!(observations[0].finished <= observations[1].started);
    assert_eq!(harness.pool.stats().live, 1);
}

#[tokio::test]
async fn test_compatible_requests_reuse_a_worker() {
    let harness = Harness::new(4);
    let requirements = ForkRequirements::new(harness.idle.path()).with_max_memory_mb(256);

    let first = harness
        .pool
        .acquire(WorkerProtocol::CompilerDaemon, &requirements)
        .await
        .unwrap();
    let first_id = first.id().to_string();
    assert!(first.requirements().is_compatible_with(&requirements));
    drop(first);

    let second = harness
        .pool
        .acquire(WorkerProtocol::CompilerDaemon, &requirements)
        .await
        .unwrap();
    assert_eq!(second.id(), first_id);
    assert!(second.requirements().is_compatible_with(&requirements));
    drop(second);

    let other_idle = tempfile::tempdir().unwrap();
    let incompatible = ForkRequirements::new(other_idle.path());
    let third = harness
        .pool
        .acquire(WorkerProtocol::CompilerDaemon, &incompatible)
        .await
        .unwrap();
    assert_ne!(third.id(), first_id);
    assert_eq!(third.idle_working_dir(), other_idle.path());
}

#[tokio::test]
async fn test_repeated_item_is_idempotent() {
    let harness = Harness::new(1);
    let work = tempfile::tempdir().unwrap();
    let compiler = harness.compiler(work.path());
    let spec = BuildSpec::new("same");

    let first = compiler.execute(&spec).await.unwrap();
    let second = compiler.execute(&spec).await.unwrap();
    assert_eq!(first.did_work, second.did_work);
    assert_eq!(first.is_success(), second.is_success());

    let mut failing = spec.clone();
    failing.fail_with = Some("boom".to_string());
    let first = compiler.execute(&failing).await.unwrap_err();
    let second = compiler.execute(&failing).await.unwrap_err();
    assert_eq!(first.failure(), second.failure());
}

#[tokio::test]
async fn test_missing_execution_directory_is_contained() {
    let harness = Harness::new(1);
    let work = tempfile::tempdir().unwrap();
    let compiler = harness.compiler(&work.path().join("gone"));

    let err = compiler.execute(&BuildSpec::new("x")).await.unwrap_err();
    assert_eq!(err.failure().map(|f| f.type_tag.as_str()), Some("ProcessDirError"));
    assert!(harness.observations().is_empty());
    assert_eq!(harness.parked_dir().await, harness.idle.path());
}

#[tokio::test]
async fn test_shutdown_pool_rejects_compiles() {
    let harness = Harness::new(1);
    let work = tempfile::tempdir().unwrap();
    let compiler = harness.compiler(work.path());

    compiler.execute(&BuildSpec::new("a")).await.unwrap();
    harness.pool.shutdown().await;

    let err = compiler.execute(&BuildSpec::new("b")).await.unwrap_err();
    assert!(matches!(err, ExecutionError::PoolClosed));
}
