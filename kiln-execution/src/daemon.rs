//! Coordinator-side entry point: run a compile spec in a daemon worker

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use kiln_ipc::{WorkItem, WorkResult, WorkerProtocol};

use crate::error::ExecutionError;
use crate::pool::WorkerFactory;
use crate::requirements::ForkRequirements;

/// Derives the worker requirements a compile spec needs
pub trait ForkOptionsStrategy<S>: Send + Sync {
    fn requirements_for(&self, spec: &S) -> ForkRequirements;
}

impl<S, F> ForkOptionsStrategy<S> for F
where
    F: Fn(&S) -> ForkRequirements + Send + Sync,
{
    fn requirements_for(&self, spec: &S) -> ForkRequirements {
        self(spec)
    }
}

/// Runs specs of type `S` through the named compiler inside pooled workers.
///
/// The executor holds no per-call state, so one instance can serve any
/// number of concurrent callers.
pub struct DaemonCompiler<S> {
    compiler: String,
    execution_working_dir: PathBuf,
    factory: Arc<dyn WorkerFactory>,
    fork_options: Box<dyn ForkOptionsStrategy<S>>,
}

impl<S: Serialize> DaemonCompiler<S> {
    pub fn new(
        compiler: impl Into<String>,
        execution_working_dir: impl Into<PathBuf>,
        factory: Arc<dyn WorkerFactory>,
        fork_options: impl ForkOptionsStrategy<S> + 'static,
    ) -> Self {
        Self {
            compiler: compiler.into(),
            execution_working_dir: execution_working_dir.into(),
            factory,
            fork_options: Box::new(fork_options),
        }
    }

    pub fn compiler(&self) -> &str {
        &self.compiler
    }

    pub fn execution_working_dir(&self) -> &Path {
        &self.execution_working_dir
    }

    /// Run `spec` in a compatible worker.
    ///
    /// A successful result is returned unchanged; a failed one becomes
    /// [`ExecutionError::WorkFailed`] carrying the worker's failure as its
    /// source. Nothing is retried.
    pub async fn execute(&self, spec: &S) -> Result<WorkResult, ExecutionError> {
        let requirements = self.fork_options.requirements_for(spec);
        let spec = serde_json::to_value(spec).map_err(|e| ExecutionError::InvalidSpec(e.to_string()))?;

        let mut worker = self
            .factory
            .get_worker(WorkerProtocol::CompilerDaemon, &requirements)
            .await?;
        debug!(worker_id = %worker.id(), compiler = %self.compiler, "Acquired worker");

        let item = WorkItem::new(
            self.compiler.clone(),
            spec,
            self.execution_working_dir.clone(),
            worker.idle_working_dir(),
        );
        let display_name = item.display_name.clone();

        let result = worker.execute(item).await?;
        match result.failure {
            None => {
                info!(compiler = %display_name, did_work = result.did_work, "Compilation finished");
                Ok(result)
            }
            Some(cause) => Err(ExecutionError::WorkFailed { display_name, cause }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::WorkerHandle;
    use async_trait::async_trait;
    use kiln_ipc::FailureDescriptor;
    use std::sync::Mutex;

    #[derive(Serialize)]
    struct JavaSpec {
        sources: Vec<String>,
        heap_mb: u64,
    }

    /// Answers every item with a canned result and records what it saw
    struct CannedHandle {
        requirements: ForkRequirements,
        result: WorkResult,
        seen: Arc<Mutex<Vec<WorkItem>>>,
    }

    #[async_trait]
    impl WorkerHandle for CannedHandle {
        fn id(&self) -> &str {
            "canned"
        }

        fn requirements(&self) -> &ForkRequirements {
            &self.requirements
        }

        async fn execute(&mut self, item: WorkItem) -> Result<WorkResult, ExecutionError> {
            self.seen.lock().unwrap().push(item);
            Ok(self.result.clone())
        }
    }

    struct CannedFactory {
        result: WorkResult,
        requested: Mutex<Vec<ForkRequirements>>,
        seen: Arc<Mutex<Vec<WorkItem>>>,
    }

    impl CannedFactory {
        fn new(result: WorkResult) -> Arc<Self> {
            Arc::new(Self {
                result,
                requested: Mutex::new(Vec::new()),
                seen: Arc::new(Mutex::new(Vec::new())),
            })
        }
    }

    #[async_trait]
    impl WorkerFactory for CannedFactory {
        async fn get_worker(
            &self,
            protocol: WorkerProtocol,
            requirements: &ForkRequirements,
        ) -> Result<Box<dyn WorkerHandle>, ExecutionError> {
            assert_eq!(protocol, WorkerProtocol::CompilerDaemon);
            self.requested.lock().unwrap().push(requirements.clone());
            Ok(Box::new(CannedHandle {
                requirements: requirements.clone(),
                result: self.result.clone(),
                seen: Arc::clone(&self.seen),
            }))
        }
    }

    fn javac(factory: Arc<CannedFactory>) -> DaemonCompiler<JavaSpec> {
        DaemonCompiler::new("javac", "/work/project", factory, |spec: &JavaSpec| {
            ForkRequirements::new("/var/kiln/idle").with_max_memory_mb(spec.heap_mb)
        })
    }

    fn spec() -> JavaSpec {
        JavaSpec {
            sources: vec!["Main.java".to_string()],
            heap_mb: 512,
        }
    }

    #[tokio::test]
    async fn test_success_is_returned_unchanged() {
        let factory = CannedFactory::new(WorkResult::success(false));
        let compiler = javac(factory.clone());

        let result = compiler.execute(&spec()).await.unwrap();
        assert_eq!(result, WorkResult::success(false));

        let requested = factory.requested.lock().unwrap();
        assert_eq!(requested[0].max_memory_mb(), Some(512));

        let seen = factory.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].compiler, "javac");
        assert_eq!(seen[0].display_name, "javac");
        assert_eq!(seen[0].execution_working_dir, PathBuf::from("/work/project"));
        assert_eq!(seen[0].idle_working_dir, PathBuf::from("/var/kiln/idle"));
        assert_eq!(seen[0].spec["sources"][0], "Main.java");
    }

    #[tokio::test]
    async fn test_failure_is_raised_with_cause() {
        let cause = FailureDescriptor::new("OutOfMemory", "Java heap space");
        let factory = CannedFactory::new(WorkResult::failed(cause.clone()));
        let compiler = javac(factory);

        let err = compiler.execute(&spec()).await.unwrap_err();
        assert!(!err.is_transport_failure());
        assert_eq!(err.failure(), Some(&cause));
        assert_eq!(err.to_string(), "javac failed: OutOfMemory: Java heap space");
    }

    #[tokio::test]
    async fn test_unserializable_spec_acquires_no_worker() {
        struct Unserializable;

        impl Serialize for Unserializable {
            fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("spec holds a live handle"))
            }
        }

        let factory = CannedFactory::new(WorkResult::success(true));
        let compiler = DaemonCompiler::new("javac", "/work", factory.clone(), |_: &Unserializable| {
            ForkRequirements::new("/idle")
        });

        let err = compiler.execute(&Unserializable).await.unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidSpec(_)));
        assert!(factory.requested.lock().unwrap().is_empty());
    }
}
