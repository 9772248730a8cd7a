//! Starting new workers

use async_trait::async_trait;
use kiln_config::WorkerPoolConfig;
use kiln_ipc::{ChildProcessTransport, JsonLinesTransport, WorkerProtocol};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::compiler::CompilerRegistry;
use crate::environment::VirtualProcessEnvironment;
use crate::error::ExecutionError;
use crate::requirements::ForkRequirements;
use crate::server::WorkerServer;
use crate::worker::{WorkerBackend, WorkerProcess};

/// Environment variable carrying the worker's classpath
pub const WORKER_CLASSPATH_ENV: &str = "KILN_WORKER_CLASSPATH";

/// Environment variable carrying the worker's memory bound in megabytes
pub const WORKER_MAX_MEMORY_ENV: &str = "KILN_WORKER_MAX_MEMORY_MB";

/// Size of the in-memory pipe between coordinator and in-process worker
const IN_PROCESS_PIPE_CAPACITY: usize = 64 * 1024;

/// Starts an isolated worker satisfying some requirements
#[async_trait]
pub trait WorkerProvisioner: Send + Sync {
    /// Start a worker and wait until it is ready to serve `protocol`
    async fn provision(
        &self,
        worker_id: &str,
        protocol: WorkerProtocol,
        requirements: &ForkRequirements,
    ) -> Result<WorkerProcess, ExecutionError>;
}

/// Launches each worker as a child process of the coordinator
#[derive(Debug, Clone)]
pub struct ProcessProvisioner {
    program: PathBuf,
    startup_timeout: Duration,
    call_timeout: Option<Duration>,
}

impl ProcessProvisioner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            startup_timeout: Duration::from_secs(30),
            call_timeout: None,
        }
    }

    /// Use the configured worker program, or the running executable
    pub fn from_config(config: &WorkerPoolConfig) -> Result<Self, ExecutionError> {
        let program = match &config.worker_program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(|e| {
                ExecutionError::ConfigurationError(format!("Cannot locate the worker program: {}", e))
            })?,
        };
        Ok(Self::new(program)
            .with_startup_timeout(config.startup_timeout)
            .with_call_timeout(config.call_timeout))
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    fn command(&self, worker_id: &str, requirements: &ForkRequirements) -> Result<Command, ExecutionError> {
        let classpath = std::env::join_paths(requirements.classpath()).map_err(|e| {
            ExecutionError::Provisioning {
                message: format!("Invalid classpath entry: {}", e),
            }
        })?;

        let mut command = Command::new(&self.program);
        command
            .args(requirements.launch_args())
            .arg("--worker")
            .arg("--worker-id")
            .arg(worker_id)
            .envs(requirements.env())
            .env(WORKER_CLASSPATH_ENV, classpath)
            .current_dir(requirements.idle_working_dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if let Some(memory) = requirements.max_memory_mb() {
            command.env(WORKER_MAX_MEMORY_ENV, memory.to_string());
        }

        Ok(command)
    }
}

#[async_trait]
impl WorkerProvisioner for ProcessProvisioner {
    async fn provision(
        &self,
        worker_id: &str,
        protocol: WorkerProtocol,
        requirements: &ForkRequirements,
    ) -> Result<WorkerProcess, ExecutionError> {
        debug!(worker_id, program = %self.program.display(), "Spawning worker process");

        let mut child = self.command(worker_id, requirements)?.spawn().map_err(|e| {
            ExecutionError::Provisioning {
                message: format!("Failed to spawn {}: {}", self.program.display(), e),
            }
        })?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                return Err(ExecutionError::Provisioning {
                    message: format!("Worker {} has no stdio pipes", worker_id),
                })
            }
        };

        let mut worker = WorkerProcess::new(
            worker_id.to_string(),
            requirements.clone(),
            ChildProcessTransport::for_child(stdin, stdout).boxed(),
            WorkerBackend::Process(child),
            self.call_timeout,
        );
        worker.handshake(protocol, self.startup_timeout).await?;

        info!(worker_id, pid = ?worker.pid(), "Worker process provisioned");
        Ok(worker)
    }
}

/// Runs each worker as a task inside the coordinator.
///
/// Workers speak the same wire protocol over an in-memory pipe and get a
/// virtual process directory each, so they never touch the coordinator's own.
#[derive(Debug, Clone)]
pub struct InProcessProvisioner {
    registry: CompilerRegistry,
    startup_timeout: Duration,
    call_timeout: Option<Duration>,
}

impl InProcessProvisioner {
    pub fn new(registry: CompilerRegistry) -> Self {
        Self {
            registry,
            startup_timeout: Duration::from_secs(30),
            call_timeout: None,
        }
    }

    pub fn from_config(config: &WorkerPoolConfig, registry: CompilerRegistry) -> Self {
        Self::new(registry)
            .with_startup_timeout(config.startup_timeout)
            .with_call_timeout(config.call_timeout)
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }
}

#[async_trait]
impl WorkerProvisioner for InProcessProvisioner {
    async fn provision(
        &self,
        worker_id: &str,
        protocol: WorkerProtocol,
        requirements: &ForkRequirements,
    ) -> Result<WorkerProcess, ExecutionError> {
        let idle_dir = requirements.idle_working_dir();
        if !idle_dir.is_dir() {
            return Err(ExecutionError::Provisioning {
                message: format!("Idle working directory {} does not exist", idle_dir.display()),
            });
        }

        let (coordinator, worker) = tokio::io::duplex(IN_PROCESS_PIPE_CAPACITY);
        let environment = Arc::new(VirtualProcessEnvironment::new(idle_dir));
        let server = WorkerServer::new(worker_id, self.registry.clone(), environment);

        let task = tokio::spawn(async move {
            let (read, write) = tokio::io::split(worker);
            let mut transport = JsonLinesTransport::new(read, write);
            server.serve(&mut transport).await
        });

        let (read, write) = tokio::io::split(coordinator);
        let mut worker = WorkerProcess::new(
            worker_id.to_string(),
            requirements.clone(),
            JsonLinesTransport::new(read, write).boxed(),
            WorkerBackend::InProcess(task),
            self.call_timeout,
        );
        worker.handshake(protocol, self.startup_timeout).await?;

        debug!(worker_id, "In-process worker provisioned");
        Ok(worker)
    }
}
