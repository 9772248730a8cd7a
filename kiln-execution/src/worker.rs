//! Coordinator-side handle to one worker

use chrono::{DateTime, Utc};
use kiln_ipc::{
    BoxedTransport, CoordinatorMessage, IpcError, IpcTransport, MessageEnvelope, WorkItem,
    WorkResult, WorkerMessage, WorkerProtocol, WorkerStatus,
};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::requirements::ForkRequirements;

/// Worker process status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerProcessStatus {
    Starting,
    Ready,
    Busy,
    /// The connection broke or a call timed out; the worker is not reused
    Failed,
    Stopped,
}

/// What actually runs the worker's request loop
pub(crate) enum WorkerBackend {
    Process(Child),
    InProcess(JoinHandle<Result<(), IpcError>>),
}

impl WorkerBackend {
    fn is_alive(&mut self) -> bool {
        match self {
            WorkerBackend::Process(child) => matches!(child.try_wait(), Ok(None)),
            WorkerBackend::InProcess(task) => !task.is_finished(),
        }
    }

    fn kill(&mut self) {
        match self {
            WorkerBackend::Process(child) => {
                if let Err(e) = child.start_kill() {
                    debug!("Failed to kill worker process: {}", e);
                }
            }
            WorkerBackend::InProcess(task) => task.abort(),
        }
    }

    async fn wait(&mut self) {
        match self {
            WorkerBackend::Process(child) => {
                if let Err(e) = child.wait().await {
                    debug!("Failed to reap worker process: {}", e);
                }
            }
            WorkerBackend::InProcess(task) => {
                let _ = task.await;
            }
        }
    }
}

/// Statistics about a worker
#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub worker_id: String,
    pub pid: Option<u32>,
    pub status: WorkerProcessStatus,
    pub items_executed: u64,
    pub items_failed: u64,
    pub uptime_seconds: i64,
    pub idle_for: Duration,
}

/// A single worker, connected and provisioned for fixed requirements.
///
/// Calls take `&mut self`, so one worker never has more than one item in
/// flight.
pub struct WorkerProcess {
    id: String,
    requirements: ForkRequirements,
    protocols: Vec<WorkerProtocol>,
    pid: Option<u32>,
    transport: BoxedTransport,
    backend: WorkerBackend,
    started_at: DateTime<Utc>,
    last_used: Instant,
    items_executed: u64,
    items_failed: u64,
    status: WorkerProcessStatus,
    call_timeout: Option<Duration>,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("status", &self.status)
            .field("requirements", &self.requirements)
            .finish()
    }
}

impl WorkerProcess {
    pub(crate) fn new(
        id: String,
        requirements: ForkRequirements,
        transport: BoxedTransport,
        backend: WorkerBackend,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            requirements,
            protocols: Vec::new(),
            pid: None,
            transport,
            backend,
            started_at: Utc::now(),
            last_used: Instant::now(),
            items_executed: 0,
            items_failed: 0,
            status: WorkerProcessStatus::Starting,
            call_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Requirements the worker was provisioned with
    pub fn requirements(&self) -> &ForkRequirements {
        &self.requirements
    }

    pub fn idle_working_dir(&self) -> &Path {
        self.requirements.idle_working_dir()
    }

    pub fn status(&self) -> WorkerProcessStatus {
        self.status
    }

    pub fn supports(&self, protocol: WorkerProtocol) -> bool {
        self.protocols.contains(&protocol)
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Whether the worker can take another item
    pub fn is_healthy(&mut self) -> bool {
        match self.status {
            WorkerProcessStatus::Ready => {
                if self.backend.is_alive() {
                    true
                } else {
                    warn!(worker_id = %self.id, "Worker exited unexpectedly");
                    self.status = WorkerProcessStatus::Failed;
                    false
                }
            }
            _ => false,
        }
    }

    /// Wait for the worker to announce itself
    pub(crate) async fn handshake(
        &mut self,
        protocol: WorkerProtocol,
        startup_timeout: Duration,
    ) -> Result<(), ExecutionError> {
        let ready = tokio::time::timeout(
            startup_timeout,
            self.transport.receive::<CoordinatorMessage>(),
        )
        .await;

        let envelope = match ready {
            Ok(Ok(envelope)) => envelope,
            Ok(Err(e)) => {
                self.fail();
                return Err(ExecutionError::Provisioning {
                    message: format!("Worker {} failed during startup: {}", self.id, e),
                });
            }
            Err(_) => {
                self.fail();
                return Err(ExecutionError::Provisioning {
                    message: format!(
                        "Worker {} did not report ready within {:?}",
                        self.id, startup_timeout
                    ),
                });
            }
        };

        match envelope.message {
            CoordinatorMessage::Ready {
                worker_id,
                pid,
                protocols,
            } => {
                if !protocols.contains(&protocol) {
                    self.fail();
                    return Err(ExecutionError::Provisioning {
                        message: format!("Worker {} does not serve the {} protocol", worker_id, protocol),
                    });
                }
                info!(worker_id = %worker_id, pid, "Worker started");
                self.pid = Some(pid);
                self.protocols = protocols;
                self.status = WorkerProcessStatus::Ready;
                Ok(())
            }
            other => {
                self.fail();
                Err(ExecutionError::Provisioning {
                    message: format!("Worker {} sent {:?} before ready", self.id, other),
                })
            }
        }
    }

    /// Run one item in the worker and wait for its result.
    ///
    /// A failed item is still an `Ok` here; only boundary problems are errors.
    pub async fn execute(&mut self, item: WorkItem) -> Result<WorkResult, ExecutionError> {
        let correlation_id = Uuid::new_v4();
        debug!(worker_id = %self.id, item = %item.display_name, %correlation_id, "Sending work item");

        let message = WorkerMessage::Execute {
            correlation_id,
            protocol: WorkerProtocol::CompilerDaemon,
            item,
        };

        match self.call(correlation_id, message).await? {
            CoordinatorMessage::WorkResult { result, .. } => {
                self.items_executed += 1;
                if !result.is_success() {
                    self.items_failed += 1;
                }
                Ok(result)
            }
            CoordinatorMessage::Error { error, .. } => Err(ExecutionError::Worker {
                worker_id: self.id.clone(),
                error,
            }),
            other => Err(self.unexpected(other)),
        }
    }

    /// Ask the worker for its status
    pub async fn ping(&mut self) -> Result<WorkerStatus, ExecutionError> {
        let correlation_id = Uuid::new_v4();
        match self.call(correlation_id, WorkerMessage::Ping { correlation_id }).await? {
            CoordinatorMessage::Pong { status, .. } => Ok(status),
            other => Err(self.unexpected(other)),
        }
    }

    /// Ask the worker to exit and wait for it, killing it if it lingers
    pub async fn shutdown(mut self, grace: Duration) {
        debug!(worker_id = %self.id, "Stopping worker");
        if self.status != WorkerProcessStatus::Failed {
            let _ = self
                .transport
                .send(&MessageEnvelope::new(WorkerMessage::Shutdown))
                .await;
        }
        let _ = self.transport.close().await;

        if tokio::time::timeout(grace, self.backend.wait()).await.is_err() {
            warn!(worker_id = %self.id, "Worker did not stop within {:?}, killing it", grace);
            self.backend.kill();
        }
        self.status = WorkerProcessStatus::Stopped;
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            worker_id: self.id.clone(),
            pid: self.pid,
            status: self.status,
            items_executed: self.items_executed,
            items_failed: self.items_failed,
            uptime_seconds: Utc::now().signed_duration_since(self.started_at).num_seconds(),
            idle_for: self.last_used.elapsed(),
        }
    }

    async fn call(
        &mut self,
        correlation_id: Uuid,
        message: WorkerMessage,
    ) -> Result<CoordinatorMessage, ExecutionError> {
        if self.status != WorkerProcessStatus::Ready {
            return Err(ExecutionError::Transport {
                worker_id: self.id.clone(),
                source: IpcError::NotConnected,
            });
        }
        self.status = WorkerProcessStatus::Busy;

        let exchange = round_trip(&mut self.transport, message);
        let reply = match self.call_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, exchange).await {
                Ok(reply) => reply,
                Err(_) => {
                    warn!(worker_id = %self.id, "Worker call timed out after {:?}", timeout);
                    self.fail();
                    return Err(ExecutionError::Timeout {
                        worker_id: self.id.clone(),
                        timeout,
                    });
                }
            },
            None => exchange.await,
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(source) if source.is_connection_lost() => {
                warn!(worker_id = %self.id, "Lost connection to worker: {}", source);
                self.fail();
                return Err(ExecutionError::Transport {
                    worker_id: self.id.clone(),
                    source,
                });
            }
            Err(source) => {
                warn!(worker_id = %self.id, "Unreadable reply from worker: {}", source);
                self.fail();
                return Err(ExecutionError::UnexpectedResponse {
                    worker_id: self.id.clone(),
                    message: source.to_string(),
                });
            }
        };

        let reply_id = match &reply {
            CoordinatorMessage::WorkResult { correlation_id, .. }
            | CoordinatorMessage::Pong { correlation_id, .. } => Some(*correlation_id),
            CoordinatorMessage::Error { correlation_id, .. } => *correlation_id,
            CoordinatorMessage::Ready { .. } => None,
        };
        if reply_id.is_some_and(|id| id != correlation_id) {
            self.fail();
            return Err(ExecutionError::UnexpectedResponse {
                worker_id: self.id.clone(),
                message: format!("reply for {:?} while waiting for {}", reply_id, correlation_id),
            });
        }

        self.status = WorkerProcessStatus::Ready;
        self.touch();
        Ok(reply)
    }

    fn unexpected(&mut self, reply: CoordinatorMessage) -> ExecutionError {
        self.fail();
        ExecutionError::UnexpectedResponse {
            worker_id: self.id.clone(),
            message: format!("{:?}", reply),
        }
    }

    fn fail(&mut self) {
        self.status = WorkerProcessStatus::Failed;
        self.backend.kill();
    }
}

async fn round_trip(
    transport: &mut BoxedTransport,
    message: WorkerMessage,
) -> Result<CoordinatorMessage, IpcError> {
    transport.send(&MessageEnvelope::new(message)).await?;
    let envelope = transport.receive::<CoordinatorMessage>().await?;
    Ok(envelope.message)
}
