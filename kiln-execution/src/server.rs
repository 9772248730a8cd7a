//! Worker-side request handling

use kiln_ipc::{
    CoordinatorMessage, FailureDescriptor, IpcError, IpcTransport, MessageEnvelope, WorkItem,
    WorkResult, WorkerError, WorkerMessage, WorkerProtocol, WorkerStatus,
};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::compiler::{CompileContext, CompileOutcome, CompilerRegistry};
use crate::environment::{ProcessDirScope, ProcessEnvironment};

/// Protocols served by [`WorkerServer`]
pub const SUPPORTED_PROTOCOLS: &[WorkerProtocol] = &[WorkerProtocol::CompilerDaemon];

/// Runs one work item inside the worker.
///
/// The handler never lets a failure escape: whatever the compiler does, the
/// caller receives a [`WorkResult`], and the process directory is back at the
/// item's idle directory by the time it does.
pub struct CompilerDaemonServer {
    worker_id: String,
    registry: CompilerRegistry,
    environment: Arc<dyn ProcessEnvironment>,
}

impl CompilerDaemonServer {
    pub fn new(
        worker_id: impl Into<String>,
        registry: CompilerRegistry,
        environment: Arc<dyn ProcessEnvironment>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            registry,
            environment,
        }
    }

    pub fn environment(&self) -> &Arc<dyn ProcessEnvironment> {
        &self.environment
    }

    pub fn execute(&self, item: &WorkItem) -> WorkResult {
        let scope = ProcessDirScope::new(self.environment.as_ref(), &item.idle_working_dir);

        let outcome = scope
            .enter(&item.execution_working_dir)
            .map_err(|e| {
                FailureDescriptor::new(
                    "ProcessDirError",
                    format!(
                        "Cannot switch process directory to {}",
                        item.execution_working_dir.display()
                    ),
                )
                .with_cause(FailureDescriptor::from_dyn_error(&e))
            })
            .and_then(|()| self.compile(item));

        // Park the process before reporting back
        drop(scope);

        match outcome {
            Ok(outcome) => {
                debug!(item = %item.display_name, did_work = outcome.did_work, "Work item succeeded");
                WorkResult::success(outcome.did_work)
            }
            Err(failure) => {
                warn!(item = %item.display_name, "Work item failed: {}", failure);
                WorkResult::failed(failure)
            }
        }
    }

    fn compile(&self, item: &WorkItem) -> Result<CompileOutcome, FailureDescriptor> {
        let compiler = self.registry.get(&item.compiler).ok_or_else(|| {
            FailureDescriptor::new(
                "UnknownCompiler",
                format!("No compiler registered under '{}'", item.compiler),
            )
        })?;

        let context = CompileContext::new(
            &self.worker_id,
            &item.execution_working_dir,
            self.environment.as_ref(),
        );

        panic::catch_unwind(AssertUnwindSafe(|| {
            compiler.execute_json(item.spec.clone(), &context)
        }))
        .unwrap_or_else(|payload| Err(FailureDescriptor::from_panic(payload.as_ref())))
    }
}

/// Request loop of a worker: answers coordinator messages until EOF or shutdown
pub struct WorkerServer {
    daemon: Arc<CompilerDaemonServer>,
    status: WorkerStatus,
    protocols: Vec<WorkerProtocol>,
}

impl WorkerServer {
    pub fn new(
        worker_id: impl Into<String>,
        registry: CompilerRegistry,
        environment: Arc<dyn ProcessEnvironment>,
    ) -> Self {
        let worker_id = worker_id.into();
        Self {
            status: WorkerStatus::new(worker_id.clone(), std::process::id()),
            daemon: Arc::new(CompilerDaemonServer::new(worker_id, registry, environment)),
            protocols: SUPPORTED_PROTOCOLS.to_vec(),
        }
    }

    /// Restrict the protocols announced and served
    pub fn with_protocols(mut self, protocols: Vec<WorkerProtocol>) -> Self {
        self.protocols = protocols;
        self
    }

    /// Serve requests from `transport` until the coordinator hangs up
    pub async fn serve<T: IpcTransport>(mut self, transport: &mut T) -> Result<(), IpcError> {
        let worker_id = self.status.worker_id.clone();
        info!(worker_id = %worker_id, "Worker ready");

        transport
            .send(&MessageEnvelope::new(CoordinatorMessage::Ready {
                worker_id: worker_id.clone(),
                pid: self.status.pid,
                protocols: self.protocols.clone(),
            }))
            .await?;

        loop {
            let envelope = match transport.receive::<WorkerMessage>().await {
                Ok(envelope) => envelope,
                Err(IpcError::ConnectionClosed) => {
                    info!(worker_id = %worker_id, "Coordinator closed the connection, shutting down");
                    break;
                }
                // An unreadable line is answered and skipped; a broken pipe ends the worker
                Err(e) => match e.rejection() {
                    Some(rejection) => {
                        error!(worker_id = %worker_id, "Rejecting request: {}", e);
                        self.reply_error(transport, None, rejection).await?;
                        continue;
                    }
                    None => return Err(e),
                },
            };

            let reply = match envelope.message {
                WorkerMessage::Execute {
                    correlation_id,
                    protocol,
                    item,
                } => {
                    if !self.protocols.contains(&protocol) {
                        CoordinatorMessage::Error {
                            correlation_id: Some(correlation_id),
                            error: WorkerError::UnsupportedProtocol { protocol },
                        }
                    } else {
                        let result = self.execute(item).await;
                        self.status.record_execution(result.is_success());
                        CoordinatorMessage::WorkResult {
                            correlation_id,
                            result,
                        }
                    }
                }
                WorkerMessage::Ping { correlation_id } => {
                    debug!(worker_id = %worker_id, "Worker received ping");
                    let mut status = self.status.clone();
                    status.process_dir = self.daemon.environment().process_dir().ok();
                    CoordinatorMessage::Pong {
                        correlation_id,
                        worker_id: worker_id.clone(),
                        status,
                    }
                }
                WorkerMessage::Shutdown => {
                    info!(worker_id = %worker_id, "Worker received shutdown signal");
                    break;
                }
            };

            transport.send(&MessageEnvelope::new(reply)).await?;
        }

        transport.close().await?;
        Ok(())
    }

    async fn execute(&self, item: WorkItem) -> WorkResult {
        info!(item = %item.display_name, dir = %item.execution_working_dir.display(), "Executing work item");
        let daemon = Arc::clone(&self.daemon);

        // Compilers block, so keep them off the thread driving the transport
        match tokio::task::spawn_blocking(move || daemon.execute(&item)).await {
            Ok(result) => result,
            Err(e) => WorkResult::failed(FailureDescriptor::new(
                "WorkerTaskError",
                format!("Work item task did not complete: {}", e),
            )),
        }
    }

    async fn reply_error<T: IpcTransport>(
        &self,
        transport: &mut T,
        correlation_id: Option<uuid::Uuid>,
        error: WorkerError,
    ) -> Result<(), IpcError> {
        transport
            .send(&MessageEnvelope::new(CoordinatorMessage::Error {
                correlation_id,
                error,
            }))
            .await
    }
}
