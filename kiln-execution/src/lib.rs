//! Kiln daemon execution engine
//!
//! Runs compiler work in long-lived, reusable worker processes. A
//! [`DaemonCompiler`] derives the [`ForkRequirements`] of a request, borrows a
//! compatible worker from the [`WorkerPool`], ships a [`WorkItem`] across the
//! process boundary and turns the returned [`WorkResult`] back into a normal
//! return or an [`ExecutionError`].
//!
//! Inside the worker, [`CompilerDaemonServer`] roots the process at the item's
//! execution directory, runs the registered [`Compiler`], contains any failure
//! and parks the process back at its idle directory.

pub mod compiler;
pub mod daemon;
pub mod environment;
pub mod error;
pub mod pool;
pub mod provision;
pub mod requirements;
pub mod server;
pub mod worker;

// Re-export main types
pub use compiler::{CompileContext, CompileOutcome, Compiler, CompilerRegistry};
pub use daemon::{DaemonCompiler, ForkOptionsStrategy};
pub use environment::{
    NativeProcessEnvironment, ProcessDirScope, ProcessEnvironment, VirtualProcessEnvironment,
};
pub use error::ExecutionError;
pub use pool::{PoolSettings, PoolStats, WorkerFactory, WorkerHandle, WorkerLease, WorkerPool};
pub use provision::{InProcessProvisioner, ProcessProvisioner, WorkerProvisioner};
pub use requirements::ForkRequirements;
pub use server::{CompilerDaemonServer, WorkerServer};
pub use worker::{WorkerProcess, WorkerProcessStatus, WorkerStats};

// Re-export IPC types that appear in this crate's API
pub use kiln_ipc::{FailureDescriptor, WorkItem, WorkResult, WorkerProtocol, WorkerStatus};
