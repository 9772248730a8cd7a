//! Compilers run inside workers, and the registry that names them
//!
//! A compiler cannot be shipped across a process boundary, so work items
//! name the compiler they need and each worker resolves that name in its own
//! [`CompilerRegistry`].

use kiln_ipc::FailureDescriptor;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::environment::ProcessEnvironment;

/// What a compiler reports back after a successful run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOutcome {
    pub did_work: bool,
}

impl CompileOutcome {
    /// Outputs were produced or changed
    pub fn did_work() -> Self {
        Self { did_work: true }
    }

    /// Nothing needed doing
    pub fn up_to_date() -> Self {
        Self { did_work: false }
    }
}

/// What a compiler can see of the worker it runs in
pub struct CompileContext<'a> {
    worker_id: &'a str,
    working_dir: &'a Path,
    environment: &'a dyn ProcessEnvironment,
}

impl<'a> CompileContext<'a> {
    pub fn new(worker_id: &'a str, working_dir: &'a Path, environment: &'a dyn ProcessEnvironment) -> Self {
        Self {
            worker_id,
            working_dir,
            environment,
        }
    }

    pub fn worker_id(&self) -> &str {
        self.worker_id
    }

    /// The execution directory requested by the caller
    pub fn working_dir(&self) -> &Path {
        self.working_dir
    }

    /// The process directory as the worker sees it right now
    pub fn process_dir(&self) -> io::Result<PathBuf> {
        self.environment.process_dir()
    }

    /// Resolve `path` against the process directory
    pub fn resolve(&self, path: impl AsRef<Path>) -> io::Result<PathBuf> {
        let path = path.as_ref();
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(self.process_dir()?.join(path))
        }
    }
}

/// Compiler logic executed inside a worker
pub trait Compiler: Send + Sync + 'static {
    /// Specification the coordinator serialized into the work item
    type Spec: DeserializeOwned;

    type Error: std::error::Error + Send + Sync + 'static;

    fn execute(&self, spec: Self::Spec, context: &CompileContext<'_>) -> Result<CompileOutcome, Self::Error>;
}

/// Object-safe view of a [`Compiler`] with failures already described
pub(crate) trait DynCompiler: Send + Sync {
    fn execute_json(&self, spec: JsonValue, context: &CompileContext<'_>) -> Result<CompileOutcome, FailureDescriptor>;
}

impl<C: Compiler> DynCompiler for C {
    fn execute_json(&self, spec: JsonValue, context: &CompileContext<'_>) -> Result<CompileOutcome, FailureDescriptor> {
        let spec: C::Spec = serde_json::from_value(spec).map_err(|e| {
            FailureDescriptor::new("InvalidSpec", format!("Cannot read compile spec: {}", e))
        })?;
        self.execute(spec, context)
            .map_err(|e| FailureDescriptor::from_error(&e))
    }
}

/// Named compilers available inside a worker
#[derive(Clone, Default)]
pub struct CompilerRegistry {
    compilers: HashMap<String, Arc<dyn DynCompiler>>,
}

impl CompilerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a compiler under `name`, replacing any previous registration
    pub fn register<C: Compiler>(&mut self, name: impl Into<String>, compiler: C) {
        self.compilers.insert(name.into(), Arc::new(compiler));
    }

    /// Builder-style [`CompilerRegistry::register`]
    pub fn with<C: Compiler>(mut self, name: impl Into<String>, compiler: C) -> Self {
        self.register(name, compiler);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.compilers.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.compilers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn DynCompiler>> {
        self.compilers.get(name).cloned()
    }
}

impl fmt::Debug for CompilerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilerRegistry")
            .field("compilers", &self.names())
            .finish()
    }
}
