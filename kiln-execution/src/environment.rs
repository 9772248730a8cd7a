//! The process-wide working directory of a worker
//!
//! Compilers resolve relative paths against the process directory, so a
//! worker has to root itself at each item's execution directory and park
//! itself back at the idle directory afterwards. The directory is shared by
//! every item the worker ever runs; [`ProcessDirScope`] is the only way the
//! protocol handler touches it.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Access to the process-wide working directory
pub trait ProcessEnvironment: Send + Sync {
    /// Current process directory
    fn process_dir(&self) -> io::Result<PathBuf>;

    /// Change the process directory
    fn set_process_dir(&self, dir: &Path) -> io::Result<()>;
}

/// The real working directory of the current OS process
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeProcessEnvironment;

impl ProcessEnvironment for NativeProcessEnvironment {
    fn process_dir(&self) -> io::Result<PathBuf> {
        std::env::current_dir()
    }

    fn set_process_dir(&self, dir: &Path) -> io::Result<()> {
        std::env::set_current_dir(dir)
    }
}

/// A working directory held in memory.
///
/// Used by in-process workers, which share one OS process and so cannot each
/// own the real working directory.
#[derive(Debug)]
pub struct VirtualProcessEnvironment {
    dir: Mutex<PathBuf>,
}

impl VirtualProcessEnvironment {
    pub fn new(initial_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Mutex::new(initial_dir.into()),
        }
    }
}

impl ProcessEnvironment for VirtualProcessEnvironment {
    fn process_dir(&self) -> io::Result<PathBuf> {
        Ok(self.dir.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn set_process_dir(&self, dir: &Path) -> io::Result<()> {
        // Mirror the native behaviour for missing directories
        if !dir.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", dir.display()),
            ));
        }
        *self.dir.lock().unwrap_or_else(PoisonError::into_inner) = dir.to_path_buf();
        Ok(())
    }
}

/// Scoped use of the process directory.
///
/// Dropping the scope parks the process at the idle directory again, whether
/// the work in between returned, failed or panicked.
pub struct ProcessDirScope<'a> {
    environment: &'a dyn ProcessEnvironment,
    idle_dir: &'a Path,
}

impl<'a> ProcessDirScope<'a> {
    pub fn new(environment: &'a dyn ProcessEnvironment, idle_dir: &'a Path) -> Self {
        Self {
            environment,
            idle_dir,
        }
    }

    /// Root the process at `dir` for the rest of the scope
    pub fn enter(&self, dir: &Path) -> io::Result<()> {
        debug!(dir = %dir.display(), "Switching process directory");
        self.environment.set_process_dir(dir)
    }
}

impl Drop for ProcessDirScope<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.environment.set_process_dir(self.idle_dir) {
            warn!(
                idle_dir = %self.idle_dir.display(),
                "Failed to restore idle process directory: {}", e
            );
        }
    }
}
