//! Compilers built into the kiln binary

use kiln_execution::{CompileContext, CompileOutcome, Compiler, CompilerRegistry};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::io;
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, info};

/// Registry served by every kiln worker
pub fn builtin_registry() -> CompilerRegistry {
    CompilerRegistry::new()
        .with("command", CommandCompiler)
        .with("noop", NoopCompiler)
}

/// Spec of the `command` compiler
#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to start {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
}

/// Runs an external program in the process directory.
///
/// The program's stdout is captured and logged; worker stdout belongs to the
/// IPC channel.
pub struct CommandCompiler;

impl Compiler for CommandCompiler {
    type Spec = CommandSpec;
    type Error = CommandError;

    fn execute(&self, spec: CommandSpec, context: &CompileContext<'_>) -> Result<CompileOutcome, CommandError> {
        let spawn_error = |source: io::Error| CommandError::Spawn {
            program: spec.program.clone(),
            source,
        };
        let dir = context.process_dir().map_err(spawn_error)?;
        debug!(worker_id = context.worker_id(), program = %spec.program, dir = %dir.display(), "Running command");

        let output = Command::new(&spec.program)
            .args(&spec.args)
            .envs(&spec.env)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .output()
            .map_err(spawn_error)?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!(program = %spec.program, "{}", line);
        }

        if !output.status.success() {
            return Err(CommandError::Failed {
                program: spec.program,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(CompileOutcome::did_work())
    }
}

/// Does nothing and reports that nothing needed doing
pub struct NoopCompiler;

impl Compiler for NoopCompiler {
    type Spec = JsonValue;
    type Error = std::convert::Infallible;

    fn execute(&self, _spec: JsonValue, _context: &CompileContext<'_>) -> Result<CompileOutcome, Self::Error> {
        Ok(CompileOutcome::up_to_date())
    }
}
