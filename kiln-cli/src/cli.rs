//! CLI argument parsing definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Run as worker process (internal use)
    #[arg(long, hide = true)]
    pub worker: bool,

    /// Worker ID (used with --worker)
    #[arg(long, value_name = "ID", hide = true)]
    pub worker_id: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one compile spec in a daemon worker
    Run {
        /// Registered compiler to run (command, noop)
        #[arg(long, value_name = "NAME")]
        compiler: String,

        /// JSON file holding the compile spec
        #[arg(long, value_name = "FILE")]
        spec: PathBuf,

        /// Directory the compiler runs in (default: current directory)
        #[arg(long, value_name = "DIR")]
        working_dir: Option<PathBuf>,

        /// Directory workers are parked at between items (default: system temp dir)
        #[arg(long, value_name = "DIR")]
        idle_dir: Option<PathBuf>,

        /// Classpath entry the worker must provide (repeatable)
        #[arg(long, value_name = "PATH")]
        classpath: Vec<PathBuf>,

        /// Option passed to the worker program before its worker flags (repeatable)
        #[arg(long, value_name = "ARG", allow_hyphen_values = true)]
        launch_arg: Vec<String>,

        /// Memory bound the worker must honour, in megabytes
        #[arg(long, value_name = "MB")]
        max_memory_mb: Option<u64>,
    },

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        config_cmd: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(long, value_name = "PATH")]
        config_file: PathBuf,
    },

    /// Write a sample configuration file with every default spelled out
    Generate {
        /// Output file path
        #[arg(long, value_name = "PATH")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },

    /// Show current configuration in use
    Show {
        /// Output format: yaml, json
        #[arg(long, value_name = "FORMAT", default_value = "yaml")]
        format: String,
    },
}
