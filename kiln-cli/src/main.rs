use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value as JsonValue;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod cli;
mod compilers;

use cli::{Cli, Commands, ConfigCommands};
use kiln_config::{ConfigLoader, KilnConfig, LogLevel};
use kiln_execution::{
    DaemonCompiler, ForkRequirements, NativeProcessEnvironment, WorkerPool, WorkerServer,
};
use kiln_ipc::StdioTransport;
use kiln_logging::{init_logging_from_config, init_worker_tracing, LogWriter};

/// Load configuration from file or use defaults
fn load_config(config_path: Option<&PathBuf>) -> Result<KilnConfig> {
    let loader = ConfigLoader::new();

    match config_path {
        Some(path) => {
            if path.exists() {
                info!("Loading configuration from: {:?}", path);
                loader
                    .from_file(path)
                    .context(format!("Failed to load configuration from {:?}", path))
            } else {
                warn!("Configuration file not found: {:?}. Using defaults.", path);
                loader
                    .from_env()
                    .context("Failed to load configuration from environment")
            }
        }
        None => {
            debug!("No configuration file specified. Loading from environment or defaults.");
            loader
                .from_env()
                .context("Failed to load configuration from environment")
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()
            .context("Failed to read the current directory")?
            .join(path))
    }
}

struct RunRequest<'a> {
    compiler: &'a str,
    spec: &'a Path,
    working_dir: Option<&'a PathBuf>,
    idle_dir: Option<&'a PathBuf>,
    classpath: &'a [PathBuf],
    launch_args: &'a [String],
    max_memory_mb: Option<u64>,
}

/// Run one compile spec through the worker pool and print the result
async fn run_compile(config: &KilnConfig, request: RunRequest<'_>) -> Result<()> {
    let registry = compilers::builtin_registry();
    if !registry.contains(request.compiler) {
        return Err(anyhow::anyhow!(
            "Unknown compiler: {}. Valid compilers: {}",
            request.compiler,
            registry.names().join(", ")
        ));
    }

    let spec_text = fs::read_to_string(request.spec)
        .context(format!("Failed to read compile spec {:?}", request.spec))?;
    let spec: JsonValue = serde_json::from_str(&spec_text).context("Compile spec is not valid JSON")?;

    let working_dir = match request.working_dir {
        Some(dir) => absolute(dir)?,
        None => std::env::current_dir().context("Failed to read the current directory")?,
    };
    let idle_dir = match request.idle_dir {
        Some(dir) => absolute(dir)?,
        None => std::env::temp_dir(),
    };

    let mut requirements = ForkRequirements::new(idle_dir)
        .with_classpath(request.classpath.iter().cloned())
        .with_launch_args(request.launch_args.iter().cloned());
    if let Some(memory) = request.max_memory_mb {
        requirements = requirements.with_max_memory_mb(memory);
    }

    let pool = WorkerPool::from_config(&config.workers, registry).context("Failed to create worker pool")?;
    let reaper = pool.spawn_reaper();

    let compiler = DaemonCompiler::new(
        request.compiler,
        working_dir,
        Arc::new(pool.clone()),
        move |_: &JsonValue| requirements.clone(),
    );

    info!("Running {} in a daemon worker", request.compiler);
    let outcome = compiler.execute(&spec).await;

    pool.shutdown().await;
    reaper.abort();

    let result = outcome.context(format!("Compilation with {} failed", request.compiler))?;
    let formatted = serde_json::to_string_pretty(&result).context("Failed to format result as JSON")?;
    println!("{}", formatted);
    Ok(())
}

/// Run as worker process
async fn run_worker_process(worker_id: String) -> Result<()> {
    info!("Starting worker process with ID: {}", worker_id);
    if let Ok(classpath) = std::env::var(kiln_execution::provision::WORKER_CLASSPATH_ENV) {
        debug!(worker_id = %worker_id, "Worker classpath: {}", classpath);
    }

    let server = WorkerServer::new(
        worker_id.clone(),
        compilers::builtin_registry(),
        Arc::new(NativeProcessEnvironment),
    );
    let mut transport = StdioTransport::stdio();
    server
        .serve(&mut transport)
        .await
        .context("Worker lost its connection to the coordinator")?;

    info!("Worker {} shutting down", worker_id);
    Ok(())
}

/// Handle configuration validation
fn handle_config_validate(config_file: &PathBuf) -> Result<()> {
    info!("Validating configuration file: {:?}", config_file);

    if !config_file.exists() {
        return Err(anyhow::anyhow!(
            "Configuration file not found: {:?}",
            config_file
        ));
    }

    match load_config(Some(config_file)) {
        Ok(_config) => {
            println!("Configuration file is valid");
            Ok(())
        }
        Err(e) => {
            error!("Configuration validation failed: {}", e);
            Err(e)
        }
    }
}

/// Handle configuration generation
fn handle_config_generate(output: &PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        return Err(anyhow::anyhow!(
            "Output file already exists: {:?}. Use --force to overwrite.",
            output
        ));
    }

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).context("Failed to create output directory")?;
    }

    fs::write(output, KilnConfig::generate_sample()).context("Failed to write configuration file")?;
    println!("Configuration generated at: {:?}", output);
    Ok(())
}

/// Handle configuration display
fn handle_config_show(config: &KilnConfig, format: &str) -> Result<()> {
    match format.to_lowercase().as_str() {
        "yaml" | "yml" => {
            let yaml_output = serde_yaml::to_string(config).context("Failed to serialize to YAML")?;
            println!("{}", yaml_output);
        }
        "json" => {
            let json_output =
                serde_json::to_string_pretty(config).context("Failed to serialize to JSON")?;
            println!("{}", json_output);
        }
        _ => {
            return Err(anyhow::anyhow!(
                "Unknown output format: {}. Valid formats: yaml, json",
                format
            ));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Worker mode first: stdout is the IPC channel from here on
    if cli.worker {
        let worker_id = cli.worker_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let log_level = cli
            .log_level
            .or_else(|| std::env::var("KILN_LOG_LEVEL").ok());
        init_worker_tracing(log_level.as_deref())?;
        return run_worker_process(worker_id).await;
    }

    let mut config = load_config(cli.config.as_ref())?;
    if let Some(level) = &cli.log_level {
        config.logging.level = LogLevel::from_str(level).map_err(anyhow::Error::msg)?;
    }
    // Results go to stdout, so logs go to stderr
    init_logging_from_config(&config.logging, LogWriter::Stderr)?;

    match &cli.command {
        Some(Commands::Run {
            compiler,
            spec,
            working_dir,
            idle_dir,
            classpath,
            launch_arg,
            max_memory_mb,
        }) => {
            run_compile(
                &config,
                RunRequest {
                    compiler,
                    spec,
                    working_dir: working_dir.as_ref(),
                    idle_dir: idle_dir.as_ref(),
                    classpath,
                    launch_args: launch_arg,
                    max_memory_mb: *max_memory_mb,
                },
            )
            .await
        }
        Some(Commands::Config { config_cmd }) => match config_cmd {
            ConfigCommands::Validate { config_file } => handle_config_validate(config_file),
            ConfigCommands::Generate { output, force } => handle_config_generate(output, *force),
            ConfigCommands::Show { format } => handle_config_show(&config, format),
        },
        None => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            cmd.print_help().context("Failed to print help")?;
            println!();
            Ok(())
        }
    }
}
