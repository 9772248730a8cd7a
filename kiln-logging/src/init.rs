use anyhow::Result;
use kiln_config::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Where formatted log lines are written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogWriter {
    Stdout,
    Stderr,
}

/// Build an env filter from explicit directives, falling back to `RUST_LOG`, then `info`
fn build_env_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Initialize logging from configuration
pub fn init_logging_from_config(config: &LoggingConfig, writer: LogWriter) -> Result<()> {
    let env_filter = build_env_filter(Some(&config.directives()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    // try_init so a second initialisation (tests, embedding) is not fatal
    let result = match (config.format, writer) {
        (LogFormat::Json, LogWriter::Stdout) => builder.json().try_init(),
        (LogFormat::Json, LogWriter::Stderr) => builder.json().with_writer(std::io::stderr).try_init(),
        (LogFormat::Compact, LogWriter::Stdout) => builder.compact().try_init(),
        (LogFormat::Compact, LogWriter::Stderr) => builder.compact().with_writer(std::io::stderr).try_init(),
        (LogFormat::Pretty, LogWriter::Stdout) => builder.pretty().try_init(),
        (LogFormat::Pretty, LogWriter::Stderr) => builder.pretty().with_writer(std::io::stderr).try_init(),
        (LogFormat::Text, LogWriter::Stdout) => builder.try_init(),
        (LogFormat::Text, LogWriter::Stderr) => builder.with_writer(std::io::stderr).try_init(),
    };

    if result.is_err() {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize tracing for worker processes (output to stderr to avoid IPC conflicts)
pub fn init_worker_tracing(log_level: Option<&str>) -> Result<()> {
    let env_filter = build_env_filter(log_level);

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    tracing::debug!("Worker tracing initialized");
    Ok(())
}
