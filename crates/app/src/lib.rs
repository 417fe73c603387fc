use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use cwl_engine_core::config::data_dir;
use cwl_engine_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, DEFAULT_LOG_FILTER,
};
use cwl_engine_core::loader;

#[derive(Parser)]
#[command(name = "cwl-engine", about = "Run workflow documents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true, help = "Override the data directory")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(help = "Path to a document (CommandLineTool, ExpressionTool, or Workflow)")]
    document: PathBuf,
    #[arg(
        long = "input",
        value_name = "JSON_OR_PATH",
        help = "A JSON object of inputs, or a path to a file containing one"
    )]
    input: Option<String>,
    #[arg(
        long = "set",
        value_name = "KEY=VALUE",
        help = "Set a single top-level input (repeatable, e.g. --set count=3)"
    )]
    set: Vec<String>,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(Some(resolved_data_dir.as_path()));

    match cli.command {
        Commands::Run(run) => run_document(run.document, run.input, run.set),
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = &panic_hook_plan
    {
        let attempted_crash_dir = attempted_crash_dir
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        eprintln!(
            "Warning: panic crash artifact hook unavailable (path: {attempted_crash_dir}; reason: {reason}). Panics will not be persisted to crash logs."
        );
    }

    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(logging::redacting_make_writer(ready.appender))
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            eprintln!(
                "Warning: persistent file logging unavailable (path: {attempted_log_dir}; reason: {reason}). Continuing with console-only logging."
            );
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: Option<&Path>) {
    let pid = std::process::id();
    if let Some(data_dir) = data_dir {
        info!(pid, data_dir = %data_dir.display(), "runtime startup metadata");
    } else {
        info!(pid, "runtime startup metadata");
    }
}

/// Parse `--input`: either an inline JSON object or a path to a file containing one.
fn parse_input_arg(raw: &str) -> Result<Map<String, Value>> {
    let candidate = Path::new(raw);
    let text = if candidate.is_file() {
        std::fs::read_to_string(candidate)
            .with_context(|| format!("failed to read --input file: {}", candidate.display()))?
    } else {
        raw.to_string()
    };

    let value: Value = serde_json::from_str(&text).context("--input must decode to a JSON object")?;
    value
        .as_object()
        .cloned()
        .context("--input must decode to a JSON object")
}

fn apply_set_overrides(inputs: &mut Map<String, Value>, raw_overrides: &[String]) -> Result<()> {
    for item in raw_overrides {
        let (key, value) = item
            .split_once('=')
            .with_context(|| format!("invalid --set format '{item}' (expected KEY=VALUE)"))?;
        let parsed = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        inputs.insert(key.to_string(), parsed);
    }
    Ok(())
}

fn run_document(document_path: PathBuf, input: Option<String>, set: Vec<String>) -> Result<()> {
    if !document_path.exists() {
        bail!("document does not exist: {}", document_path.display());
    }

    let mut inputs = match input {
        Some(raw) => parse_input_arg(&raw)?,
        None => Map::new(),
    };
    apply_set_overrides(&mut inputs, &set)?;

    info!(document = %document_path.display(), "loading document");
    let mut runnable = loader::load(document_path.to_str().context("document path is not valid UTF-8")?, None)?;

    info!("running document");
    let outputs = runnable.run(inputs).context("execution failed")?;

    println!("{}", serde_json::to_string_pretty(&Value::Object(outputs))?);
    Ok(())
}
