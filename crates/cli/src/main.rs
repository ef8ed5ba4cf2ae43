//! `steprunner` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate` — validate a state machine definitions JSON file.
//! - `run`      — execute one state machine locally to its terminal state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;

use engine::{Definitions, Executor, ExecutorConfig, Outcome};
use tasks::ProcessInvoker;

#[derive(Parser)]
#[command(
    name = "steprunner",
    about = "Local state-machine workflow emulator",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a state machine definitions JSON file.
    Validate {
        /// Path to the definitions JSON file.
        path: PathBuf,
    },
    /// Run one state machine execution to completion.
    Run {
        /// Path to the definitions JSON file.
        path: PathBuf,
        /// Name of the state machine to execute.
        #[arg(long)]
        machine: String,
        /// Initial input as inline JSON (defaults to `{}`).
        #[arg(long, conflicts_with = "input_file")]
        input: Option<String>,
        /// Initial input read from a JSON file.
        #[arg(long)]
        input_file: Option<PathBuf>,
        /// Default timeout for Task invocations, in seconds.
        #[arg(long, default_value_t = 30)]
        timeout_seconds: u64,
        /// Directory task handler modules are resolved against.
        #[arg(long)]
        cwd: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => {
            let definitions = load_definitions(&path)?;
            let mut names: Vec<&str> = definitions.machine_names().collect();
            names.sort_unstable();

            println!("Definitions are valid. {} machine(s):", names.len());
            for name in names {
                let machine = definitions
                    .machine(name)
                    .context("machine disappeared after load")?;
                println!(
                    "  {name}: {} state(s), starts at '{}'",
                    machine.states.len(),
                    machine.start_at
                );
            }
        }

        Command::Run {
            path,
            machine,
            input,
            input_file,
            timeout_seconds,
            cwd,
        } => {
            let definitions = load_definitions(&path)?;

            let input = read_input(input, input_file)?;
            let invoker = ProcessInvoker::node(cwd);
            let executor = Executor::new(
                Arc::new(definitions),
                Arc::new(invoker),
                ExecutorConfig {
                    task_timeout: Duration::from_secs(timeout_seconds),
                    ..Default::default()
                },
            );

            info!("starting execution of '{machine}'");
            let result = executor.run(&machine, input).await;
            println!("executionId: {}", result.execution_id);
            println!("startDate:   {}", result.started_at.to_rfc3339());

            match result.outcome {
                Outcome::Succeeded(data) => {
                    println!("status:      Succeeded");
                    println!("{}", serde_json::to_string_pretty(&data)?);
                }
                Outcome::Failed(error) => {
                    println!("status:      Failed");
                    eprintln!("error: {error}");
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

fn load_definitions(path: &PathBuf) -> Result<Definitions> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    Definitions::load(&content)
        .with_context(|| format!("invalid definitions in {}", path.display()))
}

fn read_input(inline: Option<String>, file: Option<PathBuf>) -> Result<Value> {
    match (inline, file) {
        (Some(raw), None) => serde_json::from_str(&raw).context("--input is not valid JSON"),
        (None, Some(path)) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read input file {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("{} is not valid JSON", path.display()))
        }
        (None, None) => Ok(Value::Object(serde_json::Map::new())),
        (Some(_), Some(_)) => bail!("--input and --input-file are mutually exclusive"),
    }
}
