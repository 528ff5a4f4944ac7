// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stepflow CLI.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use stepflow_adapters::{EchoAdapter, NoopAdapter, SimulatedAdapter};
use stepflow_core::engine::{EngineConfig, ExecutionEngine};
use stepflow_core::error::EngineError;
use stepflow_core::executor::RunOptions;
use stepflow_core::result::{RunStatus, StepStatus, WorkflowResult};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_OK: u8 = 0;
const EXIT_INVALID: u8 = 1;
const EXIT_UNEXPECTED: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Parser)]
#[command(name = "stepflow")]
#[command(version, about = "Declarative workflow automation engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all non-result output
    #[arg(long, global = true)]
    silent: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow
    Run {
        /// Path to workflow file
        #[arg(value_name = "FILE")]
        file: String,

        /// Input JSON string or file
        #[arg(short, long)]
        input: Option<String>,

        /// Output format
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,

        /// Validate and plan without executing
        #[arg(long)]
        dry_run: bool,

        /// Maximum concurrent steps
        #[arg(long, default_value = "0")]
        max_concurrency: usize,
    },

    /// Validate one or more workflow definitions
    Validate {
        /// Paths to workflow files
        #[arg(value_name = "FILE", required = true)]
        files: Vec<String>,

        /// Output format
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if !cli.silent {
        let log_level = if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        };
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| format!("stepflow={log_level}").into()),
            )
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    match cli.command {
        Commands::Run {
            file,
            input,
            format,
            dry_run,
            max_concurrency,
        } => ExitCode::from(
            run_workflow(&file, input.as_deref(), format, dry_run, max_concurrency, cli.silent)
                .await,
        ),
        Commands::Validate { files, format } => {
            ExitCode::from(validate_workflows(&files, format, cli.silent))
        }
        Commands::Version => {
            println!("stepflow {}", env!("CARGO_PKG_VERSION"));
            ExitCode::from(EXIT_OK)
        }
    }
}

fn print_engine_error(err: &EngineError, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let body = serde_json::json!({
                "ok": false,
                "code": err.code(),
                "message": err.to_string(),
                "diagnostics": err.diagnostics(),
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string())
            );
        }
        OutputFormat::Human => {
            eprintln!("{} {}", "Error:".red().bold(), err);
            for diag in err.diagnostics() {
                eprintln!("  {} {}", "-".red(), diag);
            }
        }
    }
}

fn load_and_validate(
    path: &str,
) -> std::result::Result<stepflow_core::ParsedWorkflow, EngineError> {
    let content = fs::read_to_string(path)
        .map_err(|e| EngineError::Parse(format!("cannot read '{path}': {e}")))?;
    let doc = stepflow_core::parse_document(&content)?;
    stepflow_core::ParsedWorkflow::parse(&doc)
}

fn validate_workflows(files: &[String], format: OutputFormat, silent: bool) -> u8 {
    let mut failed = false;
    for file in files {
        match load_and_validate(file) {
            Ok(workflow) => {
                if !silent {
                    println!("{} {}", "✓".green().bold(), file);
                    println!("  Name: {}", workflow.name);
                    println!("  Version: {}", workflow.version);
                    println!("  Steps: {}", workflow.steps.len());
                    println!("  Phases: {}", workflow.phases().len());
                }
            }
            Err(err) => {
                failed = true;
                if !silent {
                    eprintln!("{} {}", "✗".red().bold(), file);
                }
                print_engine_error(&err, format);
            }
        }
    }
    if failed { EXIT_INVALID } else { EXIT_OK }
}

async fn run_workflow(
    file: &str,
    input: Option<&str>,
    format: OutputFormat,
    dry_run: bool,
    max_concurrency: usize,
    silent: bool,
) -> u8 {
    let workflow = match load_and_validate(file) {
        Ok(workflow) => workflow,
        Err(err) => {
            print_engine_error(&err, format);
            return EXIT_INVALID;
        }
    };

    let inputs = match input.map(parse_input).transpose() {
        Ok(inputs) => inputs.unwrap_or_default(),
        Err(err) => {
            if !silent {
                eprintln!("{} {}", "Error:".red().bold(), err);
            }
            return EXIT_UNEXPECTED;
        }
    };

    let engine = Arc::new(ExecutionEngine::new(EngineConfig {
        max_concurrent_steps: max_concurrency,
        ..EngineConfig::default()
    }));
    for adapter in [
        Arc::new(EchoAdapter) as Arc<dyn stepflow_core::Adapter>,
        Arc::new(NoopAdapter) as Arc<dyn stepflow_core::Adapter>,
        Arc::new(SimulatedAdapter::default()) as Arc<dyn stepflow_core::Adapter>,
    ] {
        if let Err(err) = engine.register_adapter(adapter) {
            print_engine_error(&err, format);
            return EXIT_UNEXPECTED;
        }
    }

    if dry_run {
        let result = engine.dry_run(&workflow);
        print_result(&result, format, silent);
        return EXIT_OK;
    }

    info!(workflow = %workflow.name, "Executing workflow");
    if !silent && format == OutputFormat::Human {
        println!("{} {}", "Running workflow:".cyan().bold(), workflow.name);
    }

    let result = engine
        .execute_workflow_immediate(
            &workflow,
            RunOptions {
                inputs,
                ..RunOptions::default()
            },
        )
        .await;
    print_result(&result, format, silent);

    match result.status {
        RunStatus::Success | RunStatus::Partial => EXIT_OK,
        _ => EXIT_INVALID,
    }
}

fn print_result(result: &WorkflowResult, format: OutputFormat, silent: bool) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(result)
                    .unwrap_or_else(|_| format!("{result:?}"))
            );
        }
        OutputFormat::Human => {
            if silent {
                return;
            }
            let status = match result.status {
                RunStatus::Success => "success".green().bold(),
                RunStatus::Partial => "partial".yellow().bold(),
                _ => format!("{:?}", result.status).to_lowercase().red().bold(),
            };
            println!();
            println!(
                "{} {} ({} ms)",
                "Status:".bold(),
                status,
                result.duration.as_millis()
            );
            println!(
                "  steps: {} total, {} ok, {} failed, {} skipped, {} phases",
                result.metadata.total_steps,
                result.metadata.successful_steps,
                result.metadata.failed_steps,
                result.metadata.skipped_steps,
                result.metadata.phases,
            );

            let mut steps: Vec<_> = result.step_results.values().collect();
            steps.sort_by(|a, b| a.step_id.cmp(&b.step_id));
            for step in steps {
                let marker = match step.status {
                    StepStatus::Success => "●".green(),
                    StepStatus::Failed => "●".red(),
                    StepStatus::Skipped => "○".dimmed(),
                    _ => "●".normal(),
                };
                let detail = match (&step.status, &step.error) {
                    (StepStatus::Failed, Some(error)) => format!(" - {error}").red().to_string(),
                    (StepStatus::Skipped, Some(reason)) => {
                        format!(" - {reason}").dimmed().to_string()
                    }
                    _ => format!(" ({} ms)", step.duration.as_millis()),
                };
                println!("  {} {}{}", marker, step.step_id.cyan(), detail);
            }
            if let Some(error) = &result.error {
                println!("{} {}", "Error:".red().bold(), error);
            }
            if !result.outputs.is_empty() {
                println!("{}", "Outputs:".bold());
                println!(
                    "{}",
                    serde_json::to_string_pretty(&result.outputs)
                        .unwrap_or_else(|_| format!("{:?}", result.outputs))
                );
            }
        }
    }
}

fn parse_input(input: &str) -> Result<HashMap<String, serde_json::Value>> {
    if Path::new(input).exists() {
        let content = fs::read_to_string(input)
            .with_context(|| format!("failed to read input file: {input}"))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse input JSON from file: {input}"))
    } else {
        serde_json::from_str(input).with_context(|| "failed to parse input JSON string")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    const VALID: &str = r#"
version: "1.0"
kind: workflow
metadata: { name: hello }
workflow:
  steps:
    - id: greet
      uses: echo.say
      with: { message: "hi" }
"#;

    #[test]
    fn validate_accepts_valid_file() {
        let file = write_temp(VALID);
        let code = validate_workflows(
            &[file.path().to_string_lossy().into_owned()],
            OutputFormat::Human,
            true,
        );
        assert_eq!(code, EXIT_OK);
    }

    #[test]
    fn validate_rejects_reserved_field() {
        let file = write_temp(
            r#"
version: "1.0"
metadata: { name: bad }
_billing: { plan: free }
workflow:
  steps:
    - { id: a, uses: echo.say }
"#,
        );
        let code = validate_workflows(
            &[file.path().to_string_lossy().into_owned()],
            OutputFormat::Json,
            true,
        );
        assert_eq!(code, EXIT_INVALID);
    }

    #[test]
    fn multi_file_validate_fails_if_any_fails() {
        let good = write_temp(VALID);
        let bad = write_temp("not: [valid");
        let code = validate_workflows(
            &[
                good.path().to_string_lossy().into_owned(),
                bad.path().to_string_lossy().into_owned(),
            ],
            OutputFormat::Human,
            true,
        );
        assert_eq!(code, EXIT_INVALID);
    }

    #[tokio::test]
    async fn run_executes_workflow_with_echo_adapter() {
        let file = write_temp(VALID);
        let code = run_workflow(
            &file.path().to_string_lossy(),
            None,
            OutputFormat::Json,
            false,
            0,
            true,
        )
        .await;
        assert_eq!(code, EXIT_OK);
    }

    #[tokio::test]
    async fn dry_run_never_invokes_adapters() {
        let file = write_temp(VALID);
        let code = run_workflow(
            &file.path().to_string_lossy(),
            None,
            OutputFormat::Json,
            true,
            0,
            true,
        )
        .await;
        assert_eq!(code, EXIT_OK);
    }

    #[test]
    fn input_accepts_inline_json() {
        let inputs = parse_input(r#"{"name": "world"}"#).unwrap();
        assert_eq!(inputs["name"], serde_json::json!("world"));
        assert!(parse_input("not json").is_err());
    }
}
