//! Command-line entry point for the evolve loop.
//!
//! `evolve run` drives a bounded number of iterations against four run files
//! (desires, ledger, state, session log). `evolve status` summarizes what has
//! been committed so far.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use evolve::core::types::FailurePolicy;
use evolve::exit_codes;
use evolve::io::bootstrap::{BootstrapHook, CommandHook, NoHook};
use evolve::io::config::{EvolveConfig, load_config};
use evolve::io::lock::RunLockHeldError;
use evolve::io::model::ChatCompletionsClient;
use evolve::iteration::{IterationOutcome, IterationReport, RunPaths};
use evolve::logging;
use evolve::looping::{LoopOutcome, LoopStop, run_loop};
use evolve::status::status_report;

#[derive(Parser)]
#[command(
    name = "evolve",
    version,
    about = "Bounded, sandboxed loop that lets a model rewrite its own desires and files"
)]
struct Cli {
    /// Log progress details to stderr (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run iterations until the budget is used or a failure stops the run.
    Run(RunArgs),
    /// Show committed progress from the state file and ledger.
    Status {
        state: PathBuf,
        ledger: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Desires document; its directory is the write sandbox.
    desires: PathBuf,
    /// Append-only ledger (Markdown).
    ledger: PathBuf,
    /// Resumable state snapshot (JSON).
    state: PathBuf,
    /// Session transcript (JSON Lines).
    session_log: PathBuf,
    /// TOML config; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Label recorded in the ledger and session log.
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    model: Option<String>,
    /// Inference endpoint base URL.
    #[arg(long)]
    api_base: Option<String>,
    #[arg(long)]
    max_iterations: Option<u32>,
    /// Context file for the prompt (repeatable).
    #[arg(long = "context")]
    context: Vec<PathBuf>,
    /// Executable run before every iteration.
    #[arg(long)]
    bootstrap: Option<PathBuf>,
    /// What a failed iteration does to the rest of the run.
    #[arg(long, value_name = "abort|skip")]
    on_failure: Option<FailurePolicy>,
    /// Pause between iterations.
    #[arg(long)]
    interval_secs: Option<u64>,
    /// Per-request model timeout.
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Extra attempts for retryable transport errors.
    #[arg(long)]
    retries: Option<u32>,
    /// Ask the endpoint to constrain output to the response schema.
    #[arg(long)]
    structured_output: bool,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) if err.downcast_ref::<RunLockHeldError>().is_some() => {
            eprintln!("{err:#}");
            exit_codes::LOCKED
        }
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run(args) => cmd_run(&args),
        Command::Status { state, ledger } => {
            let report = status_report(&state, &ledger)?;
            println!("{report}");
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_run(args: &RunArgs) -> Result<i32> {
    let mut cfg = load_config(args.config.as_deref())?;
    apply_overrides(&mut cfg, args);
    let settings = cfg.loop_settings()?;

    let paths = RunPaths::new(&args.desires, &args.ledger, &args.state, &args.session_log);
    let model = ChatCompletionsClient::new(&cfg.model)?;
    let hook: Box<dyn BootstrapHook> = match &cfg.run.bootstrap {
        Some(script) => Box::new(CommandHook::new(
            script,
            Duration::from_secs(cfg.run.bootstrap_timeout_secs),
            cfg.limits.hook_output_limit_bytes,
        )),
        None => Box::new(NoHook),
    };

    let outcome = run_loop(&paths, &settings, &model, hook.as_ref(), print_report)?;
    println!("{}", summary_line(&outcome));
    Ok(match outcome.stop {
        LoopStop::BudgetExhausted | LoopStop::AlreadyComplete => exit_codes::OK,
        LoopStop::Aborted { .. } => exit_codes::ABORTED,
        LoopStop::BootstrapFailed { .. } => exit_codes::BOOTSTRAP_FAILED,
    })
}

fn apply_overrides(cfg: &mut EvolveConfig, args: &RunArgs) {
    if let Some(source) = &args.source {
        cfg.source = source.clone();
    }
    if let Some(model) = &args.model {
        cfg.model.model = model.clone();
    }
    if let Some(api_base) = &args.api_base {
        cfg.model.api_base = api_base.clone();
    }
    if let Some(timeout) = args.timeout_secs {
        cfg.model.timeout_secs = timeout;
    }
    if let Some(retries) = args.retries {
        cfg.model.retries = retries;
    }
    if args.structured_output {
        cfg.model.structured_output = true;
    }
    if let Some(max) = args.max_iterations {
        cfg.run.max_iterations = Some(max);
    }
    if let Some(policy) = args.on_failure {
        cfg.run.failure_policy = Some(policy);
    }
    if let Some(interval) = args.interval_secs {
        cfg.run.interval_secs = interval;
    }
    if !args.context.is_empty() {
        cfg.run.context = args.context.clone();
    }
    if let Some(bootstrap) = &args.bootstrap {
        cfg.run.bootstrap = Some(bootstrap.clone());
    }
}

fn print_report(report: &IterationReport) {
    println!("{}", report_line(report));
}

fn report_line(report: &IterationReport) -> String {
    match &report.outcome {
        IterationOutcome::Applied {
            desires_changed,
            files,
        } => {
            let desires = if *desires_changed {
                "desires changed"
            } else {
                "desires unchanged"
            };
            let files = match files.len() {
                1 => "1 file".to_string(),
                n => format!("{n} files"),
            };
            format!("iteration {}: applied ({desires}, {files})", report.iteration)
        }
        IterationOutcome::Failed(err) => {
            format!("iteration {}: failed [{}] {err}", report.iteration, err.kind())
        }
    }
}

fn summary_line(outcome: &LoopOutcome) -> String {
    let counts = format!(
        "{} applied, {} failed",
        outcome.applied,
        outcome.failures.len()
    );
    match &outcome.stop {
        LoopStop::BudgetExhausted => format!("stopped: iteration budget used ({counts})"),
        LoopStop::AlreadyComplete => format!(
            "stopped: {} iterations already committed, nothing to do",
            outcome.started_at_count
        ),
        LoopStop::Aborted { iteration, kind } => {
            format!("stopped: iteration {iteration} failed with {kind} ({counts})")
        }
        LoopStop::BootstrapFailed { iteration } => {
            format!("stopped: bootstrap failed before iteration {iteration} ({counts})")
        }
    }
}
