//! medley CLI entry point.
//!
//! Usage:
//!   medley [OPTIONS] <workspace:script=command>...
//!
//! Each positional argument defines one script, e.g.
//!   medley --parallel 2 'web:build=npm run build' 'api:build=cargo build'
//!
//! All scripts run under one concurrency policy with their stdout/stderr
//! merged live, then a per-script summary is printed. The process exits
//! non-zero if any script failed.

use std::env;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use medley_engine::{OutputFormatter, Scheduler};
use medley_types::{ParallelMax, ScriptSpec, ScriptTag, Summary};

fn main() -> ExitCode {
    // Initialize tracing (respects RUST_LOG env var); diagnostics go to
    // stderr so script output on stdout stays clean.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cli = match parse_args(&args)? {
        Command::Help => {
            print_help();
            return Ok(ExitCode::SUCCESS);
        }
        Command::Version => {
            println!("medley {}", env!("CARGO_PKG_VERSION"));
            return Ok(ExitCode::SUCCESS);
        }
        Command::Run(cli) => cli,
    };

    let mut specs = Vec::with_capacity(cli.scripts.len());
    for def in &cli.scripts {
        let mut spec = ScriptSpec::new(
            ScriptTag::new(def.workspace.as_str(), def.script.as_str()),
            def.command.as_str(),
        );
        if let Some(dir) = &cli.working_dir {
            spec = spec.with_dir(dir);
        }
        specs.push(spec);
    }

    let scheduler =
        Scheduler::new(specs, cli.parallel.clone()).context("invalid --parallel setting")?;
    tracing::debug!(policy = ?scheduler.policy(), "resolved concurrency policy");

    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(run_scripts(scheduler, cli.prefix))?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    Ok(if summary.all_success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Stream the merged output to stdout line by line, then wait for the
/// summary.
async fn run_scripts(scheduler: Scheduler, prefix: bool) -> Result<Summary> {
    let mut run = scheduler.start();
    let mut text = run.output().text()?;
    let mut formatter = OutputFormatter::new().with_prefix(prefix);
    while let Some(chunk) = text.next().await {
        for line in formatter.push(&chunk) {
            println!("{line}");
        }
    }
    for line in formatter.flush() {
        println!("{line}");
    }
    Ok(run.summary().await)
}

fn print_summary(summary: &Summary) {
    println!();
    for record in &summary.results {
        let status = if record.success { "ok" } else { "failed" };
        match &record.signal {
            Some(sig) => println!(
                "  {}  {status} ({}, {sig}) {}ms",
                record.tag.label(),
                record.exit_code,
                record.duration_ms
            ),
            None => println!(
                "  {}  {status} ({}) {}ms",
                record.tag.label(),
                record.exit_code,
                record.duration_ms
            ),
        }
    }
    println!(
        "{} scripts, {} succeeded, {} failed in {}ms",
        summary.total_count, summary.success_count, summary.failure_count, summary.duration_ms
    );
}

fn print_help() {
    println!(
        r#"medley v{}

Usage:
  medley [OPTIONS] <workspace:script=command>...

Each positional argument defines one script as workspace:script=command.

Options:
  -p, --parallel <max>   Concurrency: an integer, "auto", "default",
                         "N%", "unbounded", or "series" (default: series)
  -C <dir>               Working directory for every script
  --no-prefix            Do not prefix output lines with [workspace:script]
  --json                 Print the summary as JSON
  -h, --help             Show this help
  -V, --version          Show version

Examples:
  medley 'web:test=npm test' 'api:test=cargo test'
  medley --parallel auto 'a:build=make' 'b:build=make'
  medley --parallel 50% --json 'a:lint=npm run lint'
"#,
        env!("CARGO_PKG_VERSION")
    );
}

#[derive(Debug, PartialEq)]
enum Command {
    Run(CliArgs),
    Help,
    Version,
}

#[derive(Debug, PartialEq)]
struct CliArgs {
    scripts: Vec<ScriptDef>,
    parallel: ParallelMax,
    prefix: bool,
    json: bool,
    working_dir: Option<String>,
}

#[derive(Debug, PartialEq)]
struct ScriptDef {
    workspace: String,
    script: String,
    command: String,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let mut scripts = Vec::new();
    let mut parallel = ParallelMax::default();
    let mut prefix = true;
    let mut json = false;
    let mut working_dir = None;

    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-V" | "--version" => return Ok(Command::Version),
            "--no-prefix" => prefix = false,
            "--json" => json = true,
            "-p" | "--parallel" => {
                let value = it.next().context("--parallel requires a value")?;
                parallel = value.parse()?;
            }
            _ if arg.starts_with("--parallel=") => {
                parallel = arg["--parallel=".len()..].parse()?;
            }
            "-C" => {
                working_dir = Some(it.next().context("-C requires a directory")?.clone());
            }
            _ if arg.starts_with('-') => {
                bail!("unknown option: {arg}; run 'medley --help' for usage")
            }
            _ => scripts.push(parse_script_def(arg)?),
        }
    }

    if scripts.is_empty() {
        bail!("no scripts given; run 'medley --help' for usage");
    }
    Ok(Command::Run(CliArgs {
        scripts,
        parallel,
        prefix,
        json,
        working_dir,
    }))
}

fn parse_script_def(arg: &str) -> Result<ScriptDef> {
    let (label, command) = arg
        .split_once('=')
        .with_context(|| format!("expected workspace:script=command, got '{arg}'"))?;
    let (workspace, script) = label
        .split_once(':')
        .with_context(|| format!("expected workspace:script=command, got '{arg}'"))?;
    if workspace.is_empty() || script.is_empty() || command.is_empty() {
        bail!("expected workspace:script=command, got '{arg}'");
    }
    Ok(ScriptDef {
        workspace: workspace.to_string(),
        script: script.to_string(),
        command: command.to_string(),
    })
}
