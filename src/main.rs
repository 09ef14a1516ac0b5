//! delegtrace CLI entrypoint.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use std::path::PathBuf;
use std::process::ExitCode;

use delegtrace::{
    Config, DelegationType, ExitStatus, HumanDuration, LockRange, Reporter, Rig, RunOptions, RunPlan,
    RunSummary, ScenarioReport,
};

#[derive(Debug, Parser)]
#[command(name = "delegtrace")]
#[command(about = "NFSv4 delegation scenarios: drive two clients, capture the wire, verify the delegation lifecycle")]
struct Cli {
    /// Path to config file. Missing configs are treated as "defaults".
    #[arg(long, global = true, default_value = "delegtrace.toml")]
    config: PathBuf,

    /// Working directory for execution.
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,

    /// Log level.
    #[arg(long, global = true, default_value = "info")]
    log: String,

    /// Machine-readable output to stdout (JSON).
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run catalog scenarios against the configured server
    Run {
        /// Glob patterns over scenario names (all when omitted).
        globs: Vec<String>,

        /// Only scenarios for this delegation type.
        #[arg(long)]
        deleg: Option<DelegationType>,

        /// Byte range for lock scenarios, as OFFSET:LEN.
        #[arg(long)]
        lock_range: Option<LockRange>,

        /// Open-for-write conflicts truncate the file instead of appending.
        #[arg(long)]
        truncate: bool,

        /// Delay between steps that must reach the server in order.
        #[arg(long)]
        settle: Option<HumanDuration>,

        /// Test file size in bytes.
        #[arg(long)]
        file_size: Option<u64>,

        #[arg(long)]
        reporter: Option<Reporter>,
    },

    /// Re-verify a recorded scenario trace
    Verify { trace: PathBuf },

    /// List catalog scenarios
    List { globs: Vec<String> },

    /// Run one actor batch from stdin (used by the child and peer actors)
    #[command(hide = true)]
    Child,

    /// Print environment and configured backends
    Env,

    /// Print version information
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_tracing(&cli.log) {
        eprintln!("warning: failed to init tracing: {err:#}");
    }

    let cwd = cli.cwd.clone().unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    if let Err(err) = std::env::set_current_dir(&cwd) {
        return print_error_and_exit(&cli, anyhow::anyhow!(err).context(format!("failed to set cwd to {}", cwd.display())));
    }

    let config = Config::load_optional(&cli.config);

    match run_command(&cli, &config) {
        Ok(code) => code,
        Err(err) => print_error_and_exit(&cli, err),
    }
}

/// Logs go to stderr; stdout carries reports and the child protocol.
fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn run_command(cli: &Cli, config: &Config) -> anyhow::Result<ExitCode> {
    match &cli.command {
        Command::Run {
            globs,
            deleg,
            lock_range,
            truncate,
            settle,
            file_size,
            reporter,
        } => {
            let opts = RunOptions {
                globs: globs.clone(),
                deleg: *deleg,
                lock_range: *lock_range,
                truncate: *truncate,
                settle: *settle,
                file_size: *file_size,
                reporter: *reporter,
            };
            let plan = RunPlan::new(config);
            let program = std::env::current_exe()
                .context("failed to locate the delegtrace binary for the child actor")?
                .display()
                .to_string();
            let mut rig = Rig::live(config, &plan.artifacts_dir, program)?;
            let summary = delegtrace::run_scenarios(config, &mut rig, &opts, &plan)?;
            print_run_summary(cli, &summary)?;
            Ok(exit_code_for_status(summary.status))
        }

        Command::Verify { trace } => {
            let report = delegtrace::replay_trace_file(trace)
                .with_context(|| format!("failed to verify {}", trace.display()))?;
            print_scenario_report(cli, &report)?;
            Ok(exit_code_for_status(report.status))
        }

        Command::List { globs } => {
            let entries = delegtrace::select_scenarios(globs)?;
            if cli.json {
                print_json_or_text(cli, &entries)?;
            } else {
                for e in &entries {
                    println!("{:<10} {}", e.name, e.description());
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Child => {
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            let ok = delegtrace::serve_child_batch(&mut stdin.lock(), &mut stdout.lock())?;
            Ok(if ok { ExitCode::SUCCESS } else { ExitCode::from(1) })
        }

        Command::Env => {
            let info = delegtrace::env_info(config);
            print_json_or_text(cli, &info)?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Version => {
            let info = delegtrace::version_info();
            if cli.json {
                print_json_or_text(cli, &info)?;
            } else {
                println!("delegtrace {}", info.version);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_run_summary(cli: &Cli, summary: &RunSummary) -> anyhow::Result<()> {
    if cli.json {
        print_json_or_text(cli, summary)?;
    } else {
        println!("{}", summary.pretty());
    }
    Ok(())
}

fn print_scenario_report(cli: &Cli, report: &ScenarioReport) -> anyhow::Result<()> {
    if cli.json {
        return print_json_or_text(cli, report);
    }
    println!("{} - {}", report.name, report.description);
    for r in &report.results {
        if r.passed {
            println!("    PASS: {}", r.name);
        } else {
            println!("    FAIL: {}\n        {}", r.name, r.detail);
        }
    }
    for note in &report.notes {
        println!("    NOTE: {note}");
    }
    println!("status={:?}", report.status);
    Ok(())
}

fn print_json_or_text<T: serde::Serialize>(cli: &Cli, value: &T) -> anyhow::Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string(value)?);
    } else {
        println!("{}", serde_json::to_string_pretty(value)?);
    }
    Ok(())
}

fn print_error_and_exit(cli: &Cli, err: anyhow::Error) -> ExitCode {
    let msg = format!("{err:#}");
    if cli.json {
        let out = serde_json::json!({
            "status": "error",
            "code": "error",
            "message": msg,
        });
        println!("{out}");
    } else {
        eprintln!("{msg}");
    }
    ExitCode::from(2)
}

fn exit_code_for_status(status: ExitStatus) -> ExitCode {
    match status {
        ExitStatus::Pass => ExitCode::SUCCESS,
        ExitStatus::Fail => ExitCode::from(1),
        ExitStatus::Error => ExitCode::from(2),
    }
}
