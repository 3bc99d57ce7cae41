//! oss-dev - autonomous single-issue fixer
//!
//! Fetches a GitHub issue, finds the code it is about, and iterates on
//! patches in a sandbox until the project's tests pass.

use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use ossdev::config::{ConfigLocations, Settings};
use ossdev::sandbox::SandboxBackend;
use ossdev::workflow::{
    run_fix_workflow, PhaseReporter, WorkflowOptions, WorkflowResult, WorkflowStatus,
};
use ossdev::{detect_stack, Result};

/// Spinner frames.
const SPINNER_FRAMES: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

#[derive(Parser)]
#[command(name = "oss-dev")]
#[command(version)]
#[command(about = "Fix a GitHub issue by iterating on patches in a sandbox", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Directory whose .oss-dev.toml is read (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attempt to fix a GitHub issue
    Fix {
        /// Issue URL, e.g. https://github.com/owner/repo/issues/42
        issue_url: String,

        /// Locate code and stop before touching a sandbox
        #[arg(long)]
        dry_run: bool,

        /// Maximum fix attempts (overrides settings)
        #[arg(short, long, value_name = "N")]
        max_attempts: Option<u32>,

        /// Use an existing checkout instead of cloning
        #[arg(long, value_name = "PATH")]
        local: Option<PathBuf>,

        /// Sandbox backend: docker or local
        #[arg(long, value_name = "BACKEND")]
        sandbox: Option<SandboxBackend>,

        /// Write the JSON report to this file
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Detect a project's language and test command
    Detect {
        /// Project directory
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show or validate settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective settings
    Show {
        /// Output as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
    /// Check settings and required environment variables
    Validate,
    /// Print where settings files are looked up
    Paths,
}

fn init_tracing(verbose: bool, json: bool, level: Option<&str>) {
    let default = if verbose {
        "ossdev=debug,info"
    } else {
        "ossdev=info,warn"
    };
    let filter = level
        .and_then(|l| EnvFilter::try_new(l).ok())
        .unwrap_or_else(|| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars(SPINNER_FRAMES),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = Settings::load(&cli.project);
    let level = settings
        .as_ref()
        .ok()
        .and_then(|s| s.log_level.clone());
    init_tracing(cli.verbose, cli.json_logs, level.as_deref());

    let code = match run(cli, settings).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            if e.is_setup_error() {
                eprintln!(
                    "{} nothing was run; check the issue URL and `oss-dev config validate`",
                    "Hint:".yellow()
                );
            }
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli, settings: Result<Settings>) -> Result<()> {
    match cli.command {
        Commands::Fix {
            issue_url,
            dry_run,
            max_attempts,
            local,
            sandbox,
            output,
        } => {
            let options = WorkflowOptions {
                dry_run,
                max_attempts,
                local_path: local,
                sandbox,
                output,
            };
            fix(&issue_url, options, settings?).await
        }

        Commands::Detect { path, json } => {
            let runtime = detect_stack(&path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runtime)?);
            } else {
                println!("\n{} {}", "Stack:".cyan().bold(), path.display());
                println!("{}", "─".repeat(40));
                println!("   Language: {}", runtime.language.to_string().green());
                println!("   Runtime: {}", runtime.runtime);
                println!("   Package manager: {}", runtime.package_manager);
                println!("   Install: {}", runtime.install_command);
                println!("   Test: {}", runtime.test_command);
            }
            Ok(())
        }

        Commands::Config { action } => match action {
            ConfigAction::Show { json } => {
                let settings = settings?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                } else {
                    print!("{}", settings.to_toml()?);
                }
                Ok(())
            }
            ConfigAction::Validate => {
                let settings = settings?;
                settings.validate()?;
                println!("{} settings are valid", "OK".green());
                settings.require_credentials(|name| std::env::var(name).ok())?;
                println!("{} required environment variables are set", "OK".green());
                if settings.github_token().is_none() {
                    println!(
                        "{} {} not set; GitHub requests are unauthenticated",
                        "Warning:".yellow(),
                        settings.github_token_env
                    );
                }
                Ok(())
            }
            ConfigAction::Paths => {
                print_paths(&cli.project);
                Ok(())
            }
        },
    }
}

fn print_paths(project: &Path) {
    let locations = ConfigLocations::new(project);
    let describe = |path: Option<&Path>| match path {
        Some(p) if p.is_file() => format!("{} {}", p.display(), "(found)".green()),
        Some(p) => format!("{} {}", p.display(), "(missing)".dimmed()),
        None => "unavailable on this platform".to_string(),
    };
    println!("\n{} Settings files (later wins)", "Config:".cyan().bold());
    println!("{}", "─".repeat(40));
    println!("   User: {}", describe(locations.user()));
    println!("   Project: {}", describe(locations.project()));
}

async fn fix(issue_url: &str, options: WorkflowOptions, settings: Settings) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping after the current step");
            on_interrupt.cancel();
        }
    });

    let pb = spinner("Starting");
    let reporter_pb = pb.clone();
    let reporter: PhaseReporter =
        Arc::new(move |phase: &str| reporter_pb.set_message(phase.to_string()));
    let result = run_fix_workflow(issue_url, options, settings, &cancel, Some(reporter)).await;
    pb.finish_and_clear();
    let report = result?;

    print_report(&report);
    match report.to_error() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn print_report(report: &WorkflowResult) {
    let status = match report.status {
        WorkflowStatus::Fixed => "FIXED".green().bold(),
        WorkflowStatus::DryRun => "DRY RUN".cyan().bold(),
        WorkflowStatus::Exhausted => "EXHAUSTED".yellow().bold(),
        WorkflowStatus::Cancelled => "CANCELLED".yellow().bold(),
        WorkflowStatus::Aborted | WorkflowStatus::Error => "FAILED".red().bold(),
    };

    println!("\n{} {}", status, report.issue);
    println!("{}", "─".repeat(40));
    if let Some(stack) = &report.stack {
        println!("   Stack: {} ({})", stack.language, stack.test_command);
    }
    println!(
        "   Search: {} queries, {} snippets",
        report.queries.len(),
        report.excerpt_count
    );
    println!("   Attempts: {}", report.attempts);
    println!("   Duration: {:.1}s", report.duration_secs);
    println!("   Cost: ${:.4}", report.cost_usd);
    if let Some(error) = &report.error {
        println!("   Reason: {}", error);
    }

    if let Some(patch) = &report.patch {
        println!("\n{} {}", "Patch:".cyan().bold(), patch.path());
        println!("{}", "─".repeat(40));
        println!("{}", patch.content());
    }
}
