use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tokio::runtime::Runtime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use inboxpilot::WorkPriority;
use inboxpilot::cli::commands::{self, precompute::PrecomputeOptions};

#[derive(Parser)]
#[command(name = "inboxpilot")]
#[command(
    version,
    about = "AI summaries, subjects and moderation labels for your inbox, precomputed in the background"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true)]
    verbose: bool,

    #[arg(long, short, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Precompute summaries, subjects and moderation verdicts
    Precompute {
        #[arg(long, short, help = "Threads to process in total (default: tick limit)")]
        limit: Option<usize>,
        #[arg(long = "no-sync", help = "Skip the inbox sync before the first tick")]
        no_sync: bool,
        #[arg(long, help = "Recompute summaries and subjects that already exist")]
        force: bool,
        #[arg(long, help = "Run a single tick")]
        once: bool,
        #[arg(long, help = "Work priority: summary-first, moderation-first")]
        priority: Option<WorkPriority>,
        #[arg(long, help = "Print the report as JSON")]
        json: bool,
    },

    /// Show local dataset, quota and run status
    Status {
        #[arg(long, help = "Print as JSON")]
        json: bool,
    },

    /// Show recent precompute runs
    Logs {
        #[arg(short = 'n', long, default_value = "20", help = "Number of runs to show")]
        limit: usize,
        #[arg(long, help = "Print as JSON")]
        json: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration (merged from all sources)
    Show {
        #[arg(long, help = "Print as JSON instead of TOML")]
        json: bool,
    },
    /// Show configuration file paths
    Path,
    /// Write a starter configuration file
    Init {
        #[arg(long, short, help = "Initialize global config")]
        global: bool,
        #[arg(long, help = "Overwrite existing config")]
        force: bool,
    },
}

/// Set up panic handler for graceful error reporting
fn setup_panic_handler() {
    let default_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |panic_info| {
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        eprintln!("\n\x1b[1;31m━━━ PANIC ━━━\x1b[0m");
        eprintln!("\x1b[31mInboxPilot encountered an unexpected error:\x1b[0m");
        eprintln!("  {}", message);

        if let Some(location) = panic_info.location() {
            eprintln!(
                "\x1b[90mLocation: {}:{}:{}\x1b[0m",
                location.file(),
                location.line(),
                location.column()
            );
        }
        eprintln!();

        default_hook(panic_info);
    }));
}

fn main() -> ExitCode {
    setup_panic_handler();

    match run_cli() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("\x1b[31mError:\x1b[0m {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Precompute {
            limit,
            no_sync,
            force,
            once,
            priority,
            json,
        } => {
            let rt = Runtime::new()?;
            rt.block_on(commands::precompute::run(PrecomputeOptions {
                limit,
                sync: !no_sync,
                force,
                priority,
                once,
                json,
                quiet: cli.quiet,
            }))?;
        }
        Commands::Status { json } => {
            commands::status::run(json)?;
        }
        Commands::Logs { limit, json } => {
            commands::logs::run(limit, json)?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show { json } => commands::config::show(json)?,
            ConfigAction::Path => commands::config::path()?,
            ConfigAction::Init { global, force } => commands::config::init(global, force)?,
        },
    }

    Ok(())
}
