//! ec2-sync CLI
//!
//! Command-line interface for ec2-sync - keeps local directories in sync with
//! an EC2 instance whose address changes on every start.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use ec2_sync_core::SyncDirection;

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "ec2-sync")]
#[command(about = "Keep local directories in sync with a dynamic EC2 instance")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ./ec2-sync.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync every mapping in both directions
    Sync {
        /// Show what would be transferred without transferring
        #[arg(long)]
        dry_run: bool,
    },
    /// Copy local changes to the instance only
    Push {
        /// Show what would be transferred without transferring
        #[arg(long)]
        dry_run: bool,
    },
    /// Copy instance changes to the local side only
    Pull {
        /// Show what would be transferred without transferring
        #[arg(long)]
        dry_run: bool,
    },
    /// Watch local directories and sync on change
    Watch {
        /// Which way changes are allowed to flow
        #[arg(long, value_enum, default_value_t = DirectionArg::Both)]
        direction: DirectionArg,
        /// Skip the full sync on start
        #[arg(long)]
        no_initial_sync: bool,
    },
    /// Show instance and mapping status
    Status,
    /// Check that the instance, ssh and rsync are reachable
    Doctor,
    /// Show or check configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate the configuration file
    Validate,
    /// Print the config file location
    Path,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DirectionArg {
    Both,
    Push,
    Pull,
}

impl From<DirectionArg> for SyncDirection {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Both => SyncDirection::Bidirectional,
            DirectionArg::Push => SyncDirection::PushOnly,
            DirectionArg::Pull => SyncDirection::PullOnly,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    init_logging(cli.verbose, cli.quiet);

    let config_path = cli.config.as_deref();
    let success = match cli.command {
        Commands::Sync { dry_run } => {
            commands::sync::run(config_path, SyncDirection::Bidirectional, dry_run, &output).await?
        }
        Commands::Push { dry_run } => {
            commands::sync::run(config_path, SyncDirection::PushOnly, dry_run, &output).await?
        }
        Commands::Pull { dry_run } => {
            commands::sync::run(config_path, SyncDirection::PullOnly, dry_run, &output).await?
        }
        Commands::Watch {
            direction,
            no_initial_sync,
        } => commands::watch::run(config_path, direction.into(), no_initial_sync, &output).await?,
        Commands::Status => {
            commands::status::show(config_path, &output).await?;
            true
        }
        Commands::Doctor => commands::status::doctor(config_path, &output).await?,
        Commands::Config { command } => {
            handle_config_command(command, config_path, &output)?;
            true
        }
    };

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&std::path::Path>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Validate) => commands::config::validate(config_path, output),
        Some(ConfigCommands::Path) => commands::config::path(config_path, output),
    }
}

/// Log to stderr; EC2SYNC_LOG overrides the level
fn init_logging(verbose: bool, quiet: bool) {
    let env_filter = match std::env::var("EC2SYNC_LOG") {
        Ok(spec) if spec.contains('=') => EnvFilter::new(spec),
        Ok(level) => EnvFilter::new(format!("ec2_sync_core={},ec2_sync={}", level, level)),
        Err(_) => {
            let level = if verbose {
                "debug"
            } else if quiet {
                "warn"
            } else {
                "info"
            };
            EnvFilter::new(format!("ec2_sync_core={},ec2_sync={}", level, level))
        }
    };

    // Ignore error if already initialized
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
