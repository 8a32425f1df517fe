use std::io::IsTerminal;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use dotenv::dotenv;
use tracing_subscriber::{EnvFilter, fmt};

use strata::commands;
use strata::commands::MigrationOptions;
use strata::commands::new::{NewOptions, new_migration};
use strata::config::{self, FileConfig, Settings};
use strata::error::Error;

#[derive(Parser)]
#[command(name = "strata", author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (repeat up to -vvv for debug output)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Run without prompting (default when stdout is not a terminal)
    #[arg(short = 'b', long = "batch", global = true)]
    batch: bool,

    /// Path to a configuration file
    #[arg(long = "config", global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Ignore any configuration file
    #[arg(long = "no-config-file", global = true)]
    no_config_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct MigrationArgs {
    /// Source directories of migration scripts
    sources: Vec<PathBuf>,

    /// Database, eg 'sqlite:///path/to/sqlite.db' or
    /// 'postgresql://user@host/db'
    #[arg(short = 'd', long)]
    database: Option<String>,

    /// Select migrations matching PATTERN (regular expression)
    #[arg(short = 'm', long = "match", value_name = "PATTERN")]
    match_pattern: Option<String>,

    /// Select all migrations, regardless of whether they have been
    /// previously applied
    #[arg(short = 'a', long)]
    all: bool,

    /// Force apply/rollback of steps even if previous steps have failed
    #[arg(short = 'f', long)]
    force: bool,

    /// Prompt for the database password
    #[arg(short = 'p', long = "prompt-password")]
    prompt_password: bool,

    /// Name of table to use for storing migration metadata
    #[arg(long = "migration-table", value_name = "NAME")]
    migration_table: Option<String>,

    /// Apply/rollback migration with id REVISION
    #[arg(short = 'r', long, value_name = "REVISION")]
    revision: Option<String>,
}

#[derive(Args, Clone)]
struct NewArgs {
    /// Source directory of migration scripts
    sources: Vec<PathBuf>,

    /// Database, eg 'sqlite:///path/to/sqlite.db'
    #[arg(short = 'd', long)]
    database: Option<String>,

    /// Description for the new migration
    #[arg(short = 'm', long)]
    message: Option<String>,

    /// Name of table to use for storing migration metadata
    #[arg(long = "migration-table", value_name = "NAME")]
    migration_table: Option<String>,
}

#[derive(Args, Clone)]
struct BreakLockArgs {
    /// Database, eg 'sqlite:///path/to/sqlite.db' or
    /// 'postgresql://user@host/db'
    #[arg(short = 'd', long)]
    database: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply migrations
    Apply(MigrationArgs),

    /// Rollback migrations
    Rollback(MigrationArgs),

    /// Rollback, then reapply migrations
    Reapply(MigrationArgs),

    /// Mark migrations as applied, without running them
    Mark(MigrationArgs),

    /// Unmark applied migrations, without rolling them back
    Unmark(MigrationArgs),

    /// Show migrations and their applied status
    Showmigrations(MigrationArgs),

    /// Create a new migration
    New(NewArgs),

    /// Break migration locks
    BreakLock(BreakLockArgs),
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        match &e {
            Error::InvalidArgument(message) => {
                eprintln!("error: {message}");
                std::process::exit(2);
            }
            other => {
                eprintln!("error: {other}");
                std::process::exit(1);
            }
        }
    }
}

async fn run(cli: Cli) -> strata::Result<()> {
    let settings = load_settings(&cli)?;
    initialize_logging(if cli.verbose > 0 {
        cli.verbose
    } else {
        settings.verbosity
    });
    let batch_mode = cli.batch || settings.batch_mode || !std::io::stdout().is_terminal();

    match &cli.command {
        Commands::Apply(args) => commands::apply(&options(args, &settings, batch_mode)).await,
        Commands::Rollback(args) => {
            commands::rollback(&options(args, &settings, batch_mode)).await
        }
        Commands::Reapply(args) => commands::reapply(&options(args, &settings, batch_mode)).await,
        Commands::Mark(args) => commands::mark(&options(args, &settings, batch_mode)).await,
        Commands::Unmark(args) => commands::unmark(&options(args, &settings, batch_mode)).await,
        Commands::Showmigrations(args) => {
            commands::show_migrations(&options(args, &settings, batch_mode)).await
        }
        Commands::New(args) => {
            let new_options = NewOptions {
                sources: if args.sources.is_empty() {
                    settings.sources.clone()
                } else {
                    args.sources.clone()
                },
                message: args.message.clone(),
                batch_mode,
            };
            new_migration(&new_options, &settings).await
        }
        Commands::BreakLock(args) => {
            let mut break_options = MigrationOptions::from_settings(&settings);
            break_options.batch_mode = batch_mode;
            if let Some(database) = &args.database {
                break_options.database = Some(database.clone());
            }
            commands::break_lock(&break_options).await
        }
    }
}

fn load_settings(cli: &Cli) -> strata::Result<Settings> {
    if cli.no_config_file {
        return Ok(Settings::from_file(FileConfig::default()));
    }
    let file = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => match config::find_config() {
            Some(path) => config::load_config(&path)?,
            None => FileConfig::default(),
        },
    };
    Ok(Settings::from_file(file))
}

fn options(args: &MigrationArgs, settings: &Settings, batch_mode: bool) -> MigrationOptions {
    let mut options = MigrationOptions::from_settings(settings);
    if !args.sources.is_empty() {
        options.sources = args.sources.clone();
    }
    if let Some(database) = &args.database {
        options.database = Some(database.clone());
    }
    if let Some(table) = &args.migration_table {
        options.migration_table = table.clone();
    }
    options.match_pattern = args.match_pattern.clone();
    options.all = args.all;
    options.force = args.force;
    options.prompt_password = args.prompt_password;
    options.revision = args.revision.clone();
    options.batch_mode = batch_mode;
    options
}

/// Map repeatable -v to a tracing filter: errors only by default, then
/// warn, info, debug. RUST_LOG overrides.
fn initialize_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        _ => "debug",
    };
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(level)
    };
    fmt().with_env_filter(filter).with_target(false).init();
}
