//! Cupboard CLI - command-line front end for the cupboard entity store.
//!
//! Entities are printed as JSON on stdout; logs and status lines go to
//! stderr.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use cupboard_core::{CupboardConfig, Entity, Filter, SyncStrategy, CONFIG_FILE};
use cupboard_storage::Cupboard;
use serde_json::Value;
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Name of the data directory `init` creates and other commands look for.
const DATA_DIR_NAME: &str = ".cupboard";

#[derive(Parser)]
#[command(name = "cupboard")]
#[command(about = "Cupboard - file-backed entity store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Data directory (defaults to the nearest .cupboard directory)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Sync strategy override: immediate, batch or on_close
    #[arg(long, global = true)]
    sync: Option<SyncStrategy>,

    /// Pending operations that trigger a flush under the batch strategy
    #[arg(long, global = true)]
    batch_size: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new cupboard
    Init {
        /// Path to initialize (defaults to current directory)
        path: Option<PathBuf>,
    },

    /// Print one row as JSON
    Get {
        /// Table name (crumbs, trails, links, properties, categories, stashes, metadata)
        table: String,
        id: String,
    },

    /// Insert or update a row from JSON; prints the id
    Set {
        table: String,

        /// Existing row to update (omit to insert)
        #[arg(long, default_value = "")]
        id: String,

        /// Row as a JSON object. On update, omitted fields take their
        /// defaults, except a crumb's name and properties, which are kept
        json: String,
    },

    /// List rows as a JSON array
    List {
        table: String,

        /// key=value; comma-separated values match any of them
        #[arg(short, long = "filter")]
        filters: Vec<String>,
    },

    /// Delete a row and whatever it cascades to
    Delete { table: String, id: String },

    /// Finish a trail
    Trail {
        #[command(subcommand)]
        action: TrailCommand,
    },

    /// Operate on a stash
    Stash {
        #[command(subcommand)]
        action: StashCommand,
    },

    /// Rebuild the cache from the JSONL files
    Rebuild,

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum TrailCommand {
    /// Complete an active trail, keeping its crumbs
    Complete { id: String },
    /// Abandon an active trail, discarding its crumbs
    Abandon { id: String },
}

#[derive(Subcommand)]
enum StashCommand {
    /// Print the stash value
    Get { id: String },
    /// Replace the value of a resource, artifact or context stash
    SetValue { id: String, json: String },
    /// Add to a counter stash
    Increment {
        id: String,
        #[arg(default_value_t = 1, allow_hyphen_values = true)]
        delta: i64,
    },
    /// Take a lock stash
    Acquire { id: String, holder: String },
    /// Release a lock stash
    Release { id: String, holder: String },
}

/// Find the .cupboard directory by walking up from the current directory.
fn find_data_dir() -> Result<PathBuf> {
    let mut current = env::current_dir()?;

    loop {
        let candidate = current.join(DATA_DIR_NAME);
        if candidate.is_dir() {
            return Ok(candidate);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => {
                return Err(anyhow!(
                    "No {} directory found. Run 'cupboard init' to create one.",
                    DATA_DIR_NAME
                ));
            }
        }
    }
}

/// Resolve the configuration: config.toml in the data directory, then flags.
fn resolve_config(cli: &Cli, data_dir: &Path) -> Result<CupboardConfig> {
    let mut config = CupboardConfig::load_or_default(data_dir)?;
    if let Some(strategy) = cli.sync {
        config.sync_strategy = strategy;
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    config.validate()?;
    Ok(config)
}

/// Parse repeated `key=value` flags. `a,b` becomes a membership test.
fn parse_filters(raw: &[String]) -> Result<Filter> {
    let mut filter = Filter::new();
    for item in raw {
        let (key, value) = item
            .split_once('=')
            .ok_or_else(|| anyhow!("filter {:?} is not key=value", item))?;
        let value = if value.contains(',') {
            Value::Array(
                value
                    .split(',')
                    .filter(|v| !v.is_empty())
                    .map(|v| Value::String(v.to_string()))
                    .collect(),
            )
        } else {
            Value::String(value.to_string())
        };
        filter.insert(key.trim().to_string(), value);
    }
    Ok(filter)
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("invalid JSON: {}", raw))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_entity(entity: &Entity) -> Result<()> {
    print_json(&entity.to_json()?)
}

async fn init(cli: &Cli, path: Option<&Path>) -> Result<()> {
    let root = path.unwrap_or_else(|| Path::new("."));
    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| root.join(DATA_DIR_NAME));

    let config = resolve_config(cli, &data_dir)?;
    if !data_dir.join(CONFIG_FILE).exists() {
        config.write()?;
    }

    let cupboard = Cupboard::attach(config).await?;
    cupboard.detach().await?;

    eprintln!("{}", "✓ Initialized cupboard".green().bold());
    eprintln!("  Data:     {}", data_dir.display());
    eprintln!("  Config:   {}", data_dir.join(CONFIG_FILE).display());
    Ok(())
}

/// Run one command against an attached cupboard.
async fn execute(cupboard: &Cupboard, command: Commands) -> Result<()> {
    match command {
        Commands::Get { table, id } => {
            let entity = cupboard.get_table(&table)?.get(&id).await?;
            print_entity(&entity)
        }

        Commands::Set { table, id, json } => {
            let value = parse_json(&json)?;
            let id = cupboard.get_table(&table)?.set_json(&id, value).await?;
            println!("{}", id);
            Ok(())
        }

        Commands::List { table, filters } => {
            let filter = parse_filters(&filters)?;
            let rows = cupboard.get_table(&table)?.fetch(&filter).await?;
            let rows = rows
                .iter()
                .map(Entity::to_json)
                .collect::<serde_json::Result<Vec<_>>>()?;
            print_json(&Value::Array(rows))
        }

        Commands::Delete { table, id } => {
            cupboard.get_table(&table)?.delete(&id).await?;
            eprintln!("{} {}", "✓ Deleted".green(), id.bright_cyan());
            Ok(())
        }

        Commands::Trail { action } => {
            let trail = match action {
                TrailCommand::Complete { id } => cupboard.complete_trail(&id).await?,
                TrailCommand::Abandon { id } => cupboard.abandon_trail(&id).await?,
            };
            print_entity(&trail.into())
        }

        Commands::Stash { action } => match action {
            StashCommand::Get { id } => print_json(&cupboard.stash_value(&id).await?),
            StashCommand::SetValue { id, json } => {
                let stash = cupboard.stash_set_value(&id, parse_json(&json)?).await?;
                print_entity(&stash.into())
            }
            StashCommand::Increment { id, delta } => {
                let count = cupboard.stash_increment(&id, delta).await?;
                println!("{}", count);
                Ok(())
            }
            StashCommand::Acquire { id, holder } => {
                let stash = cupboard.stash_acquire(&id, &holder).await?;
                print_entity(&stash.into())
            }
            StashCommand::Release { id, holder } => {
                let stash = cupboard.stash_release(&id, &holder).await?;
                print_entity(&stash.into())
            }
        },

        Commands::Rebuild => {
            let stats = cupboard.rebuild().await?;
            eprintln!(
                "{} {} rows",
                "✓ Rebuilt cache from JSONL:".green().bold(),
                stats.total_rows()
            );
            for (table, rows) in &stats.rows {
                eprintln!("  {:<12} {}", table.as_str(), rows);
            }
            Ok(())
        }

        Commands::Init { .. } | Commands::Version => Ok(()),
    }
}

async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Version => {
            println!("cupboard {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Commands::Init { path } => return init(&cli, path.as_deref()).await,
        _ => {}
    }

    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => find_data_dir()?,
    };
    let config = resolve_config(&cli, &data_dir)?;
    debug!("Using data directory {}", data_dir.display());

    let cupboard = Cupboard::attach(config).await?;
    let outcome = execute(&cupboard, cli.command).await;

    // Detach on every path so committed work always reaches JSONL
    let detached = cupboard.detach().await;
    outcome?;
    detached?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    info!("Cupboard CLI starting");

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
