mod demo;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use txscope::{DatabaseRegistry, DatabasesConfig, MemoryPoolFactory, PoolConfig};

#[derive(Parser)]
#[command(name = "txscope")]
#[command(about = "Scoped transaction demos over the in-memory store")]
#[command(version)]
struct Cli {
    /// JSON file describing the databases; defaults to one in-memory database
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database to run against, instead of the configured default
    #[arg(short, long)]
    database: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the end-to-end transaction scenarios
    Scenarios,
    /// Race user deletion against concurrent account inserts
    Race {
        #[arg(long, default_value_t = 20)]
        iterations: usize,
        /// Delete accounts before locking the user
        #[arg(long)]
        naive: bool,
    },
    /// Print the effective database configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => DatabasesConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DatabasesConfig::single("default", PoolConfig::new("default")),
    };

    if let Command::Config = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let factory = MemoryPoolFactory::new().with_schema(txscope::users::install_schema);
    let registry = DatabaseRegistry::from_config(&config, &factory)?;
    let database = match &cli.database {
        Some(name) => registry.database(name)?,
        None => registry.default_database()?,
    }
    .clone();

    let outcome = match cli.command {
        Command::Scenarios => demo::run_scenarios(&database).await,
        Command::Race { iterations, naive } => demo::run_race(&database, iterations, naive).await,
        Command::Config => Ok(()),
    };

    registry.shutdown().await?;
    outcome
}
