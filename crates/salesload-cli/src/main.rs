use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use salesload_sync::LoadConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "salesload")]
#[command(about = "Load per-register sales CSV files into PostgreSQL")]
struct Cli {
    /// YAML config file; environment variables and flags override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct Overrides {
    #[arg(long, global = true)]
    database_url: Option<String>,
    #[arg(long, global = true)]
    incoming_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    processed_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    rejected_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    claimed_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    workers: Option<usize>,
}

impl Overrides {
    fn apply(self, config: &mut LoadConfig) {
        if let Some(v) = self.database_url {
            config.database_url = v;
        }
        if let Some(v) = self.incoming_dir {
            config.incoming_dir = v;
        }
        if let Some(v) = self.processed_dir {
            config.processed_dir = v;
        }
        if let Some(v) = self.rejected_dir {
            config.rejected_dir = v;
        }
        if let Some(v) = self.claimed_dir {
            config.claimed_dir = v;
        }
        if let Some(v) = self.workers {
            config.workers = v;
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process every file in the incoming directory (default).
    Ingest {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Create or upgrade the database schema.
    Migrate,
    /// Show row counts per table.
    Status,
    /// Return files left in the claimed directory by an interrupted run to incoming.
    Recover,
}

/// Used when `RUST_LOG` is unset. The binary's own target is its bin name, `salesload`.
const DEFAULT_LOG_FILTER: &str = "salesload=info,salesload_sync=info,salesload_storage=info";

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let mut config = LoadConfig::load(cli.config.as_deref())?;
    cli.overrides.apply(&mut config);
    config.validate()?;

    match cli.command.unwrap_or(Commands::Ingest { json: false }) {
        Commands::Ingest { json } => {
            let summary = salesload_sync::run_ingest_once(config).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "ingest complete: run_id={} processed={} rejected={} skipped={} stranded={} rows_inserted={} duplicates={}{}",
                    summary.run_id,
                    summary.processed,
                    summary.rejected,
                    summary.skipped,
                    summary.stranded,
                    summary.inserted_rows,
                    summary.duplicate_rows,
                    if summary.cancelled { " (cancelled)" } else { "" }
                );
            }
        }
        Commands::Migrate => {
            salesload_sync::migrate(&config).await?;
            println!("schema up to date: {}", config.database_url_masked());
        }
        Commands::Status => {
            let counts = salesload_sync::store_counts(&config).await?;
            println!(
                "shops={} cash_registers={} sales_lines={}",
                counts.shops, counts.cash_registers, counts.sales_lines
            );
        }
        Commands::Recover => {
            let report = salesload_sync::recover_claims(&config).await?;
            println!("released {} claimed file(s)", report.released.len());
            for path in &report.conflicts {
                println!("left in place (name already in incoming): {}", path.display());
            }
        }
    }

    Ok(())
}
