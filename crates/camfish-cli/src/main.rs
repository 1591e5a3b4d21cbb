use std::path::PathBuf;

use anyhow::{Context, Result};
use camfish_core::QueryCatalog;
use camfish_sync::{build_pipeline, load_query_catalog, run_migrations, CollectorConfig, Interrupt};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "camfish")]
#[command(about = "Collects Korean fishing and camping spots into the CamFish database")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the collector over the query catalog (default)
    Collect {
        /// YAML file with a `queries:` list; defaults to the built-in catalog
        #[arg(long)]
        queries: Option<PathBuf>,
        /// Only process the first N queries
        #[arg(long)]
        limit: Option<usize>,
        /// Write to an in-memory store instead of the configured backend
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply schema migrations to DATABASE_URL
    Migrate,
    /// Print the query catalog
    Queries {
        #[arg(long)]
        queries: Option<PathBuf>,
    },
}

fn catalog(path: Option<&PathBuf>) -> Result<QueryCatalog> {
    match path {
        Some(path) => load_query_catalog(path),
        None => Ok(QueryCatalog::builtin()),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Collect {
        queries: None,
        limit: None,
        dry_run: false,
    });

    match command {
        Commands::Collect {
            queries,
            limit,
            dry_run,
        } => {
            let config = CollectorConfig::from_env(!dry_run).context("collector configuration")?;
            let catalog = catalog(queries.as_ref())?.limited(limit);
            info!(queries = catalog.len(), dry_run, "starting collector");
            let pipeline = build_pipeline(&config).await?;

            let interrupt = Interrupt::new();
            let listener = interrupt.listen_for_ctrl_c();
            let summary = pipeline.run(&catalog, &interrupt).await;
            listener.abort();

            println!(
                "collect {}: run_id={} processed={}/{} failed={} saved={}",
                if summary.interrupted { "interrupted" } else { "complete" },
                summary.run_id,
                summary.queries_processed,
                summary.queries_total,
                summary.queries_failed,
                summary.saved_places
            );
        }
        Commands::Migrate => {
            let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required for migrate")?;
            info!("applying migrations");
            run_migrations(&database_url).await?;
            println!("migrations applied");
        }
        Commands::Queries { queries } => {
            for (idx, query) in catalog(queries.as_ref())?.iter().enumerate() {
                println!("{:>2}. {query}", idx + 1);
            }
        }
    }

    Ok(())
}
