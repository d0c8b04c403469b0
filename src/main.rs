use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bulkship::bulk::Verb;
use bulkship::cli::{self, ActionTemplate};
use bulkship::config;
use bulkship::core::Core;
use bulkship::transport::ScriptedTransport;

#[derive(Parser)]
#[command(name = "bulkship")]
#[command(version, about = "Ships write operations to a document store cluster in size-bounded bulk requests", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (environment variables are used when absent)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Disable TLS certificate verification
    #[arg(long, global = true)]
    insecure: bool,

    /// Answer every request from an in-memory healthy cluster
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Ship NDJSON documents
    Ship {
        /// Input file (stdin when omitted)
        #[arg(long)]
        file: Option<PathBuf>,

        /// Target index
        #[arg(long)]
        index: Option<String>,

        /// Bulk verb: index, create, update or delete
        #[arg(long, default_value = "index")]
        verb: Verb,

        /// Ingest pipeline
        #[arg(long)]
        pipeline: Option<String>,

        /// Document field used as the document id
        #[arg(long)]
        id_field: Option<String>,

        /// Documents per retrying submission
        #[arg(long, default_value = "500")]
        batch_size: usize,
    },

    /// Register the hosts and print endpoint health
    Health,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let mut config = config::load_config(cli.config.as_deref())?;
    if cli.insecure {
        config.cluster.ssl_verification = false;
    }

    let core = if cli.dry_run {
        Core::with_transport(config, Arc::new(ScriptedTransport::healthy_cluster())).await?
    } else {
        Core::new(config).await?
    };

    match cli.command {
        Commands::Ship {
            file,
            index,
            verb,
            pipeline,
            id_field,
            batch_size,
        } => {
            let template = ActionTemplate {
                verb,
                index,
                pipeline,
                id_field,
            };
            cli::cmd_ship(&core, file.as_deref(), template, batch_size).await?;
        }
        Commands::Health => {
            cli::cmd_health(&core).await?;
        }
    }

    Ok(())
}
