//! Coordinator binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use streamcoord::{common::CoordinatorConfig, Coordinator};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "streamcoord-coord")]
#[command(about = "streamcoord ingestion cluster coordinator")]
#[command(version = streamcoord::BUILD_INFO)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start coordinator server
    Serve {
        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Coordinator instance ID
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<String>,

        /// Address advertised to other processes as leader hint
        #[arg(long)]
        advertise: Option<String>,

        /// Database directory
        #[arg(long)]
        db: Option<PathBuf>,

        /// Lead from startup without an external elector
        #[arg(long)]
        standalone: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            id,
            bind,
            advertise,
            db,
            standalone,
        } => {
            // File and environment first, then CLI arguments on top
            let mut coord_config = CoordinatorConfig::load(config.as_deref())?;
            if let Some(id) = id {
                coord_config.node_id = id;
            }
            if let Some(bind) = bind {
                coord_config.bind_addr = bind.parse()?;
            }
            if let Some(advertise) = advertise {
                coord_config.advertise_addr = Some(advertise);
            }
            if let Some(db) = db {
                coord_config.db_path = db;
            }
            if standalone {
                coord_config.standalone = true;
            }
            coord_config.validate()?;

            let coord = Coordinator::new(coord_config);
            coord.serve().await?;
        }
    }

    Ok(())
}
