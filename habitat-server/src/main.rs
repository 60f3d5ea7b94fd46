mod admin;
mod config;
mod node;

use clap::{Parser, Subcommand};
use config::HabitatConfig;
use node::Node;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "habitat")]
#[command(about = "Personal server node hosting self-managed apps")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Serve {
        /// Path to configuration file (YAML, TOML or JSON)
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "habitat=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            let cfg = match HabitatConfig::load(config.as_deref()) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("Failed to load config: {}", e);
                    std::process::exit(1);
                }
            };

            if let Err(e) = serve(cfg).await {
                tracing::error!("Node error: {:#}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn serve(config: HabitatConfig) -> anyhow::Result<()> {
    tracing::info!(
        "Starting Habitat node at {} (admin {}, proxy {})",
        config.path.display(),
        config.admin_addr,
        config.proxy_addr
    );
    let node = Node::start(config).await?;
    node.serve().await?;
    Ok(())
}
