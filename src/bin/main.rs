//! Inferflow binary.
//!
//! Model-management CLI over the metadata store and artifact directory.
//! The job pipeline itself is embedded by the serving process; this binary
//! covers the catalog side: register, list, delete.

use clap::Parser;
use inferflow_core::cli::commands::Commands;
use inferflow_core::cli::handlers::{handle_delete, handle_list, handle_register};
use inferflow_core::config::{Args, ServiceConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub args: Args,

    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("inferflow_core=info")),
        )
        .with_target(true)
        .init();

    let config = ServiceConfig::load(&cli.args)?;

    match cli.command {
        Commands::Register(cmd) => handle_register(&config, cmd).await?,
        Commands::List => handle_list(&config).await?,
        Commands::Delete(cmd) => handle_delete(&config, cmd).await?,
    }

    Ok(())
}
