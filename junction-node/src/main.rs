use clap::Parser;
use tracing_subscriber::EnvFilter;

mod banner;
mod cli;
mod config;
mod error;
mod input;
mod node;

fn main() {
    let cli = cli::Cli::parse();

    // RUST_LOG wins over the level in the config file.
    let level = cli::configured_log_level(&cli).unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    rt.block_on(async {
        if let Err(e) = cli::run(cli).await {
            tracing::error!("Fatal error: {}", e);
            std::process::exit(1);
        }
    });
}
