use clap::{Parser, Subcommand};

use crate::config::NodeConfig;
use crate::error::NodeError;

#[derive(Parser)]
#[command(
    name = "junction",
    about = "Junction peer: gossip chat, direct messages and file exchange over libp2p",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the peer with an interactive console
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "junction.toml")]
        config: String,
        /// Use built-in defaults instead of reading a config file
        #[arg(long)]
        defaults: bool,
        /// Listen multiaddr, replaces the configured ones (can be specified multiple times)
        #[arg(long = "listen")]
        listen: Vec<String>,
        /// Skip relay resolution (for isolated local testing)
        #[arg(long)]
        no_relay: bool,
        /// Hex-encoded 32-byte seed for a deterministic peer identity
        #[arg(long)]
        keypair_seed: Option<String>,
        /// Override the directory fetched files are written to
        #[arg(long)]
        download_dir: Option<String>,
        /// Fetch every announced file automatically
        #[arg(long)]
        auto_fetch: bool,
    },
    /// Initialize a new node configuration
    Init {
        /// Output directory
        #[arg(short, long, default_value = ".")]
        dir: String,
    },
}

/// The log level configured for `run`, if the config file can be read.
pub fn configured_log_level(cli: &Cli) -> Option<String> {
    match &cli.command {
        Command::Run {
            config,
            defaults: false,
            ..
        } => NodeConfig::load(config).ok().map(|c| c.logging.level),
        _ => None,
    }
}

pub async fn run(cli: Cli) -> Result<(), NodeError> {
    match cli.command {
        Command::Run {
            config,
            defaults,
            listen,
            no_relay,
            keypair_seed,
            download_dir,
            auto_fetch,
        } => {
            crate::banner::print_banner();

            let mut config = if defaults {
                NodeConfig::default()
            } else {
                NodeConfig::load(&config)?
            };

            // Apply CLI overrides.
            if !listen.is_empty() {
                config.network.listen_addrs = listen;
            }
            if no_relay {
                config.network.resolve_relays = false;
            }
            if let Some(seed) = keypair_seed {
                config.network.keypair_seed = Some(seed);
            }
            if let Some(dir) = download_dir {
                config.files.download_dir = dir;
            }
            if auto_fetch {
                config.files.auto_fetch = true;
            }

            let peer_config = config.to_peer_config()?;

            {
                let dim = console::Style::new().dim();
                let cyan = console::Style::new().cyan();
                println!(
                    "  {} {}",
                    dim.apply_to("Listen   "),
                    cyan.apply_to(config.network.listen_addrs.join(", ")),
                );
                let relays = if peer_config.resolve_relays {
                    format!("{} bootstrap peers", peer_config.bootstrap_peer_ids.len())
                } else {
                    "disabled".to_string()
                };
                println!("  {} {}", dim.apply_to("Relays   "), cyan.apply_to(relays));
                println!(
                    "  {} {}{}",
                    dim.apply_to("Downloads"),
                    cyan.apply_to(&config.files.download_dir),
                    if config.files.auto_fetch {
                        dim.apply_to(" (auto-fetch)").to_string()
                    } else {
                        String::new()
                    },
                );
                println!();
            }

            crate::node::run(peer_config, config.files).await
        }
        Command::Init { dir } => {
            let path = NodeConfig::init(&dir)?;
            println!("Configuration written to {}", path.display());
            Ok(())
        }
    }
}
