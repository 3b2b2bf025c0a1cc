//! nat64-rs
//!
//! Operator CLI for the stateful NAT64 core: validates configuration files
//! and prints the defaults.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nat64_state::{FilteringEngine, L4Protocol, Nat64Config};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nat64-rs")]
#[command(version)]
#[command(about = "Stateful NAT64 (RFC 6146) filtering core")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate a configuration file
    ///
    /// Static BIB entries are installed into a scratch engine so conflicts
    /// between them are reported too.
    CheckConfig {
        /// Path to config file (default: ~/.config/nat64-rs/nat64.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the default configuration as TOML
    Defaults,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match &args.command {
        Command::CheckConfig { config } => check_config(config.as_deref()),
        Command::Defaults => {
            let text = toml::to_string_pretty(&Nat64Config::default())
                .context("Failed to serialize default configuration")?;
            print!("{}", text);
            Ok(())
        }
    }
}

fn check_config(path: Option<&std::path::Path>) -> Result<()> {
    let (path, config) = config::load_config(path)?;
    let engine = FilteringEngine::from_config(&config)
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    log::info!("Configuration {} is valid", path.display());

    let filtering = engine.config().snapshot();
    println!("pool4:");
    for prefix in &config.pool4.prefixes {
        println!("  {}", prefix);
    }
    println!(
        "  ports {}-{}",
        config.pool4.port_range.0, config.pool4.port_range.1
    );
    println!("pool6: {}", engine.pool6().prefix());
    println!("timeouts:");
    println!("  udp          {:?}", filtering.udp_timeout());
    println!("  icmp         {:?}", filtering.icmp_timeout());
    println!("  tcp est      {:?}", filtering.tcp_est_timeout());
    println!("  tcp trans    {:?}", filtering.tcp_trans_timeout());
    println!("  tcp syn      {:?}", filtering.tcp_incoming_syn_timeout());
    println!("policies:");
    println!("  drop_by_addr                  {}", filtering.drop_by_addr);
    println!(
        "  drop_externally_initiated_tcp {}",
        filtering.drop_externally_initiated_tcp
    );
    println!("  filter_icmpv6_info            {}", filtering.filter_icmpv6_info);
    println!("reaper interval: {:?}", config.reaper.interval());

    println!("static BIB:");
    let mut any = false;
    for protocol in L4Protocol::ALL {
        let mut entries = engine.bib_entries(protocol);
        entries.sort_by_key(|entry| entry.ipv4);
        for entry in entries {
            any = true;
            println!("  {:<4} {} <-> {}", protocol.to_string(), entry.ipv6, entry.ipv4);
        }
    }
    if !any {
        println!("  (none)");
    }

    Ok(())
}
