// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SBN bridge daemon
//!
//! Loads a bridge configuration, attaches it to a local bus and relays
//! traffic until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Run with a configuration file
//! sbn-bridge --config sbn.toml
//!
//! # Print peer status every 5 seconds
//! sbn-bridge --config sbn.toml --stats-interval 5
//!
//! # Generate an example configuration
//! sbn-bridge gen-config --output sbn.toml
//!
//! # Check a configuration without starting
//! sbn-bridge validate --config sbn.toml
//! ```

use clap::{Parser, Subcommand};
use sbn::{Bridge, BridgeConfig, Dispatcher, HousekeepingSnapshot, MemoryBus, ModuleRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const STATUS_TIMEOUT: Duration = Duration::from_secs(2);

/// Software Bus Network bridge
#[derive(Parser, Debug)]
#[command(name = "sbn-bridge")]
#[command(about = "SBN bridge - relays local bus traffic between nodes")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "sbn.toml")]
    config: PathBuf,

    /// Statistics reporting interval (seconds, 0 to disable)
    #[arg(long, default_value = "10")]
    stats_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "sbn.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Some(cmd) = args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let config = BridgeConfig::from_file(&args.config)?;

    // Applications attach to the same bus through their own clients.
    let bus = MemoryBus::new();
    let registry = ModuleRegistry::with_builtins(&config);
    let bridge = Bridge::load(&config, registry, Arc::new(bus.client("sbn")))?;
    let dispatcher = Dispatcher::new(bridge);
    let handle = dispatcher.handle();

    println!("SBN bridge v{}", env!("CARGO_PKG_VERSION"));
    println!("=====================================");
    println!();
    println!("Node: {}", handle.bridge().identity());
    for net in handle.bridge().nets() {
        println!(
            "Network {}: {} ({} peer(s))",
            net.index(),
            net.transport().name(),
            net.peers().len()
        );
    }
    println!();
    println!("Press Ctrl+C to stop...");
    println!();

    let main_loop = std::thread::Builder::new()
        .name("sbn-main".into())
        .spawn(move || dispatcher.run())?;

    let stats_interval = args.stats_interval;
    let stats_handle = handle.clone();
    if stats_interval > 0 {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(stats_interval));
            interval.tick().await;
            loop {
                interval.tick().await;
                if !stats_handle.is_running() {
                    break;
                }
                let query = stats_handle.clone();
                match tokio::task::spawn_blocking(move || query.housekeeping(STATUS_TIMEOUT)).await
                {
                    Ok(Ok(hk)) => print_stats(&hk),
                    Ok(Err(e)) => tracing::warn!("housekeeping unavailable: {}", e),
                    Err(e) => tracing::warn!("housekeeping task failed: {}", e),
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    let final_stats = handle.bridge().housekeeping();
    handle.stop();
    match tokio::task::spawn_blocking(move || main_loop.join()).await? {
        Ok(result) => result?,
        Err(_) => tracing::error!("main loop panicked"),
    }

    println!("\nFinal Statistics:");
    print_stats(&final_stats);
    Ok(())
}

fn cmd_gen_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let toml_str = toml::to_string_pretty(&BridgeConfig::example())?;

    let content = format!(
        r#"# SBN Bridge Configuration
# Generated by sbn-bridge gen-config

{}
"#,
        toml_str
    );

    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    match BridgeConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Node: {}", config.node.identity());
            println!("Filters: {}", config.filters.len());
            println!("Networks: {}", config.networks.len());
            for (i, net) in config.networks.iter().enumerate() {
                println!(
                    "  [{}] {} on {}: {} peer(s)",
                    i,
                    net.transport,
                    net.address,
                    net.peers.len()
                );
                for peer in &net.peers {
                    println!(
                        "      processor {} (spacecraft {}) at {}",
                        peer.processor_id, peer.spacecraft_id, peer.address
                    );
                }
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_stats(hk: &HousekeepingSnapshot) {
    println!(
        "--- Bridge {} (up {}s) ---",
        hk.identity,
        hk.uptime.as_secs()
    );
    println!(
        "  commands: {} ok, {} failed; local subscriptions: {}; peers: {}/{} connected",
        hk.command_count,
        hk.command_err_count,
        hk.local_sub_count,
        hk.connected_peers(),
        hk.peers.len()
    );
    for peer in &hk.peers {
        println!(
            "  net {} peer {}: {}, {} sent ({} err), {} recv ({} err), {} subs, last recv {:.1}s ago",
            peer.net,
            peer.processor_id,
            if peer.connected { "up" } else { "down" },
            peer.send_count,
            peer.send_err_count,
            peer.recv_count,
            peer.recv_err_count,
            peer.sub_count,
            peer.since_recv.as_secs_f64()
        );
    }
}
