use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use warden::bus::LogBus;
use warden::config::SupervisorConfig;
use warden::supervise::SupervisionGroup;

/// Warden - a local process supervisor
#[derive(Parser)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the service configuration file (TOML or JSON)
    #[arg(short, long, default_value = "warden.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = SupervisorConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    info!("loaded {} services", config.services.len());

    let bus = LogBus::new();
    let group = SupervisionGroup::new(config, bus.clone());
    let startup = group.start_all();

    // Stream the bus until the operator interrupts us.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_millis(250)) => {
                for event in bus.drain() {
                    println!("{}", event);
                }
            }
        }
    }

    group.shutdown().await;
    let _ = startup.await;
    for event in bus.drain() {
        println!("{}", event);
    }

    for snapshot in group.statuses() {
        println!(
            "{}: {} (restarts: {})",
            snapshot.name, snapshot.status, snapshot.restarts
        );
    }

    Ok(())
}
