//! The `coda` node binary: load and validate configuration, wire the
//! core services, run until interrupted.

mod bootstrap;

use std::path::PathBuf;

use clap::Parser;
use coda_domain::config::ConfigSeverity;

#[derive(Parser)]
#[command(name = "coda", about = "Coda assistant core node", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = bootstrap::load_config(&cli.config)?;

    let issues = config.validate();
    let mut fatal = false;
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Error => {
                fatal = true;
                tracing::error!("{issue}");
            }
            ConfigSeverity::Warning => tracing::warn!("{issue}"),
        }
    }
    if fatal {
        anyhow::bail!("configuration has errors, refusing to start");
    }
    if cli.check {
        println!("configuration OK ({} warnings)", issues.len());
        return Ok(());
    }

    bootstrap::run(config).await
}
