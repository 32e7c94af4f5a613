//! granaryd — the Granary silo daemon.
//!
//! Loads configuration, joins the cluster, and only then serves the
//! grain-state API. On Ctrl-C the silo leaves the cluster before exiting.
//!
//! # Usage
//!
//! ```text
//! granaryd run --config /etc/granary/granary.toml
//! granaryd check-config --config /etc/granary/granary.toml
//! ```

mod silo_mode;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use granary_core::GranaryConfig;
use granary_core::config::machine_name;

#[derive(Parser)]
#[command(name = "granaryd", about = "Granary silo daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Join the cluster and serve grain state until interrupted.
    Run {
        /// Path to the TOML configuration file.
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Validate configuration (file plus environment) and print the result.
    CheckConfig {
        #[arg(long, short)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config } => {
            let config = load_config(&config, |key| std::env::var(key).ok())?;
            silo_mode::run_silo(config).await
        }
        Command::CheckConfig { config } => {
            let config = load_config(&config, |key| std::env::var(key).ok())?;
            print!("{}", describe(&config));
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,granaryd=debug"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Read the file, apply `GRANARY_*` overrides, validate.
fn load_config<F>(path: &Path, lookup: F) -> anyhow::Result<GranaryConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = GranaryConfig::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    config
        .apply_env_overrides(lookup)
        .context("applying environment overrides")?;
    config
        .validate()
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(config)
}

fn describe(config: &GranaryConfig) -> String {
    let m = &config.membership;
    format!(
        "configuration OK\n\
         \x20 identity:    {}\n\
         \x20 silo:        {}\n\
         \x20 endpoint:    {}\n\
         \x20 backend:     {} (namespaces {}, {})\n\
         \x20 credential:  {}\n\
         \x20 lease:       {} (heartbeat {}, detection {}, grace {}, retention {})\n\
         \x20 api:         {}\n",
        config.identity(),
        config.silo_name(&machine_name()),
        config.endpoint(),
        config.backend.endpoint,
        config.backend.namespace("membership"),
        config.backend.namespace("grains"),
        if config.backend.credential.is_some() { "set" } else { "none" },
        m.lease_duration,
        m.heartbeat_interval,
        m.detection_interval,
        m.suspect_grace,
        m.dead_retention,
        config.api.listen,
    )
}
