//! fixbase: fix knowledge base sync daemon
//!
//! Keeps the local fix dictionary in step with the shared repository and
//! runs the idle-time maintenance jobs. See `fixbase help`.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};

use fixbase::cli::{execute_command, Commands};
use fixbase::Config;

#[derive(Parser)]
#[command(name = "fixbase")]
#[command(about = "Local-first fix knowledge base with shared, quality-gated publishing")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "FIXBASE_CONFIG", default_value = "fixbase.toml")]
    config: PathBuf,

    /// Data directory (overrides config file)
    #[arg(short, long, env = "FIXBASE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Local owner identity (overrides config file)
    #[arg(long, env = "FIXBASE_IDENTITY")]
    identity: Option<String>,

    /// Log level for fixbase (trace, debug, info, warn, error)
    #[arg(long, env = "FIXBASE_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    fixbase::logging::init(cli.log_level.as_deref())?;

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if !cli.config.exists() {
        debug!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    // Apply CLI overrides
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = data_dir;
    }
    if let Some(identity) = cli.identity {
        config.node.identity = identity;
    }
    info!(
        identity = %config.node.identity,
        data_dir = %config.node.data_dir.display(),
        "fixbase"
    );

    match execute_command(cli.command, config).await {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
