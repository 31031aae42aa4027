use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use nextflow_spawner_cli::commands::{self, Command};
use nextflow_spawner_cli::config::Config;

#[derive(Parser)]
#[command(name = "nextflow-spawner")]
#[command(about = "Spawn Nextflow pipelines for notebook hub users", version)]
struct Args {
    /// Configuration file layered over config/default and config/local
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for per-user state and logs
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Log level, overriding the configured one
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // The proxy entry point runs inside the user's environment and needs no configuration
    if let Command::Ignite = args.command {
        let output = commands::run(Command::Ignite, &Config::default()).await?;
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(state_dir) = args.state_dir {
        config.state_dir = state_dir;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let logs_dir = config.logs_dir();
    std::fs::create_dir_all(&logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(&logs_dir, "nextflow-spawner.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let console = if config.logging.format == "json" {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(env_filter.clone())
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(env_filter.clone())
            .boxed()
    };

    tracing_subscriber::registry()
        .with(console)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(env_filter),
        )
        .init();

    info!("nextflow-spawner {}", env!("CARGO_PKG_VERSION"));
    debug!("Workflow: {}", config.spawner.workflow_url);
    debug!("State directory: {}", config.state_dir.display());

    let output = commands::run(args.command, &config).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
