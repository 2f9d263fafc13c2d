//! nearchat CLI entry point

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nearchat_cli::{
    app::ChatApp,
    cli::Cli,
    config::{CliConfig, LogConfig},
    error::Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_configuration(&cli)?;
    config.apply_overrides(&cli);
    setup_logging(&config.log);
    info!("Using the {:?} radio backend", config.backend);

    let app = ChatApp::new(config);
    if let Err(e) = app.run(cli.command).await {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

/// `RUST_LOG` wins over the configured filter
fn setup_logging(log: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(log.with_target)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Load configuration from file or use defaults
fn load_configuration(cli: &Cli) -> Result<CliConfig> {
    match &cli.config {
        Some(path) => CliConfig::load_from_file(path),
        None => Ok(CliConfig::default()),
    }
}
