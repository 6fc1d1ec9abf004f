use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use beach_canvas::config::{Cli, Commands, ServerConfig};
use beach_canvas::{probe, server, telemetry::Telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = Telemetry::init()?;

    let args = match cli.into_command() {
        Commands::Serve(args) => args,
        Commands::Probe { action } => {
            if let Err(err) = probe::run_probe(action).await {
                error!("probe failed: {err:#}");
                std::process::exit(1);
            }
            return Ok(());
        }
    };

    let config = ServerConfig::try_from(args)?;
    info!(
        listen_addr = %config.listen_addr,
        width = config.width,
        height = config.height,
        snapshot_path = %config.snapshot_path.display(),
        batch_size = config.batcher.batch_size,
        flush_interval_ms = config.batcher.flush_interval.as_millis() as u64,
        "starting beach-canvas server"
    );

    server::run(config, telemetry.metrics_handle()).await
}
