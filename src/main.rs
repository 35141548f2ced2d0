//! CLI for sensorpipe
//!
//! Runs the bundled `pzld-sensorbox` decoder as a pipeline worker. Settings
//! come from `--config` (default `config/default`), `.env` and
//! `SENSORPIPE_*` environment variables.

use std::process::ExitCode;

use clap::Parser;
use sensorpipe::config::{DEFAULT_CONFIG_PATH, LoggingSettings, load_config_from};
use sensorpipe::decoders::sensorbox;
use sensorpipe::utils::logging;
use sensorpipe::worker::run_worker;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "sensorpipe", version, about = "Pipeline worker for sensor data")]
struct Args {
    /// Configuration file, without extension
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Overrides `logging.level` from the configuration
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    // a missing .env file is fine
    let _ = dotenvy::dotenv();

    if let Err(e) = run(args).await {
        error!("Worker failed: {e:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut settings = match load_config_from(&args.config) {
        Ok(settings) => settings,
        Err(e) => {
            // logging is not configured yet
            logging::init(&LoggingSettings::default());
            return Err(e.into());
        }
    };
    if let Some(level) = args.log_level {
        settings.logging.level = level;
    }
    logging::init(&settings.logging);

    info!(
        worker = %settings.worker.id,
        decoder = sensorbox::WORKER_ID,
        "starting worker"
    );
    run_worker(settings, sensorbox::process).await
}
