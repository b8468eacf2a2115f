use std::process::ExitCode;

use clap::Parser;
use deepstock::{args::Args, config::DeepStockConfig, logging::setup_tracing, pipeline};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let _guard = match setup_tracing(Some(&args.log_dir)) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to set up logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let config = match DeepStockConfig::read_config(Some(&args.config)) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match pipeline::run(&config).await {
        Ok(summary) => {
            info!(
                "Trained on {} samples. {}. Model saved to {}",
                summary.samples,
                summary.evaluation,
                summary.model_path.display()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Pipeline failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
