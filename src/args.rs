use std::path::PathBuf;

use clap::Parser;

/// Train the multi-modal stock price model end to end.
#[derive(Parser, Debug, Clone)]
#[command(name = "deepstock", version, about)]
pub struct Args {
    /// YAML configuration file. Created with defaults when missing.
    #[arg(short, long, env = "DEEPSTOCK_CONFIG", default_value = "config.yml")]
    pub config: PathBuf,
    /// Directory for the DEBUG log file.
    #[arg(short, long, env = "DEEPSTOCK_LOG_DIR", default_value = "logs")]
    pub log_dir: String,
}
