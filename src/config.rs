use std::{
    fs::File,
    io::{BufReader, Write as _},
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_yaml::from_reader;
use tracing::{debug, info, instrument};

use crate::error::DeepStockError;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DeepStockConfig {
    pub ticker: String,
    #[serde(rename = "start-date")]
    pub start_date: String,
    #[serde(rename = "end-date")]
    pub end_date: String,
    #[serde(rename = "window-size")]
    pub window_size: usize,
    #[serde(rename = "chart-dir")]
    pub chart_dir: PathBuf,
    #[serde(rename = "chart-size")]
    pub chart_size: ImageSize,
    #[serde(rename = "render-size", default = "default_render_size")]
    pub render_size: ImageSize,
    #[serde(rename = "news-url")]
    pub news_url: String,
    #[serde(rename = "model-path")]
    pub model_path: PathBuf,
    #[serde(rename = "market-data", default)]
    pub market_data: MarketDataConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub height: u32,
    pub width: u32,
}

impl ImageSize {
    pub fn new(height: u32, width: u32) -> Self {
        Self { height, width }
    }
}

/// Where the raw closing-price series comes from.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(tag = "source", rename_all = "kebab-case")]
pub enum MarketDataConfig {
    #[default]
    Yahoo,
    Csv { path: PathBuf },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ModelConfig {
    pub cnn_filters: [usize; 2],
    pub cnn_kernel_size: usize,
    pub lstm_units: [usize; 2],
    pub dense_units: DenseUnits,
    pub dropout_rate: f64,
}

/// Embedding width of each modality branch.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct DenseUnits {
    pub image: usize,
    pub sequence: usize,
    pub sentiment: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            cnn_filters: [32, 64],
            cnn_kernel_size: 3,
            lstm_units: [50, 50],
            dense_units: DenseUnits {
                image: 128,
                sequence: 64,
                sentiment: 32,
            },
            dropout_rate: 0.5,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub epochs: usize,
    pub validation_split: f64,
    pub test_size: f64,
    pub random_state: u64,
    pub learning_rate: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            epochs: 10,
            validation_split: 0.2,
            test_size: 0.2,
            random_state: 42,
            learning_rate: 0.001,
        }
    }
}

/// Network policy shared by the market data and sentiment collaborators.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_retries: 3,
            retry_delay_ms: 500,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn default_render_size() -> ImageSize {
    ImageSize::new(150, 300)
}

const DEFAULT_DATA: &str = r#"
ticker: "AAPL"
start-date: "2020-01-01"
end-date: "2023-01-01"
window-size: 30
chart-dir: "./charts"
chart-size:
  height: 64
  width: 64
render-size:
  height: 150
  width: 300
news-url: "https://finance.yahoo.com/quote/AAPL/news"
model-path: "deep-stock-predictor.bin"
market-data:
  source: yahoo
model:
  cnn-filters: [32, 64]
  cnn-kernel-size: 3
  lstm-units: [50, 50]
  dense-units:
    image: 128
    sequence: 64
    sentiment: 32
  dropout-rate: 0.5
training:
  batch-size: 32
  epochs: 10
  validation-split: 0.2
  test-size: 0.2
  random-state: 42
  learning-rate: 0.001
fetch:
  timeout-secs: 10
  max-retries: 3
  retry-delay-ms: 500
"#;

impl Default for DeepStockConfig {
    fn default() -> Self {
        Self {
            ticker: "AAPL".to_string(),
            start_date: "2020-01-01".to_string(),
            end_date: "2023-01-01".to_string(),
            window_size: 30,
            chart_dir: PathBuf::from("./charts"),
            chart_size: ImageSize::new(64, 64),
            render_size: default_render_size(),
            news_url: "https://finance.yahoo.com/quote/AAPL/news".to_string(),
            model_path: PathBuf::from("deep-stock-predictor.bin"),
            market_data: MarketDataConfig::Yahoo,
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            fetch: FetchConfig::default(),
        }
    }
}

impl DeepStockConfig {
    /// Reads the configuration from a YAML file.
    ///
    /// If the file does not exist, it creates a default configuration file.
    ///
    /// # Arguments
    ///
    /// * `filename` - Optional path to the configuration file.
    ///
    /// # Returns
    ///
    /// A `Result` containing the validated `DeepStockConfig` on success.
    #[instrument(level = "info", skip(filename))]
    pub fn read_config<P: AsRef<Path>>(filename: Option<P>) -> Result<Self, DeepStockError> {
        let path = filename
            .map(|p| p.as_ref().to_path_buf())
            .unwrap_or_else(|| Path::new("config.yml").to_path_buf());

        info!(path = %path.display(), "Reading configuration");

        if !path.exists() {
            info!(
                "Config file does not exist. Creating default config at {}",
                path.display()
            );
            let mut file = File::create(&path)?;
            file.write_all(DEFAULT_DATA.as_bytes())?;
            debug!("Default configuration file created");
            return Ok(DeepStockConfig::default());
        }

        let file = File::open(&path)?;
        let reader = BufReader::new(file);
        let config: Self = from_reader(reader)?;
        config.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), DeepStockError> {
        let fail = |msg: String| Err(DeepStockError::ConfigError(msg));
        if self.ticker.trim().is_empty() {
            return fail("ticker must not be empty".to_string());
        }
        if self.window_size == 0 {
            return fail("window-size must be greater than 0".to_string());
        }
        for (name, size) in [("chart-size", self.chart_size), ("render-size", self.render_size)] {
            if size.height == 0 || size.width == 0 {
                return fail(format!("{} must have non-zero dimensions", name));
            }
        }
        let model = &self.model;
        if model.cnn_filters.contains(&0) || model.lstm_units.contains(&0) {
            return fail("layer widths must be greater than 0".to_string());
        }
        if model.cnn_kernel_size == 0 {
            return fail("cnn-kernel-size must be greater than 0".to_string());
        }
        let dense = model.dense_units;
        if dense.image == 0 || dense.sequence == 0 || dense.sentiment == 0 {
            return fail("dense-units must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&model.dropout_rate) {
            return fail(format!(
                "dropout-rate must be in [0, 1), got {}",
                model.dropout_rate
            ));
        }
        let training = &self.training;
        if training.batch_size == 0 || training.epochs == 0 {
            return fail("batch-size and epochs must be greater than 0".to_string());
        }
        for (name, fraction) in [
            ("validation-split", training.validation_split),
            ("test-size", training.test_size),
        ] {
            if !(fraction > 0.0 && fraction < 1.0) {
                return fail(format!("{} must be in (0, 1), got {}", name, fraction));
            }
        }
        if !(training.learning_rate > 0.0) {
            return fail("learning-rate must be positive".to_string());
        }
        self.start_date()?;
        self.end_date()?;
        Ok(())
    }

    pub fn start_date(&self) -> Result<NaiveDate, DeepStockError> {
        let date = NaiveDate::parse_from_str(&self.start_date, "%Y-%m-%d")?;
        Ok(date)
    }

    pub fn end_date(&self) -> Result<NaiveDate, DeepStockError> {
        let date = NaiveDate::parse_from_str(&self.end_date, "%Y-%m-%d")?;
        Ok(date)
    }
}
