use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum DeepStockError {
    #[error("Failed to fetch price data: {0}")]
    DataFetch(String),
    #[error("Insufficient data: got {got} points but at least {required} are required ({context})")]
    InsufficientData {
        got: usize,
        required: usize,
        context: String,
    },
    #[error("Aligned batch is empty. Modality lengths were {lengths:?}.")]
    EmptyAlignment { lengths: [usize; 4] },
    #[error("Image values must lie in [0, 1] but the batch spans [{min}, {max}].")]
    InvalidInputRange { min: f64, max: f64 },
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}.")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("Sentiment unavailable: {0}")]
    SentimentUnavailable(String),
    #[error("Configuration Error: {0}")]
    ConfigError(String),
    #[error("Model has not been run forward before backward on {0}")]
    MissingForwardCache(Layer),
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serde YAML Error: {0}")]
    SerdeYamlError(#[from] serde_yaml::Error),
    #[error("Serde JSON Error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("CSV Error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Failed to parse date: {0}")]
    ParseDateError(#[from] chrono::ParseError),
    #[error("Shape Error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
    #[error("Chart Error: {0}")]
    ChartError(String),
    #[error("Image Error: {0}")]
    ImageError(#[from] image::ImageError),
    #[error("HTTP Error: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("Background task failed: {0}")]
    TaskError(#[from] tokio::task::JoinError),
    #[error("Failed to encode model: {0}")]
    EncodeError(#[from] bincode::error::EncodeError),
    #[error("Failed to decode model: {0}")]
    DecodeError(#[from] bincode::error::DecodeError),
}

/// Layer kinds named in backward-pass errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Dense,
    Conv2d,
    Lstm,
    Fusion,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Dense => write!(f, "dense layer"),
            Layer::Conv2d => write!(f, "conv2d layer"),
            Layer::Lstm => write!(f, "lstm layer"),
            Layer::Fusion => write!(f, "fusion head"),
        }
    }
}
