use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone as _, Utc};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{config::FetchConfig, error::DeepStockError};

/// One closing price observation.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
}

/// Chronologically ordered closing prices with unique timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSeries {
    points: Vec<PricePoint>,
}

impl RawSeries {
    /**
    Build a series from unordered points.

    Points are sorted by timestamp. Empty input, duplicate timestamps and
    non-finite prices are rejected with `DataFetch` because no modality can be
    derived from them.
     */
    pub fn new(mut points: Vec<PricePoint>) -> Result<Self, DeepStockError> {
        if points.is_empty() {
            return Err(DeepStockError::DataFetch(
                "price series is empty".to_string(),
            ));
        }
        points.sort_by_key(|p| p.timestamp);
        if let Some(pair) = points.windows(2).find(|w| w[0].timestamp == w[1].timestamp) {
            return Err(DeepStockError::DataFetch(format!(
                "duplicate timestamp {}",
                pair[0].timestamp
            )));
        }
        if let Some(bad) = points.iter().find(|p| !p.close.is_finite()) {
            return Err(DeepStockError::DataFetch(format!(
                "non-finite close {} at {}",
                bad.close, bad.timestamp
            )));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[PricePoint] {
        &self.points
    }

    pub fn closes(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.close).collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Supplies the raw price series for a ticker over `[start, end)`.
#[allow(async_fn_in_trait)]
pub trait MarketDataSource {
    async fn fetch(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<RawSeries, DeepStockError>;
}

const YAHOO_BASE_URL: &str = "https://query1.finance.yahoo.com";

#[derive(Debug, Deserialize)]
struct YahooResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<YahooError>,
}

#[derive(Debug, Deserialize)]
struct YahooError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<Quote>,
}

#[derive(Debug, Deserialize)]
struct Quote {
    close: Vec<Option<f64>>,
}

/// Daily closes from the Yahoo Finance chart endpoint.
#[derive(Debug, Clone)]
pub struct YahooFinanceSource {
    client: reqwest::Client,
    base_url: String,
    fetch: FetchConfig,
}

impl YahooFinanceSource {
    pub fn new(fetch: &FetchConfig) -> Result<Self, DeepStockError> {
        Self::with_base_url(YAHOO_BASE_URL, fetch)
    }

    pub fn with_base_url(base_url: &str, fetch: &FetchConfig) -> Result<Self, DeepStockError> {
        let client = reqwest::Client::builder()
            .user_agent("Mozilla/5.0")
            .timeout(fetch.timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            fetch: fetch.clone(),
        })
    }

    async fn get_body(&self, url: &str) -> Result<String, reqwest::Error> {
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

impl MarketDataSource for YahooFinanceSource {
    #[instrument(skip(self))]
    async fn fetch(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<RawSeries, DeepStockError> {
        let url = format!(
            "{}/v8/finance/chart/{}?interval=1d&period1={}&period2={}",
            self.base_url,
            ticker,
            day_start(start).timestamp(),
            day_start(end).timestamp()
        );
        let attempts = self.fetch.max_retries + 1;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            debug!("Requesting {} (attempt {}/{})", url, attempt, attempts);
            match self.get_body(&url).await {
                Ok(body) => {
                    let series = parse_chart_response(&body)?;
                    info!("Fetched {} closes for {}", series.len(), ticker);
                    return Ok(series);
                }
                Err(e) => {
                    warn!("Price request for {} failed: {}", ticker, e);
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.fetch.retry_delay()).await;
                    }
                }
            }
        }
        Err(DeepStockError::DataFetch(format!(
            "{} unavailable after {} attempts: {}",
            ticker, attempts, last_error
        )))
    }
}

/// Parses a v8 chart body into a series, dropping rows without a close.
pub fn parse_chart_response(body: &str) -> Result<RawSeries, DeepStockError> {
    let response: YahooResponse = serde_json::from_str(body)?;
    if let Some(error) = response.chart.error {
        return Err(DeepStockError::DataFetch(format!(
            "Yahoo API error: {} - {}",
            error.code, error.description
        )));
    }
    let data = response
        .chart
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| DeepStockError::DataFetch("empty chart result".to_string()))?;
    let quote = data
        .indicators
        .quote
        .into_iter()
        .next()
        .ok_or_else(|| DeepStockError::DataFetch("missing Close column".to_string()))?;

    let mut points = Vec::new();
    for (ts, close) in data.timestamp.unwrap_or_default().into_iter().zip(quote.close) {
        let Some(close) = close else {
            continue;
        };
        let timestamp = Utc.timestamp_opt(ts, 0).single().ok_or_else(|| {
            DeepStockError::DataFetch(format!("invalid timestamp {}", ts))
        })?;
        points.push(PricePoint { timestamp, close });
    }
    RawSeries::new(points)
}

/// Reads a `Date,Close` table from disk. Other columns are ignored.
#[derive(Debug, Clone)]
pub struct CsvSource {
    path: PathBuf,
}

impl CsvSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn read_all(&self) -> Result<Vec<PricePoint>, DeepStockError> {
        let mut reader = csv::Reader::from_path(&self.path)?;
        let headers = reader.headers()?.clone();
        let column = |name: &str| headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name));
        let date_idx = column("Date")
            .ok_or_else(|| DeepStockError::DataFetch("missing Date column".to_string()))?;
        let close_idx = column("Close")
            .ok_or_else(|| DeepStockError::DataFetch("missing Close column".to_string()))?;

        let mut points = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let field = |idx: usize| record.get(idx).map(str::trim).unwrap_or_default();
            let timestamp = parse_timestamp(field(date_idx))?;
            let close = field(close_idx).parse::<f64>().map_err(|_| {
                DeepStockError::DataFetch(format!(
                    "unparseable close {:?} on row {}",
                    field(close_idx),
                    row + 1
                ))
            })?;
            let point = PricePointBuilder::default()
                .timestamp(timestamp)
                .close(close)
                .build()
                .map_err(|e| DeepStockError::DataFetch(e.to_string()))?;
            points.push(point);
        }
        Ok(points)
    }
}

impl MarketDataSource for CsvSource {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn fetch(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<RawSeries, DeepStockError> {
        let (from, to) = (day_start(start), day_start(end));
        let points: Vec<PricePoint> = self
            .read_all()?
            .into_iter()
            .filter(|p| p.timestamp >= from && p.timestamp < to)
            .collect();
        info!("Loaded {} closes for {} from CSV", points.len(), ticker);
        RawSeries::new(points)
    }
}

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DeepStockError> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(day_start(date));
    }
    let parsed = DateTime::parse_from_rfc3339(raw)?;
    Ok(parsed.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn point(day: u32, close: f64) -> PricePoint {
        PricePoint {
            timestamp: day_start(date(2024, 1, day)),
            close,
        }
    }

    #[test]
    fn test_series_is_sorted() {
        let series = RawSeries::new(vec![point(3, 3.0), point(1, 1.0), point(2, 2.0)]).unwrap();
        assert_eq!(series.closes(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_duplicate_timestamps_rejected() {
        let result = RawSeries::new(vec![point(1, 1.0), point(1, 2.0)]);
        assert!(matches!(result, Err(DeepStockError::DataFetch(_))));
    }

    #[test]
    fn test_empty_series_rejected() {
        assert!(matches!(
            RawSeries::new(vec![]),
            Err(DeepStockError::DataFetch(_))
        ));
    }

    #[test]
    fn test_parse_chart_response_skips_missing_closes() {
        let body = r#"{"chart":{"result":[{"timestamp":[1704153600,1704240000,1704326400],
            "indicators":{"quote":[{"close":[185.5,null,184.25]}]}}],"error":null}}"#;
        let series = parse_chart_response(body).unwrap();
        assert_eq!(series.closes(), vec![185.5, 184.25]);
    }

    #[test]
    fn test_parse_chart_response_api_error() {
        let body = r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found"}}}"#;
        assert!(matches!(
            parse_chart_response(body),
            Err(DeepStockError::DataFetch(_))
        ));
    }

    #[tokio::test]
    async fn test_csv_source_filters_range() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "Date,Open,Close").unwrap();
        writeln!(file, "2024-01-03,1,12.5").unwrap();
        writeln!(file, "2024-01-01,1,10.0").unwrap();
        writeln!(file, "2024-01-02,1,11.0").unwrap();
        writeln!(file, "2024-01-05,1,13.0").unwrap();

        let source = CsvSource::new(file.path());
        let series = source
            .fetch("TEST", date(2024, 1, 1), date(2024, 1, 4))
            .await
            .unwrap();
        assert_eq!(series.closes(), vec![10.0, 11.0, 12.5]);
    }

    #[tokio::test]
    async fn test_csv_source_missing_close() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "Date,Open").unwrap();
        writeln!(file, "2024-01-01,1").unwrap();

        let source = CsvSource::new(file.path());
        let result = source.fetch("TEST", date(2024, 1, 1), date(2024, 2, 1)).await;
        assert!(matches!(result, Err(DeepStockError::DataFetch(_))));
    }

    #[tokio::test]
    async fn test_yahoo_unreachable_is_data_fetch_error() {
        let fetch = FetchConfig {
            timeout_secs: 1,
            max_retries: 1,
            retry_delay_ms: 1,
        };
        let source = YahooFinanceSource::with_base_url("http://127.0.0.1:9", &fetch).unwrap();
        let result = source.fetch("AAPL", date(2024, 1, 1), date(2024, 2, 1)).await;
        assert!(matches!(result, Err(DeepStockError::DataFetch(_))));
    }
}
