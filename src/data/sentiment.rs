use std::collections::HashMap;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{config::FetchConfig, error::DeepStockError};

/// Score used whenever sentiment cannot be collected.
pub const NEUTRAL_SENTIMENT: f64 = 0.0;

/// Result of asking a source for a sentiment score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SentimentOutcome {
    Scored(f64),
    Unavailable { reason: String },
}

impl SentimentOutcome {
    /// The score, or the neutral default when unavailable.
    pub fn value(&self) -> f64 {
        match self {
            SentimentOutcome::Scored(score) => *score,
            SentimentOutcome::Unavailable { .. } => NEUTRAL_SENTIMENT,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, SentimentOutcome::Scored(_))
    }

    /// The recoverable error this outcome stands for, if any.
    pub fn error(&self) -> Option<DeepStockError> {
        match self {
            SentimentOutcome::Scored(_) => None,
            SentimentOutcome::Unavailable { reason } => {
                Some(DeepStockError::SentimentUnavailable(reason.clone()))
            }
        }
    }
}

/// Produces one sentiment scalar in roughly `[-1, 1]` for a news page.
///
/// Implementations never fail: collection problems are reported as
/// [`SentimentOutcome::Unavailable`].
#[allow(async_fn_in_trait)]
pub trait SentimentSource {
    async fn fetch_score(&self, url: &str) -> SentimentOutcome;
}

/// Word-polarity scorer with negation and intensifier handling.
#[derive(Debug, Clone)]
pub struct LexiconScorer {
    polarity: HashMap<&'static str, f64>,
    intensifiers: HashMap<&'static str, f64>,
    negations: Vec<&'static str>,
}

impl Default for LexiconScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl LexiconScorer {
    pub fn new() -> Self {
        let polarity = [
            ("beat", 0.6),
            ("beats", 0.6),
            ("best", 1.0),
            ("boost", 0.5),
            ("bullish", 0.8),
            ("gain", 0.5),
            ("gains", 0.5),
            ("good", 0.7),
            ("great", 0.8),
            ("growth", 0.5),
            ("high", 0.2),
            ("jump", 0.5),
            ("jumps", 0.5),
            ("optimistic", 0.6),
            ("outperform", 0.6),
            ("positive", 0.5),
            ("profit", 0.5),
            ("rally", 0.6),
            ("record", 0.4),
            ("rise", 0.4),
            ("rises", 0.4),
            ("soar", 0.8),
            ("soars", 0.8),
            ("strong", 0.45),
            ("surge", 0.7),
            ("surges", 0.7),
            ("upgrade", 0.6),
            ("win", 0.8),
            ("bad", -0.7),
            ("bearish", -0.8),
            ("cut", -0.4),
            ("cuts", -0.4),
            ("decline", -0.5),
            ("declines", -0.5),
            ("downgrade", -0.6),
            ("drop", -0.5),
            ("drops", -0.5),
            ("fall", -0.5),
            ("falls", -0.5),
            ("fear", -0.6),
            ("fears", -0.6),
            ("loss", -0.6),
            ("losses", -0.6),
            ("low", -0.2),
            ("miss", -0.6),
            ("misses", -0.6),
            ("negative", -0.5),
            ("plunge", -0.8),
            ("plunges", -0.8),
            ("recession", -0.7),
            ("risk", -0.3),
            ("selloff", -0.7),
            ("slump", -0.7),
            ("tumble", -0.7),
            ("weak", -0.5),
            ("worst", -1.0),
        ]
        .into_iter()
        .collect();
        let intensifiers = [
            ("very", 1.3),
            ("extremely", 1.5),
            ("sharply", 1.4),
            ("strongly", 1.3),
            ("slightly", 0.5),
            ("somewhat", 0.7),
        ]
        .into_iter()
        .collect();
        Self {
            polarity,
            intensifiers,
            negations: vec!["not", "no", "never", "without", "isn't", "aren't", "won't", "don't", "doesn't"],
        }
    }

    /// Mean polarity of the opinion words in `text`, 0.0 when there are none.
    pub fn score(&self, text: &str) -> f64 {
        let lowered = text.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !(c.is_alphanumeric() || c == '\''))
            .filter(|t| !t.is_empty())
            .collect();

        let mut total = 0.0;
        let mut hits = 0usize;
        for (i, token) in tokens.iter().enumerate() {
            let Some(&base) = self.polarity.get(*token) else {
                continue;
            };
            let mut value = base;
            if let Some(&factor) = i
                .checked_sub(1)
                .and_then(|j| self.intensifiers.get(tokens[j]))
            {
                value *= factor;
            }
            let negated = tokens[i.saturating_sub(3)..i]
                .iter()
                .any(|t| self.negations.iter().any(|n| *n == *t));
            if negated {
                value *= -0.5;
            }
            total += value;
            hits += 1;
        }

        if hits == 0 {
            0.0
        } else {
            (total / hits as f64).clamp(-1.0, 1.0)
        }
    }
}

/// Text of every `<h2>` element, with nested tags stripped.
pub fn extract_headlines(html: &str) -> Vec<String> {
    // ASCII lowercasing keeps byte offsets aligned with `html`.
    let lowered = html.to_ascii_lowercase();
    let mut headlines = Vec::new();
    let mut cursor = 0;
    while let Some(open) = lowered[cursor..].find("<h2").map(|p| p + cursor) {
        let Some(body_start) = lowered[open..].find('>').map(|p| p + open + 1) else {
            break;
        };
        let Some(close) = lowered[body_start..].find("</h2").map(|p| p + body_start) else {
            break;
        };
        let text = decode_entities(&strip_tags(&html[body_start..close]));
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !text.is_empty() {
            headlines.push(text);
        }
        cursor = close + 4;
    }
    headlines
}

fn strip_tags(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    let mut in_tag = false;
    for c in fragment.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn decode_entities(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Scores the `<h2>` headlines of a news page.
#[derive(Debug, Clone)]
pub struct HeadlineSentimentSource {
    client: reqwest::Client,
    fetch: FetchConfig,
    scorer: LexiconScorer,
}

impl HeadlineSentimentSource {
    pub fn new(fetch: &FetchConfig) -> Result<Self, DeepStockError> {
        let client = reqwest::Client::builder()
            .user_agent("Mozilla/5.0")
            .timeout(fetch.timeout())
            .build()?;
        Ok(Self {
            client,
            fetch: fetch.clone(),
            scorer: LexiconScorer::new(),
        })
    }

    async fn get_page(&self, url: &str) -> Result<String, reqwest::Error> {
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }

    /// Mean headline score of a page body.
    pub fn score_page(&self, html: &str) -> f64 {
        let headlines = extract_headlines(html);
        if headlines.is_empty() {
            return NEUTRAL_SENTIMENT;
        }
        let total: f64 = headlines.iter().map(|h| self.scorer.score(h)).sum();
        total / headlines.len() as f64
    }
}

impl SentimentSource for HeadlineSentimentSource {
    #[instrument(skip(self))]
    async fn fetch_score(&self, url: &str) -> SentimentOutcome {
        let attempts = self.fetch.max_retries + 1;
        let mut reason = String::new();
        for attempt in 1..=attempts {
            match self.get_page(url).await {
                Ok(html) => {
                    let score = self.score_page(&html);
                    debug!("Sentiment for {} is {:.4}", url, score);
                    return SentimentOutcome::Scored(score);
                }
                Err(e) => {
                    warn!("Error fetching news (attempt {}/{}): {}", attempt, attempts, e);
                    reason = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.fetch.retry_delay()).await;
                    }
                }
            }
        }
        SentimentOutcome::Unavailable { reason }
    }
}

/// Produces one sentiment score per target, memoising each URL within a run.
#[derive(Debug)]
pub struct SentimentScorer<S> {
    source: S,
    cache: HashMap<String, SentimentOutcome>,
}

impl<S: SentimentSource> SentimentScorer<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            cache: HashMap::new(),
        }
    }

    pub async fn outcome(&mut self, url: &str) -> SentimentOutcome {
        if let Some(outcome) = self.cache.get(url) {
            return outcome.clone();
        }
        let outcome = self.source.fetch_score(url).await;
        if let Some(e) = outcome.error() {
            warn!("{}. Using neutral score {}", e, NEUTRAL_SENTIMENT);
        }
        self.cache.insert(url.to_string(), outcome.clone());
        outcome
    }

    /// `(count, 1)` scores, one per target index.
    pub async fn score_targets(&mut self, url: &str, count: usize) -> Array2<f64> {
        let outcome = self.outcome(url).await;
        info!(
            "Sentiment for {} targets: {:.4} ({})",
            count,
            outcome.value(),
            if outcome.is_available() { "scored" } else { "neutral default" }
        );
        Array2::from_elem((count, 1), outcome.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    struct CountingSource {
        calls: AtomicUsize,
        outcome: SentimentOutcome,
    }

    impl SentimentSource for CountingSource {
        async fn fetch_score(&self, _url: &str) -> SentimentOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    fn quick_fetch() -> FetchConfig {
        FetchConfig {
            timeout_secs: 2,
            max_retries: 1,
            retry_delay_ms: 1,
        }
    }

    #[test]
    fn test_lexicon_polarity() {
        let scorer = LexiconScorer::new();
        assert!(scorer.score("Apple shares surge after record profit") > 0.0);
        assert!(scorer.score("Stocks plunge on recession fears") < 0.0);
        assert_eq!(scorer.score("Company schedules annual meeting"), 0.0);
    }

    #[test]
    fn test_negation_and_intensifier() {
        let scorer = LexiconScorer::new();
        let plain = scorer.score("a good quarter");
        let strong = scorer.score("a very good quarter");
        let negated = scorer.score("not a good quarter");
        assert!(strong > plain);
        assert!(negated < 0.0);
    }

    #[test]
    fn test_extract_headlines() {
        let html = r#"<html><body><H2 class="t">Stocks <b>surge</b> &amp; rally</H2>
            <p>ignored</p><h2>Markets slump</h2><h2>   </h2></body></html>"#;
        assert_eq!(
            extract_headlines(html),
            vec!["Stocks surge & rally".to_string(), "Markets slump".to_string()]
        );
    }

    #[test]
    fn test_outcome_value_defaults_to_neutral() {
        let outcome = SentimentOutcome::Unavailable {
            reason: "timeout".to_string(),
        };
        assert_eq!(outcome.value(), NEUTRAL_SENTIMENT);
        assert!(matches!(
            outcome.error(),
            Some(DeepStockError::SentimentUnavailable(_))
        ));
        assert_eq!(SentimentOutcome::Scored(0.4).value(), 0.4);
    }

    #[tokio::test]
    async fn test_scorer_memoises_and_fills_targets() {
        let source = CountingSource {
            calls: AtomicUsize::new(0),
            outcome: SentimentOutcome::Scored(0.25),
        };
        let mut scorer = SentimentScorer::new(source);
        let scores = scorer.score_targets("https://example.com/news", 7).await;
        let again = scorer.score_targets("https://example.com/news", 3).await;
        assert_eq!(scores.dim(), (7, 1));
        assert!(scores.iter().all(|&s| s == 0.25));
        assert_eq!(again.dim(), (3, 1));
        assert_eq!(scorer.source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unavailable_source_yields_neutral_scores() {
        let source = CountingSource {
            calls: AtomicUsize::new(0),
            outcome: SentimentOutcome::Unavailable {
                reason: "boom".to_string(),
            },
        };
        let mut scorer = SentimentScorer::new(source);
        let scores = scorer.score_targets("https://example.com/news", 4).await;
        assert!(scores.iter().all(|&s| s == NEUTRAL_SENTIMENT));
    }

    #[tokio::test]
    async fn test_http_error_status_does_not_raise() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = [0u8; 1024];
                let _ = socket.read(&mut request).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
                let _ = socket.shutdown().await;
            }
        });

        let source = HeadlineSentimentSource::new(&quick_fetch()).unwrap();
        let outcome = source.fetch_score(&format!("http://{}/news", addr)).await;
        assert!(!outcome.is_available());
        assert_eq!(outcome.value(), 0.0);
    }

    #[tokio::test]
    async fn test_scores_served_page() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let body = "<h2>Shares surge</h2><h2>Strong growth ahead</h2>";
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut request = [0u8; 1024];
                let _ = socket.read(&mut request).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        let source = HeadlineSentimentSource::new(&quick_fetch()).unwrap();
        let outcome = source.fetch_score(&format!("http://{}/news", addr)).await;
        assert!(outcome.is_available());
        assert!(outcome.value() > 0.0);
    }

    #[tokio::test]
    async fn test_unreachable_host_does_not_raise() {
        let source = HeadlineSentimentSource::new(&quick_fetch()).unwrap();
        let outcome = source.fetch_score("http://127.0.0.1:9/news").await;
        assert_eq!(outcome.value(), NEUTRAL_SENTIMENT);
    }
}
