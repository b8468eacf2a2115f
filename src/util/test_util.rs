use std::path::Path;

use chrono::{Duration, TimeZone as _, Utc};
use tracing::{info, subscriber::set_default};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;

use crate::data::market::{PricePoint, RawSeries};

pub struct TracingGuards {
    _subscriber_guard: tracing::subscriber::DefaultGuard,
    _worker_guard: WorkerGuard,
}

/// Routes this thread's tracing output to `tests/logs/<test_name>.log`.
pub fn setup_test_tracing(test_name: &str) -> TracingGuards {
    let log_dir = Path::new("tests/logs");
    if !log_dir.exists() {
        std::fs::create_dir_all(log_dir).unwrap();
    }

    let file_appender = tracing_appender::rolling::never(log_dir, format!("{}.log", test_name));
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);

    let subscriber = fmt::Subscriber::builder()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_level(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_max_level(tracing::Level::DEBUG)
        .finish();

    let subscriber_guard = set_default(subscriber);
    info!("-----------------");
    info!("Test: {}", test_name);
    info!("-----------------");

    TracingGuards {
        _subscriber_guard: subscriber_guard,
        _worker_guard: worker_guard,
    }
}

/// Daily closes `start, start + step, ...` beginning on 2020-01-01.
pub fn linear_series(n: usize, start: f64, step: f64) -> RawSeries {
    series_from_fn(n, |i| start + step * i as f64)
}

pub fn constant_series(n: usize, close: f64) -> RawSeries {
    series_from_fn(n, |_| close)
}

pub fn series_from_fn(n: usize, close: impl Fn(usize) -> f64) -> RawSeries {
    let origin = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let points = (0..n)
        .map(|i| PricePoint {
            timestamp: origin + Duration::days(i as i64),
            close: close(i),
        })
        .collect();
    RawSeries::new(points).unwrap()
}
