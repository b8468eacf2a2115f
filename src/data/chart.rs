use std::{
    fs,
    path::{Path, PathBuf},
};

use image::RgbImage;
use plotters::prelude::*;
use rayon::prelude::*;
use tracing::{debug, info, instrument};

use crate::{
    config::ImageSize, data::market::RawSeries, error::DeepStockError, util::math_utils::min_max,
};

const LINE: RGBColor = RGBColor(31, 119, 180);
const MARGIN: i32 = 2;
const CHART_PREFIX: &str = "chart_";
const CHART_EXT: &str = "png";

/// File name for the chart of the window ending before `index`.
///
/// The index is zero-padded so lexicographic order matches index order.
pub fn chart_file_name(index: usize) -> String {
    format!("{}{:06}.{}", CHART_PREFIX, index, CHART_EXT)
}

/// Draws each window of closes as an axis-free line plot.
#[derive(Debug, Clone)]
pub struct ChartRasterizer {
    size: ImageSize,
    window_size: usize,
}

impl ChartRasterizer {
    pub fn new(size: ImageSize, window_size: usize) -> Self {
        Self { size, window_size }
    }

    /**
    Renders one window in memory with `plotters`.

    The canvas is white with no mesh or labels. A flat window is drawn as a
    horizontal line through the middle.
     */
    pub fn render_window(&self, closes: &[f64]) -> Result<RgbImage, DeepStockError> {
        let (width, height) = (self.size.width, self.size.height);
        let mut buffer = vec![0u8; width as usize * height as usize * 3];
        {
            let root = BitMapBackend::with_buffer(&mut buffer, (width, height)).into_drawing_area();
            root.fill(&WHITE).map_err(chart_error)?;

            if let Some((lo, hi)) = min_max(closes) {
                let (lo, hi) = if hi > lo { (lo, hi) } else { (lo - 0.5, hi + 0.5) };
                let last = closes.len().saturating_sub(1).max(1);
                let mut chart = ChartBuilder::on(&root)
                    .margin(MARGIN)
                    .build_cartesian_2d(0usize..last, lo..hi)
                    .map_err(chart_error)?;
                chart
                    .draw_series(LineSeries::new(
                        closes.iter().enumerate().map(|(i, &v)| (i, v)),
                        &LINE,
                    ))
                    .map_err(chart_error)?;
            }
            root.present().map_err(chart_error)?;
        }
        RgbImage::from_raw(width, height, buffer).ok_or_else(|| {
            DeepStockError::ChartError(format!("buffer does not fit a {}x{} image", width, height))
        })
    }

    /**
    Writes `chart_<index>.png` for every `index` in `W..N` into `dir`.

    Stale charts from earlier runs are removed first so the loader only sees
    this series. Windows are rendered in parallel, the returned paths are in
    index order.
     */
    #[instrument(skip(self, series), fields(points = series.len(), dir = %dir.display()))]
    pub fn render_all(&self, series: &RawSeries, dir: &Path) -> Result<Vec<PathBuf>, DeepStockError> {
        fs::create_dir_all(dir)?;
        let removed = clear_charts(dir)?;
        if removed > 0 {
            debug!("Removed {} stale charts", removed);
        }

        let closes = series.closes();
        let w = self.window_size;
        if w == 0 || w >= closes.len() {
            return Err(DeepStockError::InsufficientData {
                got: closes.len(),
                required: w + 1,
                context: "not enough prices to render a single chart".to_string(),
            });
        }

        let paths = (w..closes.len())
            .into_par_iter()
            .map(|i| -> Result<PathBuf, DeepStockError> {
                let path = dir.join(chart_file_name(i));
                self.render_window(&closes[i - w..i])?.save(&path)?;
                Ok(path)
            })
            .collect::<Result<Vec<PathBuf>, DeepStockError>>()?;

        info!("Rendered {} charts", paths.len());
        Ok(paths)
    }
}

fn clear_charts(dir: &Path) -> Result<usize, DeepStockError> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_chart = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(CHART_PREFIX) && n.ends_with(CHART_EXT));
        if is_chart && path.is_file() {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn chart_error<E: std::fmt::Display>(e: E) -> DeepStockError {
    DeepStockError::ChartError(e.to_string())
}
