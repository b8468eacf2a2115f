use std::{
    fs,
    path::{Path, PathBuf},
};

use image::imageops::FilterType;
use ndarray::{Array3, Array4, Axis};
use rayon::prelude::*;
use tracing::{info, instrument, warn};

use crate::{config::ImageSize, error::DeepStockError};

/// Loads chart artifacts into a normalised `(n, H, W, 3)` batch.
#[derive(Debug, Clone)]
pub struct ImageLoader {
    size: ImageSize,
}

impl ImageLoader {
    pub fn new(size: ImageSize) -> Self {
        Self { size }
    }

    /**
    Read every file in `dir` in lexicographic file-name order.

    Each image is resized to the configured size and scaled to `[0, 1]`.
    Files that cannot be decoded are skipped with a warning, so the batch may
    be shorter than the directory listing.
     */
    #[instrument(skip(self), fields(dir = %dir.display()))]
    pub fn load_dir(&self, dir: &Path) -> Result<Array4<f64>, DeepStockError> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        let decoded: Vec<Option<Array3<f64>>> = files
            .par_iter()
            .map(|path| match self.load_file(path) {
                Ok(img) => Some(img),
                Err(e) => {
                    warn!("Skipping unreadable image {}: {}", path.display(), e);
                    None
                }
            })
            .collect();
        let images: Vec<Array3<f64>> = decoded.into_iter().flatten().collect();

        if images.len() < files.len() {
            warn!(
                "{} of {} images were skipped; later modalities may pair with shifted charts",
                files.len() - images.len(),
                files.len()
            );
        }
        info!("Loaded {} images", images.len());
        self.stack(images)
    }

    /// Decodes, resizes and normalises one image to `(H, W, 3)`.
    pub fn load_file(&self, path: &Path) -> Result<Array3<f64>, DeepStockError> {
        let img = image::open(path)?.to_rgb8();
        let resized = image::imageops::resize(&img, self.size.width, self.size.height, FilterType::Triangle);
        let (h, w) = (self.size.height as usize, self.size.width as usize);
        let array = Array3::from_shape_vec((h, w, 3), resized.into_raw())?
            .mapv(|v: u8| v as f64 / 255.0);
        Ok(array)
    }

    fn stack(&self, images: Vec<Array3<f64>>) -> Result<Array4<f64>, DeepStockError> {
        let (h, w) = (self.size.height as usize, self.size.width as usize);
        let mut batch = Array4::zeros((images.len(), h, w, 3));
        for (mut slot, img) in batch.axis_iter_mut(Axis(0)).zip(images.iter()) {
            slot.assign(img);
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    fn write_solid(dir: &Path, name: &str, value: u8) {
        RgbImage::from_pixel(10, 6, Rgb([value, value, value]))
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn test_load_dir_orders_and_normalises() {
        let dir = tempdir().unwrap();
        write_solid(dir.path(), "chart_000002.png", 255);
        write_solid(dir.path(), "chart_000000.png", 0);
        write_solid(dir.path(), "chart_000001.png", 51);

        let loader = ImageLoader::new(ImageSize::new(4, 5));
        let batch = loader.load_dir(dir.path()).unwrap();
        assert_eq!(batch.dim(), (3, 4, 5, 3));
        assert!(batch.index_axis(Axis(0), 0).iter().all(|&v| v == 0.0));
        assert!(batch
            .index_axis(Axis(0), 1)
            .iter()
            .all(|&v| (v - 0.2).abs() < 1e-9));
        assert!(batch.index_axis(Axis(0), 2).iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_unreadable_files_are_skipped() {
        let dir = tempdir().unwrap();
        write_solid(dir.path(), "chart_000000.png", 10);
        fs::write(dir.path().join("chart_000001.png"), b"not an image").unwrap();
        write_solid(dir.path(), "chart_000002.png", 20);

        let loader = ImageLoader::new(ImageSize::new(3, 3));
        let batch = loader.load_dir(dir.path()).unwrap();
        assert_eq!(batch.dim().0, 2);
    }

    #[test]
    fn test_missing_dir_is_an_error() {
        let dir = tempdir().unwrap();
        let loader = ImageLoader::new(ImageSize::new(3, 3));
        assert!(matches!(
            loader.load_dir(&dir.path().join("missing")),
            Err(DeepStockError::IoError(_))
        ));
    }
}
