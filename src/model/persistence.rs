use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write as _},
    path::Path,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{error::DeepStockError, model::fusion::HybridModel};

// Bump when the layout of `HybridModel` changes.
const MODEL_FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct ArtifactRef<'a> {
    version: u32,
    model: &'a HybridModel,
}

#[derive(Deserialize)]
struct Artifact {
    version: u32,
    model: HybridModel,
}

/// Writes the trained model, including its scaler, with bincode.
#[instrument(skip(model), fields(path = %path.display()))]
pub fn save_model(path: &Path, model: &HybridModel) -> Result<(), DeepStockError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let artifact = ArtifactRef {
        version: MODEL_FORMAT_VERSION,
        model,
    };
    let bytes = bincode::serde::encode_into_std_write(&artifact, &mut writer, bincode::config::standard())?;
    writer.flush()?;
    info!("Saved model ({} bytes) to {}", bytes, path.display());
    Ok(())
}

/// Reads a model written by [`save_model`].
#[instrument(fields(path = %path.display()))]
pub fn load_model(path: &Path) -> Result<HybridModel, DeepStockError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let artifact: Artifact =
        bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())?;
    if artifact.version != MODEL_FORMAT_VERSION {
        return Err(DeepStockError::ConfigError(format!(
            "model artifact version {} is not supported (expected {})",
            artifact.version, MODEL_FORMAT_VERSION
        )));
    }
    debug!("Loaded model artifact version {}", artifact.version);
    Ok(artifact.model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{DenseUnits, ImageSize, ModelConfig},
        data::window::MinMaxScaler,
    };
    use ndarray::{Array2, Array3, Array4};
    use tempfile::tempdir;

    fn model() -> HybridModel {
        let config = ModelConfig {
            cnn_filters: [2, 2],
            cnn_kernel_size: 3,
            lstm_units: [3, 2],
            dense_units: DenseUnits {
                image: 3,
                sequence: 3,
                sentiment: 2,
            },
            dropout_rate: 0.5,
        };
        let mut model = HybridModel::new(&config, ImageSize::new(5, 4), 8, 21).unwrap();
        model.set_scaler(MinMaxScaler::fit(&[10.0, 30.0]).unwrap());
        model
    }

    #[test]
    fn test_reloaded_model_predicts_identically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("model.bin");
        let original = model();
        save_model(&path, &original).unwrap();
        let loaded = load_model(&path).unwrap();

        let images = Array4::from_shape_fn((3, 5, 4, 3), |(b, i, j, c)| ((b + i + j + c) % 4) as f64 / 4.0);
        let sequences = Array3::from_shape_fn((3, 8, 1), |(b, t, _)| (b + t) as f64 / 10.0);
        let sentiments = Array2::from_elem((3, 1), 0.3);
        assert_eq!(
            original.predict(&images, &sequences, &sentiments).unwrap(),
            loaded.predict(&images, &sequences, &sentiments).unwrap()
        );
        assert_eq!(loaded.scaler(), original.scaler());
        assert_eq!(loaded.config(), original.config());
    }

    #[test]
    fn test_load_garbage_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.bin");
        fs::write(&path, b"definitely not a model").unwrap();
        assert!(load_model(&path).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            load_model(&dir.path().join("missing.bin")),
            Err(DeepStockError::IoError(_))
        ));
    }
}
