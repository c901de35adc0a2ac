use image::{imageops::FilterType, DynamicImage, GenericImageView, ImageReader};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::cluster::ClusterError;

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("Failed to decode {path}: {reason}")]
    Decode { path: String, reason: String },

    #[error("Backbone error: {0}")]
    Backbone(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Maps one decoded image to a fixed-length feature vector.
///
/// Every vector produced by a given strategy instance has the same length,
/// which is what lets a batch of them be clustered together.
pub trait FeatureStrategy {
    /// Acquire whatever the strategy needs before a batch starts. An error
    /// here concerns the whole batch, not a single image.
    fn prepare(&self) -> Result<(), FeatureError> {
        Ok(())
    }

    fn extract(&self, image: &DynamicImage) -> Result<Vec<f32>, FeatureError>;
}

/// Raw RGBA values of a small resized copy, row-major.
#[derive(Debug, Clone, Copy)]
pub struct PixelStrategy {
    width: u32,
    height: u32,
}

impl PixelStrategy {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn dimension(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

impl Default for PixelStrategy {
    fn default() -> Self {
        Self::new(64, 64)
    }
}

impl FeatureStrategy for PixelStrategy {
    fn extract(&self, image: &DynamicImage) -> Result<Vec<f32>, FeatureError> {
        let rgba = if image.dimensions() == (self.width, self.height) {
            image.to_rgba8()
        } else {
            image
                .resize_exact(self.width, self.height, FilterType::CatmullRom)
                .to_rgba8()
        };
        Ok(rgba.into_raw().into_iter().map(f32::from).collect())
    }
}

/// Feature vectors index-aligned with the identities they were computed for.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeatureMatrix {
    ids: Vec<String>,
    rows: Vec<Vec<f32>>,
}

impl FeatureMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(ids: Vec<String>, rows: Vec<Vec<f32>>) -> Result<Self, ClusterError> {
        if ids.len() != rows.len() {
            return Err(ClusterError::Misaligned {
                ids: ids.len(),
                rows: rows.len(),
            });
        }
        Ok(Self { ids, rows })
    }

    pub fn push(&mut self, id: impl Into<String>, row: Vec<f32>) {
        self.ids.push(id.into());
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn rows(&self) -> &[Vec<f32>] {
        &self.rows
    }

    /// Replace the rows, keeping the identity order. Used by the scaler.
    pub(crate) fn with_rows(&self, rows: Vec<Vec<f32>>) -> Self {
        debug_assert_eq!(rows.len(), self.ids.len());
        Self {
            ids: self.ids.clone(),
            rows,
        }
    }
}

/// An input that was left out of the batch, and why.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionFailure {
    pub id: String,
    pub path: PathBuf,
    pub reason: String,
}

pub fn load_image(path: &Path) -> Result<DynamicImage, FeatureError> {
    let decode_err = |reason: String| FeatureError::Decode {
        path: path.display().to_string(),
        reason,
    };
    ImageReader::open(path)
        .map_err(|e| decode_err(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| decode_err(e.to_string()))?
        .decode()
        .map_err(|e| decode_err(e.to_string()))
}

/// Decode and featurize every `(id, path)` input in order.
///
/// The strategy is prepared once up front; if that fails the batch fails.
/// Inputs that fail individually, or repeat an identity already seen, are
/// reported and excluded. The matrix only ever holds vectors that were
/// actually computed, one per identity.
pub fn extract_batch<S: FeatureStrategy + ?Sized>(
    strategy: &S,
    inputs: &[(String, PathBuf)],
) -> Result<(FeatureMatrix, Vec<ExtractionFailure>), FeatureError> {
    strategy.prepare()?;

    let mut matrix = FeatureMatrix::new();
    let mut failures = Vec::new();
    let mut seen = HashSet::new();

    for (id, path) in inputs {
        if !seen.insert(id.as_str()) {
            log::warn!("Excluding {}: identity {} already in the batch", path.display(), id);
            failures.push(ExtractionFailure {
                id: id.clone(),
                path: path.clone(),
                reason: "duplicate identity".to_string(),
            });
            continue;
        }
        match load_image(path).and_then(|img| strategy.extract(&img)) {
            Ok(row) => {
                log::debug!("extracted {} features for {}", row.len(), id);
                matrix.push(id.clone(), row);
            }
            Err(e) => {
                log::warn!("Excluding {} from the batch: {}", id, e);
                failures.push(ExtractionFailure {
                    id: id.clone(),
                    path: path.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    log::info!(
        "Extracted features for {} of {} images ({} excluded)",
        matrix.len(),
        inputs.len(),
        failures.len()
    );
    Ok((matrix, failures))
}
