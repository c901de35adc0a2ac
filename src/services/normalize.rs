use image::{imageops, imageops::FilterType, DynamicImage, GenericImageView, ImageReader, Rgba, RgbaImage};
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::Config;
use crate::core::asset::{LogoAsset, LogoFormat, NormalizedImage};
use crate::services::{Failure, ProgressCallback, Stage};

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Unsupported format: {format}")]
    UnsupportedFormat { format: String },

    #[error("Invalid SVG {path}: {reason}")]
    Svg { path: String, reason: String },
}

/// Re-renders logos onto one fixed transparent canvas: crop to the visible
/// content, shrink to fit, centre.
pub struct NormalizerService {
    canvas_width: u32,
    canvas_height: u32,
    progress: Option<ProgressCallback>,
}

pub struct NormalizeReport {
    pub images: Vec<NormalizedImage>,
    pub failures: Vec<Failure>,
}

impl NormalizerService {
    pub fn new(canvas_width: u32, canvas_height: u32) -> Self {
        Self {
            canvas_width,
            canvas_height,
            progress: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.normalize.canvas_width, config.normalize.canvas_height)
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Normalize every asset into `dest_dir`, in parallel. Output order follows
    /// the input; assets that cannot be processed are reported, not fatal.
    /// Each domain is written once: later assets for a domain already seen
    /// are reported instead of racing for the same output file.
    pub fn normalize_all(&self, assets: &[LogoAsset], dest_dir: &Path) -> Result<NormalizeReport, NormalizeError> {
        fs::create_dir_all(dest_dir)?;

        let mut claimed = HashSet::new();
        let mut unique = Vec::with_capacity(assets.len());
        let mut duplicates = Vec::new();
        for asset in assets {
            if claimed.insert(asset.domain.as_str()) {
                unique.push(asset);
            } else {
                let name = asset.path.file_name().unwrap_or_default().to_string_lossy().into_owned();
                log::warn!("Skipping {}: {} is already being normalized", name, asset.domain);
                duplicates.push(Failure::new(name, Stage::Normalize, "duplicate identity"));
            }
        }

        let results: Vec<Result<NormalizedImage, Failure>> = unique
            .par_iter()
            .map(|asset| {
                let result = self.normalize_asset(asset, dest_dir).map_err(|e| {
                    log::warn!("Failed processing {}: {}", asset.path.display(), e);
                    Failure::new(&asset.domain, Stage::Normalize, e.to_string())
                });
                if let Some(progress) = &self.progress {
                    progress(asset.domain.as_str());
                }
                result
            })
            .collect();

        let mut report = NormalizeReport {
            images: Vec::with_capacity(results.len()),
            failures: duplicates,
        };
        for result in results {
            match result {
                Ok(image) => report.images.push(image),
                Err(failure) => report.failures.push(failure),
            }
        }
        log::info!(
            "Normalized {} of {} logos into {}",
            report.images.len(),
            assets.len(),
            dest_dir.display()
        );
        Ok(report)
    }

    /// Normalize one asset to `<dest_dir>/<domain>.png`.
    pub fn normalize_asset(&self, asset: &LogoAsset, dest_dir: &Path) -> Result<NormalizedImage, NormalizeError> {
        let img = if asset.format.is_vector() {
            self.rasterize_svg(&asset.path)?
        } else {
            self.load_image(&asset.path, asset.format)?
        };

        let canvas = self.normalize_image(&img);
        let dest = dest_dir.join(format!("{}.png", asset.domain));
        canvas.save(&dest)?;

        Ok(NormalizedImage {
            domain: asset.domain.clone(),
            path: dest,
            width: self.canvas_width,
            height: self.canvas_height,
        })
    }

    pub fn normalize_image(&self, img: &DynamicImage) -> RgbaImage {
        let rgba = crop_to_content(img.to_rgba8());
        let fitted = self.fit(rgba);

        let mut canvas = RgbaImage::from_pixel(self.canvas_width, self.canvas_height, Rgba([0, 0, 0, 0]));
        let x = (self.canvas_width - fitted.width()) / 2;
        let y = (self.canvas_height - fitted.height()) / 2;
        imageops::overlay(&mut canvas, &fitted, i64::from(x), i64::from(y));
        canvas
    }

    // Private helper methods

    fn load_image(&self, path: &Path, format: LogoFormat) -> Result<DynamicImage, NormalizeError> {
        let mut reader = ImageReader::open(path)?;
        match format.image_format() {
            Some(hint) => reader.set_format(hint),
            None => {
                return Err(NormalizeError::UnsupportedFormat {
                    format: format.extension().to_string(),
                });
            }
        }
        // Servers often lie about extensions; trust the bytes when they disagree.
        let reader = reader.with_guessed_format()?;
        Ok(reader.decode()?)
    }

    fn rasterize_svg(&self, path: &Path) -> Result<DynamicImage, NormalizeError> {
        use resvg::{tiny_skia, usvg};

        let svg_err = |reason: String| NormalizeError::Svg {
            path: path.display().to_string(),
            reason,
        };
        let data = fs::read(path)?;
        let tree = usvg::Tree::from_data(&data, &usvg::Options::default())
            .map_err(|e| svg_err(e.to_string()))?;

        let size = tree.size();
        let scale = (self.canvas_width as f32 / size.width()).min(self.canvas_height as f32 / size.height());
        let width = ((size.width() * scale).round() as u32).clamp(1, self.canvas_width);
        let height = ((size.height() * scale).round() as u32).clamp(1, self.canvas_height);

        let mut pixmap = tiny_skia::Pixmap::new(width, height)
            .ok_or_else(|| svg_err(format!("cannot allocate {width}x{height} raster")))?;
        resvg::render(&tree, tiny_skia::Transform::from_scale(scale, scale), &mut pixmap.as_mut());

        let mut img = RgbaImage::new(width, height);
        for (dst, src) in img.pixels_mut().zip(pixmap.pixels()) {
            let c = src.demultiply();
            *dst = Rgba([c.red(), c.green(), c.blue(), c.alpha()]);
        }
        Ok(DynamicImage::ImageRgba8(img))
    }

    /// Shrink to fit the canvas, keeping the aspect ratio. Never enlarges.
    fn fit(&self, img: RgbaImage) -> RgbaImage {
        let (width, height) = img.dimensions();
        if width <= self.canvas_width && height <= self.canvas_height {
            return img;
        }
        let ratio = (self.canvas_width as f32 / width as f32).min(self.canvas_height as f32 / height as f32);
        let new_width = ((width as f32 * ratio).round() as u32).clamp(1, self.canvas_width);
        let new_height = ((height as f32 * ratio).round() as u32).clamp(1, self.canvas_height);
        imageops::resize(&img, new_width, new_height, FilterType::Lanczos3)
    }
}

/// Crop to the bounding box of pixels with non-zero alpha. Fully transparent
/// images are returned unchanged.
pub fn crop_to_content(img: RgbaImage) -> RgbaImage {
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0, 0);
    for (x, y, pixel) in img.enumerate_pixels() {
        if pixel[3] > 0 {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }
    if min_x == u32::MAX {
        return img;
    }
    if (min_x, min_y, max_x + 1, max_y + 1) == (0, 0, img.width(), img.height()) {
        return img;
    }
    img.view(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1).to_image()
}

/// Logo files in `dir` (non-recursive), sorted by name. Files with an
/// unsupported extension are reported as failures, as is every file whose
/// domain was already claimed by an earlier name (`acme.com.bmp` wins over
/// `acme.com.png`).
pub fn discover_assets(dir: &Path) -> Result<(Vec<LogoAsset>, Vec<Failure>), NormalizeError> {
    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    paths.sort();

    let mut assets = Vec::new();
    let mut failures = Vec::new();
    let mut claimed = HashSet::new();
    for path in paths {
        match LogoAsset::from_path(&path)? {
            Some(asset) if !claimed.insert(asset.domain.clone()) => {
                let name = path.file_name().unwrap_or_default().to_string_lossy().into_owned();
                log::warn!("Skipping {}: another file already provides {}", name, asset.domain);
                failures.push(Failure::new(name, Stage::Normalize, "duplicate identity"));
            }
            Some(asset) => assets.push(asset),
            None => {
                let name = path.file_name().unwrap_or_default().to_string_lossy().into_owned();
                log::warn!("Unsupported file type for {}", name);
                failures.push(Failure::new(name, Stage::Normalize, "unsupported file type"));
            }
        }
    }
    Ok((assets, failures))
}
