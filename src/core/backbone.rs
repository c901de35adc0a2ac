use image::{imageops::FilterType, DynamicImage, GenericImageView};
use once_cell::sync::OnceCell;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tract_onnx::prelude::*;

use crate::config::Config;
use crate::core::features::{FeatureError, FeatureStrategy};

/// ImageNet channel statistics the backbone was trained with.
pub const CHANNEL_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const CHANNEL_STD: [f32; 3] = [0.229, 0.224, 0.225];

type Plan = TypedRunnableModel<TypedModel>;

fn backbone_err(context: &str, e: impl std::fmt::Display) -> FeatureError {
    FeatureError::Backbone(format!("{context}: {e}"))
}

/// Pretrained network weights, fetched once and shared by every extraction
/// in the process.
///
/// Lifecycle: the first call to [`Backbone::model`] makes sure the weight file
/// exists on disk (downloading it while holding the write lock, so only one
/// thread ever writes it), then loads and optimizes the graph exactly once.
/// The outcome is kept either way: after a failed load every later call
/// reports the same error without touching the network again.
pub struct Backbone {
    model_url: String,
    cache_path: PathBuf,
    output_node: Option<String>,
    input_size: u32,
    write_lock: Mutex<()>,
    plan: OnceCell<Result<Plan, String>>,
}

impl Backbone {
    pub fn new(
        model_url: impl Into<String>,
        cache_path: impl Into<PathBuf>,
        output_node: Option<String>,
        input_size: u32,
    ) -> Self {
        Self {
            model_url: model_url.into(),
            cache_path: cache_path.into(),
            output_node,
            input_size,
            write_lock: Mutex::new(()),
            plan: OnceCell::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.backbone.model_url.clone(),
            config.backbone_cache_path(),
            config.backbone.output_node.clone(),
            config.backbone.input_size,
        )
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.plan.get(), Some(Ok(_)))
    }

    /// Download the weights unless they are already cached.
    pub fn ensure_weights(&self) -> Result<&Path, FeatureError> {
        if self.cache_path.exists() {
            return Ok(&self.cache_path);
        }

        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| backbone_err("weight cache lock poisoned", e))?;
        // Another thread may have finished the download while we waited.
        if self.cache_path.exists() {
            return Ok(&self.cache_path);
        }

        log::info!(
            "Downloading backbone weights from {} to {}",
            self.model_url,
            self.cache_path.display()
        );
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| backbone_err("http client", e))?;
        let response = client
            .get(&self.model_url)
            .send()
            .map_err(|e| backbone_err("weight download failed", e))?;
        if !response.status().is_success() {
            return Err(FeatureError::Backbone(format!(
                "weight download failed with status {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .map_err(|e| backbone_err("weight download interrupted", e))?;

        if let Some(parent) = self.cache_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let partial = self.cache_path.with_extension("part");
        let mut file = fs::File::create(&partial)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&partial, &self.cache_path)?;

        log::info!("Cached {} bytes of backbone weights", bytes.len());
        Ok(&self.cache_path)
    }

    /// The loaded inference plan, initializing it on first use.
    pub fn model(&self) -> Result<&Plan, FeatureError> {
        self.plan
            .get_or_init(|| {
                self.load().map_err(|e| match e {
                    FeatureError::Backbone(reason) => reason,
                    other => other.to_string(),
                })
            })
            .as_ref()
            .map_err(|reason| FeatureError::Backbone(reason.clone()))
    }

    fn load(&self) -> Result<Plan, FeatureError> {
        let path = self.ensure_weights()?;
        let side = self.input_size as usize;

        let mut model = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(|e| backbone_err("unreadable weight file", e))?
            .with_input_fact(0, f32::fact([1, 3, side, side]).into())
            .map_err(|e| backbone_err("input shape rejected", e))?;
        if let Some(node) = &self.output_node {
            model = model
                .with_output_names([node.as_str()])
                .map_err(|e| backbone_err("cannot truncate graph", e))?;
        }
        let plan = model
            .into_optimized()
            .map_err(|e| backbone_err("graph optimization failed", e))?
            .into_runnable()
            .map_err(|e| backbone_err("graph not runnable", e))?;

        log::info!("Loaded backbone from {}", path.display());
        Ok(plan)
    }
}

/// Channel-normalized NCHW input for a square network input of `side`.
/// Alpha is dropped, matching a plain RGB conversion.
pub fn input_tensor(image: &DynamicImage, side: u32) -> tract_ndarray::Array4<f32> {
    let rgb = if image.dimensions() == (side, side) {
        image.to_rgb8()
    } else {
        image.resize_exact(side, side, FilterType::Triangle).to_rgb8()
    };
    let side = side as usize;
    tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
        let value = f32::from(rgb.get_pixel(x as u32, y as u32)[c]) / 255.0;
        (value - CHANNEL_MEAN[c]) / CHANNEL_STD[c]
    })
}

/// Penultimate-layer activations of the pretrained backbone.
#[derive(Clone)]
pub struct EmbeddingStrategy {
    backbone: Arc<Backbone>,
}

impl EmbeddingStrategy {
    pub fn new(backbone: Arc<Backbone>) -> Self {
        Self { backbone }
    }
}

impl FeatureStrategy for EmbeddingStrategy {
    fn prepare(&self) -> Result<(), FeatureError> {
        self.backbone.model().map(|_| ())
    }

    fn extract(&self, image: &DynamicImage) -> Result<Vec<f32>, FeatureError> {
        let plan = self.backbone.model()?;
        let input: Tensor = input_tensor(image, self.backbone.input_size()).into();
        let outputs = plan
            .run(tvec!(input.into()))
            .map_err(|e| backbone_err("inference failed", e))?;
        let first = outputs
            .first()
            .ok_or_else(|| FeatureError::Backbone("network produced no output".into()))?;
        let view = first
            .to_array_view::<f32>()
            .map_err(|e| backbone_err("unexpected output type", e))?;
        Ok(view.iter().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::extract_batch;
    use image::{Rgba, RgbaImage};
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use tempfile::TempDir;

    /// Local server answering 404 to everything, counting connections.
    fn missing_weights_server() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                while reader.read_line(&mut line).unwrap_or(0) > 0 && line != "\r\n" {
                    line.clear();
                }
                let _ = stream.write_all(
                    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                );
            }
        });
        (format!("http://{addr}/resnet18.onnx"), hits)
    }

    #[test]
    fn test_input_tensor_layout_and_normalization() {
        let mut img = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 0]));
        img.put_pixel(2, 1, Rgba([255, 0, 0, 255]));
        let tensor = input_tensor(&DynamicImage::ImageRgba8(img), 4);

        assert_eq!(tensor.shape(), &[1, 3, 4, 4]);
        let red = tensor[[0, 0, 1, 2]];
        assert!((red - (1.0 - 0.485) / 0.229).abs() < 1e-5);
        let black_green = tensor[[0, 1, 0, 0]];
        assert!((black_green - (-0.456 / 0.224)).abs() < 1e-5);
    }

    #[test]
    fn test_input_tensor_resizes() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 3, Rgba([9, 9, 9, 255])));
        assert_eq!(input_tensor(&img, 8).shape(), &[1, 3, 8, 8]);
    }

    #[test]
    fn test_cached_weights_skip_download() {
        let temp_dir = TempDir::new().unwrap();
        let cache = temp_dir.path().join("weights.onnx");
        fs::write(&cache, b"cached").unwrap();

        let backbone = Backbone::new("http://127.0.0.1:9/unreachable", &cache, None, 224);
        assert_eq!(backbone.ensure_weights().unwrap(), cache.as_path());
        assert!(!backbone.is_loaded());
    }

    #[test]
    fn test_corrupt_weights_are_backbone_error() {
        let temp_dir = TempDir::new().unwrap();
        let cache = temp_dir.path().join("weights.onnx");
        fs::write(&cache, b"not an onnx graph").unwrap();

        let backbone = Backbone::new("http://127.0.0.1:9/unreachable", &cache, None, 224);
        let strategy = EmbeddingStrategy::new(Arc::new(backbone));
        let img = DynamicImage::ImageRgba8(RgbaImage::new(224, 224));
        assert!(matches!(
            strategy.extract(&img),
            Err(FeatureError::Backbone(_))
        ));
    }

    #[test]
    fn test_unavailable_weights_fail_the_batch_once() {
        let temp_dir = TempDir::new().unwrap();
        let (url, hits) = missing_weights_server();
        let cache = temp_dir.path().join("weights.onnx");
        let strategy = EmbeddingStrategy::new(Arc::new(Backbone::new(url, &cache, None, 224)));

        let mut inputs = Vec::new();
        for i in 0..5 {
            let path = temp_dir.path().join(format!("logo{i}.com.png"));
            RgbaImage::from_pixel(8, 8, Rgba([i * 40, 0, 0, 255])).save(&path).unwrap();
            inputs.push((format!("logo{i}.com"), path));
        }

        let result = extract_batch(&strategy, &inputs);
        assert!(matches!(result, Err(FeatureError::Backbone(_))));
        // Later calls reuse the recorded failure.
        assert!(strategy.prepare().is_err());
        assert!(extract_batch(&strategy, &inputs).is_err());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!cache.exists());
    }

    // Downloads the ResNet-18 weights; run with `--ignored` when online.
    #[test]
    #[ignore]
    fn test_embedding_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.backbone.cache_path = Some(temp_dir.path().join("resnet18.onnx"));
        let backbone = Arc::new(Backbone::from_config(&config));
        let strategy = EmbeddingStrategy::new(backbone.clone());

        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(224, 224, Rgba([200, 30, 30, 255])));
        let first = strategy.extract(&img).unwrap();
        let second = strategy.extract(&img).unwrap();

        assert_eq!(first.len(), 512);
        assert_eq!(first, second);
        assert!(backbone.is_loaded());
        assert!(backbone.cache_path().exists());
    }
}
