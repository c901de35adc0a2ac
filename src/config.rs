use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which feature extractor feeds the clustering engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Pretrained visual backbone, penultimate activation
    Embedding,
    /// Raw RGBA values of a small resized copy
    Pixel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub strategy: StrategyKind,
    pub clustering: ClusteringConfig,
    pub normalize: NormalizeConfig,
    pub pixel: PixelConfig,
    pub backbone: BackboneConfig,
    pub fetch: FetchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    /// Neighbourhood radius for embedding vectors
    pub embedding_eps: f64,
    /// Neighbourhood radius for raw pixel vectors
    pub pixel_eps: f64,
    /// Batches larger than this use the norm-sorted neighbour index
    pub index_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    pub canvas_width: u32,
    pub canvas_height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PixelConfig {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneConfig {
    /// Where the ONNX weights are downloaded from on first use
    pub model_url: String,
    /// Local weight cache; defaults to the user cache directory
    pub cache_path: Option<PathBuf>,
    /// Graph node whose activation is the embedding (drops the classifier)
    pub output_node: Option<String>,
    /// Square input resolution expected by the network
    pub input_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub workers: usize,
    pub timeout_secs: u64,
    pub accept_invalid_certs: bool,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Pixel,
            clustering: ClusteringConfig::default(),
            normalize: NormalizeConfig::default(),
            pixel: PixelConfig::default(),
            backbone: BackboneConfig::default(),
            fetch: FetchConfig::default(),
        }
    }
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            embedding_eps: 5.0,
            pixel_eps: 15.0,
            index_threshold: 512,
        }
    }
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            canvas_width: 224,
            canvas_height: 224,
        }
    }
}

impl Default for PixelConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 64,
        }
    }
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            model_url: "https://github.com/onnx/models/raw/main/validated/vision/classification/resnet/model/resnet18-v1-7.onnx".to_string(),
            cache_path: None,
            output_node: Some("resnetv15_pool1_fwd".to_string()),
            input_size: 224,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            timeout_secs: 10,
            accept_invalid_certs: false,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/115.0.0.0 Safari/537.36"
                .to_string(),
        }
    }
}

impl Config {
    /// Load from a TOML file, or fall back to defaults when no path is given.
    /// The result is validated before it is returned.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                toml::from_str(&raw)?
            }
            None => Config::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.clustering;
        for (name, eps) in [("embedding_eps", c.embedding_eps), ("pixel_eps", c.pixel_eps)] {
            if !eps.is_finite() || eps <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a positive finite radius, got {eps}"
                )));
            }
        }
        if self.normalize.canvas_width == 0 || self.normalize.canvas_height == 0 {
            return Err(ConfigError::Invalid("canvas size must be non-zero".into()));
        }
        if self.pixel.width == 0 || self.pixel.height == 0 {
            return Err(ConfigError::Invalid(
                "pixel feature resolution must be non-zero".into(),
            ));
        }
        if self.backbone.input_size == 0 {
            return Err(ConfigError::Invalid("backbone input size must be non-zero".into()));
        }
        if self.fetch.workers == 0 {
            return Err(ConfigError::Invalid("fetch workers must be at least 1".into()));
        }
        if self.fetch.timeout_secs == 0 {
            return Err(ConfigError::Invalid("fetch timeout must be at least 1s".into()));
        }
        Ok(())
    }

    /// Radius for the configured strategy.
    pub fn epsilon(&self) -> f64 {
        match self.strategy {
            StrategyKind::Embedding => self.clustering.embedding_eps,
            StrategyKind::Pixel => self.clustering.pixel_eps,
        }
    }

    /// Override the radius of the active strategy.
    pub fn set_epsilon(&mut self, eps: f64) {
        match self.strategy {
            StrategyKind::Embedding => self.clustering.embedding_eps = eps,
            StrategyKind::Pixel => self.clustering.pixel_eps = eps,
        }
    }

    pub fn backbone_cache_path(&self) -> PathBuf {
        self.backbone.cache_path.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("logodedup")
                .join("resnet18.onnx")
        })
    }
}
