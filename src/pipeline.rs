// Wires the stages together: fetch -> normalize -> extract -> scale ->
// cluster -> materialize. Each stage's failures are collected and carried
// through to the final summary; only setup errors, an unusable feature
// extractor and output errors abort a run.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::config::{Config, ConfigError, StrategyKind};
use crate::core::{
    extract_batch, standardize, Backbone, ClusterError, Clusterer, EmbeddingStrategy, FeatureError,
    FeatureMatrix, FeatureStrategy, NeighborSearch, Partition, PixelStrategy, PrefixGroups,
};
use crate::services::fetch::{FetchError, FetchService};
use crate::services::normalize::{discover_assets, NormalizeError, NormalizerService};
use crate::services::report::{self, ReportError, RunSummary, DEFAULT_REPORT_FILE};
use crate::services::{Failure, ProgressCallback};

pub const LOGOS_DIR: &str = "logos";
pub const NORMALIZED_DIR: &str = "normalized";
pub const CLUSTERS_DIR: &str = "clustered_logos";
pub const SUMMARY_FILE: &str = "summary.json";
pub const PREFIX_REPORT_FILE: &str = "prefix_groups.txt";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    Feature(#[from] FeatureError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Report(#[from] ReportError),
}

/// Result of clustering one directory of images.
#[derive(Debug, Default)]
pub struct ClusterOutcome {
    pub partition: Partition,
    /// Image file behind each clustered identity.
    pub paths: HashMap<String, PathBuf>,
    pub failures: Vec<Failure>,
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Skip fetching domains whose prefix already has a logo on disk.
    pub prefix_prefilter: bool,
    /// Copy each cluster's images into its own directory.
    pub copy_clusters: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            prefix_prefilter: false,
            copy_clusters: true,
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub summary: RunSummary,
    pub partition: Partition,
    pub prefix_groups: PrefixGroups,
    pub report_path: PathBuf,
    pub cluster_dirs: Vec<PathBuf>,
}

pub struct Pipeline {
    config: Config,
    strategy: Box<dyn FeatureStrategy>,
    progress: Option<ProgressCallback>,
}

impl Pipeline {
    /// Build a pipeline with the extractor named by `config.strategy`. The
    /// backbone is not loaded until the first image is featurized.
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        config.validate()?;
        let strategy: Box<dyn FeatureStrategy> = match config.strategy {
            StrategyKind::Embedding => Box::new(EmbeddingStrategy::new(Arc::new(
                Backbone::from_config(&config),
            ))),
            StrategyKind::Pixel => Box::new(PixelStrategy::new(
                config.pixel.width,
                config.pixel.height,
            )),
        };
        Ok(Self {
            config,
            strategy,
            progress: None,
        })
    }

    /// Swap in a custom extractor; the configured radius still applies.
    pub fn with_strategy(mut self, strategy: Box<dyn FeatureStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clusterer(&self) -> Result<Clusterer, ClusterError> {
        Ok(Clusterer::new(self.config.epsilon())?.with_search(NeighborSearch::Auto {
            threshold: self.config.clustering.index_threshold,
        }))
    }

    /// Standardize a batch and label it.
    pub fn cluster_features(&self, matrix: &FeatureMatrix) -> Result<Partition, ClusterError> {
        let scaled = standardize(matrix)?;
        self.clusterer()?.partition(&scaled)
    }

    /// Featurize and cluster the images in `inputs`, in order. Images that
    /// cannot be decoded or featurized are reported and left out; a strategy
    /// that cannot start at all fails the call.
    pub fn cluster_images(&self, inputs: &[(String, PathBuf)]) -> Result<ClusterOutcome, PipelineError> {
        let (matrix, failures) = extract_batch(self.strategy.as_ref(), inputs)?;
        let partition = self.cluster_features(&matrix)?;

        // Identities in the matrix are unique, and the first input carrying
        // each one is the file its row was computed from.
        let clustered: HashSet<&str> = matrix.ids().iter().map(String::as_str).collect();
        let mut paths = HashMap::with_capacity(clustered.len());
        for (id, path) in inputs {
            if clustered.contains(id.as_str()) {
                paths.entry(id.clone()).or_insert_with(|| path.clone());
            }
        }
        Ok(ClusterOutcome {
            partition,
            paths,
            failures: failures.into_iter().map(Failure::from).collect(),
        })
    }

    /// Cluster every image file in `dir`, identified by file stem.
    pub fn cluster_directory(&self, dir: &Path) -> Result<ClusterOutcome, PipelineError> {
        let (assets, mut failures) = discover_assets(dir)?;
        let inputs: Vec<(String, PathBuf)> = assets.into_iter().map(|a| (a.domain, a.path)).collect();
        let mut outcome = self.cluster_images(&inputs)?;
        failures.append(&mut outcome.failures);
        outcome.failures = failures;
        Ok(outcome)
    }

    /// Fetch, normalize, cluster and write results under `work_dir`.
    pub fn run(
        &self,
        domains: &[String],
        work_dir: &Path,
        options: RunOptions,
    ) -> Result<RunReport, PipelineError> {
        let mut fetcher = FetchService::new(&self.config.fetch)?;
        if let Some(progress) = &self.progress {
            fetcher = fetcher.with_progress(progress.clone());
        }
        let fetched = fetcher.fetch_all(domains, &work_dir.join(LOGOS_DIR), options.prefix_prefilter)?;

        let prefix_groups = PrefixGroups::build(fetched.assets.iter().map(|a| a.domain.as_str()));

        let mut normalizer = NormalizerService::from_config(&self.config);
        if let Some(progress) = &self.progress {
            normalizer = normalizer.with_progress(progress.clone());
        }
        let normalized = normalizer.normalize_all(&fetched.assets, &work_dir.join(NORMALIZED_DIR))?;

        let inputs: Vec<(String, PathBuf)> = normalized
            .images
            .iter()
            .map(|img| (img.domain.clone(), img.path.clone()))
            .collect();
        let clustered = self.cluster_images(&inputs)?;

        let report_path = work_dir.join(DEFAULT_REPORT_FILE);
        report::write_cluster_report(&report_path, &clustered.partition, &clustered.paths)?;
        std::fs::write(
            work_dir.join(PREFIX_REPORT_FILE),
            report::render_prefix_groups(&prefix_groups),
        )
        .map_err(ReportError::from)?;
        let cluster_dirs = if options.copy_clusters {
            report::materialize_clusters(&work_dir.join(CLUSTERS_DIR), &clustered.partition, &clustered.paths)?
        } else {
            Vec::new()
        };

        let mut summary = RunSummary::new(self.config.strategy, self.config.epsilon(), &clustered.partition);
        summary.prefix_groups = prefix_groups.duplicate_groups();
        summary.failures = fetched
            .failures
            .into_iter()
            .chain(normalized.failures)
            .chain(clustered.failures)
            .collect();
        summary.skipped = fetched.skipped;
        summary.write_json(&work_dir.join(SUMMARY_FILE))?;

        log::info!(
            "Run complete: {} logos in {} clusters, {} prefix groups with duplicates, {} failures",
            clustered.partition.len(),
            clustered.partition.clusters().len(),
            summary.prefix_groups.len(),
            summary.failures.len()
        );
        Ok(RunReport {
            summary,
            partition: clustered.partition,
            prefix_groups,
            report_path,
            cluster_dirs,
        })
    }
}
