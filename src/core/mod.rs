// Deduplication core: feature extraction, scaling, clustering and the
// name-prefix pass. Nothing in here touches the network or writes files
// (apart from the backbone weight cache).

pub mod asset;
pub mod backbone;
pub mod cluster;
pub mod features;
pub mod prefix;
pub mod scaler;

pub use asset::{LogoAsset, LogoFormat, NormalizedImage};
pub use backbone::{Backbone, EmbeddingStrategy};
pub use cluster::{Cluster, ClusterError, ClusterLabel, Clusterer, NeighborSearch, Partition};
pub use features::{
    extract_batch, ExtractionFailure, FeatureError, FeatureMatrix, FeatureStrategy, PixelStrategy,
};
pub use prefix::{prefix_key, DedupGroup, PrefixGroups};
pub use scaler::standardize;
