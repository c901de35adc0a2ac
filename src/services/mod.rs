pub mod cull;
pub mod fetch;
pub mod normalize;
pub mod report;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use cull::CullService;
pub use fetch::FetchService;
pub use normalize::NormalizerService;

/// Called once per processed item with its identity.
pub type ProgressCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetch,
    Normalize,
    Extract,
}

/// Something that dropped out of a run, and why. Collected, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub id: String,
    pub stage: Stage,
    pub reason: String,
}

impl Failure {
    pub fn new(id: impl Into<String>, stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stage,
            reason: reason.into(),
        }
    }
}

impl From<crate::core::ExtractionFailure> for Failure {
    fn from(f: crate::core::ExtractionFailure) -> Self {
        Self::new(f.id, Stage::Extract, f.reason)
    }
}
