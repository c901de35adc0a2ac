pub mod config;
pub mod core;
pub mod pipeline;
pub mod services;

pub use config::{Config, ConfigError, StrategyKind};
pub use pipeline::{ClusterOutcome, Pipeline, PipelineError, RunOptions, RunReport};
