use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::StrategyKind;
use crate::core::cluster::{ClusterLabel, Partition};
use crate::core::prefix::{DedupGroup, PrefixGroups};
use crate::services::Failure;

pub const DEFAULT_REPORT_FILE: &str = "duplicate_logos.txt";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No file recorded for {0}")]
    MissingPath(String),
}

/// Text listing of every cluster, one block per label in first-appearance
/// order. Members are shown by file path when one is known, else by domain.
pub fn render_clusters(partition: &Partition, paths: &HashMap<String, PathBuf>) -> String {
    let mut out = String::new();
    for cluster in partition.clusters() {
        let _ = writeln!(out, "Cluster {}:", cluster.label);
        for member in &cluster.members {
            match paths.get(member) {
                Some(path) => {
                    let _ = writeln!(out, " - {}", path.display());
                }
                None => {
                    let _ = writeln!(out, " - {}", member);
                }
            }
        }
        out.push('\n');
    }
    out
}

pub fn render_prefix_groups(groups: &PrefixGroups) -> String {
    let mut out = String::new();
    for group in groups.duplicate_groups() {
        let _ = writeln!(out, "Prefix {}:", group.key);
        let _ = writeln!(out, " * {}", group.canonical);
        for dup in &group.duplicates {
            let _ = writeln!(out, " - {}", dup);
        }
        out.push('\n');
    }
    out
}

pub fn write_cluster_report(
    dest: &Path,
    partition: &Partition,
    paths: &HashMap<String, PathBuf>,
) -> Result<(), ReportError> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(dest, render_clusters(partition, paths))?;
    log::info!("Wrote {} clusters to {}", partition.clusters().len(), dest.display());
    Ok(())
}

/// Copy each cluster's files into `<base>/<first member>/`. Returns the
/// directories created, in cluster order.
pub fn materialize_clusters(
    base: &Path,
    partition: &Partition,
    paths: &HashMap<String, PathBuf>,
) -> Result<Vec<PathBuf>, ReportError> {
    fs::create_dir_all(base)?;
    let mut dirs = Vec::new();
    for cluster in partition.clusters() {
        let dir = base.join(cluster.representative());
        fs::create_dir_all(&dir)?;
        for member in &cluster.members {
            let src = paths
                .get(member)
                .ok_or_else(|| ReportError::MissingPath(member.clone()))?;
            let dest = dir.join(src.file_name().unwrap_or_default());
            fs::copy(src, &dest)?;
        }
        log::debug!("cluster {} -> {}", cluster.label, dir.display());
        dirs.push(dir);
    }
    Ok(dirs)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub domain: String,
    pub label: ClusterLabel,
}

/// Everything a run decided, in a form fit for `serde_json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub generated_at: String,
    pub strategy: StrategyKind,
    pub eps: f64,
    pub assignments: Vec<Assignment>,
    pub prefix_groups: Vec<DedupGroup>,
    pub failures: Vec<Failure>,
    pub skipped: Vec<String>,
}

impl RunSummary {
    pub fn new(strategy: StrategyKind, eps: f64, partition: &Partition) -> Self {
        Self {
            generated_at: Utc::now().to_rfc3339(),
            strategy,
            eps,
            assignments: partition
                .assignments
                .iter()
                .map(|(domain, label)| Assignment {
                    domain: domain.clone(),
                    label: *label,
                })
                .collect(),
            prefix_groups: Vec::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn write_json(&self, dest: &Path) -> Result<(), ReportError> {
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
