use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::core::asset::LogoAsset;
use crate::core::prefix::PrefixGroups;
use crate::services::ProgressCallback;

#[derive(Debug, Error)]
pub enum CullError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A prefix group found on disk: the file that stays and the ones that go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateSet {
    pub key: String,
    pub keep: PathBuf,
    pub duplicates: Vec<PathBuf>,
}

/// A duplicate that could not be moved or deleted. The file is left where it
/// was.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CullFailure {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct CullOutcome {
    pub sets: Vec<DuplicateSet>,
    /// Files moved or deleted. Empty on a dry run.
    pub removed: Vec<PathBuf>,
    pub failures: Vec<CullFailure>,
    pub dry_run: bool,
}

impl CullOutcome {
    fn fail(&mut self, path: &Path, reason: impl Into<String>) {
        let reason = reason.into();
        log::warn!("Leaving {} in place: {}", path.display(), reason);
        self.failures.push(CullFailure {
            path: path.to_path_buf(),
            reason,
        });
    }
}

/// Applies the name-prefix duplicate signal to a directory of logo files.
pub struct CullService {
    progress: Option<ProgressCallback>,
}

impl Default for CullService {
    fn default() -> Self {
        Self::new()
    }
}

impl CullService {
    pub fn new() -> Self {
        Self { progress: None }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Prefix groups with more than one logo file in `dir`. Files are taken
    /// in name order, so the first name in each group is the one kept.
    pub fn scan(&self, dir: &Path) -> Result<Vec<DuplicateSet>, CullError> {
        let mut by_name: HashMap<String, PathBuf> = HashMap::new();
        let mut names = Vec::new();
        for path in logo_files(dir)? {
            let name = path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .into_owned();
            names.push(name.clone());
            by_name.insert(name, path);
        }

        let groups = PrefixGroups::build(&names);
        let sets: Vec<DuplicateSet> = groups
            .duplicate_groups()
            .into_iter()
            .filter_map(|group| {
                let keep = by_name.get(&group.canonical)?.clone();
                let duplicates = group
                    .duplicates
                    .iter()
                    .filter_map(|name| by_name.get(name).cloned())
                    .collect();
                Some(DuplicateSet {
                    key: group.key,
                    keep,
                    duplicates,
                })
            })
            .collect();

        log::info!(
            "Found {} prefix group(s) with duplicates among {} files in {}",
            sets.len(),
            names.len(),
            dir.display()
        );
        Ok(sets)
    }

    /// Scan `dir` and move every duplicate into `target_dir` (default
    /// `<dir>/duplicates`).
    pub fn cull(
        &self,
        dir: &Path,
        target_dir: Option<&Path>,
        dry_run: bool,
    ) -> Result<CullOutcome, CullError> {
        let sets = self.scan(dir)?;
        let dup_dir = target_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| dir.join("duplicates"));
        self.cull_sets(sets, &dup_dir, dry_run)
    }

    /// Move the duplicates of already scanned `sets` into `dup_dir`. A file
    /// that cannot be moved is recorded in [`CullOutcome::failures`] and the
    /// rest still go. An existing file in `dup_dir` is never overwritten.
    pub fn cull_sets(
        &self,
        sets: Vec<DuplicateSet>,
        dup_dir: &Path,
        dry_run: bool,
    ) -> Result<CullOutcome, CullError> {
        let mut outcome = CullOutcome {
            dry_run,
            ..CullOutcome::default()
        };
        if dry_run || sets.is_empty() {
            outcome.sets = sets;
            return Ok(outcome);
        }

        fs::create_dir_all(dup_dir)?;
        for dup in sets.iter().flat_map(|set| &set.duplicates) {
            let dest = dup_dir.join(dup.file_name().unwrap_or_default());
            if dest.exists() {
                outcome.fail(dup, format!("{} already exists", dest.display()));
                continue;
            }
            match fs::rename(dup, &dest) {
                Ok(()) => {
                    log::debug!("moved {} to {}", dup.display(), dest.display());
                    self.report(dup);
                    outcome.removed.push(dup.clone());
                }
                Err(e) => outcome.fail(dup, format!("move to {} failed: {}", dest.display(), e)),
            }
        }

        outcome.sets = sets;
        Ok(outcome)
    }

    /// Scan `dir` and permanently remove every duplicate.
    pub fn delete(&self, dir: &Path) -> Result<CullOutcome, CullError> {
        let sets = self.scan(dir)?;
        Ok(self.delete_sets(sets))
    }

    /// Permanently remove the duplicates of already scanned `sets`. Files
    /// that cannot be removed are recorded and skipped.
    pub fn delete_sets(&self, sets: Vec<DuplicateSet>) -> CullOutcome {
        let mut outcome = CullOutcome::default();
        for dup in sets.iter().flat_map(|set| &set.duplicates) {
            match fs::remove_file(dup) {
                Ok(()) => {
                    log::debug!("deleted {}", dup.display());
                    self.report(dup);
                    outcome.removed.push(dup.clone());
                }
                Err(e) => outcome.fail(dup, format!("delete failed: {}", e)),
            }
        }
        outcome.sets = sets;
        outcome
    }

    fn report(&self, path: &Path) {
        if let Some(progress) = &self.progress {
            progress(path.to_string_lossy().as_ref());
        }
    }
}

fn logo_files(dir: &Path) -> Result<Vec<PathBuf>, CullError> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        if LogoAsset::from_path(entry.path())?.is_some() {
            paths.push(entry.into_path());
        }
    }
    Ok(paths)
}
