//! Analysis scope built from an accepted batch
//! A changed file widens to every file in its containing directory, because
//! many inspections are directory- or module-scoped.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_PROFILE: &str = "Project Default";

/// Named set of inspections to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectionProfile {
    pub name: String,
}

impl Default for InspectionProfile {
    fn default() -> Self {
        Self {
            name: DEFAULT_PROFILE.to_string(),
        }
    }
}

/// Files handed to the analysis engine for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisScope {
    pub root: PathBuf,
    pub files: BTreeSet<PathBuf>,
    /// Whether dependencies/libraries are searched as well
    pub search_in_libraries: bool,
}

impl AnalysisScope {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Directory an entity contributes to the scope.
///
/// Directories stand for themselves; files walk up to the nearest existing
/// directory. Entities that no longer exist yield `None`.
fn containing_dir(path: &Path) -> Option<PathBuf> {
    if !path.exists() {
        return None;
    }
    let mut current = path;
    while !current.is_dir() {
        current = current.parent()?;
    }
    Some(current.to_path_buf())
}

/// Immediate (non-recursive) child files of `dir`, skipping sub-directories
fn child_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            debug!("Skipping unreadable directory {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| !t.is_dir()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect()
}

/// Widen the changed entities to every file in their directories
pub fn expand_to_scope(root: &Path, changes: &HashSet<PathBuf>) -> AnalysisScope {
    let dirs: BTreeSet<PathBuf> = changes
        .iter()
        .filter_map(|path| {
            let dir = containing_dir(path);
            if dir.is_none() {
                debug!("Changed entity vanished: {}", path.display());
            }
            dir
        })
        .collect();

    let files: BTreeSet<PathBuf> = dirs.iter().flat_map(|dir| child_files(dir)).collect();

    debug!(
        "Expanded {} changes into {} directories, {} files",
        changes.len(),
        dirs.len(),
        files.len()
    );

    AnalysisScope {
        root: root.to_path_buf(),
        files,
        search_in_libraries: false,
    }
}
