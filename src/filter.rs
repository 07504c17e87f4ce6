//! Eligibility filtering for changed documents
//! Project metadata is always excluded; the editor filter further restricts
//! tracking to open, non-scratch, git-visible files.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const GIT_CACHE_TTL: Duration = Duration::from_secs(60);

const METADATA_DIRS: &[&str] = &[".git", ".idea", ".vscode"];
const METADATA_EXTENSIONS: &[&str] = &["iml", "ipr", "iws"];
const CONFIG_FILE_NAME: &str = "auto-inspect.json";

/// Predicate deciding whether a changed document is tracked for batching
pub trait EligibilityFilter: Send + Sync {
    fn is_eligible(&self, path: &Path) -> bool;
}

impl<F> EligibilityFilter for F
where
    F: Fn(&Path) -> bool + Send + Sync,
{
    fn is_eligible(&self, path: &Path) -> bool {
        self(path)
    }
}

/// Project/workspace metadata never counts as a user edit
pub fn is_project_metadata(path: &Path) -> bool {
    let in_metadata_dir = path.components().any(|c| match c {
        Component::Normal(name) => METADATA_DIRS.iter().any(|d| name == *d),
        _ => false,
    });
    if in_metadata_dir {
        return true;
    }

    if path.file_name().is_some_and(|n| n == CONFIG_FILE_NAME) {
        return true;
    }

    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| METADATA_EXTENSIONS.contains(&ext))
}

/// Set of documents the editor currently has open, shared with the front-end
#[derive(Clone, Default)]
pub struct OpenDocuments {
    paths: Arc<Mutex<HashSet<PathBuf>>>,
}

impl OpenDocuments {
    pub fn open(&self, path: PathBuf) {
        if let Ok(mut paths) = self.paths.lock() {
            paths.insert(path);
        }
    }

    pub fn close(&self, path: &Path) {
        if let Ok(mut paths) = self.paths.lock() {
            paths.remove(path);
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.lock().map(|p| p.contains(path)).unwrap_or(false)
    }
}

/// Files reported by `git ls-files` for one root
struct GitTrackedFiles {
    files: HashSet<PathBuf>,
    loaded_at: Instant,
}

/// Default filter used by the editor front-end
pub struct EditorFilter {
    root: PathBuf,
    open_documents: OpenDocuments,
    scratch_dirs: Vec<PathBuf>,
    git_filter: bool,
    /// `None` means the root is not a git repository (or git failed)
    git_cache: Mutex<HashMap<PathBuf, Option<GitTrackedFiles>>>,
}

impl EditorFilter {
    pub fn new(
        root: PathBuf,
        open_documents: OpenDocuments,
        scratch_dirs: Vec<PathBuf>,
        git_filter: bool,
    ) -> Self {
        Self {
            root,
            open_documents,
            scratch_dirs,
            git_filter,
            git_cache: Mutex::new(HashMap::new()),
        }
    }

    fn is_scratch(&self, path: &Path) -> bool {
        self.scratch_dirs.iter().any(|dir| path.starts_with(dir))
    }

    /// Check if a path is git-visible (with caching and TTL)
    fn is_git_tracked(&self, path: &Path) -> bool {
        let mut cache = match self.git_cache.lock() {
            Ok(c) => c,
            Err(_) => return true,
        };

        let expired = cache
            .get(&self.root)
            .map(|entry| match entry {
                Some(tracked) => tracked.loaded_at.elapsed() > GIT_CACHE_TTL,
                None => false,
            })
            .unwrap_or(true);

        if expired {
            let loaded = list_git_files(&self.root).map(|files| GitTrackedFiles {
                files,
                loaded_at: Instant::now(),
            });
            cache.insert(self.root.clone(), loaded);
        }

        match cache.get(&self.root) {
            Some(Some(tracked)) => tracked.files.contains(path),
            // Not a git repo or git failed, allow all files
            _ => true,
        }
    }
}

impl EligibilityFilter for EditorFilter {
    fn is_eligible(&self, path: &Path) -> bool {
        if self.is_scratch(path) {
            debug!("Ignoring scratch file: {}", path.display());
            return false;
        }
        if !self.open_documents.contains(path) {
            debug!("Ignoring file that is not open: {}", path.display());
            return false;
        }
        if self.git_filter && !self.is_git_tracked(path) {
            debug!("Ignoring git-ignored file: {}", path.display());
            return false;
        }
        true
    }
}

/// Files `git ls-files` reports for a root, tracked plus untracked-but-not-ignored
fn list_git_files(root: &Path) -> Option<HashSet<PathBuf>> {
    if !root.join(".git").exists() {
        debug!("Not a git repository: {}", root.display());
        return None;
    }

    let output = match Command::new("git")
        .args(["ls-files", "--cached", "--others", "--exclude-standard"])
        .current_dir(root)
        .output()
    {
        Ok(o) => o,
        Err(e) => {
            warn!("Failed to run git ls-files: {}", e);
            return None;
        }
    };

    if !output.status.success() {
        warn!(
            "git ls-files failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        return None;
    }

    let files: HashSet<PathBuf> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| root.join(line))
        .collect();

    info!(
        "Git filter cache populated for {}: {} files",
        root.display(),
        files.len()
    );

    Some(files)
}
