//! Analysis engine invoked once per accepted batch

use crate::error::InspectError;
use crate::scope::{AnalysisScope, InspectionProfile};
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Outcome of one analysis run
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AnalysisReport {
    pub files: usize,
    /// False when the analyzer reported findings (non-zero exit)
    pub success: bool,
    pub output: String,
}

/// Runs inspections over a scope. Never invoked concurrently with itself.
pub trait AnalysisEngine {
    fn run_over(
        &mut self,
        scope: &AnalysisScope,
        profile: &InspectionProfile,
    ) -> impl Future<Output = Result<AnalysisReport, InspectError>> + Send;
}

/// Spawns an external analyzer with the scope's files as trailing arguments
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

impl AnalysisEngine for CommandEngine {
    async fn run_over(
        &mut self,
        scope: &AnalysisScope,
        profile: &InspectionProfile,
    ) -> Result<AnalysisReport, InspectError> {
        info!(
            "Running {:?} over {} files (profile: {})",
            self.program,
            scope.files.len(),
            profile.name
        );

        let output = Command::new(&self.program)
            .args(&self.args)
            .args(&scope.files)
            .current_dir(&scope.root)
            .env("AUTO_INSPECT_PROFILE", &profile.name)
            .env(
                "AUTO_INSPECT_SEARCH_LIBRARIES",
                if scope.search_in_libraries { "1" } else { "0" },
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                InspectError::AnalyzerSpawnFailed(format!(
                    "Failed to run analyzer {:?}: {}",
                    self.program, e
                ))
            })?;

        debug!("Analyzer exited with {}", output.status);

        Ok(AnalysisReport {
            files: scope.files.len(),
            success: output.status.success(),
            output: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn scope_in(root: &std::path::Path, files: &[&str]) -> AnalysisScope {
        AnalysisScope {
            root: root.to_path_buf(),
            files: files.iter().map(|f| root.join(f)).collect::<BTreeSet<_>>(),
            search_in_libraries: false,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_engine_passes_files_and_profile() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = CommandEngine::new(
            PathBuf::from("sh"),
            vec![
                "-c".to_string(),
                "echo \"$AUTO_INSPECT_PROFILE:$AUTO_INSPECT_SEARCH_LIBRARIES:$#\"".to_string(),
                "analyzer".to_string(),
            ],
        );

        let scope = scope_in(dir.path(), &["a.rs", "b.rs"]);
        let report = engine
            .run_over(&scope, &InspectionProfile::default())
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.files, 2);
        assert_eq!(report.output.trim(), "Project Default:0:2");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_engine_reports_findings() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = CommandEngine::new(PathBuf::from("false"), Vec::new());

        let report = engine
            .run_over(&scope_in(dir.path(), &["a.rs"]), &InspectionProfile::default())
            .await
            .unwrap();

        assert!(!report.success);
    }

    #[tokio::test]
    async fn test_command_engine_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = CommandEngine::new(PathBuf::from("no-such-analyzer-binary"), Vec::new());

        let result = engine
            .run_over(&scope_in(dir.path(), &["a.rs"]), &InspectionProfile::default())
            .await;

        assert!(matches!(result, Err(InspectError::AnalyzerSpawnFailed(_))));
    }
}
