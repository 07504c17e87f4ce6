//! Watcher controller - owns one change watcher per session and turns
//! accepted batches into analysis runs

use crate::check::ValidityCheck;
use crate::coalescer::{Batch, BlockingState, ChangeCoalescer};
use crate::engine::{AnalysisEngine, AnalysisReport};
use crate::error::InspectError;
use crate::filter::EligibilityFilter;
use crate::scope::{expand_to_scope, InspectionProfile};
use crate::source::DocumentHub;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Parameters for one watcher session
#[derive(Clone)]
pub struct SessionConfig {
    pub root: PathBuf,
    pub delay: Duration,
    pub profile: InspectionProfile,
    pub filter: Arc<dyn EligibilityFilter>,
}

/// State held for the analysis engine while a session is live
struct AnalysisContext {
    root: PathBuf,
    profile: InspectionProfile,
    runs: u64,
}

pub struct WatcherController<E: AnalysisEngine> {
    engine: E,
    hub: DocumentHub,
    check: Arc<dyn ValidityCheck>,
    blocking: Arc<dyn BlockingState>,
    coalescer: Option<ChangeCoalescer>,
    context: Option<AnalysisContext>,
}

impl<E: AnalysisEngine> WatcherController<E> {
    pub fn new(
        engine: E,
        hub: DocumentHub,
        check: Arc<dyn ValidityCheck>,
        blocking: Arc<dyn BlockingState>,
    ) -> Self {
        Self {
            engine,
            hub,
            check,
            blocking,
            coalescer: None,
            context: None,
        }
    }

    /// Tear down any previous session, then start watching under `config`
    pub fn start(&mut self, config: SessionConfig) {
        self.stop();

        info!(
            "Starting watcher session for {} (profile: {})",
            config.root.display(),
            config.profile.name
        );

        let mut coalescer = ChangeCoalescer::new(
            config.delay,
            self.hub.clone(),
            config.filter,
            self.check.clone(),
            self.blocking.clone(),
        );
        coalescer.activate();

        self.coalescer = Some(coalescer);
        self.context = Some(AnalysisContext {
            root: config.root,
            profile: config.profile,
            runs: 0,
        });
    }

    pub fn stop(&mut self) {
        if let Some(mut coalescer) = self.coalescer.take() {
            coalescer.deactivate();
        }
        if let Some(context) = self.context.take() {
            info!(
                "Released analysis context for {} after {} runs",
                context.root.display(),
                context.runs
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.coalescer.as_ref().is_some_and(|c| c.is_active())
    }

    pub fn root(&self) -> Option<&Path> {
        self.context.as_ref().map(|c| c.root.as_path())
    }

    pub fn coalescer(&self) -> Option<&ChangeCoalescer> {
        self.coalescer.as_ref()
    }

    /// Next accepted batch; pending forever while stopped
    pub async fn next_batch(&mut self) -> Batch {
        match self.coalescer.as_mut() {
            Some(coalescer) => coalescer.next_batch().await,
            None => std::future::pending().await,
        }
    }

    /// Run the engine over the directories touched by `batch`.
    ///
    /// Returns `Ok(None)` when the batch went stale or there is nothing left
    /// to inspect. Engine errors are returned as-is and the changes are kept
    /// for the next cycle.
    pub async fn on_batch_accepted(
        &mut self,
        batch: Batch,
    ) -> Result<Option<AnalysisReport>, InspectError> {
        let current = self
            .coalescer
            .as_ref()
            .is_some_and(|c| c.is_current(batch.generation));
        if !current {
            debug!("Dropping stale batch for generation {}", batch.generation);
            return Ok(None);
        }

        let context = self
            .context
            .as_mut()
            .ok_or_else(|| InspectError::NoSession("analysis context released".to_string()))?;

        let scope = expand_to_scope(&context.root, &batch.changes);
        if scope.is_empty() {
            debug!("Nothing left to inspect for generation {}", batch.generation);
            if let Some(coalescer) = self.coalescer.as_mut() {
                coalescer.clear_delivered(batch.generation);
            }
            return Ok(None);
        }

        let report = self.engine.run_over(&scope, &context.profile).await?;
        context.runs += 1;

        if let Some(coalescer) = self.coalescer.as_mut() {
            coalescer.clear_delivered(batch.generation);
        }

        info!(
            "Inspection run {} finished: {} files, success: {}",
            context.runs, report.files, report.success
        );
        Ok(Some(report))
    }
}

impl<E: AnalysisEngine> Drop for WatcherController<E> {
    fn drop(&mut self) {
        self.stop();
    }
}
