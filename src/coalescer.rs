//! Delayed, coalescing change watcher
//!
//! Bursts of document edits are collapsed into one deferred trigger. Every
//! accepted edit bumps the generation and rearms the single timer; when the
//! timer fires, the validity check runs off the owning task and its result is
//! fenced against the generation captured at fire time before the batch is
//! handed out.
//!
//! All state lives on the task that drives [`ChangeCoalescer::next_batch`].
//! Timer fires and check completions are posted into a per-session inbox and
//! applied there, never from the worker side.

use crate::check::ValidityCheck;
use crate::filter::{is_project_metadata, EligibilityFilter};
use crate::source::{DocumentEvent, DocumentHub, Subscription};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// UI state that suppresses delivery while it holds (e.g. an open completion popup)
pub trait BlockingState: Send + Sync {
    fn is_blocked(&self) -> bool;
}

/// Tracks whether a code-completion popup is showing
#[derive(Clone, Default)]
pub struct CompletionState {
    active: Arc<AtomicBool>,
}

impl CompletionState {
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }
}

impl BlockingState for CompletionState {
    fn is_blocked(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Changed documents accepted for analysis at a given generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub generation: u64,
    pub changes: HashSet<PathBuf>,
}

/// Messages re-entering the owning task
#[derive(Debug)]
enum SessionMessage {
    TimerFired { arm: u64 },
    CheckFinished { generation: u64, problems: bool },
}

/// Single-shot, rearmable timer. At most one fire per arm is ever accepted.
struct Timer {
    arm_seq: u64,
    armed: Option<u64>,
    task: Option<JoinHandle<()>>,
    inbox: mpsc::UnboundedSender<SessionMessage>,
}

impl Timer {
    fn new(inbox: mpsc::UnboundedSender<SessionMessage>) -> Self {
        Self {
            arm_seq: 0,
            armed: None,
            task: None,
            inbox,
        }
    }

    /// Cancel any pending fire and schedule a new one `delay` from now
    fn arm(&mut self, delay: Duration) {
        self.cancel();
        self.arm_seq += 1;

        let arm = self.arm_seq;
        let inbox = self.inbox.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(SessionMessage::TimerFired { arm });
        }));
        self.armed = Some(arm);
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.armed = None;
    }

    /// Consume a fire; false if it belongs to a superseded arm
    fn take_fire(&mut self, arm: u64) -> bool {
        if self.armed != Some(arm) {
            return false;
        }
        self.armed = None;
        self.task = None;
        true
    }

    #[cfg(test)]
    fn is_armed(&self) -> bool {
        self.armed.is_some()
    }
}

/// Everything owned by one activation. Dropping it releases the subscription,
/// cancels the timer and marks in-flight checks as moot.
struct Session {
    subscription: Subscription,
    changes: HashSet<PathBuf>,
    generation: u64,
    /// Generation whose validity check is running
    checking: Option<u64>,
    /// Last generation handed out as a batch. Each generation is delivered at most once.
    delivered: Option<u64>,
    timer: Timer,
    inbox_tx: mpsc::UnboundedSender<SessionMessage>,
    inbox: mpsc::UnboundedReceiver<SessionMessage>,
    disposed: Arc<AtomicBool>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disposed.store(true, Ordering::Release);
        self.timer.cancel();
        self.inbox.close();
    }
}

enum Incoming {
    Document(DocumentEvent),
    Session(SessionMessage),
}

/// Debouncing watcher over a [`DocumentHub`]
pub struct ChangeCoalescer {
    delay: Duration,
    hub: DocumentHub,
    filter: Arc<dyn EligibilityFilter>,
    check: Arc<dyn ValidityCheck>,
    blocking: Arc<dyn BlockingState>,
    /// Set while the editor saves all documents; edits seen meanwhile are
    /// save-time normalization, not user input
    saving: bool,
    session: Option<Session>,
}

impl ChangeCoalescer {
    pub fn new(
        delay: Duration,
        hub: DocumentHub,
        filter: Arc<dyn EligibilityFilter>,
        check: Arc<dyn ValidityCheck>,
        blocking: Arc<dyn BlockingState>,
    ) -> Self {
        Self {
            delay,
            hub,
            filter,
            check,
            blocking,
            saving: false,
            session: None,
        }
    }

    /// Subscribe to the hub and start a fresh session. No-op while active.
    pub fn activate(&mut self) {
        if self.session.is_some() {
            debug!("Change watcher already active");
            return;
        }

        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        self.saving = false;
        self.session = Some(Session {
            subscription: self.hub.subscribe(),
            changes: HashSet::new(),
            generation: 0,
            checking: None,
            delivered: None,
            timer: Timer::new(inbox_tx.clone()),
            inbox_tx,
            inbox,
            disposed: Arc::new(AtomicBool::new(false)),
        });

        info!("Change watcher activated ({}ms delay)", self.delay.as_millis());
    }

    /// Release the session. Idempotent; nothing is delivered afterwards.
    pub fn deactivate(&mut self) {
        if let Some(session) = self.session.take() {
            info!(
                "Change watcher deactivated at generation {} ({} pending changes dropped)",
                session.generation,
                session.changes.len()
            );
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// True iff `generation` is the live generation of an active session
    pub fn is_current(&self, generation: u64) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }

    pub fn generation(&self) -> u64 {
        self.session.as_ref().map(|s| s.generation).unwrap_or(0)
    }

    pub fn pending_changes(&self) -> HashSet<PathBuf> {
        self.session
            .as_ref()
            .map(|s| s.changes.clone())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn is_timer_armed(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.timer.is_armed())
    }

    pub fn set_bulk_save(&mut self, in_progress: bool) {
        self.saving = in_progress;
    }

    /// Record an edit to `path` and restart the quiet period
    pub fn notify_changed(&mut self, path: &Path) {
        if self.saving {
            debug!("Ignoring change during bulk save: {}", path.display());
            return;
        }

        let session = match self.session.as_mut() {
            Some(s) => s,
            None => return,
        };

        if !session.changes.contains(path) {
            if is_project_metadata(path) || !self.filter.is_eligible(path) {
                return;
            }
            session.changes.insert(path.to_path_buf());
        }

        session.timer.arm(self.delay);
        session.generation += 1;
        debug!(
            "Change accepted: {} (generation {}, pending {})",
            path.display(),
            session.generation,
            session.changes.len()
        );
    }

    /// Fire right away instead of waiting out the delay, if anything is pending.
    ///
    /// No-op while the current generation is being checked or was already
    /// delivered; only a new edit starts another attempt for those.
    pub fn flush_now(&mut self) {
        let session = match self.session.as_mut() {
            Some(s) => s,
            None => return,
        };

        if session.changes.is_empty() {
            return;
        }
        let current = Some(session.generation);
        if session.checking == current || session.delivered == current {
            debug!(
                "Not flushing generation {}: already checked or delivered",
                session.generation
            );
            return;
        }

        debug!("Flushing {} pending changes now", session.changes.len());
        session.timer.arm(Duration::ZERO);
    }

    /// Forget delivered changes, unless newer edits arrived since `generation`
    pub fn clear_delivered(&mut self, generation: u64) -> bool {
        match self.session.as_mut() {
            Some(session) if session.generation == generation => {
                session.changes.clear();
                true
            }
            _ => false,
        }
    }

    pub fn handle_event(&mut self, event: DocumentEvent) {
        match event {
            DocumentEvent::Changed { path, version } => {
                debug!("Document changed: {} (version {})", path.display(), version);
                self.notify_changed(&path);
            }
            DocumentEvent::SaveAllStarted => self.set_bulk_save(true),
            DocumentEvent::SaveAllFinished => self.set_bulk_save(false),
            DocumentEvent::CompletionDismissed => self.flush_now(),
        }
    }

    /// Drive the session until a batch is accepted.
    ///
    /// Pending forever while inactive. Cancellation-safe: state only changes
    /// between awaits.
    pub async fn next_batch(&mut self) -> Batch {
        loop {
            let session = match self.session.as_mut() {
                Some(s) => s,
                None => return std::future::pending().await,
            };

            let incoming = tokio::select! {
                biased;
                Some(event) = session.subscription.recv() => Incoming::Document(event),
                Some(message) = session.inbox.recv() => Incoming::Session(message),
                else => return std::future::pending().await,
            };

            match incoming {
                Incoming::Document(event) => self.handle_event(event),
                Incoming::Session(SessionMessage::TimerFired { arm }) => self.on_timer_fired(arm),
                Incoming::Session(SessionMessage::CheckFinished {
                    generation,
                    problems,
                }) => {
                    if let Some(batch) = self.on_check_finished(generation, problems) {
                        return batch;
                    }
                }
            }
        }
    }

    fn on_timer_fired(&mut self, arm: u64) {
        let session = match self.session.as_mut() {
            Some(s) => s,
            None => return,
        };

        if !session.timer.take_fire(arm) {
            debug!("Discarding superseded timer fire #{}", arm);
            return;
        }
        if session.changes.is_empty() {
            return;
        }

        let generation = session.generation;
        if session.checking == Some(generation) || session.delivered == Some(generation) {
            debug!("Generation {} already checked or delivered", generation);
            return;
        }
        session.checking = Some(generation);
        let snapshot: Vec<PathBuf> = session.changes.iter().cloned().collect();
        debug!(
            "Quiet period elapsed at generation {}, checking {} files",
            generation,
            snapshot.len()
        );

        let check = self.check.check(snapshot);
        let inbox = session.inbox_tx.clone();
        let disposed = session.disposed.clone();
        tokio::spawn(async move {
            let problems = check.await;
            if disposed.load(Ordering::Acquire) {
                return;
            }
            let _ = inbox.send(SessionMessage::CheckFinished {
                generation,
                problems,
            });
        });
    }

    fn on_check_finished(&mut self, generation: u64, problems: bool) -> Option<Batch> {
        let session = self.session.as_mut()?;

        if session.checking == Some(generation) {
            session.checking = None;
        }
        if session.generation != generation {
            debug!(
                "Dropping check result for generation {} (now {})",
                generation, session.generation
            );
            return None;
        }
        if problems {
            info!("Changed files have problems, waiting for the next edit");
            return None;
        }
        if session.delivered == Some(generation) || session.changes.is_empty() {
            debug!("Nothing new to deliver for generation {}", generation);
            return None;
        }
        if self.blocking.is_blocked() {
            debug!("Delivery blocked by UI state");
            return None;
        }

        session.delivered = Some(generation);
        Some(Batch {
            generation: session.generation,
            changes: session.changes.clone(),
        })
    }
}
