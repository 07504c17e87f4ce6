//! Asynchronous validity check run before a batch is handed to the analyzer

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Resolves to `true` when problems were found
pub type CheckFuture = Pin<Box<dyn Future<Output = bool> + Send + 'static>>;

/// Pre-condition gate over a snapshot of changed documents.
///
/// Implementations must not assume they are polled on the owning task and
/// must not touch watcher state; they only see the snapshot they are given.
pub trait ValidityCheck: Send + Sync {
    fn check(&self, paths: Vec<PathBuf>) -> CheckFuture;
}

/// Accepts every batch
pub struct NoCheck;

impl ValidityCheck for NoCheck {
    fn check(&self, _paths: Vec<PathBuf>) -> CheckFuture {
        Box::pin(async { false })
    }
}

/// Runs an external syntax checker once per file
#[derive(Debug, Clone)]
pub struct CommandCheck {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandCheck {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

impl ValidityCheck for CommandCheck {
    fn check(&self, paths: Vec<PathBuf>) -> CheckFuture {
        let program = self.program.clone();
        let args = self.args.clone();

        Box::pin(async move {
            for path in paths {
                // Vanished files are skipped, the analyzer will not see them either
                if !path.exists() {
                    continue;
                }

                let status = Command::new(&program)
                    .args(&args)
                    .arg(&path)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .status()
                    .await;

                match status {
                    Ok(s) if s.success() => {}
                    Ok(s) => {
                        debug!("Syntax check reported problems in {} ({})", path.display(), s);
                        return true;
                    }
                    Err(e) => {
                        warn!("Failed to run syntax check {:?}: {}", program, e);
                        return true;
                    }
                }
            }
            false
        })
    }
}
