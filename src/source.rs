//! Document change source
//! The editor front-end publishes document events here; each watcher session
//! holds one subscription and drains it on the owning task.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Event raised by the editor for the documents it manages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    /// A document's content was modified
    Changed { path: PathBuf, version: i64 },
    /// The editor is about to save every dirty document
    SaveAllStarted,
    /// The bulk save finished
    SaveAllFinished,
    /// A completion popup was closed
    CompletionDismissed,
}

type Subscribers = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<DocumentEvent>>>>;

/// Fan-out hub for document events
#[derive(Clone, Default)]
pub struct DocumentHub {
    subscribers: Subscribers,
    next_id: Arc<AtomicU64>,
}

impl DocumentHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.insert(id, tx);
            debug!("Subscriber {} registered, total: {}", id, subscribers.len());
        }

        Subscription {
            id,
            subscribers: self.subscribers.clone(),
            rx,
        }
    }

    /// Deliver an event to every live subscriber, in call order
    pub fn publish(&self, event: DocumentEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|id, tx| {
                let delivered = tx.send(event.clone()).is_ok();
                if !delivered {
                    debug!("Subscriber {} went away, dropping it", id);
                }
                delivered
            });
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// Handle for one registration with a [`DocumentHub`].
///
/// Dropping the handle unsubscribes; nothing published afterwards reaches it.
pub struct Subscription {
    id: u64,
    subscribers: Subscribers,
    rx: mpsc::UnboundedReceiver<DocumentEvent>,
}

impl Subscription {
    /// Next queued event. Cancellation-safe.
    pub async fn recv(&mut self) -> Option<DocumentEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.remove(&self.id);
            debug!("Subscriber {} removed, total: {}", self.id, subscribers.len());
        }
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(path: &str) -> DocumentEvent {
        DocumentEvent::Changed {
            path: PathBuf::from(path),
            version: 1,
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers_in_order() {
        let hub = DocumentHub::new();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        hub.publish(changed("/p/a.rs"));
        hub.publish(DocumentEvent::SaveAllStarted);

        assert_eq!(first.recv().await, Some(changed("/p/a.rs")));
        assert_eq!(first.recv().await, Some(DocumentEvent::SaveAllStarted));
        assert_eq!(second.recv().await, Some(changed("/p/a.rs")));
        assert_eq!(second.recv().await, Some(DocumentEvent::SaveAllStarted));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = DocumentHub::new();
        let sub = hub.subscribe();
        let mut other = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        drop(sub);
        assert_eq!(hub.subscriber_count(), 1);

        hub.publish(changed("/p/b.rs"));
        assert_eq!(other.recv().await, Some(changed("/p/b.rs")));
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let hub = DocumentHub::new();
        hub.publish(changed("/p/a.rs"));
        assert_eq!(hub.subscriber_count(), 0);
    }
}
