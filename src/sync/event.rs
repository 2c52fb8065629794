//! Manually set/cleared event flag.
//!
//! # Responsibilities
//! - Publish a binary flag (`set` / `clear` / `is_set`) across tasks
//! - Let any number of tasks wait until the flag is set
//!
//! # Design Decisions
//! - Backed by a `watch` channel so waiters never miss a transition that
//!   happened before they subscribed
//! - Cloning an `Event` shares the flag

use std::sync::Arc;
use tokio::sync::watch;

/// A binary flag that tasks can observe and wait on.
#[derive(Debug, Clone)]
pub struct Event {
    tx: Arc<watch::Sender<bool>>,
}

impl Event {
    /// Create a new event in the cleared state.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Set the flag and wake every waiter.
    pub fn set(&self) {
        self.tx.send_if_modified(|flag| !std::mem::replace(flag, true));
    }

    /// Clear the flag.
    pub fn clear(&self) {
        self.tx.send_if_modified(|flag| std::mem::replace(flag, false));
    }

    /// Whether the flag is currently set.
    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the flag is set. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|flag| *flag).await;
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}
