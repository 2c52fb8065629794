//! Server lifecycle state.
//!
//! ```text
//! Idle → Binding → Listening → Running → Stopping → Closed
//!           │           │                              │
//!           └───────────┴──── bind/listen failure ─────┤
//!                                                      │
//!        Closed → Binding (restart) ◀──────────────────┘
//! ```
//!
//! The enumerated state and the `started`/`stopped` events are updated
//! together by the accept loop; callers can observe either.

use std::sync::Arc;
use tokio::sync::watch;

use crate::sync::Event;

/// Where a server is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    /// Constructed, never started.
    Idle,
    /// Binding the listening endpoint.
    Binding,
    /// Listening, accept loop not yet running.
    Listening,
    /// Accept loop running.
    Running,
    /// Accept loop exited, tearing down.
    Stopping,
    /// Listening endpoint closed.
    Closed,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServerState::Idle => "idle",
            ServerState::Binding => "binding",
            ServerState::Listening => "listening",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Observable lifecycle of one server.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: Arc<watch::Sender<ServerState>>,
    started: Event,
    stopped: Event,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ServerState::Idle);
        let stopped = Event::new();
        stopped.set();
        Self {
            state: Arc::new(state),
            started: Event::new(),
            stopped,
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Set while the accept loop runs.
    pub fn started(&self) -> &Event {
        &self.started
    }

    /// Set whenever the accept loop is not running, including before the first start.
    pub fn stopped(&self) -> &Event {
        &self.stopped
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Wait until the server is in `target`.
    ///
    /// States passed through faster than the waiter is polled can be missed;
    /// prefer the `started`/`stopped` events for edges.
    pub async fn wait_for(&self, target: ServerState) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// Claim the right to bind. Only one caller wins, and only from
    /// `Idle` or `Closed`.
    pub(crate) fn begin_binding(&self) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state, ServerState::Idle | ServerState::Closed) {
                *state = ServerState::Binding;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn set_state(&self, next: ServerState) {
        self.state.send_replace(next);
    }

    pub(crate) fn enter_running(&self) {
        self.set_state(ServerState::Running);
        self.started.set();
        self.stopped.clear();
    }

    /// Called once the listening endpoint has been closed.
    pub(crate) fn enter_closed(&self) {
        self.started.clear();
        self.stopped.set();
        self.set_state(ServerState::Closed);
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), ServerState::Idle);
        assert!(!lifecycle.started().is_set());
        assert!(lifecycle.stopped().is_set());
    }

    #[test]
    fn binding_is_claimed_once() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin_binding());
        assert!(!lifecycle.begin_binding());

        lifecycle.enter_running();
        assert!(!lifecycle.begin_binding());

        lifecycle.enter_closed();
        assert!(lifecycle.begin_binding());
    }

    #[test]
    fn events_follow_transitions() {
        let lifecycle = Lifecycle::new();
        lifecycle.enter_running();
        assert!(lifecycle.started().is_set());
        assert!(!lifecycle.stopped().is_set());

        lifecycle.enter_closed();
        assert!(!lifecycle.started().is_set());
        assert!(lifecycle.stopped().is_set());
        assert_eq!(lifecycle.state(), ServerState::Closed);
    }

    #[tokio::test]
    async fn wait_for_state() {
        let lifecycle = Lifecycle::new();
        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.wait_for(ServerState::Running).await })
        };
        tokio::task::yield_now().await;
        lifecycle.enter_running();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
