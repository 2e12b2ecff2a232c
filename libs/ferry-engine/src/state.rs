use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::RelayError;

/// Connection lifecycle state. Exactly one value at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Ingestion loop active.
    Running,
    /// Ingestion loop being torn down for a topic-set change.
    Stopping,
}

impl ConnectionState {
    /// Edges of the lifecycle graph. Any state may fall back to
    /// `Disconnected`.
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Running)
                | (Running, Stopping)
                | (Stopping, Connected)
        )
    }

    /// A broker session is open.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Running | ConnectionState::Stopping
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Running => "running",
            ConnectionState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

const TRANSITION_CHANNEL_CAPACITY: usize = 256;

/// Holds the current state, validates every change against the lifecycle
/// graph and broadcasts the accepted transitions.
pub struct StateCell {
    current: Mutex<ConnectionState>,
    transitions: broadcast::Sender<StateTransition>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            current: Mutex::new(ConnectionState::Disconnected),
            transitions,
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.lock()
    }

    /// Move to `to`. Staying in the same state is a no-op; an edge that
    /// isn't in the graph is an internal invariant violation.
    pub fn transition(&self, to: ConnectionState) -> Result<(), RelayError> {
        let mut current = self.lock();
        let from = *current;
        if from == to {
            return Ok(());
        }
        if !from.can_transition_to(to) {
            return Err(RelayError::InternalInvariant(format!(
                "illegal state transition {from} -> {to}"
            )));
        }
        *current = to;
        drop(current);

        tracing::info!(%from, %to, "connection state changed");
        let _ = self.transitions.send(StateTransition { from, to });
        Ok(())
    }

    /// Fall back to `Disconnected` from wherever we are.
    pub fn force_disconnected(&self) {
        // Every state has an edge to Disconnected.
        let _ = self.transition(ConnectionState::Disconnected);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        match self.current.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("connection state lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn restart_cycle_is_allowed() {
        let cell = StateCell::new();
        let mut rx = cell.subscribe();
        for to in [Connecting, Connected, Running, Stopping, Connected, Running] {
            cell.transition(to).unwrap();
        }
        assert_eq!(cell.get(), Running);
        assert_eq!(
            rx.try_recv().unwrap(),
            StateTransition { from: Disconnected, to: Connecting }
        );
    }

    #[test]
    fn skipping_stopping_is_rejected() {
        let cell = StateCell::new();
        for to in [Connecting, Connected, Running] {
            cell.transition(to).unwrap();
        }
        assert!(matches!(
            cell.transition(Connected),
            Err(RelayError::InternalInvariant(_))
        ));
        assert_eq!(cell.get(), Running);
    }

    #[test]
    fn any_state_can_disconnect() {
        for path in [&[Connecting][..], &[Connecting, Connected, Running, Stopping][..]] {
            let cell = StateCell::new();
            for to in path {
                cell.transition(*to).unwrap();
            }
            cell.force_disconnected();
            assert_eq!(cell.get(), Disconnected);
        }
    }

    #[test]
    fn same_state_is_a_silent_no_op() {
        let cell = StateCell::new();
        let mut rx = cell.subscribe();
        cell.transition(Disconnected).unwrap();
        assert!(rx.try_recv().is_err());
    }
}
