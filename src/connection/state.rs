//! Connection lifecycle states and the legal-transition table.
//!
//! The state cell is the only mutable attribute of a connection visible
//! across tasks. Transitions are validated against the table; an illegal
//! transition is an error and leaves the state untouched. Observers
//! subscribe through a watch channel, so waiting for ACTIVE or for a
//! terminal state needs no polling.

use crate::error::{ConduitError, Result};
use std::fmt;
use tokio::sync::watch;

/// Lifecycle of one connection attempt. Reconnection is a fresh attempt
/// starting over from `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Active,
    Paused,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    /// Terminal states; nothing transitions out of them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// States in which frames may be emitted on the wire.
    pub fn can_emit_frames(self) -> bool {
        matches!(
            self,
            Self::Authenticating | Self::Connected | Self::Active | Self::Paused | Self::Closing
        )
    }

    /// States in which arbitrary MESSAGE/RPC traffic is permitted.
    pub fn allows_traffic(self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }

    /// States in which the heartbeat task probes the peer.
    pub fn heartbeats(self) -> bool {
        matches!(self, Self::Connected | Self::Active | Self::Paused)
    }

    fn name(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Authenticating => "AUTHENTICATING",
            Self::Connected => "CONNECTED",
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether `from -> to` appears in the transition table.
pub fn transition_allowed(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Connecting, Authenticating)
            | (Connecting, Failed)
            | (Authenticating, Connected)
            | (Authenticating, Failed)
            | (Connected, Active)
            | (Active, Paused)
            | (Paused, Active)
            | (Connected, Closing)
            | (Active, Closing)
            | (Paused, Closing)
            | (Connected, Failed)
            | (Active, Failed)
            | (Paused, Failed)
            | (Closing, Closed)
    )
}

/// Watch-observable state cell enforcing the transition table.
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub fn new(initial: ConnectionState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Current state.
    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Apply a transition, or fail with `InvalidTransition` leaving the
    /// state unchanged. Transitioning to the current state is a no-op.
    pub fn transition(&self, to: ConnectionState) -> Result<ConnectionState> {
        let mut rejected_from = None;
        self.tx.send_if_modified(|state| {
            if *state == to {
                false
            } else if transition_allowed(*state, to) {
                *state = to;
                true
            } else {
                rejected_from = Some(*state);
                false
            }
        });
        match rejected_from {
            Some(from) => Err(ConduitError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            }),
            None => Ok(to),
        }
    }

    /// Apply a transition if legal; report whether the state changed.
    /// Used on racy internal paths where losing the race is expected.
    pub fn try_transition(&self, to: ConnectionState) -> bool {
        self.tx.send_if_modified(|state| {
            if transition_allowed(*state, to) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Wait until the state satisfies the predicate, returning it.
    /// Resolves immediately if it already does.
    pub async fn wait_for<F>(&self, mut predicate: F) -> ConnectionState
    where
        F: FnMut(ConnectionState) -> bool,
    {
        let mut rx = self.subscribe();
        let result = match rx.wait_for(|s| predicate(*s)).await {
            Ok(state) => *state,
            // Sender dropped: the connection is gone; report the last state
            Err(_) => self.get(),
        };
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn happy_path_transitions() {
        let cell = StateCell::new(Disconnected);
        for next in [Connecting, Authenticating, Connected, Active, Paused, Active, Closing, Closed]
        {
            cell.transition(next).expect("legal transition");
            assert_eq!(cell.get(), next);
        }
        assert!(cell.get().is_terminal());
    }

    #[test]
    fn illegal_transition_is_rejected_without_mutation() {
        let cell = StateCell::new(Connected);
        let err = cell.transition(Paused).expect_err("CONNECTED -> PAUSED is illegal");
        assert!(matches!(err, ConduitError::InvalidTransition { .. }));
        assert_eq!(cell.get(), Connected);
    }

    #[test]
    fn terminal_states_do_not_move() {
        for terminal in [Closed, Failed] {
            let cell = StateCell::new(terminal);
            assert!(cell.transition(Active).is_err());
            assert!(!cell.try_transition(Connecting));
            assert_eq!(cell.get(), terminal);
        }
    }

    #[test]
    fn self_transition_is_a_noop() {
        let cell = StateCell::new(Active);
        assert!(cell.transition(Active).is_ok());
        assert_eq!(cell.get(), Active);
    }

    #[test]
    fn failure_paths() {
        assert!(transition_allowed(Connecting, Failed));
        assert!(transition_allowed(Authenticating, Failed));
        assert!(transition_allowed(Connected, Failed));
        assert!(transition_allowed(Active, Failed));
        assert!(transition_allowed(Paused, Failed));
        assert!(!transition_allowed(Closed, Failed));
        assert!(!transition_allowed(Failed, Connecting));
    }

    #[test]
    fn emission_and_traffic_gates() {
        assert!(Authenticating.can_emit_frames());
        assert!(Closing.can_emit_frames());
        assert!(!Disconnected.can_emit_frames());
        assert!(!Failed.can_emit_frames());

        assert!(Active.allows_traffic());
        assert!(Paused.allows_traffic());
        assert!(!Connected.allows_traffic());
    }

    #[tokio::test]
    async fn wait_for_observes_transitions() {
        let cell = std::sync::Arc::new(StateCell::new(Connected));
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait_for(|s| s == Active).await })
        };
        tokio::task::yield_now().await;
        cell.transition(Active).expect("legal");
        assert_eq!(waiter.await.expect("join"), Active);
    }
}
