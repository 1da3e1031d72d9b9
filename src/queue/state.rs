//! Consumer connection state machine

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Consuming,
    /// Terminal
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerEvent {
    /// Backoff elapsed (or first start), try the broker again
    Retry,
    /// Connection, queue declaration and consumer registration succeeded
    Connected,
    ConnectFailed,
    ConnectionLost,
    StopRequested,
}

impl ConsumerState {
    pub fn transition(self, event: ConsumerEvent) -> ConsumerState {
        use ConsumerEvent::*;
        use ConsumerState::*;

        match (self, event) {
            (ShuttingDown, _) | (_, StopRequested) => ShuttingDown,
            (Disconnected, Retry) => Connecting,
            (Connecting, Connected) => Consuming,
            (Connecting, ConnectFailed) | (Consuming, ConnectionLost) => Disconnected,
            (state, _) => state,
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsumerState::Disconnected => "disconnected",
            ConsumerState::Connecting => "connecting",
            ConsumerState::Consuming => "consuming",
            ConsumerState::ShuttingDown => "shutting_down",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::ConsumerEvent::*;
    use super::ConsumerState::*;
    use super::*;

    #[test]
    fn test_reconnect_cycle() {
        let state = Disconnected.transition(Retry);
        assert_eq!(state, Connecting);
        let state = state.transition(Connected);
        assert_eq!(state, Consuming);
        let state = state.transition(ConnectionLost);
        assert_eq!(state, Disconnected);
        assert_eq!(state.transition(Retry), Connecting);
    }

    #[test]
    fn test_connect_failure_returns_to_disconnected() {
        assert_eq!(Connecting.transition(ConnectFailed), Disconnected);
    }

    #[test]
    fn test_stop_from_any_state() {
        for state in [Disconnected, Connecting, Consuming] {
            assert_eq!(state.transition(StopRequested), ShuttingDown);
        }
    }

    #[test]
    fn test_shutting_down_is_terminal() {
        for event in [Retry, Connected, ConnectFailed, ConnectionLost, StopRequested] {
            assert_eq!(ShuttingDown.transition(event), ShuttingDown);
        }
    }

    #[test]
    fn test_irrelevant_events_are_ignored() {
        assert_eq!(Consuming.transition(Connected), Consuming);
        assert_eq!(Disconnected.transition(ConnectionLost), Disconnected);
    }
}
