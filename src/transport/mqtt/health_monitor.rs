//! Pure state transitions and reconnection decisions for the bridge
//!
//! Nothing here performs I/O; the dispatcher feeds events in and applies the
//! resulting state.

use super::connection::{BridgeState, ReconnectConfig};
use thiserror::Error;
use tracing::{error, info, warn};

/// Events that drive the bridge state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Broker session created, first connect attempt pending
    ConnectStarted,
    /// Broker accepted the connection
    ConnectAccepted,
    /// Broker answered with the bad-credentials code
    BadCredentials,
    /// Fresh token obtained and re-applied to the session
    RefreshSucceeded,
    /// The credential source could not renew the token
    RefreshFailed(String),
    /// Transport dropped; the library reconnects on the next poll
    ConnectionLost(String),
    ShutdownRequested,
    /// Unrecoverable error
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid bridge transition from {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: BridgeState,
    pub event: BridgeEvent,
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Pure state machine and reconnection policy
pub struct HealthMonitor;

impl HealthMonitor {
    /// Next state for `event` in `current`, or an error for transitions the
    /// bridge never takes
    pub fn determine_next_state(
        current: &BridgeState,
        event: BridgeEvent,
    ) -> Result<BridgeState, InvalidTransition> {
        use BridgeEvent as E;
        use BridgeState as S;

        let next = match (current, &event) {
            (S::Failed(_), _) => None,
            (_, E::Fatal(reason)) => Some(S::Failed(reason.clone())),
            (S::ShuttingDown, E::ShutdownRequested | E::ConnectionLost(_)) => Some(S::ShuttingDown),
            (S::ShuttingDown, _) => None,
            (_, E::ShutdownRequested) => Some(S::ShuttingDown),

            (S::Starting, E::ConnectStarted) => Some(S::Connecting),

            (S::Connecting | S::Reauthenticating, E::ConnectAccepted) => Some(S::Connected),

            (S::Connecting | S::Connected | S::Reauthenticating, E::BadCredentials) => {
                Some(S::Reauthenticating)
            }
            (S::Reauthenticating, E::RefreshSucceeded) => Some(S::Reauthenticating),
            (S::Reauthenticating, E::RefreshFailed(reason)) => {
                Some(S::Failed(format!("token refresh failed: {reason}")))
            }

            (S::Connecting | S::Connected, E::ConnectionLost(_)) => Some(S::Connecting),
            (S::Reauthenticating, E::ConnectionLost(_)) => Some(S::Reauthenticating),

            _ => None,
        };

        next.ok_or_else(|| InvalidTransition {
            from: current.clone(),
            event,
        })
    }

    /// Determine if reconnection should be attempted.
    /// Supports unlimited retries when max_attempts is None
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
    ) -> ReconnectionDecision {
        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// Log a state transition at a level matching its severity
    pub fn log_state_transition(from: &BridgeState, to: &BridgeState) {
        match (from, to) {
            (BridgeState::Connecting, BridgeState::Connected) => {
                info!("Broker connection established");
            }
            (BridgeState::Reauthenticating, BridgeState::Connected) => {
                info!("Broker accepted refreshed credentials");
            }
            (BridgeState::Connected, BridgeState::Reauthenticating) => {
                warn!("Broker rejected credentials, reauthenticating");
            }
            (BridgeState::Connected, BridgeState::Connecting) => {
                warn!("Broker connection lost, reconnecting");
            }
            (_, BridgeState::Failed(reason)) => {
                error!("Bridge failed: {}", reason);
            }
            _ if from != to => {
                info!("Bridge state: {} -> {}", from, to);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn next(state: BridgeState, event: BridgeEvent) -> BridgeState {
        HealthMonitor::determine_next_state(&state, event).unwrap()
    }

    #[test]
    fn test_happy_path() {
        let state = next(BridgeState::Starting, BridgeEvent::ConnectStarted);
        assert_eq!(state, BridgeState::Connecting);
        let state = next(state, BridgeEvent::ConnectAccepted);
        assert_eq!(state, BridgeState::Connected);
        let state = next(state, BridgeEvent::ShutdownRequested);
        assert_eq!(state, BridgeState::ShuttingDown);
    }

    #[test]
    fn test_reauthentication_cycle() {
        let state = next(BridgeState::Connected, BridgeEvent::BadCredentials);
        assert_eq!(state, BridgeState::Reauthenticating);
        let state = next(state, BridgeEvent::RefreshSucceeded);
        assert_eq!(state, BridgeState::Reauthenticating);
        let state = next(state, BridgeEvent::ConnectAccepted);
        assert_eq!(state, BridgeState::Connected);
    }

    #[test]
    fn test_refresh_failure_is_terminal() {
        let state = next(
            BridgeState::Reauthenticating,
            BridgeEvent::RefreshFailed("unreachable".into()),
        );
        assert!(state.is_terminal());

        let result = HealthMonitor::determine_next_state(&state, BridgeEvent::ConnectAccepted);
        assert!(result.is_err());
        let result = HealthMonitor::determine_next_state(&state, BridgeEvent::ShutdownRequested);
        assert!(result.is_err());
    }

    #[test]
    fn test_reauthenticating_entered_only_from_bad_credentials() {
        let events = [
            BridgeEvent::ConnectStarted,
            BridgeEvent::ConnectAccepted,
            BridgeEvent::RefreshSucceeded,
            BridgeEvent::ConnectionLost("io".into()),
            BridgeEvent::ShutdownRequested,
        ];
        for state in [BridgeState::Starting, BridgeState::Connecting, BridgeState::Connected] {
            for event in events.clone() {
                if let Ok(to) = HealthMonitor::determine_next_state(&state, event.clone()) {
                    assert_ne!(to, BridgeState::Reauthenticating, "{state:?} on {event:?}");
                }
            }
        }
    }

    #[test]
    fn test_connection_lost_returns_to_connecting() {
        assert_eq!(
            next(BridgeState::Connected, BridgeEvent::ConnectionLost("reset".into())),
            BridgeState::Connecting
        );
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(HealthMonitor::determine_next_state(&BridgeState::Starting, BridgeEvent::ConnectAccepted).is_err());
        assert!(HealthMonitor::determine_next_state(&BridgeState::Connected, BridgeEvent::RefreshSucceeded).is_err());
        assert!(HealthMonitor::determine_next_state(&BridgeState::ShuttingDown, BridgeEvent::ConnectAccepted).is_err());
    }

    #[test]
    fn test_fatal_from_any_live_state() {
        for state in [
            BridgeState::Starting,
            BridgeState::Connecting,
            BridgeState::Connected,
            BridgeState::Reauthenticating,
            BridgeState::ShuttingDown,
        ] {
            assert_eq!(
                next(state, BridgeEvent::Fatal("boom".into())),
                BridgeState::Failed("boom".into())
            );
        }
    }

    #[test]
    fn test_reconnection_decisions() {
        let config = ReconnectConfig {
            max_attempts: Some(2),
            backoff_pattern: vec![10, 20],
            sustained_delay: 30,
        };
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config),
            ReconnectionDecision::Proceed { attempt: 1, delay_ms: 10 }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(1, &config),
            ReconnectionDecision::Proceed { attempt: 2, delay_ms: 20 }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(2, &config),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
    }

    #[test]
    fn test_unlimited_reconnection() {
        let config = ReconnectConfig::default();
        assert!(matches!(
            HealthMonitor::should_attempt_reconnection(10_000, &config),
            ReconnectionDecision::Proceed { attempt: 10_001, delay_ms: 5000 }
        ));
    }
}
