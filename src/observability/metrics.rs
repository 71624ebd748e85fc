//! Thread-safe metrics collection
//!
//! Atomic counters for the telemetry path, the broker session and the
//! credential lifecycle, exposed as a serializable snapshot.

use crate::transport::mqtt::BridgeState;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics
pub struct MetricsCollector {
    // Telemetry path
    readings_received: AtomicU64,
    messages_published: AtomicU64,
    readings_discarded: AtomicU64,
    publish_failures: AtomicU64,
    commands_received: AtomicU64,

    // Broker session
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_start_time: AtomicU64,

    // Credentials
    token_refreshes: AtomicU64,
    reauthentications: AtomicU64,
    last_token_refresh: AtomicU64,

    bridge_state: Mutex<String>,
    state_transitions: AtomicU64,
    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            readings_received: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            readings_discarded: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            commands_received: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            token_refreshes: AtomicU64::new(0),
            reauthentications: AtomicU64::new(0),
            last_token_refresh: AtomicU64::new(0),
            bridge_state: Mutex::new(BridgeState::Starting.label().to_string()),
            state_transitions: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Telemetry metrics
    pub fn record_reading_received(&self) {
        self.readings_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self) {
        self.readings_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    // Session metrics
    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    // Credential metrics
    pub fn record_token_refresh(&self) {
        self.token_refreshes.fetch_add(1, Ordering::Relaxed);
        self.last_token_refresh
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn record_reauthentication(&self) {
        self.reauthentications.fetch_add(1, Ordering::Relaxed);
    }

    /// Track the bridge state; anything but `Connected` clears the
    /// connected flag
    pub fn set_bridge_state(&self, state: &BridgeState) {
        self.connected
            .store(*state == BridgeState::Connected, Ordering::Relaxed);
        if let Ok(mut current) = self.bridge_state.lock() {
            if *current != state.label() {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current = state.label().to_string();
            }
        }
    }

    /// Get complete metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let connected = self.connected.load(Ordering::Relaxed);
        let connection_duration_seconds = if connected {
            now.saturating_sub(self.connection_start_time.load(Ordering::Relaxed))
        } else {
            0
        };

        MetricsSnapshot {
            telemetry: TelemetryMetrics {
                readings_received: self.readings_received.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                readings_discarded: self.readings_discarded.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                commands_received: self.commands_received.load(Ordering::Relaxed),
            },
            session: SessionMetrics {
                connected,
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_duration_seconds,
            },
            credentials: CredentialMetrics {
                token_refreshes: self.token_refreshes.load(Ordering::Relaxed),
                reauthentications: self.reauthentications.load(Ordering::Relaxed),
                last_token_refresh: self.last_token_refresh.load(Ordering::Relaxed),
            },
            lifecycle: LifecycleMetrics {
                bridge_state: self
                    .bridge_state
                    .lock()
                    .map(|s| s.clone())
                    .unwrap_or_else(|_| "unknown".to_string()),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub telemetry: TelemetryMetrics,
    pub session: SessionMetrics,
    pub credentials: CredentialMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryMetrics {
    pub readings_received: u64,
    pub messages_published: u64,
    pub readings_discarded: u64,
    pub publish_failures: u64,
    pub commands_received: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialMetrics {
    pub token_refreshes: u64,
    pub reauthentications: u64,
    pub last_token_refresh: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleMetrics {
    pub bridge_state: String,
    pub state_transitions: u64,
    pub uptime_seconds: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
