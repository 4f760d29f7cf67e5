//! Fire-and-forget counters about the streaming core.
use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Streaming lifecycle events worth counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingEventKind {
    /// The link opened.
    ConnectionEstablished,
    /// Occupancy of the primary control channel. Value is the publisher count.
    OccupancyPrimary,
    /// Occupancy of the secondary control channel. Value is the publisher count.
    OccupancySecondary,
    /// A control notification arrived. Value is its timestamp.
    StreamingStatus,
    /// The link failed. Value is 1 if the failure is not recoverable.
    ConnectionError,
    /// A new token was obtained. Value is its expiration in milliseconds.
    TokenRefresh,
    /// The server sent a protocol error. Value is the error code.
    AblyError,
    /// The synchronizer switched mode. Value is 0 for streaming, 1 for polling.
    SyncModeUpdate,
}

/// Operations whose latency is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    /// Full rules sync.
    Rules,
    /// Memberships fetch of one subscriber.
    Segments,
    /// Streaming authentication.
    Auth,
}

/// One recorded streaming event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamingEvent {
    /// What happened.
    pub kind: StreamingEventKind,
    /// Meaning depends on `kind`.
    pub value: i64,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
}

/// Receives telemetry. Implementations must never block or fail.
pub trait TelemetrySink: Send + Sync {
    /// Record a streaming lifecycle event.
    fn record_streaming_event(&self, kind: StreamingEventKind, value: i64, timestamp: DateTime<Utc>);
    /// Count an authentication rejected by the server.
    fn record_auth_rejection(&self);
    /// Count a successful token refresh.
    fn record_token_refresh(&self);
    /// Record how long `operation` took.
    fn record_sync_latency(&self, operation: SyncOperation, latency: Duration);
    /// Push buffered data to its destination.
    fn flush(&self) {}
}

/// Discards everything.
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record_streaming_event(&self, _kind: StreamingEventKind, _value: i64, _timestamp: DateTime<Utc>) {}
    fn record_auth_rejection(&self) {}
    fn record_token_refresh(&self) {}
    fn record_sync_latency(&self, _operation: SyncOperation, _latency: Duration) {}
}

#[derive(Debug, Default)]
struct Counters {
    streaming_events: Vec<StreamingEvent>,
    auth_rejections: u64,
    token_refreshes: u64,
    latencies: HashMap<SyncOperation, Vec<Duration>>,
    flushes: u64,
}

/// Keeps counters in memory so they can be inspected or exported later.
#[derive(Debug, Default)]
pub struct InMemoryTelemetry {
    counters: Mutex<Counters>,
}

impl InMemoryTelemetry {
    /// Keep at most this many streaming events, dropping the oldest.
    pub const MAX_STREAMING_EVENTS: usize = 20;

    /// Create empty counters.
    pub fn new() -> InMemoryTelemetry {
        InMemoryTelemetry::default()
    }

    /// Recorded streaming events, oldest first.
    pub fn streaming_events(&self) -> Vec<StreamingEvent> {
        self.counters
            .lock()
            .map(|counters| counters.streaming_events.clone())
            .unwrap_or_default()
    }

    /// Authentication rejections counted so far.
    pub fn auth_rejections(&self) -> u64 {
        self.counters.lock().map(|it| it.auth_rejections).unwrap_or(0)
    }

    /// Token refreshes counted so far.
    pub fn token_refreshes(&self) -> u64 {
        self.counters.lock().map(|it| it.token_refreshes).unwrap_or(0)
    }

    /// Latencies recorded for `operation`, oldest first.
    pub fn latencies(&self, operation: SyncOperation) -> Vec<Duration> {
        self.counters
            .lock()
            .ok()
            .and_then(|it| it.latencies.get(&operation).cloned())
            .unwrap_or_default()
    }

    /// Number of [`TelemetrySink::flush`] calls.
    pub fn flushes(&self) -> u64 {
        self.counters.lock().map(|it| it.flushes).unwrap_or(0)
    }
}

impl TelemetrySink for InMemoryTelemetry {
    fn record_streaming_event(&self, kind: StreamingEventKind, value: i64, timestamp: DateTime<Utc>) {
        if let Ok(mut counters) = self.counters.lock() {
            let events = &mut counters.streaming_events;
            if events.len() >= InMemoryTelemetry::MAX_STREAMING_EVENTS {
                events.remove(0);
            }
            events.push(StreamingEvent {
                kind,
                value,
                timestamp,
            });
        }
    }

    fn record_auth_rejection(&self) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.auth_rejections += 1;
        }
    }

    fn record_token_refresh(&self) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.token_refreshes += 1;
        }
    }

    fn record_sync_latency(&self, operation: SyncOperation, latency: Duration) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.latencies.entry(operation).or_default().push(latency);
        }
    }

    fn flush(&self) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.flushes += 1;
            log::debug!(target: "flagsync",
                        streaming_events = counters.streaming_events.len(),
                        auth_rejections = counters.auth_rejections,
                        token_refreshes = counters.token_refreshes;
                        "flushing telemetry");
        }
    }
}
