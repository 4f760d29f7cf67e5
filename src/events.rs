//! Typed events flowing between components and up to the host application.
use std::sync::mpsc::{channel, Receiver, Sender};

use serde::Serialize;

use crate::storage::SegmentDomain;

/// Health of the push subsystem, published by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushEvent {
    /// Notifications are flowing and can be trusted.
    SubsystemUp,
    /// Notifications are not flowing, the cache must be kept fresh some other way.
    SubsystemDown,
    /// Streaming failed but is being retried.
    RetryableError,
    /// Streaming failed for the rest of the session.
    NonRetryableError,
    /// The server turned streaming off for the rest of the session.
    StreamingDisabled,
}

/// How the cache is currently kept fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Changes are pushed over the streaming link.
    Streaming,
    /// Changes are picked up by periodic fetches.
    Polling,
}

/// Which part of the cache changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheDomain {
    /// Feature flag rules.
    Rules,
    /// Segment memberships of one subscriber.
    Segments,
    /// Large segment memberships of one subscriber.
    LargeSegments,
}

impl From<SegmentDomain> for CacheDomain {
    fn from(value: SegmentDomain) -> Self {
        match value {
            SegmentDomain::Segments => CacheDomain::Segments,
            SegmentDomain::LargeSegments => CacheDomain::LargeSegments,
        }
    }
}

/// Events delivered to the host application through a [`SyncListener`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// The synchronizer switched between streaming and polling.
    ModeChanged {
        /// The new mode.
        mode: SyncMode,
    },
    /// A cache domain changed.
    CacheUpdated {
        /// The domain that changed.
        domain: CacheDomain,
        /// Subscriber key, set for per-subscriber domains.
        key: Option<String>,
    },
}

/// Receives [`SyncEvent`]s. Implemented for any `Fn(SyncEvent)`.
///
/// Called from background threads, implementations should return quickly.
pub trait SyncListener {
    /// Handle one event.
    fn on_event(&self, event: SyncEvent);
}

pub(crate) struct NoopSyncListener;
impl SyncListener for NoopSyncListener {
    fn on_event(&self, _event: SyncEvent) {}
}

impl<T: Fn(SyncEvent)> SyncListener for T {
    fn on_event(&self, event: SyncEvent) {
        self(event);
    }
}

enum Subscriber<T> {
    Channel(Sender<T>),
    Callback(Box<dyn Fn(T) + Send + Sync>),
}

/// Fan-out of events to subscribers registered before the bus is handed to its publisher.
///
/// Every subscriber receives every event in publish order. Subscribers that went away are
/// skipped.
pub struct EventBus<T> {
    subscribers: Vec<Subscriber<T>>,
}

impl<T> std::fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl<T: Clone> EventBus<T> {
    /// Create a bus without subscribers.
    pub fn new() -> EventBus<T> {
        EventBus {
            subscribers: Vec::new(),
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&mut self) -> Receiver<T> {
        let (sender, receiver) = channel();
        self.subscribers.push(Subscriber::Channel(sender));
        receiver
    }

    /// Register an existing channel as a subscriber.
    pub fn subscribe_sender(&mut self, sender: Sender<T>) {
        self.subscribers.push(Subscriber::Channel(sender));
    }

    /// Register a callback, invoked on the publisher's thread. It must not block.
    pub fn subscribe_fn(&mut self, callback: impl Fn(T) + Send + Sync + 'static) {
        self.subscribers
            .push(Subscriber::Callback(Box::new(callback)));
    }

    /// Deliver `event` to every live subscriber.
    pub fn publish(&self, event: T) {
        for subscriber in &self.subscribers {
            match subscriber {
                // A closed receiver only means that subscriber has shut down.
                Subscriber::Channel(sender) => {
                    let _ = sender.send(event.clone());
                }
                Subscriber::Callback(callback) => callback(event.clone()),
            }
        }
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        EventBus::new()
    }
}
