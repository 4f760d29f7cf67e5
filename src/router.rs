//! Dispatch of decoded notifications to per-destination workers.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use regex::Regex;

use crate::{
    codec::Notification,
    events::CacheDomain,
    hashing::KeyHasher,
    scheduler::{Scheduler, SerialQueue},
};

/// Consumer of notifications for one destination.
pub trait Worker: Send + Sync {
    /// Enqueue a notification. Must not block.
    fn submit(&self, notification: Notification);

    /// Drop pending notifications and refuse new ones.
    fn close(&self) {}
}

type Handler<T> = Box<dyn Fn(T) + Send + Sync>;

struct QueueInner<T> {
    queue: SerialQueue<T>,
    handler: Handler<T>,
}

impl<T> QueueInner<T> {
    fn drain(&self) {
        while let Some(next) = self.queue.pop() {
            (self.handler)(next);
        }
    }
}

/// FIFO worker: items are handled one at a time, in submission order, off the caller's thread.
///
/// Besides notifications, owners may enqueue their own work items (`T`) so that everything
/// touching one destination runs on the same sequence.
pub struct QueueWorker<T = Notification> {
    name: String,
    inner: Arc<QueueInner<T>>,
    scheduler: Arc<dyn Scheduler>,
}

impl<T: Send + 'static> QueueWorker<T> {
    /// Create a worker handling items on tasks spawned on `scheduler`.
    pub fn new(
        name: impl Into<String>,
        scheduler: Arc<dyn Scheduler>,
        handler: impl Fn(T) + Send + Sync + 'static,
    ) -> QueueWorker<T> {
        QueueWorker {
            name: name.into(),
            inner: Arc::new(QueueInner {
                queue: SerialQueue::new(),
                handler: Box::new(handler),
            }),
            scheduler,
        }
    }

    /// Enqueue a work item behind everything already submitted.
    pub fn enqueue(&self, item: T) {
        if self.inner.queue.push(item) {
            let inner = Arc::clone(&self.inner);
            self.scheduler
                .spawn(&self.name, Box::new(move || inner.drain()));
        }
    }
}

impl<T: From<Notification> + Send + 'static> Worker for QueueWorker<T> {
    fn submit(&self, notification: Notification) {
        self.enqueue(notification.into());
    }

    fn close(&self) {
        self.inner.queue.close();
    }
}

/// Where a segment notification should go.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SegmentTarget {
    /// Per-subscriber channel, carrying the subscriber's channel hash.
    Subscriber(String),
    /// Environment-wide channel, every subscriber checks the payload against its own key.
    Broadcast,
}

/// Routes notifications: rule notifications to the single rules worker, segment notifications to
/// the worker registered for the key hash embedded in the channel name.
///
/// Segment notifications for keys nobody registered are dropped silently, since several clients
/// may share one streaming connection.
pub struct NotificationRouter {
    hasher: Box<dyn KeyHasher + Send + Sync>,
    rules: RwLock<Option<Arc<dyn Worker>>>,
    subscribers: RwLock<HashMap<(CacheDomain, String), Arc<dyn Worker>>>,
    subscriber_channel: Regex,
}

impl NotificationRouter {
    /// Create a router with no workers. `hasher` maps subscriber keys to channel hashes.
    pub fn new(hasher: impl KeyHasher + Send + Sync + 'static) -> NotificationRouter {
        NotificationRouter {
            hasher: Box::new(hasher),
            rules: RwLock::new(None),
            subscribers: RwLock::new(HashMap::new()),
            // <org>_<environment>_<key hash>_mySegments
            subscriber_channel: Regex::new(r"^[^_]+_[^_]+_([^_]+)_my(?:Large)?Segments$")
                .expect("subscriber channel pattern should compile"),
        }
    }

    /// Register the worker for `domain`. `key` is ignored for [`CacheDomain::Rules`].
    pub fn register_worker(&self, domain: CacheDomain, key: &str, worker: Arc<dyn Worker>) {
        let previous = match domain {
            CacheDomain::Rules => self.rules.write().ok().and_then(|mut it| it.replace(worker)),
            CacheDomain::Segments | CacheDomain::LargeSegments => {
                let hash = self.hasher.channel_hash(key);
                self.subscribers
                    .write()
                    .ok()
                    .and_then(|mut it| it.insert((domain, hash), worker))
            }
        };
        if let Some(previous) = previous {
            previous.close();
        }
    }

    /// Unregister and close the worker for `domain` and `key`.
    pub fn unregister_worker(&self, domain: CacheDomain, key: &str) {
        let removed = match domain {
            CacheDomain::Rules => self.rules.write().ok().and_then(|mut it| it.take()),
            CacheDomain::Segments | CacheDomain::LargeSegments => {
                let hash = self.hasher.channel_hash(key);
                self.subscribers
                    .write()
                    .ok()
                    .and_then(|mut it| it.remove(&(domain, hash)))
            }
        };
        if let Some(removed) = removed {
            removed.close();
        }
    }

    /// Close and forget every worker.
    pub fn clear(&self) {
        let mut workers: Vec<Arc<dyn Worker>> = Vec::new();
        if let Ok(mut rules) = self.rules.write() {
            workers.extend(rules.take());
        }
        if let Ok(mut subscribers) = self.subscribers.write() {
            workers.extend(subscribers.drain().map(|(_, worker)| worker));
        }
        for worker in workers {
            worker.close();
        }
    }

    /// Deliver a data notification to its destination. Other notifications are ignored.
    pub fn route(&self, notification: Notification) {
        if matches!(
            notification,
            Notification::RulesChanged(_) | Notification::RulesKilled(_)
        ) {
            let worker = self.rules.read().ok().and_then(|it| it.clone());
            match worker {
                Some(worker) => worker.submit(notification),
                None => log::debug!(target: "flagsync", "no rules worker, dropping notification"),
            }
            return;
        }

        let (domain, channel) = match &notification {
            Notification::SubscriberSegmentsChanged(change) => {
                (CacheDomain::Segments, change.channel.as_str())
            }
            Notification::SubscriberSegmentsChangedV2(change) => {
                (CacheDomain::Segments, change.channel.as_str())
            }
            Notification::LargeSegmentsChanged(change) => {
                (CacheDomain::LargeSegments, change.channel.as_str())
            }
            Notification::RulesChanged(_)
            | Notification::RulesKilled(_)
            | Notification::Occupancy(_)
            | Notification::Control(_)
            | Notification::ProtocolError(_)
            | Notification::Ignored => return,
        };

        let target = self.segment_target(channel);
        let workers: Vec<Arc<dyn Worker>> = {
            let Ok(subscribers) = self.subscribers.read() else {
                return;
            };
            match &target {
                SegmentTarget::Subscriber(hash) => subscribers
                    .get(&(domain, hash.clone()))
                    .cloned()
                    .into_iter()
                    .collect(),
                SegmentTarget::Broadcast => subscribers
                    .iter()
                    .filter(|((worker_domain, _), _)| *worker_domain == domain)
                    .map(|(_, worker)| Arc::clone(worker))
                    .collect(),
            }
        };

        if workers.is_empty() {
            log::trace!(target: "flagsync", channel; "no worker for segment notification");
            return;
        }
        let Some((last, rest)) = workers.split_last() else {
            return;
        };
        for worker in rest {
            worker.submit(notification.clone());
        }
        last.submit(notification);
    }

    fn segment_target(&self, channel: &str) -> SegmentTarget {
        match self.subscriber_channel.captures(channel) {
            Some(captures) => SegmentTarget::Subscriber(captures[1].to_owned()),
            None => SegmentTarget::Broadcast,
        }
    }
}
