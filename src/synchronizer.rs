//! Top-level owner of the sync lifecycle.
//!
//! [`SyncOrchestrator`] keeps the cache converging. While the push subsystem is healthy, changes
//! arrive as notifications and are applied by per-destination workers; whenever it is not, the
//! pollers take over. Every failure below this level ends up as a mode transition, never as an
//! error returned to the host.
use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, MutexGuard, Weak},
    time::{Duration, Instant},
};

use crate::{
    auth::{Authenticator, SubscriberKeys},
    backoff::BackoffConfig,
    codec::{
        decode_payload, is_key_in_bitmap, Compression, DecodeError, KeyList, KeyListAction,
        Notification, RulesChange, SegmentsChange, UpdateStrategy,
    },
    connection::{ConnectionManager, ConnectionManagerConfig, ConnectionSettings, ConnectionState},
    events::{CacheDomain, EventBus, PushEvent, SyncEvent, SyncListener, SyncMode},
    fetcher::Fetcher,
    hashing::{spread_delay_ms, KeyHasher, Murmur3Hasher},
    poller::{Poller, PollerConfig},
    router::{NotificationRouter, QueueWorker},
    scheduler::{Scheduler, SerialQueue, TimerHandle},
    storage::{Cache, Rule, RulesDelta, SegmentDomain, SubscriberSegments},
    telemetry::{StreamingEventKind, SyncOperation, TelemetrySink},
    transport::StreamingTransport,
    Error, Result,
};

/// Tunables of the [`SyncOrchestrator`].
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// When `false` the orchestrator only polls.
    pub streaming_enabled: bool,
    /// Fallback polling of rules.
    pub rules_polling: PollerConfig,
    /// Fallback polling of subscriber memberships.
    pub segments_polling: PollerConfig,
    /// Background time after which resuming triggers a catch-up fetch.
    pub resume_fetch_threshold: Duration,
    /// Retries of a failed fetch before waiting for the next trigger.
    pub sync_retry_attempts: u32,
    /// Delay between retries of a failed fetch.
    pub sync_retry_backoff: BackoffConfig,
    /// Tunables of the streaming connection.
    pub connection: ConnectionSettings,
}

impl SyncSettings {
    /// Default value for [`SyncSettings::resume_fetch_threshold`].
    pub const DEFAULT_RESUME_FETCH_THRESHOLD: Duration = Duration::from_secs(60);
    /// Default value for [`SyncSettings::sync_retry_attempts`].
    pub const DEFAULT_SYNC_RETRY_ATTEMPTS: u32 = 3;
    /// Default value for [`SyncSettings::sync_retry_backoff`].
    pub const DEFAULT_SYNC_RETRY_BACKOFF: BackoffConfig = BackoffConfig {
        base: Duration::from_secs(1),
        cap: Duration::from_secs(60),
    };
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            streaming_enabled: true,
            rules_polling: PollerConfig::new().with_interval(PollerConfig::DEFAULT_RULES_INTERVAL),
            segments_polling: PollerConfig::new()
                .with_interval(PollerConfig::DEFAULT_SEGMENTS_INTERVAL),
            resume_fetch_threshold: SyncSettings::DEFAULT_RESUME_FETCH_THRESHOLD,
            sync_retry_attempts: SyncSettings::DEFAULT_SYNC_RETRY_ATTEMPTS,
            sync_retry_backoff: SyncSettings::DEFAULT_SYNC_RETRY_BACKOFF,
            connection: ConnectionSettings::default(),
        }
    }
}

/// Collaborators of the [`SyncOrchestrator`].
pub struct SyncDependencies {
    /// Clock, timers and background tasks.
    pub scheduler: Arc<dyn Scheduler>,
    /// Storage kept in sync.
    pub cache: Arc<dyn Cache>,
    /// Source of full snapshots.
    pub fetcher: Arc<dyn Fetcher>,
    /// Source of streaming tokens.
    pub authenticator: Arc<dyn Authenticator>,
    /// The streaming link.
    pub transport: Arc<dyn StreamingTransport>,
    /// Streaming and sync counters.
    pub telemetry: Arc<dyn TelemetrySink>,
    /// Receives mode changes and cache updates.
    pub listener: Arc<dyn SyncListener + Send + Sync>,
}

/// Work item of a destination worker.
enum SyncTask {
    Notification(Notification),
    FetchRules {
        /// Version announced by the notification that triggered the fetch.
        target: Option<i64>,
        retries_left: u32,
    },
    FetchMemberships {
        retries_left: u32,
    },
}

impl From<Notification> for SyncTask {
    fn from(value: Notification) -> Self {
        SyncTask::Notification(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Destination {
    Rules,
    Subscriber(String),
}

/// Normalized V2 or large segments update.
struct MembershipUpdate {
    domain: SegmentDomain,
    change_number: Option<i64>,
    strategy: UpdateStrategy,
    compression: Compression,
    data: Option<String>,
    names: Vec<String>,
    /// Update interval and hash seed used to spread refetches.
    spread: Option<(u64, u32)>,
}

impl MembershipUpdate {
    fn payload(&self) -> std::result::Result<Vec<u8>, DecodeError> {
        let data = self.data.as_deref().ok_or(DecodeError::MissingPayload)?;
        decode_payload(data, self.compression)
    }
}

struct SyncState {
    mode: Option<SyncMode>,
    started: bool,
    stopped: bool,
    /// Streaming failed for the rest of the session, only polling remains.
    push_disabled: bool,
    paused_at: Option<Instant>,
    /// `None` until the first rules sync completes.
    initial_sync: Option<Result<()>>,
}

struct SyncInner {
    scheduler: Arc<dyn Scheduler>,
    cache: Arc<dyn Cache>,
    fetcher: Arc<dyn Fetcher>,
    telemetry: Arc<dyn TelemetrySink>,
    listener: Arc<dyn SyncListener + Send + Sync>,
    hasher: Murmur3Hasher,

    resume_fetch_threshold: Duration,
    sync_retry_attempts: u32,
    sync_retry_backoff: BackoffConfig,

    keys: SubscriberKeys,
    router: Arc<NotificationRouter>,
    rules_worker: Arc<QueueWorker<SyncTask>>,
    subscribers: Mutex<HashMap<String, Arc<QueueWorker<SyncTask>>>>,
    rules_poller: Poller,
    segments_poller: Poller,
    retry_timers: Mutex<Vec<TimerHandle>>,
    push_events: SerialQueue<PushEvent>,

    state: Mutex<SyncState>,
    initial_sync_done: Condvar,
}

impl SyncInner {
    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state
            .lock()
            .expect("thread holding sync state lock should not panic")
    }

    fn notify(&self, event: SyncEvent) {
        self.listener.on_event(event);
    }

    fn mode_changed(&self, mode: SyncMode) {
        self.telemetry.record_streaming_event(
            StreamingEventKind::SyncModeUpdate,
            match mode {
                SyncMode::Streaming => 0,
                SyncMode::Polling => 1,
            },
            self.scheduler.wall_clock(),
        );
        self.notify(SyncEvent::ModeChanged { mode });
    }

    fn cache_updated(&self, domain: CacheDomain, key: Option<&str>) {
        self.notify(SyncEvent::CacheUpdated {
            domain,
            key: key.map(str::to_owned),
        });
    }

    fn post_push_event(self: &Arc<Self>, event: PushEvent) {
        if self.push_events.push(event) {
            let this = Arc::clone(self);
            self.scheduler.spawn(
                "sync-events",
                Box::new(move || {
                    while let Some(event) = this.push_events.pop() {
                        this.on_push_event(event);
                    }
                }),
            );
        }
    }

    fn on_push_event(&self, event: PushEvent) {
        log::debug!(target: "flagsync", "push event: {event:?}");
        match event {
            PushEvent::SubsystemUp => self.switch_to_streaming(),
            PushEvent::SubsystemDown | PushEvent::RetryableError => self.switch_to_polling(false),
            PushEvent::NonRetryableError | PushEvent::StreamingDisabled => {
                self.switch_to_polling(true)
            }
        }
    }

    fn switch_to_streaming(&self) {
        let previous = {
            let mut state = self.lock();
            if state.stopped || state.push_disabled || state.mode == Some(SyncMode::Streaming) {
                return;
            }
            state.mode.replace(SyncMode::Streaming)
        };

        self.rules_poller.stop();
        self.segments_poller.stop();
        log::info!(target: "flagsync", "streaming is up, polling stopped");
        self.mode_changed(SyncMode::Streaming);
        if previous == Some(SyncMode::Polling) {
            // Close the gap accumulated while notifications were not flowing.
            self.catch_up();
        }
    }

    fn switch_to_polling(&self, permanently: bool) {
        let backgrounded = {
            let mut state = self.lock();
            if state.stopped {
                return;
            }
            if permanently {
                state.push_disabled = true;
            }
            if state.mode == Some(SyncMode::Polling) {
                return;
            }
            state.mode = Some(SyncMode::Polling);
            state.paused_at.is_some()
        };

        if !backgrounded {
            self.start_pollers();
        }
        log::info!(target: "flagsync", permanently; "streaming is down, polling");
        self.mode_changed(SyncMode::Polling);
    }

    fn start_pollers(&self) {
        self.rules_poller.start();
        self.segments_poller.start();
    }

    fn stop_pollers(&self) {
        self.rules_poller.stop();
        self.segments_poller.stop();
    }

    /// Full sync of rules and every registered subscriber.
    fn catch_up(&self) {
        self.rules_worker.enqueue(SyncTask::FetchRules {
            target: None,
            retries_left: self.sync_retry_attempts,
        });
        for worker in self.subscriber_workers() {
            worker.enqueue(SyncTask::FetchMemberships {
                retries_left: self.sync_retry_attempts,
            });
        }
    }

    fn subscriber_workers(&self) -> Vec<Arc<QueueWorker<SyncTask>>> {
        self.subscribers
            .lock()
            .map(|subscribers| subscribers.values().cloned().collect())
            .unwrap_or_default()
    }

    fn enqueue(&self, destination: &Destination, task: SyncTask) {
        match destination {
            Destination::Rules => self.rules_worker.enqueue(task),
            Destination::Subscriber(key) => {
                let worker = self
                    .subscribers
                    .lock()
                    .ok()
                    .and_then(|subscribers| subscribers.get(key).cloned());
                // The subscriber may have been removed in the meantime.
                if let Some(worker) = worker {
                    worker.enqueue(task);
                }
            }
        }
    }

    fn enqueue_later(self: &Arc<Self>, destination: Destination, task: SyncTask, delay: Duration) {
        let weak = Arc::downgrade(self);
        let handle = self.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.enqueue(&destination, task);
                }
            }),
        );
        if let Ok(mut timers) = self.retry_timers.lock() {
            timers.retain(TimerHandle::is_pending);
            timers.push(handle);
        }
    }

    /// Schedule another attempt of a failed fetch. Returns `false` when giving up.
    fn retry(
        self: &Arc<Self>,
        destination: Destination,
        retries_left: u32,
        err: &Error,
        next: impl FnOnce(u32) -> SyncTask,
    ) -> bool {
        if retries_left == 0 || !err.is_recoverable() {
            log::warn!(target: "flagsync", "sync failed, waiting for the next trigger: {err}");
            return false;
        }
        let attempt = self.sync_retry_attempts.saturating_sub(retries_left);
        let delay = self.sync_retry_backoff.delay(attempt);
        log::warn!(target: "flagsync", retry_in_ms = delay.as_millis() as u64; "sync failed, retrying: {err}");
        self.enqueue_later(destination, next(retries_left - 1), delay);
        true
    }

    fn record_initial_sync(&self, result: Result<()>) {
        let mut state = self.lock();
        if result.is_ok() || state.initial_sync.is_none() {
            state.initial_sync = Some(result);
            self.initial_sync_done.notify_all();
        }
    }

    // Rules

    fn handle_rules_task(self: &Arc<Self>, task: SyncTask) {
        match task {
            SyncTask::Notification(Notification::RulesChanged(change)) => {
                self.on_rules_changed(change)
            }
            SyncTask::Notification(Notification::RulesKilled(kill)) => {
                if self
                    .cache
                    .kill_rule(&kill.name, &kill.default_treatment, kill.change_number)
                {
                    log::debug!(target: "flagsync", rule = kill.name.as_str(), change_number = kill.change_number; "rule killed");
                    self.cache_updated(CacheDomain::Rules, None);
                }
                self.on_rules_changed(RulesChange {
                    change_number: kill.change_number,
                    previous_change_number: None,
                    compression: Compression::None,
                    payload: None,
                });
            }
            SyncTask::FetchRules {
                target,
                retries_left,
            } => self.sync_rules(target, retries_left),
            SyncTask::Notification(_) | SyncTask::FetchMemberships { .. } => {}
        }
    }

    fn on_rules_changed(self: &Arc<Self>, change: RulesChange) {
        let version = self.cache.rules_version();
        if change.change_number <= version {
            log::trace!(target: "flagsync", change_number = change.change_number, version; "dropping stale rules change");
            return;
        }

        if let (Some(payload), Some(previous)) = (&change.payload, change.previous_change_number) {
            if previous == version {
                match decode_rule(payload, change.compression) {
                    Ok(rule) => {
                        let delta = RulesDelta {
                            rules: vec![rule],
                            since: version,
                            till: change.change_number,
                        };
                        if self.cache.apply_rules_delta(delta) {
                            log::debug!(target: "flagsync", change_number = change.change_number; "applied rules change in place");
                            self.cache_updated(CacheDomain::Rules, None);
                        }
                        return;
                    }
                    Err(err) => {
                        log::warn!(target: "flagsync", "cannot decode inline rule, fetching instead: {err}");
                    }
                }
            }
        }

        self.sync_rules(Some(change.change_number), self.sync_retry_attempts);
    }

    fn sync_rules(self: &Arc<Self>, target: Option<i64>, retries_left: u32) {
        let started = self.scheduler.now();
        let result = self.fetch_rules(target);
        self.telemetry.record_sync_latency(
            SyncOperation::Rules,
            self.scheduler.now().saturating_duration_since(started),
        );

        match result {
            Ok(changed) => {
                if changed {
                    log::debug!(target: "flagsync", version = self.cache.rules_version(); "rules updated");
                    self.cache_updated(CacheDomain::Rules, None);
                }
                self.record_initial_sync(Ok(()));
            }
            Err(err) => {
                let retrying = self.retry(Destination::Rules, retries_left, &err, |retries_left| {
                    SyncTask::FetchRules {
                        target,
                        retries_left,
                    }
                });
                if !retrying {
                    self.record_initial_sync(Err(err));
                }
            }
        }
    }

    /// Fetch until the cache reaches the server version. When a notification announced a newer
    /// version than the one served, ask again bypassing caches.
    fn fetch_rules(&self, target: Option<i64>) -> Result<bool> {
        let mut changed = self.fetch_rules_until_current(None)?;
        if let Some(target) = target {
            if self.cache.rules_version() < target {
                log::debug!(target: "flagsync", change_number = target; "rules still behind, bypassing cdn");
                changed |= self.fetch_rules_until_current(Some(target))?;
            }
        }
        Ok(changed)
    }

    fn fetch_rules_until_current(&self, till: Option<i64>) -> Result<bool> {
        let mut changed = false;
        loop {
            let since = self.cache.rules_version();
            let delta = self.fetcher.fetch_rules_since(since, till)?;
            if !self.cache.apply_rules_delta(delta) {
                return Ok(changed);
            }
            changed = true;
        }
    }

    fn poll_memberships(&self) {
        for worker in self.subscriber_workers() {
            worker.enqueue(SyncTask::FetchMemberships { retries_left: 0 });
        }
    }

    // Subscriber segments

    fn handle_subscriber_task(self: &Arc<Self>, key: &str, task: SyncTask) {
        match task {
            SyncTask::Notification(Notification::SubscriberSegmentsChanged(change)) => {
                self.on_segments_changed(key, change)
            }
            SyncTask::Notification(Notification::SubscriberSegmentsChangedV2(change)) => self
                .on_membership_update(
                    key,
                    MembershipUpdate {
                        domain: SegmentDomain::Segments,
                        change_number: change.change_number,
                        strategy: change.strategy,
                        compression: change.compression,
                        data: change.data,
                        names: change.segment_names,
                        spread: None,
                    },
                ),
            SyncTask::Notification(Notification::LargeSegmentsChanged(change)) => {
                let spread = change
                    .update_interval_ms
                    .filter(|interval| *interval > 0)
                    .map(|interval| (interval, change.hash_seed.unwrap_or(0)));
                self.on_membership_update(
                    key,
                    MembershipUpdate {
                        domain: SegmentDomain::LargeSegments,
                        change_number: change.change_number,
                        strategy: change.strategy,
                        compression: change.compression,
                        data: change.data,
                        names: change.names,
                        spread,
                    },
                )
            }
            SyncTask::FetchMemberships { retries_left } => {
                self.sync_memberships(key, retries_left)
            }
            SyncTask::Notification(_) | SyncTask::FetchRules { .. } => {}
        }
    }

    fn on_segments_changed(self: &Arc<Self>, key: &str, change: SegmentsChange) {
        if !change.includes_payload {
            self.sync_memberships(key, self.sync_retry_attempts);
            return;
        }

        let segments = SubscriberSegments::new(
            change.segments.unwrap_or_default(),
            Some(change.change_number),
        );
        if self
            .cache
            .set_subscriber_segments(SegmentDomain::Segments, key, segments)
        {
            log::debug!(target: "flagsync", key, change_number = change.change_number; "replaced subscriber segments");
            self.cache_updated(CacheDomain::Segments, Some(key));
        }
    }

    fn on_membership_update(self: &Arc<Self>, key: &str, update: MembershipUpdate) {
        let stored = self
            .cache
            .subscriber_segments(update.domain, key)
            .change_number;
        if let (Some(stored), Some(incoming)) = (stored, update.change_number) {
            if incoming <= stored {
                log::trace!(target: "flagsync", key, change_number = incoming; "dropping stale membership update");
                return;
            }
        }

        match update.strategy {
            UpdateStrategy::UnboundedFetch => self.fetch_memberships_for(key, update.spread),
            UpdateStrategy::BoundedFetch => {
                let hit = update
                    .payload()
                    .and_then(|bitmap| is_key_in_bitmap(&bitmap, self.hasher.key_hash64(key)));
                match hit {
                    Ok(true) => self.fetch_memberships_for(key, update.spread),
                    Ok(false) => {
                        log::trace!(target: "flagsync", key; "bounded update does not concern subscriber");
                    }
                    Err(err) => {
                        log::warn!(target: "flagsync", key; "malformed bounded update, fetching: {err}");
                        self.fetch_memberships_for(key, update.spread);
                    }
                }
            }
            UpdateStrategy::KeyList => {
                let action = update
                    .payload()
                    .and_then(|payload| KeyList::from_payload(&payload))
                    .map(|list| list.action_for(self.hasher.key_hash64(key)));
                match action {
                    Ok(KeyListAction::Add) => self.update_memberships(key, &update, true),
                    Ok(KeyListAction::Remove) => self.update_memberships(key, &update, false),
                    Ok(KeyListAction::None) => {}
                    Err(err) => {
                        log::warn!(target: "flagsync", key; "malformed key list, fetching: {err}");
                        self.fetch_memberships_for(key, update.spread);
                    }
                }
            }
            UpdateStrategy::SegmentRemoval => self.update_memberships(key, &update, false),
        }
    }

    fn update_memberships(&self, key: &str, update: &MembershipUpdate, add: bool) {
        if self.cache.update_subscriber_segments(
            update.domain,
            key,
            &update.names,
            add,
            update.change_number,
        ) {
            log::debug!(target: "flagsync", key, add; "updated subscriber memberships in place");
            self.cache_updated(update.domain.into(), Some(key));
        }
    }

    fn fetch_memberships_for(self: &Arc<Self>, key: &str, spread: Option<(u64, u32)>) {
        let delay_ms = spread.map_or(0, |(interval, seed)| {
            spread_delay_ms(&self.hasher, key, seed, interval)
        });
        if delay_ms == 0 {
            self.sync_memberships(key, self.sync_retry_attempts);
            return;
        }
        log::debug!(target: "flagsync", key, delay_ms; "delaying membership fetch");
        self.enqueue_later(
            Destination::Subscriber(key.to_owned()),
            SyncTask::FetchMemberships {
                retries_left: self.sync_retry_attempts,
            },
            Duration::from_millis(delay_ms),
        );
    }

    fn sync_memberships(self: &Arc<Self>, key: &str, retries_left: u32) {
        let started = self.scheduler.now();
        let result = self.fetcher.fetch_subscriber_segments(key);
        self.telemetry.record_sync_latency(
            SyncOperation::Segments,
            self.scheduler.now().saturating_duration_since(started),
        );

        match result {
            Ok(memberships) => {
                for (domain, segments) in [
                    (SegmentDomain::Segments, memberships.segments),
                    (SegmentDomain::LargeSegments, memberships.large_segments),
                ] {
                    if self.cache.set_subscriber_segments(domain, key, segments) {
                        self.cache_updated(domain.into(), Some(key));
                    }
                }
            }
            Err(err) => {
                self.retry(
                    Destination::Subscriber(key.to_owned()),
                    retries_left,
                    &err,
                    |retries_left| SyncTask::FetchMemberships { retries_left },
                );
            }
        }
    }
}

fn decode_rule(payload: &str, compression: Compression) -> std::result::Result<Rule, DecodeError> {
    let bytes = decode_payload(payload, compression)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Keeps the cache fresh, through streaming when possible and polling otherwise.
///
/// All methods return immediately. Fetches and notification handling happen on background tasks
/// provided by the scheduler; progress is reported through the [`SyncListener`].
pub struct SyncOrchestrator {
    inner: Arc<SyncInner>,
    connection: Option<ConnectionManager>,
}

impl SyncOrchestrator {
    /// Wire the orchestrator. Nothing happens until [`SyncOrchestrator::start`].
    pub fn new(settings: SyncSettings, dependencies: SyncDependencies) -> SyncOrchestrator {
        let SyncSettings {
            streaming_enabled,
            rules_polling,
            segments_polling,
            resume_fetch_threshold,
            sync_retry_attempts,
            sync_retry_backoff,
            connection: connection_settings,
        } = settings;
        let SyncDependencies {
            scheduler,
            cache,
            fetcher,
            authenticator,
            transport,
            telemetry,
            listener,
        } = dependencies;

        let inner = Arc::new_cyclic(|weak: &Weak<SyncInner>| {
            let rules_worker = {
                let weak = weak.clone();
                Arc::new(QueueWorker::new("rules", Arc::clone(&scheduler), move |task| {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_rules_task(task);
                    }
                }))
            };
            let rules_poller = {
                let weak = weak.clone();
                Poller::new("rules-poller", Arc::clone(&scheduler), rules_polling, move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.rules_worker.enqueue(SyncTask::FetchRules {
                            target: None,
                            retries_left: 0,
                        });
                    }
                })
            };
            let segments_poller = {
                let weak = weak.clone();
                Poller::new(
                    "segments-poller",
                    Arc::clone(&scheduler),
                    segments_polling,
                    move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.poll_memberships();
                        }
                    },
                )
            };

            SyncInner {
                scheduler,
                cache,
                fetcher,
                telemetry,
                listener,
                hasher: Murmur3Hasher,
                resume_fetch_threshold,
                sync_retry_attempts,
                sync_retry_backoff,
                keys: SubscriberKeys::new(),
                router: Arc::new(NotificationRouter::new(Murmur3Hasher)),
                rules_worker,
                subscribers: Mutex::new(HashMap::new()),
                rules_poller,
                segments_poller,
                retry_timers: Mutex::new(Vec::new()),
                push_events: SerialQueue::new(),
                state: Mutex::new(SyncState {
                    mode: None,
                    started: false,
                    stopped: false,
                    push_disabled: false,
                    paused_at: None,
                    initial_sync: None,
                }),
                initial_sync_done: Condvar::new(),
            }
        });
        inner
            .router
            .register_worker(CacheDomain::Rules, "", inner.rules_worker.clone());

        let connection = streaming_enabled.then(|| {
            let mut events = EventBus::new();
            let weak = Arc::downgrade(&inner);
            events.subscribe_fn(move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.post_push_event(event);
                }
            });
            ConnectionManager::new(ConnectionManagerConfig {
                settings: connection_settings,
                scheduler: Arc::clone(&inner.scheduler),
                authenticator,
                transport,
                keys: inner.keys.clone(),
                router: Arc::clone(&inner.router),
                events,
                telemetry: Arc::clone(&inner.telemetry),
            })
        });

        SyncOrchestrator { inner, connection }
    }

    /// Load the cache, run a full sync, then either connect streaming or start polling.
    pub fn start(&self) {
        {
            let mut state = self.inner.lock();
            if state.started || state.stopped {
                return;
            }
            state.started = true;
        }

        log::debug!(target: "flagsync", streaming = self.connection.is_some(); "starting synchronization");
        self.inner.cache.load();
        self.inner.catch_up();

        match &self.connection {
            Some(connection) => {
                self.inner.lock().mode = Some(SyncMode::Streaming);
                self.inner.mode_changed(SyncMode::Streaming);
                connection.start();
            }
            None => self.inner.switch_to_polling(true),
        }
    }

    /// The host went to background.
    pub fn pause(&self) {
        {
            let mut state = self.inner.lock();
            if !state.started || state.stopped || state.paused_at.is_some() {
                return;
            }
            state.paused_at = Some(self.inner.scheduler.now());
        }
        self.inner.stop_pollers();
        if let Some(connection) = &self.connection {
            connection.pause();
        }
    }

    /// The host came back to foreground.
    ///
    /// Resuming after more than the resume fetch threshold issues one catch-up fetch.
    pub fn resume(&self) {
        let (paused_for, mode) = {
            let mut state = self.inner.lock();
            if state.stopped {
                return;
            }
            let Some(paused_at) = state.paused_at.take() else {
                return;
            };
            (
                self.inner.scheduler.now().saturating_duration_since(paused_at),
                state.mode,
            )
        };

        if let Some(connection) = &self.connection {
            connection.resume();
        }
        if mode == Some(SyncMode::Polling) {
            self.inner.start_pollers();
        }
        if paused_for > self.inner.resume_fetch_threshold {
            log::debug!(target: "flagsync", paused_secs = paused_for.as_secs(); "resumed after a long pause, catching up");
            self.inner.catch_up();
        }
    }

    /// Stop streaming and polling and release every worker. Terminal.
    pub fn stop(&self) {
        {
            let mut state = self.inner.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            if state.initial_sync.is_none() {
                state.initial_sync = Some(Err(Error::Stopped));
                self.inner.initial_sync_done.notify_all();
            }
        }

        if let Some(connection) = &self.connection {
            connection.stop();
        }
        self.inner.stop_pollers();
        if let Ok(mut timers) = self.inner.retry_timers.lock() {
            for timer in timers.drain(..) {
                timer.cancel();
            }
        }
        self.inner.push_events.close();
        self.inner.router.clear();
        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.clear();
        }
        log::debug!(target: "flagsync", "synchronization stopped");
    }

    /// Ask telemetry collaborators to flush what they buffered.
    pub fn flush(&self) {
        self.inner.telemetry.flush();
    }

    /// Start keeping `key`'s memberships in sync. Returns `false` if it already was.
    ///
    /// The key is included in the next streaming authentication.
    pub fn add_subscriber(&self, key: &str) -> bool {
        let worker = {
            let Ok(mut subscribers) = self.inner.subscribers.lock() else {
                return false;
            };
            if subscribers.contains_key(key) || self.inner.lock().stopped {
                return false;
            }
            let weak = Arc::downgrade(&self.inner);
            let owned = key.to_owned();
            let worker = Arc::new(QueueWorker::new(
                "segments",
                Arc::clone(&self.inner.scheduler),
                move |task| {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_subscriber_task(&owned, task);
                    }
                },
            ));
            subscribers.insert(key.to_owned(), Arc::clone(&worker));
            worker
        };

        self.inner.keys.register(key);
        for domain in [CacheDomain::Segments, CacheDomain::LargeSegments] {
            self.inner
                .router
                .register_worker(domain, key, worker.clone());
        }
        log::debug!(target: "flagsync", key; "subscriber added");

        if self.inner.lock().started {
            worker.enqueue(SyncTask::FetchMemberships {
                retries_left: self.inner.sync_retry_attempts,
            });
        }
        true
    }

    /// Stop syncing `key` and forget its memberships. Returns `false` if it was not registered.
    pub fn remove_subscriber(&self, key: &str) -> bool {
        let removed = self
            .inner
            .subscribers
            .lock()
            .map(|mut subscribers| subscribers.remove(key).is_some())
            .unwrap_or(false);
        if !removed {
            return false;
        }

        self.inner.keys.unregister(key);
        for domain in [CacheDomain::Segments, CacheDomain::LargeSegments] {
            self.inner.router.unregister_worker(domain, key);
        }
        self.inner.cache.remove_subscriber(key);
        log::debug!(target: "flagsync", key; "subscriber removed");
        true
    }

    /// Current sync mode, `None` before [`SyncOrchestrator::start`].
    pub fn mode(&self) -> Option<SyncMode> {
        self.inner.lock().mode
    }

    /// State of the streaming connection, `None` when streaming is disabled.
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.connection.as_ref().map(ConnectionManager::state)
    }

    /// Block waiting for the first rules sync to complete.
    ///
    /// Returns the error of the first sync if it failed after all retries and no later sync
    /// succeeded yet.
    pub fn wait_for_initial_sync(&self) -> Result<()> {
        let mut state = self
            .inner
            .state
            .lock()
            .map_err(|_| Error::ThreadPanicked)?;
        loop {
            match &state.initial_sync {
                Some(result) => return result.clone(),
                None => {
                    state = self
                        .inner
                        .initial_sync_done
                        .wait(state)
                        .map_err(|_| Error::ThreadPanicked)?;
                }
            }
        }
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, VecDeque},
        sync::{Arc, Mutex},
        time::Duration,
    };

    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde_json::json;

    use super::{SyncDependencies, SyncOrchestrator, SyncSettings};
    use crate::{
        auth::AuthResult,
        connection::{
            tests::{scheduler, FakeTransport, ScriptedAuthenticator},
            ConnectionState,
        },
        events::{CacheDomain, SyncEvent, SyncMode},
        fetcher::{Fetcher, Memberships},
        hashing::{spread_delay_ms, KeyHasher, Murmur3Hasher},
        poller::PollerConfig,
        scheduler::ManualScheduler,
        storage::{
            Cache, InMemoryCache, Rule, RuleStatus, RulesDelta, SegmentDomain, SubscriberSegments,
        },
        telemetry::{InMemoryTelemetry, StreamingEventKind, SyncOperation, TelemetrySink},
        transport::TransportEvent,
        Error, Result,
    };

    #[derive(Default)]
    struct FakeFetcher {
        rules: Mutex<VecDeque<Result<RulesDelta>>>,
        rule_calls: Mutex<Vec<(i64, Option<i64>)>>,
        memberships: Mutex<HashMap<String, Memberships>>,
        membership_calls: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        fn script(&self, response: Result<RulesDelta>) {
            self.rules.lock().unwrap().push_back(response);
        }

        fn rule_calls(&self) -> Vec<(i64, Option<i64>)> {
            self.rule_calls.lock().unwrap().clone()
        }

        fn membership_calls(&self) -> usize {
            self.membership_calls.lock().unwrap().len()
        }
    }

    impl Fetcher for FakeFetcher {
        fn fetch_rules_since(&self, since: i64, till: Option<i64>) -> Result<RulesDelta> {
            self.rule_calls.lock().unwrap().push((since, till));
            self.rules
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(delta(since, since, &[])))
        }

        fn fetch_subscriber_segments(&self, key: &str) -> Result<Memberships> {
            self.membership_calls.lock().unwrap().push(key.to_owned());
            Ok(self
                .memberships
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .unwrap_or_default())
        }
    }

    fn rule(name: &str, change_number: i64) -> Rule {
        Rule {
            name: name.to_owned(),
            change_number,
            killed: false,
            default_treatment: "off".to_owned(),
            status: RuleStatus::Active,
            definition: serde_json::Map::new(),
        }
    }

    fn delta(since: i64, till: i64, rules: &[Rule]) -> RulesDelta {
        RulesDelta {
            rules: rules.to_vec(),
            since,
            till,
        }
    }

    fn subscriber_channel(key: &str, suffix: &str) -> String {
        format!(
            "MzM5Njc0ODcyNg==_MTExMzgwNjgx_{}_{suffix}",
            Murmur3Hasher.channel_hash(key)
        )
    }

    fn envelope(channel: &str, data: serde_json::Value) -> serde_json::Value {
        json!({
            "id": "x2dE2TEiJL:0:0",
            "timestamp": 1_584_647_533_288_i64,
            "encoding": "json",
            "channel": channel,
            "data": data.to_string(),
        })
    }

    fn rules_update(change_number: i64) -> serde_json::Value {
        envelope(
            "MzM5Njc0ODcyNg==_MTExMzgwNjgx_splits",
            json!({"type": "SPLIT_UPDATE", "changeNumber": change_number}),
        )
    }

    struct Harness {
        scheduler: Arc<ManualScheduler>,
        fetcher: Arc<FakeFetcher>,
        cache: Arc<InMemoryCache>,
        authenticator: Arc<ScriptedAuthenticator>,
        transport: Arc<FakeTransport>,
        telemetry: Arc<InMemoryTelemetry>,
        events: Arc<Mutex<Vec<SyncEvent>>>,
        sync: SyncOrchestrator,
    }

    impl Harness {
        fn new(streaming_enabled: bool, auth_script: Vec<AuthResult>) -> Harness {
            let _ = env_logger::builder().is_test(true).try_init();
            let scheduler = scheduler();
            let fetcher = Arc::new(FakeFetcher::default());
            let cache = Arc::new(InMemoryCache::new());
            let authenticator = ScriptedAuthenticator::new(auth_script);
            let transport = FakeTransport::new(Arc::clone(&scheduler));
            let telemetry = Arc::new(InMemoryTelemetry::new());
            let events = Arc::new(Mutex::new(Vec::new()));

            let settings = SyncSettings {
                streaming_enabled,
                rules_polling: PollerConfig::new()
                    .with_interval(Duration::from_secs(3_600))
                    .with_jitter(Duration::ZERO),
                segments_polling: PollerConfig::new()
                    .with_interval(Duration::from_secs(1_800))
                    .with_jitter(Duration::ZERO),
                ..SyncSettings::default()
            };
            let listener = {
                let events = Arc::clone(&events);
                move |event: SyncEvent| events.lock().unwrap().push(event)
            };
            let sync = SyncOrchestrator::new(
                settings,
                SyncDependencies {
                    scheduler: scheduler.clone(),
                    cache: cache.clone(),
                    fetcher: fetcher.clone(),
                    authenticator: authenticator.clone(),
                    transport: transport.clone(),
                    telemetry: telemetry.clone() as Arc<dyn TelemetrySink>,
                    listener: Arc::new(listener),
                },
            );

            Harness {
                scheduler,
                fetcher,
                cache,
                authenticator,
                transport,
                telemetry,
                events,
                sync,
            }
        }

        fn settle(&self) {
            self.scheduler.run_pending();
        }

        fn advance(&self, secs: u64) {
            self.scheduler.advance(Duration::from_secs(secs));
        }

        fn start(&self) {
            self.sync.start();
            self.settle();
        }

        /// Start and bring the streaming link up.
        fn start_streaming(&self) {
            self.start();
            self.transport.emit(TransportEvent::Open);
            self.settle();
        }

        fn modes(&self) -> Vec<SyncMode> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|event| match event {
                    SyncEvent::ModeChanged { mode } => Some(*mode),
                    SyncEvent::CacheUpdated { .. } => None,
                })
                .collect()
        }

        fn segments(&self, key: &str) -> Vec<String> {
            self.cache
                .subscriber_segments(SegmentDomain::Segments, key)
                .names
                .into_iter()
                .collect()
        }
    }

    #[test]
    fn polling_only() {
        let harness = Harness::new(false, vec![]);
        harness
            .fetcher
            .script(Ok(delta(-1, 100, &[rule("flag", 100)])));

        harness.start();

        assert_eq!(harness.fetcher.rule_calls(), vec![(-1, None), (100, None)]);
        assert!(harness.sync.wait_for_initial_sync().is_ok());
        assert_eq!(harness.cache.rules_version(), 100);
        assert_eq!(harness.modes(), vec![SyncMode::Polling]);
        assert!(harness.events.lock().unwrap().contains(&SyncEvent::CacheUpdated {
            domain: CacheDomain::Rules,
            key: None
        }));
        assert_eq!(harness.telemetry.latencies(SyncOperation::Rules).len(), 1);
        assert_eq!(harness.sync.connection_state(), None);

        harness.advance(3_600);
        assert_eq!(harness.fetcher.rule_calls().len(), 3);
        assert_eq!(harness.authenticator.attempts(), 0);
    }

    #[test]
    fn streaming_does_not_poll() {
        let harness = Harness::new(true, vec![]);

        harness.start_streaming();

        assert_eq!(harness.modes(), vec![SyncMode::Streaming]);
        assert_eq!(harness.sync.connection_state(), Some(ConnectionState::Open));
        for _ in 0..40 {
            harness.advance(60);
            harness.transport.emit(TransportEvent::KeepAlive);
            harness.settle();
        }
        assert_eq!(harness.fetcher.rule_calls().len(), 1);
    }

    #[test]
    fn push_outage_polls_then_catches_up() {
        let harness = Harness::new(true, vec![]);
        harness.start_streaming();

        harness.transport.emit_error(40142);
        harness.settle();
        assert_eq!(harness.modes(), vec![SyncMode::Streaming, SyncMode::Polling]);

        harness.advance(1);
        harness.transport.emit(TransportEvent::Open);
        harness.settle();

        assert_eq!(
            harness.modes(),
            vec![SyncMode::Streaming, SyncMode::Polling, SyncMode::Streaming]
        );
        assert_eq!(harness.fetcher.rule_calls().len(), 2, "one catch-up sync");
        let mode_updates = harness
            .telemetry
            .streaming_events()
            .into_iter()
            .filter(|event| event.kind == StreamingEventKind::SyncModeUpdate)
            .map(|event| event.value)
            .collect::<Vec<_>>();
        assert_eq!(mode_updates, vec![0, 1, 0]);
    }

    #[test]
    fn auth_rejection_polls_for_the_session() {
        let harness = Harness::new(true, vec![AuthResult::failed(false, Some(401))]);

        harness.start();
        assert_eq!(harness.modes(), vec![SyncMode::Streaming, SyncMode::Polling]);

        harness.advance(3_600);
        harness.advance(3_600);

        assert_eq!(harness.fetcher.rule_calls().len(), 3);
        assert_eq!(harness.authenticator.attempts(), 1);
        assert_eq!(harness.telemetry.auth_rejections(), 1);
    }

    #[test]
    fn stale_rules_notifications_are_ignored() {
        let harness = Harness::new(true, vec![]);
        harness
            .fetcher
            .script(Ok(delta(-1, 100, &[rule("flag", 100)])));
        harness.start_streaming();

        harness.transport.emit_data(rules_update(100));
        harness.transport.emit_data(rules_update(50));
        harness.settle();

        assert_eq!(harness.fetcher.rule_calls().len(), 2);
        assert_eq!(harness.cache.rules_version(), 100);
    }

    #[test]
    fn inline_rule_is_applied_without_fetching() {
        let harness = Harness::new(true, vec![]);
        harness
            .fetcher
            .script(Ok(delta(-1, 100, &[rule("flag", 100)])));
        harness.start_streaming();

        let inline = json!({
            "name": "other",
            "changeNumber": 200,
            "killed": false,
            "defaultTreatment": "off",
            "status": "ACTIVE",
            "conditions": [],
        });
        harness.transport.emit_data(envelope(
            "MzM5Njc0ODcyNg==_MTExMzgwNjgx_splits",
            json!({
                "type": "SPLIT_UPDATE",
                "changeNumber": 200,
                "pcn": 100,
                "c": 0,
                "d": STANDARD.encode(inline.to_string()),
            }),
        ));
        harness.settle();

        assert_eq!(harness.fetcher.rule_calls().len(), 2);
        assert_eq!(harness.cache.rules_version(), 200);
        assert!(harness.cache.rule("other").is_some());
    }

    #[test]
    fn gap_fetches_then_bypasses_cdn() {
        let harness = Harness::new(true, vec![]);
        harness
            .fetcher
            .script(Ok(delta(-1, 100, &[rule("flag", 100)])));
        harness.start_streaming();

        harness
            .fetcher
            .script(Ok(delta(100, 150, &[rule("flag", 150)])));
        harness.fetcher.script(Ok(delta(150, 150, &[])));
        harness
            .fetcher
            .script(Ok(delta(150, 200, &[rule("flag", 200)])));
        harness.transport.emit_data(rules_update(200));
        harness.settle();

        assert_eq!(
            harness.fetcher.rule_calls(),
            vec![
                (-1, None),
                (100, None),
                (100, None),
                (150, None),
                (150, Some(200)),
                (200, Some(200)),
            ]
        );
        assert_eq!(harness.cache.rules_version(), 200);
    }

    #[test]
    fn kill_is_applied_in_place_then_fetched() {
        let harness = Harness::new(true, vec![]);
        harness
            .fetcher
            .script(Ok(delta(-1, 100, &[rule("flag", 100)])));
        harness.start_streaming();

        harness.transport.emit_data(envelope(
            "MzM5Njc0ODcyNg==_MTExMzgwNjgx_splits",
            json!({
                "type": "SPLIT_KILL",
                "changeNumber": 150,
                "splitName": "flag",
                "defaultTreatment": "on",
            }),
        ));
        harness.settle();

        let killed = harness.cache.rule("flag").unwrap();
        assert!(killed.killed);
        assert_eq!(killed.default_treatment, "on");
        assert_eq!(
            harness.fetcher.rule_calls().last().copied(),
            Some((100, Some(150)))
        );
    }

    #[test]
    fn failed_sync_is_retried_with_backoff() {
        let harness = Harness::new(false, vec![]);
        harness.fetcher.script(Err(Error::HttpStatus(503)));
        harness.fetcher.script(Err(Error::HttpStatus(503)));
        harness
            .fetcher
            .script(Ok(delta(-1, 100, &[rule("flag", 100)])));

        harness.start();
        assert_eq!(harness.fetcher.rule_calls().len(), 1);
        harness.advance(1);
        assert_eq!(harness.fetcher.rule_calls().len(), 2);
        harness.advance(2);

        assert_eq!(harness.fetcher.rule_calls().len(), 4);
        assert_eq!(harness.cache.rules_version(), 100);
        assert!(harness.sync.wait_for_initial_sync().is_ok());
    }

    #[test]
    fn exhausted_retries_are_reported() {
        let harness = Harness::new(false, vec![]);
        for _ in 0..4 {
            harness.fetcher.script(Err(Error::HttpStatus(500)));
        }

        harness.start();
        harness.advance(1 + 2 + 4);

        assert_eq!(harness.fetcher.rule_calls().len(), 4);
        assert!(matches!(
            harness.sync.wait_for_initial_sync(),
            Err(Error::HttpStatus(500))
        ));
    }

    #[test]
    fn unauthorized_is_not_retried() {
        let harness = Harness::new(false, vec![]);
        harness.fetcher.script(Err(Error::Unauthorized));

        harness.start();
        harness.advance(60);

        assert_eq!(harness.fetcher.rule_calls().len(), 1);
        assert!(matches!(
            harness.sync.wait_for_initial_sync(),
            Err(Error::Unauthorized)
        ));
    }

    #[test]
    fn legacy_segment_notifications() {
        let harness = Harness::new(true, vec![]);
        harness.fetcher.memberships.lock().unwrap().insert(
            "alice".to_owned(),
            Memberships {
                segments: SubscriberSegments::new(["beta"], Some(10)),
                large_segments: SubscriberSegments::default(),
            },
        );
        harness.sync.add_subscriber("alice");
        harness.start_streaming();
        assert_eq!(harness.fetcher.membership_calls(), 1);
        assert_eq!(harness.segments("alice"), vec!["beta"]);

        let channel = subscriber_channel("alice", "mySegments");
        harness.transport.emit_data(envelope(
            &channel,
            json!({"type": "MY_SEGMENTS_UPDATE", "changeNumber": 15, "includesPayload": false}),
        ));
        harness.settle();
        assert_eq!(harness.fetcher.membership_calls(), 2);

        harness.transport.emit_data(envelope(
            &channel,
            json!({
                "type": "MY_SEGMENTS_UPDATE",
                "changeNumber": 20,
                "includesPayload": true,
                "segmentList": ["gamma", "delta"],
            }),
        ));
        harness.transport.emit_data(envelope(
            &subscriber_channel("bob", "mySegments"),
            json!({"type": "MY_SEGMENTS_UPDATE", "changeNumber": 30, "includesPayload": false}),
        ));
        harness.settle();

        assert_eq!(harness.segments("alice"), vec!["delta", "gamma"]);
        assert_eq!(harness.fetcher.membership_calls(), 2);
        assert!(harness.events.lock().unwrap().contains(&SyncEvent::CacheUpdated {
            domain: CacheDomain::Segments,
            key: Some("alice".to_owned())
        }));
    }

    #[test]
    fn v2_segment_strategies() {
        let harness = Harness::new(true, vec![]);
        harness.sync.add_subscriber("alice");
        harness.start_streaming();
        let channel = subscriber_channel("alice", "mySegments");
        let hash = Murmur3Hasher.key_hash64("alice");
        let update = |change_number: i64, strategy: u8, data: Option<String>| {
            envelope(
                &channel,
                json!({
                    "type": "MY_SEGMENTS_UPDATE_V2",
                    "changeNumber": change_number,
                    "u": strategy,
                    "c": 0,
                    "d": data,
                    "segmentName": "vip",
                }),
            )
        };

        // Key list naming alice: added in place.
        let added = json!({"a": [hash], "r": []}).to_string();
        harness
            .transport
            .emit_data(update(10, 2, Some(STANDARD.encode(added))));
        harness.settle();
        assert_eq!(harness.segments("alice"), vec!["vip"]);

        // Segment removal.
        harness.transport.emit_data(update(20, 3, None));
        harness.settle();
        assert!(harness.segments("alice").is_empty());
        let fetches = harness.fetcher.membership_calls();

        // Bitmap without alice's bit: nothing to do.
        let mut bitmap = vec![0xffu8; 1];
        bitmap[0] &= !(1u8 << (hash % 8));
        harness
            .transport
            .emit_data(update(30, 1, Some(STANDARD.encode(&bitmap))));
        harness.settle();
        assert_eq!(harness.fetcher.membership_calls(), fetches);

        // Bitmap with alice's bit: refetch.
        harness
            .transport
            .emit_data(update(40, 1, Some(STANDARD.encode([1u8 << (hash % 8)]))));
        harness.settle();
        assert_eq!(harness.fetcher.membership_calls(), fetches + 1);

        // Malformed bitmap degrades to a refetch.
        harness
            .transport
            .emit_data(update(50, 1, Some("not base64!".to_owned())));
        harness.settle();
        assert_eq!(harness.fetcher.membership_calls(), fetches + 2);

        // Unbounded always refetches.
        harness.transport.emit_data(update(60, 0, None));
        harness.settle();
        assert_eq!(harness.fetcher.membership_calls(), fetches + 3);
    }

    #[test]
    fn large_segment_refetch_is_spread() {
        let harness = Harness::new(true, vec![]);
        harness.sync.add_subscriber("alice");
        harness.start_streaming();
        let before = harness.fetcher.membership_calls();
        let delay = spread_delay_ms(&Murmur3Hasher, "alice", 7, 60_000);
        assert!(delay > 0);

        harness.transport.emit_data(envelope(
            &subscriber_channel("alice", "myLargeSegments"),
            json!({
                "type": "MY_LARGE_SEGMENTS_UPDATE",
                "changeNumber": 10,
                "largeSegments": ["big"],
                "u": 0,
                "i": 60_000,
                "s": 7,
            }),
        ));
        harness.settle();
        assert_eq!(harness.fetcher.membership_calls(), before);

        harness
            .scheduler
            .advance(Duration::from_millis(delay - 1));
        assert_eq!(harness.fetcher.membership_calls(), before);
        harness.scheduler.advance(Duration::from_millis(1));
        assert_eq!(harness.fetcher.membership_calls(), before + 1);
    }

    #[test]
    fn resume_after_threshold_catches_up() {
        let harness = Harness::new(false, vec![]);
        harness.start();
        assert_eq!(harness.fetcher.rule_calls().len(), 1);

        harness.sync.pause();
        harness.advance(30);
        harness.sync.resume();
        harness.settle();
        assert_eq!(harness.fetcher.rule_calls().len(), 1);

        harness.sync.pause();
        harness.advance(60);
        harness.sync.resume();
        harness.settle();
        assert_eq!(harness.fetcher.rule_calls().len(), 1, "exactly the threshold");

        harness.sync.pause();
        harness.advance(61);
        harness.sync.resume();
        harness.settle();
        assert_eq!(harness.fetcher.rule_calls().len(), 2);
    }

    #[test]
    fn subscribers_come_and_go() {
        let harness = Harness::new(true, vec![]);
        harness.start_streaming();

        assert!(harness.sync.add_subscriber("alice"));
        assert!(!harness.sync.add_subscriber("alice"));
        harness.settle();
        assert_eq!(harness.fetcher.membership_calls(), 1);
        harness.cache.set_subscriber_segments(
            SegmentDomain::Segments,
            "alice",
            SubscriberSegments::new(["beta"], Some(1)),
        );

        assert!(harness.sync.remove_subscriber("alice"));
        assert!(!harness.sync.remove_subscriber("alice"));
        harness.transport.emit_data(envelope(
            &subscriber_channel("alice", "mySegments"),
            json!({"type": "MY_SEGMENTS_UPDATE", "changeNumber": 5, "includesPayload": false}),
        ));
        harness.settle();

        assert_eq!(harness.fetcher.membership_calls(), 1);
        assert!(harness.segments("alice").is_empty());
    }

    #[test]
    fn stop_leaves_nothing_behind() {
        let harness = Harness::new(true, vec![]);
        harness.sync.add_subscriber("alice");
        harness.start_streaming();

        harness.sync.stop();
        harness.settle();

        assert_eq!(harness.sync.connection_state(), Some(ConnectionState::Closed));
        assert_eq!(harness.scheduler.pending_timers(), 0);

        harness.sync.start();
        harness.advance(3_600);
        assert_eq!(harness.fetcher.rule_calls().len(), 1);
        assert_eq!(harness.authenticator.attempts(), 1);
    }

    #[test]
    fn flush_reaches_telemetry() {
        let harness = Harness::new(false, vec![]);

        harness.sync.flush();

        assert_eq!(harness.telemetry.flushes(), 1);
    }
}
