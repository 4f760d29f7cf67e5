//! Streaming connection lifecycle: authenticate, connect, keep alive, recover.
//!
//! All state lives in a single core that only ever runs on one logical control sequence: host
//! calls, timer expirations, authentication results and transport events are all turned into
//! commands and consumed in order from a serial queue. Blocking authentication runs as a
//! separate task and reports back through the same queue, so timers are never starved by a slow
//! network call.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use crate::{
    auth::{AuthResult, Authenticator, SubscriberKeys},
    backoff::{BackoffConfig, BackoffTimer},
    codec::{ErrorCodeRanges, Notification, NotificationCodec, ProtocolError, ProtocolErrorKind},
    events::{EventBus, PushEvent},
    occupancy::{OccupancySignal, OccupancyTracker, PushHealth},
    router::NotificationRouter,
    scheduler::{Scheduler, SerialQueue, TimerHandle},
    telemetry::{StreamingEventKind, SyncOperation, TelemetrySink},
    token::StreamingToken,
    transport::{ReadyState, StreamingTransport, TransportEvent},
};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started, or streaming given up for the session.
    Idle,
    /// Waiting for a streaming token.
    Authenticating,
    /// Token obtained, link not open yet.
    Connecting,
    /// Link open, notifications flowing.
    Open,
    /// Link closed after the background grace period.
    BackgroundDisconnected,
    /// Terminal, reached through [`ConnectionManager::stop`].
    Closed,
}

/// Tunables of the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Delay between authentication retries.
    pub auth_backoff: BackoffConfig,
    /// Delay between reconnections of a failed link.
    pub connection_backoff: BackoffConfig,
    /// Retries after the first failed authentication before giving up for the session.
    pub max_auth_retries: u32,
    /// Silence after which an open link is considered dead.
    pub keep_alive_timeout: Duration,
    /// How long before token expiration to re-authenticate.
    pub token_refresh_margin: Duration,
    /// How long the link survives after the host is backgrounded.
    pub background_disconnect_grace: Duration,
    /// Classification of protocol error codes.
    pub error_code_ranges: ErrorCodeRanges,
}

impl ConnectionSettings {
    /// Default value for [`ConnectionSettings::max_auth_retries`].
    pub const DEFAULT_MAX_AUTH_RETRIES: u32 = 3;
    /// Default value for [`ConnectionSettings::keep_alive_timeout`].
    pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(70);
    /// Default value for [`ConnectionSettings::token_refresh_margin`].
    pub const DEFAULT_TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(600);
    /// Default value for [`ConnectionSettings::background_disconnect_grace`].
    pub const DEFAULT_BACKGROUND_DISCONNECT_GRACE: Duration = Duration::from_secs(60);
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            auth_backoff: BackoffConfig::default(),
            connection_backoff: BackoffConfig::default(),
            max_auth_retries: ConnectionSettings::DEFAULT_MAX_AUTH_RETRIES,
            keep_alive_timeout: ConnectionSettings::DEFAULT_KEEP_ALIVE_TIMEOUT,
            token_refresh_margin: ConnectionSettings::DEFAULT_TOKEN_REFRESH_MARGIN,
            background_disconnect_grace: ConnectionSettings::DEFAULT_BACKGROUND_DISCONNECT_GRACE,
            error_code_ranges: ErrorCodeRanges::default(),
        }
    }
}

/// Everything a [`ConnectionManager`] needs.
pub struct ConnectionManagerConfig {
    /// Tunables.
    pub settings: ConnectionSettings,
    /// Clock and timers.
    pub scheduler: Arc<dyn Scheduler>,
    /// Source of streaming tokens.
    pub authenticator: Arc<dyn Authenticator>,
    /// The streaming link.
    pub transport: Arc<dyn StreamingTransport>,
    /// Subscriber keys to authenticate with.
    pub keys: SubscriberKeys,
    /// Destination of decoded data notifications.
    pub router: Arc<NotificationRouter>,
    /// Receives [`PushEvent`]s. Subscribers must be registered before construction.
    pub events: EventBus<PushEvent>,
    /// Streaming counters.
    pub telemetry: Arc<dyn TelemetrySink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKind {
    KeepAlive,
    TokenRefresh,
    AuthRetry,
    Reconnect,
    ConnectDelay,
}

const FOREGROUND_TIMERS: [TimerKind; 5] = [
    TimerKind::KeepAlive,
    TimerKind::TokenRefresh,
    TimerKind::AuthRetry,
    TimerKind::Reconnect,
    TimerKind::ConnectDelay,
];

enum Command {
    Start,
    Pause,
    Resume,
    Stop,
    AuthCompleted { attempt: u64, result: AuthResult },
    Transport { connection: u64, event: TransportEvent },
    Timer { kind: TimerKind, token: u64 },
}

struct Shared {
    queue: SerialQueue<Command>,
    core: Mutex<ConnectionCore>,
    scheduler: Arc<dyn Scheduler>,
}

impl Shared {
    fn post(self: &Arc<Self>, command: Command) {
        if self.queue.push(command) {
            let this = Arc::clone(self);
            self.scheduler
                .spawn("connection", Box::new(move || this.drain()));
        }
    }

    fn drain(&self) {
        while let Some(command) = self.queue.pop() {
            self.core
                .lock()
                .expect("thread holding connection lock should not panic")
                .handle(command);
        }
    }
}

fn post(shared: &Weak<Shared>, command: Command) {
    if let Some(shared) = shared.upgrade() {
        shared.post(command);
    }
}

struct ConnectionCore {
    settings: ConnectionSettings,
    scheduler: Arc<dyn Scheduler>,
    authenticator: Arc<dyn Authenticator>,
    transport: Arc<dyn StreamingTransport>,
    keys: SubscriberKeys,
    router: Arc<NotificationRouter>,
    events: EventBus<PushEvent>,
    telemetry: Arc<dyn TelemetrySink>,
    codec: NotificationCodec,
    tracker: OccupancyTracker,
    shared: Weak<Shared>,

    state: ConnectionState,
    background: bool,
    /// Streaming was given up for the rest of the session.
    disabled: bool,
    auth_backoff: BackoffTimer,
    connection_backoff: BackoffTimer,
    auth_failures: u32,
    token: Option<StreamingToken>,
    /// Identifies the authentication in flight. Results of older attempts are ignored.
    auth_attempt: u64,
    /// Identifies the current transport connection. Events of older connections are ignored.
    connection_id: u64,
    timer_seq: u64,
    timers: HashMap<TimerKind, (u64, TimerHandle)>,
}

impl ConnectionCore {
    fn handle(&mut self, command: Command) {
        if self.state == ConnectionState::Closed {
            return;
        }
        match command {
            Command::Start => self.start(),
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::Stop => self.stop(),
            Command::AuthCompleted { attempt, result } => {
                if attempt == self.auth_attempt && self.state == ConnectionState::Authenticating {
                    self.handle_auth_result(result);
                }
            }
            Command::Transport { connection, event } => {
                if connection == self.connection_id {
                    self.handle_transport_event(event);
                }
            }
            Command::Timer { kind, token } => {
                let current = matches!(self.timers.get(&kind), Some((armed, _)) if *armed == token);
                if current {
                    self.timers.remove(&kind);
                    self.handle_timer(kind);
                }
            }
        }
    }

    fn start(&mut self) {
        if self.disabled {
            log::debug!(target: "flagsync", "streaming disabled for this session, not starting");
            return;
        }
        if self.state != ConnectionState::Idle {
            return;
        }
        self.background = false;
        self.authenticate();
    }

    fn authenticate(&mut self) {
        for kind in FOREGROUND_TIMERS {
            self.cancel_timer(kind);
        }
        self.state = ConnectionState::Authenticating;
        self.auth_attempt += 1;

        let attempt = self.auth_attempt;
        let keys = self.keys.snapshot();
        let authenticator = Arc::clone(&self.authenticator);
        let scheduler = Arc::clone(&self.scheduler);
        let telemetry = Arc::clone(&self.telemetry);
        let shared = self.shared.clone();
        log::debug!(target: "flagsync", attempt; "authenticating");
        self.scheduler.spawn(
            "auth",
            Box::new(move || {
                let started = scheduler.now();
                let result = authenticator.authenticate(&keys);
                telemetry.record_sync_latency(
                    SyncOperation::Auth,
                    scheduler.now().saturating_duration_since(started),
                );
                post(&shared, Command::AuthCompleted { attempt, result });
            }),
        );
    }

    fn handle_auth_result(&mut self, mut result: AuthResult) {
        if result.success && result.push_enabled {
            if let Some(token) = result.token.take() {
                self.auth_backoff.reset();
                self.auth_failures = 0;
                self.telemetry.record_token_refresh();
                self.telemetry.record_streaming_event(
                    StreamingEventKind::TokenRefresh,
                    token.expires_at.timestamp_millis(),
                    self.scheduler.wall_clock(),
                );
                let delay = token.connection_delay;
                self.token = Some(token);
                if delay.is_zero() {
                    self.connect();
                } else {
                    log::debug!(target: "flagsync", delay_secs = delay.as_secs(); "delaying streaming connection");
                    self.state = ConnectionState::Connecting;
                    self.arm(TimerKind::ConnectDelay, delay);
                }
                return;
            }
        }

        if result.success {
            log::info!(target: "flagsync", "streaming disabled by the server, falling back to polling");
            self.give_up(PushEvent::StreamingDisabled);
            return;
        }

        if !result.is_recoverable() {
            if matches!(result.http_status, Some(400..=499)) {
                self.telemetry.record_auth_rejection();
            }
            log::error!(target: "flagsync", "streaming authentication rejected, falling back to polling");
            self.give_up(PushEvent::NonRetryableError);
            return;
        }

        self.auth_failures += 1;
        if self.auth_failures > self.settings.max_auth_retries {
            log::error!(target: "flagsync", attempts = self.auth_failures; "streaming authentication keeps failing, falling back to polling");
            self.give_up(PushEvent::NonRetryableError);
            return;
        }

        let delay = self.auth_backoff.next();
        log::warn!(target: "flagsync", attempts = self.auth_failures, retry_in_ms = delay.as_millis() as u64; "streaming authentication failed, retrying");
        self.tracker.set_declared(PushHealth::Down);
        self.events.publish(PushEvent::RetryableError);
        self.arm(TimerKind::AuthRetry, delay);
    }

    fn connect(&mut self) {
        let usable = self
            .token
            .as_ref()
            .map_or(false, |token| !token.is_expired(self.scheduler.wall_clock()));
        let Some(token) = self.token.as_ref().filter(|_| usable) else {
            self.authenticate();
            return;
        };

        self.connection_id += 1;
        self.state = ConnectionState::Connecting;
        let connection = self.connection_id;
        let shared = self.shared.clone();
        log::debug!(target: "flagsync", connection, channels = token.channels.len(); "connecting streaming link");
        self.transport.connect(
            token,
            Box::new(move |event| post(&shared, Command::Transport { connection, event })),
        );
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.on_open(),
            TransportEvent::KeepAlive => self.rearm_keep_alive(),
            TransportEvent::Message(message) => {
                self.rearm_keep_alive();
                let notification = self.codec.decode(&message);
                self.handle_notification(notification);
            }
            TransportEvent::Error(error) => self.on_transport_error(error.recoverable),
        }
    }

    fn on_open(&mut self) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        self.state = ConnectionState::Open;
        self.connection_backoff.reset();
        self.telemetry.record_streaming_event(
            StreamingEventKind::ConnectionEstablished,
            0,
            self.scheduler.wall_clock(),
        );

        if !self.background {
            self.arm_foreground_timers();
        }
        log::debug!(target: "flagsync", "streaming link open");
        self.declare(PushHealth::Up);
    }

    fn arm_foreground_timers(&mut self) {
        self.rearm_keep_alive();
        if let Some(token) = &self.token {
            let refresh_in =
                token.refresh_in(self.scheduler.wall_clock(), self.settings.token_refresh_margin);
            self.arm(TimerKind::TokenRefresh, refresh_in);
        }
    }

    fn rearm_keep_alive(&mut self) {
        if self.state == ConnectionState::Open && !self.background {
            self.arm(TimerKind::KeepAlive, self.settings.keep_alive_timeout);
        }
    }

    fn on_transport_error(&mut self, recoverable: bool) {
        self.cancel_timer(TimerKind::KeepAlive);
        self.cancel_timer(TimerKind::TokenRefresh);
        self.telemetry.record_streaming_event(
            StreamingEventKind::ConnectionError,
            i64::from(!recoverable),
            self.scheduler.wall_clock(),
        );

        if !recoverable {
            log::error!(target: "flagsync", "streaming connection failed permanently, falling back to polling");
            self.give_up(PushEvent::NonRetryableError);
            return;
        }

        self.tracker.set_declared(PushHealth::Down);
        self.events.publish(PushEvent::RetryableError);
        if self.background {
            log::debug!(target: "flagsync", "streaming link lost while in background, not reconnecting");
            self.state = ConnectionState::BackgroundDisconnected;
            return;
        }

        let delay = self.connection_backoff.next();
        log::warn!(target: "flagsync", retry_in_ms = delay.as_millis() as u64; "streaming link lost, reconnecting");
        self.state = ConnectionState::Connecting;
        self.arm(TimerKind::Reconnect, delay);
    }

    fn handle_notification(&mut self, notification: Notification) {
        match notification {
            Notification::ProtocolError(error) => self.on_protocol_error(error),
            Notification::Occupancy(occupancy) => {
                let kind = if occupancy
                    .channel
                    .contains(OccupancyTracker::DEFAULT_SECONDARY_CHANNEL)
                {
                    StreamingEventKind::OccupancySecondary
                } else {
                    StreamingEventKind::OccupancyPrimary
                };
                self.telemetry.record_streaming_event(
                    kind,
                    i64::from(occupancy.publishers),
                    self.scheduler.wall_clock(),
                );
                if let Some(signal) = self.tracker.handle_occupancy(&occupancy) {
                    self.apply_signal(signal);
                }
            }
            Notification::Control(control) => {
                self.telemetry.record_streaming_event(
                    StreamingEventKind::StreamingStatus,
                    control.timestamp,
                    self.scheduler.wall_clock(),
                );
                if let Some(signal) = self.tracker.handle_control(&control) {
                    self.apply_signal(signal);
                }
            }
            Notification::Ignored => {}
            data => {
                if self.tracker.is_streaming_active() {
                    self.router.route(data);
                } else {
                    log::debug!(target: "flagsync", "streaming paused, dropping notification");
                }
            }
        }
    }

    fn on_protocol_error(&mut self, error: ProtocolError) {
        self.telemetry.record_streaming_event(
            StreamingEventKind::AblyError,
            i64::from(error.code),
            self.scheduler.wall_clock(),
        );
        match error.kind {
            ProtocolErrorKind::Retryable => {
                log::warn!(target: "flagsync", code = error.code, message = error.message.as_str(); "retryable streaming error, reconnecting");
                self.disconnect_link();
                self.token = None;
                self.tracker.set_declared(PushHealth::Down);
                self.events.publish(PushEvent::RetryableError);
                let delay = self.connection_backoff.next();
                self.state = ConnectionState::Connecting;
                self.arm(TimerKind::Reconnect, delay);
            }
            ProtocolErrorKind::NonRetryable => {
                log::error!(target: "flagsync", code = error.code, message = error.message.as_str(); "fatal streaming error, falling back to polling");
                self.give_up(PushEvent::NonRetryableError);
            }
            ProtocolErrorKind::Ignorable => {
                log::debug!(target: "flagsync", code = error.code, message = error.message.as_str(); "ignoring streaming error");
            }
        }
    }

    fn apply_signal(&mut self, signal: OccupancySignal) {
        match signal {
            OccupancySignal::Up => self.events.publish(PushEvent::SubsystemUp),
            OccupancySignal::Down => self.events.publish(PushEvent::SubsystemDown),
            OccupancySignal::Disabled => {
                log::info!(target: "flagsync", "streaming disabled by control notification");
                self.give_up(PushEvent::StreamingDisabled);
            }
            OccupancySignal::Reset => {
                log::debug!(target: "flagsync", "streaming reset requested");
                self.disconnect_link();
                self.token = None;
                self.declare(PushHealth::Down);
                self.authenticate();
            }
        }
    }

    fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::KeepAlive => {
                log::warn!(target: "flagsync", "no streaming traffic within keep-alive timeout, reconnecting");
                self.disconnect_link();
                self.declare(PushHealth::Down);
                self.authenticate();
            }
            TimerKind::TokenRefresh => {
                log::debug!(target: "flagsync", "streaming token about to expire, re-authenticating");
                self.disconnect_link();
                self.token = None;
                if self.background {
                    self.state = ConnectionState::BackgroundDisconnected;
                } else {
                    self.authenticate();
                }
            }
            TimerKind::AuthRetry => self.authenticate(),
            TimerKind::Reconnect | TimerKind::ConnectDelay => self.connect(),
        }
    }

    fn pause(&mut self) {
        if self.background {
            return;
        }
        self.background = true;
        for kind in FOREGROUND_TIMERS {
            self.cancel_timer(kind);
        }

        match self.state {
            ConnectionState::Open | ConnectionState::Connecting => {
                log::debug!(target: "flagsync", "host backgrounded, scheduling disconnect");
                self.transport
                    .schedule_background_disconnect(self.settings.background_disconnect_grace);
            }
            ConnectionState::Authenticating => {
                // Forget the authentication in flight, resume starts over.
                self.auth_attempt += 1;
                self.state = ConnectionState::BackgroundDisconnected;
            }
            ConnectionState::Idle
            | ConnectionState::BackgroundDisconnected
            | ConnectionState::Closed => {}
        }
    }

    fn resume(&mut self) {
        if !self.background {
            return;
        }
        self.background = false;
        if self.disabled || self.state == ConnectionState::Idle {
            return;
        }

        let cancelled = self.transport.cancel_scheduled_disconnect();
        let ready_state = self.transport.ready_state();
        match (self.state, ready_state) {
            (ConnectionState::Open, ReadyState::Open) if cancelled => {
                log::debug!(target: "flagsync", "streaming link survived background");
                self.arm_foreground_timers();
            }
            (ConnectionState::Connecting, ReadyState::Connecting) if cancelled => {}
            _ => {
                log::debug!(target: "flagsync", "streaming link lost while in background, restarting");
                self.disconnect_link();
                self.authenticate();
            }
        }
    }

    fn stop(&mut self) {
        for kind in FOREGROUND_TIMERS {
            self.cancel_timer(kind);
        }
        self.transport.cancel_scheduled_disconnect();
        self.disconnect_link();
        self.auth_attempt += 1;
        self.token = None;
        self.state = ConnectionState::Closed;
        log::debug!(target: "flagsync", "streaming stopped");
    }

    /// Stop streaming for the rest of the session and tell subscribers why.
    fn give_up(&mut self, event: PushEvent) {
        for kind in FOREGROUND_TIMERS {
            self.cancel_timer(kind);
        }
        self.disconnect_link();
        self.token = None;
        self.disabled = true;
        self.state = ConnectionState::Idle;
        self.tracker.set_declared(PushHealth::Down);
        self.events.publish(event);
    }

    /// Drop the current link. Its late events are ignored from now on.
    fn disconnect_link(&mut self) {
        self.cancel_timer(TimerKind::KeepAlive);
        self.cancel_timer(TimerKind::TokenRefresh);
        self.connection_id += 1;
        self.transport.disconnect();
    }

    fn declare(&mut self, health: PushHealth) {
        if self.tracker.declared() == health {
            return;
        }
        self.tracker.set_declared(health);
        self.events.publish(match health {
            PushHealth::Up => PushEvent::SubsystemUp,
            PushHealth::Down => PushEvent::SubsystemDown,
        });
    }

    fn arm(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel_timer(kind);
        self.timer_seq += 1;
        let token = self.timer_seq;
        let shared = self.shared.clone();
        let handle = self.scheduler.schedule(
            delay,
            Box::new(move || post(&shared, Command::Timer { kind, token })),
        );
        self.timers.insert(kind, (token, handle));
    }

    fn cancel_timer(&mut self, kind: TimerKind) {
        if let Some((_, handle)) = self.timers.remove(&kind) {
            handle.cancel();
        }
    }
}

/// Keeps a streaming connection alive for as long as the host wants it.
///
/// Every method returns immediately; the work happens on the control sequence. Failures are never
/// returned, they are published as [`PushEvent`]s.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create an idle manager. Nothing happens until [`ConnectionManager::start`].
    pub fn new(config: ConnectionManagerConfig) -> ConnectionManager {
        let ConnectionManagerConfig {
            settings,
            scheduler,
            authenticator,
            transport,
            keys,
            router,
            events,
            telemetry,
        } = config;

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| Shared {
            queue: SerialQueue::new(),
            scheduler: Arc::clone(&scheduler),
            core: Mutex::new(ConnectionCore {
                codec: NotificationCodec::new(settings.error_code_ranges.clone()),
                auth_backoff: BackoffTimer::new(settings.auth_backoff),
                connection_backoff: BackoffTimer::new(settings.connection_backoff),
                settings,
                scheduler,
                authenticator,
                transport,
                keys,
                router,
                events,
                telemetry,
                tracker: OccupancyTracker::default(),
                shared: weak.clone(),
                state: ConnectionState::Idle,
                background: false,
                disabled: false,
                auth_failures: 0,
                token: None,
                auth_attempt: 0,
                connection_id: 0,
                timer_seq: 0,
                timers: HashMap::new(),
            }),
        });

        ConnectionManager { shared }
    }

    /// Authenticate and connect. Does nothing if already running or disabled for the session.
    pub fn start(&self) {
        self.shared.post(Command::Start);
    }

    /// The host went to background.
    pub fn pause(&self) {
        self.shared.post(Command::Pause);
    }

    /// The host came back to foreground.
    pub fn resume(&self) {
        self.shared.post(Command::Resume);
    }

    /// Cancel every timer and close the link for good.
    pub fn stop(&self) {
        self.shared.post(Command::Stop);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared
            .core
            .lock()
            .map(|core| core.state)
            .unwrap_or(ConnectionState::Closed)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Ok(mut core) = self.shared.core.lock() {
            core.stop();
        }
        self.shared.queue.close();
    }
}
