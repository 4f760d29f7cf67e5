//! Periodic fallback fetches.
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::scheduler::{Scheduler, TimerHandle};

/// Configuration for a [`Poller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    /// Interval to wait between requests for configuration.
    ///
    /// Defaults to [`PollerConfig::DEFAULT_RULES_INTERVAL`].
    pub interval: Duration,
    /// Jitter applies a randomized duration to wait between requests for configuration. This
    /// helps to avoid multiple server instances synchronizing and producing spiky network load.
    ///
    /// Defaults to [`PollerConfig::DEFAULT_JITTER`].
    pub jitter: Duration,
}

impl PollerConfig {
    /// Default value for [`PollerConfig::interval`] when polling rules.
    pub const DEFAULT_RULES_INTERVAL: Duration = Duration::from_secs(60 * 60);
    /// Default value for [`PollerConfig::interval`] when polling subscriber segments.
    pub const DEFAULT_SEGMENTS_INTERVAL: Duration = Duration::from_secs(30 * 60);
    /// Default value for [`PollerConfig::jitter`].
    pub const DEFAULT_JITTER: Duration = Duration::from_secs(3);

    /// Create a new `PollerConfig` using default configuration.
    pub fn new() -> PollerConfig {
        PollerConfig::default()
    }

    /// Update poll interval with `interval`.
    pub fn with_interval(mut self, interval: Duration) -> PollerConfig {
        self.interval = interval;
        self
    }

    /// Update poll interval jitter with `jitter`.
    pub fn with_jitter(mut self, jitter: Duration) -> PollerConfig {
        self.jitter = jitter;
        self
    }
}

impl Default for PollerConfig {
    fn default() -> PollerConfig {
        PollerConfig {
            interval: PollerConfig::DEFAULT_RULES_INTERVAL,
            jitter: PollerConfig::DEFAULT_JITTER,
        }
    }
}

struct PollerState {
    running: bool,
    /// Bumped on every start and stop so that a tick armed by an earlier run is ignored.
    generation: u64,
    timer: Option<TimerHandle>,
}

struct PollerShared {
    name: &'static str,
    scheduler: Arc<dyn Scheduler>,
    config: PollerConfig,
    task: Box<dyn Fn() + Send + Sync>,
    state: Mutex<PollerState>,
}

impl PollerShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, PollerState> {
        self.state
            .lock()
            .expect("thread holding poller lock should not panic")
    }

    /// Arm the next tick. The caller holds the state lock.
    fn arm(self: &Arc<Self>, state: &mut PollerState) {
        let generation = state.generation;
        let shared = Arc::clone(self);
        let timeout = jitter(self.config.interval, self.config.jitter);
        state.timer = Some(
            self.scheduler
                .schedule(timeout, Box::new(move || shared.tick(generation))),
        );
    }

    fn tick(self: &Arc<Self>, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        let shared = Arc::clone(self);
        self.scheduler.spawn(
            self.name,
            Box::new(move || {
                if !shared.is_current(generation) {
                    return;
                }
                log::debug!(target: "flagsync", poller = shared.name; "polling");
                (shared.task)();

                let mut state = shared.lock();
                if state.running && state.generation == generation {
                    shared.arm(&mut state);
                }
            }),
        );
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.lock();
        state.running && state.generation == generation
    }
}

/// Periodic fallback fetch.
///
/// Runs `task` every `interval` (plus jitter) while started. The first run happens one interval
/// after [`Poller::start`].
pub struct Poller {
    shared: Arc<PollerShared>,
}

impl Poller {
    /// Create a stopped poller running `task` on `scheduler`.
    pub fn new(
        name: &'static str,
        scheduler: Arc<dyn Scheduler>,
        config: PollerConfig,
        task: impl Fn() + Send + Sync + 'static,
    ) -> Poller {
        Poller {
            shared: Arc::new(PollerShared {
                name,
                scheduler,
                config,
                task: Box::new(task),
                state: Mutex::new(PollerState {
                    running: false,
                    generation: 0,
                    timer: None,
                }),
            }),
        }
    }

    /// Start polling. Returns `false` if the poller was already running.
    pub fn start(&self) -> bool {
        let mut state = self.shared.lock();
        if state.running {
            return false;
        }
        state.running = true;
        state.generation += 1;
        self.shared.arm(&mut state);
        log::debug!(target: "flagsync", poller = self.shared.name; "poller started");
        true
    }

    /// Stop polling. A run already in progress completes but is not rescheduled.
    pub fn stop(&self) {
        let mut state = self.shared.lock();
        if !state.running {
            return;
        }
        state.running = false;
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
        log::debug!(target: "flagsync", poller = self.shared.name; "poller stopped");
    }

    /// `true` between [`Poller::start`] and [`Poller::stop`].
    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Apply a random jitter to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    interval + thread_rng().gen_range(Duration::ZERO..jitter)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::{jitter, Poller, PollerConfig};
    use crate::scheduler::ManualScheduler;

    fn counting_poller(scheduler: &Arc<ManualScheduler>) -> (Poller, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let poller = {
            let runs = Arc::clone(&runs);
            Poller::new(
                "test-poller",
                scheduler.clone(),
                PollerConfig::new()
                    .with_interval(Duration::from_secs(10))
                    .with_jitter(Duration::ZERO),
                move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                },
            )
        };
        (poller, runs)
    }

    #[test]
    fn runs_every_interval() {
        let scheduler = Arc::new(ManualScheduler::new());
        let (poller, runs) = counting_poller(&scheduler);

        assert!(poller.start());
        assert!(!poller.start());
        scheduler.advance(Duration::from_secs(9));
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        scheduler.advance(Duration::from_secs(1));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        scheduler.advance(Duration::from_secs(30));
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn stop_leaves_nothing_armed() {
        let scheduler = Arc::new(ManualScheduler::new());
        let (poller, runs) = counting_poller(&scheduler);

        poller.start();
        scheduler.advance(Duration::from_secs(10));
        poller.stop();
        scheduler.advance(Duration::from_secs(100));

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!poller.is_running());
        assert_eq!(scheduler.pending_timers(), 0);
    }

    #[test]
    fn restart_does_not_double_schedule() {
        let scheduler = Arc::new(ManualScheduler::new());
        let (poller, runs) = counting_poller(&scheduler);

        poller.start();
        scheduler.advance(Duration::from_secs(5));
        poller.stop();
        poller.start();
        scheduler.advance(Duration::from_secs(10));

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn jitter_stays_in_range() {
        let interval = Duration::from_secs(60);
        for _ in 0..100 {
            let timeout = jitter(interval, Duration::from_secs(3));
            assert!(timeout >= interval && timeout < interval + Duration::from_secs(3));
        }
        assert_eq!(jitter(interval, Duration::ZERO), interval);
    }
}
