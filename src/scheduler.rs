//! Clock and timer capability shared by every component that needs to wait.
//!
//! Components never sleep or read the system clock directly. They receive an
//! `Arc<dyn Scheduler>` and use it to read the time, arm cancellable timers, and run blocking work
//! off their control sequence. [`ThreadScheduler`] is the production implementation backed by a
//! single timer thread. [`ManualScheduler`] is a simulated clock for deterministic tests: nothing
//! happens until the test calls [`ManualScheduler::advance`].
use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Clock + timer capability.
pub trait Scheduler: Send + Sync {
    /// Monotonic time, used for elapsed-time decisions.
    fn now(&self) -> Instant;

    /// Wall clock time, used to compare against server-issued timestamps.
    fn wall_clock(&self) -> DateTime<Utc>;

    /// Run `task` once after `delay`, unless the returned handle is cancelled first.
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;

    /// Run blocking `task` outside of any timer or control sequence.
    fn spawn(&self, name: &str, task: Task);
}

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Handle to a scheduled task.
///
/// Cancellation and firing race through a single atomic, so exactly one of them wins.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    state: Arc<AtomicU8>,
}

impl TimerHandle {
    fn new() -> TimerHandle {
        TimerHandle {
            state: Arc::new(AtomicU8::new(PENDING)),
        }
    }

    /// Cancel the task. Returns `true` if the task had not fired yet and now never will.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Returns `true` while the task is still waiting to run.
    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::SeqCst) == PENDING
    }

    fn try_fire(&self) -> bool {
        self.state
            .compare_exchange(PENDING, FIRED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

struct Entry {
    due: Instant,
    seq: u64,
    handle: TimerHandle,
    task: Task,
}

// BinaryHeap is a max-heap, earliest entry must compare as the greatest.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

#[derive(Default)]
struct TimerQueue {
    entries: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<TimerQueue>,
    wakeup: Condvar,
}

/// Production scheduler: timers fire on one dedicated thread, spawned work gets its own thread.
pub struct ThreadScheduler {
    shared: Arc<Shared>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl ThreadScheduler {
    /// Start the timer thread.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the timer thread failed to start.
    pub fn start() -> std::io::Result<ThreadScheduler> {
        let shared = Arc::new(Shared::default());

        let join_handle = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("flagsync-timer".to_owned())
                .spawn(move || run_timer_loop(&shared))?
        };

        Ok(ThreadScheduler {
            shared,
            join_handle: Some(join_handle),
        })
    }
}

fn run_timer_loop(shared: &Shared) {
    let mut queue = shared
        .queue
        .lock()
        .expect("thread holding timer queue lock should not panic");
    loop {
        if queue.shutdown {
            return;
        }

        let now = Instant::now();
        let next_due = queue.entries.peek().map(|entry| entry.due);
        match next_due {
            None => {
                queue = shared
                    .wakeup
                    .wait(queue)
                    .expect("thread holding timer queue lock should not panic");
            }
            Some(due) if due <= now => {
                let Some(entry) = queue.entries.pop() else {
                    continue;
                };
                drop(queue);
                if entry.handle.try_fire() {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry.task));
                    if result.is_err() {
                        log::error!(target: "flagsync", "scheduled task panicked");
                    }
                }
                queue = shared
                    .queue
                    .lock()
                    .expect("thread holding timer queue lock should not panic");
            }
            Some(due) => {
                queue = shared
                    .wakeup
                    .wait_timeout(queue, due - now)
                    .expect("thread holding timer queue lock should not panic")
                    .0;
            }
        }
    }
}

impl Scheduler for ThreadScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        {
            let mut queue = self
                .shared
                .queue
                .lock()
                .expect("thread holding timer queue lock should not panic");
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.entries.push(Entry {
                due: Instant::now() + delay,
                seq,
                handle: handle.clone(),
                task,
            });
        }
        self.shared.wakeup.notify_all();
        handle
    }

    fn spawn(&self, name: &str, task: Task) {
        let result = std::thread::Builder::new()
            .name(format!("flagsync-{name}"))
            .spawn(task);
        if let Err(err) = result {
            log::error!(target: "flagsync", "failed to spawn {name} thread: {:?}", err);
        }
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.shutdown = true;
            queue.entries.clear();
        }
        self.shared.wakeup.notify_all();
        if let Some(join_handle) = self.join_handle.take() {
            // The last reference may be dropped from a scheduled task, joining there would
            // deadlock.
            if join_handle.thread().id() != std::thread::current().id() {
                let _ = join_handle.join();
            }
        }
    }
}

struct SerialState<T> {
    pending: std::collections::VecDeque<T>,
    draining: bool,
    closed: bool,
}

/// Queue with at most one active consumer.
///
/// [`SerialQueue::push`] tells the producer when a consumer must be started; that consumer then
/// calls [`SerialQueue::pop`] until it returns `None`. Items are consumed one at a time in push
/// order, whichever thread the consumer runs on.
pub(crate) struct SerialQueue<T> {
    state: Mutex<SerialState<T>>,
}

impl<T> SerialQueue<T> {
    pub(crate) fn new() -> SerialQueue<T> {
        SerialQueue {
            state: Mutex::new(SerialState {
                pending: std::collections::VecDeque::new(),
                draining: false,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SerialState<T>> {
        self.state
            .lock()
            .expect("thread holding serial queue lock should not panic")
    }

    /// Enqueue `item`. Returns `true` if the caller must start a consumer.
    pub(crate) fn push(&self, item: T) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.pending.push_back(item);
        !std::mem::replace(&mut state.draining, true)
    }

    /// Next item for the active consumer. `None` ends the consumer's turn.
    pub(crate) fn pop(&self) -> Option<T> {
        let mut state = self.lock();
        let next = if state.closed {
            None
        } else {
            state.pending.pop_front()
        };
        if next.is_none() {
            state.draining = false;
        }
        next
    }

    /// Drop pending items and refuse new ones.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.pending.clear();
    }
}

struct ManualEntry {
    due: Duration,
    seq: u64,
    handle: TimerHandle,
    task: Task,
}

struct ManualState {
    elapsed: Duration,
    next_seq: u64,
    entries: Vec<ManualEntry>,
}

/// Simulated clock. Timers and spawned work only run inside [`ManualScheduler::advance`], on the
/// calling thread, in due-time order.
pub struct ManualScheduler {
    origin: Instant,
    wall_origin: DateTime<Utc>,
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    /// Create a simulated clock starting at the current wall time.
    pub fn new() -> ManualScheduler {
        ManualScheduler::with_wall_clock(Utc::now())
    }

    /// Create a simulated clock whose wall time starts at `wall_origin`.
    pub fn with_wall_clock(wall_origin: DateTime<Utc>) -> ManualScheduler {
        ManualScheduler {
            origin: Instant::now(),
            wall_origin,
            state: Mutex::new(ManualState {
                elapsed: Duration::ZERO,
                next_seq: 0,
                entries: Vec::new(),
            }),
        }
    }

    /// Move simulated time forward by `by`, running every task that becomes due.
    pub fn advance(&self, by: Duration) {
        let target = self.elapsed() + by;
        loop {
            let entry = {
                let mut state = self.lock();
                let next = state
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| entry.due <= target)
                    .min_by_key(|(_, entry)| (entry.due, entry.seq))
                    .map(|(index, _)| index);
                let Some(index) = next else {
                    state.elapsed = state.elapsed.max(target);
                    return;
                };
                let entry = state.entries.remove(index);
                state.elapsed = state.elapsed.max(entry.due);
                entry
            };
            if entry.handle.try_fire() {
                (entry.task)();
            }
        }
    }

    /// Run everything that is already due without moving time.
    pub fn run_pending(&self) {
        self.advance(Duration::ZERO);
    }

    /// Simulated time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed
    }

    /// Number of timers that are armed and not cancelled.
    pub fn pending_timers(&self) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|entry| entry.handle.is_pending())
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state
            .lock()
            .expect("thread holding manual scheduler lock should not panic")
    }

    fn push(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let due = state.elapsed + delay;
        state.entries.push(ManualEntry {
            due,
            seq,
            handle: handle.clone(),
            task,
        });
        handle
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        ManualScheduler::new()
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.wall_origin + elapsed
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        self.push(delay, task)
    }

    fn spawn(&self, _name: &str, task: Task) {
        self.push(Duration::ZERO, task);
    }
}
