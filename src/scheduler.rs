//! Deadline-ordered timer scheduler.
//!
//! Timers live in a `BTreeMap` keyed by `(fire_at, id)`. The id is a strictly
//! increasing registration number, so no two keys compare equal and timers
//! due at the same instant run in registration order. One worker thread (or
//! a caller pumping `run_pending`) pops due entries and runs their callbacks
//! with the queue lock released.
//!
//! Every status transition happens while the queue lock is held; the status
//! atomic only exists so handles can read it without taking the lock.
//!
//! At most one worker thread exists at a time. The queue records which thread
//! owns the loop and `start()` waits for a stopped worker to leave before it
//! spawns the next one.

use anyhow::{bail, Context, Result};
use log::{debug, error, trace, warn};
use std::any::Any;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::timer::CpuTickTimer;

pub type TimerId = u64;

pub const MIN_PERIOD: Duration = Duration::from_millis(1);

// Stand-in deadline for delays too large for `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStatus {
    Pending,
    Running,
    Cancelled,
    Completed,
}

impl TimerStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TimerStatus::Pending,
            1 => TimerStatus::Running,
            2 => TimerStatus::Cancelled,
            _ => TimerStatus::Completed,
        }
    }
}

/// When a timer first fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireAt {
    After(Duration),
    At(Instant),
}

impl From<Duration> for FireAt {
    fn from(delay: Duration) -> Self {
        FireAt::After(delay)
    }
}

impl From<Instant> for FireAt {
    fn from(at: Instant) -> Self {
        FireAt::At(at)
    }
}

impl FireAt {
    fn resolve(self, now: Instant) -> Instant {
        match self {
            FireAt::At(at) => at,
            FireAt::After(delay) => now
                .checked_add(delay)
                .or_else(|| now.checked_add(FAR_FUTURE))
                .unwrap_or(now),
        }
    }
}

/// A callback that returned an error or panicked.
#[derive(Debug, Clone)]
pub struct TimerFailure {
    pub id: TimerId,
    pub message: String,
    pub panicked: bool,
}

type Callback = Box<dyn FnMut() -> Result<()> + Send>;
type FailureSink = Arc<dyn Fn(&TimerFailure) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Schedule {
    /// Key in the ordered set while pending.
    fire_at: Instant,
    /// Grid point the next period is measured from. Equal to `fire_at` unless
    /// the timer overran and was pulled forward.
    phase: Instant,
}

struct TimerState {
    id: TimerId,
    period: Option<Duration>,
    status: AtomicU8,
    cancel_requested: AtomicBool,
    schedule: Mutex<Schedule>,
    callback: Mutex<Callback>,
}

impl TimerState {
    fn status(&self) -> TimerStatus {
        TimerStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: TimerStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    fn schedule(&self) -> MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn key(&self) -> (Instant, TimerId) {
        (self.schedule().fire_at, self.id)
    }
}

struct Queue {
    entries: BTreeMap<(Instant, TimerId), Arc<TimerState>>,
    shutdown: bool,
    /// Thread currently inside `worker_loop`, cleared as it leaves.
    worker: Option<ThreadId>,
}

struct Shared {
    queue: Mutex<Queue>,
    wake: Condvar,
    /// Signalled when a worker thread leaves its loop.
    exited: Condvar,
    next_id: AtomicU64,
    sink: FailureSink,
}

thread_local! {
    static CURRENT_TIMER: Cell<Option<TimerId>> = const { Cell::new(None) };
}

/// Marks a timer as executing on this thread for the lifetime of the scope.
///
/// Entering fails if the timer is not pending, so the same registration can
/// never run twice at once.
struct RunningTimerScope {
    previous: Option<TimerId>,
    _not_send: PhantomData<*const ()>,
}

impl RunningTimerScope {
    fn enter(state: &TimerState) -> Option<Self> {
        state
            .status
            .compare_exchange(
                TimerStatus::Pending as u8,
                TimerStatus::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .ok()?;
        let previous = CURRENT_TIMER.with(|c| c.replace(Some(state.id)));
        Some(RunningTimerScope {
            previous,
            _not_send: PhantomData,
        })
    }
}

impl Drop for RunningTimerScope {
    fn drop(&mut self) {
        CURRENT_TIMER.with(|c| c.set(self.previous));
    }
}

/// A timer removed from the ordered set for execution.
struct DueTimer {
    state: Arc<TimerState>,
    due_at: Instant,
    scope: RunningTimerScope,
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pops the earliest entry if it is due by `now`.
    fn take_due(&self, queue: &mut Queue, now: Instant) -> Option<DueTimer> {
        loop {
            let (&key, _) = queue.entries.iter().next()?;
            if key.0 > now {
                return None;
            }
            let state = queue.entries.remove(&key)?;
            match RunningTimerScope::enter(&state) {
                Some(scope) => {
                    return Some(DueTimer {
                        state,
                        due_at: key.0,
                        scope,
                    })
                }
                None => debug!(
                    "[Timer] #{} dropped from queue in state {:?}",
                    state.id,
                    state.status()
                ),
            }
        }
    }

    fn fire(&self, due: DueTimer) {
        let DueTimer { state, due_at, scope } = due;
        let lateness = Instant::now().saturating_duration_since(due_at);
        trace!("[Timer] #{} firing {:?} after deadline", state.id, lateness);

        let mut cpu = CpuTickTimer::started();
        let outcome = {
            let mut guard = state.callback.lock().unwrap_or_else(|e| e.into_inner());
            let callback: &mut Callback = &mut guard;
            panic::catch_unwind(AssertUnwindSafe(|| callback()))
        };
        cpu.stop();
        trace!("[Timer] #{} callback used {:.3} ms CPU", state.id, cpu.elapsed() * 1e3);

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => (self.sink)(&TimerFailure {
                id: state.id,
                message: format!("{:#}", e),
                panicked: false,
            }),
            Err(payload) => (self.sink)(&TimerFailure {
                id: state.id,
                message: panic_message(payload.as_ref()),
                panicked: true,
            }),
        }

        let mut queue = self.lock_queue();
        drop(scope);
        if state.cancel_requested.load(Ordering::SeqCst) {
            state.set_status(TimerStatus::Cancelled);
            return;
        }
        let Some(period) = state.period else {
            state.set_status(TimerStatus::Completed);
            return;
        };

        let key = {
            let mut sched = state.schedule();
            let (phase, fire_at) = next_deadline(sched.phase, period, Instant::now());
            if fire_at != phase {
                debug!("[Timer] #{} overran its period, firing again now", state.id);
            }
            sched.phase = phase;
            sched.fire_at = fire_at;
            (fire_at, state.id)
        };
        state.set_status(TimerStatus::Pending);
        queue.entries.insert(key, state.clone());
        drop(queue);
        self.wake.notify_one();
    }

    fn cancel(&self, state: &TimerState) -> bool {
        let mut queue = self.lock_queue();
        match state.status() {
            TimerStatus::Pending => {
                state.cancel_requested.store(true, Ordering::SeqCst);
                queue.entries.remove(&state.key());
                state.set_status(TimerStatus::Cancelled);
                drop(queue);
                self.wake.notify_one();
                true
            }
            TimerStatus::Running => {
                // Finishes the in-flight run, then is not rescheduled.
                state.cancel_requested.store(true, Ordering::SeqCst);
                true
            }
            TimerStatus::Cancelled | TimerStatus::Completed => false,
        }
    }
}

/// Next `(phase, fire_at)` for a periodic timer whose last phase was `phase`.
///
/// Normally both are `phase + period`. When that is already behind `now` the
/// timer fires at `now` and the phase moves to the last grid point not after
/// `now`, so missed periods collapse into one run without drifting the grid.
fn next_deadline(phase: Instant, period: Duration, now: Instant) -> (Instant, Instant) {
    let next = match phase.checked_add(period) {
        Some(next) => next,
        None => return (now, now),
    };
    if next >= now {
        return (next, next);
    }
    let behind = now.duration_since(phase).as_nanos();
    let step = period.as_nanos();
    let skip = (behind / step) * step;
    let anchored = u64::try_from(skip)
        .ok()
        .and_then(|nanos| phase.checked_add(Duration::from_nanos(nanos)))
        .unwrap_or(now);
    (anchored, now)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

fn log_failure(failure: &TimerFailure) {
    error!("[Timer] #{} callback failed: {}", failure.id, failure.message);
}

/// Clears the worker slot when the loop ends, panics included.
struct WorkerExit<'a>(&'a Shared);

impl Drop for WorkerExit<'_> {
    fn drop(&mut self) {
        let mut queue = self.0.lock_queue();
        if queue.worker == Some(thread::current().id()) {
            queue.worker = None;
        }
        drop(queue);
        self.0.exited.notify_all();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    debug!("[Timer] worker started");
    let _exit = WorkerExit(&shared);
    let mut queue = shared.lock_queue();
    loop {
        if queue.shutdown {
            break;
        }
        let now = Instant::now();
        if let Some(due) = shared.take_due(&mut queue, now) {
            drop(queue);
            shared.fire(due);
            queue = shared.lock_queue();
            continue;
        }
        let next = queue.entries.keys().next().map(|(at, _)| *at);
        queue = match next {
            Some(at) => {
                let (guard, _) = shared
                    .wake
                    .wait_timeout(queue, at.saturating_duration_since(now))
                    .unwrap_or_else(|e| e.into_inner());
                guard
            }
            None => shared.wake.wait(queue).unwrap_or_else(|e| e.into_inner()),
        };
    }
    debug!("[Timer] worker exiting");
}

/// Handle to one registration. Clones refer to the same timer.
#[derive(Clone)]
pub struct TimerHandle {
    state: Arc<TimerState>,
    shared: Weak<Shared>,
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.state.id)
            .field("status", &self.state.status())
            .field("period", &self.state.period)
            .finish()
    }
}

impl TimerHandle {
    /// Cancels the timer. Returns false if it had already completed or been
    /// cancelled. Never waits for a running callback.
    pub fn cancel(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.cancel(&self.state),
            None => {
                // Scheduler is gone; nothing will run this timer again.
                self.state.cancel_requested.store(true, Ordering::SeqCst);
                let live = matches!(
                    self.state.status(),
                    TimerStatus::Pending | TimerStatus::Running
                );
                if live {
                    self.state.set_status(TimerStatus::Cancelled);
                }
                live
            }
        }
    }

    pub fn id(&self) -> TimerId {
        self.state.id
    }

    pub fn status(&self) -> TimerStatus {
        self.state.status()
    }

    pub fn is_pending(&self) -> bool {
        self.status() == TimerStatus::Pending
    }

    pub fn is_running(&self) -> bool {
        self.status() == TimerStatus::Running
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == TimerStatus::Cancelled
    }

    pub fn period(&self) -> Option<Duration> {
        self.state.period
    }

    /// Instant the timer is queued to fire at, while pending.
    pub fn next_fire(&self) -> Option<Instant> {
        self.is_pending().then(|| self.state.schedule().fire_at)
    }

    /// Deadline grid point of the current period.
    pub fn phase(&self) -> Instant {
        self.state.schedule().phase
    }
}

pub struct TimerScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for TimerScheduler {
    fn default() -> Self {
        TimerScheduler::new()
    }
}

impl TimerScheduler {
    pub fn new() -> Self {
        TimerScheduler::with_failure_sink(log_failure)
    }

    /// Scheduler reporting callback errors and panics to `sink` instead of the log.
    pub fn with_failure_sink<F>(sink: F) -> Self
    where
        F: Fn(&TimerFailure) + Send + Sync + 'static,
    {
        TimerScheduler {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    entries: BTreeMap::new(),
                    shutdown: false,
                    worker: None,
                }),
                wake: Condvar::new(),
                exited: Condvar::new(),
                next_id: AtomicU64::new(1),
                sink: Arc::new(sink),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn schedule<F>(
        &self,
        when: impl Into<FireAt>,
        period: Option<Duration>,
        callback: F,
    ) -> TimerHandle
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let period = period.map(|p| {
            if p < MIN_PERIOD {
                warn!("[Timer] period {:?} too small, clamping to {:?}", p, MIN_PERIOD);
                MIN_PERIOD
            } else {
                p
            }
        });

        let fire_at = when.into().resolve(Instant::now());
        let mut queue = self.shared.lock_queue();
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(TimerState {
            id,
            period,
            status: AtomicU8::new(TimerStatus::Pending as u8),
            cancel_requested: AtomicBool::new(false),
            schedule: Mutex::new(Schedule { fire_at, phase: fire_at }),
            callback: Mutex::new(Box::new(callback)),
        });
        queue.entries.insert((fire_at, id), state.clone());
        drop(queue);
        self.shared.wake.notify_one();

        trace!("[Timer] #{} scheduled, period {:?}", id, period);
        TimerHandle {
            state,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn schedule_once<F>(&self, when: impl Into<FireAt>, callback: F) -> TimerHandle
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        self.schedule(when, None, callback)
    }

    pub fn schedule_periodic<F>(
        &self,
        when: impl Into<FireAt>,
        period: Duration,
        callback: F,
    ) -> TimerHandle
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        self.schedule(when, Some(period), callback)
    }

    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        handle.cancel()
    }

    /// Number of timers waiting in the queue.
    pub fn pending_count(&self) -> usize {
        self.shared.lock_queue().entries.len()
    }

    /// Id of the timer whose callback is executing on this thread, if any.
    pub fn current_timer() -> Option<TimerId> {
        CURRENT_TIMER.with(|c| c.get())
    }

    /// Runs every timer due right now on the calling thread. Periodic timers
    /// rescheduled during this call are left for the next one.
    pub fn run_pending(&self) -> usize {
        let now = Instant::now();
        let mut ran = 0;
        loop {
            let due = {
                let mut queue = self.shared.lock_queue();
                self.shared.take_due(&mut queue, now)
            };
            match due {
                Some(due) => {
                    self.shared.fire(due);
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Spawns the worker thread. No-op if it is already running.
    ///
    /// If a stopped worker is still finishing a callback, waits for it to
    /// leave first. Fails when called from that callback after `stop()`,
    /// since the wait could never end.
    pub fn start(&self) -> Result<()> {
        let mut queue = self.shared.lock_queue();
        loop {
            let worker = queue.worker;
            match worker {
                None => break,
                Some(_) if !queue.shutdown => return Ok(()),
                Some(id) if id == thread::current().id() => {
                    bail!("cannot restart the timer scheduler from its own stopping worker")
                }
                Some(_) => {
                    debug!("[Timer] waiting for the previous worker to exit");
                    queue = self
                        .shared
                        .exited
                        .wait(queue)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
        }

        queue.shutdown = false;
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("timer-scheduler".into())
            .spawn(move || worker_loop(shared))
            .context("failed to spawn timer worker thread")?;
        queue.worker = Some(handle.thread().id());
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        let queue = self.shared.lock_queue();
        queue.worker.is_some() && !queue.shutdown
    }

    /// Stops the worker. Pending timers stay queued. Called from inside a
    /// callback this only signals; the worker exits once the callback returns.
    pub fn stop(&self) {
        let handle = {
            let mut queue = self.shared.lock_queue();
            queue.shutdown = true;
            self.worker.lock().unwrap_or_else(|e| e.into_inner()).take()
        };
        self.shared.wake.notify_all();

        let Some(handle) = handle else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            debug!("[Timer] stop requested from the worker thread");
            return;
        }
        if handle.join().is_err() {
            error!("[Timer] worker thread panicked");
        }
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
