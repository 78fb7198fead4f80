//! Schedulers that decide when a suspended handler may resume.
//!
//! - `QueueScheduler`: time-skipping mode, runs items one at a time in FIFO order
//! - `TimerScheduler`: real-time mode, runs each item when its timestamp is reached
//!
//! Both run an item's checkpoint update to completion before its invocation.
//! A failed update is reported through the item's error handler and the
//! invocation is skipped.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use crate::error::TestError;

/// Type alias for a boxed async function that returns nothing.
pub type BoxedAsyncFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Type alias for an error handler function.
pub type ErrorHandler = Box<dyn FnOnce(TestError) + Send>;

/// Type alias for a checkpoint update function.
pub type CheckpointUpdateFn =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<(), TestError>> + Send>> + Send>;

/// Trait for scheduling handler invocations.
pub trait Scheduler: Send {
    /// Schedules `start_invocation`.
    ///
    /// `timestamp` is the earliest time the invocation may start; the queue
    /// scheduler ignores it. `update_checkpoint`, when given, completes before
    /// `start_invocation` runs; if it fails `on_error` receives the error and
    /// `start_invocation` is dropped.
    fn schedule_function(
        &mut self,
        start_invocation: BoxedAsyncFn,
        on_error: ErrorHandler,
        timestamp: Option<DateTime<Utc>>,
        update_checkpoint: Option<CheckpointUpdateFn>,
    );

    /// True while anything is queued, waiting on a timer or executing.
    fn has_scheduled_function(&self) -> bool;

    /// Cancels every invocation that has not started. The scheduler stays
    /// usable.
    ///
    /// Invocations already running are left to finish, and checkpoint
    /// updates already in flight still report failures through their
    /// `on_error`.
    fn flush_timers(&mut self);
}

/// Runs `update_checkpoint` and reports whether the invocation may proceed.
async fn run_update(update_checkpoint: Option<CheckpointUpdateFn>, on_error: ErrorHandler) -> bool {
    let Some(update_checkpoint) = update_checkpoint else {
        return true;
    };
    match update_checkpoint().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Checkpoint update failed, skipping invocation");
            on_error(e);
            false
        }
    }
}

struct QueuedFunction {
    start_invocation: BoxedAsyncFn,
    /// Resolves to true once the checkpoint update succeeded
    update_outcome: oneshot::Receiver<bool>,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<QueuedFunction>,
    pump: Option<JoinHandle<()>>,
    /// Bumped by every flush; a pump from an older generation finishes its
    /// current item and exits without starting another.
    generation: u64,
}

#[derive(Default)]
struct QueueShared {
    state: Mutex<QueueState>,
    idle: Notify,
}

impl QueueShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }
}

/// Queue-based scheduler for time-skipping mode.
///
/// Items run strictly one after another in submission order, regardless of
/// their timestamps. An item's checkpoint update starts as soon as the item
/// is scheduled, so update failures surface promptly even if the item is
/// flushed before its turn.
///
/// Flushing drops queued items. An invocation that is already running is
/// left to finish.
#[derive(Default)]
pub struct QueueScheduler {
    shared: Arc<QueueShared>,
}

impl QueueScheduler {
    /// Create a new queue scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of queued functions.
    pub fn queue_len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Resolves once the queue is empty and nothing is executing.
    ///
    /// An invocation detached by [`flush_timers`](Scheduler::flush_timers)
    /// no longer counts as executing.
    pub async fn wait_for_completion(&self) {
        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if !self.has_scheduled_function() {
                return;
            }
            idle.await;
        }
    }

    async fn pump(shared: Arc<QueueShared>, generation: u64) {
        loop {
            let next = {
                let mut state = shared.lock();
                if state.generation != generation {
                    return;
                }
                match state.queue.pop_front() {
                    Some(next) => next,
                    None => {
                        state.pump = None;
                        drop(state);
                        shared.idle.notify_waiters();
                        return;
                    }
                }
            };

            let proceed = next.update_outcome.await.unwrap_or(false);
            if proceed && shared.is_current(generation) {
                (next.start_invocation)().await;
            }
        }
    }
}

impl Scheduler for QueueScheduler {
    fn schedule_function(
        &mut self,
        start_invocation: BoxedAsyncFn,
        on_error: ErrorHandler,
        _timestamp: Option<DateTime<Utc>>,
        update_checkpoint: Option<CheckpointUpdateFn>,
    ) {
        let (outcome_tx, update_outcome) = oneshot::channel();
        tokio::spawn(async move {
            let proceed = run_update(update_checkpoint, on_error).await;
            let _ = outcome_tx.send(proceed);
        });

        let mut state = self.shared.lock();
        state.queue.push_back(QueuedFunction {
            start_invocation,
            update_outcome,
        });
        if state.pump.is_none() {
            let generation = state.generation;
            state.pump = Some(tokio::spawn(Self::pump(Arc::clone(&self.shared), generation)));
        }
    }

    fn has_scheduled_function(&self) -> bool {
        let state = self.shared.lock();
        !state.queue.is_empty() || state.pump.is_some()
    }

    fn flush_timers(&mut self) {
        let mut state = self.shared.lock();
        state.queue.clear();
        state.generation += 1;
        // Detached, not aborted: the running invocation completes.
        state.pump = None;
        drop(state);
        self.shared.idle.notify_waiters();
    }
}

const TIMER_WAITING: u8 = 0;
const TIMER_UPDATING: u8 = 1;
const TIMER_INVOKING: u8 = 2;
const TIMER_CANCELLED: u8 = 3;

/// One timer item. The phase moves forward with compare-and-swap so that a
/// flush and a firing timer never both win.
struct ScheduledTimer {
    phase: Arc<AtomicU8>,
    handle: JoinHandle<()>,
}

impl ScheduledTimer {
    fn advance(phase: &AtomicU8, from: u8, to: u8) -> bool {
        phase
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Cancels the item unless its invocation already started.
    ///
    /// A timer that has not fired is aborted. An item whose checkpoint update
    /// is in flight keeps running so the update's error still reaches its
    /// handler, but its invocation is skipped.
    fn cancel(self) {
        if Self::advance(&self.phase, TIMER_WAITING, TIMER_CANCELLED) {
            self.handle.abort();
        } else {
            Self::advance(&self.phase, TIMER_UPDATING, TIMER_CANCELLED);
        }
    }
}

/// Timer-based scheduler for real-time mode.
///
/// Each item sleeps until its timestamp on its own task. Items whose delays
/// overlap may run concurrently.
#[derive(Default)]
pub struct TimerScheduler {
    scheduled_tasks: Vec<ScheduledTimer>,
}

impl TimerScheduler {
    /// Create a new timer scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of timers not yet finished.
    pub fn pending_count(&self) -> usize {
        self.scheduled_tasks
            .iter()
            .filter(|t| !t.handle.is_finished())
            .count()
    }
}

impl Scheduler for TimerScheduler {
    fn schedule_function(
        &mut self,
        start_invocation: BoxedAsyncFn,
        on_error: ErrorHandler,
        timestamp: Option<DateTime<Utc>>,
        update_checkpoint: Option<CheckpointUpdateFn>,
    ) {
        let delay = timestamp
            .and_then(|ts| (ts - Utc::now()).to_std().ok())
            .unwrap_or_default();

        let phase = Arc::new(AtomicU8::new(TIMER_WAITING));
        let task_phase = Arc::clone(&phase);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !ScheduledTimer::advance(&task_phase, TIMER_WAITING, TIMER_UPDATING) {
                return;
            }
            if run_update(update_checkpoint, on_error).await
                && ScheduledTimer::advance(&task_phase, TIMER_UPDATING, TIMER_INVOKING)
            {
                start_invocation().await;
            }
        });

        self.scheduled_tasks.retain(|t| !t.handle.is_finished());
        self.scheduled_tasks.push(ScheduledTimer { phase, handle });
    }

    fn has_scheduled_function(&self) -> bool {
        self.scheduled_tasks.iter().any(|t| !t.handle.is_finished())
    }

    fn flush_timers(&mut self) {
        for timer in self.scheduled_tasks.drain(..) {
            timer.cancel();
        }
    }
}

impl std::fmt::Debug for QueueScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueScheduler")
            .field("queue_len", &self.queue_len())
            .finish()
    }
}

impl std::fmt::Debug for TimerScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerScheduler")
            .field("pending_count", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn push(log: &Log, entry: impl Into<String>) {
        log.lock().unwrap().push(entry.into());
    }

    fn recording_fn(log: Log, name: &'static str, work: Duration) -> BoxedAsyncFn {
        Box::new(move || {
            Box::pin(async move {
                push(&log, format!("{name}:start"));
                tokio::time::sleep(work).await;
                push(&log, format!("{name}:end"));
            })
        })
    }

    fn ignore_errors() -> ErrorHandler {
        Box::new(|_| {})
    }

    fn rejecting_update() -> Option<CheckpointUpdateFn> {
        Some(Box::new(|| {
            Box::pin(async { Err(TestError::checkpoint_communication_error("rejected")) })
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_runs_in_fifo_order_one_at_a_time() {
        let log: Log = Arc::default();
        let mut scheduler = QueueScheduler::new();

        let far_future = Some(Utc::now() + chrono::Duration::hours(1));
        scheduler.schedule_function(
            recording_fn(log.clone(), "f1", Duration::from_millis(30)),
            ignore_errors(),
            far_future,
            None,
        );
        scheduler.schedule_function(
            recording_fn(log.clone(), "f2", Duration::from_millis(10)),
            ignore_errors(),
            None,
            None,
        );
        scheduler.schedule_function(
            recording_fn(log.clone(), "f3", Duration::from_millis(0)),
            ignore_errors(),
            None,
            None,
        );
        assert!(scheduler.has_scheduled_function());

        scheduler.wait_for_completion().await;
        assert!(!scheduler.has_scheduled_function());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["f1:start", "f1:end", "f2:start", "f2:end", "f3:start", "f3:end"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_rejected_update_skips_only_that_item() {
        let log: Log = Arc::default();
        let errors = Arc::new(AtomicUsize::new(0));
        let mut scheduler = QueueScheduler::new();

        scheduler.schedule_function(
            recording_fn(log.clone(), "f1", Duration::ZERO),
            ignore_errors(),
            None,
            None,
        );
        let counter = Arc::clone(&errors);
        scheduler.schedule_function(
            recording_fn(log.clone(), "f2", Duration::ZERO),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            None,
            rejecting_update(),
        );
        scheduler.schedule_function(
            recording_fn(log.clone(), "f3", Duration::ZERO),
            ignore_errors(),
            None,
            None,
        );

        scheduler.wait_for_completion().await;
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["f1:start", "f1:end", "f3:start", "f3:end"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_update_runs_before_invocation() {
        let log: Log = Arc::default();
        let mut scheduler = QueueScheduler::new();

        let update_log = log.clone();
        scheduler.schedule_function(
            recording_fn(log.clone(), "f1", Duration::ZERO),
            ignore_errors(),
            None,
            Some(Box::new(move || {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    push(&update_log, "update");
                    Ok(())
                })
            })),
        );

        scheduler.wait_for_completion().await;
        assert_eq!(*log.lock().unwrap(), vec!["update", "f1:start", "f1:end"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_flush_drops_pending_items_but_reports_update_errors() {
        let log: Log = Arc::default();
        let errors = Arc::new(AtomicUsize::new(0));
        let mut scheduler = QueueScheduler::new();

        scheduler.schedule_function(
            recording_fn(log.clone(), "f1", Duration::from_millis(100)),
            ignore_errors(),
            None,
            None,
        );
        let counter = Arc::clone(&errors);
        scheduler.schedule_function(
            recording_fn(log.clone(), "f2", Duration::ZERO),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            None,
            rejecting_update(),
        );
        scheduler.schedule_function(
            recording_fn(log.clone(), "f3", Duration::ZERO),
            ignore_errors(),
            None,
            None,
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.flush_timers();
        assert!(!scheduler.has_scheduled_function());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(*log.lock().unwrap(), vec!["f1:start", "f1:end"]);

        scheduler.schedule_function(
            recording_fn(log.clone(), "f4", Duration::ZERO),
            ignore_errors(),
            None,
            None,
        );
        scheduler.wait_for_completion().await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["f1:start", "f1:end", "f4:start", "f4:end"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_flush_skips_item_whose_update_is_still_running() {
        let log: Log = Arc::default();
        let mut scheduler = QueueScheduler::new();

        let update_log = log.clone();
        scheduler.schedule_function(
            recording_fn(log.clone(), "f1", Duration::ZERO),
            ignore_errors(),
            None,
            Some(Box::new(move || {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    push(&update_log, "update");
                    Ok(())
                })
            })),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.flush_timers();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*log.lock().unwrap(), vec!["update"]);
        assert!(!scheduler.has_scheduled_function());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_past_timestamp_runs_immediately() {
        let log: Log = Arc::default();
        let mut scheduler = TimerScheduler::new();

        scheduler.schedule_function(
            recording_fn(log.clone(), "late", Duration::ZERO),
            ignore_errors(),
            Some(Utc::now() - chrono::Duration::seconds(10)),
            None,
        );

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(*log.lock().unwrap(), vec!["late:start", "late:end"]);
        assert!(!scheduler.has_scheduled_function());
    }

    #[tokio::test]
    async fn test_timer_waits_for_timestamp() {
        let log: Log = Arc::default();
        let mut scheduler = TimerScheduler::new();

        scheduler.schedule_function(
            recording_fn(log.clone(), "later", Duration::ZERO),
            ignore_errors(),
            Some(Utc::now() + chrono::Duration::milliseconds(200)),
            None,
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(log.lock().unwrap().is_empty());
        assert!(scheduler.has_scheduled_function());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(*log.lock().unwrap(), vec!["later:start", "later:end"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flush_cancels_unfired_timers() {
        let log: Log = Arc::default();
        let mut scheduler = TimerScheduler::new();

        for name in ["a", "b", "c"] {
            scheduler.schedule_function(
                recording_fn(log.clone(), name, Duration::ZERO),
                ignore_errors(),
                Some(Utc::now() + chrono::Duration::seconds(2)),
                None,
            );
        }
        assert_eq!(scheduler.pending_count(), 3);

        scheduler.flush_timers();
        assert!(!scheduler.has_scheduled_function());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_rejected_update_skips_invocation() {
        let log: Log = Arc::default();
        let errors = Arc::new(AtomicUsize::new(0));
        let mut scheduler = TimerScheduler::new();

        let counter = Arc::clone(&errors);
        scheduler.schedule_function(
            recording_fn(log.clone(), "skipped", Duration::ZERO),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            None,
            rejecting_update(),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flush_during_update_still_reports_its_error() {
        let log: Log = Arc::default();
        let errors = Arc::new(AtomicUsize::new(0));
        let mut scheduler = TimerScheduler::new();

        let counter = Arc::clone(&errors);
        scheduler.schedule_function(
            recording_fn(log.clone(), "skipped", Duration::ZERO),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            None,
            Some(Box::new(|| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err(TestError::checkpoint_communication_error("rejected"))
                })
            })),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.flush_timers();
        assert!(!scheduler.has_scheduled_function());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flush_during_update_skips_invocation() {
        let log: Log = Arc::default();
        let mut scheduler = TimerScheduler::new();

        scheduler.schedule_function(
            recording_fn(log.clone(), "skipped", Duration::ZERO),
            ignore_errors(),
            None,
            Some(Box::new(|| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                })
            })),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.flush_timers();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flush_lets_running_invocation_finish() {
        let log: Log = Arc::default();
        let mut scheduler = TimerScheduler::new();

        scheduler.schedule_function(
            recording_fn(log.clone(), "x", Duration::from_millis(100)),
            ignore_errors(),
            None,
            None,
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*log.lock().unwrap(), vec!["x:start"]);
        scheduler.flush_timers();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*log.lock().unwrap(), vec!["x:start", "x:end"]);
    }
}
