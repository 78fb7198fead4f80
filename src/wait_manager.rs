//! Lets test code wait for an operation to reach a status.
//!
//! [`OperationTracker`] keeps the index, the tracked handles and the pending
//! waiters behind one lock so that applying a batch, re-resolving handles
//! and releasing waiters happen as a single step.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::TestError;
use crate::history::{HistoryEvent, OperationEvents};
use crate::model::{Operation, OperationStatus};
use crate::operation_index::IndexedOperations;
use crate::operation_storage::{OperationLookup, OperationStorage, TrackedId, TrackedReceiver};
use crate::types::WaitingOperationStatus;

type WaitResult = Result<Operation, TestError>;

/// Outcome of registering a wait.
#[derive(Debug)]
pub enum WaitTicket {
    /// The target was already reached
    Ready(Operation),
    /// Resolves when a later batch satisfies the target
    Pending(oneshot::Receiver<WaitResult>),
    /// The execution finished without the target being reached
    Failed(TestError),
}

impl WaitTicket {
    /// Resolves to the operation once the target is reached.
    pub async fn wait(self) -> WaitResult {
        match self {
            Self::Ready(operation) => Ok(operation),
            Self::Failed(error) => Err(error),
            Self::Pending(receiver) => receiver.await.map_err(|_| {
                TestError::checkpoint_communication_error("Wait was dropped before it resolved")
            })?,
        }
    }
}

#[derive(Debug)]
struct PendingWait {
    tracked_id: TrackedId,
    target: WaitingOperationStatus,
    sender: oneshot::Sender<WaitResult>,
}

/// Pending waits keyed by tracked handle.
#[derive(Debug, Default)]
pub struct OperationWaitManager {
    waiters: Vec<PendingWait>,
}

impl OperationWaitManager {
    /// Creates an empty wait manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves immediately when `current` already satisfies `target`,
    /// otherwise registers a waiter.
    pub fn wait_for_operation(
        &mut self,
        tracked_id: TrackedId,
        current: Option<&Operation>,
        target: WaitingOperationStatus,
    ) -> WaitTicket {
        if let Some(operation) = current.filter(|op| target.is_satisfied_by(op)) {
            return WaitTicket::Ready(operation.clone());
        }
        self.prune_abandoned();
        let (sender, receiver) = oneshot::channel();
        self.waiters.push(PendingWait {
            tracked_id,
            target,
            sender,
        });
        WaitTicket::Pending(receiver)
    }

    /// Releases every waiter whose tracked operation now satisfies its target.
    ///
    /// Waiters whose ticket was dropped are discarded first.
    pub fn handle_checkpoint_received(&mut self, storage: &OperationStorage) {
        self.prune_abandoned();
        let (ready, pending): (Vec<_>, Vec<_>) =
            self.waiters.drain(..).partition(|waiter| {
                storage
                    .current(waiter.tracked_id)
                    .is_some_and(|entry| waiter.target.is_satisfied_by(&entry.operation))
            });
        self.waiters = pending;

        for waiter in ready {
            if let Some(entry) = storage.current(waiter.tracked_id) {
                let _ = waiter.sender.send(Ok(entry.operation));
            }
        }
    }

    /// Fails every remaining waiter; the execution can no longer progress.
    pub fn complete_execution(&mut self, storage: &OperationStorage) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter
                .sender
                .send(Err(unreached(storage, waiter.tracked_id, waiter.target)));
        }
    }

    /// Number of registered waiters, including any abandoned since the last
    /// batch.
    pub fn pending_count(&self) -> usize {
        self.waiters.len()
    }

    fn prune_abandoned(&mut self) {
        self.waiters.retain(|waiter| !waiter.sender.is_closed());
    }
}

fn unreached(
    storage: &OperationStorage,
    tracked_id: TrackedId,
    target: WaitingOperationStatus,
) -> TestError {
    let label = storage
        .lookup(tracked_id)
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("#{}", tracked_id));
    TestError::execution_completed_early(label, target)
}

/// Index, tracked handles and waiters of one test run.
#[derive(Debug, Default)]
pub struct OperationTracker {
    index: IndexedOperations,
    storage: OperationStorage,
    waits: OperationWaitManager,
    execution_complete: bool,
}

impl OperationTracker {
    /// Creates a tracker with no operations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a checkpoint batch, refreshes tracked handles and releases
    /// satisfied waiters.
    pub fn apply_batch(&mut self, batch: Vec<OperationEvents>) {
        self.index.add_operations(batch);
        self.storage.populate(&self.index);
        self.waits.handle_checkpoint_received(&self.storage);
    }

    /// Marks the execution finished and fails waits that can no longer be met.
    pub fn complete_execution(&mut self) {
        self.execution_complete = true;
        self.waits.complete_execution(&self.storage);
    }

    pub fn is_execution_complete(&self) -> bool {
        self.execution_complete
    }

    /// Registers a tracked handle for `lookup`.
    pub fn track(&mut self, lookup: OperationLookup) -> (TrackedId, TrackedReceiver) {
        self.storage.register(lookup, &self.index)
    }

    /// Registers a wait on a tracked handle.
    ///
    /// Fails immediately when the execution is complete and the target was not
    /// reached.
    pub fn wait_for(&mut self, tracked_id: TrackedId, target: WaitingOperationStatus) -> WaitTicket {
        let current = self.storage.current(tracked_id).map(|entry| entry.operation);
        if self.execution_complete && !current.as_ref().is_some_and(|op| target.is_satisfied_by(op)) {
            return WaitTicket::Failed(unreached(&self.storage, tracked_id, target));
        }
        self.waits.wait_for_operation(tracked_id, current.as_ref(), target)
    }

    pub fn index(&self) -> &IndexedOperations {
        &self.index
    }

    /// Non-EXECUTION operations, optionally limited to one status.
    pub fn get_operations(&self, status: Option<OperationStatus>) -> Vec<OperationEvents> {
        self.storage.get_operations(&self.index, status)
    }

    /// Every event received this run, ordered by event id.
    pub fn history_events(&self) -> Vec<HistoryEvent> {
        self.index.history_events()
    }

    /// Forgets all operations. Tracked handles and pending waits stay
    /// registered and resolve against the data of the next run.
    pub fn reset(&mut self) {
        self.index.clear();
        self.storage.reset();
        self.execution_complete = false;
    }
}

/// Shared handle to an [`OperationTracker`].
pub type SharedTracker = Arc<Mutex<OperationTracker>>;

/// Locks the tracker, recovering from poisoning.
pub fn lock_tracker(tracker: &Mutex<OperationTracker>) -> MutexGuard<'_, OperationTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CallbackDetails, OperationType};

    fn step(id: &str, name: &str, status: OperationStatus) -> OperationEvents {
        OperationEvents::new(
            Operation::new(id, OperationType::Step)
                .with_name(name)
                .with_status(status),
            vec![],
        )
    }

    #[tokio::test]
    async fn test_already_satisfied_resolves_without_waiting() {
        let mut tracker = OperationTracker::new();
        tracker.apply_batch(vec![step("op-1", "a", OperationStatus::Started)]);
        let (id, _) = tracker.track(OperationLookup::by_name("a"));

        let ticket = tracker.wait_for(id, WaitingOperationStatus::Started);
        assert!(matches!(ticket, WaitTicket::Ready(_)));
    }

    #[tokio::test]
    async fn test_waiter_resolved_by_later_batch_exactly_once() {
        let mut tracker = OperationTracker::new();
        let (id, _) = tracker.track(OperationLookup::by_name("a"));

        let ticket = tracker.wait_for(id, WaitingOperationStatus::Completed);
        tracker.apply_batch(vec![step("op-1", "a", OperationStatus::Started)]);
        assert_eq!(tracker.waits.pending_count(), 1);

        tracker.apply_batch(vec![step("op-1", "a", OperationStatus::Succeeded)]);
        assert_eq!(tracker.waits.pending_count(), 0);
        tracker.apply_batch(vec![step("op-1", "a", OperationStatus::Succeeded)]);

        let operation = ticket.wait().await.unwrap();
        assert_eq!(operation.status, OperationStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_dropped_ticket_is_discarded_on_next_batch() {
        let mut tracker = OperationTracker::new();
        let (id, _) = tracker.track(OperationLookup::by_name("a"));

        let abandoned = tracker.wait_for(id, WaitingOperationStatus::Completed);
        let kept = tracker.wait_for(id, WaitingOperationStatus::Completed);
        assert_eq!(tracker.waits.pending_count(), 2);

        drop(abandoned);
        tracker.apply_batch(vec![step("op-1", "a", OperationStatus::Started)]);
        assert_eq!(tracker.waits.pending_count(), 1);

        tracker.apply_batch(vec![step("op-1", "a", OperationStatus::Succeeded)]);
        assert_eq!(tracker.waits.pending_count(), 0);
        assert_eq!(kept.wait().await.unwrap().status, OperationStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_submitted_waits_for_callback_id() {
        let mut tracker = OperationTracker::new();
        let (id, _) = tracker.track(OperationLookup::by_index(0));
        let ticket = tracker.wait_for(id, WaitingOperationStatus::Submitted);

        let mut callback = Operation::new("cb", OperationType::Callback);
        tracker.apply_batch(vec![OperationEvents::new(callback.clone(), vec![])]);
        assert_eq!(tracker.waits.pending_count(), 1);

        callback.callback_details = Some(CallbackDetails {
            callback_id: Some("cb-id".to_string()),
            ..CallbackDetails::default()
        });
        tracker.apply_batch(vec![OperationEvents::new(callback, vec![])]);

        let operation = ticket.wait().await.unwrap();
        assert_eq!(operation.callback_id(), Some("cb-id"));
    }

    #[tokio::test]
    async fn test_completion_fails_pending_waits() {
        let mut tracker = OperationTracker::new();
        let (id, _) = tracker.track(OperationLookup::by_name("never"));
        let ticket = tracker.wait_for(id, WaitingOperationStatus::Started);

        tracker.complete_execution();
        let err = ticket.wait().await.unwrap_err();
        assert!(matches!(err, TestError::ExecutionCompletedEarly(_, _)));

        let late = tracker.wait_for(id, WaitingOperationStatus::Started);
        assert!(matches!(late, WaitTicket::Failed(_)));
    }
}
