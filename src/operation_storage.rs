//! Tracked operation handles kept in sync with the operation index.
//!
//! Test code registers a lookup (by id, by name and occurrence, or by
//! position) before or after the matching operation exists. Every time the
//! index changes, [`OperationStorage::populate`] re-resolves all lookups and
//! publishes the new snapshot on each handle's watch channel.

use tokio::sync::watch;

use crate::history::OperationEvents;
use crate::model::{OperationStatus, OperationType};
use crate::operation_index::IndexedOperations;

/// How a tracked operation is found in the index.
///
/// When `id` is set it is used exclusively. Otherwise `name` is used with
/// `index` as its occurrence (0 when absent). `index` alone selects by
/// arrival position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationLookup {
    pub id: Option<String>,
    pub name: Option<String>,
    pub index: Option<usize>,
}

impl OperationLookup {
    /// Matches the operation with this id.
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Matches the first operation with this name.
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Matches the `index`-th (zero-based) operation with this name.
    pub fn by_name_and_index(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: Some(name.into()),
            index: Some(index),
            ..Self::default()
        }
    }

    /// Matches the `index`-th operation in arrival order.
    pub fn by_index(index: usize) -> Self {
        Self {
            index: Some(index),
            ..Self::default()
        }
    }

    /// Resolves against `index` using the first applicable strategy.
    pub fn resolve<'a>(&self, index: &'a IndexedOperations) -> Option<&'a OperationEvents> {
        LOOKUP_STRATEGIES
            .iter()
            .find_map(|strategy| strategy(self, index))
            .flatten()
    }
}

impl std::fmt::Display for OperationLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.id, &self.name, self.index) {
            (Some(id), _, _) => write!(f, "id={}", id),
            (None, Some(name), Some(index)) => write!(f, "name={}[{}]", name, index),
            (None, Some(name), None) => write!(f, "name={}", name),
            (None, None, Some(index)) => write!(f, "index={}", index),
            (None, None, None) => write!(f, "<empty lookup>"),
        }
    }
}

/// A lookup strategy. `None` means the strategy does not apply to the
/// lookup; `Some(None)` means it applies but nothing matches yet.
type LookupStrategy =
    for<'a> fn(&OperationLookup, &'a IndexedOperations) -> Option<Option<&'a OperationEvents>>;

/// Strategies in priority order.
const LOOKUP_STRATEGIES: [LookupStrategy; 3] = [lookup_by_id, lookup_by_name, lookup_by_index];

fn lookup_by_id<'a>(
    lookup: &OperationLookup,
    index: &'a IndexedOperations,
) -> Option<Option<&'a OperationEvents>> {
    let id = lookup.id.as_deref()?;
    Some(
        index
            .get_by_id(id)
            .filter(|entry| entry.operation.operation_type != OperationType::Execution),
    )
}

fn lookup_by_name<'a>(
    lookup: &OperationLookup,
    index: &'a IndexedOperations,
) -> Option<Option<&'a OperationEvents>> {
    let name = lookup.name.as_deref()?;
    Some(index.get_by_name_and_index(name, lookup.index.unwrap_or(0)))
}

fn lookup_by_index<'a>(
    lookup: &OperationLookup,
    index: &'a IndexedOperations,
) -> Option<Option<&'a OperationEvents>> {
    lookup.index.map(|position| index.get_by_index(position))
}

/// Position of a tracked handle in [`OperationStorage`].
pub type TrackedId = usize;

/// Receiving side of a tracked handle; `None` until the operation appears.
pub type TrackedReceiver = watch::Receiver<Option<OperationEvents>>;

#[derive(Debug)]
struct TrackedOperation {
    lookup: OperationLookup,
    sender: watch::Sender<Option<OperationEvents>>,
}

/// Registered tracked handles.
#[derive(Debug, Default)]
pub struct OperationStorage {
    tracked: Vec<TrackedOperation>,
}

impl OperationStorage {
    /// Creates storage with no tracked handles.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tracked handle and resolves it immediately.
    pub fn register(
        &mut self,
        lookup: OperationLookup,
        index: &IndexedOperations,
    ) -> (TrackedId, TrackedReceiver) {
        let (sender, receiver) = watch::channel(lookup.resolve(index).cloned());
        self.tracked.push(TrackedOperation { lookup, sender });
        (self.tracked.len() - 1, receiver)
    }

    /// Re-resolves every tracked handle against `index`.
    pub fn populate(&self, index: &IndexedOperations) {
        for tracked in &self.tracked {
            let resolved = tracked.lookup.resolve(index);
            tracked.sender.send_if_modified(|current| {
                if current.as_ref() == resolved {
                    false
                } else {
                    *current = resolved.cloned();
                    true
                }
            });
        }
    }

    /// Current snapshot of a tracked handle.
    pub fn current(&self, id: TrackedId) -> Option<OperationEvents> {
        self.tracked.get(id)?.sender.borrow().clone()
    }

    /// The lookup a tracked handle was registered with.
    pub fn lookup(&self, id: TrackedId) -> Option<&OperationLookup> {
        self.tracked.get(id).map(|tracked| &tracked.lookup)
    }

    /// All known non-EXECUTION operations, optionally limited to one status.
    pub fn get_operations(
        &self,
        index: &IndexedOperations,
        status: Option<OperationStatus>,
    ) -> Vec<OperationEvents> {
        index
            .operations()
            .filter(|entry| status.map_or(true, |status| entry.operation.status == status))
            .cloned()
            .collect()
    }

    /// Number of registered handles, resolved or not.
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Clears every tracked handle back to unresolved. Registrations survive.
    pub fn reset(&self) {
        for tracked in &self.tracked {
            tracked.sender.send_if_modified(|current| current.take().is_some());
        }
    }
}
