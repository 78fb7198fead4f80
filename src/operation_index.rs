//! Addressable view over the operations and events received so far.
//!
//! The index keeps the latest snapshot of every operation together with all
//! events seen for it. EXECUTION operations are stored but excluded from the
//! positional and name lookups.

use std::collections::HashMap;

use crate::history::{HistoryEvent, OperationEvents};
use crate::model::OperationType;

/// Operations indexed by id, arrival position, name occurrence and parent.
///
/// # Examples
///
/// ```
/// use durable_execution_testing::operation_index::IndexedOperations;
/// use durable_execution_testing::{Operation, OperationEvents, OperationType};
///
/// let mut index = IndexedOperations::new();
/// index.add_operations(vec![
///     OperationEvents::new(Operation::new("exec", OperationType::Execution), vec![]),
///     OperationEvents::new(Operation::new("s1", OperationType::Step).with_name("fetch"), vec![]),
///     OperationEvents::new(Operation::new("s2", OperationType::Step).with_name("fetch"), vec![]),
/// ]);
///
/// assert_eq!(index.len(), 2);
/// assert!(index.get_by_id("exec").is_some());
/// assert_eq!(index.get_by_index(0).map(|e| e.operation.id.as_str()), Some("s1"));
/// assert_eq!(
///     index.get_by_name_and_index("fetch", 1).map(|e| e.operation.id.as_str()),
///     Some("s2")
/// );
/// ```
#[derive(Debug, Clone, Default)]
pub struct IndexedOperations {
    entries: HashMap<String, OperationEvents>,
    /// Non-EXECUTION ids in arrival order
    order: Vec<String>,
    by_name: HashMap<String, Vec<String>>,
    children: HashMap<String, Vec<String>>,
    execution_id: Option<String>,
}

impl IndexedOperations {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a batch of operation snapshots and their new events.
    ///
    /// An existing snapshot is replaced by the incoming one; its events are
    /// appended to the events already held.
    pub fn add_operations(&mut self, batch: Vec<OperationEvents>) {
        for OperationEvents { operation, events } in batch {
            if let Some(entry) = self.entries.get_mut(&operation.id) {
                entry.operation = operation;
                entry.events.extend(events);
                continue;
            }

            let id = operation.id.clone();
            if operation.operation_type == OperationType::Execution {
                self.execution_id = Some(id.clone());
            } else {
                self.order.push(id.clone());
                if let Some(name) = &operation.name {
                    self.by_name.entry(name.clone()).or_default().push(id.clone());
                }
                if let Some(parent_id) = &operation.parent_id {
                    self.children
                        .entry(parent_id.clone())
                        .or_default()
                        .push(id.clone());
                }
            }
            self.entries.insert(id, OperationEvents::new(operation, events));
        }
    }

    /// The operation with id `id`, including EXECUTION.
    pub fn get_by_id(&self, id: &str) -> Option<&OperationEvents> {
        self.entries.get(id)
    }

    /// The `index`-th non-EXECUTION operation in arrival order.
    pub fn get_by_index(&self, index: usize) -> Option<&OperationEvents> {
        self.order.get(index).and_then(|id| self.entries.get(id))
    }

    /// The `index`-th (zero-based) operation named `name`.
    pub fn get_by_name_and_index(&self, name: &str, index: usize) -> Option<&OperationEvents> {
        self.by_name
            .get(name)?
            .get(index)
            .and_then(|id| self.entries.get(id))
    }

    /// Direct children of `parent_id`, in arrival order.
    pub fn get_operation_children(&self, parent_id: &str) -> Vec<&OperationEvents> {
        self.children
            .get(parent_id)
            .map(|ids| ids.iter().filter_map(|id| self.entries.get(id)).collect())
            .unwrap_or_default()
    }

    /// The EXECUTION pseudo-operation, once seen.
    pub fn execution(&self) -> Option<&OperationEvents> {
        self.entries.get(self.execution_id.as_deref()?)
    }

    /// Non-EXECUTION operations in arrival order.
    pub fn operations(&self) -> impl Iterator<Item = &OperationEvents> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    /// Every event held, ordered by event id.
    pub fn history_events(&self) -> Vec<HistoryEvent> {
        let mut events: Vec<HistoryEvent> = self
            .entries
            .values()
            .flat_map(|entry| entry.events.iter().cloned())
            .collect();
        events.sort_by_key(|event| event.event_id);
        events
    }

    /// Number of non-EXECUTION operations.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Drops every operation and event.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
