//! Pending-write queue
//!
//! Holds writes that have been accepted but not yet forwarded to a driver.
//! In linear mode every write becomes its own action. In aggregating mode
//! writes with the same signature (operation plus every key's prefix, name,
//! granularity and bucket start) collapse into one action:
//!
//! ```text
//! inc {c:1} ─┐
//! inc {c:1} ─┼─▶ inc {c:3}        additive merge
//! inc {c:1} ─┘
//!
//! set {g:4} ─┐
//! set {g:7} ─┴─▶ set {g:7}        last write wins
//! ```

use crate::error::StorageError;
use crate::key::BucketKey;
use crate::types::{Operation, Values};
use std::collections::HashMap;

/// A write waiting to be flushed
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    /// Driver method to call
    pub operation: Operation,
    /// Buckets the values apply to
    pub keys: Vec<BucketKey>,
    /// Values owned by the queue
    pub values: Values,
}

/// How the queue treats repeated writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Append every write, preserving submission order
    Linear,
    /// Merge writes that share a signature
    Aggregating,
}

/// Result of storing one write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stored {
    /// A new action was added
    Appended,
    /// The write was folded into an existing action
    Merged,
}

/// In-memory container of pending actions
#[derive(Debug)]
pub struct BufferQueue {
    mode: QueueMode,
    actions: Vec<PendingAction>,
    /// Signature → position in `actions` (aggregating mode only)
    index: HashMap<String, usize>,
    /// Writes stored since the last drain, merged or not
    accepted: usize,
}

impl BufferQueue {
    /// Create an empty queue; the mode is fixed for its lifetime
    pub fn new(mode: QueueMode) -> Self {
        Self {
            mode,
            actions: Vec::new(),
            index: HashMap::new(),
            accepted: 0,
        }
    }

    /// Queue mode
    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    /// Accept a write
    ///
    /// `values` is copied, so later changes by the caller never reach queued
    /// data. Non-finite numbers and shape conflicts during an additive merge
    /// are rejected without modifying the queue.
    pub fn store(
        &mut self,
        operation: Operation,
        keys: Vec<BucketKey>,
        values: &Values,
    ) -> Result<Stored, StorageError> {
        values.ensure_finite()?;

        if self.mode == QueueMode::Linear {
            self.push(operation, keys, values);
            self.accepted += 1;
            return Ok(Stored::Appended);
        }

        let signature = signature(operation, &keys);
        let stored = match self.index.get(&signature) {
            Some(&position) => {
                let action = &mut self.actions[position];
                match operation {
                    Operation::Inc => action.values.merge_add(values)?,
                    Operation::Set => action.values = values.clone(),
                }
                Stored::Merged
            },
            None => {
                self.index.insert(signature, self.actions.len());
                self.push(operation, keys, values);
                Stored::Appended
            },
        };
        self.accepted += 1;
        Ok(stored)
    }

    /// Number of pending actions (distinct signatures when aggregating)
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Writes stored since the last drain
    ///
    /// Equals [`len`](Self::len) in linear mode; in aggregating mode it also
    /// counts writes that were merged away.
    pub fn accepted(&self) -> usize {
        self.accepted
    }

    /// Take every pending action, leaving the queue empty
    ///
    /// Linear queues return submission order; aggregating queues return the
    /// order in which each signature was first seen.
    pub fn drain(&mut self) -> Vec<PendingAction> {
        self.index.clear();
        self.accepted = 0;
        std::mem::take(&mut self.actions)
    }

    fn push(&mut self, operation: Operation, keys: Vec<BucketKey>, values: &Values) {
        self.actions.push(PendingAction {
            operation,
            keys,
            values: values.clone(),
        });
    }
}

/// Merge-equality key for aggregating mode
fn signature(operation: Operation, keys: &[BucketKey]) -> String {
    let keys: Vec<String> = keys.iter().map(BucketKey::signature).collect();
    format!("{}|{}", operation, keys.join(";"))
}
