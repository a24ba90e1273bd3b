//! Pending upload/download completion waiters.
//!
//! The registry never invokes callbacks itself. Every operation that
//! resolves waiters hands them back as [`ReadyCompletions`], which the
//! session fires after releasing its lock.

use std::collections::BTreeMap;
use std::fmt;
use tidesync_protocol::{ProgressDirection, Status};

/// Callback invoked exactly once when a waiter resolves.
pub type CompletionCallback = Box<dyn FnOnce(CompletionOutcome) + Send + 'static>;

/// How a completion waiter resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The progress target was reached.
    Success,
    /// The waiter will never complete because the session stopped
    /// (logout, close, destruction). Not an error.
    Aborted(Status),
    /// The session failed with the given error.
    Failed(Status),
}

impl CompletionOutcome {
    /// Returns true if the target was reached.
    pub fn is_success(&self) -> bool {
        matches!(self, CompletionOutcome::Success)
    }

    /// Returns true if the waiter was aborted.
    pub fn is_aborted(&self) -> bool {
        matches!(self, CompletionOutcome::Aborted(_))
    }

    /// Returns true if the waiter failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, CompletionOutcome::Failed(_))
    }

    /// Returns the outcome as a status; OK on success.
    pub fn status(&self) -> Status {
        match self {
            CompletionOutcome::Success => Status::ok(),
            CompletionOutcome::Aborted(status) | CompletionOutcome::Failed(status) => {
                status.clone()
            }
        }
    }
}

/// A registered completion callback.
pub struct CompletionWaiter {
    direction: ProgressDirection,
    target: u64,
    sequence: u64,
    callback: CompletionCallback,
}

impl CompletionWaiter {
    /// Creates a waiter that resolves once `direction` progress reaches
    /// `target` bytes.
    pub fn new(
        direction: ProgressDirection,
        target: u64,
        callback: impl FnOnce(CompletionOutcome) + Send + 'static,
    ) -> Self {
        Self {
            direction,
            target,
            sequence: 0,
            callback: Box::new(callback),
        }
    }

    /// Returns the direction.
    pub fn direction(&self) -> ProgressDirection {
        self.direction
    }

    /// Returns the target in bytes.
    pub fn target(&self) -> u64 {
        self.target
    }

    /// Returns the registration sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Consumes the waiter and invokes its callback.
    pub fn fire(self, outcome: CompletionOutcome) {
        (self.callback)(outcome);
    }
}

impl fmt::Debug for CompletionWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionWaiter")
            .field("direction", &self.direction)
            .field("target", &self.target)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Waiters removed from a registry, each paired with its outcome.
#[must_use = "ready completions must be fired"]
#[derive(Debug, Default)]
pub struct ReadyCompletions {
    ready: Vec<(CompletionWaiter, CompletionOutcome)>,
}

impl ReadyCompletions {
    /// Adds a waiter.
    pub fn push(&mut self, waiter: CompletionWaiter, outcome: CompletionOutcome) {
        self.ready.push((waiter, outcome));
    }

    /// Appends another batch, preserving order.
    pub fn extend(&mut self, other: ReadyCompletions) {
        self.ready.extend(other.ready);
    }

    /// Number of waiters in the batch.
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    /// Returns true if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// Iterates over the waiters and outcomes without firing them.
    pub fn iter(&self) -> impl Iterator<Item = (&CompletionWaiter, &CompletionOutcome)> {
        self.ready.iter().map(|(waiter, outcome)| (waiter, outcome))
    }

    /// Fires every waiter in order.
    pub fn fire(self) {
        for (waiter, outcome) in self.ready {
            waiter.fire(outcome);
        }
    }
}

/// Pending waiters for both directions.
///
/// Waiters of one direction are ordered by target, then by registration
/// order, so equal targets resolve first-in first-out.
#[derive(Debug, Default)]
pub struct CompletionRegistry {
    upload: BTreeMap<(u64, u64), CompletionWaiter>,
    download: BTreeMap<(u64, u64), CompletionWaiter>,
    next_sequence: u64,
}

impl CompletionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn waiters_mut(
        &mut self,
        direction: ProgressDirection,
    ) -> &mut BTreeMap<(u64, u64), CompletionWaiter> {
        match direction {
            ProgressDirection::Upload => &mut self.upload,
            ProgressDirection::Download => &mut self.download,
        }
    }

    /// Takes ownership of a waiter until it fires. Returns its sequence
    /// number.
    pub fn register(&mut self, mut waiter: CompletionWaiter) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        waiter.sequence = sequence;
        self.waiters_mut(waiter.direction)
            .insert((waiter.target, sequence), waiter);
        sequence
    }

    /// Removes every waiter of `direction` whose target is at most `value`,
    /// lowest target first.
    pub fn on_progress(&mut self, direction: ProgressDirection, value: u64) -> ReadyCompletions {
        let mut ready = ReadyCompletions::default();
        let waiters = self.waiters_mut(direction);
        while let Some(entry) = waiters.first_entry() {
            if entry.key().0 > value {
                break;
            }
            ready.push(entry.remove(), CompletionOutcome::Success);
        }
        ready
    }

    /// Removes every waiter of one direction, pairing each with `outcome`.
    pub fn flush_direction(
        &mut self,
        direction: ProgressDirection,
        outcome: CompletionOutcome,
    ) -> ReadyCompletions {
        let mut ready = ReadyCompletions::default();
        let waiters = std::mem::take(self.waiters_mut(direction));
        for waiter in waiters.into_values() {
            ready.push(waiter, outcome.clone());
        }
        ready
    }

    /// Removes every waiter, uploads first, pairing each with `outcome`.
    pub fn flush_all(&mut self, outcome: CompletionOutcome) -> ReadyCompletions {
        let mut ready = self.flush_direction(ProgressDirection::Upload, outcome.clone());
        ready.extend(self.flush_direction(ProgressDirection::Download, outcome));
        ready
    }

    /// Number of pending waiters for one direction.
    pub fn pending(&self, direction: ProgressDirection) -> usize {
        match direction {
            ProgressDirection::Upload => self.upload.len(),
            ProgressDirection::Download => self.download.len(),
        }
    }

    /// Total number of pending waiters.
    pub fn len(&self) -> usize {
        self.upload.len() + self.download.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
