//! Output value cells
//!
//! An [`OutputCell`] holds a value that becomes known later, once the
//! provider that produces it has run. A cell settles exactly once, either
//! resolved or failed, and hands the outcome to every continuation registered
//! with [`OutputCell::map`] and friends.
//!
//! Continuations registered before settlement run on the settling thread, in
//! registration order, after the slot lock is released. Continuations
//! registered on an already-settled cell are dispatched to the rayon pool
//! instead of running inline.

use crate::error::{CellError, DoubleResolution};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Terminal outcome of a cell.
pub type Outcome<T> = Result<T, CellError>;

type Continuation<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

enum Slot<T> {
    Pending(Vec<Continuation<T>>),
    Settled(Outcome<T>),
}

struct Inner<T> {
    label: String,
    slot: Mutex<Slot<T>>,
    settled: Condvar,
}

/// A write-once value shared between a producer and its consumers.
///
/// Cloning yields another handle to the same cell.
pub struct OutputCell<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for OutputCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for OutputCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.slot.lock() {
            Slot::Pending(_) => "pending",
            Slot::Settled(Ok(_)) => "resolved",
            Slot::Settled(Err(_)) => "failed",
        };
        f.debug_struct("OutputCell")
            .field("label", &self.inner.label)
            .field("state", &state)
            .finish()
    }
}

impl<T> OutputCell<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an unresolved cell.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                slot: Mutex::new(Slot::Pending(Vec::new())),
                settled: Condvar::new(),
            }),
        }
    }

    /// Create a cell that is already resolved.
    pub fn resolved(label: impl Into<String>, value: T) -> Self {
        Self::settled_with(label, Ok(value))
    }

    /// Create a cell that has already failed.
    pub fn failed(label: impl Into<String>, error: CellError) -> Self {
        Self::settled_with(label, Err(error))
    }

    fn settled_with(label: impl Into<String>, outcome: Outcome<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                slot: Mutex::new(Slot::Settled(outcome)),
                settled: Condvar::new(),
            }),
        }
    }

    /// Label used in diagnostics
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Resolve the cell and run pending continuations.
    pub fn resolve(&self, value: T) -> Result<(), DoubleResolution> {
        self.settle(Ok(value))
    }

    /// Fail the cell; every derived cell fails with the same error.
    pub fn fail(&self, error: CellError) -> Result<(), DoubleResolution> {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: Outcome<T>) -> Result<(), DoubleResolution> {
        let continuations = {
            let mut slot = self.inner.slot.lock();
            match &mut *slot {
                Slot::Settled(previous) => {
                    return Err(DoubleResolution {
                        label: self.inner.label.clone(),
                        state: if previous.is_ok() { "resolved" } else { "failed" },
                    });
                }
                Slot::Pending(continuations) => {
                    let continuations = std::mem::take(continuations);
                    *slot = Slot::Settled(outcome.clone());
                    continuations
                }
            }
        };
        self.inner.settled.notify_all();

        log::trace!(
            "Cell '{}' settled ({}), running {} continuation(s)",
            self.inner.label,
            if outcome.is_ok() { "resolved" } else { "failed" },
            continuations.len()
        );
        for continuation in continuations {
            continuation(&outcome);
        }
        Ok(())
    }

    /// Register a raw continuation.
    fn on_settle(&self, continuation: impl FnOnce(&Outcome<T>) + Send + 'static) {
        let mut slot = self.inner.slot.lock();
        match &mut *slot {
            Slot::Pending(continuations) => continuations.push(Box::new(continuation)),
            Slot::Settled(outcome) => {
                let outcome = outcome.clone();
                drop(slot);
                rayon::spawn(move || continuation(&outcome));
            }
        }
    }

    /// Derive a cell by applying a pure transform to the resolved value.
    pub fn map<U, F>(&self, transform: F) -> OutputCell<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        self.try_map(move |value| Ok(transform(value)))
    }

    /// Like [`map`](Self::map), but the transform may fail the derived cell.
    pub fn try_map<U, F>(&self, transform: F) -> OutputCell<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> Result<U, CellError> + Send + 'static,
    {
        let derived = OutputCell::new(format!("{}.map", self.inner.label));
        let target = derived.clone();
        self.on_settle(move |outcome| {
            let result = match outcome {
                Ok(value) => match transform(value) {
                    Ok(mapped) => target.resolve(mapped),
                    Err(error) => target.fail(error),
                },
                Err(error) => target.fail(error.clone()),
            };
            if let Err(e) = result {
                log::error!("{e}");
            }
        });
        derived
    }

    /// Combine cells into one holding every value, in input order.
    ///
    /// Fails with the first failure observed.
    pub fn join(label: impl Into<String>, cells: &[OutputCell<T>]) -> OutputCell<Vec<T>> {
        let label = label.into();
        if cells.is_empty() {
            return OutputCell::resolved(label, Vec::new());
        }

        struct Gather<T> {
            values: Vec<Option<T>>,
            remaining: usize,
            done: bool,
        }

        let joined = OutputCell::new(label);
        let gather = Arc::new(Mutex::new(Gather {
            values: vec![None; cells.len()],
            remaining: cells.len(),
            done: false,
        }));

        for (position, cell) in cells.iter().enumerate() {
            let gather = Arc::clone(&gather);
            let target = joined.clone();
            cell.on_settle(move |outcome| {
                let settled: Option<Outcome<Vec<T>>> = {
                    let mut gather = gather.lock();
                    if gather.done {
                        return;
                    }
                    match outcome {
                        Err(error) => {
                            gather.done = true;
                            Some(Err(error.clone()))
                        }
                        Ok(value) => {
                            gather.values[position] = Some(value.clone());
                            gather.remaining -= 1;
                            if gather.remaining == 0 {
                                gather.done = true;
                                Some(Ok(gather.values.iter_mut().filter_map(Option::take).collect()))
                            } else {
                                None
                            }
                        }
                    }
                };
                let result = match settled {
                    Some(Ok(values)) => target.resolve(values),
                    Some(Err(error)) => target.fail(error),
                    None => Ok(()),
                };
                if let Err(e) = result {
                    log::error!("{e}");
                }
            });
        }
        joined
    }

    /// Current outcome without blocking, `None` while pending.
    pub fn get(&self) -> Option<Outcome<T>> {
        match &*self.inner.slot.lock() {
            Slot::Pending(_) => None,
            Slot::Settled(outcome) => Some(outcome.clone()),
        }
    }

    /// Whether the cell has settled
    pub fn is_settled(&self) -> bool {
        matches!(&*self.inner.slot.lock(), Slot::Settled(_))
    }

    /// Block until the cell settles.
    pub fn wait(&self) -> Outcome<T> {
        let mut slot = self.inner.slot.lock();
        loop {
            if let Slot::Settled(outcome) = &*slot {
                return outcome.clone();
            }
            self.inner.settled.wait(&mut slot);
        }
    }

    /// Block until the cell settles or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.slot.lock();
        loop {
            if let Slot::Settled(outcome) = &*slot {
                return Some(outcome.clone());
            }
            if self
                .inner
                .settled
                .wait_until(&mut slot, deadline)
                .timed_out()
            {
                return match &*slot {
                    Slot::Settled(outcome) => Some(outcome.clone()),
                    Slot::Pending(_) => None,
                };
            }
        }
    }
}
