//! Per-key computation record.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

/// Readiness of a record. Moves out of `Pending` exactly once and never goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Ready,
    /// The producer unwound before publishing a result.
    Abandoned,
}

/// What a waiter observes once a record is no longer pending.
#[derive(Debug)]
pub(crate) enum Settled<'r, T> {
    Ready(&'r T),
    Abandoned,
}

/// The eventual result of one computation together with its one-shot readiness signal.
///
/// Exactly one thread (the owner) calls [`Record::publish`] or [`Record::abandon`]. Any number of
/// threads may wait concurrently; they are all released by that single transition.
pub(crate) struct Record<T> {
    /// Written once by the owner, then read without locking.
    result: OnceLock<T>,
    status: Mutex<Status>,
    ready: Condvar,
}

impl<T> Record<T> {
    /// Creates a pending record.
    pub(crate) fn new() -> Self {
        Self {
            result: OnceLock::new(),
            status: Mutex::new(Status::Pending),
            ready: Condvar::new(),
        }
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        // `Status` is a plain enum; a panic while holding the guard can't leave it half-written.
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores the result and wakes every waiter.
    ///
    /// # Panics
    ///
    /// Panics if the record was already published. Only the owner publishes, so this indicates a
    /// broken single-flight protocol.
    pub(crate) fn publish(&self, result: T) -> &T {
        assert!(
            self.result.set(result).is_ok(),
            "a computation record must be published exactly once"
        );

        let mut status = self.status();
        debug_assert_eq!(*status, Status::Pending);
        *status = Status::Ready;
        drop(status);
        self.ready.notify_all();

        // Just set above.
        self.result.get().unwrap_or_else(|| unreachable!())
    }

    /// Marks a still-pending record as abandoned and wakes every waiter.
    ///
    /// Returns `false` if the record had already settled.
    pub(crate) fn abandon(&self) -> bool {
        let mut status = self.status();
        if *status != Status::Pending {
            return false;
        }
        *status = Status::Abandoned;
        drop(status);
        self.ready.notify_all();
        true
    }

    /// Returns the settled state without blocking, or `None` while still pending.
    pub(crate) fn peek(&self) -> Option<Settled<'_, T>> {
        if let Some(result) = self.result.get() {
            return Some(Settled::Ready(result));
        }
        self.settled(*self.status())
    }

    /// Blocks until the record settles.
    pub(crate) fn wait(&self) -> Settled<'_, T> {
        // Fast path: once the cell is set, no locking is needed to read it.
        if let Some(result) = self.result.get() {
            return Settled::Ready(result);
        }

        let status = self
            .ready
            .wait_while(self.status(), |status| *status == Status::Pending)
            .unwrap_or_else(PoisonError::into_inner);
        match self.settled(*status) {
            Some(settled) => settled,
            None => unreachable!("woke up from a pending record"),
        }
    }

    /// Blocks until the record settles or `timeout` elapses. Returns `None` on timeout.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<Settled<'_, T>> {
        if let Some(result) = self.result.get() {
            return Some(Settled::Ready(result));
        }

        let (status, _) = self
            .ready
            .wait_timeout_while(self.status(), timeout, |status| {
                *status == Status::Pending
            })
            .unwrap_or_else(PoisonError::into_inner);
        self.settled(*status)
    }

    fn settled(&self, status: Status) -> Option<Settled<'_, T>> {
        match status {
            Status::Pending => None,
            Status::Abandoned => Some(Settled::Abandoned),
            // `Ready` is only set after the cell is filled.
            Status::Ready => self.result.get().map(Settled::Ready),
        }
    }
}

impl<T> fmt::Debug for Record<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("status", &*self.status())
            .finish_non_exhaustive()
    }
}
