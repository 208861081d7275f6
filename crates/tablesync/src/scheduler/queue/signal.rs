//! Idle detection for the queue dispatcher

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Count of units handed to workers and not yet finished.
///
/// The feeder calls [`add`](Self::add) before handing a unit over, and a
/// worker calls [`done`](Self::done) only after it has queued all child
/// units. A zero count with an empty queue therefore means no more work can
/// appear.
#[derive(Debug, Default)]
pub(crate) struct ActiveWorkSignal {
    active: AtomicUsize,
    notify: Notify,
}

impl ActiveWorkSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn done(&self) {
        let previous = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "done() without matching add()");
        self.notify.notify_waiters();
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.active.load(Ordering::Acquire) == 0
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wake waiters because new work was queued
    pub(crate) fn notify(&self) {
        self.notify.notify_waiters();
    }

    /// Future completing on the next `done` or `notify`.
    ///
    /// Callers must `enable` it before checking their condition so a wakeup
    /// between the check and the await is not lost.
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}
