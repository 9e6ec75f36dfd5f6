//! Host-facing seams
//!
//! The bridge never calls back into the host except through the idle
//! scheduler it was given and the console output sinks registered at
//! construction. Both are narrow, object-safe interfaces so the host
//! can back them with whatever main loop it runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Callback deferred until the host's main loop is idle
pub type IdleCallback = Box<dyn FnOnce() + Send + 'static>;

/// Output sink for console text (stdout or stderr of an evaluation)
pub type Sink = Arc<dyn Fn(&str) + Send + Sync>;

/// Opaque handle for a scheduled idle callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdleTicket(u64);

impl IdleTicket {
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Host-provided facility for deferring work until the main loop is idle
///
/// The bridge schedules at most one garbage-collection pass at a time
/// through this interface and cancels it on shutdown. Implementations
/// must not invoke the callback synchronously from `schedule`.
pub trait IdleScheduler: Send + Sync {
    /// Queue `callback` to run when the host loop is next idle
    fn schedule(&self, callback: IdleCallback) -> IdleTicket;

    /// Drop a previously scheduled callback; ignores unknown tickets
    fn cancel(&self, ticket: IdleTicket);
}

/// Queue-backed idle scheduler for hosts with a plain loop
///
/// Callbacks accumulate until the host calls [`QueueScheduler::drain`]
/// from its idle point (the console binary drains between read lines).
pub struct QueueScheduler {
    queue: Mutex<VecDeque<(IdleTicket, IdleCallback)>>,
    next_ticket: AtomicU64,
}

impl QueueScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Run all callbacks queued so far
    pub fn drain(&self) {
        loop {
            let entry = {
                let mut queue = match self.queue.lock() {
                    Ok(queue) => queue,
                    Err(poisoned) => poisoned.into_inner(),
                };
                queue.pop_front()
            };
            match entry {
                Some((_, callback)) => callback(),
                None => break,
            }
        }
    }

    /// Number of callbacks currently waiting
    #[must_use]
    pub fn pending(&self) -> usize {
        match self.queue.lock() {
            Ok(queue) => queue.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl Default for QueueScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleScheduler for QueueScheduler {
    fn schedule(&self, callback: IdleCallback) -> IdleTicket {
        let ticket = IdleTicket::new(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let mut queue = match self.queue.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.push_back((ticket, callback));
        ticket
    }

    fn cancel(&self, ticket: IdleTicket) {
        let mut queue = match self.queue.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.retain(|(queued, _)| *queued != ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_queue_scheduler_runs_on_drain_only() {
        let scheduler = QueueScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let count = Arc::clone(&fired);
        scheduler.schedule(Box::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 1);

        scheduler.drain();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_cancel_removes_pending_callback() {
        let scheduler = QueueScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let count = Arc::clone(&fired);
        let ticket = scheduler.schedule(Box::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        }));
        scheduler.cancel(ticket);
        scheduler.drain();

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_unknown_ticket_is_ignored() {
        let scheduler = QueueScheduler::new();
        scheduler.cancel(IdleTicket::new(42));
        assert_eq!(scheduler.pending(), 0);
    }
}
