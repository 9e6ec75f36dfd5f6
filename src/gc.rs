//! Garbage-collection coordination
//!
//! Plugin unload tends to leave reference cycles (callback closures
//! capturing host objects) that one collection pass cannot resolve while
//! host-side reference counts still pin them. Each request therefore
//! collects immediately and schedules exactly one follow-up pass on the
//! host's idle scheduler; bursts of requests coalesce into that single
//! deferred pass.

use std::sync::{Arc, Mutex, MutexGuard};

use mlua::Lua;
use tracing::debug;

use crate::host::{IdleCallback, IdleScheduler, IdleTicket};

pub struct GcCoordinator {
    scheduler: Arc<dyn IdleScheduler>,
    ticket: Mutex<Option<IdleTicket>>,
}

impl GcCoordinator {
    pub fn new(scheduler: Arc<dyn IdleScheduler>) -> Self {
        Self {
            scheduler,
            ticket: Mutex::new(None),
        }
    }

    fn ticket_slot(&self) -> MutexGuard<'_, Option<IdleTicket>> {
        match self.ticket.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Synchronous full collection, immediately and unconditionally
    pub fn collect_now(&self, lua: &Lua) -> mlua::Result<()> {
        lua.gc_collect()
    }

    /// Immediate collection plus one coalesced deferred pass.
    ///
    /// `make_pass` is only invoked when no deferred pass is pending; the
    /// check and the ticket store happen under one lock, so concurrent
    /// requests cannot schedule twice.
    pub fn collect_deferred(
        &self,
        lua: &Lua,
        make_pass: impl FnOnce() -> IdleCallback,
    ) -> mlua::Result<()> {
        lua.gc_collect()?;

        let mut slot = self.ticket_slot();
        if slot.is_none() {
            *slot = Some(self.scheduler.schedule(make_pass()));
            debug!("deferred collection scheduled");
        }
        Ok(())
    }

    /// Body of the deferred pass: release the ticket, then collect, so a
    /// new request arriving during the collection can schedule again
    pub fn deferred_pass(&self, lua: &Lua) -> mlua::Result<()> {
        *self.ticket_slot() = None;
        debug!("deferred collection running");
        lua.gc_collect()
    }

    /// Cancel any pending deferred pass and run one final collection
    pub fn shutdown(&self, lua: &Lua) -> mlua::Result<()> {
        if let Some(ticket) = self.ticket_slot().take() {
            self.scheduler.cancel(ticket);
            debug!("pending deferred collection cancelled");
        }
        lua.gc_collect()
    }

    /// True while a deferred pass is scheduled but has not yet run
    #[must_use]
    pub fn deferred_pending(&self) -> bool {
        self.ticket_slot().is_some()
    }
}
