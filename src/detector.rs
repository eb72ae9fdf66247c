//! The pitch detector's single note-callback slot and its interception proxy.
//!
//! A detector (the simulator, or any real pitch tracker) owns a `NoteDetector`
//! handle and calls `dispatch` for every reading. The slot holds at most one
//! host callback, installed by the presentation layer, plus at most one
//! interceptor installed through `intercept`. While an interception is live,
//! every event reaches the host callback first and the interceptor second.
//!
//! The slot is private: the only ways to write it are `set_host_callback`
//! (refused while intercepted) and `intercept`, whose `Interception` puts the
//! host callback back in sole charge when deactivated or dropped.

use crate::error::ProxyError;
use crate::types::NoteEvent;
use log::{debug, trace};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type NoteCallback = Box<dyn FnMut(&NoteEvent) + Send>;

#[derive(Default)]
struct Slot {
    host: Option<NoteCallback>,
    interceptor: Option<NoteCallback>,
    dispatched: u64,
}

/// Cloneable handle to a detector's callback slot.
#[derive(Clone, Default)]
pub struct NoteDetector {
    slot: Arc<Mutex<Slot>>,
}

impl NoteDetector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        lock_slot(&self.slot)
    }

    /// Install (or clear) the host callback. Returns the callback it replaced.
    pub fn set_host_callback(
        &self,
        callback: Option<NoteCallback>,
    ) -> Result<Option<NoteCallback>, ProxyError> {
        let mut slot = self.lock();
        if slot.interceptor.is_some() {
            return Err(ProxyError::SlotBusy);
        }
        Ok(std::mem::replace(&mut slot.host, callback))
    }

    /// Deliver one reading. Called from the detector's own thread.
    ///
    /// Callbacks run with the slot locked and must not call back into this
    /// detector; forward the event to a channel instead.
    pub fn dispatch(&self, event: &NoteEvent) {
        let mut slot = self.lock();
        slot.dispatched += 1;
        trace!("dispatch #{}: {}", slot.dispatched, event);
        if let Some(host) = slot.host.as_mut() {
            host(event);
        }
        if let Some(interceptor) = slot.interceptor.as_mut() {
            interceptor(event);
        }
    }

    /// Chain `handler` behind the current host callback.
    pub fn intercept(&self, handler: NoteCallback) -> Result<Interception, ProxyError> {
        let mut slot = self.lock();
        if slot.interceptor.is_some() {
            return Err(ProxyError::AlreadyActive);
        }
        slot.interceptor = Some(handler);
        debug!(
            "Note callback intercepted (host callback {})",
            if slot.host.is_some() { "chained" } else { "absent" }
        );
        Ok(Interception {
            slot: Arc::clone(&self.slot),
            released: false,
        })
    }

    pub fn is_intercepted(&self) -> bool {
        self.lock().interceptor.is_some()
    }

    pub fn has_host_callback(&self) -> bool {
        self.lock().host.is_some()
    }

    /// Total readings delivered since the detector was created.
    pub fn dispatched(&self) -> u64 {
        self.lock().dispatched
    }
}

fn lock_slot(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    // Callbacks only forward events; a panic inside one leaves the slot
    // structurally intact.
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A live interception. Deactivating (or dropping) it removes the interceptor
/// and leaves the host callback exactly as it was before `intercept`.
pub struct Interception {
    slot: Arc<Mutex<Slot>>,
    released: bool,
}

impl Interception {
    pub fn deactivate(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        lock_slot(&self.slot).interceptor = None;
        debug!("Note callback restored");
    }
}

impl Drop for Interception {
    fn drop(&mut self) {
        self.release();
    }
}
