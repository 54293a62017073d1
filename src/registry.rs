//! Registered interests in event and subevent identifiers.
//!
//! Entries are addressed by opaque ids; handlers close over nothing but
//! their own state, and all access goes through the owning multiplexer.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::num::NonZeroU32;
use core::ops::ControlFlow;

use crate::error::RegisterError;
use crate::event::{EventId, Opcode};

/// Opaque identity of one registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HandlerId(pub(crate) NonZeroU32);

/// A standing event handler. Receives the whole event frame; returning
/// `ControlFlow::Break(())` removes the registration.
pub(crate) type EventHandler = Box<dyn FnMut(&[u8]) -> ControlFlow<()>>;

/// Who a registration belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ownership {
    /// Externally registered; survives until unregistered.
    Standing,
    /// Tied to the pending transaction with this opcode; removed after its
    /// single delivery.
    Owned(Opcode),
}

pub(crate) struct Entry {
    event: EventId,
    ownership: Ownership,
    /// `None` for owned entries (completion routes through the pending
    /// table), and transiently while a standing handler is being invoked.
    handler: Option<EventHandler>,
}

impl Entry {
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }
}

/// The two-namespace mapping from event identifiers to registrations.
///
/// Invariant: at most one entry per identifier. A second asynchronous claim
/// on an identifier is rejected, never silently overwritten.
pub(crate) struct EventRegistry {
    next_id: NonZeroU32,
    entries: BTreeMap<HandlerId, Entry>,
    by_event: BTreeMap<EventId, HandlerId>,
}

impl EventRegistry {
    pub fn new() -> Self {
        EventRegistry {
            next_id: NonZeroU32::MIN,
            entries: BTreeMap::new(),
            by_event: BTreeMap::new(),
        }
    }

    fn insert(&mut self, event: EventId, ownership: Ownership, handler: Option<EventHandler>) -> Result<HandlerId, RegisterError> {
        if self.by_event.contains_key(&event) {
            return Err(RegisterError::Occupied);
        }
        let id = HandlerId(self.next_id);
        self.next_id = self.next_id.checked_add(1).unwrap_or(NonZeroU32::MIN);
        self.entries.insert(
            id,
            Entry {
                event,
                ownership,
                handler,
            },
        );
        self.by_event.insert(event, id);
        Ok(id)
    }

    pub fn register_standing(&mut self, event: EventId, handler: EventHandler) -> Result<HandlerId, RegisterError> {
        self.insert(event, Ownership::Standing, Some(handler))
    }

    pub fn register_owned(&mut self, event: EventId, opcode: Opcode) -> Result<HandlerId, RegisterError> {
        self.insert(event, Ownership::Owned(opcode), None)
    }

    pub fn claimant(&self, event: EventId) -> Option<&Entry> {
        self.by_event.get(&event).and_then(|id| self.entries.get(id))
    }

    pub fn handler_for(&self, event: EventId) -> Option<HandlerId> {
        self.by_event.get(&event).copied()
    }

    pub fn ownership(&self, id: HandlerId) -> Option<Ownership> {
        self.entries.get(&id).map(|e| e.ownership)
    }

    /// Remove from both the id table and the identifier index.
    pub fn remove(&mut self, id: HandlerId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        self.by_event.remove(&entry.event);
        Some(entry)
    }

    /// Take a standing handler out for dispatch, leaving its entry in place.
    pub fn take_handler(&mut self, id: HandlerId) -> Option<EventHandler> {
        self.entries.get_mut(&id).and_then(|e| e.handler.take())
    }

    /// Put a handler back after dispatch, unless the entry was removed in
    /// the meantime.
    pub fn restore_handler(&mut self, id: HandlerId, handler: EventHandler) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.handler = Some(handler);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_event.clear();
    }
}
