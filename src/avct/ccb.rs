//! Connection Control Blocks
//!
//! One CCB exists per logical profile connection. CCBs live in a fixed arena;
//! the public [`ConnectionHandle`] is the slot index plus the slot generation,
//! so a handle stops resolving as soon as its CCB is released even if the slot
//! is reused.

use super::{AvctError, ConnectionConfig, ConnectionHandle, ControlFlags, LinkIndex, Role};
use crate::constants::MAX_CONNECTIONS;
use heapless::Vec;

/// Handles of a subset of CCBs, collected before callbacks run
pub(crate) type HandleList = Vec<ConnectionHandle, MAX_CONNECTIONS>;

/// Connection Control Block
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ccb<'a> {
    /// Configuration captured at creation
    pub config: ConnectionConfig<'a>,
    /// Link this connection is bound to
    pub link: Option<LinkIndex>,
    /// Set when removing this connection triggered the channel teardown
    pub closing_initiated_locally: bool,
}

#[derive(Debug)]
struct Slot<'a> {
    generation: u8,
    ccb: Option<Ccb<'a>>,
}

/// Fixed-capacity CCB arena
#[derive(Debug)]
pub(crate) struct CcbStore<'a> {
    slots: [Slot<'a>; MAX_CONNECTIONS],
}

impl<'a> CcbStore<'a> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot {
                generation: 0,
                ccb: None,
            }),
        }
    }

    /// Allocate an unbound CCB
    pub fn allocate(&mut self, config: ConnectionConfig<'a>) -> Result<ConnectionHandle, AvctError> {
        let Some((index, slot)) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.ccb.is_none())
        else {
            warn!("[AVCT] Out of ccbs");
            return Err(AvctError::NoResources);
        };

        slot.ccb = Some(Ccb {
            config,
            link: None,
            closing_initiated_locally: false,
        });
        let handle = ConnectionHandle::new(index, slot.generation);
        debug!("[AVCT] ccb allocated: {:?}", handle);
        Ok(handle)
    }

    /// Release a CCB, returning it if the handle was live
    ///
    /// Releasing an already released handle is a no-op.
    pub fn deallocate(&mut self, handle: ConnectionHandle) -> Option<Ccb<'a>> {
        let slot = self.slot_mut(handle)?;
        let ccb = slot.ccb.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        debug!("[AVCT] ccb released: {:?}", handle);
        Some(ccb)
    }

    /// Look up a live CCB
    pub fn get(&self, handle: ConnectionHandle) -> Result<&Ccb<'a>, AvctError> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.ccb.as_ref())
            .ok_or(AvctError::BadHandle)
    }

    /// Look up a live CCB mutably
    pub fn get_mut(&mut self, handle: ConnectionHandle) -> Result<&mut Ccb<'a>, AvctError> {
        self.slot_mut(handle)
            .and_then(|slot| slot.ccb.as_mut())
            .ok_or(AvctError::BadHandle)
    }

    fn slot_mut(&mut self, handle: ConnectionHandle) -> Option<&mut Slot<'a>> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation())
    }

    fn iter(&self) -> impl Iterator<Item = (ConnectionHandle, &Ccb<'a>)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.ccb
                .as_ref()
                .map(|ccb| (ConnectionHandle::new(index, slot.generation), ccb))
        })
    }

    /// Handles of every live CCB, in slot order
    pub fn handles(&self) -> HandleList {
        self.iter().map(|(handle, _)| handle).collect()
    }

    /// Handles of the CCBs bound to `link`, in slot order
    pub fn bound_to(&self, link: LinkIndex) -> HandleList {
        self.iter()
            .filter(|(_, ccb)| ccb.link == Some(link))
            .map(|(handle, _)| handle)
            .collect()
    }

    /// The CCB bound to `link` for profile `pid`
    pub fn find_by_pid_on_link(&self, link: LinkIndex, pid: u16) -> Option<ConnectionHandle> {
        self.iter()
            .find(|(_, ccb)| ccb.link == Some(link) && ccb.config.pid == pid)
            .map(|(handle, _)| handle)
    }

    /// Whether any CCB is bound to `link`
    pub fn is_link_referenced(&self, link: LinkIndex) -> bool {
        self.iter().any(|(_, ccb)| ccb.link == Some(link))
    }

    /// Whether `handle` is the only CCB bound to `link`
    pub fn is_last_on_link(&self, link: LinkIndex, handle: ConnectionHandle) -> bool {
        self.iter()
            .all(|(other, ccb)| other == handle || ccb.link != Some(link))
    }

    /// Whether a link only hosts connections that yield on a connection race
    ///
    /// A link with nothing bound is not passive.
    pub fn is_link_passive(&self, link: LinkIndex) -> bool {
        let mut bound = self.iter().filter(|(_, ccb)| ccb.link == Some(link)).peekable();
        bound.peek().is_some()
            && bound.all(|(_, ccb)| {
                ccb.config.role == Role::Acceptor
                    || ccb.config.control.contains(ControlFlags::PASSIVE)
            })
    }

    /// Whether any CCB is allocated
    pub fn any_allocated(&self) -> bool {
        self.slots.iter().any(|slot| slot.ccb.is_some())
    }

    /// Release every CCB without notification
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            if slot.ccb.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
    }
}
