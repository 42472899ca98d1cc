// SPDX-License-Identifier: MPL-2.0

//! The enrollment registry: which address spaces participate in merging and
//! in what order the scanner visits them.
//!
//! Everything here lives under the engine's leaf spin lock, so no operation
//! may block or touch pages while holding it.

use hashbrown::HashMap;

use super::rmap::RmapRef;
use crate::prelude::*;
use crate::vm::AddrSpace;

/// Handle to an [`MmSlot`] in the registry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct SlotRef(u32);

/// Per-enrolled-address-space bookkeeping.
pub(crate) struct MmSlot {
    pub space: Arc<AddrSpace>,
    /// This space's reverse-map items, ascending by address. Only the
    /// scanner grows or shrinks it; teardown just looks at emptiness.
    pub items: Vec<RmapRef>,
}

/// Registry of enrolled address spaces plus the scan cursor's slot.
#[derive(Default)]
pub(crate) struct MmList {
    slots: Vec<Option<MmSlot>>,
    free: Vec<u32>,
    /// Visit order for the scanner.
    order: Vec<SlotRef>,
    /// Lookup by address-space identity.
    index: HashMap<u64, SlotRef>,
    /// Slot the cursor is parked on; `None` between passes.
    cursor: Option<SlotRef>,
}

impl MmList {
    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub(crate) fn get(&self, h: SlotRef) -> &MmSlot {
        self.slots[h.0 as usize].as_ref().expect("stale slot handle")
    }

    pub(crate) fn get_mut(&mut self, h: SlotRef) -> &mut MmSlot {
        self.slots[h.0 as usize].as_mut().expect("stale slot handle")
    }

    pub(crate) fn lookup(&self, space_id: u64) -> Option<SlotRef> {
        self.index.get(&space_id).copied()
    }

    pub(crate) fn cursor(&self) -> Option<SlotRef> {
        self.cursor
    }

    pub(crate) fn set_cursor(&mut self, cursor: Option<SlotRef>) {
        self.cursor = cursor;
    }

    pub(crate) fn first(&self) -> Option<SlotRef> {
        self.order.first().copied()
    }

    /// The slot the scanner visits after `h`, `None` past the end.
    pub(crate) fn next_after(&self, h: SlotRef) -> Option<SlotRef> {
        let at = self.position(h)?;
        self.order.get(at + 1).copied()
    }

    /// Enrolls `space`, placing it immediately after the cursor's slot so a
    /// newly enrolled space is visited late in the ongoing pass and its
    /// pages get time to settle.
    pub(crate) fn enroll(&mut self, space: Arc<AddrSpace>) -> SlotRef {
        let slot = MmSlot {
            space,
            items: Vec::new(),
        };
        let space_id = slot.space.id();
        let h = match self.free.pop() {
            Some(at) => {
                debug_assert!(self.slots[at as usize].is_none());
                self.slots[at as usize] = Some(slot);
                SlotRef(at)
            }
            None => {
                self.slots.push(Some(slot));
                SlotRef((self.slots.len() - 1) as u32)
            }
        };
        self.index.insert(space_id, h);

        let at = self
            .cursor
            .and_then(|c| self.position(c))
            .map_or(self.order.len(), |at| at + 1);
        self.order.insert(at, h);
        h
    }

    /// Moves `h` to just after the cursor's slot, so a draining space is
    /// reaped soon. No-op when `h` is the cursor slot itself.
    pub(crate) fn move_after_cursor(&mut self, h: SlotRef) {
        if self.cursor == Some(h) {
            return;
        }
        let Some(from) = self.position(h) else { return };
        self.order.remove(from);
        let at = self
            .cursor
            .and_then(|c| self.position(c))
            .map_or(self.order.len(), |at| at + 1);
        self.order.insert(at, h);
    }

    /// Delists and frees `h`. The caller must have emptied (or taken over)
    /// its item list and must repoint the cursor if it was parked here.
    pub(crate) fn remove(&mut self, h: SlotRef) {
        let slot = self.slots[h.0 as usize].take().expect("stale slot handle");
        debug_assert!(slot.items.is_empty());
        self.index.remove(&slot.space.id());
        if let Some(at) = self.position(h) {
            self.order.remove(at);
        }
        self.free.push(h.0);
    }

    fn position(&self, h: SlotRef) -> Option<usize> {
        self.order.iter().position(|&o| o == h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> Arc<AddrSpace> {
        AddrSpace::new()
    }

    #[test]
    fn enroll_places_after_cursor() {
        let mut mml = MmList::default();
        let a = mml.enroll(space());
        let b = mml.enroll(space());
        assert_eq!(mml.first(), Some(a));
        assert_eq!(mml.next_after(a), Some(b));

        // Scanner parked on `a`: a newcomer is visited after it but before
        // the pass wraps.
        mml.set_cursor(Some(a));
        let c = mml.enroll(space());
        assert_eq!(mml.next_after(a), Some(c));
        assert_eq!(mml.next_after(c), Some(b));

        // Between passes newcomers go to the end.
        mml.set_cursor(None);
        let d = mml.enroll(space());
        assert_eq!(mml.next_after(b), Some(d));
        assert_eq!(mml.next_after(d), None);
    }

    #[test]
    fn remove_and_reuse() {
        let mut mml = MmList::default();
        let a = mml.enroll(space());
        let b = mml.enroll(space());
        let b_id = mml.get(b).space.id();

        mml.remove(a);
        assert_eq!(mml.first(), Some(b));
        assert_eq!(mml.lookup(b_id), Some(b));

        let c = mml.enroll(space());
        assert_eq!(mml.next_after(b), Some(c));
        assert!(!mml.is_empty());
        mml.remove(b);
        mml.remove(c);
        assert!(mml.is_empty());
    }
}
