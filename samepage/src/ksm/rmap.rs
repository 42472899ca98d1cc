// SPDX-License-Identifier: MPL-2.0

//! Reverse-map items: one record per tracked virtual site, pool-allocated
//! and addressed by handle.

use super::tree::TreeLinks;
use crate::prelude::*;
use crate::vm::AddrSpace;

/// Handle to an [`RmapItem`] in the engine's arena.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct RmapRef(u32);

impl RmapRef {
    pub(crate) const fn from_index(at: usize) -> Self {
        RmapRef(at as u32)
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which structure an item currently participates in.
///
/// The tree links and the sharer-chain links below are meaningful only for
/// the roles that say so; everything else treats them as dead storage.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Role {
    /// In no tree; the last-seen checksum is the only live datum.
    Fresh,
    /// A node of the unstable tree, stamped with the scan generation that
    /// inserted it. A stale stamp means the tree has been reset since and
    /// the links are dead.
    UnstableNode { gen: u8 },
    /// The tree-resident item of a stable node; heads the sharer chain.
    StableNode,
    /// A non-resident sharer hanging off a stable node's chain.
    StableSharer,
}

/// One tracked virtual site.
pub(crate) struct RmapItem {
    pub space: Arc<AddrSpace>,
    pub address: Vaddr,
    /// Checksum seen at the previous scan; valid while `Fresh` or unstable.
    pub oldchecksum: u32,
    pub role: Role,
    /// Balanced-tree node storage; live while the role is a tree node.
    pub links: TreeLinks,
    /// Sharer chain: for a `StableNode` the head of its extra sharers, for
    /// a `StableSharer` the neighbours within the chain.
    pub chain_next: Option<RmapRef>,
    pub chain_prev: Option<RmapRef>,
}

impl RmapItem {
    pub(crate) fn new(space: Arc<AddrSpace>, address: Vaddr) -> Self {
        RmapItem {
            space,
            address,
            oldchecksum: 0,
            role: Role::Fresh,
            links: TreeLinks::default(),
            chain_next: None,
            chain_prev: None,
        }
    }

    pub(crate) fn in_stable_tree(&self) -> bool {
        matches!(self.role, Role::StableNode | Role::StableSharer)
    }
}

/// Free-list arena owning every live [`RmapItem`].
#[derive(Default)]
pub(crate) struct RmapArena {
    slots: Vec<Option<RmapItem>>,
    free: Vec<RmapRef>,
}

impl RmapArena {
    pub(crate) fn alloc(&mut self, item: RmapItem) -> RmapRef {
        match self.free.pop() {
            Some(h) => {
                debug_assert!(self.slots[h.index()].is_none());
                self.slots[h.index()] = Some(item);
                h
            }
            None => {
                self.slots.push(Some(item));
                RmapRef::from_index(self.slots.len() - 1)
            }
        }
    }

    pub(crate) fn free(&mut self, h: RmapRef) {
        let slot = self.slots[h.index()].take();
        debug_assert!(slot.is_some());
        self.free.push(h);
    }

    pub(crate) fn get(&self, h: RmapRef) -> &RmapItem {
        self.slots[h.index()].as_ref().expect("stale rmap handle")
    }

    pub(crate) fn get_mut(&mut self, h: RmapRef) -> &mut RmapItem {
        self.slots[h.index()].as_mut().expect("stale rmap handle")
    }
}

impl super::tree::Nodes for RmapArena {
    fn links(&self, h: RmapRef) -> &TreeLinks {
        &self.get(h).links
    }

    fn links_mut(&mut self, h: RmapRef) -> &mut TreeLinks {
        &mut self.get_mut(h).links
    }
}
