// SPDX-License-Identifier: MPL-2.0

//! The background scan: cursor advancement over enrolled spaces, the twin
//! tree operations, and the classify-then-merge step for each candidate.

use core::cmp::Ordering;
use core::sync::atomic::Ordering::Relaxed;

use super::compare::{calc_checksum, memcmp_pages};
use super::merge::{break_cow, try_to_merge_with_shared_page};
use super::rmap::{RmapArena, RmapItem, RmapRef, Role};
use super::slots::SlotRef;
use super::tree::{self, Nodes, Side};
use super::Ksm;
use crate::prelude::*;
use crate::vm::{find_region, AddrSpace, Frame, RegionFlags, PAGE_SIZE};

/// All scanner-owned mutable state, guarded by the engine mutex.
#[derive(Default)]
pub(crate) struct ScanState {
    pub(crate) rmap: RmapArena,
    pub(crate) stable_root: Option<RmapRef>,
    pub(crate) unstable_root: Option<RmapRef>,
    /// Next address to examine within the cursor slot.
    pub(crate) address: Vaddr,
    /// Position within the cursor slot's item list.
    pub(crate) list_pos: usize,
    /// Completed full scans.
    pub(crate) seqnr: u64,
}

/// Fetches the page an item's site currently maps, provided the site is
/// still inside an opted-in region of a live space.
fn get_mergeable_page(item: &RmapItem) -> Option<Frame> {
    let space = &item.space;
    let regions = space.lock_maps();
    if space.is_exiting() {
        return None;
    }
    let region = find_region(&regions, item.address)?;
    if region.start > item.address || !region.flags.contains(RegionFlags::MERGEABLE) {
        return None;
    }
    space.follow_page(item.address)
}

/// Like [`get_mergeable_page`], but insists the site still maps a shared
/// canonical page whose contents can be trusted.
fn get_shared_page(item: &RmapItem) -> Option<Frame> {
    get_mergeable_page(item).filter(|page| page.is_merged())
}

impl Ksm {
    /// Scans up to `budget` candidate pages. One call is one batch; the
    /// engine mutex is held throughout.
    pub fn scan(&self, budget: usize) {
        let mut st = self.state.lock();
        self.do_scan(&mut st, budget);
    }

    fn do_scan(&self, st: &mut ScanState, budget: usize) {
        for _ in 0..budget {
            self.host.yield_now();
            let Some((h, page)) = self.next_scan_candidate(st) else { return };
            let (in_stable, space, address) = {
                let item = st.rmap.get(h);
                (item.in_stable_tree(), item.space.clone(), item.address)
            };
            if !page.is_merged() || !in_stable {
                self.cmp_and_merge_page(st, &page, h);
            } else if page.map_count() == 1 {
                // The canonical page lost every other sharer: hand the site
                // a private page again and restart it as a candidate.
                break_cow(&space, address);
                self.remove_rmap_item_from_tree(st, h);
                st.rmap.get_mut(h).oldchecksum = calc_checksum(&page);
            }
        }
    }

    /// Role changes are the one place the share counters move.
    fn change_role(&self, st: &mut ScanState, h: RmapRef, role: Role) {
        let cur_gen = st.seqnr as u8;
        match st.rmap.get(h).role {
            Role::StableNode => {
                self.stats.pages_shared.fetch_sub(1, Relaxed);
            }
            Role::StableSharer => {
                self.stats.pages_sharing.fetch_sub(1, Relaxed);
            }
            // A stale-generation node was already dropped from the count
            // when its tree was reset.
            Role::UnstableNode { gen } if gen == cur_gen => {
                self.stats.pages_unshared.fetch_sub(1, Relaxed);
            }
            _ => {}
        }
        match role {
            Role::StableNode => {
                self.stats.pages_shared.fetch_add(1, Relaxed);
            }
            Role::StableSharer => {
                self.stats.pages_sharing.fetch_add(1, Relaxed);
            }
            Role::UnstableNode { .. } => {
                self.stats.pages_unshared.fetch_add(1, Relaxed);
            }
            Role::Fresh => {}
        }
        st.rmap.get_mut(h).role = role;
    }

    /// Detaches an item from whichever tree structure its role says it is
    /// in, promoting its chain successor when it anchors a stable node.
    pub(crate) fn remove_rmap_item_from_tree(&self, st: &mut ScanState, h: RmapRef) {
        match st.rmap.get(h).role {
            Role::StableNode => {
                match st.rmap.get(h).chain_next {
                    Some(next) => {
                        tree::replace_node(&mut st.rmap, &mut st.stable_root, h, next);
                        self.change_role(st, next, Role::StableNode);
                        st.rmap.get_mut(next).chain_prev = None;
                    }
                    None => {
                        tree::erase(&mut st.rmap, &mut st.stable_root, h);
                    }
                }
                self.change_role(st, h, Role::Fresh);
                let item = st.rmap.get_mut(h);
                item.chain_next = None;
                item.chain_prev = None;
            }
            Role::StableSharer => {
                let (prev, next) = {
                    let item = st.rmap.get(h);
                    (item.chain_prev, item.chain_next)
                };
                let prev = prev.expect("sharer without a chain head");
                st.rmap.get_mut(prev).chain_next = next;
                if let Some(next) = next {
                    st.rmap.get_mut(next).chain_prev = Some(prev);
                }
                self.change_role(st, h, Role::Fresh);
                let item = st.rmap.get_mut(h);
                item.chain_next = None;
                item.chain_prev = None;
            }
            Role::UnstableNode { gen } => {
                // After a wrap the whole tree is already gone; only a
                // same-generation node is still linked.
                let age = (st.seqnr as u8).wrapping_sub(gen);
                debug_assert!(age <= 1);
                if age == 0 {
                    tree::erase(&mut st.rmap, &mut st.unstable_root, h);
                }
                self.change_role(st, h, Role::Fresh);
            }
            Role::Fresh => {}
        }
    }

    /// Walks the stable tree for a page equal to `page`, splicing out chain
    /// members whose sites no longer map their canonical page. Returns the
    /// matching tree item and a pinned handle to its canonical page.
    fn stable_tree_search(&self, st: &mut ScanState, page: &Frame) -> Option<(RmapRef, Frame)> {
        let mut node = st.stable_root;
        while let Some(start) = node {
            // Find a chain member that still holds the canonical page. Every
            // failed member is spliced off, promoting its successor into the
            // tree slot we are standing on.
            let mut cur = start;
            let tree_page = loop {
                self.host.yield_now();
                debug_assert!(st.rmap.get(cur).in_stable_tree());
                if let Some(found) = get_shared_page(st.rmap.get(cur)) {
                    break found;
                }
                let next = st.rmap.get(cur).chain_next;
                self.remove_rmap_item_from_tree(st, cur);
                // The node vanished with its last member; retry next pass.
                cur = next?;
            };
            match memcmp_pages(page, &tree_page) {
                Ordering::Less => node = st.rmap.links(cur).left(),
                Ordering::Greater => node = st.rmap.links(cur).right(),
                Ordering::Equal => return Some((cur, tree_page)),
            }
        }
        None
    }

    /// Inserts `new_h`, whose site now maps the canonical page `kpage`, as
    /// a new stable node. Fails when an equal node already exists (the
    /// candidate content changed between search and protection) or when a
    /// node under repair runs out of members mid-descent.
    fn stable_tree_insert(&self, st: &mut ScanState, kpage: &Frame, new_h: RmapRef) -> bool {
        let mut parent = None;
        let mut side = Side::Left;
        let mut node = st.stable_root;
        while let Some(start) = node {
            let mut cur = start;
            let tree_page = loop {
                self.host.yield_now();
                if let Some(found) = get_shared_page(st.rmap.get(cur)) {
                    break found;
                }
                let next = st.rmap.get(cur).chain_next;
                self.remove_rmap_item_from_tree(st, cur);
                match next {
                    Some(next) => cur = next,
                    None => return false,
                }
            };
            match memcmp_pages(kpage, &tree_page) {
                Ordering::Less => {
                    parent = Some(cur);
                    side = Side::Left;
                    node = st.rmap.links(cur).left();
                }
                Ordering::Greater => {
                    parent = Some(cur);
                    side = Side::Right;
                    node = st.rmap.links(cur).right();
                }
                Ordering::Equal => return false,
            }
        }

        tree::insert(&mut st.rmap, &mut st.stable_root, parent, side, new_h);
        {
            let item = st.rmap.get_mut(new_h);
            item.chain_next = None;
            item.chain_prev = None;
        }
        self.change_role(st, new_h, Role::StableNode);
        true
    }

    /// Hangs `h` off the sharer chain of the stable node `node_h`.
    fn stable_tree_append(&self, st: &mut ScanState, h: RmapRef, node_h: RmapRef) {
        let old_next = st.rmap.get(node_h).chain_next;
        {
            let item = st.rmap.get_mut(h);
            item.chain_next = old_next;
            item.chain_prev = Some(node_h);
        }
        if let Some(next) = old_next {
            st.rmap.get_mut(next).chain_prev = Some(h);
        }
        st.rmap.get_mut(node_h).chain_next = Some(h);
        self.change_role(st, h, Role::StableSharer);
    }

    /// Searches the unstable tree for a page equal to `page`; inserts
    /// `new_h` as a new node if none matches. Returns the matching item and
    /// its pinned page, `None` after an insert or an abandoned walk.
    fn unstable_tree_search_insert(
        &self,
        st: &mut ScanState,
        page: &Frame,
        new_h: RmapRef,
    ) -> Option<(RmapRef, Frame)> {
        let mut parent = None;
        let mut side = Side::Left;
        let mut node = st.unstable_root;
        while let Some(cur) = node {
            self.host.yield_now();
            // Any dead node poisons the walk; give up until the next pass.
            let tree_page = get_mergeable_page(st.rmap.get(cur))?;
            if tree_page == *page {
                // The very same physical page reached via another site;
                // "merging" it with itself would only pin it.
                return None;
            }
            match memcmp_pages(page, &tree_page) {
                Ordering::Less => {
                    parent = Some(cur);
                    side = Side::Left;
                    node = st.rmap.links(cur).left();
                }
                Ordering::Greater => {
                    parent = Some(cur);
                    side = Side::Right;
                    node = st.rmap.links(cur).right();
                }
                Ordering::Equal => return Some((cur, tree_page)),
            }
        }

        tree::insert(&mut st.rmap, &mut st.unstable_root, parent, side, new_h);
        let gen = st.seqnr as u8;
        self.change_role(st, new_h, Role::UnstableNode { gen });
        None
    }

    /// Classifies one candidate: stable-tree hit, too volatile, unstable
    /// insert, or unstable hit followed by a two-page merge.
    fn cmp_and_merge_page(&self, st: &mut ScanState, page: &Frame, h: RmapRef) {
        if st.rmap.get(h).in_stable_tree() {
            // The site no longer maps its shared page; detach before
            // reconsidering it from scratch.
            self.remove_rmap_item_from_tree(st, h);
        }
        let (space, address) = {
            let item = st.rmap.get(h);
            (item.space.clone(), item.address)
        };

        if let Some((tree_h, kpage)) = self.stable_tree_search(st, page) {
            let merged = if *page == kpage {
                // Another site of the same page (e.g. after fork); nothing
                // to substitute.
                Ok(())
            } else {
                try_to_merge_with_shared_page(&space, address, page, &kpage)
            };
            if merged.is_ok() {
                self.stable_tree_append(st, h, tree_h);
                debug!(
                    "site {}@{:#x} joined a stable page",
                    space.id(),
                    address
                );
            }
            return;
        }

        // A merged page can arrive here when its references already fell
        // out of the stable tree, or a previous break-COW failed half-way;
        // give the site a private copy before reconsidering.
        if page.is_merged() {
            break_cow(&space, address);
        }

        // A page whose fingerprint is still moving is not worth sorting
        // into the unstable tree.
        let checksum = calc_checksum(page);
        {
            let item = st.rmap.get_mut(h);
            if item.oldchecksum != checksum {
                item.oldchecksum = checksum;
                return;
            }
        }

        let Some((tree_h, tree_page)) = self.unstable_tree_search_insert(st, page, h) else {
            return;
        };
        let (tree_space, tree_addr) = {
            let item = st.rmap.get(tree_h);
            (item.space.clone(), item.address)
        };
        match self.try_to_merge_two_pages(
            &space, address, page, &tree_space, tree_addr, &tree_page,
        ) {
            Ok(kpage) => {
                // The partner leaves the unstable tree and anchors a new
                // stable node keyed by the canonical page.
                self.remove_rmap_item_from_tree(st, tree_h);
                if self.stable_tree_insert(st, &kpage, tree_h) {
                    self.stable_tree_append(st, h, tree_h);
                    debug!(
                        "merged {}@{:#x} and {}@{:#x} onto a shared page",
                        space.id(),
                        address,
                        tree_space.id(),
                        tree_addr
                    );
                } else {
                    // Two sites would otherwise share a page that no tree
                    // node accounts for.
                    break_cow(&tree_space, tree_addr);
                    break_cow(&space, address);
                }
            }
            Err(_) => {}
        }
    }

    /// Finds or creates the item for `addr` in the cursor slot's list,
    /// freeing stale items the cursor has already passed.
    fn get_next_rmap_item(
        &self,
        st: &mut ScanState,
        slot_h: SlotRef,
        space: &Arc<AddrSpace>,
        addr: Vaddr,
    ) -> RmapRef {
        let mut mml = self.mm_list.lock();
        loop {
            let Some(h) = mml.get(slot_h).items.get(st.list_pos).copied() else {
                break;
            };
            let item_addr = st.rmap.get(h).address;
            if item_addr == addr {
                if !st.rmap.get(h).in_stable_tree() {
                    self.remove_rmap_item_from_tree(st, h);
                }
                st.list_pos += 1;
                return h;
            }
            if item_addr > addr {
                break;
            }
            // Passed by the cursor: no opted-in region covers it any more.
            self.remove_rmap_item_from_tree(st, h);
            mml.get_mut(slot_h).items.remove(st.list_pos);
            self.free_rmap_item(st, h);
        }

        let h = self.alloc_rmap_item(st, RmapItem::new(space.clone(), addr));
        mml.get_mut(slot_h).items.insert(st.list_pos, h);
        st.list_pos += 1;
        h
    }

    /// Frees every item from list position `from` onwards; the scan passed
    /// their addresses without revisiting them.
    pub(crate) fn remove_trailing_rmap_items(
        &self,
        st: &mut ScanState,
        slot_h: SlotRef,
        from: usize,
    ) {
        let tail = self.mm_list.lock().get_mut(slot_h).items.split_off(from);
        for h in tail {
            self.remove_rmap_item_from_tree(st, h);
            self.free_rmap_item(st, h);
        }
    }

    fn alloc_rmap_item(&self, st: &mut ScanState, item: RmapItem) -> RmapRef {
        self.stats.rmap_items.fetch_add(1, Relaxed);
        st.rmap.alloc(item)
    }

    fn free_rmap_item(&self, st: &mut ScanState, h: RmapRef) {
        self.stats.rmap_items.fetch_sub(1, Relaxed);
        st.rmap.free(h);
    }

    /// Advances the cursor to the next candidate page, returning its item
    /// and pinned page. `None` ends the batch: either nothing is enrolled
    /// or the pass wrapped (bumping the generation).
    fn next_scan_candidate(&self, st: &mut ScanState) -> Option<(RmapRef, Frame)> {
        loop {
            let (slot_h, space) = {
                let mut mml = self.mm_list.lock();
                if mml.is_empty() {
                    return None;
                }
                let h = match mml.cursor() {
                    Some(h) => h,
                    None => {
                        // A new pass begins at the head of the list.
                        let first = mml.first().expect("non-empty list without a head");
                        mml.set_cursor(Some(first));
                        st.address = 0;
                        st.list_pos = 0;
                        first
                    }
                };
                (h, mml.get(h).space.clone())
            };

            let regions = space.lock_maps();
            if !space.is_exiting() {
                let mut idx = regions.partition_point(|r| r.end <= st.address);
                'slot: while idx < regions.len() {
                    let region = &regions[idx];
                    idx += 1;
                    if !region.flags.contains(RegionFlags::MERGEABLE) {
                        continue;
                    }
                    if st.address < region.start {
                        st.address = region.start;
                    }
                    while st.address < region.end {
                        if space.is_exiting() {
                            break 'slot;
                        }
                        if let Some(page) = space.follow_page(st.address) {
                            let addr = st.address;
                            let h = self.get_next_rmap_item(st, slot_h, &space, addr);
                            st.address = addr + PAGE_SIZE;
                            return Some((h, page));
                        }
                        st.address += PAGE_SIZE;
                        self.host.yield_now();
                    }
                }
            }

            if space.is_exiting() {
                st.address = 0;
                st.list_pos = 0;
            }
            let list_pos = st.list_pos;
            self.remove_trailing_rmap_items(st, slot_h, list_pos);

            let wrapped = {
                let mut mml = self.mm_list.lock();
                let next = mml.next_after(slot_h);
                if st.address == 0 {
                    // A whole pass over this space found nothing to scan:
                    // no opted-in region left, or it is exiting. Reap it.
                    mml.remove(slot_h);
                    space.set_merge_enrolled(false);
                    debug!("space {} left the scan list", space.id());
                }
                mml.set_cursor(next);
                next.is_none()
            };
            drop(regions);

            st.address = 0;
            st.list_pos = 0;
            if wrapped {
                self.wrap_generation(st);
                return None;
            }
        }
    }

    /// Ends a full pass: the unstable tree dies wholesale (orphaned nodes
    /// carry a stale generation stamp that marks their links dead) and the
    /// generation moves on.
    fn wrap_generation(&self, st: &mut ScanState) {
        st.unstable_root = None;
        st.seqnr += 1;
        self.stats.full_scans.store(st.seqnr, Relaxed);
        self.stats.pages_unshared.store(0, Relaxed);
        trace!("full scan {} complete", st.seqnr);
    }
}
