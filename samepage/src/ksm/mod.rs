// SPDX-License-Identifier: MPL-2.0

//! The samepage-merging engine: enrollment lifecycle, the run-mode state
//! machine, and the operator-facing counters and knobs.
//!
//! All mutable engine state hides behind two locks. The engine mutex guards
//! the trees, the item arena and the in-slot scan position, and is held
//! across one whole scan batch, serializing batches against run-mode
//! transitions. A leaf spin lock guards the enrollment list, the identity
//! index and the cursor slot, and is never held across a page operation or
//! a map lock. Counters are plain atomics; readers tolerate momentary skew.

mod attr;
mod compare;
mod merge;
mod rmap;
mod scan;
mod slots;
mod tree;
mod worker;

use core::ops::Range;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering::Relaxed};

use merge::break_merged_page;
use scan::ScanState;
use slots::MmList;

use crate::prelude::*;
use crate::vm::{page_align_down, AddrSpace, RegionFlags, PAGE_SIZE};

pub use worker::{ksmd, KsmdHost};

/// What the background worker should be doing.
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RunMode {
    /// Leave merged pages alone and scan nothing.
    Stop = 0,
    /// Scan and merge.
    Merge = 1,
    /// Undo every merge; set synchronously by the control surface.
    Unmerge = 2,
}

impl TryFrom<u64> for RunMode {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            0 => Ok(RunMode::Stop),
            1 => Ok(RunMode::Merge),
            2 => Ok(RunMode::Unmerge),
            _ => Err(Error::with_message(Errno::EINVAL, "unknown run mode")),
        }
    }
}

/// Per-region advice, the opt-in surface of the engine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Advice {
    Mergeable,
    NotMergeable,
}

/// Share counters. Maintained without locks by the scanner; momentary
/// under- and over-counts are part of the contract.
#[derive(Default)]
struct KsmStats {
    /// Stable nodes, i.e. shared pages the engine holds.
    pages_shared: AtomicU64,
    /// Additional sites sharing those pages.
    pages_sharing: AtomicU64,
    /// Current-generation unstable nodes.
    pages_unshared: AtomicU64,
    /// Live reverse-map items.
    rmap_items: AtomicU64,
    /// Completed full scans.
    full_scans: AtomicU64,
}

/// The engine. One instance owns all merge state; the background worker
/// drives [`Ksm::scan`] while operators poke the attribute surface from
/// other threads.
pub struct Ksm {
    host: Arc<dyn KsmdHost>,
    run: AtomicU32,
    sleep_millisecs: AtomicU32,
    pages_to_scan: AtomicU32,
    max_kernel_pages: AtomicU64,
    stats: KsmStats,
    state: Mutex<ScanState>,
    mm_list: Mutex<MmList>,
}

impl Ksm {
    pub fn new(host: Arc<dyn KsmdHost>) -> Arc<Self> {
        Arc::new(Ksm {
            host,
            run: AtomicU32::new(RunMode::Stop as u32),
            sleep_millisecs: AtomicU32::new(20),
            pages_to_scan: AtomicU32::new(100),
            max_kernel_pages: AtomicU64::new(0),
            stats: KsmStats::default(),
            state: Mutex::new(ScanState::default()),
            mm_list: Mutex::new(MmList::default()),
        })
    }

    pub fn run(&self) -> RunMode {
        match self.run.load(Relaxed) {
            0 => RunMode::Stop,
            1 => RunMode::Merge,
            _ => RunMode::Unmerge,
        }
    }

    /// Switches the run mode. A transition to [`RunMode::Unmerge`] performs
    /// the full unmerge synchronously before returning; when that is
    /// interrupted the mode reverts to [`RunMode::Stop`] and the error is
    /// handed back. Writing the current mode is a no-op.
    pub fn set_run(&self, mode: RunMode) -> Result<()> {
        {
            let mut st = self.state.lock();
            if self.run() != mode {
                self.run.store(mode as u32, Relaxed);
                if mode == RunMode::Unmerge {
                    if let Err(e) = self.unmerge_and_remove_all(&mut st) {
                        self.run.store(RunMode::Stop as u32, Relaxed);
                        return Err(e);
                    }
                }
            }
        }
        if mode == RunMode::Merge {
            self.host.wake();
        }
        Ok(())
    }

    pub fn sleep_millisecs(&self) -> u32 {
        self.sleep_millisecs.load(Relaxed)
    }

    pub fn set_sleep_millisecs(&self, msecs: u32) {
        self.sleep_millisecs.store(msecs, Relaxed);
    }

    pub fn pages_to_scan(&self) -> u32 {
        self.pages_to_scan.load(Relaxed)
    }

    pub fn set_pages_to_scan(&self, pages: u32) {
        self.pages_to_scan.store(pages, Relaxed);
    }

    /// Limit on shared pages the engine may hold; 0 means no limit.
    pub fn max_kernel_pages(&self) -> u64 {
        self.max_kernel_pages.load(Relaxed)
    }

    pub fn set_max_kernel_pages(&self, pages: u64) {
        self.max_kernel_pages.store(pages, Relaxed);
    }

    pub fn pages_shared(&self) -> u64 {
        self.stats.pages_shared.load(Relaxed)
    }

    pub fn pages_sharing(&self) -> u64 {
        self.stats.pages_sharing.load(Relaxed)
    }

    pub fn pages_unshared(&self) -> u64 {
        self.stats.pages_unshared.load(Relaxed)
    }

    /// Items tracked but currently in no tree: their contents are still
    /// changing. Computed from skew-tolerant counters, so clamped at zero.
    pub fn pages_volatile(&self) -> u64 {
        let counted = self.pages_shared() + self.pages_sharing() + self.pages_unshared();
        self.stats.rmap_items.load(Relaxed).saturating_sub(counted)
    }

    pub fn full_scans(&self) -> u64 {
        self.stats.full_scans.load(Relaxed)
    }

    /// Whether the worker has anything to do.
    pub(crate) fn merge_running(&self) -> bool {
        self.run() == RunMode::Merge && !self.mm_list.lock().is_empty()
    }

    /// Applies merge advice to every eligible region intersecting `range`.
    ///
    /// `Mergeable` silently ignores regions with special backing (shared,
    /// raw-frame, pinned-I/O, huge, mixed, marker-carrying); first-time
    /// advice enrolls the address space behind the scan cursor.
    /// `NotMergeable` force-unmerges every page in the range, which a
    /// pending signal may interrupt.
    pub fn advise(
        &self,
        space: &Arc<AddrSpace>,
        range: Range<Vaddr>,
        advice: Advice,
    ) -> Result<()> {
        match advice {
            Advice::Mergeable => {
                let mut regions = space.lock_maps_mut();
                for region in regions
                    .iter_mut()
                    .filter(|r| r.start < range.end && range.start < r.end)
                {
                    if !region_can_merge(region.flags) {
                        continue;
                    }
                    if !space.is_merge_enrolled() {
                        self.opt_in(space);
                    }
                    region.flags |= RegionFlags::MERGEABLE;
                }
                Ok(())
            }
            Advice::NotMergeable => {
                let mut regions = space.lock_maps_mut();
                for at in 0..regions.len() {
                    let region = &regions[at];
                    if !region.flags.contains(RegionFlags::MERGEABLE)
                        || region.start >= range.end
                        || range.start >= region.end
                    {
                        continue;
                    }
                    let lo = range.start.max(region.start);
                    let hi = range.end.min(region.end);
                    self.unmerge_range(space, lo, hi)?;
                    regions[at].flags.remove(RegionFlags::MERGEABLE);
                }
                Ok(())
            }
        }
    }

    /// Breaks every merged page in `[start, end)`. The caller holds the
    /// space's map lock.
    fn unmerge_range(&self, space: &AddrSpace, start: Vaddr, end: Vaddr) -> Result<()> {
        let mut addr = page_align_down(start);
        while addr < end {
            if space.is_exiting() {
                break;
            }
            if self.host.signal_pending() {
                return_errno_with_message!(Errno::EINTR, "unmerge interrupted");
            }
            break_merged_page(space, addr);
            self.host.yield_now();
            addr += PAGE_SIZE;
        }
        Ok(())
    }

    /// Enrolls `space` for scanning. The new slot goes right behind the
    /// cursor, so the fresh area gets the rest of the pass to settle before
    /// it is first visited.
    fn opt_in(&self, space: &Arc<AddrSpace>) {
        let needs_wakeup;
        {
            let mut mml = self.mm_list.lock();
            if mml.lookup(space.id()).is_some() {
                return;
            }
            needs_wakeup = mml.is_empty();
            mml.enroll(space.clone());
            space.set_merge_enrolled(true);
        }
        debug!("space {} enrolled for merging", space.id());
        if needs_wakeup {
            self.host.wake();
        }
    }

    /// Called while `space` is being torn down. A slot with no items that
    /// the cursor is not standing on dies immediately; otherwise it is left
    /// for the scanner to reap, behind a map-lock barrier so no page walk
    /// survives into the teardown.
    pub fn on_exit(&self, space: &Arc<AddrSpace>) {
        let reaped = {
            let mut mml = self.mm_list.lock();
            match mml.lookup(space.id()) {
                // The scanner noticed the exit first.
                None => return,
                Some(h) => {
                    if mml.cursor() != Some(h) && mml.get(h).items.is_empty() {
                        mml.remove(h);
                        true
                    } else {
                        // Bring it close to the cursor for a quick reap.
                        mml.move_after_cursor(h);
                        false
                    }
                }
            }
        };
        if reaped {
            space.set_merge_enrolled(false);
            debug!("space {} reaped on exit", space.id());
        } else {
            let _barrier = space.lock_maps_mut();
        }
    }

    /// The `run = 2` path: walk every enrolled space, break every merged
    /// page in opted-in regions, and drop all reverse-map state. Slots stay
    /// enrolled for a later return to merging; exiting spaces are reaped.
    fn unmerge_and_remove_all(&self, st: &mut ScanState) -> Result<()> {
        {
            let mut mml = self.mm_list.lock();
            let first = mml.first();
            mml.set_cursor(first);
        }
        loop {
            let parked = {
                let mml = self.mm_list.lock();
                mml.cursor().map(|h| (h, mml.get(h).space.clone()))
            };
            let Some((slot_h, space)) = parked else { break };

            let walk = {
                let regions = space.lock_maps();
                let mut walk = Ok(());
                'space: for region in regions
                    .iter()
                    .filter(|r| r.flags.contains(RegionFlags::MERGEABLE))
                {
                    let mut addr = region.start;
                    while addr < region.end {
                        if space.is_exiting() {
                            break 'space;
                        }
                        if self.host.signal_pending() {
                            walk = Err(Error::with_message(
                                Errno::EINTR,
                                "unmerge interrupted",
                            ));
                            break 'space;
                        }
                        break_merged_page(&space, addr);
                        self.host.yield_now();
                        addr += PAGE_SIZE;
                    }
                }
                walk
            };
            if let Err(e) = walk {
                let mut mml = self.mm_list.lock();
                mml.set_cursor(None);
                st.address = 0;
                st.list_pos = 0;
                return Err(e);
            }

            self.remove_trailing_rmap_items(st, slot_h, 0);

            let mut mml = self.mm_list.lock();
            let next = mml.next_after(slot_h);
            if space.is_exiting() {
                mml.remove(slot_h);
                space.set_merge_enrolled(false);
            }
            mml.set_cursor(next);
        }

        st.seqnr = 0;
        st.address = 0;
        st.list_pos = 0;
        self.stats.full_scans.store(0, Relaxed);
        Ok(())
    }
}

/// Whether a region's backing permits merge advice at all.
fn region_can_merge(flags: RegionFlags) -> bool {
    let forbidden = RegionFlags::MERGEABLE
        | RegionFlags::SHARED
        | RegionFlags::PFNMAP
        | RegionFlags::IO
        | RegionFlags::DONTEXPAND
        | RegionFlags::HUGETLB
        | RegionFlags::MIXEDMAP
        | RegionFlags::SPECIAL;
    !flags.intersects(forbidden)
}
