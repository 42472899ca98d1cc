// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use super::{page_align_down, Frame, Vaddr, PAGE_SIZE};
use crate::prelude::*;

static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(1);

bitflags! {
    /// Properties of a region. `advise(Mergeable)` refuses regions carrying
    /// any of the special-backing flags.
    pub struct RegionFlags: u32 {
        /// Opted in to samepage merging.
        const MERGEABLE  = 1 << 0;
        /// Shared between address spaces.
        const SHARED     = 1 << 1;
        /// Raw page-frame mapping (device memory and the like).
        const PFNMAP     = 1 << 2;
        /// Pinned for device I/O.
        const IO         = 1 << 3;
        /// Must not be grown or split.
        const DONTEXPAND = 1 << 4;
        /// Backed by huge pages.
        const HUGETLB    = 1 << 5;
        /// Mixes frame and raw mappings.
        const MIXEDMAP   = 1 << 6;
        /// Carries a special marker entry.
        const SPECIAL    = 1 << 7;
    }
}

/// A contiguous range of an address space with uniform backing.
#[derive(Debug, Clone)]
pub struct Region {
    pub start: Vaddr,
    pub end: Vaddr,
    pub flags: RegionFlags,
}

impl Region {
    pub fn contains(&self, addr: Vaddr) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// Returns the first region whose end lies above `addr`, which may start
/// above `addr` as well (the `find_vma` contract).
pub(crate) fn find_region(regions: &[Region], addr: Vaddr) -> Option<&Region> {
    regions.iter().find(|r| r.end > addr)
}

/// A leaf page-table entry.
///
/// Holding a frame handle inside the entry is what makes a mapped frame's
/// reference count owe one to its page table.
#[derive(Debug, Clone)]
pub struct Pte {
    pub frame: Frame,
    pub writable: bool,
}

impl PartialEq for Pte {
    fn eq(&self, other: &Self) -> bool {
        self.frame == other.frame && self.writable == other.writable
    }
}

impl Eq for Pte {}

/// The leaf page table of one address space, guarded by one spin lock
/// (the PTE-lock granularity is per page table).
#[derive(Default)]
pub(crate) struct PageTable {
    entries: BTreeMap<Vaddr, Pte>,
}

impl PageTable {
    pub(crate) fn get(&self, addr: Vaddr) -> Option<&Pte> {
        self.entries.get(&addr)
    }

    /// Clears the entry and flushes the stale translation, handing the old
    /// entry back. Reference and map counts are untouched: the frame merely
    /// moves from the table into the caller's hand.
    pub(crate) fn clear_flush(&mut self, addr: Vaddr) -> Option<Pte> {
        self.entries.remove(&addr)
    }

    /// Installs `pte` with a notifier-visible write. Counts are untouched;
    /// the frame moves from the caller's hand into the table.
    pub(crate) fn set_notify(&mut self, addr: Vaddr, pte: Pte) {
        self.entries.insert(addr, pte);
    }

    /// Maps `frame` at `addr`, taking the map-count reference.
    fn map(&mut self, addr: Vaddr, frame: Frame, writable: bool) {
        frame.inc_map_count();
        self.entries.insert(addr, Pte { frame, writable });
    }
}

/// One address space: a region list under a read/write map lock and a leaf
/// page table under a spin lock, plus the alive counter that gives the
/// torn-down predicate.
pub struct AddrSpace {
    id: u64,
    users: AtomicUsize,
    merge_enrolled: AtomicBool,
    maps: RwLock<Vec<Region>>,
    pt: Mutex<PageTable>,
}

impl AddrSpace {
    pub fn new() -> Arc<Self> {
        Arc::new(AddrSpace {
            id: NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed),
            users: AtomicUsize::new(1),
            merge_enrolled: AtomicBool::new(false),
            maps: RwLock::new(Vec::new()),
            pt: Mutex::new(PageTable::default()),
        })
    }

    /// A stable identity for this address space.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the address space is being torn down.
    pub fn is_exiting(&self) -> bool {
        self.users.load(Ordering::Acquire) == 0
    }

    pub(crate) fn is_merge_enrolled(&self) -> bool {
        self.merge_enrolled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_merge_enrolled(&self, enrolled: bool) {
        self.merge_enrolled.store(enrolled, Ordering::Relaxed);
    }

    /// Adds an anonymous private region. `start` and `size` must be
    /// page-aligned and must not overlap an existing region.
    pub fn add_region(&self, start: Vaddr, size: usize, flags: RegionFlags) -> Result<()> {
        if start % PAGE_SIZE != 0 || size == 0 || size % PAGE_SIZE != 0 {
            return_errno_with_message!(Errno::EINVAL, "misaligned region");
        }
        let end = start
            .checked_add(size)
            .ok_or(Error::with_message(Errno::EINVAL, "region wraps"))?;

        let mut regions = self.maps.write();
        if regions.iter().any(|r| r.start < end && start < r.end) {
            return_errno_with_message!(Errno::EINVAL, "region overlaps");
        }
        let at = regions.partition_point(|r| r.start < start);
        regions.insert(at, Region { start, end, flags });
        Ok(())
    }

    /// Read side of the map lock.
    pub(crate) fn lock_maps(&self) -> RwLockReadGuard<'_, Vec<Region>> {
        self.maps.read()
    }

    /// Write side of the map lock.
    pub(crate) fn lock_maps_mut(&self) -> RwLockWriteGuard<'_, Vec<Region>> {
        self.maps.write()
    }

    /// Acquires the PTE lock.
    pub(crate) fn lock_pt(&self) -> MutexGuard<'_, PageTable> {
        self.pt.lock()
    }

    /// Returns a pinned handle to the frame mapped at `addr`, if any
    /// (the `follow_page(..., GET)` contract).
    pub fn follow_page(&self, addr: Vaddr) -> Option<Frame> {
        let pt = self.pt.lock();
        pt.get(page_align_down(addr)).map(|pte| pte.frame.clone())
    }

    /// Reads `buf.len()` bytes at `addr`. Unfaulted pages inside a region
    /// read as zeroes; addresses outside every region fault.
    pub fn read(&self, addr: Vaddr, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let cur = addr + done;
            let page = page_align_down(cur);
            let offset = cur - page;
            let n = (buf.len() - done).min(PAGE_SIZE - offset);

            let regions = self.maps.read();
            if !regions.iter().any(|r| r.contains(cur)) {
                return_errno_with_message!(Errno::EFAULT, "read outside regions");
            }
            let pt = self.pt.lock();
            match pt.get(page) {
                Some(pte) => pte.frame.with_bytes(|bytes| {
                    buf[done..done + n].copy_from_slice(&bytes[offset..offset + n]);
                }),
                None => buf[done..done + n].fill(0),
            }
            drop(pt);
            drop(regions);

            done += n;
        }
        Ok(())
    }

    /// Writes `data` at `addr` the way a user access would: faulting in
    /// zero-filled pages and breaking copy-on-write where needed.
    pub fn write(&self, addr: Vaddr, data: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            let cur = addr + done;
            let page = page_align_down(cur);
            let offset = cur - page;
            let n = (data.len() - done).min(PAGE_SIZE - offset);

            let regions = self.maps.read();
            if !regions.iter().any(|r| r.contains(cur)) {
                return_errno_with_message!(Errno::EFAULT, "write outside regions");
            }
            let frame = self.writable_frame(page);
            frame.with_bytes_mut(|bytes| {
                bytes[offset..offset + n].copy_from_slice(&data[done..done + n]);
            });
            drop(regions);

            done += n;
        }
        Ok(())
    }

    /// Forces a write fault at `addr`: afterwards the page is mapped
    /// writable and private. The vehicle for breaking copy-on-write.
    pub fn fault_in_writable(&self, addr: Vaddr) -> Result<()> {
        let page = page_align_down(addr);
        let regions = self.maps.read();
        if !regions.iter().any(|r| r.contains(addr)) {
            return_errno_with_message!(Errno::EFAULT, "fault outside regions");
        }
        self.writable_frame(page);
        Ok(())
    }

    /// [`Self::fault_in_writable`] for callers that already hold the map
    /// lock (in either mode) and have validated the region themselves.
    pub(crate) fn fault_in_writable_locked(&self, addr: Vaddr) {
        self.writable_frame(page_align_down(addr));
    }

    /// Resolves `page` to a writable private frame, faulting as needed.
    /// Caller must hold the map read lock.
    fn writable_frame(&self, page: Vaddr) -> Frame {
        let mut pt = self.pt.lock();
        match pt.get(page).cloned() {
            None => {
                // Anonymous fault.
                let frame = Frame::alloc_zeroed();
                pt.map(page, frame.clone(), true);
                frame
            }
            Some(pte) if pte.writable => pte.frame,
            Some(pte) => {
                let old = pte.frame;
                if old.is_merged() || old.map_count() > 1 {
                    // Copy-on-write: a merged page is never reused in place.
                    let copy = Frame::alloc_zeroed();
                    copy.copy_from(&old);
                    old.dec_map_count();
                    pt.clear_flush(page);
                    pt.map(page, copy.clone(), true);
                    copy
                } else {
                    // Sole private mapping: re-enable write in place.
                    let pte = Pte {
                        frame: old.clone(),
                        writable: true,
                    };
                    pt.set_notify(page, pte);
                    old
                }
            }
        }
    }

    /// Duplicates the address space the way fork does: the child gets the
    /// same regions, and every mapped frame becomes shared copy-on-write
    /// between parent and child, so either side's next write faults in a
    /// private copy.
    ///
    /// Merge enrollment is per address space and is not inherited; the
    /// child's regions come back without the mergeable bit and opt in anew.
    pub fn fork(&self) -> Arc<Self> {
        let regions = self.maps.read();
        let mut child_regions = (*regions).clone();
        for region in &mut child_regions {
            region.flags.remove(RegionFlags::MERGEABLE);
        }

        let mut pt = self.pt.lock();
        let mut child_pt = PageTable::default();
        for (addr, pte) in pt.entries.iter_mut() {
            pte.writable = false;
            child_pt.map(*addr, pte.frame.clone(), false);
        }

        Arc::new(AddrSpace {
            id: NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed),
            users: AtomicUsize::new(1),
            merge_enrolled: AtomicBool::new(false),
            maps: RwLock::new(child_regions),
            pt: Mutex::new(child_pt),
        })
    }

    /// Tears the address space down: the alive count drops to zero and the
    /// page table empties under the map write lock, so walkers that
    /// re-check [`Self::is_exiting`] under the read lock never race it.
    pub fn exit(&self) {
        self.users.store(0, Ordering::Release);
        let _maps = self.maps.write();
        let mut pt = self.pt.lock();
        let torn = core::mem::take(&mut pt.entries);
        for pte in torn.values() {
            pte.frame.dec_map_count();
        }
    }
}

impl Debug for AddrSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddrSpace")
            .field("id", &self.id)
            .field("exiting", &self.is_exiting())
            .finish()
    }
}
