// SPDX-License-Identifier: MPL-2.0

//! The PTE merge protocol: write-protect a source entry, verify nothing
//! else holds the page in flight, substitute the shared page, and the
//! break-COW path that undoes a merge.

use super::compare::pages_identical;
use super::Ksm;
use crate::prelude::*;
use crate::vm::{find_region, page_align_down, AddrSpace, Frame, Pte, Region, RegionFlags};

/// Write-protects the entry mapping `page` at `addr` and returns the entry
/// now installed there.
///
/// The ordering below is the crux of correctness against concurrent direct
/// I/O: clear-and-flush the entry first, only then compare the map count
/// against the reference count. A pin taken before the clear is visible to
/// the comparison; none can be taken after it, because lookups find no
/// entry. On a mismatch the original entry is restored untouched.
pub(crate) fn write_protect_page(space: &AddrSpace, addr: Vaddr, page: &Frame) -> Result<Pte> {
    let addr = page_align_down(addr);
    let mut pt = space.lock_pt();

    let Some(cur) = pt.get(addr) else {
        return_errno_with_message!(Errno::EFAULT, "page no longer mapped");
    };
    if cur.frame != *page {
        return_errno_with_message!(Errno::EFAULT, "page no longer mapped");
    }

    if cur.writable {
        let entry = pt.clear_flush(addr).expect("entry vanished under the PTE lock");
        // The two expected pins are the scan candidate hold and the merge
        // path's own hold; the table entry in hand accounts for the map.
        if entry.frame.map_count() + 2 != entry.frame.ref_count() {
            pt.set_notify(addr, entry);
            return_errno_with_message!(Errno::EBUSY, "page is referenced in flight");
        }
        let frame = entry.frame.clone();
        pt.set_notify(
            addr,
            Pte {
                frame: entry.frame,
                writable: false,
            },
        );
        Ok(Pte {
            frame,
            writable: false,
        })
    } else {
        Ok(cur.clone())
    }
}

/// Replaces the entry at `addr`, which must still equal `saved`, with a
/// write-protected mapping of `new`.
pub(crate) fn replace_page(
    space: &AddrSpace,
    addr: Vaddr,
    old: &Frame,
    new: &Frame,
    saved: &Pte,
) -> Result<()> {
    let addr = page_align_down(addr);
    let mut pt = space.lock_pt();

    let Some(cur) = pt.get(addr) else {
        return_errno_with_message!(Errno::EFAULT, "entry changed under us");
    };
    if *cur != *saved {
        return_errno_with_message!(Errno::EFAULT, "entry changed under us");
    }

    new.set_merged();
    new.inc_map_count();
    let old_entry = pt.clear_flush(addr).expect("entry vanished under the PTE lock");
    pt.set_notify(
        addr,
        Pte {
            frame: new.clone(),
            writable: false,
        },
    );
    old.dec_map_count();
    drop(old_entry);
    Ok(())
}

/// Merges the page at one site into `new`: write-protect, re-verify byte
/// equality, substitute. The caller holds the space's map lock; `region`
/// is the region covering `addr`.
pub(crate) fn try_to_merge_one_page(
    space: &AddrSpace,
    region: &Region,
    addr: Vaddr,
    old: &Frame,
    new: &Frame,
) -> Result<()> {
    if !region.flags.contains(RegionFlags::MERGEABLE) {
        return_errno_with_message!(Errno::EFAULT, "region withdrew from merging");
    }

    // Hold both pages for the duration; the write-protect reference check
    // counts on exactly these two holds of `old`.
    let old = old.clone();
    let new = new.clone();

    let saved = write_protect_page(space, addr, &old)?;
    if !pages_identical(&old, &new) {
        return_errno_with_message!(Errno::EFAULT, "page changed before protection");
    }
    replace_page(space, addr, &old, &new, &saved)
}

/// Merges the page at `(space, addr)` with an existing canonical page.
pub(crate) fn try_to_merge_with_shared_page(
    space: &Arc<AddrSpace>,
    addr: Vaddr,
    page: &Frame,
    shared: &Frame,
) -> Result<()> {
    let regions = space.lock_maps();
    if space.is_exiting() {
        return_errno_with_message!(Errno::EFAULT, "space is exiting");
    }
    let Some(region) = find_region(&regions, addr) else {
        return_errno_with_message!(Errno::EFAULT, "no region at site");
    };
    if region.start > addr {
        return_errno_with_message!(Errno::EFAULT, "no region at site");
    }
    try_to_merge_one_page(space, region, addr, page, shared)
}

impl Ksm {
    /// Merges two candidate pages onto a freshly allocated canonical page
    /// and returns it. On a half-completed merge the first site is
    /// COW-broken again so no shared page lingers with a single sharer.
    pub(crate) fn try_to_merge_two_pages(
        &self,
        space1: &Arc<AddrSpace>,
        addr1: Vaddr,
        page1: &Frame,
        space2: &Arc<AddrSpace>,
        addr2: Vaddr,
        page2: &Frame,
    ) -> Result<Frame> {
        // Every stable node holds one unswappable page.
        let max = self.max_kernel_pages();
        if max != 0 && max <= self.pages_shared() {
            return_errno_with_message!(Errno::EFAULT, "shared-page limit reached");
        }

        let kpage = Frame::alloc_zeroed();
        {
            let regions = space1.lock_maps();
            if space1.is_exiting() {
                return_errno_with_message!(Errno::EFAULT, "space is exiting");
            }
            let Some(region) = find_region(&regions, addr1) else {
                return_errno_with_message!(Errno::EFAULT, "no region at site");
            };
            if region.start > addr1 {
                return_errno_with_message!(Errno::EFAULT, "no region at site");
            }

            kpage.copy_from(page1);
            try_to_merge_one_page(space1, region, addr1, page1, &kpage)?;
        }

        match try_to_merge_with_shared_page(space2, addr2, page2, &kpage) {
            Ok(()) => Ok(kpage),
            Err(e) => {
                // A shared page with one sharer must not persist.
                break_cow(space1, addr1);
                Err(e)
            }
        }
    }
}

/// Repeatedly write-faults `addr` until it no longer maps a merged page.
/// The caller holds the space's map lock in either mode.
pub(crate) fn break_merged_page(space: &AddrSpace, addr: Vaddr) {
    loop {
        let Some(page) = space.follow_page(addr) else { return };
        if !page.is_merged() {
            return;
        }
        space.fault_in_writable_locked(addr);
    }
}

/// Undoes a merge at one site, carefully touching only a merged page in a
/// still-mergeable region (the site may have been unmapped and remapped
/// since).
pub(crate) fn break_cow(space: &AddrSpace, addr: Vaddr) {
    let regions = space.lock_maps();
    if space.is_exiting() {
        return;
    }
    let Some(region) = find_region(&regions, addr) else { return };
    if region.start > addr || !region.flags.contains(RegionFlags::MERGEABLE) {
        return;
    }
    break_merged_page(space, addr);
}
