// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::prelude::*;

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

/// A handle to one page frame.
///
/// Cloning a `Frame` pins the page (the `get_page` contract); dropping the
/// clone releases the pin. The page table holds one handle per leaf entry
/// mapping the frame, so the reference count is always
/// `map_count + pins + transient holds`.
#[derive(Clone)]
pub struct Frame {
    inner: Arc<FrameInner>,
}

struct FrameInner {
    id: u64,
    /// Number of leaf page-table entries mapping this frame. Only the
    /// explicit rmap calls below move it; raw PTE ops never do.
    map_count: AtomicUsize,
    /// Set once the frame becomes the canonical page of a merge.
    merged: AtomicBool,
    bytes: Mutex<Box<[u8; PAGE_SIZE]>>,
}

impl Frame {
    /// Allocates a fresh, zero-filled frame.
    pub fn alloc_zeroed() -> Self {
        Frame {
            inner: Arc::new(FrameInner {
                id: NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed),
                map_count: AtomicUsize::new(0),
                merged: AtomicBool::new(false),
                bytes: Mutex::new(Box::new([0u8; PAGE_SIZE])),
            }),
        }
    }

    /// A stable identity for the underlying page (the pfn analogue).
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Total number of references to this frame, pins included.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Number of leaf entries currently mapping this frame.
    pub fn map_count(&self) -> usize {
        self.inner.map_count.load(Ordering::Relaxed)
    }

    /// Whether this frame is the canonical page of a merge.
    pub fn is_merged(&self) -> bool {
        self.inner.merged.load(Ordering::Relaxed)
    }

    /// Marks this frame as a canonical merged page. Never cleared; the
    /// marker dies with the frame.
    pub(crate) fn set_merged(&self) {
        self.inner.merged.store(true, Ordering::Relaxed);
    }

    /// The `page_add_anon_rmap`/`page_add_ksm_rmap` contract.
    pub(crate) fn inc_map_count(&self) {
        self.inner.map_count.fetch_add(1, Ordering::Relaxed);
    }

    /// The `page_remove_rmap` contract.
    pub(crate) fn dec_map_count(&self) {
        let old = self.inner.map_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(old > 0);
    }

    /// Runs `f` over a scoped read mapping of the page bytes.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let bytes = self.inner.bytes.lock();
        f(&bytes[..])
    }

    /// Runs `f` over a scoped write mapping of the page bytes.
    pub(crate) fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut bytes = self.inner.bytes.lock();
        f(&mut bytes[..])
    }

    /// Copies the full contents of `src` into this frame.
    pub(crate) fn copy_from(&self, src: &Frame) {
        debug_assert_ne!(self.id(), src.id());
        // Two distinct frames; lock in id order to stay deadlock-free
        // against concurrent comparisons.
        if self.id() < src.id() {
            let mut dst = self.inner.bytes.lock();
            let src = src.inner.bytes.lock();
            dst.copy_from_slice(&src[..]);
        } else {
            let src_bytes = src.inner.bytes.lock();
            let mut dst = self.inner.bytes.lock();
            dst.copy_from_slice(&src_bytes[..]);
        }
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Frame {}

impl Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id())
            .field("map_count", &self.map_count())
            .field("merged", &self.is_merged())
            .finish()
    }
}
