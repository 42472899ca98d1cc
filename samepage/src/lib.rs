// SPDX-License-Identifier: MPL-2.0

//! A samepage-merging engine.
//!
//! The engine discovers pages with byte-identical contents across enrolled
//! address spaces and collapses each equivalence class onto one shared,
//! write-protected canonical page; a later write to any merged site faults
//! and receives a private copy again.
//!
//! Because page contents may change at any moment, candidates cannot simply
//! be kept sorted in one tree. The engine keeps two:
//!
//! - The *stable tree* holds the canonical pages of completed merges. They
//!   are write-protected, so their ordering cannot rot and lookups in this
//!   tree can be trusted (a node is dropped only when its page is reclaimed).
//! - The *unstable tree* holds candidates whose contents were unchanged
//!   since the previous pass, sorted by their current bytes. It is not
//!   write-protected and may be silently invalidated by writes, so a hit
//!   there is only a hint: every merge re-verifies byte equality after
//!   write-protecting the source. The tree is abandoned wholesale at the end
//!   of every full pass and rebuilt from scratch.
//!
//! A single background worker drives the scan in bounded batches (see
//! [`ksm::ksmd`]); operators steer it through a small set of named
//! attributes (`run`, `pages_to_scan`, `sleep_millisecs`, ...).
//!
//! The [`vm`] module provides the in-process virtual-memory substrate the
//! engine operates on: reference-counted frames, address spaces with region
//! lists and leaf page tables, and the fault logic that breaks copy-on-write.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod error;
pub mod ksm;
pub mod vm;

pub(crate) mod prelude;

pub use error::{Errno, Error};
pub use ksm::{ksmd, Advice, Ksm, KsmdHost, RunMode};
pub use vm::{AddrSpace, Frame, RegionFlags, Vaddr, PAGE_SIZE};
