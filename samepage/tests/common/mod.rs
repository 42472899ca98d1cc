// SPDX-License-Identifier: MPL-2.0

//! Shared fixtures: a std-backed scheduler host and address-space builders.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use samepage::{AddrSpace, Ksm, KsmdHost, RegionFlags, Vaddr, PAGE_SIZE};

/// Base address used by most fixtures.
pub const BASE: Vaddr = 0x10000;

pub struct TestHost {
    stop: AtomicBool,
    signal: AtomicBool,
    parked: AtomicUsize,
    lock: Mutex<()>,
    cond: Condvar,
}

impl TestHost {
    pub fn new() -> Arc<Self> {
        Arc::new(TestHost {
            stop: AtomicBool::new(false),
            signal: AtomicBool::new(false),
            parked: AtomicUsize::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        })
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub fn raise_signal(&self) {
        self.signal.store(true, Ordering::SeqCst);
    }

    pub fn clear_signal(&self) {
        self.signal.store(false, Ordering::SeqCst);
    }

    /// How many times the worker parked on the wait condition.
    pub fn park_count(&self) -> usize {
        self.parked.load(Ordering::SeqCst)
    }
}

impl KsmdHost for TestHost {
    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn sleep_ms(&self, ms: u32) {
        // Keep test turnaround short; the engine only needs "some" delay.
        std::thread::sleep(Duration::from_millis(ms.min(2) as u64));
    }

    fn wait_for_work(&self, work_ready: &dyn Fn() -> bool) {
        self.parked.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.lock.lock().unwrap();
        while !work_ready() {
            let (g, _) = self
                .cond
                .wait_timeout(guard, Duration::from_millis(1))
                .unwrap();
            guard = g;
        }
    }

    fn wake(&self) {
        self.cond.notify_all();
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn signal_pending(&self) -> bool {
        self.signal.load(Ordering::SeqCst)
    }
}

pub fn engine() -> (Arc<Ksm>, Arc<TestHost>) {
    let host = TestHost::new();
    (Ksm::new(host.clone()), host)
}

/// A space with one anonymous region at [`BASE`] already filled with
/// `npages` pages of the given byte patterns.
pub fn space_with_pages(fills: &[u8]) -> Arc<AddrSpace> {
    let space = AddrSpace::new();
    space
        .add_region(BASE, fills.len() * PAGE_SIZE, RegionFlags::empty())
        .unwrap();
    for (at, fill) in fills.iter().enumerate() {
        space
            .write(BASE + at * PAGE_SIZE, &[*fill; PAGE_SIZE])
            .unwrap();
    }
    space
}

/// A copy-on-write duplicate of `space`: both sides map the very same
/// frames until one of them writes. The fork-style way one physical page
/// ends up visible at two virtual sites.
pub fn forked(space: &Arc<AddrSpace>) -> Arc<AddrSpace> {
    space.fork()
}

pub fn read_page(space: &AddrSpace, addr: Vaddr) -> Vec<u8> {
    let mut buf = vec![0u8; PAGE_SIZE];
    space.read(addr, &mut buf).unwrap();
    buf
}

/// Drives the scanner through one complete pass (until `full_scans` moves).
pub fn run_pass(ksm: &Ksm) {
    let target = ksm.full_scans() + 1;
    for _ in 0..10_000 {
        if ksm.full_scans() >= target {
            return;
        }
        ksm.scan(64);
    }
    panic!("scan never completed a full pass");
}
