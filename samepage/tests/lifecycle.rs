// SPDX-License-Identifier: MPL-2.0

//! Enrollment lifecycle, run-mode transitions and the background worker.

mod common;

use std::time::Duration;

use common::{engine, read_page, run_pass, space_with_pages, BASE};
use samepage::{Advice, AddrSpace, Errno, RegionFlags, PAGE_SIZE};

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..5000 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn worker_parks_until_work_arrives() {
    let (ksm, host) = engine();
    ksm.write_attr("run", "1").unwrap();

    let worker = {
        let ksm = ksm.clone();
        std::thread::spawn(move || samepage::ksmd(&ksm))
    };

    // Nothing is enrolled: the worker must end up on the wait condition.
    wait_until("the worker to park", || host.park_count() >= 1);
    assert_eq!(ksm.full_scans(), 0);

    // Enrolling the first space wakes it; it then merges on its own.
    let a = space_with_pages(&[0x41]);
    let b = space_with_pages(&[0x41]);
    ksm.advise(&a, BASE..BASE + PAGE_SIZE, Advice::Mergeable).unwrap();
    ksm.advise(&b, BASE..BASE + PAGE_SIZE, Advice::Mergeable).unwrap();
    wait_until("the pages to merge", || ksm.pages_shared() == 1);

    host.request_stop();
    worker.join().unwrap();
}

#[test]
fn signal_during_unmerge_reverts_to_stop() {
    let (ksm, host) = engine();
    let a = space_with_pages(&[0x41]);
    let b = space_with_pages(&[0x41]);
    ksm.advise(&a, BASE..BASE + PAGE_SIZE, Advice::Mergeable).unwrap();
    ksm.advise(&b, BASE..BASE + PAGE_SIZE, Advice::Mergeable).unwrap();
    ksm.write_attr("run", "1").unwrap();
    run_pass(&ksm);
    run_pass(&ksm);
    assert_eq!(ksm.pages_shared(), 1);

    host.raise_signal();
    let err = ksm.write_attr("run", "2").unwrap_err();
    assert_eq!(err.error(), Errno::EINTR);
    // The interrupted transition reverts to stop and the partial state is
    // still consistent.
    assert_eq!(ksm.read_attr("run").unwrap(), "0");
    assert_eq!(ksm.pages_shared(), 1);
    assert_eq!(ksm.pages_sharing(), 1);

    host.clear_signal();
    ksm.write_attr("run", "2").unwrap();
    assert_eq!(ksm.pages_shared(), 0);
    assert_eq!(ksm.pages_sharing(), 0);
    assert_eq!(read_page(&a, BASE), vec![0x41u8; PAGE_SIZE]);
    assert_eq!(read_page(&b, BASE), vec![0x41u8; PAGE_SIZE]);
}

#[test]
fn exiting_space_is_reaped_and_its_partner_demoted() {
    let (ksm, _host) = engine();
    let a = space_with_pages(&[0x41]);
    let b = space_with_pages(&[0x41]);
    ksm.advise(&a, BASE..BASE + PAGE_SIZE, Advice::Mergeable).unwrap();
    ksm.advise(&b, BASE..BASE + PAGE_SIZE, Advice::Mergeable).unwrap();
    ksm.write_attr("run", "1").unwrap();
    run_pass(&ksm);
    run_pass(&ksm);
    assert_eq!(ksm.pages_shared(), 1);

    a.exit();
    ksm.on_exit(&a);

    // The scanner reaps the dead slot and, with the canonical page down to
    // a single mapping, demotes the surviving sharer back to private.
    run_pass(&ksm);
    assert_eq!(ksm.pages_shared(), 0);
    assert_eq!(ksm.pages_sharing(), 0);
    assert_eq!(read_page(&b, BASE), vec![0x41u8; PAGE_SIZE]);
    assert!(!b.follow_page(BASE).unwrap().is_merged());
}

#[test]
fn exit_before_scanning_frees_the_slot_immediately() {
    let (ksm, _host) = engine();
    let a = space_with_pages(&[0x09]);
    ksm.advise(&a, BASE..BASE + PAGE_SIZE, Advice::Mergeable).unwrap();

    a.exit();
    ksm.on_exit(&a);

    // The enrollment list is empty again: a batch finds nothing and no
    // pass ever starts.
    ksm.write_attr("run", "1").unwrap();
    ksm.scan(16);
    assert_eq!(ksm.full_scans(), 0);
    assert_eq!(ksm.pages_volatile(), 0);
}

#[test]
fn special_regions_are_silently_ignored() {
    let (ksm, _host) = engine();
    let special = AddrSpace::new();
    special
        .add_region(BASE, PAGE_SIZE, RegionFlags::SHARED)
        .unwrap();
    special.write(BASE, &[0x41u8; PAGE_SIZE]).unwrap();
    let plain = space_with_pages(&[0x41]);

    // Advice on a special-backed region reports success per convention but
    // enrolls nothing.
    ksm.advise(&special, BASE..BASE + PAGE_SIZE, Advice::Mergeable).unwrap();
    ksm.advise(&plain, BASE..BASE + PAGE_SIZE, Advice::Mergeable).unwrap();
    ksm.write_attr("run", "1").unwrap();
    run_pass(&ksm);
    run_pass(&ksm);

    // Only the plain space is tracked, so nothing could merge.
    assert_eq!(ksm.pages_volatile(), 1);
    assert_eq!(ksm.pages_shared(), 0);
    assert!(!special.follow_page(BASE).unwrap().is_merged());
}
