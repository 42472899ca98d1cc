// SPDX-License-Identifier: MPL-2.0

//! The background worker loop and the scheduler contract it runs on.

use super::Ksm;
use crate::prelude::*;

/// Scheduling services the host supplies to the worker thread.
///
/// The engine also calls [`KsmdHost::wake`] from enrollment and run-mode
/// changes, [`KsmdHost::yield_now`] between pages, and
/// [`KsmdHost::signal_pending`] on the long unmerge walks.
pub trait KsmdHost: Send + Sync {
    /// Whether the worker thread has been asked to terminate.
    fn should_stop(&self) -> bool {
        false
    }

    /// Sleeps for `ms` milliseconds; spurious early returns are fine.
    fn sleep_ms(&self, ms: u32);

    /// Blocks until `work_ready` may have become true (or a stop was
    /// requested). Spurious wakeups are fine; the loop re-checks.
    fn wait_for_work(&self, work_ready: &dyn Fn() -> bool);

    /// Wakes every waiter blocked in [`KsmdHost::wait_for_work`].
    fn wake(&self);

    /// Cooperative-yield hint; must not be called under a spin lock.
    fn yield_now(&self) {}

    /// Whether the calling thread has a signal pending. Aborts the long
    /// unmerge walks with an interrupted status.
    fn signal_pending(&self) -> bool {
        false
    }
}

/// The worker loop. Runs scan batches while merging is on, sleeps the
/// configured interval in between, and parks on the wait condition while
/// there is nothing to scan.
pub fn ksmd(ksm: &Ksm) {
    info!("samepage scanner started");
    while !ksm.host.should_stop() {
        if ksm.merge_running() {
            ksm.scan(ksm.pages_to_scan() as usize);
        }
        if ksm.host.should_stop() {
            break;
        }
        if ksm.merge_running() {
            ksm.host.sleep_ms(ksm.sleep_millisecs());
        } else {
            ksm.host
                .wait_for_work(&|| ksm.merge_running() || ksm.host.should_stop());
        }
    }
    info!("samepage scanner stopped");
}
