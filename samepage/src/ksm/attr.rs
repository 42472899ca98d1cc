// SPDX-License-Identifier: MPL-2.0

//! The flat, named attribute surface operators steer the engine with.

use alloc::format;

use super::{Ksm, RunMode};
use crate::prelude::*;

bitflags! {
    /// Properties and permissions of an engine attribute.
    pub struct AttrFlags: u8 {
        const CAN_READ = 1 << 0;
        const CAN_WRITE = 1 << 1;
    }
}

struct KsmAttr {
    name: &'static str,
    flags: AttrFlags,
    show: fn(&Ksm) -> String,
    /// Present on writable attributes; takes the already-parsed value.
    store: Option<fn(&Ksm, u64) -> Result<()>>,
}

const RO: AttrFlags = AttrFlags::CAN_READ;
const RW: AttrFlags = AttrFlags::from_bits_truncate(
    AttrFlags::CAN_READ.bits() | AttrFlags::CAN_WRITE.bits(),
);

fn show_sleep_millisecs(ksm: &Ksm) -> String {
    format!("{}", ksm.sleep_millisecs())
}

fn store_sleep_millisecs(ksm: &Ksm, value: u64) -> Result<()> {
    if value > u32::MAX as u64 {
        return_errno_with_message!(Errno::EINVAL, "sleep interval out of range");
    }
    ksm.set_sleep_millisecs(value as u32);
    Ok(())
}

fn show_pages_to_scan(ksm: &Ksm) -> String {
    format!("{}", ksm.pages_to_scan())
}

fn store_pages_to_scan(ksm: &Ksm, value: u64) -> Result<()> {
    if value > u32::MAX as u64 {
        return_errno_with_message!(Errno::EINVAL, "batch size out of range");
    }
    ksm.set_pages_to_scan(value as u32);
    Ok(())
}

fn show_run(ksm: &Ksm) -> String {
    format!("{}", ksm.run() as u32)
}

fn store_run(ksm: &Ksm, value: u64) -> Result<()> {
    ksm.set_run(RunMode::try_from(value)?)
}

fn show_max_kernel_pages(ksm: &Ksm) -> String {
    format!("{}", ksm.max_kernel_pages())
}

fn store_max_kernel_pages(ksm: &Ksm, value: u64) -> Result<()> {
    ksm.set_max_kernel_pages(value);
    Ok(())
}

fn show_pages_shared(ksm: &Ksm) -> String {
    format!("{}", ksm.pages_shared())
}

fn show_pages_sharing(ksm: &Ksm) -> String {
    format!("{}", ksm.pages_sharing())
}

fn show_pages_unshared(ksm: &Ksm) -> String {
    format!("{}", ksm.pages_unshared())
}

fn show_pages_volatile(ksm: &Ksm) -> String {
    format!("{}", ksm.pages_volatile())
}

fn show_full_scans(ksm: &Ksm) -> String {
    format!("{}", ksm.full_scans())
}

const ATTRS: &[KsmAttr] = &[
    KsmAttr {
        name: "sleep_millisecs",
        flags: RW,
        show: show_sleep_millisecs,
        store: Some(store_sleep_millisecs),
    },
    KsmAttr {
        name: "pages_to_scan",
        flags: RW,
        show: show_pages_to_scan,
        store: Some(store_pages_to_scan),
    },
    KsmAttr {
        name: "run",
        flags: RW,
        show: show_run,
        store: Some(store_run),
    },
    KsmAttr {
        name: "max_kernel_pages",
        flags: RW,
        show: show_max_kernel_pages,
        store: Some(store_max_kernel_pages),
    },
    KsmAttr {
        name: "pages_shared",
        flags: RO,
        show: show_pages_shared,
        store: None,
    },
    KsmAttr {
        name: "pages_sharing",
        flags: RO,
        show: show_pages_sharing,
        store: None,
    },
    KsmAttr {
        name: "pages_unshared",
        flags: RO,
        show: show_pages_unshared,
        store: None,
    },
    KsmAttr {
        name: "pages_volatile",
        flags: RO,
        show: show_pages_volatile,
        store: None,
    },
    KsmAttr {
        name: "full_scans",
        flags: RO,
        show: show_full_scans,
        store: None,
    },
];

fn lookup(name: &str) -> Result<&'static KsmAttr> {
    ATTRS
        .iter()
        .find(|attr| attr.name == name)
        .ok_or(Error::with_message(Errno::EINVAL, "no such attribute"))
}

impl Ksm {
    /// Names of every attribute, in display order.
    pub fn attr_names() -> impl Iterator<Item = &'static str> {
        ATTRS.iter().map(|attr| attr.name)
    }

    /// Reads the current value of a named attribute.
    pub fn read_attr(&self, name: &str) -> Result<String> {
        let attr = lookup(name)?;
        debug_assert!(attr.flags.contains(AttrFlags::CAN_READ));
        Ok((attr.show)(self))
    }

    /// Writes a named attribute. The value is parsed as a decimal `u64`
    /// (overflow rejected); a `run` write switching to unmerge completes
    /// the full unmerge before returning.
    pub fn write_attr(&self, name: &str, value: &str) -> Result<()> {
        let attr = lookup(name)?;
        let Some(store) = attr.store else {
            return_errno_with_message!(Errno::EINVAL, "attribute is read-only");
        };
        let value: u64 = value.trim().parse()?;
        store(self, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ksm::worker::KsmdHost;

    struct StubHost;

    impl KsmdHost for StubHost {
        fn sleep_ms(&self, _ms: u32) {}
        fn wait_for_work(&self, _work_ready: &dyn Fn() -> bool) {}
        fn wake(&self) {}
    }

    fn engine() -> Arc<Ksm> {
        Ksm::new(Arc::new(StubHost))
    }

    #[test]
    fn knobs_roundtrip() {
        let ksm = engine();
        assert_eq!(ksm.read_attr("sleep_millisecs").unwrap(), "20");
        assert_eq!(ksm.read_attr("pages_to_scan").unwrap(), "100");

        ksm.write_attr("sleep_millisecs", "250").unwrap();
        ksm.write_attr("pages_to_scan", " 64\n").unwrap();
        ksm.write_attr("max_kernel_pages", "4096").unwrap();
        assert_eq!(ksm.read_attr("sleep_millisecs").unwrap(), "250");
        assert_eq!(ksm.read_attr("pages_to_scan").unwrap(), "64");
        assert_eq!(ksm.read_attr("max_kernel_pages").unwrap(), "4096");
    }

    #[test]
    fn rejects_bad_values() {
        let ksm = engine();
        assert!(ksm.write_attr("sleep_millisecs", "oops").is_err());
        assert!(ksm.write_attr("sleep_millisecs", "-1").is_err());
        // Past u64: overflow is rejected at parse time.
        assert!(ksm
            .write_attr("max_kernel_pages", "99999999999999999999999999")
            .is_err());
        // Past u32: rejected by the range check.
        assert!(ksm.write_attr("pages_to_scan", "4294967296").is_err());
        assert!(ksm.write_attr("run", "3").is_err());
        assert!(ksm.write_attr("pages_shared", "1").is_err());
        assert!(ksm.write_attr("no_such_attr", "1").is_err());
        assert!(ksm.read_attr("no_such_attr").is_err());
    }

    #[test]
    fn run_mode_roundtrip() {
        let ksm = engine();
        assert_eq!(ksm.read_attr("run").unwrap(), "0");
        ksm.write_attr("run", "1").unwrap();
        assert_eq!(ksm.run(), RunMode::Merge);
        // Writing the current value is a no-op.
        ksm.write_attr("run", "1").unwrap();
        ksm.write_attr("run", "0").unwrap();
        assert_eq!(ksm.run(), RunMode::Stop);
    }

    #[test]
    fn lists_every_attribute() {
        let names: Vec<&str> = Ksm::attr_names().collect();
        for expected in [
            "sleep_millisecs",
            "pages_to_scan",
            "run",
            "max_kernel_pages",
            "pages_shared",
            "pages_sharing",
            "pages_unshared",
            "pages_volatile",
            "full_scans",
        ] {
            assert!(names.contains(&expected));
        }
    }
}
