//! Vendor and device names from the pci.ids database
//!
//! Nothing is read at construction. The first lookup for a vendor scans the
//! database for that vendor only and keeps the result for the life of the
//! [`NameDb`]. Lookups that find nothing are retried on the next call.

mod source;
mod tree;

use std::path::PathBuf;

use pciaccess_backend::MATCH_ANY;

use crate::device::DeviceHandle;
use crate::iter::IdMatch;
use crate::session::Session;

use source::Source;
use tree::NameTree;

#[inline]
fn id_matches(want: u32, have: u32) -> bool {
    want == MATCH_ANY || want == have
}

/// All four names for one device identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PciStrings {
    pub device: Option<String>,
    pub vendor: Option<String>,
    pub subdevice: Option<String>,
    pub subvendor: Option<String>,
}

/// Lazily loaded name database
#[derive(Debug)]
pub struct NameDb {
    source: Source,
    tree: NameTree,
}

impl NameDb {
    /// Database read from the first readable file among `paths`
    pub fn new(paths: Vec<PathBuf>) -> Self {
        NameDb {
            source: Source::Paths(paths),
            tree: NameTree::new(),
        }
    }

    /// Database backed by pci.ids text already in memory
    pub fn from_text(text: impl Into<Vec<u8>>) -> Self {
        NameDb {
            source: Source::Text(text.into()),
            tree: NameTree::new(),
        }
    }

    /// Name of `vendor`; the wildcard never names anything
    pub fn vendor_name(&mut self, vendor: u32) -> Option<&str> {
        let vendor = u16::try_from(vendor).ok()?;
        let leaf = self.tree.insert(vendor);
        if leaf.name.is_none() {
            self.source.populate(leaf, false);
        }
        leaf.name.as_deref()
    }

    /// Name of the first database entry matching `m`
    ///
    /// Plain device lines carry wildcard subsystem IDs, so they only match
    /// a query whose subsystem fields are wildcards too.
    pub fn device_name(&mut self, m: &IdMatch) -> Option<&str> {
        let vendor = u16::try_from(m.vendor_id).ok()?;
        let leaf = self.tree.insert(vendor);
        if leaf.devices.is_empty() {
            self.source.populate(leaf, true);
        }

        leaf.devices
            .iter()
            .find(|d| {
                id_matches(m.device_id, u32::from(d.device_id))
                    && id_matches(m.subvendor_id, d.subvendor_id)
                    && id_matches(m.subdevice_id, d.subdevice_id)
            })
            .map(|d| d.name.as_str())
    }

    /// Device, vendor, subdevice and subvendor names for `m`
    pub fn strings(&mut self, m: &IdMatch) -> PciStrings {
        let mut plain = *m;
        plain.subvendor_id = MATCH_ANY;
        plain.subdevice_id = MATCH_ANY;

        PciStrings {
            device: self.device_name(&plain).map(str::to_owned),
            vendor: self.vendor_name(m.vendor_id).map(str::to_owned),
            subdevice: self.device_name(m).map(str::to_owned),
            subvendor: self.vendor_name(m.subvendor_id).map(str::to_owned),
        }
    }

    /// Forget everything loaded so far
    pub fn clear(&mut self) {
        self.tree.clear();
    }
}

impl Session {
    /// Marketing name of the device's vendor/device pair
    pub fn device_name(&mut self, handle: DeviceHandle) -> Option<&str> {
        let device = self.device(handle).ok()?;
        let m = IdMatch::new(
            u32::from(device.vendor_id),
            u32::from(device.device_id),
            MATCH_ANY,
            MATCH_ANY,
        );
        self.names_mut().device_name(&m)
    }

    pub fn vendor_name(&mut self, handle: DeviceHandle) -> Option<&str> {
        let vendor = u32::from(self.device(handle).ok()?.vendor_id);
        self.names_mut().vendor_name(vendor)
    }

    /// Subsystem name, `None` when the device reports no subsystem IDs
    pub fn subdevice_name(&mut self, handle: DeviceHandle) -> Option<&str> {
        let device = self.device(handle).ok()?;
        if device.subvendor_id == 0 || device.subdevice_id == 0 {
            return None;
        }
        let m = IdMatch::for_device(device);
        self.names_mut().device_name(&m)
    }

    /// Subsystem vendor name, `None` when no subsystem vendor is reported
    pub fn subvendor_name(&mut self, handle: DeviceHandle) -> Option<&str> {
        let subvendor = self.device(handle).ok()?.subvendor_id;
        if subvendor == 0 {
            return None;
        }
        self.names_mut().vendor_name(u32::from(subvendor))
    }

    /// All four names for an arbitrary identity
    pub fn strings(&mut self, m: &IdMatch) -> PciStrings {
        self.names_mut().strings(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDS: &str = "\
1002  Advanced Micro Devices, Inc. [AMD/ATI]
\t6798  Tahiti XT
\t\t1043 0444  HD 7970 DirectCU II
1043  ASUSTeK Computer Inc.
8086  Intel Corporation
\t100e  82540EM Gigabit Ethernet Controller
";

    #[test]
    fn test_vendor_and_device_names() {
        let mut db = NameDb::from_text(IDS);
        assert_eq!(db.vendor_name(0x1002), Some("Advanced Micro Devices, Inc. [AMD/ATI]"));
        assert_eq!(db.vendor_name(0x8086), Some("Intel Corporation"));
        assert_eq!(db.vendor_name(0x10de), None);
        assert_eq!(db.vendor_name(MATCH_ANY), None);

        let m = IdMatch::new(0x8086, 0x100e, MATCH_ANY, MATCH_ANY);
        assert_eq!(db.device_name(&m), Some("82540EM Gigabit Ethernet Controller"));

        let m = IdMatch::new(0x8086, 0x1234, MATCH_ANY, MATCH_ANY);
        assert_eq!(db.device_name(&m), None);
    }

    #[test]
    fn test_tab_separated_device_line() {
        let mut db =
            NameDb::from_text("1002  Advanced Micro Devices, Inc. [AMD/ATI]\n\t6798\tTahiti XT\n");

        let m = IdMatch::new(0x1002, 0x6798, MATCH_ANY, MATCH_ANY);
        assert_eq!(db.device_name(&m), Some("Tahiti XT"));
        assert_eq!(db.vendor_name(0x1002), Some("Advanced Micro Devices, Inc. [AMD/ATI]"));

        let m = IdMatch::new(0x1002, 0x9999, MATCH_ANY, MATCH_ANY);
        assert_eq!(db.device_name(&m), None);
        assert_eq!(db.vendor_name(0x1002), Some("Advanced Micro Devices, Inc. [AMD/ATI]"));
    }

    #[test]
    fn test_strings_composes_lookups() {
        let mut db = NameDb::from_text(IDS);
        let strings = db.strings(&IdMatch::new(0x1002, 0x6798, 0x1043, 0x0444));
        assert_eq!(
            strings,
            PciStrings {
                device: Some("Tahiti XT".into()),
                vendor: Some("Advanced Micro Devices, Inc. [AMD/ATI]".into()),
                subdevice: Some("HD 7970 DirectCU II".into()),
                subvendor: Some("ASUSTeK Computer Inc.".into()),
            }
        );

        // No subsystem entry for this pair
        let strings = db.strings(&IdMatch::new(0x1002, 0x6798, 0x1043, 0x9999));
        assert_eq!(strings.device.as_deref(), Some("Tahiti XT"));
        assert_eq!(strings.subdevice, None);
    }

    #[test]
    fn test_vendor_lookup_then_device_lookup() {
        let mut db = NameDb::from_text(IDS);
        // Vendor-only scan leaves the device list empty, so the device
        // lookup still loads it
        assert!(db.vendor_name(0x1002).is_some());
        let m = IdMatch::new(0x1002, 0x6798, MATCH_ANY, MATCH_ANY);
        assert_eq!(db.device_name(&m), Some("Tahiti XT"));
    }
}
