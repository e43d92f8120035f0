//! Device iteration and matching
//!
//! Two flavours share the same scan: [`DeviceIterator`] keeps only a cursor
//! and borrows the session per step, so callers can probe or map devices
//! between steps; [`Devices`] borrows the session for its whole life and
//! plugs into ordinary iterator adaptors.

use pciaccess_backend::{PciDevice, MATCH_ANY};

use crate::device::{Device, DeviceHandle};
use crate::session::Session;

#[inline]
fn id_matches(want: u32, have: u32) -> bool {
    want == MATCH_ANY || want == have
}

/// Match on domain/bus/device/function, [`MATCH_ANY`] in any field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMatch {
    pub domain: u32,
    pub bus: u32,
    pub dev: u32,
    pub func: u32,
    /// Opaque value for the caller
    pub match_data: usize,
}

impl SlotMatch {
    pub const fn new(domain: u32, bus: u32, dev: u32, func: u32) -> Self {
        SlotMatch {
            domain,
            bus,
            dev,
            func,
            match_data: 0,
        }
    }

    /// Matches every slot
    pub const fn any() -> Self {
        SlotMatch::new(MATCH_ANY, MATCH_ANY, MATCH_ANY, MATCH_ANY)
    }

    pub fn matches(&self, dev: &PciDevice) -> bool {
        id_matches(self.domain, dev.domain)
            && id_matches(self.bus, u32::from(dev.bus))
            && id_matches(self.dev, u32::from(dev.dev))
            && id_matches(self.func, u32::from(dev.func))
    }
}

/// Match on vendor/device/subsystem IDs plus a masked class code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMatch {
    pub vendor_id: u32,
    pub device_id: u32,
    pub subvendor_id: u32,
    pub subdevice_id: u32,
    /// Required value of `device_class & device_class_mask`
    pub device_class: u32,
    pub device_class_mask: u32,
    /// Opaque value for the caller
    pub match_data: usize,
}

impl IdMatch {
    pub const fn new(vendor_id: u32, device_id: u32, subvendor_id: u32, subdevice_id: u32) -> Self {
        IdMatch {
            vendor_id,
            device_id,
            subvendor_id,
            subdevice_id,
            device_class: 0,
            device_class_mask: 0,
            match_data: 0,
        }
    }

    /// Matches every device
    pub const fn any() -> Self {
        IdMatch::new(MATCH_ANY, MATCH_ANY, MATCH_ANY, MATCH_ANY)
    }

    /// Every device whose class satisfies `(class & mask) == class_value`
    pub const fn class(class_value: u32, mask: u32) -> Self {
        let mut m = IdMatch::any();
        m.device_class = class_value;
        m.device_class_mask = mask;
        m
    }

    /// The exact identity of `dev`
    pub fn for_device(dev: &PciDevice) -> Self {
        IdMatch::new(
            u32::from(dev.vendor_id),
            u32::from(dev.device_id),
            u32::from(dev.subvendor_id),
            u32::from(dev.subdevice_id),
        )
    }

    pub fn matches(&self, dev: &PciDevice) -> bool {
        id_matches(self.vendor_id, u32::from(dev.vendor_id))
            && id_matches(self.device_id, u32::from(dev.device_id))
            && id_matches(self.subvendor_id, u32::from(dev.subvendor_id))
            && id_matches(self.subdevice_id, u32::from(dev.subdevice_id))
            && (dev.device_class & self.device_class_mask) == self.device_class
    }
}

/// Which devices an iterator yields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// Every device in table order
    Any,
    Slot(SlotMatch),
    Id(IdMatch),
}

impl Filter {
    pub fn matches(&self, dev: &PciDevice) -> bool {
        match self {
            Filter::Any => true,
            Filter::Slot(m) => m.matches(dev),
            Filter::Id(m) => m.matches(dev),
        }
    }
}

impl From<SlotMatch> for Filter {
    fn from(m: SlotMatch) -> Self {
        Filter::Slot(m)
    }
}

impl From<IdMatch> for Filter {
    fn from(m: IdMatch) -> Self {
        Filter::Id(m)
    }
}

/// Linear scan from `cursor`, returning the index of the first match and
/// leaving the cursor just past it
fn scan(devices: &[Device], cursor: &mut usize, filter: &Filter) -> Option<usize> {
    while *cursor < devices.len() {
        let index = *cursor;
        *cursor += 1;
        if filter.matches(&devices[index].info) {
            return Some(index);
        }
    }
    None
}

/// Detached cursor over a session's device table
///
/// Creating one does not look at the table. Each call to
/// [`DeviceIterator::next`] resumes the scan where the previous one stopped.
#[derive(Debug, Clone)]
pub struct DeviceIterator {
    filter: Filter,
    next_index: usize,
}

impl DeviceIterator {
    pub fn new(filter: Filter) -> Self {
        DeviceIterator {
            filter,
            next_index: 0,
        }
    }

    /// Yields every device
    pub fn any() -> Self {
        DeviceIterator::new(Filter::Any)
    }

    /// Yields devices at matching slots
    pub fn slot(m: SlotMatch) -> Self {
        DeviceIterator::new(Filter::Slot(m))
    }

    /// Yields devices with matching IDs and class
    pub fn id(m: IdMatch) -> Self {
        DeviceIterator::new(Filter::Id(m))
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Next matching device, `None` once the table is exhausted
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self, session: &Session) -> Option<DeviceHandle> {
        scan(session.device_table(), &mut self.next_index, &self.filter).map(DeviceHandle)
    }
}

/// Borrowing iterator over a session's devices
pub struct Devices<'a> {
    devices: &'a [Device],
    filter: Filter,
    next_index: usize,
}

impl<'a> Devices<'a> {
    pub(crate) fn new(devices: &'a [Device], filter: Filter) -> Self {
        Devices {
            devices,
            filter,
            next_index: 0,
        }
    }
}

impl<'a> Iterator for Devices<'a> {
    type Item = &'a Device;

    fn next(&mut self) -> Option<&'a Device> {
        let devices = self.devices;
        scan(devices, &mut self.next_index, &self.filter).map(|index| &devices[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pciaccess_backend::PciSlot;

    fn device(slot: PciSlot, vendor: u16, dev_id: u16, class: u32) -> PciDevice {
        let mut dev = PciDevice::new(slot);
        dev.vendor_id = vendor;
        dev.device_id = dev_id;
        dev.subvendor_id = 0x1028;
        dev.subdevice_id = 0x0001;
        dev.device_class = class;
        dev
    }

    #[test]
    fn test_slot_match_wildcards() {
        let dev = device(PciSlot::new(0, 1, 0, 0), 0x1002, 0x6798, 0x030000);

        assert!(SlotMatch::any().matches(&dev));
        assert!(SlotMatch::new(0, 1, MATCH_ANY, MATCH_ANY).matches(&dev));
        assert!(!SlotMatch::new(0, 2, MATCH_ANY, MATCH_ANY).matches(&dev));
        assert!(!SlotMatch::new(1, MATCH_ANY, MATCH_ANY, MATCH_ANY).matches(&dev));
    }

    #[test]
    fn test_id_match_class_mask() {
        let vga = device(PciSlot::new(0, 1, 0, 0), 0x1002, 0x6798, 0x030000);
        let bridge = device(PciSlot::new(0, 0, 1, 0), 0x8086, 0x0c01, 0x060400);

        let display = IdMatch::class(0x030000, 0xff0000);
        assert!(display.matches(&vga));
        assert!(!display.matches(&bridge));

        let amd = IdMatch::new(0x1002, MATCH_ANY, MATCH_ANY, MATCH_ANY);
        assert!(amd.matches(&vga));
        assert!(!amd.matches(&bridge));

        // Wildcard IDs with mask 0 behave like no filter at all
        assert!(IdMatch::any().matches(&vga));
        assert!(IdMatch::any().matches(&bridge));
    }

    #[test]
    fn test_scan_advances_past_match() {
        let devices: Vec<Device> = (0..4u8)
            .map(|i| {
                let class = if i % 2 == 0 { 0x030000 } else { 0x020000 };
                Device::new(
                    DeviceHandle(i as usize),
                    device(PciSlot::new(0, i, 0, 0), 0x8086, 0x100e, class),
                )
            })
            .collect();

        let filter = Filter::Id(IdMatch::class(0x030000, 0xff0000));
        let found: Vec<u8> = Devices::new(&devices, filter).map(|d| d.bus).collect();
        assert_eq!(found, vec![0, 2]);

        let mut cursor = 0;
        assert_eq!(scan(&devices, &mut cursor, &filter), Some(0));
        assert_eq!(cursor, 1);
        assert_eq!(scan(&devices, &mut cursor, &filter), Some(2));
        assert_eq!(scan(&devices, &mut cursor, &filter), None);
        assert_eq!(scan(&devices, &mut cursor, &filter), None);
    }
}
