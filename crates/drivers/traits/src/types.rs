//! Device, region and capability records
//!
//! Shared between the core library and every platform backend. Backends
//! fill these in during enumeration and probing; the core only reads them
//! back, apart from the legacy mapping pointer cached in each [`Region`].

use core::fmt;
use core::ptr::NonNull;

use bitflags::bitflags;

/// Wildcard value accepted by every field of a slot or ID match
pub const MATCH_ANY: u32 = u32::MAX;

/// Number of base address registers in a type 0 header
pub const NUM_REGIONS: usize = 6;

/// PCI function address (domain:bus:device.function)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PciSlot {
    pub domain: u32,
    pub bus: u8,
    pub dev: u8,
    pub func: u8,
}

impl PciSlot {
    pub const fn new(domain: u32, bus: u8, dev: u8, func: u8) -> Self {
        PciSlot { domain, bus, dev, func }
    }

    /// Parse the `dddd:bb:dd.f` form used by sysfs and the VGA arbiter
    pub fn parse(s: &str) -> Option<Self> {
        let (domain, rest) = s.trim().split_once(':')?;
        let (bus, rest) = rest.split_once(':')?;
        let (dev, func) = rest.split_once('.')?;

        let dev = u8::from_str_radix(dev, 16).ok()?;
        let func = u8::from_str_radix(func, 16).ok()?;
        if dev > 31 || func > 7 {
            return None;
        }

        Some(PciSlot {
            domain: u32::from_str_radix(domain, 16).ok()?,
            bus: u8::from_str_radix(bus, 16).ok()?,
            dev,
            func,
        })
    }
}

impl fmt::Display for PciSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:02x}:{:02x}.{:x}", self.domain, self.bus, self.dev, self.func)
    }
}

bitflags! {
    /// Flags accepted by the range mapping calls
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MapFlags: u32 {
        /// Map the range read/write instead of read-only
        const WRITABLE = 1 << 0;
        /// Request write-combined caching where the platform offers it
        const WRITE_COMBINE = 1 << 1;
        /// Request cacheable access
        const CACHEABLE = 1 << 2;
    }
}

bitflags! {
    /// Legacy VGA resources a device decodes, as reported by the arbiter
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VgaRsrc: u32 {
        const LEGACY_IO = 0x01;
        const LEGACY_MEM = 0x02;
        const NORMAL_IO = 0x04;
        const NORMAL_MEM = 0x08;
    }
}

impl VgaRsrc {
    /// Arbiter wire spelling of the legacy part of this set
    pub fn as_wire_str(&self) -> &'static str {
        let legacy = *self & (VgaRsrc::LEGACY_IO | VgaRsrc::LEGACY_MEM);
        if legacy == VgaRsrc::LEGACY_IO | VgaRsrc::LEGACY_MEM {
            "io+mem"
        } else if legacy == VgaRsrc::LEGACY_IO {
            "io"
        } else if legacy == VgaRsrc::LEGACY_MEM {
            "mem"
        } else {
            "none"
        }
    }
}

/// One base address register as seen by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    /// CPU-visible base address
    pub base_addr: u64,
    /// Address the device decodes on its own bus
    pub bus_addr: u64,
    /// Size in bytes, 0 when the BAR is unimplemented
    pub size: u64,
    pub is_io: bool,
    pub is_prefetchable: bool,
    pub is_64: bool,
    /// Whole-BAR mapping created through the single-region API
    pub memory: Option<NonNull<u8>>,
}

impl Region {
    /// First address past the end of the BAR
    pub fn end(&self) -> u64 {
        self.base_addr.saturating_add(self.size)
    }

    /// Whether `addr` falls inside this (implemented) BAR
    pub fn contains(&self, addr: u64) -> bool {
        self.size != 0 && self.base_addr <= addr && addr < self.end()
    }
}

/// One active mapping of part of a BAR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub base: u64,
    pub size: u64,
    /// Index of the BAR that contains `base`
    pub region: usize,
    pub flags: MapFlags,
    /// Virtual address, `None` until the backend has mapped it
    pub memory: Option<NonNull<u8>>,
}

/// Complete record for one PCI function
#[derive(Debug, Clone, Default)]
pub struct PciDevice {
    /// Low 16 bits of `domain`, kept for callers of the older layout
    pub domain_16: u16,
    pub bus: u8,
    pub dev: u8,
    pub func: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub subvendor_id: u16,
    pub subdevice_id: u16,
    /// Class, subclass and programming interface packed as 0xCCSSPP
    pub device_class: u32,
    pub revision: u8,
    pub regions: [Region; NUM_REGIONS],
    /// Expansion ROM size in bytes, 0 when absent
    pub rom_size: u64,
    /// Interrupt line, -1 when unknown
    pub irq: i32,
    /// Opaque value owned by the caller
    pub user_data: usize,
    /// Legacy VGA resources this device currently decodes
    pub vgaarb_rsrc: VgaRsrc,
    pub domain: u32,
    pub rom_base: u64,
    /// Header type without the multi-function bit, valid once probed
    pub header_type: u8,
    pub probed: bool,
}

impl PciDevice {
    /// Empty record for the function at `slot`
    pub fn new(slot: PciSlot) -> Self {
        PciDevice {
            domain_16: slot.domain.min(0xffff) as u16,
            bus: slot.bus,
            dev: slot.dev,
            func: slot.func,
            domain: slot.domain,
            irq: -1,
            ..Default::default()
        }
    }

    pub fn slot(&self) -> PciSlot {
        PciSlot::new(self.domain, self.bus, self.dev, self.func)
    }

    pub fn class(&self) -> u8 {
        ((self.device_class >> 16) & 0xff) as u8
    }

    pub fn subclass(&self) -> u8 {
        ((self.device_class >> 8) & 0xff) as u8
    }

    pub fn prog_if(&self) -> u8 {
        (self.device_class & 0xff) as u8
    }
}

/// Decoded AGP capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AgpInfo {
    /// Config-space offset of the capability header
    pub config_offset: u8,
    pub major_version: u8,
    pub minor_version: u8,
    /// Supported transfer rates: bit 0 = 1x, 1 = 2x, 2 = 4x, 3 = 8x
    pub rates: u8,
    pub fast_writes: bool,
    pub addr64: bool,
    pub htrans: bool,
    pub gart64: bool,
    pub coherent: bool,
    pub sideband: bool,
    pub isochronous: bool,
    pub async_req_size: u8,
    pub calibration_cycle_timing: u8,
    pub max_requests: u16,
}

/// PCI-to-PCI bridge (header type 1) windows and bus numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PciBridgeInfo {
    pub primary_bus: u8,
    pub secondary_bus: u8,
    pub subordinate_bus: u8,
    pub secondary_latency_timer: u8,

    pub io_type: u8,
    pub mem_type: u8,
    pub prefetch_mem_type: u8,

    pub secondary_status: u16,
    pub bridge_control: u16,

    pub io_base: u32,
    pub io_limit: u32,

    pub mem_base: u32,
    pub mem_limit: u32,

    pub prefetch_mem_base: u64,
    pub prefetch_mem_limit: u64,
}

/// One CardBus window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BridgeWindow {
    pub base: u32,
    pub limit: u32,
}

/// PCI-to-CardBus bridge (header type 2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CardbusBridgeInfo {
    pub primary_bus: u8,
    pub card_bus: u8,
    pub subordinate_bus: u8,
    pub cardbus_latency_timer: u8,

    pub secondary_status: u16,
    pub bridge_control: u16,

    pub io: [BridgeWindow; 2],
    pub mem: [BridgeWindow; 2],
}

/// Open handle onto a range of I/O ports
#[derive(Debug)]
pub struct IoHandle {
    /// First port (or BAR-relative address) covered by the handle
    pub base: u64,
    pub size: u64,
    /// Opened through the legacy (non-BAR) path
    pub is_legacy: bool,
    /// Index of the BAR backing the handle, `None` for legacy handles
    pub bar: Option<usize>,
    /// Backend-owned file for platforms that do port I/O through a file
    pub file: Option<std::fs::File>,
}

impl IoHandle {
    pub fn new(base: u64, size: u64) -> Self {
        IoHandle {
            base,
            size,
            is_legacy: false,
            bar: None,
            file: None,
        }
    }

    /// Whether an access of `width` bytes at `reg` stays inside the handle
    pub fn in_range(&self, reg: u32, width: u64) -> bool {
        u64::from(reg) + width <= self.size
    }
}

/// PCI class codes used by the core
pub mod pci_class {
    /// Display controller
    pub const DISPLAY: u8 = 0x03;
    /// VGA compatible (subclass of DISPLAY)
    pub const VGA: u8 = 0x00;
    /// Bridge device
    pub const BRIDGE: u8 = 0x06;
    /// Host bridge (subclass of BRIDGE)
    pub const BRIDGE_HOST: u8 = 0x00;
    /// ISA bridge
    pub const BRIDGE_ISA: u8 = 0x01;
    /// EISA bridge
    pub const BRIDGE_EISA: u8 = 0x02;
    /// MicroChannel bridge
    pub const BRIDGE_MC: u8 = 0x03;
    /// PCI-to-PCI bridge
    pub const BRIDGE_PCI: u8 = 0x04;
    /// PCI-to-CardBus bridge
    pub const BRIDGE_CARDBUS: u8 = 0x07;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_parse_and_display() {
        let slot = PciSlot::parse("0001:02:1f.7").unwrap();
        assert_eq!(slot, PciSlot::new(1, 2, 0x1f, 7));
        assert_eq!(slot.to_string(), "0001:02:1f.7");

        assert!(PciSlot::parse("0000:00:20.0").is_none());
        assert!(PciSlot::parse("0000:00.0").is_none());
        assert!(PciSlot::parse("garbage").is_none());
    }

    #[test]
    fn test_region_contains() {
        let region = Region {
            base_addr: 0x1000,
            size: 0x100,
            ..Default::default()
        };
        assert!(region.contains(0x1000));
        assert!(region.contains(0x10ff));
        assert!(!region.contains(0x1100));
        assert!(!Region::default().contains(0));
    }

    #[test]
    fn test_device_class_fields() {
        let mut dev = PciDevice::new(PciSlot::new(0x1_0000, 3, 0, 1));
        dev.device_class = 0x060400;
        assert_eq!(dev.class(), 0x06);
        assert_eq!(dev.subclass(), 0x04);
        assert_eq!(dev.prog_if(), 0x00);
        assert_eq!(dev.irq, -1);
        assert_eq!(dev.domain_16, 0xffff);
    }

    #[test]
    fn test_vga_rsrc_wire_str() {
        assert_eq!((VgaRsrc::LEGACY_IO | VgaRsrc::LEGACY_MEM).as_wire_str(), "io+mem");
        assert_eq!(VgaRsrc::LEGACY_IO.as_wire_str(), "io");
        assert_eq!(VgaRsrc::LEGACY_MEM.as_wire_str(), "mem");
        assert_eq!(VgaRsrc::empty().as_wire_str(), "none");
    }
}
