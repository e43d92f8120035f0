//! Bridge header decoding and topology
//!
//! Header type is only known once a device has been probed, so every
//! lookup here probes first if needed. Decoded headers are cached on the
//! device; a failed decode is retried on the next call.

use pciaccess_backend::{
    pci_class, BridgeWindow, CardbusBridgeInfo, PciBridgeInfo, PciError, PciResult,
};

use crate::byteorder::{read_u16_at, read_u32_at};
use crate::device::{BridgeInfo, DeviceHandle};
use crate::iter::{DeviceIterator, IdMatch};
use crate::session::Session;

/// Bytes of config space covering both bridge header layouts
pub const BRIDGE_HEADER_LEN: usize = 0x40;

/// Header type of a PCI-to-PCI bridge
pub const HEADER_TYPE_PCI_BRIDGE: u8 = 0x01;
/// Header type of a PCI-to-CardBus bridge
pub const HEADER_TYPE_CARDBUS: u8 = 0x02;

/// Decode a type 1 header
pub fn decode_pci_bridge(buf: &[u8; BRIDGE_HEADER_LEN]) -> PciBridgeInfo {
    let io_base = (u32::from(buf[0x1c] & 0xf0) << 8)
        | (u32::from(read_u16_at(buf, 0x30)) << 16);
    let io_limit = 0x0fff
        + ((u32::from(buf[0x1d] & 0xf0) << 8) | (u32::from(read_u16_at(buf, 0x32)) << 16));

    let mem_base = u32::from(read_u16_at(buf, 0x20) & 0xfff0) << 16;
    let mem_limit = 0xffff + (u32::from(read_u16_at(buf, 0x22) & 0xfff0) << 16);

    let prefetch_mem_base = (u64::from(read_u16_at(buf, 0x24) & 0xfff0) << 16)
        | (u64::from(read_u32_at(buf, 0x28)) << 32);
    let prefetch_mem_limit = 0xffff
        + ((u64::from(read_u16_at(buf, 0x26) & 0xfff0) << 16)
            | (u64::from(read_u32_at(buf, 0x2c)) << 32));

    PciBridgeInfo {
        primary_bus: buf[0x18],
        secondary_bus: buf[0x19],
        subordinate_bus: buf[0x1a],
        secondary_latency_timer: buf[0x1b],
        io_type: buf[0x1c] & 0x0f,
        mem_type: buf[0x20] & 0x0f,
        prefetch_mem_type: buf[0x24] & 0x0f,
        secondary_status: read_u16_at(buf, 0x1e),
        bridge_control: read_u16_at(buf, 0x3e),
        io_base,
        io_limit,
        mem_base,
        mem_limit,
        prefetch_mem_base,
        prefetch_mem_limit,
    }
}

/// Decode a type 2 header
pub fn decode_cardbus_bridge(buf: &[u8; BRIDGE_HEADER_LEN]) -> CardbusBridgeInfo {
    let window = |offset: usize| BridgeWindow {
        base: read_u32_at(buf, offset),
        limit: read_u32_at(buf, offset + 4),
    };

    CardbusBridgeInfo {
        primary_bus: buf[0x18],
        card_bus: buf[0x19],
        subordinate_bus: buf[0x1a],
        cardbus_latency_timer: buf[0x1b],
        secondary_status: read_u16_at(buf, 0x16),
        bridge_control: read_u16_at(buf, 0x3e),
        mem: [window(0x1c), window(0x24)],
        io: [window(0x2c), window(0x34)],
    }
}

impl Session {
    /// Probe if necessary, then read and cache the bridge header
    fn load_bridge(&mut self, handle: DeviceHandle) -> Option<BridgeInfo> {
        if !self.device(handle).ok()?.info.probed {
            self.probe(handle).ok()?;
        }

        let (backend, device) = self.backend_and_device(handle).ok()?;
        if device.bridge.is_none() {
            let mut buf = [0u8; BRIDGE_HEADER_LEN];
            if backend.read(&device.info, &mut buf, 0).ok()? != BRIDGE_HEADER_LEN {
                return None;
            }
            device.bridge = match device.info.header_type & 0x7f {
                HEADER_TYPE_PCI_BRIDGE => Some(BridgeInfo::Pci(decode_pci_bridge(&buf))),
                HEADER_TYPE_CARDBUS => Some(BridgeInfo::Cardbus(decode_cardbus_bridge(&buf))),
                _ => None,
            };
        }
        device.bridge
    }

    /// PCI-to-PCI bridge windows, `None` for anything else
    pub fn bridge_info(&mut self, handle: DeviceHandle) -> Option<PciBridgeInfo> {
        match self.load_bridge(handle)? {
            BridgeInfo::Pci(info) => Some(info),
            BridgeInfo::Cardbus(_) => None,
        }
    }

    /// PCI-to-CardBus bridge windows, `None` for anything else
    pub fn cardbus_bridge_info(&mut self, handle: DeviceHandle) -> Option<CardbusBridgeInfo> {
        match self.load_bridge(handle)? {
            BridgeInfo::Cardbus(info) => Some(info),
            BridgeInfo::Pci(_) => None,
        }
    }

    /// (primary, secondary, subordinate) bus numbers of a bridge
    ///
    /// Bridges that do not forward to a numbered PCI bus report their own
    /// bus and -1 for the rest. For host bridges this is only an
    /// approximation: the buses behind them are not described anywhere in
    /// config space. Fails with `NoDevice` for non-bridges.
    pub fn bridge_buses(&mut self, handle: DeviceHandle) -> PciResult<(i32, i32, i32)> {
        let device = self.device(handle)?;
        if device.class() != pci_class::BRIDGE {
            return Err(PciError::NoDevice);
        }

        let own_bus = (i32::from(device.bus), -1, -1);
        let buses = match device.subclass() {
            pci_class::BRIDGE_PCI => match self.load_bridge(handle) {
                Some(BridgeInfo::Pci(info)) => (
                    i32::from(info.primary_bus),
                    i32::from(info.secondary_bus),
                    i32::from(info.subordinate_bus),
                ),
                _ => own_bus,
            },
            pci_class::BRIDGE_CARDBUS => match self.load_bridge(handle) {
                Some(BridgeInfo::Cardbus(info)) => (
                    i32::from(info.primary_bus),
                    i32::from(info.card_bus),
                    i32::from(info.subordinate_bus),
                ),
                _ => own_bus,
            },
            // Host, ISA, EISA, MicroChannel and anything unrecognised
            _ => own_bus,
        };

        Ok(buses)
    }

    /// PCI-to-PCI bridge whose secondary bus is the device's bus
    ///
    /// Linear in the number of devices; PCI topologies are small.
    pub fn parent_bridge(&mut self, handle: DeviceHandle) -> Option<DeviceHandle> {
        let (domain, bus) = {
            let device = self.device(handle).ok()?;
            (device.domain, device.bus)
        };

        let bridges = IdMatch::class(
            (u32::from(pci_class::BRIDGE) << 16) | (u32::from(pci_class::BRIDGE_PCI) << 8),
            0x00ff_ff00,
        );
        let mut iter = DeviceIterator::id(bridges);

        while let Some(candidate) = iter.next(self) {
            if self.device(candidate).ok()?.domain != domain {
                continue;
            }
            if let Some(info) = self.bridge_info(candidate) {
                if info.secondary_bus == bus {
                    return Some(candidate);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pci_bridge_header() -> [u8; BRIDGE_HEADER_LEN] {
        let mut buf = [0u8; BRIDGE_HEADER_LEN];
        buf[0x0e] = 0x01;
        buf[0x18] = 0x00;
        buf[0x19] = 0x01;
        buf[0x1a] = 0x03;
        buf[0x1b] = 0x20;
        // 32-bit I/O window 0x1000..0x2fff with upper halves 0x0001
        buf[0x1c] = 0x11;
        buf[0x1d] = 0x21;
        buf[0x30] = 0x01;
        buf[0x32] = 0x01;
        // Memory window 0xf000_0000..0xf7ff_ffff
        buf[0x20..0x22].copy_from_slice(&0xf000u16.to_le_bytes());
        buf[0x22..0x24].copy_from_slice(&0xf7f0u16.to_le_bytes());
        // 64-bit prefetchable window 0x1_c000_0000..0x1_dfff_ffff
        buf[0x24..0x26].copy_from_slice(&0xc001u16.to_le_bytes());
        buf[0x26..0x28].copy_from_slice(&0xdff1u16.to_le_bytes());
        buf[0x28..0x2c].copy_from_slice(&1u32.to_le_bytes());
        buf[0x2c..0x30].copy_from_slice(&1u32.to_le_bytes());
        buf[0x1e..0x20].copy_from_slice(&0x2280u16.to_le_bytes());
        buf[0x3e..0x40].copy_from_slice(&0x0008u16.to_le_bytes());
        buf
    }

    #[test]
    fn test_decode_pci_bridge() {
        let info = decode_pci_bridge(&pci_bridge_header());
        assert_eq!((info.primary_bus, info.secondary_bus, info.subordinate_bus), (0, 1, 3));
        assert_eq!(info.secondary_latency_timer, 0x20);
        assert_eq!(info.io_type, 1);
        assert_eq!(info.io_base, 0x0001_1000);
        assert_eq!(info.io_limit, 0x0001_2fff);
        assert_eq!(info.mem_base, 0xf000_0000);
        assert_eq!(info.mem_limit, 0xf7ff_ffff);
        assert_eq!(info.prefetch_mem_type, 1);
        assert_eq!(info.prefetch_mem_base, 0x1_c000_0000);
        assert_eq!(info.prefetch_mem_limit, 0x1_dfff_ffff);
        assert_eq!(info.secondary_status, 0x2280);
        assert_eq!(info.bridge_control, 0x0008);
    }

    #[test]
    fn test_decode_cardbus_bridge() {
        let mut buf = [0u8; BRIDGE_HEADER_LEN];
        buf[0x18] = 0x00;
        buf[0x19] = 0x05;
        buf[0x1a] = 0x08;
        buf[0x1c..0x20].copy_from_slice(&0x1000_0000u32.to_le_bytes());
        buf[0x20..0x24].copy_from_slice(&0x13ff_f000u32.to_le_bytes());
        buf[0x24..0x28].copy_from_slice(&0x1400_0000u32.to_le_bytes());
        buf[0x28..0x2c].copy_from_slice(&0x17ff_f000u32.to_le_bytes());
        buf[0x2c..0x30].copy_from_slice(&0x4000u32.to_le_bytes());
        buf[0x30..0x34].copy_from_slice(&0x40fcu32.to_le_bytes());
        buf[0x34..0x38].copy_from_slice(&0x4400u32.to_le_bytes());
        buf[0x38..0x3c].copy_from_slice(&0x44fcu32.to_le_bytes());

        let info = decode_cardbus_bridge(&buf);
        assert_eq!((info.primary_bus, info.card_bus, info.subordinate_bus), (0, 5, 8));
        assert_eq!(info.mem[0], BridgeWindow { base: 0x1000_0000, limit: 0x13ff_f000 });
        assert_eq!(info.mem[1], BridgeWindow { base: 0x1400_0000, limit: 0x17ff_f000 });
        assert_eq!(info.io[0], BridgeWindow { base: 0x4000, limit: 0x40fc });
        assert_eq!(info.io[1], BridgeWindow { base: 0x4400, limit: 0x44fc });
    }
}
