//! PCI capability list
//!
//! Walks the linked list rooted at config offset 0x34. Only the AGP
//! capability is decoded; anything else is reported through the debug
//! output and skipped.
//!
//! # Reference
//! - PCI Local Bus Spec 3.0 §6.7 (Capability List)
//! - AGP 3.0 §2.5 (AGP status register)

use pciaccess_backend::{debug_caps, AgpInfo, Backend, PciDevice, PciError, PciResult};

use crate::cfg::{read_u16, read_u32, read_u8};
use crate::device::DeviceHandle;
use crate::session::Session;

/// Status register offset
pub const STATUS: u64 = 0x06;
/// Status bit: capability list present
pub const STATUS_CAP_LIST: u16 = 1 << 4;
/// Pointer to the first capability
pub const CAP_PTR: u64 = 0x34;
/// Capability ID: AGP
pub const CAP_ID_AGP: u8 = 0x02;

/// Capabilities start after the standard header
const CAP_MIN_OFFSET: u8 = 0x40;
/// 192 bytes of capability space hold at most 48 dword-aligned entries
const MAX_CAPS: usize = 48;

/// Decode the AGP status dword of a capability found at `config_offset`
pub fn decode_agp(config_offset: u8, version: u8, status: u32) -> AgpInfo {
    let major_version = (version & 0xf0) >> 4;
    let minor_version = version & 0x0f;

    let mut rates = (status & 0x07) as u8;
    // In AGP3 mode the same bits encode 4x/8x (and a reserved 16x)
    if major_version >= 3 && status & 0x08 != 0 {
        rates <<= 2;
    }
    // Some chipsets advertise 16x; there is no such rate
    rates &= 0x0f;

    AgpInfo {
        config_offset,
        major_version,
        minor_version,
        rates,
        fast_writes: status & 0x0010 != 0,
        addr64: status & 0x0020 != 0,
        htrans: status & 0x0040 == 0,
        gart64: status & 0x0080 != 0,
        coherent: status & 0x0100 != 0,
        sideband: status & 0x0200 != 0,
        isochronous: status & 0x1_0000 != 0,
        async_req_size: (4 + (1u32 << ((status & 0xe000) >> 13))) as u8,
        calibration_cycle_timing: ((status & 0x1c00) >> 10) as u8,
        max_requests: 1 + ((status & 0xff00_0000) >> 24) as u16,
    }
}

/// Capability walker used when the backend has nothing better
///
/// Returns `NotSupported` without touching the list when the status
/// register says there is none.
pub fn fill_capabilities_generic(backend: &dyn Backend, dev: &PciDevice) -> PciResult<Option<AgpInfo>> {
    let status = read_u16(backend, dev, STATUS)?;
    if status & STATUS_CAP_LIST == 0 {
        return Err(PciError::NotSupported);
    }

    let mut agp = None;
    let mut offset = read_u8(backend, dev, CAP_PTR)?;
    let mut hops = 0;

    while offset >= CAP_MIN_OFFSET && hops < MAX_CAPS {
        hops += 1;
        offset &= !0x03;

        let cap_id = read_u8(backend, dev, u64::from(offset))?;
        let next = read_u8(backend, dev, u64::from(offset) + 1)?;

        match cap_id {
            CAP_ID_AGP => {
                let version = read_u8(backend, dev, u64::from(offset) + 2)?;
                let agp_status = read_u32(backend, dev, u64::from(offset) + 4)?;
                agp = Some(decode_agp(offset, version, agp_status));
            }
            _ => {
                debug_caps!("{}: skipping capability {:#04x} at {:#04x}", dev.slot(), cap_id, offset);
            }
        }

        offset = next;
    }

    Ok(agp)
}

impl Session {
    /// AGP capability of the device, if it has one
    ///
    /// A successful decode is cached; a lookup that finds nothing (or fails)
    /// is repeated in full on the next call.
    pub fn agp_info(&mut self, handle: DeviceHandle) -> Option<AgpInfo> {
        let (backend, device) = self.backend_and_device(handle).ok()?;

        if device.agp.is_none() {
            let found = match backend.fill_capabilities(&device.info) {
                Err(PciError::NotSupported) => fill_capabilities_generic(backend, &device.info),
                other => other,
            };
            match found {
                Ok(agp) => device.agp = agp,
                Err(_err) => {
                    debug_caps!("{}: capability lookup failed: {}", device.info.slot(), _err);
                }
            }
        }

        device.agp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_agp2() {
        // AGP 2.0, 1x/2x/4x, sideband, fast writes, 32 requests
        let info = decode_agp(0x58, 0x20, 0x1f00_0217);
        assert_eq!(info.config_offset, 0x58);
        assert_eq!(info.major_version, 2);
        assert_eq!(info.minor_version, 0);
        assert_eq!(info.rates, 0x07);
        assert!(info.fast_writes);
        assert!(info.sideband);
        assert!(info.htrans);
        assert!(!info.addr64);
        assert_eq!(info.max_requests, 32);
    }

    #[test]
    fn test_decode_agp3_rate_shift_and_clamp() {
        // AGP 3.0 mode bit set: bit 0 -> 4x, bit 1 -> 8x
        let info = decode_agp(0x60, 0x30, 0x0000_000b);
        assert_eq!(info.rates, 0x0c);

        // Bit 2 would be 16x and is dropped
        let info = decode_agp(0x60, 0x30, 0x0000_000f);
        assert_eq!(info.rates, 0x0c);

        // Version 3 hardware running in AGP2 mode keeps the old encoding
        let info = decode_agp(0x60, 0x35, 0x0000_0003);
        assert_eq!(info.rates, 0x03);
        assert_eq!(info.minor_version, 5);
    }

    #[test]
    fn test_decode_agp_misc_fields() {
        let info = decode_agp(0x40, 0x30, 0x0001_e4c0);
        assert!(info.isochronous);
        assert!(!info.htrans);
        assert!(info.gart64);
        assert_eq!(info.async_req_size, 4 + (1 << 7));
        assert_eq!(info.calibration_cycle_timing, 1);
        assert_eq!(info.max_requests, 1);
    }
}
