//! Port I/O handles
//!
//! A handle covers a fixed window of I/O ports, either part of one of the
//! device's I/O BARs or a legacy ISA range on its bus. Register offsets are
//! relative to the start of the window; an access that would run past its
//! end reads as all ones and writes nothing.

use pciaccess_backend::{debug_bus, IoHandle, PciError, PciResult};

use crate::device::DeviceHandle;
use crate::session::Session;

impl Session {
    /// Open ports `base .. base + size` of one of the device's I/O BARs
    ///
    /// Fails with `NotFound` unless the whole range lies inside a single
    /// I/O BAR.
    pub fn open_io(&mut self, handle: DeviceHandle, base: u64, size: u64) -> PciResult<IoHandle> {
        let device = self.device(handle)?;
        let bar = device
            .regions
            .iter()
            .position(|r| {
                r.is_io
                    && r.contains(base)
                    && base.checked_add(size).map_or(false, |end| end <= r.end())
            })
            .ok_or(PciError::NotFound)?;

        let mut io = self.backend().open_device_io(&device.info, bar, base, size)?;
        io.bar = Some(bar);
        debug_bus!("{}: opened I/O {:#x}+{:#x} in BAR{}", device.slot(), base, size, bar);
        Ok(io)
    }

    /// Open legacy ports `base .. base + size` on the device's bus
    pub fn open_legacy_io(&mut self, handle: DeviceHandle, base: u64, size: u64) -> PciResult<IoHandle> {
        let device = self.device(handle)?;
        let mut io = self.backend().open_legacy_io(&device.info, base, size)?;
        io.is_legacy = true;
        io.bar = None;
        Ok(io)
    }

    /// Release a handle from [`Session::open_io`] or [`Session::open_legacy_io`]
    pub fn close_io(&mut self, handle: DeviceHandle, io: IoHandle) -> PciResult<()> {
        let device = self.device(handle)?;
        self.backend().close_io(&device.info, io);
        Ok(())
    }

    pub fn io_read8(&self, io: &IoHandle, reg: u32) -> u8 {
        if !io.in_range(reg, 1) {
            return u8::MAX;
        }
        self.backend().read8(io, reg)
    }

    pub fn io_read16(&self, io: &IoHandle, reg: u32) -> u16 {
        if !io.in_range(reg, 2) {
            return u16::MAX;
        }
        self.backend().read16(io, reg)
    }

    pub fn io_read32(&self, io: &IoHandle, reg: u32) -> u32 {
        if !io.in_range(reg, 4) {
            return u32::MAX;
        }
        self.backend().read32(io, reg)
    }

    pub fn io_write8(&self, io: &IoHandle, reg: u32, data: u8) {
        if io.in_range(reg, 1) {
            self.backend().write8(io, reg, data);
        }
    }

    pub fn io_write16(&self, io: &IoHandle, reg: u32, data: u16) {
        if io.in_range(reg, 2) {
            self.backend().write16(io, reg, data);
        }
    }

    pub fn io_write32(&self, io: &IoHandle, reg: u32, data: u32) {
        if io.in_range(reg, 4) {
            self.backend().write32(io, reg, data);
        }
    }
}
