//! Configuration-space accessors
//!
//! The generic calls move raw bytes and report how many were transferred,
//! which can be fewer than asked for when an unprivileged caller is limited
//! to the start of config space. The fixed-width calls turn any short
//! transfer into an error and convert between wire and host byte order.

use pciaccess_backend::{Backend, PciDevice, PciError, PciResult};

use crate::byteorder;
use crate::device::DeviceHandle;
use crate::session::Session;

pub(crate) fn read_exact<const N: usize>(
    backend: &dyn Backend,
    dev: &PciDevice,
    offset: u64,
) -> PciResult<[u8; N]> {
    let mut bytes = [0u8; N];
    if backend.read(dev, &mut bytes, offset)? != N {
        return Err(PciError::ShortRead);
    }
    Ok(bytes)
}

pub(crate) fn write_exact(backend: &dyn Backend, dev: &PciDevice, bytes: &[u8], offset: u64) -> PciResult<()> {
    if backend.write(dev, bytes, offset)? != bytes.len() {
        return Err(PciError::ShortWrite);
    }
    Ok(())
}

pub(crate) fn read_u8(backend: &dyn Backend, dev: &PciDevice, offset: u64) -> PciResult<u8> {
    read_exact::<1>(backend, dev, offset).map(|b| b[0])
}

pub(crate) fn read_u16(backend: &dyn Backend, dev: &PciDevice, offset: u64) -> PciResult<u16> {
    read_exact::<2>(backend, dev, offset).map(byteorder::u16_from_wire)
}

pub(crate) fn read_u32(backend: &dyn Backend, dev: &PciDevice, offset: u64) -> PciResult<u32> {
    read_exact::<4>(backend, dev, offset).map(byteorder::u32_from_wire)
}

impl Session {
    /// Read up to `buf.len()` bytes of config space starting at `offset`
    pub fn cfg_read(&self, handle: DeviceHandle, buf: &mut [u8], offset: u64) -> PciResult<usize> {
        let device = self.device(handle)?;
        self.backend().read(&device.info, buf, offset)
    }

    /// Write up to `buf.len()` bytes of config space starting at `offset`
    pub fn cfg_write(&self, handle: DeviceHandle, buf: &[u8], offset: u64) -> PciResult<usize> {
        let device = self.device(handle)?;
        self.backend().write(&device.info, buf, offset)
    }

    pub fn cfg_read_u8(&self, handle: DeviceHandle, offset: u64) -> PciResult<u8> {
        read_u8(self.backend(), &self.device(handle)?.info, offset)
    }

    pub fn cfg_read_u16(&self, handle: DeviceHandle, offset: u64) -> PciResult<u16> {
        read_u16(self.backend(), &self.device(handle)?.info, offset)
    }

    pub fn cfg_read_u32(&self, handle: DeviceHandle, offset: u64) -> PciResult<u32> {
        read_u32(self.backend(), &self.device(handle)?.info, offset)
    }

    pub fn cfg_write_u8(&self, handle: DeviceHandle, data: u8, offset: u64) -> PciResult<()> {
        write_exact(self.backend(), &self.device(handle)?.info, &[data], offset)
    }

    pub fn cfg_write_u16(&self, handle: DeviceHandle, data: u16, offset: u64) -> PciResult<()> {
        let bytes = byteorder::u16_to_wire(data);
        write_exact(self.backend(), &self.device(handle)?.info, &bytes, offset)
    }

    pub fn cfg_write_u32(&self, handle: DeviceHandle, data: u32, offset: u64) -> PciResult<()> {
        let bytes = byteorder::u32_to_wire(data);
        write_exact(self.backend(), &self.device(handle)?.info, &bytes, offset)
    }

    /// Replace the bits selected by `mask` in the dword at `offset`
    ///
    /// This is a plain read-modify-write: another writer touching the same
    /// register between the read and the write loses its update.
    pub fn cfg_write_bits(&self, handle: DeviceHandle, mask: u32, data: u32, offset: u64) -> PciResult<()> {
        let value = self.cfg_read_u32(handle, offset)?;
        self.cfg_write_u32(handle, (value & !mask) | data, offset)
    }
}
