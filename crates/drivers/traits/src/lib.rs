//! Platform Backend Interface for pciaccess
//!
//! This crate defines the trait every platform backend implements, plus the
//! device and region records the backends fill in. The core library only
//! talks to hardware through [`Backend`], so the caller never needs to know
//! whether sysfs, raw port I/O or something else is underneath.
//!
//! # Debug Features
//!
//! Enable debug output for specific subsystems at compile time:
//! ```toml
//! pciaccess-backend = { path = "...", features = ["debug-bus"] }
//! ```
//!
//! Available features:
//! - `debug-all`: Enable all debug output
//! - `debug-bus`: Enumeration and probing
//! - `debug-caps`: Capability list walking
//! - `debug-map`: Region mapping
//! - `debug-names`: Name database loading
//! - `debug-vgaarb`: VGA arbiter traffic

use core::fmt;
use core::ptr::NonNull;

mod debug;
pub mod types;

pub use debug::*;
pub use types::*;

/// Error type shared by the core library and every backend
///
/// Each variant corresponds to one POSIX errno so callers that need the
/// numeric code can get it back with [`PciError::errno`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciError {
    /// Missing or stale device or buffer (EFAULT)
    Fault,
    /// Invalid parameter, duplicate mapping or malformed range (EINVAL)
    InvalidArgument,
    /// Region, mapping or device not found (ENOENT)
    NotFound,
    /// Requested range runs past the end of its BAR (E2BIG)
    TooBig,
    /// Allocation failure (ENOMEM)
    NoMemory,
    /// Not implemented by this backend or platform (ENOSYS)
    NotSupported,
    /// Device is not of the required kind (ENODEV)
    NoDevice,
    /// Short configuration-space read (ENXIO)
    ShortRead,
    /// Short configuration-space write (ENOSPC)
    ShortWrite,
    /// Resource held elsewhere (EBUSY)
    Busy,
    /// Any other errno reported by the operating system
    Os(i32),
}

pub type PciResult<T> = Result<T, PciError>;

impl PciError {
    /// POSIX errno equivalent of this error
    pub fn errno(&self) -> i32 {
        match self {
            PciError::Fault => libc::EFAULT,
            PciError::InvalidArgument => libc::EINVAL,
            PciError::NotFound => libc::ENOENT,
            PciError::TooBig => libc::E2BIG,
            PciError::NoMemory => libc::ENOMEM,
            PciError::NotSupported => libc::ENOSYS,
            PciError::NoDevice => libc::ENODEV,
            PciError::ShortRead => libc::ENXIO,
            PciError::ShortWrite => libc::ENOSPC,
            PciError::Busy => libc::EBUSY,
            PciError::Os(errno) => *errno,
        }
    }

    /// Map an errno back onto the matching variant
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EFAULT => PciError::Fault,
            libc::EINVAL => PciError::InvalidArgument,
            libc::ENOENT => PciError::NotFound,
            libc::E2BIG => PciError::TooBig,
            libc::ENOMEM => PciError::NoMemory,
            libc::ENOSYS => PciError::NotSupported,
            libc::ENODEV => PciError::NoDevice,
            libc::ENXIO => PciError::ShortRead,
            libc::ENOSPC => PciError::ShortWrite,
            libc::EBUSY => PciError::Busy,
            other => PciError::Os(other),
        }
    }
}

impl fmt::Display for PciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PciError::Fault => write!(f, "Bad device or buffer"),
            PciError::InvalidArgument => write!(f, "Invalid argument"),
            PciError::NotFound => write!(f, "No such region or mapping"),
            PciError::TooBig => write!(f, "Range exceeds region"),
            PciError::NoMemory => write!(f, "Out of memory"),
            PciError::NotSupported => write!(f, "Not supported on this platform"),
            PciError::NoDevice => write!(f, "Not a suitable device"),
            PciError::ShortRead => write!(f, "Short configuration read"),
            PciError::ShortWrite => write!(f, "Short configuration write"),
            PciError::Busy => write!(f, "Resource busy"),
            PciError::Os(errno) => write!(f, "OS error {}", errno),
        }
    }
}

impl std::error::Error for PciError {}

impl From<std::io::Error> for PciError {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => PciError::from_errno(errno),
            None => PciError::Os(libc::EIO),
        }
    }
}

/// Platform backend operations
///
/// One implementation exists per operating-system facility. Only the
/// enumeration, probing, config-space and range-mapping methods are
/// mandatory; everything else defaults to "not supported" (or to a
/// harmless no-op where the core treats a missing method as success).
pub trait Backend {
    /// Short backend name for diagnostics
    fn name(&self) -> &'static str;

    /// Discover every PCI function on the system
    fn enumerate(&mut self) -> PciResult<Vec<PciDevice>>;

    /// Fill in regions, ROM, IRQ and header type for one device
    fn probe(&self, dev: &mut PciDevice) -> PciResult<()>;

    /// Read configuration space, returning the number of bytes transferred
    fn read(&self, dev: &PciDevice, buf: &mut [u8], offset: u64) -> PciResult<usize>;

    /// Write configuration space, returning the number of bytes transferred
    fn write(&self, dev: &PciDevice, buf: &[u8], offset: u64) -> PciResult<usize>;

    /// Map `map.base .. map.base + map.size` of BAR `map.region`
    fn map_range(&self, dev: &PciDevice, map: &Mapping) -> PciResult<NonNull<u8>>;

    /// Undo a mapping previously returned by [`Backend::map_range`]
    fn unmap_range(&self, dev: &PciDevice, map: &Mapping) -> PciResult<()>;

    /// Copy the expansion ROM into `buf`, returning the bytes copied
    fn read_rom(&self, _dev: &PciDevice, _buf: &mut [u8]) -> PciResult<usize> {
        Err(PciError::NotSupported)
    }

    /// Enable I/O and memory decoding
    fn enable(&self, _dev: &PciDevice) -> PciResult<()> {
        Ok(())
    }

    /// Disable the device
    fn disable(&self, _dev: &PciDevice) -> PciResult<()> {
        Ok(())
    }

    /// Whether firmware used this device as the boot display
    fn boot_vga(&self, _dev: &PciDevice) -> bool {
        false
    }

    /// Whether a kernel driver is currently bound
    fn has_kernel_driver(&self, _dev: &PciDevice) -> bool {
        false
    }

    /// Platform capability discovery
    ///
    /// Returning [`PciError::NotSupported`] tells the core to run its own
    /// generic capability-list walker instead.
    fn fill_capabilities(&self, _dev: &PciDevice) -> PciResult<Option<AgpInfo>> {
        Err(PciError::NotSupported)
    }

    /// Open ports `base .. base + size` inside I/O BAR `bar`
    fn open_device_io(
        &self,
        _dev: &PciDevice,
        _bar: usize,
        _base: u64,
        _size: u64,
    ) -> PciResult<IoHandle> {
        Err(PciError::NotSupported)
    }

    /// Open legacy ISA-range ports on the device's bus
    fn open_legacy_io(&self, _dev: &PciDevice, _base: u64, _size: u64) -> PciResult<IoHandle> {
        Err(PciError::NotSupported)
    }

    /// Release whatever the backend holds for `handle`
    fn close_io(&self, _dev: &PciDevice, _handle: IoHandle) {}

    fn read8(&self, _handle: &IoHandle, _reg: u32) -> u8 {
        u8::MAX
    }

    fn read16(&self, _handle: &IoHandle, _reg: u32) -> u16 {
        u16::MAX
    }

    fn read32(&self, _handle: &IoHandle, _reg: u32) -> u32 {
        u32::MAX
    }

    fn write8(&self, _handle: &IoHandle, _reg: u32, _data: u8) {}

    fn write16(&self, _handle: &IoHandle, _reg: u32, _data: u16) {}

    fn write32(&self, _handle: &IoHandle, _reg: u32, _data: u32) {}

    /// Map part of the legacy (< 1MB) physical window
    fn map_legacy(
        &self,
        _dev: &PciDevice,
        _base: u64,
        _size: u64,
        _flags: MapFlags,
    ) -> PciResult<NonNull<u8>> {
        Err(PciError::NotSupported)
    }

    /// Undo [`Backend::map_legacy`]
    fn unmap_legacy(&self, _dev: &PciDevice, _addr: NonNull<u8>, _size: u64) -> PciResult<()> {
        Err(PciError::NotSupported)
    }

    /// Release per-device backend state at session teardown
    fn destroy_device(&mut self, _dev: &mut PciDevice) {}

    /// Release global backend state at session teardown
    fn destroy(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(PciError::TooBig.to_string(), "Range exceeds region");
        assert_eq!(PciError::Os(5).to_string(), "OS error 5");
    }

    #[test]
    fn test_errno_round_trip() {
        for err in [
            PciError::Fault,
            PciError::InvalidArgument,
            PciError::NotFound,
            PciError::TooBig,
            PciError::NotSupported,
            PciError::NoDevice,
            PciError::ShortRead,
            PciError::ShortWrite,
            PciError::Busy,
        ] {
            assert_eq!(PciError::from_errno(err.errno()), err);
        }
        assert_eq!(PciError::from_errno(libc::EACCES), PciError::Os(libc::EACCES));
    }

    #[test]
    fn test_from_io_error() {
        let err = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(PciError::from(err), PciError::Os(libc::EACCES));

        let err = std::io::Error::new(std::io::ErrorKind::Other, "no errno");
        assert_eq!(PciError::from(err), PciError::Os(libc::EIO));
    }
}
