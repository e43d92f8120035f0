//! Raw Port Backend for pciaccess
//!
//! Talks to the host bridge directly through configuration mechanism #1
//! (address port 0xCF8, data port 0xCFC) and maps device memory through
//! `/dev/mem`. Needs I/O privilege level 3, so in practice root. Only the
//! first 256 bytes of configuration space and PCI domain 0 are reachable
//! this way.

#![cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]

use core::arch::asm;
use core::ptr::NonNull;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use pciaccess_backend::{
    debug_bus, pci_class, Backend, IoHandle, MapFlags, Mapping, PciDevice, PciError, PciResult,
    PciSlot, Region, NUM_REGIONS,
};

// PCI configuration ports
const PCI_CONFIG_ADDRESS: u16 = 0xCF8;
const PCI_CONFIG_DATA: u16 = 0xCFC;

/// Configuration space reachable through mechanism #1
const CONFIG_SPACE_SIZE: u64 = 256;

const PCI_COMMAND: u16 = 0x04;
const PCI_COMMAND_IO: u16 = 0x01;
const PCI_COMMAND_MEMORY: u16 = 0x02;
const PCI_COMMAND_MASTER: u16 = 0x04;

const PCI_BAR0: u16 = 0x10;
const PCI_ROM_TYPE0: u16 = 0x30;
const PCI_ROM_TYPE1: u16 = 0x38;

/// Address/data port pairs must not interleave
static CONFIG_LOCK: spin::Mutex<()> = spin::Mutex::new(());

// ============================================================================
// Port primitives
// ============================================================================

#[inline]
unsafe fn outl(port: u16, value: u32) {
    asm!("out dx, eax", in("dx") port, in("eax") value, options(nomem, nostack, preserves_flags));
}

#[inline]
unsafe fn inl(port: u16) -> u32 {
    let value: u32;
    asm!("in eax, dx", in("dx") port, out("eax") value, options(nomem, nostack, preserves_flags));
    value
}

#[inline]
unsafe fn outw(port: u16, value: u16) {
    asm!("out dx, ax", in("dx") port, in("ax") value, options(nomem, nostack, preserves_flags));
}

#[inline]
unsafe fn inw(port: u16) -> u16 {
    let value: u16;
    asm!("in ax, dx", in("dx") port, out("ax") value, options(nomem, nostack, preserves_flags));
    value
}

#[inline]
unsafe fn outb(port: u16, value: u8) {
    asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
}

#[inline]
unsafe fn inb(port: u16) -> u8 {
    let value: u8;
    asm!("in al, dx", in("dx") port, out("al") value, options(nomem, nostack, preserves_flags));
    value
}

/// Raise the I/O privilege level so `in`/`out` work from user space
fn raise_iopl() -> PciResult<()> {
    // SAFETY: iopl only changes the privilege bits of this process
    let ret = unsafe { libc::syscall(libc::SYS_iopl, 3 as libc::c_long) };
    if ret != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

// ============================================================================
// Configuration access
// ============================================================================

/// Build configuration address for PCI access
fn config_address(slot: PciSlot, offset: u16) -> u32 {
    0x8000_0000
        | ((slot.bus as u32) << 16)
        | ((slot.dev as u32) << 11)
        | ((slot.func as u32) << 8)
        | ((offset as u32) & 0xFC)
}

fn cfg_read32(slot: PciSlot, offset: u16) -> u32 {
    let _guard = CONFIG_LOCK.lock();
    // SAFETY: iopl(3) was granted when the backend was opened
    unsafe {
        outl(PCI_CONFIG_ADDRESS, config_address(slot, offset));
        inl(PCI_CONFIG_DATA)
    }
}

fn cfg_write32(slot: PciSlot, offset: u16, value: u32) {
    let _guard = CONFIG_LOCK.lock();
    // SAFETY: iopl(3) was granted when the backend was opened
    unsafe {
        outl(PCI_CONFIG_ADDRESS, config_address(slot, offset));
        outl(PCI_CONFIG_DATA, value);
    }
}

fn cfg_read16(slot: PciSlot, offset: u16) -> u16 {
    let _guard = CONFIG_LOCK.lock();
    // SAFETY: iopl(3) was granted when the backend was opened
    unsafe {
        outl(PCI_CONFIG_ADDRESS, config_address(slot, offset));
        inw(PCI_CONFIG_DATA + (offset & 2))
    }
}

fn cfg_write16(slot: PciSlot, offset: u16, value: u16) {
    let _guard = CONFIG_LOCK.lock();
    // SAFETY: iopl(3) was granted when the backend was opened
    unsafe {
        outl(PCI_CONFIG_ADDRESS, config_address(slot, offset));
        outw(PCI_CONFIG_DATA + (offset & 2), value);
    }
}

fn cfg_read8(slot: PciSlot, offset: u16) -> u8 {
    let _guard = CONFIG_LOCK.lock();
    // SAFETY: iopl(3) was granted when the backend was opened
    unsafe {
        outl(PCI_CONFIG_ADDRESS, config_address(slot, offset));
        inb(PCI_CONFIG_DATA + (offset & 3))
    }
}

fn cfg_write8(slot: PciSlot, offset: u16, value: u8) {
    let _guard = CONFIG_LOCK.lock();
    // SAFETY: iopl(3) was granted when the backend was opened
    unsafe {
        outl(PCI_CONFIG_ADDRESS, config_address(slot, offset));
        outb(PCI_CONFIG_DATA + (offset & 3), value);
    }
}

/// Whether a host bridge answers on mechanism #1
fn mechanism1_present() -> bool {
    let _guard = CONFIG_LOCK.lock();
    // SAFETY: iopl(3) was granted by the caller
    unsafe {
        let saved = inl(PCI_CONFIG_ADDRESS);
        outl(PCI_CONFIG_ADDRESS, 0x8000_0000);
        let readback = inl(PCI_CONFIG_ADDRESS);
        outl(PCI_CONFIG_ADDRESS, saved);
        readback == 0x8000_0000
    }
}

/// Split `len` bytes at `offset` into naturally aligned accesses
fn access_width(offset: u64, remaining: usize) -> usize {
    if offset % 4 == 0 && remaining >= 4 {
        4
    } else if offset % 2 == 0 && remaining >= 2 {
        2
    } else {
        1
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Configuration mechanism #1 plus `/dev/mem`
pub struct PortIoBackend {
    dev_mem: PathBuf,
}

impl PortIoBackend {
    /// Gain port access and check that a host bridge responds
    pub fn open(dev_mem: PathBuf) -> PciResult<Self> {
        raise_iopl()?;
        if !mechanism1_present() {
            debug_bus!("portio: no configuration mechanism #1");
            return Err(PciError::NotSupported);
        }
        Ok(PortIoBackend { dev_mem })
    }

    fn slot_of(dev: &PciDevice) -> PciResult<PciSlot> {
        if dev.domain != 0 {
            return Err(PciError::NoDevice);
        }
        Ok(dev.slot())
    }

    /// Read device identity, or `None` if nothing answers at `slot`
    fn read_device_info(&self, slot: PciSlot) -> Option<PciDevice> {
        let reg0 = cfg_read32(slot, 0x00);
        if reg0 & 0xFFFF == 0xFFFF {
            return None;
        }

        let reg2 = cfg_read32(slot, 0x08);
        let header_type = cfg_read8(slot, 0x0E) & 0x7F;

        let mut dev = PciDevice::new(slot);
        dev.vendor_id = (reg0 & 0xFFFF) as u16;
        dev.device_id = ((reg0 >> 16) & 0xFFFF) as u16;
        dev.device_class = reg2 >> 8;
        dev.revision = (reg2 & 0xFF) as u8;
        dev.header_type = header_type;

        // Subsystem IDs live in a different place per header layout
        let subsystem = match header_type {
            0x00 => Some(cfg_read32(slot, 0x2C)),
            0x02 => Some(cfg_read32(slot, 0x40)),
            _ => None,
        };
        if let Some(reg) = subsystem {
            dev.subvendor_id = (reg & 0xFFFF) as u16;
            dev.subdevice_id = ((reg >> 16) & 0xFFFF) as u16;
        }

        Some(dev)
    }

    /// Scan all PCI buses
    fn scan_buses(&self) -> Vec<PciDevice> {
        let mut devices = Vec::new();

        for bus in 0..=255u8 {
            for device in 0..32u8 {
                for function in 0..8u8 {
                    let slot = PciSlot::new(0, bus, device, function);
                    if let Some(info) = self.read_device_info(slot) {
                        devices.push(info);

                        // If function 0 is not multi-function, skip other functions
                        if function == 0 && cfg_read8(slot, 0x0E) & 0x80 == 0 {
                            break;
                        }
                    } else if function == 0 {
                        break; // No device at function 0 means no device at all
                    }
                }
            }
        }

        devices
    }

    /// Write all ones to a BAR and read back the implemented bits
    fn size_register(slot: PciSlot, offset: u16) -> (u32, u32) {
        let original = cfg_read32(slot, offset);
        cfg_write32(slot, offset, 0xFFFF_FFFF);
        let mask = cfg_read32(slot, offset);
        cfg_write32(slot, offset, original);
        (original, mask)
    }

    fn probe_bars(slot: PciSlot, count: usize, regions: &mut [Region; NUM_REGIONS]) {
        let mut i = 0;
        while i < count {
            let offset = PCI_BAR0 + (i as u16 * 4);
            let (bar, mask) = Self::size_register(slot, offset);

            if mask == 0 || (mask == 0xFFFF_FFFF && bar == 0xFFFF_FFFF) {
                i += 1;
                continue;
            }

            let mut region = Region::default();
            if bar & 1 == 1 {
                // I/O BAR, only the low 16 bits need be implemented
                region.is_io = true;
                region.base_addr = u64::from(bar & 0xFFFF_FFFC);
                let mask = (mask & 0xFFFF_FFFC) | 0xFFFF_0000;
                region.size = u64::from((!mask).wrapping_add(1));
            } else {
                // Memory BAR
                region.is_64 = (bar >> 1) & 3 == 2;
                region.is_prefetchable = (bar >> 3) & 1 == 1;

                let mut base = u64::from(bar & 0xFFFF_FFF0);
                let mut wide_mask = u64::from(mask & 0xFFFF_FFF0) | 0xFFFF_FFFF_0000_0000;
                if region.is_64 && i + 1 < count {
                    let (high, high_mask) = Self::size_register(slot, offset + 4);
                    base |= u64::from(high) << 32;
                    wide_mask = u64::from(mask & 0xFFFF_FFF0) | (u64::from(high_mask) << 32);
                }
                region.base_addr = base;
                region.size = (!wide_mask).wrapping_add(1);
            }
            region.bus_addr = region.base_addr;

            let is_64 = region.is_64;
            if region.size != 0 {
                regions[i] = region;
            }
            // Skip next BAR (used for high bits)
            i += if is_64 { 2 } else { 1 };
        }
    }

    fn rom_register(header_type: u8) -> Option<u16> {
        match header_type {
            0x00 => Some(PCI_ROM_TYPE0),
            0x01 => Some(PCI_ROM_TYPE1),
            _ => None,
        }
    }

    /// mmap `size` bytes of physical memory at `base`
    fn map_physical(&self, base: u64, size: u64, writable: bool) -> PciResult<NonNull<u8>> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&self.dev_mem)?;

        let delta = base % page_size();
        let len = usize::try_from(size + delta).map_err(|_| PciError::TooBig)?;
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };

        // SAFETY: fresh shared mapping of a file we hold open; the kernel
        // validates the range
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                (base - delta) as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }

        NonNull::new(ptr.cast::<u8>().wrapping_add(delta as usize)).ok_or(PciError::Fault)
    }

    fn unmap_physical(&self, addr: NonNull<u8>, size: u64) -> PciResult<()> {
        let delta = addr.as_ptr() as usize as u64 % page_size();
        let start = addr.as_ptr().wrapping_sub(delta as usize);
        let len = usize::try_from(size + delta).map_err(|_| PciError::TooBig)?;

        // SAFETY: `start`/`len` describe a mapping made by `map_physical`
        if unsafe { libc::munmap(start.cast(), len) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn port(handle: &IoHandle, reg: u32) -> u16 {
        (handle.base + u64::from(reg)) as u16
    }
}

impl Backend for PortIoBackend {
    fn name(&self) -> &'static str {
        "portio"
    }

    fn enumerate(&mut self) -> PciResult<Vec<PciDevice>> {
        let devices = self.scan_buses();
        debug_bus!("portio: {} function(s) found", devices.len());
        Ok(devices)
    }

    fn probe(&self, dev: &mut PciDevice) -> PciResult<()> {
        let slot = Self::slot_of(dev)?;
        let header_type = cfg_read8(slot, 0x0E) & 0x7F;
        let bar_count = match header_type {
            0x00 => 6,
            0x01 => 2,
            0x02 => 1,
            _ => 0,
        };

        // Decoding off while the BARs hold all ones
        let command = cfg_read16(slot, PCI_COMMAND);
        cfg_write16(slot, PCI_COMMAND, command & !(PCI_COMMAND_IO | PCI_COMMAND_MEMORY));

        let mut regions = [Region::default(); NUM_REGIONS];
        Self::probe_bars(slot, bar_count, &mut regions);

        if let Some(rom_reg) = Self::rom_register(header_type) {
            let (rom, mask) = Self::size_register(slot, rom_reg);
            let mask = mask & 0xFFFF_F800;
            if mask != 0 {
                dev.rom_base = u64::from(rom & 0xFFFF_F800);
                dev.rom_size = u64::from((!mask).wrapping_add(1));
            }
        }

        cfg_write16(slot, PCI_COMMAND, command);

        // Keep mappings made through the single-region API
        for (probed, current) in regions.iter_mut().zip(dev.regions.iter()) {
            probed.memory = current.memory;
        }
        dev.regions = regions;
        dev.header_type = header_type;

        let irq = cfg_read8(slot, 0x3C);
        dev.irq = if irq == 0 || irq == 0xFF { -1 } else { i32::from(irq) };
        Ok(())
    }

    fn read(&self, dev: &PciDevice, buf: &mut [u8], offset: u64) -> PciResult<usize> {
        let slot = Self::slot_of(dev)?;
        let end = (offset.saturating_add(buf.len() as u64)).min(CONFIG_SPACE_SIZE);
        let mut pos = offset;

        while pos < end {
            let at = (pos - offset) as usize;
            let reg = pos as u16;
            match access_width(pos, (end - pos) as usize) {
                4 => buf[at..at + 4].copy_from_slice(&cfg_read32(slot, reg).to_le_bytes()),
                2 => buf[at..at + 2].copy_from_slice(&cfg_read16(slot, reg).to_le_bytes()),
                _ => buf[at] = cfg_read8(slot, reg),
            }
            pos += access_width(pos, (end - pos) as usize) as u64;
        }

        Ok(end.saturating_sub(offset) as usize)
    }

    fn write(&self, dev: &PciDevice, buf: &[u8], offset: u64) -> PciResult<usize> {
        let slot = Self::slot_of(dev)?;
        let end = (offset.saturating_add(buf.len() as u64)).min(CONFIG_SPACE_SIZE);
        let mut pos = offset;

        while pos < end {
            let at = (pos - offset) as usize;
            let reg = pos as u16;
            let width = access_width(pos, (end - pos) as usize);
            match width {
                4 => cfg_write32(
                    slot,
                    reg,
                    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]),
                ),
                2 => cfg_write16(slot, reg, u16::from_le_bytes([buf[at], buf[at + 1]])),
                _ => cfg_write8(slot, reg, buf[at]),
            }
            pos += width as u64;
        }

        Ok(end.saturating_sub(offset) as usize)
    }

    fn map_range(&self, _dev: &PciDevice, map: &Mapping) -> PciResult<NonNull<u8>> {
        self.map_physical(map.base, map.size, map.flags.contains(MapFlags::WRITABLE))
    }

    fn unmap_range(&self, _dev: &PciDevice, map: &Mapping) -> PciResult<()> {
        let addr = map.memory.ok_or(PciError::InvalidArgument)?;
        self.unmap_physical(addr, map.size)
    }

    fn read_rom(&self, dev: &PciDevice, buf: &mut [u8]) -> PciResult<usize> {
        let slot = Self::slot_of(dev)?;
        let rom_reg = Self::rom_register(dev.header_type).ok_or(PciError::NotFound)?;
        if dev.rom_base == 0 || dev.rom_size == 0 {
            return Err(PciError::NotFound);
        }

        let saved_rom = cfg_read32(slot, rom_reg);
        let saved_cmd = cfg_read16(slot, PCI_COMMAND);
        cfg_write32(slot, rom_reg, (dev.rom_base as u32) | 1);
        cfg_write16(slot, PCI_COMMAND, saved_cmd | PCI_COMMAND_MEMORY);

        let copied = self.map_physical(dev.rom_base, dev.rom_size, false).and_then(|rom| {
            let len = buf.len().min(dev.rom_size as usize);
            // SAFETY: the mapping covers rom_size bytes and len <= rom_size
            unsafe { core::ptr::copy_nonoverlapping(rom.as_ptr(), buf.as_mut_ptr(), len) };
            self.unmap_physical(rom, dev.rom_size)?;
            Ok(len)
        });

        cfg_write16(slot, PCI_COMMAND, saved_cmd);
        cfg_write32(slot, rom_reg, saved_rom);
        copied
    }

    fn enable(&self, dev: &PciDevice) -> PciResult<()> {
        let slot = Self::slot_of(dev)?;
        let mut command = cfg_read16(slot, PCI_COMMAND);
        for region in dev.regions.iter().filter(|r| r.size != 0) {
            command |= if region.is_io {
                PCI_COMMAND_IO
            } else {
                PCI_COMMAND_MEMORY
            };
        }
        if dev.rom_size != 0 {
            command |= PCI_COMMAND_MEMORY;
        }
        cfg_write16(slot, PCI_COMMAND, command);
        Ok(())
    }

    fn disable(&self, dev: &PciDevice) -> PciResult<()> {
        let slot = Self::slot_of(dev)?;
        let command = cfg_read16(slot, PCI_COMMAND);
        cfg_write16(
            slot,
            PCI_COMMAND,
            command & !(PCI_COMMAND_IO | PCI_COMMAND_MEMORY | PCI_COMMAND_MASTER),
        );
        Ok(())
    }

    /// A VGA device with I/O or memory decoding on after firmware handoff
    fn boot_vga(&self, dev: &PciDevice) -> bool {
        let Ok(slot) = Self::slot_of(dev) else {
            return false;
        };
        if dev.class() != pci_class::DISPLAY || dev.subclass() != pci_class::VGA {
            return false;
        }
        cfg_read16(slot, PCI_COMMAND) & (PCI_COMMAND_IO | PCI_COMMAND_MEMORY) != 0
    }

    fn open_device_io(&self, _dev: &PciDevice, _bar: usize, base: u64, size: u64) -> PciResult<IoHandle> {
        if base.saturating_add(size) > 0x1_0000 {
            return Err(PciError::InvalidArgument);
        }
        Ok(IoHandle::new(base, size))
    }

    fn open_legacy_io(&self, _dev: &PciDevice, base: u64, size: u64) -> PciResult<IoHandle> {
        if base.saturating_add(size) > 0x1_0000 {
            return Err(PciError::InvalidArgument);
        }
        Ok(IoHandle::new(base, size))
    }

    fn read8(&self, handle: &IoHandle, reg: u32) -> u8 {
        // SAFETY: iopl(3) was granted when the backend was opened
        unsafe { inb(Self::port(handle, reg)) }
    }

    fn read16(&self, handle: &IoHandle, reg: u32) -> u16 {
        // SAFETY: as above
        unsafe { inw(Self::port(handle, reg)) }
    }

    fn read32(&self, handle: &IoHandle, reg: u32) -> u32 {
        // SAFETY: as above
        unsafe { inl(Self::port(handle, reg)) }
    }

    fn write8(&self, handle: &IoHandle, reg: u32, data: u8) {
        // SAFETY: as above
        unsafe { outb(Self::port(handle, reg), data) }
    }

    fn write16(&self, handle: &IoHandle, reg: u32, data: u16) {
        // SAFETY: as above
        unsafe { outw(Self::port(handle, reg), data) }
    }

    fn write32(&self, handle: &IoHandle, reg: u32, data: u32) {
        // SAFETY: as above
        unsafe { outl(Self::port(handle, reg), data) }
    }

    fn map_legacy(&self, _dev: &PciDevice, base: u64, size: u64, flags: MapFlags) -> PciResult<NonNull<u8>> {
        self.map_physical(base, size, flags.contains(MapFlags::WRITABLE))
    }

    fn unmap_legacy(&self, _dev: &PciDevice, addr: NonNull<u8>, size: u64) -> PciResult<()> {
        self.unmap_physical(addr, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_address() {
        let slot = PciSlot::new(0, 0x12, 0x1f, 0x7);
        assert_eq!(config_address(slot, 0x00), 0x8012_FF00);
        assert_eq!(config_address(slot, 0x3E), 0x8012_FF3C);
    }

    #[test]
    fn test_access_width() {
        assert_eq!(access_width(0x10, 4), 4);
        assert_eq!(access_width(0x10, 3), 2);
        assert_eq!(access_width(0x12, 4), 2);
        assert_eq!(access_width(0x13, 4), 1);
        assert_eq!(access_width(0x10, 1), 1);
    }
}
