//! Linux sysfs Backend for pciaccess
//!
//! Every PCI function shows up as a directory under
//! `<root>/bus/pci/devices/<dddd:bb:dd.f>`. Configuration space is the
//! `config` file, BARs are `resourceN` files that can be mmapped, and the
//! expansion ROM is read through `rom` once it has been switched on by
//! writing `1` to it. Legacy ports and memory go through the per-bus
//! `legacy_io` / `legacy_mem` files under `<root>/class/pci_bus`.
//!
//! The root is configurable so the whole backend can run against a fake
//! tree in tests.

#![cfg(target_os = "linux")]

use core::ptr::NonNull;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use pciaccess_backend::{
    debug_bus, debug_map, Backend, IoHandle, MapFlags, Mapping, PciDevice, PciError, PciResult,
    PciSlot, Region, NUM_REGIONS,
};

/// Kernel resource flags as printed in the `resource` attribute
const IORESOURCE_IO: u64 = 0x0000_0100;
const IORESOURCE_PREFETCH: u64 = 0x0000_2000;
const IORESOURCE_MEM_64: u64 = 0x0010_0000;

/// `resource` line holding the expansion ROM
const ROM_RESOURCE_LINE: usize = 6;

/// Bytes of config space needed for IDs and class
const IDENT_LEN: usize = 48;

const PCI_HEADER_TYPE: u64 = 0x0e;
const PCI_INTERRUPT_LINE: u64 = 0x3c;

// ============================================================================
// Helpers
// ============================================================================

fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

/// Parse a sysfs hex attribute such as `0x8086\n`
fn parse_hex(text: &str) -> Option<u64> {
    let text = text.trim();
    let digits = text.strip_prefix("0x").unwrap_or(text);
    u64::from_str_radix(digits, 16).ok()
}

/// One line of the `resource` attribute: start, end and flags
fn parse_resource_line(line: &str) -> Option<(u64, u64, u64)> {
    let mut fields = line.split_whitespace().map(parse_hex);
    let start = fields.next()??;
    let end = fields.next()??;
    let flags = fields.next()??;
    Some((start, end, flags))
}

/// Decode the `resource` attribute into BARs and the ROM range
pub fn parse_resources(text: &str) -> ([Region; NUM_REGIONS], Option<(u64, u64)>) {
    let mut regions = [Region::default(); NUM_REGIONS];
    let mut rom = None;

    for (i, line) in text.lines().enumerate() {
        let Some((start, end, flags)) = parse_resource_line(line) else {
            continue;
        };
        if start == 0 && end == 0 {
            continue;
        }
        let size = end.wrapping_sub(start).wrapping_add(1);

        if i < NUM_REGIONS {
            regions[i] = Region {
                base_addr: start,
                bus_addr: start,
                size,
                is_io: flags & IORESOURCE_IO != 0,
                is_prefetchable: flags & IORESOURCE_PREFETCH != 0,
                is_64: flags & IORESOURCE_MEM_64 != 0,
                memory: None,
            };
        } else if i == ROM_RESOURCE_LINE {
            rom = Some((start, size));
        }
    }

    (regions, rom)
}

fn mmap_file(file: &File, offset: u64, size: u64, writable: bool) -> PciResult<NonNull<u8>> {
    let delta = offset % page_size();
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
            (offset - delta) as libc::off_t,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error().into());
    }

    NonNull::new(ptr.cast::<u8>().wrapping_add(delta as usize)).ok_or(PciError::Fault)
}

fn munmap(addr: NonNull<u8>, size: u64) -> PciResult<()> {
    let delta = addr.as_ptr() as usize as u64 % page_size();
    let start = addr.as_ptr().wrapping_sub(delta as usize);
    let len = usize::try_from(size + delta).map_err(|_| PciError::TooBig)?;

    // SAFETY: `start`/`len` describe a mapping made by `mmap_file`
    if unsafe { libc::munmap(start.cast(), len) } != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

// ============================================================================
// Backend
// ============================================================================

/// PCI access through `/sys/bus/pci`
#[derive(Debug, Clone)]
pub struct SysfsBackend {
    root: PathBuf,
}

impl SysfsBackend {
    /// Whether `root` looks like a sysfs mount with a PCI bus
    pub fn available(root: &Path) -> bool {
        root.join("bus/pci/devices").is_dir()
    }

    pub fn new(root: PathBuf) -> Self {
        SysfsBackend { root }
    }

    fn devices_dir(&self) -> PathBuf {
        self.root.join("bus/pci/devices")
    }

    fn device_dir(&self, dev: &PciDevice) -> PathBuf {
        self.devices_dir().join(dev.slot().to_string())
    }

    fn attr(&self, dev: &PciDevice, name: &str) -> PathBuf {
        self.device_dir(dev).join(name)
    }

    fn read_attr(&self, dev: &PciDevice, name: &str) -> PciResult<String> {
        Ok(fs::read_to_string(self.attr(dev, name))?)
    }

    fn read_hex_attr(&self, dev: &PciDevice, name: &str) -> Option<u64> {
        self.read_attr(dev, name).ok().as_deref().and_then(parse_hex)
    }

    fn legacy_file(&self, dev: &PciDevice, name: &str) -> PathBuf {
        self.root
            .join("class/pci_bus")
            .join(format!("{:04x}:{:02x}", dev.domain, dev.bus))
            .join(name)
    }

    /// Fill IDs, class and revision from the first bytes of config space,
    /// falling back to the individual attributes
    fn identify(&self, dev: &mut PciDevice) -> PciResult<()> {
        let mut ident = [0u8; IDENT_LEN];
        let got = self.read(dev, &mut ident, 0).unwrap_or(0);

        if got >= IDENT_LEN {
            dev.vendor_id = u16::from_le_bytes([ident[0x00], ident[0x01]]);
            dev.device_id = u16::from_le_bytes([ident[0x02], ident[0x03]]);
            dev.revision = ident[0x08];
            dev.device_class =
                u32::from(ident[0x09]) | u32::from(ident[0x0a]) << 8 | u32::from(ident[0x0b]) << 16;
            dev.subvendor_id = u16::from_le_bytes([ident[0x2c], ident[0x2d]]);
            dev.subdevice_id = u16::from_le_bytes([ident[0x2e], ident[0x2f]]);
        } else {
            dev.vendor_id = self.read_hex_attr(dev, "vendor").ok_or(PciError::NoDevice)? as u16;
            dev.device_id = self.read_hex_attr(dev, "device").ok_or(PciError::NoDevice)? as u16;
            dev.device_class = self.read_hex_attr(dev, "class").unwrap_or(0) as u32;
            dev.revision = self.read_hex_attr(dev, "revision").unwrap_or(0) as u8;
        }

        // Attributes win over config space when present
        if let Some(id) = self.read_hex_attr(dev, "subsystem_vendor") {
            dev.subvendor_id = id as u16;
        }
        if let Some(id) = self.read_hex_attr(dev, "subsystem_device") {
            dev.subdevice_id = id as u16;
        }
        Ok(())
    }

    fn open_resource(&self, dev: &PciDevice, bar: usize, flags: MapFlags) -> PciResult<File> {
        let writable = flags.contains(MapFlags::WRITABLE);
        let open = |name: String| {
            OpenOptions::new()
                .read(true)
                .write(writable)
                .open(self.attr(dev, &name))
        };

        if flags.contains(MapFlags::WRITE_COMBINE) {
            match open(format!("resource{}_wc", bar)) {
                Ok(file) => return Ok(file),
                Err(_) => {
                    debug_map!("sysfs: no resource{}_wc, using uncached", bar);
                }
            }
        }
        Ok(open(format!("resource{}", bar))?)
    }

    fn set_enable(&self, dev: &PciDevice, on: bool) -> PciResult<()> {
        let mut file = OpenOptions::new().write(true).open(self.attr(dev, "enable"))?;
        file.write_all(if on { b"1" } else { b"0" })?;
        Ok(())
    }

    fn io_file(handle: &IoHandle) -> Option<&File> {
        handle.file.as_ref()
    }

    fn io_read<const N: usize>(handle: &IoHandle, reg: u32) -> Option<[u8; N]> {
        let file = Self::io_file(handle)?;
        let mut buf = [0u8; N];
        match file.read_at(&mut buf, handle.base + u64::from(reg)) {
            Ok(n) if n == N => Some(buf),
            _ => None,
        }
    }

    fn io_write(handle: &IoHandle, reg: u32, data: &[u8]) {
        if let Some(file) = Self::io_file(handle) {
            let _ = file.write_at(data, handle.base + u64::from(reg));
        }
    }
}

impl Backend for SysfsBackend {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    fn enumerate(&mut self) -> PciResult<Vec<PciDevice>> {
        let mut slots: Vec<PciSlot> = fs::read_dir(self.devices_dir())?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| PciSlot::parse(&entry.file_name().to_string_lossy()))
            .collect();
        slots.sort();

        let mut devices = Vec::with_capacity(slots.len());
        for slot in slots {
            let mut dev = PciDevice::new(slot);
            match self.identify(&mut dev) {
                Ok(()) => devices.push(dev),
                Err(_err) => {
                    debug_bus!("sysfs: skipping {}: {}", slot, _err);
                }
            }
        }

        debug_bus!("sysfs: {} function(s) found", devices.len());
        Ok(devices)
    }

    fn probe(&self, dev: &mut PciDevice) -> PciResult<()> {
        let resources = self.read_attr(dev, "resource")?;
        let (mut regions, rom) = parse_resources(&resources);
        for (probed, current) in regions.iter_mut().zip(dev.regions.iter()) {
            probed.memory = current.memory;
        }
        dev.regions = regions;

        if let Some((base, size)) = rom {
            dev.rom_base = base;
            dev.rom_size = size;
        } else if let Ok(meta) = fs::metadata(self.attr(dev, "rom")) {
            dev.rom_size = meta.len();
        }

        dev.irq = match self.read_attr(dev, "irq") {
            Ok(text) => text.trim().parse().unwrap_or(-1),
            Err(_) => {
                let mut line = [0u8; 1];
                match self.read(dev, &mut line, PCI_INTERRUPT_LINE) {
                    Ok(1) => i32::from(line[0]),
                    _ => -1,
                }
            }
        };

        let mut header = [0u8; 1];
        if self.read(dev, &mut header, PCI_HEADER_TYPE)? == 1 {
            dev.header_type = header[0] & 0x7f;
        }

        debug_bus!("sysfs: probed {} rom_size={:#x} irq={}", dev.slot(), dev.rom_size, dev.irq);
        Ok(())
    }

    fn read(&self, dev: &PciDevice, buf: &mut [u8], offset: u64) -> PciResult<usize> {
        let file = File::open(self.attr(dev, "config"))?;
        let mut done = 0;
        while done < buf.len() {
            let n = file.read_at(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    fn write(&self, dev: &PciDevice, buf: &[u8], offset: u64) -> PciResult<usize> {
        let file = OpenOptions::new().write(true).open(self.attr(dev, "config"))?;
        let mut done = 0;
        while done < buf.len() {
            let n = file.write_at(&buf[done..], offset + done as u64)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    fn map_range(&self, dev: &PciDevice, map: &Mapping) -> PciResult<NonNull<u8>> {
        let region = dev.regions.get(map.region).ok_or(PciError::InvalidArgument)?;
        let offset = map.base.checked_sub(region.base_addr).ok_or(PciError::InvalidArgument)?;

        let file = self.open_resource(dev, map.region, map.flags)?;
        let ptr = mmap_file(&file, offset, map.size, map.flags.contains(MapFlags::WRITABLE))?;
        debug_map!(
            "sysfs: {} resource{} +{:#x} len {:#x} -> {:p}",
            dev.slot(),
            map.region,
            offset,
            map.size,
            ptr
        );
        Ok(ptr)
    }

    fn unmap_range(&self, _dev: &PciDevice, map: &Mapping) -> PciResult<()> {
        match map.memory {
            Some(addr) => munmap(addr, map.size),
            None => Err(PciError::NotFound),
        }
    }

    fn read_rom(&self, dev: &PciDevice, buf: &mut [u8]) -> PciResult<usize> {
        let path = self.attr(dev, "rom");
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        // The ROM only reads back after it has been switched on
        file.write_all(b"1")?;
        let mut done = 0;
        let result = loop {
            if done == buf.len() {
                break Ok(done);
            }
            match file.read_at(&mut buf[done..], done as u64) {
                Ok(0) => break Ok(done),
                Ok(n) => done += n,
                Err(err) => break Err(PciError::from(err)),
            }
        };
        let _ = file.write_at(b"0", 0);

        result
    }

    fn enable(&self, dev: &PciDevice) -> PciResult<()> {
        self.set_enable(dev, true)
    }

    fn disable(&self, dev: &PciDevice) -> PciResult<()> {
        self.set_enable(dev, false)
    }

    fn boot_vga(&self, dev: &PciDevice) -> bool {
        matches!(self.read_attr(dev, "boot_vga"), Ok(text) if text.trim() == "1")
    }

    fn has_kernel_driver(&self, dev: &PciDevice) -> bool {
        fs::symlink_metadata(self.attr(dev, "driver")).is_ok()
    }

    fn open_device_io(
        &self,
        dev: &PciDevice,
        bar: usize,
        base: u64,
        size: u64,
    ) -> PciResult<IoHandle> {
        let region = dev.regions.get(bar).ok_or(PciError::InvalidArgument)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.attr(dev, &format!("resource{}", bar)))?;

        // Offsets into resourceN are relative to the BAR
        let mut handle = IoHandle::new(base - region.base_addr, size);
        handle.bar = Some(bar);
        handle.file = Some(file);
        Ok(handle)
    }

    fn open_legacy_io(&self, dev: &PciDevice, base: u64, size: u64) -> PciResult<IoHandle> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.legacy_file(dev, "legacy_io"))?;

        let mut handle = IoHandle::new(base, size);
        handle.is_legacy = true;
        handle.file = Some(file);
        Ok(handle)
    }

    fn close_io(&self, _dev: &PciDevice, handle: IoHandle) {
        drop(handle);
    }

    fn read8(&self, handle: &IoHandle, reg: u32) -> u8 {
        Self::io_read::<1>(handle, reg).map_or(u8::MAX, |b| b[0])
    }

    fn read16(&self, handle: &IoHandle, reg: u32) -> u16 {
        Self::io_read::<2>(handle, reg).map_or(u16::MAX, u16::from_le_bytes)
    }

    fn read32(&self, handle: &IoHandle, reg: u32) -> u32 {
        Self::io_read::<4>(handle, reg).map_or(u32::MAX, u32::from_le_bytes)
    }

    fn write8(&self, handle: &IoHandle, reg: u32, data: u8) {
        Self::io_write(handle, reg, &[data]);
    }

    fn write16(&self, handle: &IoHandle, reg: u32, data: u16) {
        Self::io_write(handle, reg, &data.to_le_bytes());
    }

    fn write32(&self, handle: &IoHandle, reg: u32, data: u32) {
        Self::io_write(handle, reg, &data.to_le_bytes());
    }

    fn map_legacy(
        &self,
        dev: &PciDevice,
        base: u64,
        size: u64,
        flags: MapFlags,
    ) -> PciResult<NonNull<u8>> {
        let writable = flags.contains(MapFlags::WRITABLE);
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(self.legacy_file(dev, "legacy_mem"))?;
        mmap_file(&file, base, size, writable)
    }

    fn unmap_legacy(&self, _dev: &PciDevice, addr: NonNull<u8>, size: u64) -> PciResult<()> {
        munmap(addr, size)
    }
}
