//! Resource mapping lifecycle
//!
//! Every device keeps the list of ranges currently mapped through it. A
//! range is identified by its (base, size) pair when mapping and by its
//! (pointer, size) pair when unmapping; the same (base, size) can never be
//! mapped twice at once.

use core::ptr::NonNull;

use pciaccess_backend::{debug_map, MapFlags, Mapping, PciError, PciResult, NUM_REGIONS};

use crate::device::DeviceHandle;
use crate::session::Session;

/// Upper bound (exclusive) of the legacy ISA window
pub const LEGACY_WINDOW_END: u64 = 0x10_0000;

/// One tracked mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedMapping {
    pub mapping: Mapping,
    /// Carved out of a whole-BAR mapping the device already held, so the
    /// backend never saw it and must not be asked to unmap it
    pub borrowed: bool,
}

impl TrackedMapping {
    /// Mapped address; always set for tracked entries
    pub fn memory(&self) -> Option<NonNull<u8>> {
        self.mapping.memory
    }
}

/// Ordered list of a device's active mappings
#[derive(Debug, Default)]
pub struct MappingTracker {
    entries: Vec<TrackedMapping>,
}

impl MappingTracker {
    pub fn new() -> Self {
        MappingTracker { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedMapping> {
        self.entries.iter()
    }

    pub fn get(&self, index: usize) -> Option<&TrackedMapping> {
        self.entries.get(index)
    }

    /// Whether (base, size) is already mapped
    pub fn contains_range(&self, base: u64, size: u64) -> bool {
        self.entries
            .iter()
            .any(|e| e.mapping.base == base && e.mapping.size == size)
    }

    /// Index of the entry mapped at exactly (memory, size)
    pub fn position(&self, memory: NonNull<u8>, size: u64) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.mapping.memory == Some(memory) && e.mapping.size == size)
    }

    pub(crate) fn push(&mut self, entry: TrackedMapping) {
        self.entries.push(entry);
    }

    /// Drop every borrowed entry carved out of BAR `region`
    pub(crate) fn release_borrowed(&mut self, region: usize) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.borrowed && e.mapping.region == region));
        before - self.entries.len()
    }

    /// Remove entry `index`, keeping the order of the rest
    pub(crate) fn remove(&mut self, index: usize) -> TrackedMapping {
        let entry = self.entries.remove(index);
        self.entries.shrink_to_fit();
        entry
    }
}

/// Index of the BAR that contains `base`, checking the range fits
pub(crate) fn find_region(
    regions: &[pciaccess_backend::Region; NUM_REGIONS],
    base: u64,
    size: u64,
) -> PciResult<usize> {
    for (index, region) in regions.iter().enumerate() {
        if region.contains(base) {
            if base.checked_add(size).map_or(true, |end| end > region.end()) {
                return Err(PciError::TooBig);
            }
            return Ok(index);
        }
    }
    Err(PciError::NotFound)
}

impl Session {
    /// Map `size` bytes at bus address `base` of one of the device's BARs
    ///
    /// Fails with `NotFound` if no BAR contains `base`, `TooBig` if the range
    /// runs off the end of that BAR and `InvalidArgument` if exactly this
    /// range is already mapped. Nothing is recorded when the backend fails.
    pub fn map_range(
        &mut self,
        handle: DeviceHandle,
        base: u64,
        size: u64,
        flags: MapFlags,
    ) -> PciResult<NonNull<u8>> {
        let (backend, device) = self.backend_and_device(handle)?;

        let region = find_region(&device.info.regions, base, size)?;
        if device.mappings.contains_range(base, size) {
            return Err(PciError::InvalidArgument);
        }

        let mut mapping = Mapping {
            base,
            size,
            region,
            flags,
            memory: None,
        };

        let cached = device.info.regions[region].memory;
        let (memory, borrowed) = match cached {
            Some(whole) => {
                let offset = base - device.info.regions[region].base_addr;
                // In range: `find_region` checked base + size against the BAR end
                let ptr = whole.as_ptr().wrapping_add(offset as usize);
                (NonNull::new(ptr).ok_or(PciError::Fault)?, true)
            }
            None => (backend.map_range(&device.info, &mapping)?, false),
        };

        mapping.memory = Some(memory);
        device.mappings.push(TrackedMapping { mapping, borrowed });

        debug_map!(
            "{}: mapped {:#x}+{:#x} of BAR{} at {:p}{}",
            device.info.slot(),
            base,
            size,
            region,
            memory.as_ptr(),
            if borrowed { " (cached)" } else { "" }
        );
        Ok(memory)
    }

    /// Unmap a range returned by [`Session::map_range`]
    ///
    /// The (pointer, size) pair must match a tracked mapping exactly. If the
    /// backend fails the entry stays tracked so the call can be retried.
    pub fn unmap_range(&mut self, handle: DeviceHandle, memory: NonNull<u8>, size: u64) -> PciResult<()> {
        let (backend, device) = self.backend_and_device(handle)?;

        let index = device
            .mappings
            .position(memory, size)
            .ok_or(PciError::NotFound)?;

        let entry = device.mappings.entries[index];
        if !entry.borrowed {
            backend.unmap_range(&device.info, &entry.mapping)?;
        }
        device.mappings.remove(index);

        debug_map!("{}: unmapped {:p}+{:#x}", device.info.slot(), memory.as_ptr(), size);
        Ok(())
    }

    /// Map a whole BAR and cache the pointer in the region record
    ///
    /// Mapping a BAR that is already mapped this way is a no-op.
    pub fn map_region(&mut self, handle: DeviceHandle, region: usize, write_enable: bool) -> PciResult<()> {
        let (base, size) = {
            let device = self.device(handle)?;
            let r = device.info.regions.get(region).ok_or(PciError::NotFound)?;
            if r.size == 0 {
                return Err(PciError::NotFound);
            }
            if r.memory.is_some() {
                return Ok(());
            }
            (r.base_addr, r.size)
        };

        let flags = if write_enable {
            MapFlags::WRITABLE
        } else {
            MapFlags::empty()
        };
        let memory = self.map_range(handle, base, size, flags)?;
        self.device_mut(handle)?.info.regions[region].memory = Some(memory);
        Ok(())
    }

    /// Undo [`Session::map_region`]
    ///
    /// Sub-ranges that [`Session::map_range`] carved out of the whole-BAR
    /// mapping go away with it; their pointers are dead afterwards and
    /// `unmap_range` on them reports `NotFound`.
    pub fn unmap_region(&mut self, handle: DeviceHandle, region: usize) -> PciResult<()> {
        let (memory, size) = {
            let device = self.device(handle)?;
            let r = device.info.regions.get(region).ok_or(PciError::NotFound)?;
            if r.size == 0 {
                return Err(PciError::NotFound);
            }
            (r.memory.ok_or(PciError::NotFound)?, r.size)
        };

        self.unmap_range(handle, memory, size)?;
        let device = self.device_mut(handle)?;
        device.info.regions[region].memory = None;
        let _dropped = device.mappings.release_borrowed(region);
        debug_map!("{}: BAR{} released with {} sub-ranges", device.info.slot(), region, _dropped);
        Ok(())
    }

    /// Older spelling of [`Session::map_range`] taking a write-enable flag
    pub fn map_memory_range(
        &mut self,
        handle: DeviceHandle,
        base: u64,
        size: u64,
        write_enable: bool,
    ) -> PciResult<NonNull<u8>> {
        let flags = if write_enable {
            MapFlags::WRITABLE
        } else {
            MapFlags::empty()
        };
        self.map_range(handle, base, size, flags)
    }

    /// Older spelling of [`Session::unmap_range`]
    pub fn unmap_memory_range(&mut self, handle: DeviceHandle, memory: NonNull<u8>, size: u64) -> PciResult<()> {
        self.unmap_range(handle, memory, size)
    }

    /// Map part of the legacy window below 1MB on the device's bus
    ///
    /// Not tied to any BAR and not tracked per device.
    pub fn map_legacy(
        &mut self,
        handle: DeviceHandle,
        base: u64,
        size: u64,
        flags: MapFlags,
    ) -> PciResult<NonNull<u8>> {
        let in_window = base <= LEGACY_WINDOW_END
            && base
                .checked_add(size)
                .map_or(false, |end| end <= LEGACY_WINDOW_END);
        if !in_window {
            return Err(PciError::InvalidArgument);
        }

        let (backend, device) = self.backend_and_device(handle)?;
        backend.map_legacy(&device.info, base, size, flags)
    }

    /// Undo [`Session::map_legacy`]
    pub fn unmap_legacy(&mut self, handle: DeviceHandle, memory: NonNull<u8>, size: u64) -> PciResult<()> {
        let (backend, device) = self.backend_and_device(handle)?;
        backend.unmap_legacy(&device.info, memory, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pciaccess_backend::Region;

    fn regions() -> [Region; NUM_REGIONS] {
        let mut regions = [Region::default(); NUM_REGIONS];
        regions[0] = Region {
            base_addr: 0xe000_0000,
            size: 0x1000_0000,
            ..Default::default()
        };
        regions[2] = Region {
            base_addr: 0xf000_0000,
            size: 0x4000,
            ..Default::default()
        };
        regions
    }

    #[test]
    fn test_find_region() {
        let regions = regions();
        assert_eq!(find_region(&regions, 0xe000_0000, 0x1000), Ok(0));
        assert_eq!(find_region(&regions, 0xf000_3000, 0x1000), Ok(2));
        assert_eq!(find_region(&regions, 0xf000_3000, 0x1001), Err(PciError::TooBig));
        assert_eq!(find_region(&regions, 0xd000_0000, 0x10), Err(PciError::NotFound));
        assert_eq!(find_region(&regions, 0xf000_0000, u64::MAX), Err(PciError::TooBig));
    }

    #[test]
    fn test_tracker_keeps_order_on_remove() {
        let mut tracker = MappingTracker::new();
        let mut backing = [0u8; 3];
        for (i, byte) in backing.iter_mut().enumerate() {
            tracker.push(TrackedMapping {
                mapping: Mapping {
                    base: 0x1000 * i as u64,
                    size: 0x10,
                    region: 0,
                    flags: MapFlags::empty(),
                    memory: NonNull::new(byte as *mut u8),
                },
                borrowed: false,
            });
        }

        tracker.remove(1);
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.get(0).unwrap().mapping.base, 0);
        assert_eq!(tracker.get(1).unwrap().mapping.base, 0x2000);
        assert!(tracker.contains_range(0x2000, 0x10));
        assert!(!tracker.contains_range(0x1000, 0x10));
    }
}
