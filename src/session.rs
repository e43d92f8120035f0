//! Library session
//!
//! A [`Session`] owns the platform backend, the table of every PCI function
//! it found, the name database and the VGA arbiter connection. Devices are
//! addressed by [`DeviceHandle`] for the life of the session. Tearing the
//! session down (explicitly or by dropping it) releases all of it once.

use pciaccess_backend::{debug_bus, Backend, PciError, PciResult};

use crate::config::Config;
use crate::device::{Device, DeviceHandle};
use crate::iter::{DeviceIterator, Devices, Filter, SlotMatch};
use crate::names::NameDb;
use crate::vgaarb::VgaArbiter;

// ============================================================================
// Hardware session claim
// ============================================================================

/// Set while a session backed by real hardware is alive
static HARDWARE_SESSION: spin::Mutex<bool> = spin::Mutex::new(false);

/// Held by the one hardware-backed session of the process
#[derive(Debug)]
struct SessionClaim(());

impl SessionClaim {
    fn acquire() -> PciResult<Self> {
        let mut active = HARDWARE_SESSION.lock();
        if *active {
            return Err(PciError::Busy);
        }
        *active = true;
        Ok(SessionClaim(()))
    }
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        *HARDWARE_SESSION.lock() = false;
    }
}

// ============================================================================
// Backend selection
// ============================================================================

#[cfg(target_os = "linux")]
fn select_backend(config: &Config) -> PciResult<Box<dyn Backend>> {
    if pciaccess_sysfs::SysfsBackend::available(&config.sysfs_root) {
        return Ok(Box::new(pciaccess_sysfs::SysfsBackend::new(config.sysfs_root.clone())));
    }
    fallback_backend(config)
}

/// Raw configuration mechanism #1 when sysfs is not mounted
#[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
fn fallback_backend(config: &Config) -> PciResult<Box<dyn Backend>> {
    let backend = pciaccess_portio::PortIoBackend::open(config.dev_mem_path.clone())?;
    Ok(Box::new(backend))
}

#[cfg(all(target_os = "linux", not(any(target_arch = "x86", target_arch = "x86_64"))))]
fn fallback_backend(_config: &Config) -> PciResult<Box<dyn Backend>> {
    Err(PciError::NotSupported)
}

#[cfg(not(target_os = "linux"))]
fn select_backend(_config: &Config) -> PciResult<Box<dyn Backend>> {
    Err(PciError::NotSupported)
}

// ============================================================================
// Session
// ============================================================================

/// Open connection to the PCI subsystem
pub struct Session {
    backend: Box<dyn Backend>,
    pub(crate) devices: Vec<Device>,
    names: NameDb,
    pub(crate) vgaarb: Option<VgaArbiter>,
    pub(crate) config: Config,
    claim: Option<SessionClaim>,
    torn_down: bool,
}

impl Session {
    /// Open the platform's PCI facility with paths from the environment
    ///
    /// Only one such session may exist at a time; a second call while the
    /// first is alive fails with `Busy`.
    pub fn init() -> PciResult<Self> {
        Session::init_with_config(Config::from_env())
    }

    /// Same as [`Session::init`] with explicit paths
    pub fn init_with_config(config: Config) -> PciResult<Self> {
        let claim = SessionClaim::acquire()?;
        let backend = select_backend(&config)?;
        let mut session = Session::build(backend, config)?;
        session.claim = Some(claim);
        Ok(session)
    }

    /// Session over a caller-supplied backend
    ///
    /// Not subject to the one-hardware-session limit.
    pub fn with_backend(backend: Box<dyn Backend>, config: Config) -> PciResult<Self> {
        Session::build(backend, config)
    }

    fn build(mut backend: Box<dyn Backend>, config: Config) -> PciResult<Self> {
        let records = backend.enumerate()?;
        debug_bus!("{}: {} device(s)", backend.name(), records.len());

        let devices = records
            .into_iter()
            .enumerate()
            .map(|(index, info)| Device::new(DeviceHandle(index), info))
            .collect();

        Ok(Session {
            backend,
            devices,
            names: NameDb::new(config.ids_paths.clone()),
            vgaarb: None,
            config,
            claim: None,
            torn_down: false,
        })
    }

    /// Tear the session down now instead of at drop
    pub fn cleanup(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.vgaarb = None;

        for index in 0..self.devices.len() {
            let handle = DeviceHandle(index);
            for region in 0..self.devices[index].info.regions.len() {
                if self.devices[index].info.regions[region].memory.is_some() {
                    if let Err(_err) = self.unmap_region(handle, region) {
                        debug_bus!("{}: BAR{} unmap failed: {}", self.devices[index].slot(), region, _err);
                    }
                }
            }
        }

        for device in self.devices.iter_mut() {
            device.agp = None;
            device.bridge = None;
            self.backend.destroy_device(&mut device.info);
        }
        self.devices.clear();
        self.names.clear();
        self.backend.destroy();

        debug_bus!("{}: session closed", self.backend.name());
        self.claim = None;
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Every device in enumeration order
    pub fn device_table(&self) -> &[Device] {
        &self.devices
    }

    /// Device behind `handle`; `Fault` if it does not belong to this session
    pub fn device(&self, handle: DeviceHandle) -> PciResult<&Device> {
        self.devices.get(handle.index()).ok_or(PciError::Fault)
    }

    /// Mutable device entry; only `user_data` is writable from outside
    pub fn device_mut(&mut self, handle: DeviceHandle) -> PciResult<&mut Device> {
        self.devices.get_mut(handle.index()).ok_or(PciError::Fault)
    }

    pub(crate) fn backend_and_device(&mut self, handle: DeviceHandle) -> PciResult<(&dyn Backend, &mut Device)> {
        let device = self.devices.get_mut(handle.index()).ok_or(PciError::Fault)?;
        Ok((self.backend.as_ref(), device))
    }

    pub(crate) fn names_mut(&mut self) -> &mut NameDb {
        &mut self.names
    }

    /// Borrowing iterator over devices that pass `filter`
    pub fn devices(&self, filter: impl Into<Filter>) -> Devices<'_> {
        Devices::new(&self.devices, filter.into())
    }

    /// Device at one exact slot
    pub fn find_by_slot(&self, domain: u32, bus: u32, dev: u32, func: u32) -> Option<DeviceHandle> {
        let mut iter = DeviceIterator::slot(SlotMatch::new(domain, bus, dev, func));
        iter.next(self)
    }

    // ------------------------------------------------------------------------
    // Per-device operations
    // ------------------------------------------------------------------------

    /// Read BARs, ROM, IRQ and header type from the backend
    pub fn probe(&mut self, handle: DeviceHandle) -> PciResult<()> {
        let (backend, device) = self.backend_and_device(handle)?;
        let cached = device.info.regions.map(|r| r.memory);
        backend.probe(&mut device.info)?;
        // Whole-BAR mappings outlive a re-probe
        for (region, memory) in device.info.regions.iter_mut().zip(cached) {
            if memory.is_some() {
                region.memory = memory;
            }
        }

        let mut header = [0u8; 1];
        if backend.read(&device.info, &mut header, 0x0e)? == 1 {
            device.info.header_type = header[0] & 0x7f;
        }
        device.info.probed = true;

        debug_bus!(
            "{}: probed {:04x}:{:04x} class {:06x} header {}",
            device.info.slot(),
            device.info.vendor_id,
            device.info.device_id,
            device.info.device_class,
            device.info.header_type
        );
        Ok(())
    }

    /// Copy the expansion ROM into `buf`; `NotFound` if there is none
    pub fn read_rom(&mut self, handle: DeviceHandle, buf: &mut [u8]) -> PciResult<usize> {
        let device = self.device(handle)?;
        if device.rom_size == 0 {
            return Err(PciError::NotFound);
        }
        self.backend.read_rom(&device.info, buf)
    }

    /// Turn on I/O and memory decoding
    pub fn enable(&mut self, handle: DeviceHandle) -> PciResult<()> {
        let device = self.device(handle)?;
        self.backend.enable(&device.info)
    }

    pub fn disable(&mut self, handle: DeviceHandle) -> PciResult<()> {
        let device = self.device(handle)?;
        self.backend.disable(&device.info)
    }

    /// Whether firmware brought this device up as the console display
    pub fn is_boot_vga(&self, handle: DeviceHandle) -> bool {
        self.device(handle)
            .map(|d| self.backend.boot_vga(&d.info))
            .unwrap_or(false)
    }

    /// Whether a kernel driver is bound to the device
    pub fn has_kernel_driver(&self, handle: DeviceHandle) -> bool {
        self.device(handle)
            .map(|d| self.backend.has_kernel_driver(&d.info))
            .unwrap_or(false)
    }

    /// Number of devices in the table
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Handles of every device, for callers that need indices up front
    pub fn handles(&self) -> impl Iterator<Item = DeviceHandle> {
        (0..self.devices.len()).map(DeviceHandle)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_hardware_claim() {
        let claim = SessionClaim::acquire().unwrap();
        assert_eq!(SessionClaim::acquire().err(), Some(PciError::Busy));
        drop(claim);

        let again = SessionClaim::acquire();
        assert!(again.is_ok());
    }
}
