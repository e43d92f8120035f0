//! Device table entries
//!
//! A [`Device`] is the backend's [`PciDevice`] record plus the state the
//! core keeps privately per device: active mappings and the cached
//! capability and bridge decodes.

use core::ops::Deref;

use pciaccess_backend::{AgpInfo, CardbusBridgeInfo, PciBridgeInfo, PciDevice};

use crate::mapping::MappingTracker;

/// Stable reference to one entry of a session's device table
///
/// Handles stay valid for the whole session; using one with a different
/// session yields [`PciError::Fault`](pciaccess_backend::PciError::Fault)
/// or the wrong device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceHandle(pub(crate) usize);

impl DeviceHandle {
    /// Position in the device table
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Decoded bridge header, cached after the first successful read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeInfo {
    /// Header type 1
    Pci(PciBridgeInfo),
    /// Header type 2
    Cardbus(CardbusBridgeInfo),
}

/// One PCI function owned by a session
#[derive(Debug)]
pub struct Device {
    handle: DeviceHandle,
    pub(crate) info: PciDevice,
    pub(crate) mappings: MappingTracker,
    pub(crate) agp: Option<AgpInfo>,
    pub(crate) bridge: Option<BridgeInfo>,
}

impl Device {
    pub(crate) fn new(handle: DeviceHandle, info: PciDevice) -> Self {
        Device {
            handle,
            info,
            mappings: MappingTracker::new(),
            agp: None,
            bridge: None,
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    /// The backend record for this device
    pub fn info(&self) -> &PciDevice {
        &self.info
    }

    /// Active mappings, oldest first
    pub fn mappings(&self) -> &MappingTracker {
        &self.mappings
    }

    /// Set the caller-owned opaque value
    pub fn set_user_data(&mut self, data: usize) {
        self.info.user_data = data;
    }
}

impl Deref for Device {
    type Target = PciDevice;

    fn deref(&self) -> &PciDevice {
        &self.info
    }
}
