//! Generic PCI access
//!
//! Enumerates PCI functions, probes their resources, and gives user space
//! access to configuration space, BAR memory, I/O ports and the expansion
//! ROM, independent of the operating-system facility doing the work.
//!
//! # Usage
//!
//! ```no_run
//! use pciaccess::{DeviceIterator, IdMatch, Session};
//!
//! let mut session = Session::init()?;
//! let mut displays = DeviceIterator::id(IdMatch::class(0x03_0000, 0xff_0000));
//! while let Some(handle) = displays.next(&session) {
//!     session.probe(handle)?;
//!     let name = session.device_name(handle).unwrap_or("unknown").to_owned();
//!     println!("{} {}", session.device(handle)?.slot(), name);
//! }
//! # Ok::<(), pciaccess::PciError>(())
//! ```
//!
//! # Backends
//!
//! On Linux the sysfs backend is used when `/sys/bus/pci` exists; x86 hosts
//! without sysfs fall back to configuration mechanism #1 through ports
//! 0xCF8/0xCFC. Other platforms can plug in their own [`Backend`] through
//! [`Session::with_backend`].
//!
//! # Features
//!
//! - `gzip` (default): also read `pci.ids.gz`
//! - `debug-*`: per-subsystem debug output on stderr, see
//!   [`pciaccess_backend`]

mod byteorder;
mod bridge;
mod capability;
mod cfg;
mod config;
mod device;
mod io;
mod iter;
mod mapping;
mod names;
mod session;
mod vgaarb;

pub use pciaccess_backend::{
    pci_class, AgpInfo, Backend, BridgeWindow, CardbusBridgeInfo, IoHandle, MapFlags, Mapping,
    PciBridgeInfo, PciDevice, PciError, PciResult, PciSlot, Region, VgaRsrc, MATCH_ANY,
    NUM_REGIONS,
};

pub use bridge::{decode_cardbus_bridge, decode_pci_bridge};
pub use capability::{decode_agp, fill_capabilities_generic};
pub use config::Config;
pub use device::{BridgeInfo, Device, DeviceHandle};
pub use iter::{DeviceIterator, Devices, Filter, IdMatch, SlotMatch};
pub use mapping::{MappingTracker, TrackedMapping, LEGACY_WINDOW_END};
pub use names::{NameDb, PciStrings};
pub use session::Session;
pub use vgaarb::{ArbiterChannel, VgaArbiter};
