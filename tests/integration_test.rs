//! Integration tests for the public pciaccess API

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use pciaccess::{
    Backend, Config, DeviceIterator, IdMatch, MapFlags, Mapping, PciDevice, PciError, PciResult,
    PciSlot, Region, Session, SlotMatch, VgaRsrc, MATCH_ANY, NUM_REGIONS,
};

// ============================================================================
// Fake machine
// ============================================================================

/// One function: config space plus BARs
struct Function {
    slot: PciSlot,
    config: [u8; 256],
    regions: [Region; NUM_REGIONS],
}

impl Function {
    fn new(slot: PciSlot, vendor: u16, device: u16, class: u32) -> Self {
        let mut config = [0u8; 256];
        config[0..2].copy_from_slice(&vendor.to_le_bytes());
        config[2..4].copy_from_slice(&device.to_le_bytes());
        config[0x09..0x0c].copy_from_slice(&class.to_le_bytes()[..3]);
        Function {
            slot,
            config,
            regions: [Region::default(); NUM_REGIONS],
        }
    }
}

/// Backend over a fixed table of functions
struct Machine {
    functions: Vec<Function>,
    mapped: Rc<RefCell<Vec<u64>>>,
    _ids: IdsFile,
}

impl Machine {
    fn function(&self, dev: &PciDevice) -> PciResult<&Function> {
        self.functions
            .iter()
            .find(|f| f.slot == dev.slot())
            .ok_or(PciError::NoDevice)
    }
}

impl Backend for Machine {
    fn name(&self) -> &'static str {
        "machine"
    }

    fn enumerate(&mut self) -> PciResult<Vec<PciDevice>> {
        Ok(self
            .functions
            .iter()
            .map(|f| {
                let mut dev = PciDevice::new(f.slot);
                dev.vendor_id = u16::from_le_bytes([f.config[0], f.config[1]]);
                dev.device_id = u16::from_le_bytes([f.config[2], f.config[3]]);
                dev.device_class =
                    u32::from_le_bytes([f.config[0x09], f.config[0x0a], f.config[0x0b], 0]);
                dev
            })
            .collect())
    }

    fn probe(&self, dev: &mut PciDevice) -> PciResult<()> {
        dev.regions = self.function(dev)?.regions;
        Ok(())
    }

    fn read(&self, dev: &PciDevice, buf: &mut [u8], offset: u64) -> PciResult<usize> {
        let config = &self.function(dev)?.config;
        let start = (offset as usize).min(config.len());
        let n = buf.len().min(config.len() - start);
        buf[..n].copy_from_slice(&config[start..start + n]);
        Ok(n)
    }

    fn write(&self, _dev: &PciDevice, _buf: &[u8], _offset: u64) -> PciResult<usize> {
        Err(PciError::NotSupported)
    }

    fn map_range(&self, _dev: &PciDevice, map: &Mapping) -> PciResult<NonNull<u8>> {
        self.mapped.borrow_mut().push(map.base);
        NonNull::new(map.base as usize as *mut u8).ok_or(PciError::Fault)
    }

    fn unmap_range(&self, _dev: &PciDevice, map: &Mapping) -> PciResult<()> {
        self.mapped.borrow_mut().retain(|&base| base != map.base);
        Ok(())
    }
}

const BRIDGE: PciSlot = PciSlot::new(0, 0, 0x1c, 0);
const NIC: PciSlot = PciSlot::new(0, 0, 0x19, 0);
const GPU: PciSlot = PciSlot::new(0, 3, 0, 0);

fn machine() -> (Session, Rc<RefCell<Vec<u64>>>) {
    let mut bridge = Function::new(BRIDGE, 0x8086, 0x9d10, 0x06_0400);
    bridge.config[0x0e] = 0x01;
    bridge.config[0x18..0x1b].copy_from_slice(&[0x00, 0x03, 0x03]);

    let nic = Function::new(NIC, 0x8086, 0x15d7, 0x02_0000);

    let mut gpu = Function::new(GPU, 0x10de, 0x1c82, 0x03_0000);
    gpu.regions[0] = Region {
        base_addr: 0xd000_0000,
        bus_addr: 0xd000_0000,
        size: 0x0100_0000,
        ..Default::default()
    };

    let mapped = Rc::new(RefCell::new(Vec::new()));
    let ids = IdsFile::new();
    let config = ids.config();
    let backend = Machine {
        functions: vec![nic, bridge, gpu],
        mapped: Rc::clone(&mapped),
        _ids: ids,
    };
    let session = Session::with_backend(Box::new(backend), config).unwrap();
    (session, mapped)
}

const PCI_IDS: &str = "\
# test database
10de  NVIDIA Corporation
\t1c82  GP107 [GeForce GTX 1050 Ti]
8086  Intel Corporation
\t15d7  Ethernet Connection (4) I219-LM
\t9d10  Sunrise Point-LP PCI Express Root Port #2
";

/// Private pci.ids copy, removed on drop
struct IdsFile {
    path: PathBuf,
}

impl IdsFile {
    fn new() -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let path = std::env::temp_dir().join(format!(
            "pciaccess-it-{}-{}.ids",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&path, PCI_IDS).unwrap();
        IdsFile { path }
    }

    fn config(&self) -> Config {
        Config::default().with_ids_path(self.path.clone())
    }
}

impl Drop for IdsFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Arbiter channel that replays canned status lines
struct ScriptedArbiter {
    replies: VecDeque<&'static str>,
    commands: Rc<RefCell<Vec<String>>>,
}

impl Read for ScriptedArbiter {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let reply = self.replies.pop_front().unwrap_or("");
        let n = reply.len().min(buf.len());
        buf[..n].copy_from_slice(&reply.as_bytes()[..n]);
        Ok(n)
    }
}

impl Write for ScriptedArbiter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.commands
            .borrow_mut()
            .push(String::from_utf8_lossy(buf).into_owned());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_enumerate_and_filter() {
    let (session, _) = machine();
    assert_eq!(session.len(), 3);

    let bridges: Vec<PciSlot> = session
        .devices(IdMatch::class(0x06_0000, 0xff_0000))
        .map(|d| d.slot())
        .collect();
    assert_eq!(bridges, vec![BRIDGE]);

    let mut on_bus0 = DeviceIterator::slot(SlotMatch::new(0, 0, MATCH_ANY, MATCH_ANY));
    let mut count = 0;
    while on_bus0.next(&session).is_some() {
        count += 1;
    }
    assert_eq!(count, 2);

    assert!(session.find_by_slot(0, 3, 0, 0).is_some());
    assert!(session.find_by_slot(0, 4, 0, 0).is_none());
}

#[test]
fn test_names_from_database_file() {
    let (mut session, _) = machine();
    let gpu = session.find_by_slot(0, 3, 0, 0).unwrap();

    assert_eq!(session.vendor_name(gpu), Some("NVIDIA Corporation"));
    assert_eq!(session.device_name(gpu), Some("GP107 [GeForce GTX 1050 Ti]"));

    let strings = session.strings(&IdMatch::new(0x8086, 0x9d10, MATCH_ANY, MATCH_ANY));
    assert_eq!(strings.vendor.as_deref(), Some("Intel Corporation"));
    assert_eq!(
        strings.device.as_deref(),
        Some("Sunrise Point-LP PCI Express Root Port #2")
    );
    assert_eq!(strings.subvendor, None);
}

#[test]
fn test_probe_map_and_unmap() {
    let (mut session, mapped) = machine();
    let gpu = session.find_by_slot(0, 3, 0, 0).unwrap();
    session.probe(gpu).unwrap();

    let ptr = session
        .map_range(gpu, 0xd000_1000, 0x1000, MapFlags::WRITABLE)
        .unwrap();
    assert_eq!(*mapped.borrow(), vec![0xd000_1000]);
    assert_eq!(session.device(gpu).unwrap().mappings().len(), 1);

    assert_eq!(
        session.map_range(gpu, 0xd000_1000, 0x1000, MapFlags::empty()),
        Err(PciError::InvalidArgument)
    );
    assert_eq!(
        session.map_range(gpu, 0xd0ff_f000, 0x2000, MapFlags::empty()),
        Err(PciError::TooBig)
    );

    session.unmap_range(gpu, ptr, 0x1000).unwrap();
    assert!(mapped.borrow().is_empty());
    assert_eq!(session.unmap_range(gpu, ptr, 0x1000), Err(PciError::NotFound));
}

#[test]
fn test_bridge_topology() {
    let (mut session, _) = machine();
    let gpu = session.find_by_slot(0, 3, 0, 0).unwrap();
    let bridge = session.find_by_slot(0, 0, 0x1c, 0).unwrap();
    let nic = session.find_by_slot(0, 0, 0x19, 0).unwrap();

    assert_eq!(session.parent_bridge(gpu), Some(bridge));
    assert_eq!(session.bridge_buses(bridge), Ok((0, 3, 3)));
    assert_eq!(session.bridge_buses(nic), Err(PciError::NoDevice));
}

#[test]
fn test_vga_arbitration() {
    let (mut session, _) = machine();
    let gpu = session.find_by_slot(0, 3, 0, 0).unwrap();
    let commands = Rc::new(RefCell::new(Vec::new()));

    let channel = ScriptedArbiter {
        replies: VecDeque::from([
            "count:2,PCI:0000:03:00.0,decodes=io+mem,owns=io+mem,locks=none(0:0)\n",
        ]),
        commands: Rc::clone(&commands),
    };
    session.vgaarb_init_with_channel(Box::new(channel)).unwrap();

    assert_eq!(
        session.vgaarb_info(gpu),
        Ok((2, VgaRsrc::LEGACY_IO | VgaRsrc::LEGACY_MEM))
    );

    session.vgaarb_lock().unwrap();
    session.vgaarb_unlock().unwrap();
    assert_eq!(*commands.borrow(), vec!["lock io+mem", "unlock io+mem"]);

    session.vgaarb_fini();
    assert_eq!(session.vgaarb_lock(), Err(PciError::NotSupported));
    assert_eq!(session.vgaarb_unlock(), Ok(()));
}

#[test]
fn test_cleanup_unmaps_regions() {
    let (mut session, mapped) = machine();
    let gpu = session.find_by_slot(0, 3, 0, 0).unwrap();
    session.probe(gpu).unwrap();
    session.map_region(gpu, 0, false).unwrap();
    assert_eq!(mapped.borrow().len(), 1);

    session.cleanup();
    assert!(mapped.borrow().is_empty());
}

// ============================================================================
// sysfs end to end
// ============================================================================

#[cfg(target_os = "linux")]
#[test]
fn test_hardware_session_over_fake_sysfs() {
    let root: PathBuf = std::env::temp_dir().join(format!("pciaccess-it-sysfs-{}", std::process::id()));
    let dir = root.join("bus/pci/devices/0000:00:02.0");
    fs::create_dir_all(&dir).unwrap();

    let mut config = [0u8; 64];
    config[0..4].copy_from_slice(&[0x86, 0x80, 0x16, 0x59]);
    config[0x0b] = 0x03;
    fs::write(dir.join("config"), config).unwrap();
    fs::write(
        dir.join("resource"),
        "0x00000000a0000000 0x00000000a0ffffff 0x0000000000140204\n",
    )
    .unwrap();

    let ids = IdsFile::new();
    let mut settings = ids.config();
    settings.sysfs_root = root.clone();

    let mut session = Session::init_with_config(settings.clone()).unwrap();
    assert_eq!(session.backend().name(), "sysfs");
    assert!(matches!(
        Session::init_with_config(settings),
        Err(PciError::Busy)
    ));

    let igd = session.find_by_slot(0, 0, 2, 0).unwrap();
    session.probe(igd).unwrap();
    let dev = session.device(igd).unwrap();
    assert_eq!(dev.vendor_id, 0x8086);
    assert_eq!(dev.device_class, 0x03_0000);
    assert_eq!(dev.regions[0].size, 0x0100_0000);
    assert!(dev.regions[0].is_64);
    assert_eq!(session.cfg_read_u16(igd, 2), Ok(0x5916));

    session.cleanup();
    let _ = fs::remove_dir_all(&root);
}
