//! scanpci - list PCI devices
//!
//! Usage:
//!   scanpci           # one entry per function with vendor/device names
//!   scanpci -v        # also dump config header, BARs and bridge buses
//!
//! Paths can be redirected with PCIACCESS_SYSFS_ROOT, PCIACCESS_IDS and
//! PCIACCESS_VGAARB.

use std::fmt::Write as _;
use std::process::ExitCode;

use clap::Parser;
use pciaccess::{Config, DeviceHandle, PciResult, Region, Session, NUM_REGIONS};

#[derive(Parser)]
#[command(name = "scanpci")]
#[command(about = "List PCI devices with their names and resources")]
struct Args {
    /// Dump configuration header and resources for each device
    #[arg(short, long)]
    verbose: bool,
}

/// Config header fields shown in verbose mode
struct Header {
    command: u16,
    status: u16,
    cache_line: u8,
    latency: u8,
    header_type: u8,
    bist: u8,
    int_line: u8,
    int_pin: u8,
    min_gnt: u8,
    max_lat: u8,
}

fn read_header(session: &Session, handle: DeviceHandle) -> PciResult<Header> {
    let mut cfg = [0u8; 64];
    session.cfg_read(handle, &mut cfg, 0)?;
    Ok(Header {
        command: u16::from_le_bytes([cfg[0x04], cfg[0x05]]),
        status: u16::from_le_bytes([cfg[0x06], cfg[0x07]]),
        cache_line: cfg[0x0c],
        latency: cfg[0x0d],
        header_type: cfg[0x0e],
        bist: cfg[0x0f],
        int_line: cfg[0x3c],
        int_pin: cfg[0x3d],
        min_gnt: cfg[0x3e],
        max_lat: cfg[0x3f],
    })
}

fn format_region(index: usize, region: &Region) -> String {
    let kind = if region.is_io { "I/O" } else { "MEM" };
    let mut line = format!(
        "  BASE{}     0x{:08x} SIZE {}  {}",
        index, region.base_addr, region.size, kind
    );
    if region.is_64 {
        line.push_str(" 64BIT");
    }
    if region.is_prefetchable {
        line.push_str(" PREFETCHABLE");
    }
    line
}

fn format_title(session: &mut Session, handle: DeviceHandle) -> PciResult<String> {
    let dev = session.device(handle)?;
    let (domain, bus, slot, func) = (dev.domain, dev.bus, dev.dev, dev.func);
    let (vendor_id, device_id) = (dev.vendor_id, dev.device_id);
    let (subvendor_id, subdevice_id) = (dev.subvendor_id, dev.subdevice_id);

    let mut out = String::from("pci ");
    if domain != 0 {
        let _ = write!(out, "domain 0x{:04x} ", domain);
    }
    let _ = writeln!(
        out,
        "bus 0x{:04x} cardnum 0x{:02x} function 0x{:02x}: vendor 0x{:04x} device 0x{:04x}",
        bus, slot, func, vendor_id, device_id
    );

    let vendor = session.vendor_name(handle).map(str::to_owned);
    let device = session.device_name(handle).map(str::to_owned);
    match vendor {
        Some(vendor) => {
            let _ = writeln!(out, " {} {}", vendor, device.as_deref().unwrap_or("Device unknown"));
        }
        None => out.push_str(" Device unknown\n"),
    }

    if subvendor_id != 0 {
        let subvendor = session.subvendor_name(handle).map(str::to_owned);
        let subdevice = session.subdevice_name(handle).map(str::to_owned);
        let _ = writeln!(
            out,
            " CardVendor 0x{:04x} card 0x{:04x} ({}, {})",
            subvendor_id,
            subdevice_id,
            subvendor.as_deref().unwrap_or("Card unknown"),
            subdevice.as_deref().unwrap_or("Card unknown")
        );
    }
    Ok(out)
}

fn format_details(session: &mut Session, handle: DeviceHandle) -> PciResult<String> {
    let header = read_header(session, handle)?;
    let dev = session.device(handle)?;
    let mut out = String::new();

    let _ = writeln!(out, "  STATUS    0x{:04x}  COMMAND 0x{:04x}", header.status, header.command);
    let _ = writeln!(
        out,
        "  CLASS     0x{:02x} 0x{:02x} 0x{:02x}  REVISION 0x{:02x}",
        dev.class(),
        dev.subclass(),
        dev.prog_if(),
        dev.revision
    );
    let _ = writeln!(
        out,
        "  BIST      0x{:02x}  HEADER 0x{:02x}  LATENCY 0x{:02x}  CACHE 0x{:02x}",
        header.bist, header.header_type, header.latency, header.cache_line
    );

    for index in 0..NUM_REGIONS {
        let region = &dev.regions[index];
        if region.size != 0 {
            let _ = writeln!(out, "{}", format_region(index, region));
        }
    }
    if dev.rom_size != 0 {
        let _ = writeln!(out, "  BASEROM   0x{:08x} SIZE {}", dev.rom_base, dev.rom_size);
    }

    let _ = writeln!(
        out,
        "  MAX_LAT   0x{:02x}  MIN_GNT 0x{:02x}  INT_PIN 0x{:02x}  INT_LINE 0x{:02x}",
        header.max_lat, header.min_gnt, header.int_pin, header.int_line
    );

    if let Some(bridge) = session.bridge_info(handle) {
        let _ = writeln!(
            out,
            "  PRIBUS    0x{:02x}  SECBUS 0x{:02x}  SUBBUS 0x{:02x}  SECLT 0x{:02x}",
            bridge.primary_bus,
            bridge.secondary_bus,
            bridge.subordinate_bus,
            bridge.secondary_latency_timer
        );
        let _ = writeln!(
            out,
            "  IOBASE    0x{:04x}  IOLIM 0x{:04x}  MEMBASE 0x{:08x}  MEMLIM 0x{:08x}",
            bridge.io_base, bridge.io_limit, bridge.mem_base, bridge.mem_limit
        );
    } else if let Some(cardbus) = session.cardbus_bridge_info(handle) {
        let _ = writeln!(
            out,
            "  PRIBUS    0x{:02x}  CARDBUS 0x{:02x}  SUBBUS 0x{:02x}  CBLT 0x{:02x}",
            cardbus.primary_bus,
            cardbus.card_bus,
            cardbus.subordinate_bus,
            cardbus.cardbus_latency_timer
        );
    }

    if let Some(agp) = session.agp_info(handle) {
        let _ = writeln!(
            out,
            "  AGP       {}.{}  RATES 0x{:x}  RQ {}",
            agp.major_version, agp.minor_version, agp.rates, agp.max_requests
        );
    }
    Ok(out)
}

fn scan(session: &mut Session, verbose: bool) {
    let handles: Vec<DeviceHandle> = session.handles().collect();
    for handle in handles {
        if let Err(err) = session.probe(handle) {
            eprintln!("scanpci: probe failed for device {}: {}", handle.index(), err);
            continue;
        }

        match format_title(session, handle) {
            Ok(title) => print!("\n{}", title),
            Err(err) => {
                eprintln!("scanpci: {}", err);
                continue;
            }
        }

        if verbose {
            match format_details(session, handle) {
                Ok(details) => print!("{}", details),
                Err(err) => eprintln!("scanpci: config read failed: {}", err),
            }
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut session = match Session::init_with_config(Config::from_env()) {
        Ok(session) => session,
        Err(err) => {
            eprintln!("Couldn't initialize PCI system: {}", err);
            return ExitCode::from(1);
        }
    };

    scan(&mut session, args.verbose);
    session.cleanup();
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_region() {
        let region = Region {
            base_addr: 0xe000_0000,
            size: 0x1000,
            is_prefetchable: true,
            ..Default::default()
        };
        assert_eq!(
            format_region(2, &region),
            "  BASE2     0xe0000000 SIZE 4096  MEM PREFETCHABLE"
        );

        let io = Region {
            base_addr: 0xe000,
            size: 0x80,
            is_io: true,
            ..Default::default()
        };
        assert_eq!(format_region(4, &io), "  BASE4     0x0000e000 SIZE 128  I/O");
    }

    #[test]
    fn test_verbose_flag() {
        assert!(Args::try_parse_from(["scanpci", "-v"]).unwrap().verbose);
        assert!(!Args::try_parse_from(["scanpci"]).unwrap().verbose);
        assert!(Args::try_parse_from(["scanpci", "--bogus"]).is_err());
    }
}
