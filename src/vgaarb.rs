//! VGA arbiter client
//!
//! Legacy VGA I/O ports and the legacy memory window are decoded by
//! whichever VGA device owns them, so several adapters in one domain have to
//! take turns. The kernel arbiter mediates through a character device that
//! speaks one short text command per write:
//!
//! ```text
//! target PCI:0000:01:00.0
//! decodes io+mem
//! lock io+mem | trylock io | unlock mem
//! ```
//!
//! and answers reads with a status line such as
//! `count:2,PCI:0000:01:00.0,decodes=io+mem,owns=io+mem,locks=none`.
//!
//! Without an open arbiter every call fails with `NotSupported` except
//! [`Session::vgaarb_unlock`], which succeeds without doing anything.

use core::fmt;
use std::io::{self, Read, Write};

use pciaccess_backend::{debug_vgaarb, PciError, PciResult, PciSlot, VgaRsrc};

use crate::device::DeviceHandle;
use crate::session::Session;

/// Upper bound on one status line
const BUFSIZE: usize = 64;

/// Byte stream to the arbiter, normally the `/dev/vga_arbiter` file
pub trait ArbiterChannel: Read + Write {}

impl<T: Read + Write> ArbiterChannel for T {}

/// Open arbiter connection and what it last told us
pub struct VgaArbiter {
    channel: Box<dyn ArbiterChannel>,
    vga_count: i32,
    target: Option<DeviceHandle>,
    default_device: Option<DeviceHandle>,
}

impl fmt::Debug for VgaArbiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VgaArbiter")
            .field("vga_count", &self.vga_count)
            .field("target", &self.target)
            .field("default_device", &self.default_device)
            .finish_non_exhaustive()
    }
}

/// Fields of one status line; anything unparseable is left empty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct ArbiterStatus {
    pub count: Option<i32>,
    pub slot: Option<PciSlot>,
    pub decodes: VgaRsrc,
}

fn parse_decodes(value: &str) -> VgaRsrc {
    if value.starts_with("io+mem") {
        VgaRsrc::LEGACY_IO | VgaRsrc::LEGACY_MEM
    } else if value.starts_with("io") {
        VgaRsrc::LEGACY_IO
    } else if value.starts_with("mem") {
        VgaRsrc::LEGACY_MEM
    } else {
        VgaRsrc::empty()
    }
}

/// Parse `count:<n>,PCI:<slot>,decodes=<rsrc>[,...]`
///
/// Fields are positional. Parsing stops at the first malformed field and
/// whatever was read up to that point is kept.
pub(crate) fn parse_status(line: &str) -> ArbiterStatus {
    let mut status = ArbiterStatus::default();
    let mut fields = line.trim_end_matches('\0').trim().split(',');

    let Some(count) = fields
        .next()
        .and_then(|f| f.split_once(':'))
        .and_then(|(_, n)| n.trim().parse::<i32>().ok())
    else {
        return status;
    };
    status.count = Some(count);

    let Some(slot) = fields
        .next()
        .and_then(|f| f.split_once(':'))
        .and_then(|(_, s)| PciSlot::parse(s))
    else {
        return status;
    };
    status.slot = Some(slot);

    if let Some((_, value)) = fields.next().and_then(|f| f.split_once('=')) {
        status.decodes = parse_decodes(value);
    }
    status
}

impl VgaArbiter {
    fn new(channel: Box<dyn ArbiterChannel>) -> Self {
        VgaArbiter {
            channel,
            vga_count: 0,
            target: None,
            default_device: None,
        }
    }

    /// One exact-length command write
    fn write_command(&mut self, command: &str) -> PciResult<()> {
        debug_vgaarb!("> {}", command);
        let bytes = command.as_bytes();
        let written = self.channel.write(bytes)?;
        if written != bytes.len() {
            return Err(PciError::ShortWrite);
        }
        Ok(())
    }

    /// One bounded status read
    fn read_status(&mut self) -> PciResult<ArbiterStatus> {
        let mut buf = [0u8; BUFSIZE];
        let n = self.channel.read(&mut buf)?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        let line = String::from_utf8_lossy(&buf[..n]);
        debug_vgaarb!("< {}", line.trim_end());
        Ok(parse_status(&line))
    }

    /// Read a reply and take the device count from it
    fn refresh(&mut self) -> PciResult<ArbiterStatus> {
        let status = self.read_status()?;
        if let Some(count) = status.count {
            self.vga_count = count;
        }
        Ok(status)
    }

    pub fn vga_count(&self) -> i32 {
        self.vga_count
    }

    pub fn target(&self) -> Option<DeviceHandle> {
        self.target
    }

    /// Device that owned the legacy resources when the arbiter was opened
    pub fn default_device(&self) -> Option<DeviceHandle> {
        self.default_device
    }
}

#[derive(Debug, Clone, Copy)]
enum LockCommand {
    Lock,
    TryLock,
    Unlock,
}

impl LockCommand {
    fn verb(self) -> &'static str {
        match self {
            LockCommand::Lock => "lock",
            LockCommand::TryLock => "trylock",
            LockCommand::Unlock => "unlock",
        }
    }
}

impl Session {
    /// Open the kernel arbiter and learn the default VGA device
    ///
    /// Failure means arbitration is unavailable on this system; the rest of
    /// the library keeps working.
    #[cfg(target_os = "linux")]
    pub fn vgaarb_init(&mut self) -> PciResult<()> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.config.vgaarb_path)?;
        self.vgaarb_init_with_channel(Box::new(file))
    }

    /// No kernel arbiter on this platform
    #[cfg(not(target_os = "linux"))]
    pub fn vgaarb_init(&mut self) -> PciResult<()> {
        Err(PciError::NotSupported)
    }

    /// Start an arbiter session over an already open channel
    pub fn vgaarb_init_with_channel(&mut self, channel: Box<dyn ArbiterChannel>) -> PciResult<()> {
        let mut arbiter = VgaArbiter::new(channel);
        let status = arbiter.refresh()?;

        let default_device = status
            .slot
            .and_then(|s| self.find_by_slot(s.domain, u32::from(s.bus), u32::from(s.dev), u32::from(s.func)));
        if let Some(handle) = default_device {
            self.device_mut(handle)?.info.vgaarb_rsrc = status.decodes;
        }

        debug_vgaarb!(
            "{} VGA device(s), default {:?}",
            arbiter.vga_count,
            status.slot
        );

        arbiter.default_device = default_device;
        arbiter.target = default_device;
        self.vgaarb = Some(arbiter);
        Ok(())
    }

    /// Close the arbiter; later calls behave as if it was never opened
    pub fn vgaarb_fini(&mut self) {
        self.vgaarb = None;
    }

    /// Direct later lock calls at `handle`, or at the default device
    pub fn vgaarb_set_target(&mut self, handle: Option<DeviceHandle>) -> PciResult<()> {
        let arbiter = self.vgaarb.as_mut().ok_or(PciError::NotSupported)?;
        let handle = handle.or(arbiter.default_device).ok_or(PciError::NoDevice)?;
        let slot = self
            .devices
            .get(handle.index())
            .ok_or(PciError::Fault)?
            .slot();

        arbiter.write_command(&format!(
            "target PCI:{:04x}:{:02x}:{:02x}.{:x}",
            slot.domain, slot.bus, slot.dev, slot.func
        ))?;
        let status = arbiter.refresh()?;
        arbiter.target = Some(handle);

        self.device_mut(handle)?.info.vgaarb_rsrc = status.decodes;
        Ok(())
    }

    /// Tell the arbiter which legacy resources the target decodes
    pub fn vgaarb_decodes(&mut self, rsrc: VgaRsrc) -> PciResult<()> {
        let arbiter = self.vgaarb.as_mut().ok_or(PciError::NotSupported)?;
        let handle = arbiter.target.ok_or(PciError::NoDevice)?;
        let device = self.devices.get_mut(handle.index()).ok_or(PciError::Fault)?;

        if device.info.vgaarb_rsrc == rsrc {
            return Ok(());
        }

        let written = arbiter.write_command(&format!("decodes {}", rsrc.as_wire_str()));
        if written.is_ok() {
            device.info.vgaarb_rsrc = rsrc;
        }
        arbiter.refresh()?;
        written
    }

    fn vgaarb_lock_command(&mut self, command: LockCommand) -> PciResult<()> {
        let Some(arbiter) = self.vgaarb.as_mut() else {
            return match command {
                LockCommand::Unlock => Ok(()),
                _ => Err(PciError::NotSupported),
            };
        };
        let handle = arbiter.target.ok_or(PciError::NoDevice)?;
        let rsrc = self
            .devices
            .get(handle.index())
            .ok_or(PciError::Fault)?
            .vgaarb_rsrc;

        if rsrc.is_empty() || arbiter.vga_count == 1 {
            return Ok(());
        }

        arbiter.write_command(&format!("{} {}", command.verb(), rsrc.as_wire_str()))
    }

    /// Block until the target owns its legacy resources
    pub fn vgaarb_lock(&mut self) -> PciResult<()> {
        self.vgaarb_lock_command(LockCommand::Lock)
    }

    /// Take the legacy resources if free; `Busy` if another client holds them
    pub fn vgaarb_trylock(&mut self) -> PciResult<()> {
        self.vgaarb_lock_command(LockCommand::TryLock)
    }

    pub fn vgaarb_unlock(&mut self) -> PciResult<()> {
        self.vgaarb_lock_command(LockCommand::Unlock)
    }

    /// VGA device count and the decode state recorded for `handle`
    pub fn vgaarb_info(&self, handle: DeviceHandle) -> PciResult<(i32, VgaRsrc)> {
        let rsrc = self.device(handle)?.vgaarb_rsrc;
        let count = self.vgaarb.as_ref().map_or(0, |a| a.vga_count);
        Ok((count, rsrc))
    }

    /// Open arbiter session, if any
    pub fn vgaarb(&self) -> Option<&VgaArbiter> {
        self.vgaarb.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_status_line() {
        let status = parse_status("count:2,PCI:0000:01:00.0,decodes=io+mem,owns=io+mem,locks=none\0\0");
        assert_eq!(status.count, Some(2));
        assert_eq!(status.slot, Some(PciSlot::new(0, 1, 0, 0)));
        assert_eq!(status.decodes, VgaRsrc::LEGACY_IO | VgaRsrc::LEGACY_MEM);

        let status = parse_status("count:1,PCI:0001:00:02.1,decodes=mem\n");
        assert_eq!(status.slot, Some(PciSlot::new(1, 0, 2, 1)));
        assert_eq!(status.decodes, VgaRsrc::LEGACY_MEM);

        let status = parse_status("count:3,PCI:0000:00:02.0,decodes=io");
        assert_eq!(status.decodes, VgaRsrc::LEGACY_IO);
    }

    #[test]
    fn test_parse_malformed_is_none() {
        assert_eq!(parse_status(""), ArbiterStatus::default());
        assert_eq!(parse_status("garbage"), ArbiterStatus::default());

        let status = parse_status("count:2,PCI:zz,decodes=io");
        assert_eq!(status.count, Some(2));
        assert_eq!(status.slot, None);
        assert!(status.decodes.is_empty());

        let status = parse_status("count:2,PCI:0000:01:00.0,decodes=weird");
        assert!(status.decodes.is_empty());
    }
}
