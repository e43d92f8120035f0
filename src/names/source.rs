//! pci.ids text reader
//!
//! The database is a plain text file. Vendor lines start in column 0,
//! device lines with one tab and subsystem lines with two, each followed by
//! four hex digits. Everything else (comments, the class section, blank
//! lines) fails the hex-digit test and is skipped.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use pciaccess_backend::{debug_names, MATCH_ANY};

use super::tree::{DeviceEntry, VendorLeaf};

/// Where database text comes from
#[derive(Debug, Clone)]
pub enum Source {
    /// Candidate files, first readable one wins
    Paths(Vec<PathBuf>),
    /// Database already held in memory
    Text(Vec<u8>),
}

/// One classified database line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Line<'a> {
    Vendor { id: u16, name: &'a str },
    Device { id: u16, name: &'a str },
    Subdevice { subvendor: u16, subdevice: u16, name: &'a str },
    Other,
}

/// Split four leading hex digits off `s`
fn hex4(s: &str) -> Option<(u16, &str)> {
    let digits = s.get(..4)?;
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let id = u16::from_str_radix(digits, 16).ok()?;
    Some((id, &s[4..]))
}

pub(crate) fn parse_line(line: &str) -> Line<'_> {
    let line = line.trim_end_matches(&['\n', '\r'][..]);
    let tabs = line.bytes().take_while(|&b| b == b'\t').count();

    let Some((id, rest)) = hex4(&line[tabs..]) else {
        return Line::Other;
    };

    match tabs {
        0 => Line::Vendor {
            id,
            name: rest.trim_start(),
        },
        1 => Line::Device {
            id,
            name: rest.trim_start(),
        },
        2 => match hex4(rest.trim_start()) {
            Some((subdevice, name)) => Line::Subdevice {
                subvendor: id,
                subdevice,
                name: name.trim_start(),
            },
            None => Line::Other,
        },
        _ => Line::Other,
    }
}

#[cfg(feature = "gzip")]
fn open_gzip(path: &Path) -> Option<Box<dyn BufRead>> {
    use flate2::read::GzDecoder;

    let mut gz = path.as_os_str().to_owned();
    gz.push(".gz");
    let file = File::open(&gz).ok()?;
    debug_names!("reading {}", Path::new(&gz).display());
    Some(Box::new(BufReader::new(GzDecoder::new(file))))
}

#[cfg(not(feature = "gzip"))]
fn open_gzip(_path: &Path) -> Option<Box<dyn BufRead>> {
    None
}

fn open_path(path: &Path) -> Option<Box<dyn BufRead>> {
    if let Some(reader) = open_gzip(path) {
        return Some(reader);
    }
    let file = File::open(path).ok()?;
    debug_names!("reading {}", path.display());
    Some(Box::new(BufReader::new(file)))
}

impl Source {
    fn open(&self) -> Option<Box<dyn BufRead + '_>> {
        match self {
            Source::Paths(paths) => paths.iter().find_map(|p| open_path(p)),
            Source::Text(text) => Some(Box::new(text.as_slice())),
        }
    }

    /// Scan the database for `leaf.vendor`
    ///
    /// Fills in the vendor name if missing and, when `fill_devices` is set,
    /// appends every device and subsystem line of that vendor. Without
    /// `fill_devices` the scan stops at the vendor line; otherwise it reads
    /// the whole file, so unsorted or repeated vendor sections are all
    /// picked up. A missing database leaves the leaf untouched.
    pub fn populate(&self, leaf: &mut VendorLeaf, fill_devices: bool) {
        let Some(mut reader) = self.open() else {
            debug_names!("no pci.ids database found");
            return;
        };

        let mut raw = Vec::new();
        let mut current_vendor: Option<u16> = None;
        let mut current_device: u16 = 0;

        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let text = String::from_utf8_lossy(&raw);

            match parse_line(&text) {
                Line::Vendor { id, name } => {
                    current_vendor = Some(id);
                    if id == leaf.vendor {
                        if leaf.name.is_none() {
                            leaf.name = Some(name.trim_end().to_owned());
                        }
                        if !fill_devices {
                            break;
                        }
                    }
                }
                Line::Device { id, name } if current_vendor == Some(leaf.vendor) => {
                    current_device = id;
                    leaf.devices.push(DeviceEntry {
                        device_id: id,
                        subvendor_id: MATCH_ANY,
                        subdevice_id: MATCH_ANY,
                        name: name.trim_end().to_owned(),
                    });
                }
                Line::Subdevice {
                    subvendor,
                    subdevice,
                    name,
                } if current_vendor == Some(leaf.vendor) => {
                    leaf.devices.push(DeviceEntry {
                        device_id: current_device,
                        subvendor_id: u32::from(subvendor),
                        subdevice_id: u32::from(subdevice),
                        name: name.trim_end().to_owned(),
                    });
                }
                _ => {}
            }
        }

        debug_names!(
            "vendor {:04x}: {} entries",
            leaf.vendor,
            leaf.devices.len()
        );
    }
}
