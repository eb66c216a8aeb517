// SPDX-License-Identifier: MIT

//! Capability probing and device fingerprinting.
//!
//! A device's fingerprint is the CRC32 of a canonical ASCII rendering of
//! its capability set (name, key codes, absolute axes with ranges,
//! relative axes). The fingerprint pins a logical device across reboots
//! and replug, independent of its `/dev/input/eventN` number.
//!
//! The kernel surface is abstracted behind [`CapabilitySource`] so the
//! probe, the fingerprint, and the mirror plan can be exercised against a
//! fake device in tests.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::CStr;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::slice;
use std::time::Duration;

use input_ioctls::{
    bits_len, eviocgabs, eviocgbit, eviocgid, eviocgname, eviocgrab, test_bit, ABS_MAX, EV_ABS,
    EV_KEY, EV_MAX, EV_REL, KEY_MAX, REL_MAX,
};
use libc::{c_char, input_absinfo, input_event};
use log::{debug, trace};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

pub const SYS_INPUT_DIR: &str = "/sys/class/input";
pub const DEV_INPUT_DIR: &str = "/dev/input";

/// Narrow view of the evdev capability-query ioctls.
pub trait CapabilitySource {
    /// Device name (EVIOCGNAME).
    fn name(&self) -> io::Result<String>;

    /// Bitmap of supported event types (EVIOCGBIT(0, ..)).
    fn event_types(&self) -> io::Result<Vec<u8>>;

    /// Bitmap of supported codes for one event type.
    fn code_bits(&self, ev_type: u16, max_code: u16) -> io::Result<Vec<u8>>;

    /// Range description of one absolute axis (EVIOCGABS).
    fn abs_info(&self, axis: u16) -> io::Result<input_absinfo>;
}

/// An open evdev character device.
#[derive(Debug)]
pub struct EvdevHandle {
    file: File,
}

impl EvdevHandle {
    /// Opens a device for capability probing only.
    pub fn open_read_only(path: &Path) -> io::Result<EvdevHandle> {
        let file = File::options().read(true).open(path)?;
        Ok(EvdevHandle { file })
    }

    /// Opens a device read-only and non-blocking, for detection mode.
    pub fn open_monitor(path: &Path) -> io::Result<EvdevHandle> {
        let file = File::options()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        Ok(EvdevHandle { file })
    }

    /// Opens a device read-write and non-blocking, for a grabbed session.
    pub fn open_exclusive(path: &Path) -> io::Result<EvdevHandle> {
        let file = File::options()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        Ok(EvdevHandle { file })
    }

    /// Claims the device exclusively (EVIOCGRAB 1). While held, the kernel
    /// suppresses normal dispatch to other consumers.
    pub fn grab(&self) -> io::Result<()> {
        unsafe { eviocgrab(self.as_raw_fd(), 1) }?;
        Ok(())
    }

    /// Releases an exclusive claim (EVIOCGRAB 0).
    pub fn ungrab(&self) -> io::Result<()> {
        unsafe { eviocgrab(self.as_raw_fd(), 0) }?;
        Ok(())
    }

    /// Hardware ids as reported by the driver (EVIOCGID). Used where the
    /// sysfs id files are not readable.
    pub fn input_id(&self) -> io::Result<libc::input_id> {
        let mut id: libc::input_id = unsafe { mem::zeroed() };
        unsafe { eviocgid(self.as_raw_fd(), &mut id) }?;
        Ok(id)
    }

    /// Waits until the device has readable events, or the timeout lapses.
    pub fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let timeout = PollTimeout::try_from(timeout)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "poll timeout out of range"))?;
        loop {
            let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reads one `input_event` record. `WouldBlock` surfaces when the
    /// device has no pending events (non-blocking handles only).
    pub fn read_event(&self) -> io::Result<input_event> {
        let mut event: input_event = unsafe { mem::zeroed() };
        let buf = unsafe {
            slice::from_raw_parts_mut(
                &mut event as *mut input_event as *mut u8,
                mem::size_of::<input_event>(),
            )
        };
        let mut done = 0;
        while done < buf.len() {
            match nix::unistd::read(self.file.as_fd(), &mut buf[done..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "event device closed",
                    ))
                }
                Ok(n) => done += n,
                Err(Errno::EINTR) => continue,
                // Partial records do not occur on evdev; EAGAIN only
                // happens before the first byte.
                Err(Errno::EAGAIN) if done == 0 => {
                    return Err(io::Error::from(io::ErrorKind::WouldBlock))
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(event)
    }
}

impl AsFd for EvdevHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for EvdevHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl CapabilitySource for EvdevHandle {
    fn name(&self) -> io::Result<String> {
        let mut buf = [0 as c_char; 256];
        unsafe { eviocgname(self.as_raw_fd(), &mut buf) }?;
        buf[buf.len() - 1] = 0;
        let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
        Ok(name.to_string_lossy().into_owned())
    }

    fn event_types(&self) -> io::Result<Vec<u8>> {
        let mut bits = vec![0u8; bits_len(EV_MAX)];
        unsafe { eviocgbit(self.as_raw_fd(), 0, &mut bits) }?;
        Ok(bits)
    }

    fn code_bits(&self, ev_type: u16, max_code: u16) -> io::Result<Vec<u8>> {
        let mut bits = vec![0u8; bits_len(max_code)];
        unsafe { eviocgbit(self.as_raw_fd(), ev_type, &mut bits) }?;
        Ok(bits)
    }

    fn abs_info(&self, axis: u16) -> io::Result<input_absinfo> {
        let mut info: input_absinfo = unsafe { mem::zeroed() };
        unsafe { eviocgabs(self.as_raw_fd(), axis, &mut info) }?;
        Ok(info)
    }
}

/// The capability set entering the fingerprint.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    pub name: String,
    pub keys: BTreeSet<u16>,
    pub abs_axes: BTreeMap<u16, input_absinfo>,
    pub rels: BTreeSet<u16>,
}

impl DeviceCapabilities {
    /// Probes a device's capabilities. A failing name or bitmap query
    /// degrades (unnamed device, empty section); a failing absinfo query
    /// fails the probe, since the fingerprint would be ambiguous.
    pub fn probe(source: &dyn CapabilitySource) -> io::Result<DeviceCapabilities> {
        let name = source.name().unwrap_or_else(|_| "Unknown".to_string());

        let keys = match source.code_bits(EV_KEY, KEY_MAX) {
            Ok(bits) => codes_from_bitmap(&bits, KEY_MAX),
            Err(_) => BTreeSet::new(),
        };

        let mut abs_axes = BTreeMap::new();
        if let Ok(bits) = source.code_bits(EV_ABS, ABS_MAX) {
            for axis in codes_from_bitmap(&bits, ABS_MAX) {
                abs_axes.insert(axis, source.abs_info(axis)?);
            }
        }

        let rels = match source.code_bits(EV_REL, REL_MAX) {
            Ok(bits) => codes_from_bitmap(&bits, REL_MAX),
            Err(_) => BTreeSet::new(),
        };

        Ok(DeviceCapabilities {
            name,
            keys,
            abs_axes,
            rels,
        })
    }

    /// Canonical ASCII rendering: `<name>:<num_keys>:` followed by
    /// `K<code>,` per key, `A<code>:<min>,<max>,<fuzz>,<flat>,<res>,` per
    /// absolute axis, and `R<code>,` per relative axis, codes ascending,
    /// trailing comma stripped.
    pub fn canonical_string(&self) -> String {
        let mut s = format!("{}:{}:", self.name, self.keys.len());

        for key in &self.keys {
            let _ = write!(s, "K{key},");
        }
        for (axis, info) in &self.abs_axes {
            let _ = write!(
                s,
                "A{axis}:{},{},{},{},{},",
                info.minimum, info.maximum, info.fuzz, info.flat, info.resolution
            );
        }
        for rel in &self.rels {
            let _ = write!(s, "R{rel},");
        }

        if s.ends_with(',') {
            s.pop();
        }
        s
    }

    /// The device fingerprint: CRC32 over the canonical string.
    pub fn uid(&self) -> u32 {
        crc32fast::hash(self.canonical_string().as_bytes())
    }
}

fn codes_from_bitmap(bits: &[u8], max_code: u16) -> BTreeSet<u16> {
    (0..=max_code).filter(|&code| test_bit(code, bits)).collect()
}

/// Reads a sysfs hexadecimal id file (`id/vendor`, `id/product`).
pub fn read_hex_id(path: &Path) -> io::Result<u16> {
    let text = fs::read_to_string(path)?;
    u16::from_str_radix(text.trim(), 16).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad id file {}: {e}", path.display()),
        )
    })
}

/// Sysfs id directory of a `/dev/input/eventN` node.
fn sysfs_id_dir(event_name: &str) -> PathBuf {
    Path::new(SYS_INPUT_DIR).join(event_name).join("device/id")
}

/// Reads the (vendor, product) pair of an event node from sysfs.
pub fn read_ids(event_name: &str) -> io::Result<(u16, u16)> {
    let dir = sysfs_id_dir(event_name);
    Ok((
        read_hex_id(&dir.join("vendor"))?,
        read_hex_id(&dir.join("product"))?,
    ))
}

/// Resolves a device identity to its current `/dev/input` path.
///
/// Scans `event*` entries under the sysfs input class, filters by vendor
/// and product, then probes each candidate and compares fingerprints.
/// Unreadable or malformed entries are skipped silently; only failure to
/// enumerate at all is an error.
pub fn resolve(vendor_id: u16, product_id: u16, uid: u32) -> io::Result<Option<PathBuf>> {
    for entry in fs::read_dir(SYS_INPUT_DIR)? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("event") {
            continue;
        }

        match read_ids(name) {
            Ok(ids) if ids == (vendor_id, product_id) => {}
            Ok(_) => continue,
            Err(e) => {
                trace!("skipping {name}: {e}");
                continue;
            }
        }

        let dev_path = Path::new(DEV_INPUT_DIR).join(name);
        let handle = match EvdevHandle::open_read_only(&dev_path) {
            Ok(h) => h,
            Err(e) => {
                trace!("skipping {}: {e}", dev_path.display());
                continue;
            }
        };
        let caps = match DeviceCapabilities::probe(&handle) {
            Ok(c) => c,
            Err(e) => {
                trace!("skipping {}: {e}", dev_path.display());
                continue;
            }
        };

        if caps.uid() == uid {
            debug!(
                "resolved {vendor_id:#06x}:{product_id:#06x}:{uid:#010x} to {}",
                dev_path.display()
            );
            return Ok(Some(dev_path));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testutil::{abs_info, FakeSource};

    #[test]
    fn canonical_string_matches_reference() {
        let mut caps = DeviceCapabilities {
            name: "X".to_string(),
            keys: [30, 42].into_iter().collect(),
            abs_axes: BTreeMap::new(),
            rels: BTreeSet::new(),
        };
        caps.abs_axes.insert(0, abs_info(0, 255, 0, 0, 0));

        assert_eq!(caps.canonical_string(), "X:2:K30,K42,A0:0,255,0,0,0");
        assert_eq!(caps.uid(), 0x7e7c_bd87);
    }

    #[test]
    fn fingerprint_is_insertion_order_independent() {
        let forward = DeviceCapabilities {
            name: "kbd".to_string(),
            keys: [1, 30, 42].into_iter().collect(),
            abs_axes: BTreeMap::new(),
            rels: [0, 1].into_iter().collect(),
        };
        let backward = DeviceCapabilities {
            name: "kbd".to_string(),
            keys: [42, 1, 30].into_iter().rev().collect(),
            abs_axes: BTreeMap::new(),
            rels: [1, 0].into_iter().collect(),
        };
        assert_eq!(forward.canonical_string(), backward.canonical_string());
        assert_eq!(forward.uid(), backward.uid());
    }

    #[test]
    fn fingerprint_is_deterministic_across_probes() {
        let source = FakeSource::keyboard("Test Device", &[1, 30, 42]);
        let first = DeviceCapabilities::probe(&source).unwrap();
        let second = DeviceCapabilities::probe(&source).unwrap();
        assert_eq!(first.canonical_string(), "Test Device:3:K1,K30,K42");
        assert_eq!(first.uid(), second.uid());
        assert_eq!(first.uid(), 0xc3b8_9485);
    }

    #[test]
    fn probe_degrades_on_missing_name() {
        let mut source = FakeSource::keyboard("gone", &[30]);
        source.fail_name = true;
        let caps = DeviceCapabilities::probe(&source).unwrap();
        assert_eq!(caps.name, "Unknown");
    }

    #[test]
    fn probe_fails_on_unreadable_absinfo() {
        let mut source = FakeSource::keyboard("pad", &[30]);
        source.abs_axes.push((0, abs_info(0, 1023, 4, 8, 0)));
        source.broken_abs.push(1);
        assert!(DeviceCapabilities::probe(&source).is_err());
    }

    #[test]
    fn capability_sections_are_all_rendered() {
        let mut source = FakeSource::keyboard("pad", &[304]);
        source.rels.push(0);
        source.rels.push(1);
        source.abs_axes.push((3, abs_info(-127, 127, 2, 15, 10)));
        let caps = DeviceCapabilities::probe(&source).unwrap();
        assert_eq!(
            caps.canonical_string(),
            "pad:1:K304,A3:-127,127,2,15,10,R0,R1"
        );
    }

    #[test]
    fn hex_id_parsing() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("inputproxy-id-test-{}", std::process::id()));
        std::fs::write(&path, "046d\n").unwrap();
        assert_eq!(read_hex_id(&path).unwrap(), 0x046d);
        std::fs::write(&path, "zzzz").unwrap();
        assert!(read_hex_id(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
