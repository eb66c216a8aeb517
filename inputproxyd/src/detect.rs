// SPDX-License-Identifier: MIT

//! Device detection mode.
//!
//! A read-only front-end: every readable `/dev/input/event*` node is
//! watched (never grabbed), and each key press prints the identity triple
//! a user needs to configure that device.

use std::fs;
use std::io;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use input_ioctls::{keys, EV_KEY};
use log::debug;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::device::capabilities::{
    read_ids, DeviceCapabilities, EvdevHandle, DEV_INPUT_DIR,
};

const POLL_TICK: Duration = Duration::from_millis(100);

/// Watches all input devices and prints identity info for every key
/// press. Runs until the process is interrupted.
pub fn run() -> Result<()> {
    println!("Device detection mode - press keys to see their device info (Ctrl+C to exit)");

    let devices = open_all()?;
    let timeout =
        PollTimeout::try_from(POLL_TICK).map_err(|_| anyhow!("poll timeout out of range"))?;

    loop {
        let mut fds: Vec<PollFd> = devices
            .iter()
            .map(|(_, handle)| PollFd::new(handle.as_fd(), PollFlags::POLLIN))
            .collect();
        let ready = match poll(&mut fds, timeout) {
            Ok(0) => continue,
            Ok(_) => fds
                .iter()
                .map(|fd| {
                    fd.revents()
                        .map(|r| r.contains(PollFlags::POLLIN))
                        .unwrap_or(false)
                })
                .collect::<Vec<_>>(),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context("polling input devices"),
        };
        drop(fds);

        for (i, (path, handle)) in devices.iter().enumerate() {
            if !ready[i] {
                continue;
            }
            loop {
                match handle.read_event() {
                    Ok(event) => {
                        if event.type_ == EV_KEY && event.value == 1 {
                            report(path, handle, event.code);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!("reading {}: {e}", path.display());
                        break;
                    }
                }
            }
        }
    }
}

fn open_all() -> Result<Vec<(PathBuf, EvdevHandle)>> {
    let mut devices = Vec::new();
    for entry in fs::read_dir(DEV_INPUT_DIR).context("listing input devices")? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("event") {
            continue;
        }
        let path = entry.path();
        match EvdevHandle::open_monitor(&path) {
            Ok(handle) => devices.push((path, handle)),
            Err(e) => debug!("skipping {}: {e}", path.display()),
        }
    }
    if devices.is_empty() {
        bail!("no readable input devices (try running as root)");
    }
    Ok(devices)
}

fn report(path: &Path, handle: &EvdevHandle, code: u16) {
    let caps = match DeviceCapabilities::probe(handle) {
        Ok(caps) => caps,
        Err(e) => {
            debug!("probing {}: {e}", path.display());
            return;
        }
    };
    let (vendor, product) = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| read_ids(n).ok())
        .or_else(|| handle.input_id().ok().map(|id| (id.vendor, id.product)))
        .unwrap_or((0, 0));
    let uid = caps.uid();
    let key_label = match keys::key_name(code) {
        Some(name) => format!(" ({name})"),
        None => String::new(),
    };

    println!(
        "Key pressed: {code:#x}{key_label}\n\
         Device: {}\n\
         Vendor: 0x{vendor:04x}\n\
         Product: 0x{product:04x}\n\
         UID: 0x{uid:08x}\n\
         Name: {}\n",
        path.display(),
        caps.name
    );
    println!("Device to use in the config: 0x{vendor:04x}:0x{product:04x}:0x{uid:08x}");
}
