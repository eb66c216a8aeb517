// SPDX-License-Identifier: MIT

//! Virtual device mirror.
//!
//! For every grabbed physical device the proxy creates a uinput device
//! with the same capability surface and re-emits the grabbed traffic
//! through it, so the rest of the system keeps seeing the device.
//!
//! Creation is split in two: [`MirrorPlan::from_source`] computes the
//! capability copy from any [`CapabilitySource`], and [`Mirror::create`]
//! applies a plan to `/dev/uinput`. Only the second half touches the
//! kernel.

use std::fs::File;
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::slice;
use std::sync::atomic::{AtomicU16, Ordering};

use input_ioctls::{
    test_bit, ui_abs_setup, ui_dev_create, ui_dev_destroy, ui_set_absbit, ui_set_evbit,
    ui_set_keybit, ui_set_ledbit, ui_set_mscbit, ui_set_relbit, ABS_MAX, BUS_USB, EV_ABS, EV_FF,
    EV_KEY, EV_LED, EV_MAX, EV_MSC, EV_REL, EV_SYN, KEY_MAX, LED_MAX, MSC_MAX, REL_MAX, SYN_REPORT,
    UINPUT_MAX_NAME_SIZE,
};
use libc::{input_absinfo, input_event, uinput_user_dev};
use log::{debug, trace, warn};
use nix::errno::Errno;

use crate::device::capabilities::CapabilitySource;

const UINPUT_PATH: &str = "/dev/uinput";

/// Hardware-id bases for mirror devices; the n-th mirror created by this
/// process reports (base + n, base + n).
pub const VIRTUAL_VENDOR_BASE: u16 = 0x1f00;
pub const VIRTUAL_PRODUCT_BASE: u16 = 0x5000;

/// Force-feedback slots advertised when the physical device has EV_FF.
const FF_EFFECTS_MAX: u32 = 16;

static MIRROR_COUNTER: AtomicU16 = AtomicU16::new(0);

/// One absolute axis of a mirror, with its range description.
#[derive(Debug, Clone, Copy)]
pub struct AbsSetup {
    pub axis: u16,
    pub info: input_absinfo,
}

/// The capability surface to install on a uinput fd.
#[derive(Debug, Default)]
pub struct MirrorPlan {
    pub event_types: Vec<u16>,
    pub keys: Vec<u16>,
    pub rels: Vec<u16>,
    pub miscs: Vec<u16>,
    pub leds: Vec<u16>,
    pub abs_axes: Vec<AbsSetup>,
    pub ff_effects_max: u32,
}

impl MirrorPlan {
    /// Computes the copy plan for a physical device. Axis ranges that
    /// cannot be queried fall back to `{0, 255, 0, 0, 0}` rather than
    /// failing the whole mirror.
    pub fn from_source(source: &dyn CapabilitySource) -> io::Result<MirrorPlan> {
        let type_bits = source.event_types()?;
        let mut plan = MirrorPlan::default();

        for ev_type in 0..=EV_MAX {
            if !test_bit(ev_type, &type_bits) {
                continue;
            }
            plan.event_types.push(ev_type);

            match ev_type {
                EV_KEY => plan.keys = codes(source, EV_KEY, KEY_MAX),
                EV_REL => plan.rels = codes(source, EV_REL, REL_MAX),
                EV_MSC => plan.miscs = codes(source, EV_MSC, MSC_MAX),
                EV_LED => plan.leds = codes(source, EV_LED, LED_MAX),
                EV_ABS => {
                    for axis in codes(source, EV_ABS, ABS_MAX) {
                        let info = source.abs_info(axis).unwrap_or_else(|e| {
                            warn!("absinfo for axis {axis} unavailable ({e}), using fallback");
                            fallback_abs_info()
                        });
                        plan.abs_axes.push(AbsSetup { axis, info });
                    }
                }
                EV_FF => plan.ff_effects_max = FF_EFFECTS_MAX,
                _ => {}
            }
        }
        Ok(plan)
    }
}

fn codes(source: &dyn CapabilitySource, ev_type: u16, max_code: u16) -> Vec<u16> {
    match source.code_bits(ev_type, max_code) {
        Ok(bits) => (0..=max_code).filter(|&c| test_bit(c, &bits)).collect(),
        Err(_) => Vec::new(),
    }
}

fn fallback_abs_info() -> input_absinfo {
    let mut info: input_absinfo = unsafe { mem::zeroed() };
    info.maximum = 255;
    info
}

/// A created uinput device. Dropping it destroys the kernel device
/// (`UI_DEV_DESTROY`) before the fd is closed.
#[derive(Debug)]
pub struct Mirror {
    file: File,
    name: String,
}

impl Mirror {
    /// Opens `/dev/uinput`, installs `plan`, and creates the device.
    /// Every mirror gets a unique name and a unique (vendor, product)
    /// pair. Any failure closes the uinput fd and surfaces as
    /// mirror-unavailable.
    pub fn create(plan: &MirrorPlan) -> io::Result<Mirror> {
        let file = File::options()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(UINPUT_PATH)?;
        let fd = file.as_raw_fd();

        install_plan(fd, plan)?;

        let index = MIRROR_COUNTER.fetch_add(1, Ordering::SeqCst);
        let name = format!("PTT Virtual Device {index}");
        let setup = user_dev(&name, index, plan.ff_effects_max)?;
        let setup_bytes = unsafe {
            slice::from_raw_parts(
                &setup as *const uinput_user_dev as *const u8,
                mem::size_of::<uinput_user_dev>(),
            )
        };
        write_all_blocking(&file, setup_bytes)?;

        unsafe { ui_dev_create(fd) }?;
        debug!("created mirror '{name}'");
        Ok(Mirror { file, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes one event to the mirror. EAGAIN is swallowed: the uinput fd
    /// is non-blocking and dropping events under extreme backpressure is
    /// acceptable for this device class.
    pub fn emit(&self, event: &input_event) {
        let buf = unsafe {
            slice::from_raw_parts(
                event as *const input_event as *const u8,
                mem::size_of::<input_event>(),
            )
        };
        match write_ignoring_eagain(&self.file, buf) {
            Ok(true) => {}
            Ok(false) => trace!("mirror '{}' backpressured, event dropped", self.name),
            Err(e) => warn!("write to mirror '{}' failed: {e}", self.name),
        }
    }

    /// Emits a `SYN_REPORT` to close the current event frame.
    pub fn emit_syn_report(&self) {
        let mut syn: input_event = unsafe { mem::zeroed() };
        syn.type_ = EV_SYN;
        syn.code = SYN_REPORT;
        syn.value = 0;
        self.emit(&syn);
    }
}

impl Drop for Mirror {
    fn drop(&mut self) {
        // The kernel device must be destroyed before the fd closes.
        if let Err(e) = unsafe { ui_dev_destroy(self.file.as_raw_fd()) } {
            warn!("UI_DEV_DESTROY for '{}' failed: {e}", self.name);
        }
    }
}

fn install_plan(fd: RawFd, plan: &MirrorPlan) -> io::Result<()> {
    unsafe {
        for &ev_type in &plan.event_types {
            ui_set_evbit(fd, ev_type as u64)?;
        }
        for &key in &plan.keys {
            ui_set_keybit(fd, key as u64)?;
        }
        for &rel in &plan.rels {
            ui_set_relbit(fd, rel as u64)?;
        }
        for &misc in &plan.miscs {
            ui_set_mscbit(fd, misc as u64)?;
        }
        for &led in &plan.leds {
            ui_set_ledbit(fd, led as u64)?;
        }
        for setup in &plan.abs_axes {
            ui_set_absbit(fd, setup.axis as u64)?;
            let abs = libc::uinput_abs_setup {
                code: setup.axis,
                absinfo: setup.info,
            };
            ui_abs_setup(fd, &abs)?;
        }
    }
    Ok(())
}

fn user_dev(name: &str, index: u16, ff_effects_max: u32) -> io::Result<uinput_user_dev> {
    if name.len() >= UINPUT_MAX_NAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "mirror name too long",
        ));
    }
    let mut setup: uinput_user_dev = unsafe { mem::zeroed() };
    unsafe {
        std::ptr::copy_nonoverlapping(
            name.as_ptr(),
            setup.name.as_mut_ptr().cast::<u8>(),
            name.len(),
        );
    }
    setup.id.bustype = BUS_USB;
    setup.id.vendor = VIRTUAL_VENDOR_BASE.wrapping_add(index);
    setup.id.product = VIRTUAL_PRODUCT_BASE.wrapping_add(index);
    setup.id.version = 1;
    setup.ff_effects_max = ff_effects_max;
    Ok(setup)
}

fn write_all_blocking<Fd: AsFd>(fd: Fd, buf: &[u8]) -> io::Result<()> {
    let fd = fd.as_fd();
    let mut done = 0;
    while done < buf.len() {
        match nix::unistd::write(fd, &buf[done..]) {
            Ok(n) => done += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Like `write_all_blocking`, but reports EAGAIN as `Ok(false)`.
fn write_ignoring_eagain<Fd: AsFd>(fd: Fd, buf: &[u8]) -> io::Result<bool> {
    let fd = fd.as_fd();
    let mut done = 0;
    while done < buf.len() {
        match nix::unistd::write(fd, &buf[done..]) {
            Ok(n) => done += n,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}
