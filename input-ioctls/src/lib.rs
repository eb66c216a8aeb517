// SPDX-License-Identifier: MIT

//! Raw evdev and uinput ioctl bindings.
//!
//! Only the surface consumed by the input proxy is bound here: the
//! capability-query ioctls of an evdev character device, the exclusive
//! grab, and the uinput device-setup ioctls for the mirror.

pub mod keys;

use libc::{c_char, c_int, c_uint, c_ulong, input_absinfo, input_id};

use nix::errno::Errno;
use nix::{
    ioctl_none, ioctl_read, ioctl_read_buf, ioctl_write_int, ioctl_write_ptr, request_code_none,
    request_code_read, request_code_write,
};

// Event types and code maxima from
// https://github.com/torvalds/linux/blob/master/include/uapi/linux/input-event-codes.h
pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_REL: u16 = 0x02;
pub const EV_ABS: u16 = 0x03;
pub const EV_MSC: u16 = 0x04;
pub const EV_SW: u16 = 0x05;
pub const EV_LED: u16 = 0x11;
pub const EV_SND: u16 = 0x12;
pub const EV_REP: u16 = 0x14;
pub const EV_FF: u16 = 0x15;
pub const EV_MAX: u16 = 0x1f;

pub const SYN_REPORT: u16 = 0x00;

pub const KEY_MAX: u16 = 0x2ff;
pub const REL_MAX: u16 = 0x0f;
pub const ABS_MAX: u16 = 0x3f;
pub const MSC_MAX: u16 = 0x07;
pub const LED_MAX: u16 = 0x0f;

pub const BUS_USB: u16 = 0x03;
pub const BUS_VIRTUAL: u16 = 0x06;

pub const UINPUT_MAX_NAME_SIZE: usize = 80;

pub const EVIOCGRAB: u64 = request_code_write!(b'E', 0x90, std::mem::size_of::<c_int>());
pub const EVIOCGID: u64 = request_code_read!(b'E', 0x02, std::mem::size_of::<input_id>());

pub const UI_DEV_CREATE: u64 = request_code_none!(b'U', 1);
pub const UI_DEV_DESTROY: u64 = request_code_none!(b'U', 2);
pub const UI_ABS_SETUP: u64 =
    request_code_write!(b'U', 4, std::mem::size_of::<libc::uinput_abs_setup>());

pub const UI_SET_EVBIT: u64 = request_code_write!(b'U', 100, std::mem::size_of::<c_uint>());
pub const UI_SET_KEYBIT: u64 = request_code_write!(b'U', 101, std::mem::size_of::<c_uint>());
pub const UI_SET_RELBIT: u64 = request_code_write!(b'U', 102, std::mem::size_of::<c_uint>());
pub const UI_SET_ABSBIT: u64 = request_code_write!(b'U', 103, std::mem::size_of::<c_uint>());
pub const UI_SET_MSCBIT: u64 = request_code_write!(b'U', 104, std::mem::size_of::<c_uint>());
pub const UI_SET_LEDBIT: u64 = request_code_write!(b'U', 105, std::mem::size_of::<c_uint>());

ioctl_write_int!(eviocgrab, b'E', 0x90);
ioctl_read!(eviocgid, b'E', 0x02, input_id);
ioctl_read_buf!(eviocgname, b'E', 0x06, c_char);

ioctl_none!(ui_dev_create, b'U', 1);
ioctl_none!(ui_dev_destroy, b'U', 2);
ioctl_write_int!(ui_set_evbit, b'U', 100);
ioctl_write_int!(ui_set_keybit, b'U', 101);
ioctl_write_int!(ui_set_relbit, b'U', 102);
ioctl_write_int!(ui_set_absbit, b'U', 103);
ioctl_write_int!(ui_set_mscbit, b'U', 104);
ioctl_write_int!(ui_set_ledbit, b'U', 105);

ioctl_write_ptr! { ui_abs_setup, b'U', 4, libc::uinput_abs_setup }

/// EVIOCGBIT(type, len): fetch the capability bitmap for one event type.
/// `ev_type` 0 queries the supported event types themselves. The ioctl
/// number depends on the event type, so this cannot be a `nix` macro
/// invocation with a fixed request code.
///
/// # Safety
/// `fd` must refer to an evdev character device.
pub unsafe fn eviocgbit(fd: c_int, ev_type: u16, buf: &mut [u8]) -> nix::Result<c_int> {
    let req = request_code_read!(b'E', 0x20 + ev_type as u32, buf.len());
    Errno::result(libc::ioctl(fd, req as c_ulong, buf.as_mut_ptr()))
}

/// EVIOCGABS(axis): fetch the `input_absinfo` of one absolute axis.
///
/// # Safety
/// `fd` must refer to an evdev character device.
pub unsafe fn eviocgabs(fd: c_int, axis: u16, info: &mut input_absinfo) -> nix::Result<c_int> {
    let req = request_code_read!(
        b'E',
        0x40 + axis as u32,
        std::mem::size_of::<input_absinfo>()
    );
    Errno::result(libc::ioctl(fd, req as c_ulong, info as *mut input_absinfo))
}

/// Tests one bit in a kernel capability bitmap as returned by EVIOCGBIT.
pub fn test_bit(bit: u16, bits: &[u8]) -> bool {
    let byte = bit as usize / 8;
    byte < bits.len() && (bits[byte] >> (bit as usize % 8)) & 1 == 1
}

/// Buffer length holding `max` + 1 capability bits.
pub const fn bits_len(max: u16) -> usize {
    max as usize / 8 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_codes_match_kernel_headers() {
        // Values from a C program including <linux/input.h> / <linux/uinput.h>.
        assert_eq!(EVIOCGRAB, 0x4004_4590);
        assert_eq!(EVIOCGID, 0x8008_4502);
        assert_eq!(UI_DEV_CREATE, 0x5501);
        assert_eq!(UI_DEV_DESTROY, 0x5502);
        assert_eq!(UI_SET_EVBIT, 0x4004_5564);
    }

    #[test]
    fn bitmap_helpers() {
        let mut bits = vec![0u8; bits_len(KEY_MAX)];
        assert_eq!(bits.len(), 0x2ff / 8 + 1);
        bits[30 / 8] |= 1 << (30 % 8);
        assert!(test_bit(30, &bits));
        assert!(!test_bit(31, &bits));
        assert!(!test_bit(KEY_MAX, &bits));
        // Out-of-range bits read as unset rather than panicking.
        assert!(!test_bit(0x2ff, &bits[..1]));
    }
}
