// SPDX-License-Identifier: MIT

//! Fake capability source for exercising the probe, fingerprint, and
//! mirror-plan code without real devices.

use std::io;
use std::mem;

use input_ioctls::{bits_len, ABS_MAX, EV_ABS, EV_KEY, EV_LED, EV_MSC, EV_REL, LED_MAX, MSC_MAX};
use libc::input_absinfo;

use super::capabilities::CapabilitySource;

pub fn abs_info(min: i32, max: i32, fuzz: i32, flat: i32, resolution: i32) -> input_absinfo {
    let mut info: input_absinfo = unsafe { mem::zeroed() };
    info.minimum = min;
    info.maximum = max;
    info.fuzz = fuzz;
    info.flat = flat;
    info.resolution = resolution;
    info
}

pub fn bitmap(codes: &[u16], max_code: u16) -> Vec<u8> {
    let mut bits = vec![0u8; bits_len(max_code)];
    for &code in codes {
        bits[code as usize / 8] |= 1 << (code as usize % 8);
    }
    bits
}

/// A device description that answers the capability ioctl contract.
pub struct FakeSource {
    pub name: String,
    pub fail_name: bool,
    pub event_types: Vec<u16>,
    pub keys: Vec<u16>,
    pub rels: Vec<u16>,
    pub miscs: Vec<u16>,
    pub leds: Vec<u16>,
    pub abs_axes: Vec<(u16, input_absinfo)>,
    /// Axes advertised in the bitmap whose absinfo query fails.
    pub broken_abs: Vec<u16>,
}

impl FakeSource {
    pub fn keyboard(name: &str, keys: &[u16]) -> FakeSource {
        FakeSource {
            name: name.to_string(),
            fail_name: false,
            event_types: vec![EV_KEY],
            keys: keys.to_vec(),
            rels: Vec::new(),
            miscs: Vec::new(),
            leds: Vec::new(),
            abs_axes: Vec::new(),
            broken_abs: Vec::new(),
        }
    }
}

impl CapabilitySource for FakeSource {
    fn name(&self) -> io::Result<String> {
        if self.fail_name {
            return Err(io::Error::from(io::ErrorKind::Other));
        }
        Ok(self.name.clone())
    }

    fn event_types(&self) -> io::Result<Vec<u8>> {
        let mut types = self.event_types.clone();
        if !self.abs_axes.is_empty() || !self.broken_abs.is_empty() {
            types.push(EV_ABS);
        }
        if !self.rels.is_empty() {
            types.push(EV_REL);
        }
        Ok(bitmap(&types, input_ioctls::EV_MAX))
    }

    fn code_bits(&self, ev_type: u16, max_code: u16) -> io::Result<Vec<u8>> {
        let codes: Vec<u16> = match ev_type {
            t if t == EV_KEY => self.keys.clone(),
            t if t == EV_REL => self.rels.clone(),
            t if t == EV_MSC && max_code == MSC_MAX => self.miscs.clone(),
            t if t == EV_LED && max_code == LED_MAX => self.leds.clone(),
            t if t == EV_ABS && max_code == ABS_MAX => self
                .abs_axes
                .iter()
                .map(|(axis, _)| *axis)
                .chain(self.broken_abs.iter().copied())
                .collect(),
            _ => Vec::new(),
        };
        Ok(bitmap(&codes, max_code))
    }

    fn abs_info(&self, axis: u16) -> io::Result<input_absinfo> {
        if self.broken_abs.contains(&axis) {
            return Err(io::Error::from(io::ErrorKind::Other));
        }
        self.abs_axes
            .iter()
            .find(|(a, _)| *a == axis)
            .map(|(_, info)| *info)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
}
