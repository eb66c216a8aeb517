// SPDX-License-Identifier: MIT

//! Core of the input-proxy daemon.
//!
//! The daemon exclusively grabs configured evdev devices, re-emits their
//! traffic through per-device uinput mirrors, and forwards transitions of
//! each device's target key over a framed Unix-socket protocol.

pub mod detect;
pub mod device;
pub mod server;
