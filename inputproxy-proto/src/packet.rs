// SPDX-License-Identifier: MIT

//! Packet header and payload encodings.
//!
//! Every structure here has a fixed wire size and is encoded field by
//! field. The in-memory structs are not written out directly: the header
//! is 10 bytes on the wire, which no `#[repr(C)]` layout reproduces
//! without trailing padding.

use std::fmt;
use std::io;

/// Multiplexing channel of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Channel {
    Control = 1,
    Events = 2,
    Log = 3,
}

impl Channel {
    pub fn from_raw(raw: u16) -> Option<Channel> {
        match raw {
            1 => Some(Channel::Control),
            2 => Some(Channel::Events),
            3 => Some(Channel::Log),
            _ => None,
        }
    }
}

/// Packet types on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ControlType {
    Handshake = 1,
    ConfigList = 2,
    Ack = 3,
    Error = 4,
    Ping = 5,
    Pong = 6,
}

impl ControlType {
    pub fn from_raw(raw: u16) -> Option<ControlType> {
        match raw {
            1 => Some(ControlType::Handshake),
            2 => Some(ControlType::ConfigList),
            3 => Some(ControlType::Ack),
            4 => Some(ControlType::Error),
            5 => Some(ControlType::Ping),
            6 => Some(ControlType::Pong),
            _ => None,
        }
    }
}

/// Packet types on the events channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EventType {
    KeyEvent = 1,
}

pub fn channel_name(raw: u16) -> String {
    match Channel::from_raw(raw) {
        Some(ch) => format!("{ch:?}"),
        None => format!("Unknown({raw})"),
    }
}

/// Symbolic name of a packet type, interpreted relative to its channel.
pub fn type_name(channel: u16, ty: u16) -> String {
    match Channel::from_raw(channel) {
        Some(Channel::Control) => match ControlType::from_raw(ty) {
            Some(t) => format!("{t:?}"),
            None => format!("Unknown({ty})"),
        },
        Some(Channel::Events) if ty == EventType::KeyEvent as u16 => "KeyEvent".to_string(),
        _ => format!("Unknown({ty})"),
    }
}

/// Fixed-size packet header preceding every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub channel: u16,
    pub ty: u16,
    pub length: u32,
    pub flags: u16,
}

impl PacketHeader {
    /// On-wire size. Smaller than `size_of::<PacketHeader>()` would be:
    /// the wire format carries no alignment padding.
    pub const SIZE: usize = 10;

    pub fn new(channel: Channel, ty: u16, length: u32) -> PacketHeader {
        PacketHeader {
            channel: channel as u16,
            ty,
            length,
            flags: 0,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.channel.to_ne_bytes());
        buf[2..4].copy_from_slice(&self.ty.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.length.to_ne_bytes());
        buf[8..10].copy_from_slice(&self.flags.to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> PacketHeader {
        PacketHeader {
            channel: u16::from_ne_bytes([buf[0], buf[1]]),
            ty: u16::from_ne_bytes([buf[2], buf[3]]),
            length: u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]),
            flags: u16::from_ne_bytes([buf[8], buf[9]]),
        }
    }

    pub fn is_control(&self, ty: ControlType) -> bool {
        self.channel == Channel::Control as u16 && self.ty == ty as u16
    }
}

impl fmt::Display for PacketHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "channel={} type={} length={} flags={}",
            channel_name(self.channel),
            type_name(self.channel, self.ty),
            self.length,
            self.flags
        )
    }
}

/// Payload of an `Events/KeyEvent` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEventPayload {
    pub key: i32,
    pub state: u8,
}

impl KeyEventPayload {
    pub const SIZE: usize = 8;

    pub fn new(key: i32, pressed: bool) -> KeyEventPayload {
        KeyEventPayload {
            key,
            state: pressed as u8,
        }
    }

    pub fn pressed(&self) -> bool {
        self.state != 0
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.key.to_ne_bytes());
        buf[4] = self.state;
        buf
    }

    pub fn decode(buf: &[u8]) -> io::Result<KeyEventPayload> {
        if buf.len() != Self::SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("key event payload has {} bytes, expected {}", buf.len(), Self::SIZE),
            ));
        }
        Ok(KeyEventPayload {
            key: i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]),
            state: buf[4],
        })
    }
}

/// One device entry of a `Control/ConfigList` packet.
///
/// The triple (vendor, product, uid) identifies a physical device across
/// reboots and replug; no filesystem path ever crosses the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub uid: u32,
    pub target_key: i32,
    pub exclusive: bool,
}

impl DeviceConfig {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.vendor_id.to_ne_bytes());
        buf[2..4].copy_from_slice(&self.product_id.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.uid.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.target_key.to_ne_bytes());
        buf[12] = self.exclusive as u8;
        buf
    }

    pub fn decode(buf: &[u8]) -> io::Result<DeviceConfig> {
        if buf.len() != Self::SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("device config has {} bytes, expected {}", buf.len(), Self::SIZE),
            ));
        }
        Ok(DeviceConfig {
            vendor_id: u16::from_ne_bytes([buf[0], buf[1]]),
            product_id: u16::from_ne_bytes([buf[2], buf[3]]),
            uid: u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]),
            target_key: i32::from_ne_bytes([buf[8], buf[9], buf[10], buf[11]]),
            exclusive: buf[12] != 0,
        })
    }

    pub fn encode_list(configs: &[DeviceConfig]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(configs.len() * Self::SIZE);
        for config in configs {
            buf.extend_from_slice(&config.encode());
        }
        buf
    }

    /// Parses a `ConfigList` payload. The payload length must be an
    /// integral number of configs.
    pub fn decode_list(buf: &[u8]) -> io::Result<Vec<DeviceConfig>> {
        if buf.len() % Self::SIZE != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "config list payload of {} bytes is not a multiple of {}",
                    buf.len(),
                    Self::SIZE
                ),
            ));
        }
        buf.chunks_exact(Self::SIZE).map(DeviceConfig::decode).collect()
    }
}

impl fmt::Display for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#06x}:{:#06x}:{:#010x} key={} exclusive={}",
            self.vendor_id, self.product_id, self.uid, self.target_key, self.exclusive
        )
    }
}
