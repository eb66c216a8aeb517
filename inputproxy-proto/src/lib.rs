// SPDX-License-Identifier: MIT

//! Wire protocol between the input-proxy daemon and its clients.
//!
//! The transport is a Unix stream socket on the local host, so all integer
//! fields travel in host byte order. Packets are length-delimited: a fixed
//! 10-byte header followed by `length` payload bytes.

use std::time::Duration;

pub mod codec;
pub mod packet;

pub use codec::{
    connect_to_server, read_full, read_packet, send_ack, send_error, send_key_event, write_full,
    write_packet, write_packet_safe, Payload,
};
pub use packet::{Channel, ControlType, DeviceConfig, EventType, KeyEventPayload, PacketHeader};

/// Filesystem path of the daemon's listening socket.
pub const SOCKET_PATH: &str = "/tmp/input_proxy.sock";

/// Interval between client PINGs.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Unanswered PINGs beyond this count declare the link dead.
pub const MISSED_PONG_LIMIT: u32 = 3;

/// Upper bound on the number of device configs a client may submit.
pub const MAX_CONFIGS: usize = 1000;
