// SPDX-License-Identifier: MIT

//! Length-delimited frame codec over a byte-stream socket.
//!
//! A packet is written with a single `write` call so that concurrent
//! senders on the same fd interleave at packet granularity, never inside
//! one. Reads are two-phase (header, then payload) and never hand a
//! partial payload to the caller: a short read is a broken connection.

use std::io;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::{debug, error};
use nix::errno::Errno;
use smallvec::{smallvec, SmallVec};

use crate::packet::{
    channel_name, type_name, Channel, ControlType, EventType, KeyEventPayload, PacketHeader,
};

/// Packet payload buffer. Control and event payloads are tiny, so they
/// live inline; config lists spill to the heap.
pub type Payload = SmallVec<[u8; 64]>;

/// Reads exactly `buf.len()` bytes, retrying on EINTR. Returns the number
/// of bytes read, which is short only when the stream hit EOF.
pub fn read_full<Fd: AsFd>(fd: Fd, buf: &mut [u8]) -> io::Result<usize> {
    let fd = fd.as_fd();
    let mut done = 0;
    while done < buf.len() {
        match nix::unistd::read(fd, &mut buf[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(done)
}

/// Writes the whole buffer, retrying on EINTR.
pub fn write_full<Fd: AsFd>(fd: Fd, buf: &[u8]) -> io::Result<()> {
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

fn broken(what: &str, got: usize, expected: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("{what}: got {got} of {expected} bytes"),
    )
}

/// Writes one packet (header and payload in a single `write`).
pub fn write_packet<Fd: AsFd>(
    fd: Fd,
    channel: Channel,
    ty: u16,
    data: &[u8],
    flags: u16,
) -> io::Result<()> {
    let mut header = PacketHeader::new(channel, ty, data.len() as u32);
    header.flags = flags;

    debug!("writing packet: {header}");

    let mut buf: SmallVec<[u8; 80]> = SmallVec::with_capacity(PacketHeader::SIZE + data.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(data);
    write_full(fd, &buf)
}

/// Reads one packet. Returns `Ok(None)` on a clean EOF at a packet
/// boundary; any partial frame is an error and the connection should be
/// dropped.
pub fn read_packet<Fd: AsFd>(fd: Fd) -> io::Result<Option<(PacketHeader, Payload)>> {
    let fd = fd.as_fd();

    let mut raw = [0u8; PacketHeader::SIZE];
    let n = read_full(fd, &mut raw)?;
    if n == 0 {
        return Ok(None);
    }
    if n < raw.len() {
        return Err(broken("short packet header", n, raw.len()));
    }

    let header = PacketHeader::decode(&raw);
    debug!("read packet header: {header}");

    let mut payload: Payload = smallvec![0u8; header.length as usize];
    if header.length > 0 {
        let n = read_full(fd, &mut payload)?;
        if n < payload.len() {
            return Err(broken("short packet payload", n, payload.len()));
        }
    }
    Ok(Some((header, payload)))
}

/// Blocks until a connection to the daemon's socket succeeds, pacing
/// attempts at one per second. Backoff policy beyond that is the caller's
/// concern.
pub fn connect_to_server(path: &Path) -> UnixStream {
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => {
                debug!("connected to the server at {}", path.display());
                return stream;
            }
            Err(e) => {
                error!("connect to {} failed: {e} - retrying", path.display());
                thread::sleep(Duration::from_secs(1));
            }
        }
    }
}

/// Writes one packet, (re)connecting to `path` when there is no stream or
/// the write fails. The write is retried exactly once after a reconnect.
pub fn write_packet_safe(
    stream: &mut Option<UnixStream>,
    path: &Path,
    channel: Channel,
    ty: u16,
    data: &[u8],
    flags: u16,
) -> bool {
    if stream.is_none() {
        *stream = Some(connect_to_server(path));
    }

    if let Some(s) = stream.as_ref() {
        if write_packet(s, channel, ty, data, flags).is_ok() {
            return true;
        }
    }

    error!(
        "writing {}/{} failed, reconnecting",
        channel_name(channel as u16),
        type_name(channel as u16, ty)
    );
    let reconnected = connect_to_server(path);
    let ok = write_packet(&reconnected, channel, ty, data, flags).is_ok();
    *stream = Some(reconnected);
    ok
}

pub fn send_ack<Fd: AsFd>(fd: Fd) -> io::Result<()> {
    write_packet(fd, Channel::Control, ControlType::Ack as u16, &[], 0)
}

pub fn send_error<Fd: AsFd>(fd: Fd, msg: &str) -> io::Result<()> {
    write_packet(fd, Channel::Control, ControlType::Error as u16, msg.as_bytes(), 0)
}

pub fn send_key_event<Fd: AsFd>(fd: Fd, key: i32, pressed: bool) -> io::Result<()> {
    let payload = KeyEventPayload::new(key, pressed);
    write_packet(
        fd,
        Channel::Events,
        EventType::KeyEvent as u16,
        &payload.encode(),
        0,
    )
}
