// SPDX-License-Identifier: MIT

//! Unix-domain server front-end of the proxy.
//!
//! One client is serviced at a time; its device configs live exactly as
//! long as its connection. Additional connections queue in the listen
//! backlog and are served in order.

use std::fs::{self, Permissions};
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use inputproxy_proto::{
    read_packet, send_ack, send_error, send_key_event, write_packet, Channel, ControlType,
    DeviceConfig, MAX_CONFIGS,
};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use nix::unistd::{chown, geteuid, Gid, Group, Uid, User};

use crate::device::manager::ProxyManager;

/// Group owning the socket; clients authorize by membership.
const CONTROL_GROUP: &str = "ptt";

const LISTEN_BACKLOG: i32 = 5;

/// Granularity of the readiness waits, so a termination signal is acted
/// on even when it was delivered to another thread.
const SERVICE_TICK: Duration = Duration::from_millis(200);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown_signal(_signo: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

fn install_shutdown_handlers() -> Result<()> {
    let handler = SigHandler::Handler(on_shutdown_signal);
    unsafe {
        signal::signal(Signal::SIGTERM, handler).context("installing SIGTERM handler")?;
        signal::signal(Signal::SIGINT, handler).context("installing SIGINT handler")?;
    }
    Ok(())
}

pub struct ProxyServer {
    socket_path: PathBuf,
    retry_interval: Duration,
}

impl ProxyServer {
    pub fn new(socket_path: PathBuf, retry_interval: Duration) -> ProxyServer {
        ProxyServer {
            socket_path,
            retry_interval,
        }
    }

    /// Provisions the socket and serves clients until a termination
    /// signal arrives. Setup failures return; per-client faults are
    /// logged and the accept loop continues.
    pub fn run(&self) -> Result<()> {
        install_shutdown_handlers()?;
        let (listener, group) = self.provision()?;
        info!("listening on {}", self.socket_path.display());

        while !shutdown_requested() {
            match wait_readable(&listener) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!("waiting for connections: {e}");
                    continue;
                }
            }
            let stream = match listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            debug!("client connected");
            if let Err(e) = handle_client(stream, self.retry_interval, group.as_ref()) {
                error!("client handling error: {e:#}");
            }
        }

        info!("shutting down");
        let _ = fs::remove_file(&self.socket_path);
        Ok(())
    }

    fn provision(&self) -> Result<(UnixListener, Option<Group>)> {
        match fs::remove_file(&self.socket_path) {
            Ok(()) => debug!("removed stale socket {}", self.socket_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).context(format!("unlinking {}", self.socket_path.display()));
            }
        }

        let fd = socket::socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )
        .context("creating socket")?;
        let addr = UnixAddr::new(&self.socket_path).context("socket address")?;
        socket::bind(fd.as_raw_fd(), &addr).context("binding socket")?;

        let group = ensure_control_group();
        if let Some(group) = &group {
            chown(&self.socket_path, None, Some(group.gid)).context("chown socket")?;
            info!("socket group set to '{}' ({})", group.name, group.gid);
        }
        fs::set_permissions(&self.socket_path, Permissions::from_mode(0o660))
            .context("chmod socket")?;

        socket::listen(&fd, Backlog::new(LISTEN_BACKLOG)?).context("listen")?;
        Ok((UnixListener::from(fd), group))
    }
}

/// Bounded readiness wait; `Ok(false)` on a tick or interruption so the
/// caller can re-check the shutdown flag.
fn wait_readable<Fd: AsFd>(fd: &Fd) -> Result<bool> {
    let tick = PollTimeout::try_from(SERVICE_TICK)
        .map_err(|_| anyhow!("poll timeout out of range"))?;
    let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, tick) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(true),
        Err(Errno::EINTR) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Looks up the control group, creating it through the system helper when
/// absent. A missing group degrades to uid-based authorization only.
fn ensure_control_group() -> Option<Group> {
    match Group::from_name(CONTROL_GROUP) {
        Ok(Some(group)) => return Some(group),
        Ok(None) => {}
        Err(e) => {
            warn!("looking up group '{CONTROL_GROUP}' failed: {e}");
            return None;
        }
    }

    info!("creating control group '{CONTROL_GROUP}'");
    match Command::new("groupadd")
        .args(["--system", CONTROL_GROUP])
        .status()
    {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("groupadd exited with {status}"),
        Err(e) => warn!("running groupadd failed: {e}"),
    }
    Group::from_name(CONTROL_GROUP).ok().flatten()
}

/// A peer may talk to the proxy if it is root, the daemon's own user, or
/// a member of the control group.
fn peer_allowed(uid: libc::uid_t, gid: libc::gid_t, group: Option<&Group>) -> bool {
    if uid == 0 || Uid::from_raw(uid) == geteuid() {
        return true;
    }
    let Some(group) = group else {
        return false;
    };
    if Gid::from_raw(gid) == group.gid {
        return true;
    }
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => group.mem.contains(&user.name),
        _ => false,
    }
}

fn handle_client(stream: UnixStream, retry_interval: Duration, group: Option<&Group>) -> Result<()> {
    let cred = socket::getsockopt(&stream, socket::sockopt::PeerCredentials)
        .context("querying peer credentials")?;
    if !peer_allowed(cred.uid(), cred.gid(), group) {
        let _ = send_error(&stream, "unauthorized client");
        let _ = stream.shutdown(Shutdown::Both);
        bail!("rejected client uid={} gid={}", cred.uid(), cred.gid());
    }
    debug!("client credentials: pid={} uid={}", cred.pid(), cred.uid());

    let configs = match converse(&stream) {
        Ok(configs) => configs,
        Err(e) => {
            let _ = send_error(&stream, &format!("{e}"));
            let _ = stream.shutdown(Shutdown::Both);
            return Err(e).context("handshake");
        }
    };

    let mut manager = ProxyManager::new(retry_interval);
    let writer = stream.try_clone().context("cloning client stream")?;
    manager.set_callback(move |key, pressed| {
        if let Err(e) = send_key_event(&writer, key, pressed) {
            warn!("forwarding key {key} to client failed: {e}");
        }
    });
    for config in configs {
        manager.add_device(config);
    }
    manager.start();

    loop {
        if shutdown_requested() {
            info!("shutdown requested, closing client");
            break;
        }
        if !wait_readable(&stream)? {
            continue;
        }
        match read_packet(&stream) {
            Ok(None) => {
                info!("client disconnected");
                break;
            }
            Ok(Some((header, payload))) => {
                if header.is_control(ControlType::Ping) {
                    write_packet(&stream, Channel::Control, ControlType::Pong as u16, &[], 0)?;
                } else if header.is_control(ControlType::Error) {
                    warn!("client reported: {}", String::from_utf8_lossy(&payload));
                } else {
                    debug!("ignoring packet: {header}");
                }
            }
            Err(e) => {
                warn!("client read failed: {e}");
                break;
            }
        }
    }

    manager.stop();
    let _ = stream.shutdown(Shutdown::Both);
    Ok(())
}

/// Runs the handshake and config intake, returning the device list.
fn converse(stream: &UnixStream) -> Result<Vec<DeviceConfig>> {
    match read_packet(stream)? {
        Some((header, _)) if header.is_control(ControlType::Handshake) => {
            send_ack(stream)?;
        }
        Some((header, _)) => bail!("expected handshake, got {header}"),
        None => bail!("client closed before handshake"),
    }

    let configs = match read_packet(stream)? {
        Some((header, payload)) if header.is_control(ControlType::ConfigList) => {
            let configs = DeviceConfig::decode_list(&payload)?;
            if configs.len() > MAX_CONFIGS {
                bail!("client submitted {} configs, limit is {MAX_CONFIGS}", configs.len());
            }
            configs
        }
        Some((header, _)) => bail!("expected config list, got {header}"),
        None => bail!("client closed before config list"),
    };
    send_ack(stream)?;

    for config in &configs {
        debug!("config: {config}");
    }
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use inputproxy_proto::{ControlType, EventType, KeyEventPayload, PacketHeader};
    use std::ffi::CString;
    use std::thread;

    fn serve(stream: UnixStream) -> thread::JoinHandle<Result<()>> {
        thread::spawn(move || handle_client(stream, Duration::from_millis(100), None))
    }

    fn config_bytes(uid: u32) -> Vec<u8> {
        DeviceConfig {
            vendor_id: 0x046d,
            product_id: 0xc077,
            uid,
            target_key: 276,
            exclusive: false,
        }
        .encode()
        .to_vec()
    }

    #[test]
    fn handshake_config_ping_teardown() {
        let (client, server) = UnixStream::pair().unwrap();
        let worker = serve(server);

        write_packet(&client, Channel::Control, ControlType::Handshake as u16, &[], 0).unwrap();
        let (ack, _) = read_packet(&client).unwrap().unwrap();
        assert!(ack.is_control(ControlType::Ack));

        write_packet(
            &client,
            Channel::Control,
            ControlType::ConfigList as u16,
            &config_bytes(0xdead_beef),
            0,
        )
        .unwrap();
        let (ack, _) = read_packet(&client).unwrap().unwrap();
        assert!(ack.is_control(ControlType::Ack));

        write_packet(&client, Channel::Control, ControlType::Ping as u16, &[], 0).unwrap();
        let (pong, _) = read_packet(&client).unwrap().unwrap();
        assert!(pong.is_control(ControlType::Pong));

        drop(client);
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn unexpected_first_packet_is_a_violation() {
        let (client, server) = UnixStream::pair().unwrap();
        let worker = serve(server);

        write_packet(&client, Channel::Control, ControlType::Ping as u16, &[], 0).unwrap();
        let (reply, _) = read_packet(&client).unwrap().unwrap();
        assert!(reply.is_control(ControlType::Error));

        assert!(worker.join().unwrap().is_err());
    }

    #[test]
    fn ragged_config_list_is_rejected() {
        let (client, server) = UnixStream::pair().unwrap();
        let worker = serve(server);

        write_packet(&client, Channel::Control, ControlType::Handshake as u16, &[], 0).unwrap();
        let (ack, _) = read_packet(&client).unwrap().unwrap();
        assert!(ack.is_control(ControlType::Ack));

        let ragged = vec![0u8; DeviceConfig::SIZE - 1];
        write_packet(
            &client,
            Channel::Control,
            ControlType::ConfigList as u16,
            &ragged,
            0,
        )
        .unwrap();
        let (reply, _) = read_packet(&client).unwrap().unwrap();
        assert!(reply.is_control(ControlType::Error));

        assert!(worker.join().unwrap().is_err());
    }

    #[test]
    fn key_event_header_shape() {
        // The callback installed by handle_client serializes transitions
        // with this exact frame; pin the shape down.
        let (a, b) = UnixStream::pair().unwrap();
        send_key_event(&a, 276, true).unwrap();
        let (header, payload) = read_packet(&b).unwrap().unwrap();
        assert_eq!(
            header,
            PacketHeader {
                channel: Channel::Events as u16,
                ty: EventType::KeyEvent as u16,
                length: KeyEventPayload::SIZE as u32,
                flags: 0,
            }
        );
        let event = KeyEventPayload::decode(&payload).unwrap();
        assert_eq!((event.key, event.pressed()), (276, true));
    }

    #[test]
    fn peer_policy() {
        let group = Group {
            name: CONTROL_GROUP.to_string(),
            passwd: CString::new("x").unwrap(),
            gid: Gid::from_raw(63999),
            mem: vec!["alice".to_string()],
        };

        assert!(peer_allowed(0, 0, None));
        assert!(peer_allowed(geteuid().as_raw(), 12345, None));
        assert!(peer_allowed(40000, 63999, Some(&group)));
        assert!(!peer_allowed(40000, 40000, Some(&group)));
        assert!(!peer_allowed(40000, 40000, None));
    }
}
