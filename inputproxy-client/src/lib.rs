// SPDX-License-Identifier: MIT

//! Client side of the input proxy.
//!
//! [`InputProxyClient`] connects to the daemon's socket, performs the
//! handshake, submits its device configs, and dispatches received key
//! transitions to a consumer callback. A pinger watches link liveness;
//! any failure tears the connection down and the reader reconnects with
//! a fresh handshake, indefinitely, until [`InputProxyClient::stop`].

use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use inputproxy_proto::{
    read_packet, write_packet, Channel, ControlType, DeviceConfig, EventType, KeyEventPayload,
    MISSED_PONG_LIMIT, PING_INTERVAL, SOCKET_PATH,
};
use log::{debug, error, info, warn};

/// Consumer of key transitions, `(key, pressed)`. Invoked only by the
/// reader thread.
pub type KeyCallback = Arc<dyn Fn(i32, bool) + Send + Sync>;

/// Pause between connection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Granularity at which sleeping workers observe cancellation.
const CANCEL_TICK: Duration = Duration::from_millis(100);

struct ClientInner {
    socket_path: PathBuf,
    configs: Mutex<Vec<DeviceConfig>>,
    callback: Mutex<Option<KeyCallback>>,
    running: AtomicBool,
    missed_pongs: AtomicU32,
    ping_interval_ms: AtomicU64,
    /// The live connection, kept so `stop`/`restart` can shut it down and
    /// unblock the reader.
    stream: Mutex<Option<UnixStream>>,
}

/// Unprivileged proxy client with automatic reconnect.
pub struct InputProxyClient {
    inner: Arc<ClientInner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl InputProxyClient {
    /// A client for the daemon's default socket path.
    pub fn new() -> InputProxyClient {
        InputProxyClient::with_socket_path(SOCKET_PATH)
    }

    pub fn with_socket_path(path: impl Into<PathBuf>) -> InputProxyClient {
        InputProxyClient {
            inner: Arc::new(ClientInner {
                socket_path: path.into(),
                configs: Mutex::new(Vec::new()),
                callback: Mutex::new(None),
                running: AtomicBool::new(false),
                missed_pongs: AtomicU32::new(0),
                ping_interval_ms: AtomicU64::new(PING_INTERVAL.as_millis() as u64),
                stream: Mutex::new(None),
            }),
            reader: Mutex::new(None),
        }
    }

    /// Registers a device to be proxied. Takes effect on the next
    /// connection (call before `start`, or `restart` afterwards).
    pub fn add_device(
        &self,
        vendor_id: u16,
        product_id: u16,
        uid: u32,
        target_key: i32,
        exclusive: bool,
    ) {
        self.inner.configs.lock().unwrap().push(DeviceConfig {
            vendor_id,
            product_id,
            uid,
            target_key,
            exclusive,
        });
    }

    pub fn clear_devices(&self) {
        self.inner.configs.lock().unwrap().clear();
    }

    /// Installs the consumer. Swapping while running is allowed and takes
    /// effect on the next event.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(i32, bool) + Send + Sync + 'static,
    {
        *self.inner.callback.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Overrides the ping interval. Meant for tests and diagnostics; the
    /// default is the protocol's 30 s.
    pub fn set_ping_interval(&self, interval: Duration) {
        self.inner
            .ping_interval_ms
            .store(interval.as_millis() as u64, Ordering::SeqCst);
    }

    /// Launches the reader worker. Idempotent while running.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        *self.reader.lock().unwrap() = Some(thread::spawn(move || reader_loop(&inner)));
    }

    /// Stops the client and joins its workers. Idempotent.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(stream) = self.inner.stream.lock().unwrap().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(reader) = self.reader.lock().unwrap().take() {
            if reader.join().is_err() {
                error!("client reader panicked");
            }
        }
    }

    /// Forces a disconnect; the reader reconnects and re-handshakes.
    pub fn restart(&self) {
        info!("restart requested");
        if let Some(stream) = self.inner.stream.lock().unwrap().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Default for InputProxyClient {
    fn default() -> InputProxyClient {
        InputProxyClient::new()
    }
}

impl Drop for InputProxyClient {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Connection lifecycle of the reader worker. Ping timeouts and read
/// failures always fall back to `Disconnected`; `stop` terminates the
/// worker from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Disconnected,
    Connecting,
    Handshaking,
    Configured,
    Live,
}

fn transition(state: &mut LinkState, to: LinkState) {
    if *state != to {
        debug!("link {:?} -> {to:?}", *state);
        *state = to;
    }
}

/// Sleeps in cancellation ticks; false when `running` went down.
fn sleep_while_running(inner: &ClientInner, total: Duration) -> bool {
    let mut waited = Duration::ZERO;
    while waited < total {
        if !inner.running.load(Ordering::SeqCst) {
            return false;
        }
        thread::sleep(CANCEL_TICK);
        waited += CANCEL_TICK;
    }
    inner.running.load(Ordering::SeqCst)
}

fn reader_loop(inner: &Arc<ClientInner>) {
    let mut state = LinkState::Disconnected;

    while inner.running.load(Ordering::SeqCst) {
        transition(&mut state, LinkState::Connecting);
        debug!("connecting to {}", inner.socket_path.display());
        let stream = match UnixStream::connect(&inner.socket_path) {
            Ok(stream) => stream,
            Err(e) => {
                debug!("connect failed: {e}");
                transition(&mut state, LinkState::Disconnected);
                if !sleep_while_running(inner, RECONNECT_DELAY) {
                    break;
                }
                continue;
            }
        };
        debug!("connected to the server");

        transition(&mut state, LinkState::Handshaking);
        if !handshake(inner, &stream) {
            let _ = stream.shutdown(Shutdown::Both);
            transition(&mut state, LinkState::Disconnected);
            if !sleep_while_running(inner, RECONNECT_DELAY) {
                break;
            }
            continue;
        }
        transition(&mut state, LinkState::Configured);

        inner.missed_pongs.store(0, Ordering::SeqCst);
        match stream.try_clone() {
            Ok(clone) => *inner.stream.lock().unwrap() = Some(clone),
            Err(e) => {
                warn!("cloning stream failed: {e}");
                transition(&mut state, LinkState::Disconnected);
                continue;
            }
        }
        transition(&mut state, LinkState::Live);

        let link_up = Arc::new(AtomicBool::new(true));
        let pinger = spawn_pinger(inner, &stream, &link_up);

        loop {
            match read_packet(&stream) {
                Ok(Some((header, payload))) => {
                    if header.channel == Channel::Events as u16
                        && header.ty == EventType::KeyEvent as u16
                    {
                        match KeyEventPayload::decode(&payload) {
                            Ok(event) => dispatch(inner, event.key, event.pressed()),
                            Err(e) => warn!("bad key event: {e}"),
                        }
                    } else if header.is_control(ControlType::Pong) {
                        debug!("pong received");
                        inner.missed_pongs.store(0, Ordering::SeqCst);
                    } else if header.is_control(ControlType::Error) {
                        error!("server error: {}", String::from_utf8_lossy(&payload));
                    } else if header.is_control(ControlType::Ack) {
                        debug!("stray ack");
                    } else {
                        debug!("ignoring packet: {header}");
                    }
                }
                Ok(None) => {
                    info!("server closed the connection");
                    break;
                }
                Err(e) => {
                    warn!("read failed: {e}");
                    break;
                }
            }
        }

        link_up.store(false, Ordering::SeqCst);
        let _ = stream.shutdown(Shutdown::Both);
        *inner.stream.lock().unwrap() = None;
        if let Some(pinger) = pinger {
            let _ = pinger.join();
        }
        transition(&mut state, LinkState::Disconnected);
    }
    debug!("client reader stopped");
}

/// HANDSHAKE then CONFIG_LIST, each answered by an ACK. Anything else is
/// a fatal handshake failure for this connection.
fn handshake(inner: &ClientInner, stream: &UnixStream) -> bool {
    debug!("handshaking");
    if let Err(e) = write_packet(stream, Channel::Control, ControlType::Handshake as u16, &[], 0) {
        error!("sending handshake: {e}");
        return false;
    }
    if !expect_ack(stream, "handshake") {
        return false;
    }

    let configs = inner.configs.lock().unwrap().clone();
    if !configs.is_empty() {
        let payload = DeviceConfig::encode_list(&configs);
        if let Err(e) = write_packet(
            stream,
            Channel::Control,
            ControlType::ConfigList as u16,
            &payload,
            0,
        ) {
            error!("sending config list: {e}");
            return false;
        }
        if !expect_ack(stream, "config list") {
            return false;
        }
    }
    true
}

fn expect_ack(stream: &UnixStream, what: &str) -> bool {
    match read_packet(stream) {
        Ok(Some((header, _))) if header.is_control(ControlType::Ack) => true,
        Ok(Some((header, _))) => {
            error!("unexpected reply to {what}: {header}");
            false
        }
        Ok(None) => {
            error!("server closed during {what}");
            false
        }
        Err(e) => {
            error!("reading {what} reply: {e}");
            false
        }
    }
}

fn dispatch(inner: &ClientInner, key: i32, pressed: bool) {
    let callback = inner.callback.lock().unwrap().clone();
    match callback {
        Some(callback) => callback(key, pressed),
        None => debug!("dropping key {key} transition, no callback installed"),
    }
}

fn spawn_pinger(
    inner: &Arc<ClientInner>,
    stream: &UnixStream,
    link_up: &Arc<AtomicBool>,
) -> Option<JoinHandle<()>> {
    let stream = match stream.try_clone() {
        Ok(stream) => stream,
        Err(e) => {
            warn!("cloning stream for pinger failed: {e}");
            return None;
        }
    };
    let inner = inner.clone();
    let link_up = link_up.clone();
    Some(thread::spawn(move || pinger_loop(&inner, &stream, &link_up)))
}

fn pinger_loop(inner: &ClientInner, stream: &UnixStream, link_up: &AtomicBool) {
    debug!("pinger started");
    loop {
        let interval = Duration::from_millis(inner.ping_interval_ms.load(Ordering::SeqCst));
        let mut waited = Duration::ZERO;
        while waited < interval {
            if !inner.running.load(Ordering::SeqCst) || !link_up.load(Ordering::SeqCst) {
                debug!("pinger stopped");
                return;
            }
            thread::sleep(CANCEL_TICK);
            waited += CANCEL_TICK;
        }

        if let Err(e) = write_packet(stream, Channel::Control, ControlType::Ping as u16, &[], 0) {
            warn!("sending ping failed: {e}");
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        let missed = inner.missed_pongs.fetch_add(1, Ordering::SeqCst) + 1;
        if missed > MISSED_PONG_LIMIT {
            warn!("{missed} pings unanswered, forcing a reconnect");
            // The reader notices the dead stream and rebuilds the link.
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    }
}
