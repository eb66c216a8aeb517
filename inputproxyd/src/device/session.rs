// SPDX-License-Identifier: MIT

//! One grabbed physical device: exclusive grab, uinput mirror, and the
//! listener worker that classifies every kernel event.

use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use input_ioctls::EV_KEY;
use inputproxy_proto::DeviceConfig;
use libc::input_event;
use log::{debug, error, warn};

use super::capabilities::{resolve, EvdevHandle};
use super::mirror::{Mirror, MirrorPlan};

/// Consumer of target-key transitions, `(key, pressed)`.
pub type KeyCallback = Arc<dyn Fn(i32, bool) + Send + Sync>;

/// Shared single-consumer callback slot. Swapping the callback while
/// sessions run is allowed; it takes effect on the next event. The slot
/// lock is never held across a callback invocation.
pub type CallbackSlot = Arc<Mutex<Option<KeyCallback>>>;

/// Interval at which the listener re-checks its `running` flag while the
/// device is idle.
const LISTEN_TICK: Duration = Duration::from_millis(100);

/// The stage at which setting up a session failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    Resolve,
    Open,
    Grab,
    Mirror,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStage::Resolve => "resolve",
            SetupStage::Open => "open",
            SetupStage::Grab => "grab",
            SetupStage::Mirror => "mirror",
        };
        f.write_str(name)
    }
}

/// A failed session setup. Never fatal: the config goes to the failed set
/// and is retried.
#[derive(Debug)]
pub struct SetupError {
    pub stage: SetupStage,
    pub source: io::Error,
}

impl SetupError {
    fn new(stage: SetupStage, source: io::Error) -> SetupError {
        SetupError { stage, source }
    }
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.source)
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Where a classified event goes on the mirror side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MirrorWrite {
    Skip,
    Verbatim,
    VerbatimThenSyn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Classification {
    pub notify: Option<bool>,
    pub mirror: MirrorWrite,
}

/// Per-session event classifier.
///
/// The target key is edge-filtered: the consumer only hears transitions,
/// with the initial state assumed released. In exclusive mode the target
/// key never reaches the mirror; otherwise its events pass through and
/// are followed by a synthetic SYN_REPORT so downstream consumers see a
/// closed frame. Everything else is mirrored verbatim, including the
/// device's own sync records.
#[derive(Debug)]
pub(crate) struct Classifier {
    target_key: i32,
    exclusive: bool,
    last_value: i32,
}

impl Classifier {
    pub(crate) fn new(target_key: i32, exclusive: bool) -> Classifier {
        Classifier {
            target_key,
            exclusive,
            last_value: 0,
        }
    }

    pub(crate) fn classify(&mut self, event: &input_event) -> Classification {
        if event.type_ == EV_KEY && i32::from(event.code) == self.target_key {
            let notify = if event.value != self.last_value {
                self.last_value = event.value;
                Some(event.value != 0)
            } else {
                None
            };
            let mirror = if self.exclusive {
                MirrorWrite::Skip
            } else {
                MirrorWrite::VerbatimThenSyn
            };
            Classification { notify, mirror }
        } else {
            Classification {
                notify: None,
                mirror: MirrorWrite::Verbatim,
            }
        }
    }
}

/// A live proxied device. Owned exclusively by the manager.
///
/// Either both fds are valid and the listener runs, or the session has
/// been torn down and neither fd remains open; no intermediate state is
/// observable from outside.
#[derive(Debug)]
pub struct DeviceSession {
    config: DeviceConfig,
    physical: Arc<EvdevHandle>,
    mirror: Arc<Mirror>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl DeviceSession {
    /// Resolves, opens, grabs, and mirrors one configured device. Each
    /// stage cleans up everything acquired before it on failure.
    pub fn open(config: DeviceConfig) -> Result<DeviceSession, SetupError> {
        let path = resolve(config.vendor_id, config.product_id, config.uid)
            .map_err(|e| SetupError::new(SetupStage::Resolve, e))?
            .ok_or_else(|| {
                SetupError::new(
                    SetupStage::Resolve,
                    io::Error::new(io::ErrorKind::NotFound, "no device matching identity"),
                )
            })?;

        let physical = EvdevHandle::open_exclusive(&path)
            .map_err(|e| SetupError::new(SetupStage::Open, e))?;

        physical
            .grab()
            .map_err(|e| SetupError::new(SetupStage::Grab, e))?;

        let mirror = MirrorPlan::from_source(&physical)
            .and_then(|plan| Mirror::create(&plan))
            .map_err(|e| {
                if let Err(e) = physical.ungrab() {
                    warn!("ungrab of {} after failed mirror: {e}", path.display());
                }
                SetupError::new(SetupStage::Mirror, e)
            })?;

        Ok(DeviceSession {
            config,
            physical: Arc::new(physical),
            mirror: Arc::new(mirror),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn mirror_name(&self) -> &str {
        self.mirror.name()
    }

    /// Launches the listener worker. Idempotent while running.
    pub fn start(&mut self, callback: CallbackSlot) {
        if self.worker.is_some() {
            return;
        }
        self.running.store(true, Ordering::SeqCst);

        let physical = self.physical.clone();
        let mirror = self.mirror.clone();
        let running = self.running.clone();
        let config = self.config;
        self.worker = Some(thread::spawn(move || {
            listen_loop(&physical, &mirror, config, &running, &callback);
        }));
    }

    /// Stops the listener. The flag is observed within one poll tick.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("listener for {} panicked", self.config);
            }
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.stop();
        // Mirror teardown (UI_DEV_DESTROY, then close) happens when the
        // Arc drops below. The grab must be released before the physical
        // fd closes.
        if let Err(e) = self.physical.ungrab() {
            warn!("ungrab of {} failed: {e}", self.config);
        }
        debug!("session for {} closed", self.config);
    }
}

fn listen_loop(
    physical: &EvdevHandle,
    mirror: &Mirror,
    config: DeviceConfig,
    running: &AtomicBool,
    callback: &CallbackSlot,
) {
    debug!("listener for {config} started");
    let mut classifier = Classifier::new(config.target_key, config.exclusive);

    'outer: while running.load(Ordering::SeqCst) {
        match physical.wait_readable(LISTEN_TICK) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                error!("waiting on {config}: {e}");
                break;
            }
        }

        loop {
            let event = match physical.read_event() {
                Ok(event) => event,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("reading {config}: {e}");
                    break 'outer;
                }
            };

            let classified = classifier.classify(&event);
            if let Some(pressed) = classified.notify {
                invoke_callback(callback, config.target_key, pressed);
            }
            match classified.mirror {
                MirrorWrite::Skip => {}
                MirrorWrite::Verbatim => mirror.emit(&event),
                MirrorWrite::VerbatimThenSyn => {
                    mirror.emit(&event);
                    mirror.emit_syn_report();
                }
            }
        }
    }
    debug!("listener for {config} stopped");
}

fn invoke_callback(slot: &CallbackSlot, key: i32, pressed: bool) {
    let callback = slot.lock().unwrap().clone();
    if let Some(callback) = callback {
        // A faulty consumer must not take the listener down with it.
        if catch_unwind(AssertUnwindSafe(|| callback(key, pressed))).is_err() {
            error!("key callback panicked for key {key}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use input_ioctls::{EV_REL, EV_SYN, SYN_REPORT};
    use std::mem;

    fn event(ty: u16, code: u16, value: i32) -> input_event {
        let mut ev: input_event = unsafe { mem::zeroed() };
        ev.type_ = ty;
        ev.code = code;
        ev.value = value;
        ev
    }

    #[test]
    fn target_key_transitions_are_edge_filtered() {
        let mut classifier = Classifier::new(276, false);

        let press = classifier.classify(&event(EV_KEY, 276, 1));
        assert_eq!(press.notify, Some(true));

        // Identical value again: no transition, no callback.
        let repeat = classifier.classify(&event(EV_KEY, 276, 1));
        assert_eq!(repeat.notify, None);
        assert_eq!(repeat.mirror, MirrorWrite::VerbatimThenSyn);

        let release = classifier.classify(&event(EV_KEY, 276, 0));
        assert_eq!(release.notify, Some(false));
    }

    #[test]
    fn initial_state_is_released() {
        let mut classifier = Classifier::new(276, false);
        let release = classifier.classify(&event(EV_KEY, 276, 0));
        assert_eq!(release.notify, None);
    }

    #[test]
    fn autorepeat_value_counts_as_transition() {
        let mut classifier = Classifier::new(276, false);
        assert_eq!(classifier.classify(&event(EV_KEY, 276, 1)).notify, Some(true));
        assert_eq!(classifier.classify(&event(EV_KEY, 276, 2)).notify, Some(true));
        assert_eq!(classifier.classify(&event(EV_KEY, 276, 2)).notify, None);
    }

    #[test]
    fn exclusive_target_never_reaches_the_mirror() {
        let mut classifier = Classifier::new(276, true);
        let press = classifier.classify(&event(EV_KEY, 276, 1));
        assert_eq!(press.notify, Some(true));
        assert_eq!(press.mirror, MirrorWrite::Skip);

        let repeat = classifier.classify(&event(EV_KEY, 276, 1));
        assert_eq!(repeat.mirror, MirrorWrite::Skip);
    }

    #[test]
    fn other_traffic_passes_through_verbatim() {
        let mut classifier = Classifier::new(276, true);

        let rel = classifier.classify(&event(EV_REL, 0, 3));
        assert_eq!(rel.notify, None);
        assert_eq!(rel.mirror, MirrorWrite::Verbatim);

        // Other keys are ordinary traffic.
        let key = classifier.classify(&event(EV_KEY, 30, 1));
        assert_eq!(key.notify, None);
        assert_eq!(key.mirror, MirrorWrite::Verbatim);

        // The device's own sync frames are preserved.
        let syn = classifier.classify(&event(EV_SYN, SYN_REPORT, 0));
        assert_eq!(syn.mirror, MirrorWrite::Verbatim);
    }

    #[test]
    fn setup_failure_reports_the_stage() {
        let config = DeviceConfig {
            vendor_id: 0xffff,
            product_id: 0xffff,
            uid: 0x1111_2222,
            target_key: 276,
            exclusive: false,
        };
        let err = DeviceSession::open(config).unwrap_err();
        assert_eq!(err.stage, SetupStage::Resolve);
        assert!(err.to_string().starts_with("resolve failed"));
    }
}
