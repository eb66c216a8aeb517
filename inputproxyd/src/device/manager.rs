// SPDX-License-Identifier: MIT

//! The proxy manager: the set of live device sessions, the failed-config
//! set, and the retry worker that heals absent devices.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use inputproxy_proto::DeviceConfig;
use log::{debug, info, warn};

use super::session::{CallbackSlot, DeviceSession, KeyCallback};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Granularity of the retry worker's sleep, so cancellation is observed
/// within one tick.
const RETRY_TICK: Duration = Duration::from_millis(100);

#[derive(Default)]
struct ManagerState {
    sessions: Vec<DeviceSession>,
    failed: Vec<DeviceConfig>,
}

/// Owns every [`DeviceSession`] and fans their target-key transitions out
/// to a single consumer callback.
///
/// A config added to the manager is always in exactly one place: the live
/// session set, or the failed set awaiting retry. The two sets share one
/// mutex; only the connection-owning thread and the retry worker mutate
/// them.
pub struct ProxyManager {
    state: Arc<Mutex<ManagerState>>,
    callback: CallbackSlot,
    running: Arc<AtomicBool>,
    retry_interval: Duration,
    retry_worker: Option<JoinHandle<()>>,
}

impl ProxyManager {
    pub fn new(retry_interval: Duration) -> ProxyManager {
        ProxyManager {
            state: Arc::new(Mutex::new(ManagerState::default())),
            callback: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            retry_interval,
            retry_worker: None,
        }
    }

    /// Installs the consumer. Replacing the callback while running takes
    /// effect on the next event; the swap is atomic.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(i32, bool) + Send + Sync + 'static,
    {
        let callback: KeyCallback = Arc::new(callback);
        *self.callback.lock().unwrap() = Some(callback);
    }

    /// Attempts to bring one configured device up. On failure the config
    /// lands in the failed set and is retried in the background.
    pub fn add_device(&self, config: DeviceConfig) {
        try_add(&self.state, &self.callback, &self.running, config);
    }

    /// Tears down the matching session, or forgets the config if it was
    /// only queued for retry.
    pub fn remove_device(&self, config: DeviceConfig) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            state.failed.retain(|c| c != &config);
            state
                .sessions
                .iter()
                .position(|s| s.config() == &config)
                .map(|pos| state.sessions.swap_remove(pos))
        };
        // Dropping the session stops its listener and releases both fds;
        // done outside the lock so the join cannot stall other callers.
        if removed.is_some() {
            info!("device {config} removed");
        } else {
            debug!("device {config} was not present");
        }
    }

    /// Launches the per-session listeners and the retry worker.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut state = self.state.lock().unwrap();
            for session in state.sessions.iter_mut() {
                session.start(self.callback.clone());
            }
        }

        let state = self.state.clone();
        let callback = self.callback.clone();
        let running = self.running.clone();
        let interval = self.retry_interval;
        self.retry_worker = Some(thread::spawn(move || {
            retry_loop(&state, &callback, &running, interval);
        }));
    }

    /// Stops the retry worker and every listener, then joins them all.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.retry_worker.take() {
            let _ = worker.join();
        }
        let mut state = self.state.lock().unwrap();
        for session in state.sessions.iter_mut() {
            session.stop();
        }
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub fn failed_configs(&self) -> Vec<DeviceConfig> {
        self.state.lock().unwrap().failed.clone()
    }
}

impl Drop for ProxyManager {
    fn drop(&mut self) {
        self.stop();
        // Sessions are destroyed here, releasing grabs and mirrors.
        self.state.lock().unwrap().sessions.clear();
    }
}

fn try_add(
    state: &Arc<Mutex<ManagerState>>,
    callback: &CallbackSlot,
    running: &Arc<AtomicBool>,
    config: DeviceConfig,
) {
    let mut st = state.lock().unwrap();
    if st.sessions.iter().any(|s| s.config() == &config) {
        debug!("device {config} already live");
        st.failed.retain(|c| c != &config);
        return;
    }

    match DeviceSession::open(config) {
        Ok(mut session) => {
            st.failed.retain(|c| c != &config);
            if running.load(Ordering::SeqCst) {
                session.start(callback.clone());
            }
            info!("device {config} proxied via '{}'", session.mirror_name());
            st.sessions.push(session);
        }
        Err(e) => {
            warn!("device {config}: {e}; queued for retry");
            if !st.failed.contains(&config) {
                st.failed.push(config);
            }
        }
    }
}

fn retry_loop(
    state: &Arc<Mutex<ManagerState>>,
    callback: &CallbackSlot,
    running: &Arc<AtomicBool>,
    interval: Duration,
) {
    debug!("retry worker started");
    let ticks = (interval.as_millis() / RETRY_TICK.as_millis()).max(1);

    'outer: loop {
        for _ in 0..ticks {
            if !running.load(Ordering::SeqCst) {
                break 'outer;
            }
            thread::sleep(RETRY_TICK);
        }

        let snapshot = {
            let mut st = state.lock().unwrap();
            mem::take(&mut st.failed)
        };
        if snapshot.is_empty() {
            continue;
        }

        debug!("retrying {} failed device(s)", snapshot.len());
        for (i, config) in snapshot.iter().enumerate() {
            if !running.load(Ordering::SeqCst) {
                // Shutdown mid-sweep: requeue what we did not get to.
                let mut st = state.lock().unwrap();
                for c in &snapshot[i..] {
                    if !st.failed.contains(c) {
                        st.failed.push(*c);
                    }
                }
                break 'outer;
            }
            try_add(state, callback, running, *config);
        }
    }
    debug!("retry worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unresolvable(uid: u32) -> DeviceConfig {
        DeviceConfig {
            vendor_id: 0xffff,
            product_id: 0xffff,
            uid,
            target_key: 276,
            exclusive: false,
        }
    }

    #[test]
    fn failed_setup_queues_the_config_once() {
        let manager = ProxyManager::new(DEFAULT_RETRY_INTERVAL);
        let config = unresolvable(0x1111_2222);

        manager.add_device(config);
        manager.add_device(config);

        assert_eq!(manager.live_count(), 0);
        assert_eq!(manager.failed_configs(), vec![config]);
    }

    #[test]
    fn remove_clears_a_queued_config() {
        let manager = ProxyManager::new(DEFAULT_RETRY_INTERVAL);
        let config = unresolvable(0x3333_4444);

        manager.add_device(config);
        manager.remove_device(config);

        assert!(manager.failed_configs().is_empty());
        assert_eq!(manager.live_count(), 0);
    }

    #[test]
    fn retry_worker_keeps_unresolvable_configs_queued() {
        let mut manager = ProxyManager::new(Duration::from_millis(100));
        let config = unresolvable(0x5555_6666);

        manager.add_device(config);
        manager.start();
        // Let at least one retry sweep run against the absent device.
        thread::sleep(Duration::from_millis(350));
        manager.stop();

        assert_eq!(manager.failed_configs(), vec![config]);
        assert_eq!(manager.live_count(), 0);
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let mut manager = ProxyManager::new(Duration::from_millis(100));
        manager.start();
        manager.start();
        manager.stop();
        manager.stop();
    }

    #[test]
    fn callback_swaps_atomically() {
        let manager = ProxyManager::new(DEFAULT_RETRY_INTERVAL);
        manager.set_callback(|_, _| {});
        manager.set_callback(|key, pressed| {
            let _ = (key, pressed);
        });
    }
}
