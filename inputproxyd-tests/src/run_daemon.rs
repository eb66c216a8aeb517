// SPDX-License-Identifier: MIT

//! Process guard for integration tests that exercise the real daemon.

use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// A running `inputproxyd` bound to a private socket. Terminated with
/// SIGTERM (SIGKILL as a last resort) when dropped.
pub struct DaemonGuard {
    child: Child,
}

impl DaemonGuard {
    /// Launches the daemon via cargo and waits until its socket appears.
    pub fn start(socket_path: &Path) -> DaemonGuard {
        println!("executing inputproxyd located via cargo run");
        let child = unsafe {
            Command::new("cargo")
                .args([
                    "run",
                    "-p",
                    "inputproxyd",
                    "--",
                    "--socket",
                    socket_path.to_str().expect("socket path is not UTF-8"),
                    "--retry-interval",
                    "1",
                ])
                .pre_exec(|| {
                    // Last resort, if the parent just is killed.
                    libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
                    Ok(())
                })
                .spawn()
                .expect("failed to start inputproxyd")
        };

        let guard = DaemonGuard { child };
        let deadline = Instant::now() + Duration::from_secs(60);
        while !socket_path.exists() {
            assert!(
                Instant::now() < deadline,
                "inputproxyd did not create {} in time",
                socket_path.display()
            );
            thread::sleep(Duration::from_millis(100));
        }
        guard
    }
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let pid = Pid::from_raw(self.child.id() as i32);

        let _ = signal::kill(pid, Signal::SIGTERM);
        for _ in 0..10 {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }

        let _ = signal::kill(pid, Signal::SIGKILL);
        let _ = self.child.wait();
    }
}
