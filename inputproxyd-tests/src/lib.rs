// SPDX-License-Identifier: MIT

//! Test harness for the input proxy: raw wire helpers for byte-level
//! protocol conformance tests, and a process guard for running the real
//! daemon in privileged integration tests.

pub mod raw;
pub mod run_daemon;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A unique throwaway socket path for one test.
pub fn scratch_socket_path(tag: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    std::env::temp_dir().join(format!(
        "inputproxyd-{tag}-{}-{}.sock",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
}
