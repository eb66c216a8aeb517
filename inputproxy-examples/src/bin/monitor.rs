// SPDX-License-Identifier: MIT

//! Minimal consumer that only logs key transitions. Handy for checking a
//! device/key configuration before wiring up audio commands.
//!
//! ```text
//! ptt-monitor --device 0x046d:0xc077:0xdeadbeef --key BTN_EXTRA
//! ```

use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use inputproxy_client::InputProxyClient;
use inputproxy_examples::{parse_device, parse_key};

/// Watch push-to-talk transitions for one device.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Device identity as printed by `inputproxyd --detect`
    /// (`vendor:product:uid`).
    #[arg(long)]
    device: String,

    /// Target key, by evdev code or name (e.g. `BTN_EXTRA`).
    #[arg(long)]
    key: String,

    /// Suppress the key on the mirrored device while monitoring.
    #[arg(long)]
    exclusive: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let (vendor, product, uid) = parse_device(&args.device)?;
    let key = parse_key(&args.key)?;

    let client = InputProxyClient::new();
    client.add_device(vendor, product, uid, key, args.exclusive);
    client.set_callback(|key, pressed| {
        println!("key {key} {}", if pressed { "pressed" } else { "released" });
    });
    client.start();
    println!("monitoring {} key {key} (Ctrl+C to exit)", args.device);

    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
