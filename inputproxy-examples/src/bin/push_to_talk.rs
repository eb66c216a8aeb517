// SPDX-License-Identifier: MIT

//! Demonstration consumer: binds proxied key transitions to microphone
//! mute/unmute commands and optional audio cues.
//!
//! Config file example:
//!
//! ```json
//! {
//!   "devices": [
//!     { "device": "0x046d:0xc077:0xdeadbeef", "target_key": 276, "exclusive": true }
//!   ],
//!   "unmute_command": ["wpctl", "set-mute", "@DEFAULT_AUDIO_SOURCE@", "0"],
//!   "mute_command": ["wpctl", "set-mute", "@DEFAULT_AUDIO_SOURCE@", "1"],
//!   "press_cue_command": ["paplay", "/usr/share/sounds/ptt-on.ogg"]
//! }
//! ```
//!
//! The `device` triple is exactly what `inputproxyd --detect` prints.

use std::fs::File;
use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use input_ioctls::keys;
use inputproxy_client::InputProxyClient;
use inputproxy_examples::{parse_device, parse_key};
use log::{info, warn};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ConsumerConfig {
    devices: Vec<DeviceEntry>,
    mute_command: Vec<String>,
    unmute_command: Vec<String>,
    #[serde(default)]
    press_cue_command: Option<Vec<String>>,
    #[serde(default)]
    release_cue_command: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct DeviceEntry {
    /// `vendor:product:uid`, hex as printed by detection mode.
    device: String,
    target_key: KeySpec,
    #[serde(default)]
    exclusive: bool,
}

/// A key, either as a raw evdev code or a symbolic name like
/// `"BTN_EXTRA"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KeySpec {
    Code(i32),
    Name(String),
}

impl KeySpec {
    fn resolve(&self) -> Result<i32> {
        match self {
            KeySpec::Code(code) => Ok(*code),
            KeySpec::Name(name) => parse_key(name),
        }
    }
}

/// Push-to-talk consumer for inputproxyd.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the consumer config file.
    #[arg(long, default_value = "push-to-talk.json")]
    config: PathBuf,

    /// Print the known key names and exit.
    #[arg(long)]
    list_keys: bool,

    /// Log at debug level.
    #[arg(long)]
    debug: bool,
}

fn run_command(argv: &[String]) {
    let Some((program, args)) = argv.split_first() else {
        return;
    };
    match Command::new(program).args(args).status() {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("'{program}' exited with {status}"),
        Err(e) => warn!("running '{program}' failed: {e}"),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    if args.list_keys {
        for (name, code) in keys::KNOWN_KEYS {
            println!("{code:>4}  {name}");
        }
        return Ok(());
    }

    let file = File::open(&args.config)
        .with_context(|| format!("opening {}", args.config.display()))?;
    let config: ConsumerConfig = serde_json::from_reader(file).context("parsing config")?;
    if config.devices.is_empty() {
        bail!("no devices configured; run 'inputproxyd --detect' to find yours");
    }

    let client = InputProxyClient::new();
    for entry in &config.devices {
        let (vendor, product, uid) = parse_device(&entry.device)?;
        let target_key = entry.target_key.resolve()?;
        client.add_device(vendor, product, uid, target_key, entry.exclusive);
        info!("registered {} key {target_key}", entry.device);
    }

    client.set_callback(move |key, pressed| {
        info!("key {key} {}", if pressed { "pressed" } else { "released" });
        if pressed {
            run_command(&config.unmute_command);
            if let Some(cue) = &config.press_cue_command {
                run_command(cue);
            }
        } else {
            run_command(&config.mute_command);
            if let Some(cue) = &config.release_cue_command {
                run_command(cue);
            }
        }
    });
    client.start();
    info!("push-to-talk running, hold your key to talk");

    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_spec_resolution() {
        assert_eq!(KeySpec::Code(276).resolve().unwrap(), 276);
        assert_eq!(KeySpec::Name("BTN_EXTRA".to_string()).resolve().unwrap(), 276);
        assert!(KeySpec::Name("KEY_NOPE".to_string()).resolve().is_err());
    }
}
