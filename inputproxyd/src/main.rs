// SPDX-License-Identifier: MIT

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use inputproxyd::detect;
use inputproxyd::server::ProxyServer;

/// Privileged input-proxy daemon for multi-device push-to-talk.
#[derive(Parser, Debug)]
#[command(name = "inputproxyd", version, about)]
struct Args {
    /// Print device info for pressed keys instead of serving. Devices are
    /// never grabbed in this mode.
    #[arg(long)]
    detect: bool,

    /// Log at debug level.
    #[arg(long)]
    debug: bool,

    /// Path of the listening socket.
    #[arg(long, default_value = inputproxy_proto::SOCKET_PATH)]
    socket: PathBuf,

    /// Seconds between retry sweeps over devices that failed to come up.
    #[arg(long, default_value_t = 5)]
    retry_interval: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    if args.detect {
        return detect::run();
    }

    log::info!("starting inputproxyd");
    ProxyServer::new(args.socket, Duration::from_secs(args.retry_interval)).run()
}
