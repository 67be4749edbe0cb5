use clap::Parser;
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use crate::{dedup::DEFAULT_DEDUP_WINDOW_MINUTES, event::DEFAULT_SOURCE_PACKAGES};

pub const DEFAULT_PORT: u16 = 17700;
const MAX_WORKERS: usize = 8;
// One year.
const MAX_DEDUP_WINDOW_MINUTES: i64 = 365 * 24 * 60;

#[derive(Parser, Debug)]
#[command(name = "nowplaying_core", version)]
pub struct Args {
    /// Listen address for the notification relay and history endpoints.
    ///
    /// Accepts:
    /// - ip:port (recommended), e.g. 127.0.0.1:17700
    /// - ip (implies port 17700), e.g. 127.0.0.1
    /// - localhost[:port]
    #[arg(long, default_value = "127.0.0.1:17700")]
    pub listen: String,

    /// SQLite database path.
    #[arg(long, default_value = "./data/nowplaying.db")]
    pub db: PathBuf,

    /// Package allowed to deliver recognition notifications. Repeatable.
    /// Defaults to the Pixel ambient recognizer packages.
    #[arg(long = "source-package")]
    pub source_packages: Vec<String>,

    /// Identical detections within this many minutes are recorded once.
    #[arg(long, default_value_t = DEFAULT_DEDUP_WINDOW_MINUTES)]
    pub dedup_window_minutes: i64,

    /// Pending notifications held before new ones are dropped.
    #[arg(long, default_value_t = 64)]
    pub queue_capacity: usize,

    /// Background pipeline workers.
    #[arg(long, default_value_t = 2)]
    pub workers: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub source_packages: Vec<String>,
    pub dedup_window_minutes: i64,
    pub queue_capacity: usize,
    pub workers: usize,
}

impl Settings {
    pub fn from_args(args: &Args) -> Self {
        let source_packages = if args.source_packages.is_empty() {
            DEFAULT_SOURCE_PACKAGES.iter().map(|p| p.to_string()).collect()
        } else {
            args.source_packages.clone()
        };
        Self {
            source_packages,
            dedup_window_minutes: args
                .dedup_window_minutes
                .clamp(1, MAX_DEDUP_WINDOW_MINUTES),
            queue_capacity: args.queue_capacity.max(1),
            workers: args.workers.clamp(1, MAX_WORKERS),
        }
    }
}

pub fn parse_listen(input: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    if input == "localhost" {
        return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DEFAULT_PORT));
    }

    if let Some((host, port_str)) = input.rsplit_once(':') {
        let port: u16 = port_str.parse().map_err(|_| {
            anyhow::anyhow!(
                "invalid --listen '{}': bad port. Example: 127.0.0.1:{}",
                input,
                DEFAULT_PORT
            )
        })?;
        if host == "localhost" {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
    }

    Err(anyhow::anyhow!(
        "invalid --listen '{}'. Use ip:port (e.g. 127.0.0.1:{}) or ip (e.g. 127.0.0.1).",
        input,
        DEFAULT_PORT
    ))
}
