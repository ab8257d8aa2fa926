use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use clap::Parser;

use crate::{buffer::DEFAULT_BUFFER_CAP, sync::DEFAULT_SYNC_THRESHOLD};

pub const DEFAULT_PORT: u16 = 17700;
const MIN_SYNC_INTERVAL_SECONDS: u64 = 10;
const MIN_REQUEST_TIMEOUT_SECONDS: u64 = 1;
const MAX_BUFFER_CAP: usize = 100_000;

#[derive(Parser, Debug, Clone)]
#[command(name = "tracker_core", version)]
pub struct Args {
    /// Listen address for the local API used by the browser shim and popup.
    ///
    /// Accepts:
    /// - ip:port (recommended), e.g. 127.0.0.1:17700
    /// - ip (implies port 17700), e.g. 127.0.0.1
    /// - localhost or localhost:port
    #[arg(long, default_value = "127.0.0.1:17700")]
    pub listen: String,

    /// SQLite database path for buffered sessions, overrides and the device id.
    #[arg(long, default_value = "./data/tracker.db")]
    pub db: PathBuf,

    /// Collector API root.
    #[arg(long, default_value = "http://127.0.0.1:5000/api")]
    pub collector_url: String,

    /// Seconds between periodic sync attempts.
    #[arg(long, default_value_t = 5 * 60)]
    pub sync_interval_seconds: u64,

    /// Buffered session count that triggers an immediate sync.
    #[arg(long, default_value_t = DEFAULT_SYNC_THRESHOLD)]
    pub sync_threshold: usize,

    /// Maximum number of closed sessions kept locally; the oldest are evicted first.
    #[arg(long, default_value_t = DEFAULT_BUFFER_CAP)]
    pub buffer_cap: usize,

    /// Timeout for each request to the collector (seconds).
    #[arg(long, default_value_t = 10)]
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    pub listen: SocketAddr,
    pub db: PathBuf,
    pub collector_url: String,
    pub sync_interval: Duration,
    pub sync_threshold: usize,
    pub buffer_cap: usize,
    pub request_timeout: Duration,
}

impl TrackerConfig {
    pub fn from_args(args: &Args) -> anyhow::Result<Self> {
        let collector_url = args.collector_url.trim().trim_end_matches('/').to_string();
        url::Url::parse(&collector_url)
            .map_err(|err| anyhow::anyhow!("invalid --collector-url '{collector_url}': {err}"))?;

        Ok(Self {
            listen: parse_listen(&args.listen)?,
            db: args.db.clone(),
            collector_url,
            sync_interval: Duration::from_secs(
                args.sync_interval_seconds.max(MIN_SYNC_INTERVAL_SECONDS),
            ),
            sync_threshold: args.sync_threshold.max(1),
            buffer_cap: args.buffer_cap.clamp(1, MAX_BUFFER_CAP),
            request_timeout: Duration::from_secs(
                args.request_timeout_seconds.max(MIN_REQUEST_TIMEOUT_SECONDS),
            ),
        })
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

    if let Some(port_str) = input.strip_prefix("localhost:") {
        let port: u16 = port_str.parse().map_err(|_| {
            anyhow::anyhow!("invalid --listen '{input}': bad port. Example: 127.0.0.1:{DEFAULT_PORT}")
        })?;
        return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port));
    }

    Err(anyhow::anyhow!(
        "invalid --listen '{input}'. Use ip:port (e.g. 127.0.0.1:{DEFAULT_PORT}) or ip (e.g. 127.0.0.1)."
    ))
}
