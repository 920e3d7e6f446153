//! Runtime configuration loaded from environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upstream endpoint configuration.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Series catalogue document.
    pub series_url: String,
    /// Broadcast-event schedule endpoint; selector query parameters are
    /// appended per request.
    pub events_url: String,
    /// Broadcaster configuration document carrying the area-to-HLS table.
    pub config_url: String,
    /// Total deadline for one outbound request.
    pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            series_url: "https://www.nhk.or.jp/radio-api/app/v1/web/series".to_string(),
            events_url: "https://www.nhk.or.jp/radio-api/app/v1/web/broadcast_events".to_string(),
            config_url: "https://www.nhk.or.jp/radio/config/config_web.json".to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address.
    pub bind_address: String,
    /// Server port.
    pub port: u16,
    /// Root directory for the catalogue, recordings and staging trees.
    pub data_root: PathBuf,
    /// Reconciliation tick interval.
    pub reconcile_interval: Duration,
    /// TTL for the series list and the area-to-HLS table.
    pub series_cache_ttl: Duration,
    /// Capture starts this much before the scheduled start.
    pub lead_in: Duration,
    /// Capture stops this much after the scheduled end.
    pub tail_out: Duration,
    /// Pending single events inside this horizon get a capture plan.
    pub schedule_horizon: Duration,
    /// Series watches materialise events inside this horizon.
    pub watch_horizon: Duration,
    /// Grace period for muxer shutdown and worker cancellation.
    pub grace_period: Duration,
    /// Target HLS segment duration handed to the muxer.
    pub segment_duration_secs: u32,
    /// Path to the external segment muxer executable.
    pub muxer_path: PathBuf,
    /// Upstream endpoints.
    pub upstream: UpstreamConfig,
    /// Optional directory for daily-rotated log files.
    pub log_dir: Option<PathBuf>,
    /// Raise the default log level to debug.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8355,
            data_root: PathBuf::from("data"),
            reconcile_interval: Duration::from_secs(30),
            series_cache_ttl: Duration::from_secs(6 * 3600),
            lead_in: Duration::from_secs(5),
            tail_out: Duration::from_secs(30),
            schedule_horizon: Duration::from_secs(25 * 3600),
            watch_horizon: Duration::from_secs(7 * 24 * 3600),
            grace_period: Duration::from_secs(10),
            segment_duration_secs: 10,
            muxer_path: PathBuf::from("ffmpeg"),
            upstream: UpstreamConfig::default(),
            log_dir: None,
            verbose: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Some(addr) = env_string("AIRCHECK_BIND_ADDRESS") {
            config.bind_address = addr;
        }
        if let Some(port) = env_parsed::<u16>("AIRCHECK_PORT") {
            config.port = port;
        }
        if let Some(root) = env_string("AIRCHECK_DATA_ROOT") {
            config.data_root = PathBuf::from(root);
        }
        if let Some(secs) = env_parsed::<u64>("AIRCHECK_RECONCILE_INTERVAL_SECS") {
            config.reconcile_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_parsed::<u64>("AIRCHECK_SERIES_CACHE_TTL_SECS") {
            config.series_cache_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parsed::<u64>("AIRCHECK_LEAD_IN_SECS") {
            config.lead_in = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parsed::<u64>("AIRCHECK_TAIL_OUT_SECS") {
            config.tail_out = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parsed::<u64>("AIRCHECK_SCHEDULE_HORIZON_SECS") {
            config.schedule_horizon = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parsed::<u64>("AIRCHECK_WATCH_HORIZON_SECS") {
            config.watch_horizon = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parsed::<u64>("AIRCHECK_GRACE_PERIOD_SECS") {
            config.grace_period = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_parsed::<u32>("AIRCHECK_SEGMENT_DURATION_SECS") {
            config.segment_duration_secs = secs.max(1);
        }
        if let Some(path) = env_string("AIRCHECK_MUXER_PATH") {
            config.muxer_path = PathBuf::from(path);
        }
        if let Some(url) = env_string("AIRCHECK_UPSTREAM_SERIES_URL") {
            config.upstream.series_url = url;
        }
        if let Some(url) = env_string("AIRCHECK_UPSTREAM_EVENTS_URL") {
            config.upstream.events_url = url;
        }
        if let Some(url) = env_string("AIRCHECK_UPSTREAM_CONFIG_URL") {
            config.upstream.config_url = url;
        }
        if let Some(secs) = env_parsed::<u64>("AIRCHECK_UPSTREAM_TIMEOUT_SECS") {
            config.upstream.request_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(dir) = env_string("AIRCHECK_LOG_DIR") {
            config.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(flag) = env_string("AIRCHECK_VERBOSE") {
            config.verbose = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        config
    }

    /// `<data_root>/catalogue.json`
    pub fn catalogue_path(&self) -> PathBuf {
        self.data_root.join("catalogue.json")
    }

    /// `<data_root>/recordings/`
    pub fn recordings_root(&self) -> PathBuf {
        self.data_root.join("recordings")
    }

    /// `<data_root>/staging/`
    pub fn staging_root(&self) -> PathBuf {
        self.data_root.join("staging")
    }

    /// Absolute directory of one recording.
    pub fn recording_dir(&self, recording_id: &str) -> PathBuf {
        self.recordings_root().join(recording_id)
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|v| v.parse().ok())
}
