//! Configuration options.
//!
//! Applications embedding the core are free to define their own command line
//! arguments, but the core itself is configured through a TOML file that
//! defines runtime options for the worker pool, connection tracking, capture
//! rotation, and on-disk layout. The path to the configuration file itself
//! will typically be a command line argument passed to the application.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> RuntimeConfig {
    let config_str = fs::read_to_string(path).expect("ERROR: File read failed");
    let config: RuntimeConfig = toml::from_str(&config_str).expect("Invalid config file");
    config
}

/// Loads a default configuration.
///
/// For demonstration and testing purposes, not configured for performance.
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Runtime configuration options.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Worker pool settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Connection tracking settings.
    #[serde(default)]
    pub conntrack: ConnTrackConfig,

    /// Capture and on-disk layout settings.
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Search execution settings.
    #[serde(default)]
    pub search: SearchConfig,
}

/* --------------------------------------------------------------------------------- */

/// Worker pool options.
///
/// ## Example
/// ```toml
/// [pipeline]
///     workers = 4
///     channel_capacity = 4096
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PipelineConfig {
    /// Number of packet processing workers. Each worker owns a slice of the
    /// flow table; packets of one flow always land on the same worker.
    /// Defaults to `4`.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of each worker's inbox. A full inbox blocks the producing
    /// session reader (backpressure). Defaults to `4096`.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_workers() -> usize {
    4
}

fn default_channel_capacity() -> usize {
    4096
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            workers: default_workers(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/* --------------------------------------------------------------------------------- */

/// Connection tracking options.
///
/// These options can be used to tune for resource usage vs. accuracy
/// depending on expected network characteristics.
///
/// ## Example
/// ```toml
/// [conntrack]
///     max_connections = 100_000
///     max_out_of_order = 100
///     max_gap_bytes = 4_194_304
///     max_flow_bytes = 268_435_456
///     timeout_resolution = 1000
///     tcp_inactivity_timeout = 300_000
///     tcp_establish_timeout = 5000
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ConnTrackConfig {
    /// Maximum number of connections that can be tracked simultaneously
    /// per-worker. When the table is full the least recently touched flow is
    /// force-finalized to make room. Defaults to `100_000`.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum number of out-of-order segments buffered per TCP flow side.
    /// Defaults to `100`.
    #[serde(default = "default_max_out_of_order")]
    pub max_out_of_order: usize,

    /// Maximum number of bytes buffered ahead of a sequence gap before the
    /// gap is abandoned and the stream fast-forwards. Skipped bytes are
    /// counted as dropped. Defaults to `4_194_304` (4 MiB).
    #[serde(default = "default_max_gap_bytes")]
    pub max_gap_bytes: usize,

    /// Maximum number of payload bytes accumulated per connection before it
    /// is force-finalized. A new connection starts on the next SYN of the
    /// same flow. Defaults to `268_435_456` (256 MiB).
    #[serde(default = "default_max_flow_bytes")]
    pub max_flow_bytes: usize,

    /// Frequency to check for inactive flows (in milliseconds). Defaults to
    /// `1000` (1 second).
    #[serde(default = "default_timeout_resolution")]
    pub timeout_resolution: usize,

    /// A TCP flow can be inactive for up to this amount of time (in
    /// milliseconds) before it is force-finalized. Defaults to `300_000`
    /// (5 minutes).
    #[serde(default = "default_tcp_inactivity_timeout")]
    pub tcp_inactivity_timeout: usize,

    /// Inactivity time between the first and second packet of a TCP flow
    /// before it is force expired (in milliseconds).
    ///
    /// This approximates connections that remain inactive in either the
    /// `SYN-SENT` or `SYN-RECEIVED` state without progressing. It is used to
    /// prevent memory exhaustion due to SYN scans and SYN floods. Defaults
    /// to `5000` (5 seconds).
    #[serde(default = "default_tcp_establish_timeout")]
    pub tcp_establish_timeout: usize,
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_out_of_order() -> usize {
    100
}

fn default_max_gap_bytes() -> usize {
    4_194_304
}

fn default_max_flow_bytes() -> usize {
    268_435_456
}

fn default_timeout_resolution() -> usize {
    1000
}

fn default_tcp_inactivity_timeout() -> usize {
    300_000
}

fn default_tcp_establish_timeout() -> usize {
    5000
}

impl Default for ConnTrackConfig {
    fn default() -> Self {
        ConnTrackConfig {
            max_connections: default_max_connections(),
            max_out_of_order: default_max_out_of_order(),
            max_gap_bytes: default_max_gap_bytes(),
            max_flow_bytes: default_max_flow_bytes(),
            timeout_resolution: default_timeout_resolution(),
            tcp_inactivity_timeout: default_tcp_inactivity_timeout(),
            tcp_establish_timeout: default_tcp_establish_timeout(),
        }
    }
}

/* --------------------------------------------------------------------------------- */

/// Capture and on-disk layout options.
///
/// ## Example
/// ```toml
/// [capture]
///     data_dir = "./data"
///     rotation_interval = 300_000
///     snaplen = 65535
///     promiscuous = true
///     read_timeout = 250
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CaptureConfig {
    /// Root directory for persisted PCAPs. `pcaps/`, `pcaps/processing/`,
    /// and `connections/` are created beneath it. Defaults to `"./data"`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Live-capture rotation interval in milliseconds. At each boundary the
    /// current PCAP is closed and a new session begins. Runtime-adjustable.
    /// Defaults to `300_000` (5 minutes).
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval: u64,

    /// Snapshot length for live captures. Defaults to `65535`.
    #[serde(default = "default_snaplen")]
    pub snaplen: i32,

    /// Whether live captures open the interface in promiscuous mode.
    /// Defaults to `true`.
    #[serde(default = "default_promiscuous")]
    pub promiscuous: bool,

    /// Live-capture read timeout in milliseconds. Bounds how long a stop or
    /// rotation check can lag behind the last packet. Defaults to `250`.
    #[serde(default = "default_read_timeout")]
    pub read_timeout: i32,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_rotation_interval() -> u64 {
    300_000
}

fn default_snaplen() -> i32 {
    65535
}

fn default_promiscuous() -> bool {
    true
}

fn default_read_timeout() -> i32 {
    250
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            data_dir: default_data_dir(),
            rotation_interval: default_rotation_interval(),
            snaplen: default_snaplen(),
            promiscuous: default_promiscuous(),
            read_timeout: default_read_timeout(),
        }
    }
}

/* --------------------------------------------------------------------------------- */

/// Search execution options.
///
/// ## Example
/// ```toml
/// [search]
///     max_results = 200
///     timeout = 10_000
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SearchConfig {
    /// Maximum number of connections returned by one search. Defaults to
    /// `200`.
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Search wall-clock budget in milliseconds. A search that exhausts it
    /// returns the matches found so far. Defaults to `10_000`.
    #[serde(default = "default_search_timeout")]
    pub timeout: u64,
}

fn default_max_results() -> usize {
    200
}

fn default_search_timeout() -> u64 {
    10_000
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            max_results: default_max_results(),
            timeout: default_search_timeout(),
        }
    }
}
