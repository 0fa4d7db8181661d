//! This module defines types used to configure the queue, connection and
//! download parts of the core.

use std::{path::PathBuf, time::Duration};

/// The global configuration for the queue, connection, and download
/// managers.
#[derive(Clone, Debug, Deserialize)]
pub struct Conf {
    pub queue: QueueConf,
    pub connection: ConnectionConf,
    pub download: DownloadConf,
}

impl Conf {
    /// Returns configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            queue: QueueConf::new(download_dir),
            connection: ConnectionConf::new(),
            download: DownloadConf::new(),
        }
    }

    /// Parses configuration from a TOML document, e.g. the contents of a
    /// settings file.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

/// Configuration governing queue contents, bundle scheduling, and what
/// the queue will and won't accept.
#[derive(Clone, Debug, Deserialize)]
pub struct QueueConf {
    /// The directory new bundles are downloaded into before being moved to
    /// their final share location.
    pub download_dir: PathBuf,

    /// Where finished-but-unverified files sit until hashed; kept separate
    /// from `download_dir` so a half-written file is never mistaken for a
    /// finished one.
    pub temp_download_dir: PathBuf,

    /// Suffix appended to in-progress file names (`MIN_SEGMENT_SIZE`'s
    /// sibling: anything named like this is never treated as a finished
    /// share candidate).
    pub dctmp_store_destination: String,

    /// Maximum number of bundles the scheduler will keep in the running
    /// state at once. The rest wait in queue order.
    pub max_running_bundles: usize,

    /// Below this size a queue item always gets exactly one segment,
    /// regardless of `default_max_segments`.
    pub min_segment_size: u64,

    /// When `false`, `maxSegments` is derived automatically from file size
    /// via [`crate::default_max_segments`]; when `true`, `manual_segments`
    /// is used for every queue item instead.
    pub segments_manual: bool,
    pub manual_segments: u8,

    /// A newly started segment below this size, running slower than this
    /// speed, is left alone by `checkOverlaps` rather than preempted.
    pub dont_begin_segment_speed: u32,

    /// Minimum duration a segment must have been running before it is
    /// eligible for preemption by `checkOverlaps` (spec.md §4.3: 4s).
    pub overlap_min_running: Duration,

    /// Minimum remaining duration (at current speed) a segment must still
    /// have before `checkOverlaps` will preempt it (spec.md §4.3: 20s).
    pub overlap_min_remaining: Duration,

    /// Factor by which a would-be preempting source must be faster than
    /// the segment it is about to take over (spec.md §4.3: 2x).
    pub overlap_slow_sources_speedup: f64,

    /// Priority auto-adjustment mode: 0 disabled, 1 by file size only, 2
    /// by progress percentage.
    pub autoprio_type: u8,
    pub autoprio_interval: Duration,

    /// How long a finished bundle stays in the "recent" set used by UI
    /// recency filters.
    pub recent_bundle_hours: u32,

    /// Whether to automatically search for additional sources of queued
    /// files low on sources.
    pub auto_search: bool,
    pub auto_add_source: bool,
    pub auto_search_limit: usize,
    pub max_auto_match_sources: usize,

    /// Regex-based download skiplist.
    pub skiplist_download: Vec<String>,
    pub download_skiplist_use_regexp: bool,

    /// Regex matching file names that should always get `Highest`
    /// priority when added.
    pub high_prio_files: Vec<String>,
    pub highest_priority_use_regexp: bool,

    /// Dupe checks run before adding a file to the queue.
    pub dont_dl_already_shared: bool,
    pub dont_dl_already_queued: bool,
    pub min_dupe_check_size: u64,

    /// Whether finished files remain visible in the queue view after
    /// completion, or are removed immediately.
    pub keep_finished_files: bool,
}

impl QueueConf {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        let download_dir = download_dir.into();
        Self {
            temp_download_dir: download_dir.clone(),
            download_dir,
            dctmp_store_destination: ".dctmp".to_owned(),
            max_running_bundles: 0, // 0 means unlimited, matching the original
            min_segment_size: 2 * 1024 * 1024,
            segments_manual: false,
            manual_segments: 1,
            dont_begin_segment_speed: 0,
            overlap_min_running: Duration::from_secs(4),
            overlap_min_remaining: Duration::from_secs(20),
            overlap_slow_sources_speedup: 2.0,
            autoprio_type: 0,
            autoprio_interval: Duration::from_secs(60 * 10),
            recent_bundle_hours: 24,
            auto_search: false,
            auto_add_source: true,
            auto_search_limit: 15,
            max_auto_match_sources: 5,
            skiplist_download: Vec::new(),
            download_skiplist_use_regexp: false,
            high_prio_files: Vec::new(),
            highest_priority_use_regexp: false,
            dont_dl_already_shared: false,
            dont_dl_already_queued: true,
            min_dupe_check_size: 0,
            keep_finished_files: false,
        }
    }
}

/// Configuration for connection handling: flood protection, timeouts, and
/// slow-source disconnect policy.
#[derive(Clone, Debug, Deserialize)]
pub struct ConnectionConf {
    /// How long an expected (outgoing connection request) token is kept
    /// around before it is considered stale and dropped.
    pub expected_connection_ttl: Duration,

    /// Leaky-bucket flood protection, keyed by source IP. Crossing
    /// `flood_minor_threshold` within `flood_period` only logs; crossing
    /// `flood_severe_threshold` rejects the connection (spec.md §4.5).
    pub flood_minor_threshold: u32,
    pub flood_severe_threshold: u32,
    pub flood_period: Duration,
    /// Raised limit applied instead of `flood_severe_threshold` once an
    /// IP is known to be an MCN (multi-connection) peer.
    pub flood_mcn_limit: u32,

    /// Disconnect a running download if it stays below
    /// `disconnect_speed` for `disconnect_time`, provided the file is
    /// larger than `disconnect_filesize` and there are at least
    /// `disconnect_min_sources` other usable sources.
    pub disconnect_filesize: u64,
    pub disconnect_speed: u32,
    pub disconnect_time: Duration,
    pub disconnect_min_sources: usize,

    /// Below this speed a queue item is considered for removal from a
    /// misbehaving source entirely (not just disconnect-and-retry).
    pub remove_speed: u32,

    /// 0: never auto-disconnect slow downloads, 1: only for multi-source
    /// items, 2: always.
    pub dl_auto_disconnect_mode: u8,

    /// Maximum number of WAITING CQIs the per-second tick will promote to
    /// CONNECTING at once, across the whole manager (spec.md §4.5
    /// `DOWNCONN_PER_SEC`).
    pub downconn_per_sec: usize,
}

impl ConnectionConf {
    pub fn new() -> Self {
        Self {
            expected_connection_ttl: Duration::from_secs(30),
            flood_minor_threshold: 30,
            flood_severe_threshold: 45,
            flood_period: Duration::from_secs(30),
            flood_mcn_limit: 100,
            disconnect_filesize: 20 * 1024 * 1024,
            disconnect_speed: 10 * 1024,
            disconnect_time: Duration::from_secs(20),
            disconnect_min_sources: 2,
            remove_speed: 0,
            dl_auto_disconnect_mode: 0,
            downconn_per_sec: 2,
        }
    }
}

impl Default for ConnectionConf {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the per-second/per-minute download scheduling tick.
#[derive(Clone, Debug, Deserialize)]
pub struct DownloadConf {
    /// Tick interval for speed tracking and slow-source checks (spec.md
    /// §5: 1s).
    pub tick_interval: Duration,

    /// Interval between UBN (user bundle notification) progress reports
    /// and periodic bundle re-evaluation (spec.md §5: 60s).
    pub minute_tick_interval: Duration,

    /// How long to wait after the last queue mutation before persisting
    /// bundle XML to disk (spec.md §4.7).
    pub persistence_debounce: Duration,
}

impl DownloadConf {
    pub fn new() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            minute_tick_interval: Duration::from_secs(60),
            persistence_debounce: Duration::from_secs(10),
        }
    }
}

impl Default for DownloadConf {
    fn default() -> Self {
        Self::new()
    }
}
