//! Engine tuning knobs.
//!
//! Every field has a compiled-in default and can be overridden through an
//! `AREATRACK_*` environment variable via [`TrackerTuning::from_env`].
//! Unparseable values fall back to the default.

use crate::types::ServiceVersion;
use std::time::Duration;

/// Oldest platform service the engine will talk to.
pub const MIN_SERVICE_VERSION: ServiceVersion = ServiceVersion::new(1, 4);

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerTuning {
    /// No camera frame within this window degrades status to INVALID.
    pub frame_timeout: Duration,
    /// Consecutive well-tracked frames required before VALID.
    pub init_frames: u32,
    /// Consecutive poorly-tracked frames before INVALID.
    pub lost_frames: u32,
    /// Correspondences required for a visual fix.
    pub min_matches: usize,
    /// Complementary-filter weight of the visual fix [0..1].
    pub visual_gain: f64,
    /// Bound on the local odometry landmark map.
    pub max_landmarks: usize,
    pub reloc_min_inliers: usize,
    pub reloc_max_rms_m: f64,
    /// Minimum landmark age (ticks) for a re-observation to count as a revisit.
    pub revisit_ticks: u64,
    pub disconnect_grace: Duration,
    /// Capacity of the bounded sensor queue.
    pub ingest_capacity: usize,
    pub min_service_version: ServiceVersion,
}

impl Default for TrackerTuning {
    fn default() -> Self {
        Self {
            frame_timeout: Duration::from_millis(500),
            init_frames: 3,
            lost_frames: 5,
            min_matches: 4,
            visual_gain: 0.8,
            max_landmarks: 2000,
            reloc_min_inliers: 6,
            reloc_max_rms_m: 0.05,
            revisit_ticks: 30,
            disconnect_grace: Duration::from_millis(1000),
            ingest_capacity: 256,
            min_service_version: MIN_SERVICE_VERSION,
        }
    }
}

impl TrackerTuning {
    /// Defaults overridden by any `AREATRACK_*` variables present.
    pub fn from_env() -> Self {
        let d = Self::default();
        let tuning = Self {
            frame_timeout: read_env_millis("AREATRACK_FRAME_TIMEOUT_MS", d.frame_timeout),
            init_frames: read_env_parse("AREATRACK_INIT_FRAMES", d.init_frames),
            lost_frames: read_env_parse("AREATRACK_LOST_FRAMES", d.lost_frames),
            min_matches: read_env_parse("AREATRACK_MIN_MATCHES", d.min_matches),
            visual_gain: read_env_parse("AREATRACK_VISUAL_GAIN", d.visual_gain).clamp(0.0, 1.0),
            max_landmarks: read_env_parse("AREATRACK_MAX_LANDMARKS", d.max_landmarks),
            reloc_min_inliers: read_env_parse("AREATRACK_RELOC_MIN_INLIERS", d.reloc_min_inliers),
            reloc_max_rms_m: read_env_parse("AREATRACK_RELOC_MAX_RMS_M", d.reloc_max_rms_m),
            revisit_ticks: read_env_parse("AREATRACK_REVISIT_TICKS", d.revisit_ticks),
            disconnect_grace: read_env_millis("AREATRACK_DISCONNECT_GRACE_MS", d.disconnect_grace),
            ingest_capacity: read_env_parse("AREATRACK_INGEST_CAPACITY", d.ingest_capacity).max(1),
            min_service_version: d.min_service_version,
        };
        log::debug!("Tracker tuning: {:?}", tuning);
        tuning
    }
}

/// Forgiving boolean parse shared with the demos.
pub fn read_env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| {
            let v = v.trim().to_ascii_lowercase();
            match v.as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            }
        })
        .unwrap_or(default)
}

fn read_env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn read_env_millis(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
