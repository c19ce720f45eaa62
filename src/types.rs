use std::collections::BTreeMap;
use std::fmt;

/// Reference frames a [`Pose`] can be expressed between.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinateFrame {
    /// Device pose at the moment tracking (re)started.
    StartOfService = 0,
    /// Origin of the loaded or learned area description.
    AreaDescription = 1,
    /// The device body.
    Device = 2,
}

impl CoordinateFrame {
    pub fn from_raw(raw: i32) -> Option<CoordinateFrame> {
        match raw {
            0 => Some(CoordinateFrame::StartOfService),
            1 => Some(CoordinateFrame::AreaDescription),
            2 => Some(CoordinateFrame::Device),
            _ => None,
        }
    }
}

/// A (base, target) frame pair: the pose of `target` expressed in `base`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramePair {
    pub base: CoordinateFrame,
    pub target: CoordinateFrame,
}

impl FramePair {
    pub const SOS_DEVICE: FramePair = FramePair {
        base: CoordinateFrame::StartOfService,
        target: CoordinateFrame::Device,
    };
    pub const ADF_DEVICE: FramePair = FramePair {
        base: CoordinateFrame::AreaDescription,
        target: CoordinateFrame::Device,
    };
    pub const ADF_SOS: FramePair = FramePair {
        base: CoordinateFrame::AreaDescription,
        target: CoordinateFrame::StartOfService,
    };

    pub const ALL: [FramePair; 3] = [Self::SOS_DEVICE, Self::ADF_DEVICE, Self::ADF_SOS];
}

/// Tracking health, re-derived every tick.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TrackingStatus {
    Initializing = 0,
    Valid = 1,
    Invalid = 2,
    #[default]
    Unknown = 3,
}

impl fmt::Display for TrackingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrackingStatus::Initializing => "INITIALIZING",
            TrackingStatus::Valid => "VALID",
            TrackingStatus::Invalid => "INVALID",
            TrackingStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Camera view selected by the UI. Pure state, never fails.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CameraView {
    #[default]
    FirstPerson = 0,
    ThirdPerson = 1,
    TopDown = 2,
}

impl CameraView {
    pub fn from_raw(raw: i32) -> Option<CameraView> {
        match raw {
            0 => Some(CameraView::FirstPerson),
            1 => Some(CameraView::ThirdPerson),
            2 => Some(CameraView::TopDown),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Feature switches for one tracking session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(C)]
    pub struct SessionFlags: u32 {
        const AREA_LEARNING     = 1 << 0;
        const LOAD_ADF_ON_START = 1 << 1;
        const AUTO_RECOVERY     = 1 << 2;
    }
}

/// Configuration captured once per `connect()`; immutable for the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    pub flags: SessionFlags,
    pub camera_view: CameraView,
    /// Record to load when `LOAD_ADF_ON_START` is set. `None` picks the
    /// most recently saved record.
    pub adf_uuid: Option<String>,
}

impl SessionConfig {
    pub fn new(flags: SessionFlags) -> Self {
        Self {
            flags,
            ..Default::default()
        }
    }

    pub fn with_camera_view(mut self, view: CameraView) -> Self {
        self.camera_view = view;
        self
    }

    pub fn with_adf(mut self, uuid: impl Into<String>) -> Self {
        self.flags |= SessionFlags::LOAD_ADF_ON_START;
        self.adf_uuid = Some(uuid.into());
        self
    }

    pub fn area_learning(&self) -> bool {
        self.flags.contains(SessionFlags::AREA_LEARNING)
    }

    pub fn load_adf_on_start(&self) -> bool {
        self.flags.contains(SessionFlags::LOAD_ADF_ON_START)
    }

    pub fn auto_recovery(&self) -> bool {
        self.flags.contains(SessionFlags::AUTO_RECOVERY)
    }
}

/// Version reported by the platform tracking service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceVersion {
    pub major: u16,
    pub minor: u16,
}

impl ServiceVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ServiceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// 6DOF pose of `frames.target` in `frames.base`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub frames: FramePair,
    /// Translation in meters [x, y, z].
    pub translation: [f64; 3],
    /// Quaternion [qx, qy, qz, qw].
    pub quaternion: [f64; 4],
    /// Sensor timestamp in microseconds.
    pub timestamp_us: u64,
    /// Status of the tick that produced this pose.
    pub status: TrackingStatus,
    /// Fraction of frame features matched to the map [0..1].
    pub confidence: f64,
}

impl Pose {
    /// Euler angles [roll, pitch, yaw] in degrees (ZYX convention).
    pub fn euler_deg(&self) -> [f64; 3] {
        let [x, y, z, w] = self.quaternion;
        let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
        let pitch = (2.0 * (w * y - z * x)).clamp(-1.0, 1.0).asin();
        let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));
        [roll.to_degrees(), pitch.to_degrees(), yaw.to_degrees()]
    }
}

/// One inertial measurement.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    pub timestamp_us: u64,
    /// Specific force in m/s^2, device frame.
    pub accelerometer: [f64; 3],
    /// Angular rate in rad/s, device frame.
    pub gyroscope: [f64; 3],
}

/// A tracked visual feature with a depth-resolved position.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feature {
    /// Appearance descriptor; equal descriptors denote the same physical point.
    pub descriptor: u64,
    /// Position in the device frame, meters.
    pub position: [f64; 3],
}

/// Features extracted from one camera exposure.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraFrame {
    pub timestamp_us: u64,
    pub features: Vec<Feature>,
}

/// An area description as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdfRecord {
    pub uuid: String,
    pub metadata: BTreeMap<String, String>,
    /// Opaque map payload.
    pub payload: Vec<u8>,
}

impl AdfRecord {
    pub fn name(&self) -> Option<&str> {
        self.metadata.get(crate::store::KEY_NAME).map(String::as_str)
    }
}

/// Listing entry for a stored area description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdfSummary {
    pub uuid: String,
    pub name: Option<String>,
}

/// Timestamped diagnostic key/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub timestamp_us: u64,
    pub key: String,
    pub value: String,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.value)
    }
}

/// Rolling delivery stats for one frame pair.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PoseReport {
    pub count: u64,
    /// Sensor-time gap between the last two poses, milliseconds.
    pub delta_ms: f64,
    pub status: TrackingStatus,
}

impl fmt::Display for PoseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status: {}, count: {}, delta time (ms): {:.3}",
            self.status, self.count, self.delta_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_defaults_to_unknown() {
        assert_eq!(TrackingStatus::default(), TrackingStatus::Unknown);
    }

    #[test]
    fn test_with_adf_sets_load_flag() {
        let cfg = SessionConfig::new(SessionFlags::AREA_LEARNING).with_adf("abc");
        assert!(cfg.load_adf_on_start());
        assert!(cfg.area_learning());
        assert!(!cfg.auto_recovery());
        assert_eq!(cfg.adf_uuid.as_deref(), Some("abc"));
    }

    #[test]
    fn test_service_version_ordering() {
        assert!(ServiceVersion::new(1, 9) < ServiceVersion::new(2, 0));
        assert_eq!(ServiceVersion::new(3, 1).to_string(), "3.1");
    }

    #[test]
    fn test_euler_of_yaw_rotation() {
        let half = std::f64::consts::FRAC_PI_4;
        let pose = Pose {
            frames: FramePair::SOS_DEVICE,
            translation: [0.0; 3],
            quaternion: [0.0, 0.0, half.sin(), half.cos()],
            timestamp_us: 0,
            status: TrackingStatus::Valid,
            confidence: 1.0,
        };
        let e = pose.euler_deg();
        assert!(e[0].abs() < 1e-9);
        assert!(e[1].abs() < 1e-9);
        assert!((e[2] - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_camera_view_from_raw() {
        assert_eq!(CameraView::from_raw(2), Some(CameraView::TopDown));
        assert_eq!(CameraView::from_raw(7), None);
    }
}
