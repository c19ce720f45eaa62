//! Visual-inertial pose estimator.
//!
//! A complementary filter: IMU samples propagate the navigation state
//! between camera frames, and every frame is aligned against a bounded
//! local landmark map to produce a visual fix that pulls the prediction
//! back. Exactly one [`Pose`] is emitted per accepted camera frame.

use crate::config::TrackerTuning;
use crate::geometry::{self, Correspondence};
use crate::types::{CameraFrame, FramePair, ImuSample, Pose, TrackingStatus};
use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3};
use std::collections::{HashMap, VecDeque};

/// World gravity in the start-of-service frame (z up).
pub const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, -9.81);

/// Correspondences further than this from the first fit are outliers.
const FIX_INLIER_THRESHOLD_M: f64 = 0.1;

/// IMU gaps longer than this are not integrated.
const MAX_IMU_GAP_S: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
struct NavState {
    rotation: UnitQuaternion<f64>,
    position: Vector3<f64>,
    velocity: Vector3<f64>,
}

impl NavState {
    fn origin() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
        }
    }

    fn isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.position), self.rotation)
    }
}

/// Result of one tracking tick.
#[derive(Debug, Clone)]
pub struct TickOutput {
    /// Pose of the device in the start-of-service frame.
    pub pose: Pose,
    pub status: TrackingStatus,
    pub tick: u64,
    /// Increments every time the start-of-service frame is re-anchored.
    pub epoch: u64,
}

pub struct PoseEstimator {
    tuning: TrackerTuning,
    auto_recovery: bool,
    nav: Option<NavState>,
    landmarks: HashMap<u64, Vector3<f64>>,
    landmark_order: VecDeque<u64>,
    last_imu: Option<ImuSample>,
    imu_since_frame: bool,
    last_frame_us: Option<u64>,
    status: TrackingStatus,
    initialized: bool,
    good_streak: u32,
    bad_streak: u32,
    needs_reset: bool,
    tick: u64,
    epoch: u64,
}

impl PoseEstimator {
    pub fn new(tuning: TrackerTuning, auto_recovery: bool) -> Self {
        Self {
            tuning,
            auto_recovery,
            nav: None,
            landmarks: HashMap::new(),
            landmark_order: VecDeque::new(),
            last_imu: None,
            imu_since_frame: false,
            last_frame_us: None,
            status: TrackingStatus::Unknown,
            initialized: false,
            good_streak: 0,
            bad_streak: 0,
            needs_reset: false,
            tick: 0,
            epoch: 0,
        }
    }

    pub fn status(&self) -> TrackingStatus {
        self.status
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn landmark_count(&self) -> usize {
        self.landmarks.len()
    }

    /// Current start-of-service to device transform, if initialized.
    pub fn sos_t_device(&self) -> Option<Isometry3<f64>> {
        self.nav.map(|n| n.isometry())
    }

    /// Drop all state; the next frame re-anchors the start-of-service frame.
    pub fn reset(&mut self) {
        log::info!("Resetting motion tracking (epoch {})", self.epoch + 1);
        self.nav = None;
        self.landmarks.clear();
        self.landmark_order.clear();
        self.last_imu = None;
        self.imu_since_frame = false;
        self.status = TrackingStatus::Initializing;
        self.initialized = false;
        self.good_streak = 0;
        self.bad_streak = 0;
        self.needs_reset = false;
        self.epoch += 1;
    }

    /// Propagate the navigation state with one IMU sample (midpoint rule).
    pub fn process_imu(&mut self, sample: ImuSample) {
        let Some(prev) = self.last_imu.replace(sample) else {
            return;
        };
        let Some(nav) = self.nav.as_mut() else {
            return;
        };
        let dt = sample.timestamp_us.saturating_sub(prev.timestamp_us) as f64 * 1e-6;
        if dt <= 0.0 || dt > MAX_IMU_GAP_S {
            return;
        }

        let omega = 0.5 * (geometry::vec3(prev.gyroscope) + geometry::vec3(sample.gyroscope));
        nav.rotation *= UnitQuaternion::from_scaled_axis(omega * dt);

        let accel_body =
            0.5 * (geometry::vec3(prev.accelerometer) + geometry::vec3(sample.accelerometer));
        let accel_world = nav.rotation * accel_body + GRAVITY;
        nav.position += nav.velocity * dt + 0.5 * accel_world * dt * dt;
        nav.velocity += accel_world * dt;
        self.imu_since_frame = true;
    }

    /// Mark a sensor dropout: no frame arrived within the timeout.
    pub fn process_timeout(&mut self) -> TrackingStatus {
        if self.status != TrackingStatus::Invalid {
            log::warn!("No camera frame within {:?}; tracking INVALID", self.tuning.frame_timeout);
            self.status = TrackingStatus::Invalid;
        }
        self.good_streak = 0;
        self.status
    }

    /// Run one tracking tick. Frames that do not advance time are ignored.
    pub fn process_frame(&mut self, frame: &CameraFrame) -> Option<TickOutput> {
        if self.last_frame_us.is_some_and(|prev| frame.timestamp_us <= prev) {
            log::trace!("Ignoring stale frame at {} us", frame.timestamp_us);
            return None;
        }
        let dt = self
            .last_frame_us
            .map(|prev| (frame.timestamp_us - prev) as f64 * 1e-6)
            .unwrap_or(0.0);
        self.last_frame_us = Some(frame.timestamp_us);
        self.tick += 1;

        if self.needs_reset {
            self.reset();
        }

        let Some(mut nav) = self.nav else {
            return Some(self.bootstrap(frame));
        };

        let previous_position = nav.position;
        if !self.imu_since_frame && dt > 0.0 {
            // Constant-velocity prediction when the IMU is silent.
            nav.position += nav.velocity * dt;
        }
        self.imu_since_frame = false;

        let pairs: Vec<Correspondence> = frame
            .features
            .iter()
            .filter_map(|f| {
                self.landmarks.get(&f.descriptor).map(|world| Correspondence {
                    local: geometry::vec3(f.position),
                    map: *world,
                })
            })
            .collect();

        let fix = if pairs.len() >= self.tuning.min_matches {
            geometry::robust_align(&pairs, FIX_INLIER_THRESHOLD_M)
                .filter(|a| a.inliers >= self.tuning.min_matches)
        } else {
            None
        };

        let confidence = match (&fix, frame.features.len()) {
            (Some(a), n) if n > 0 => a.inliers as f64 / n as f64,
            _ => 0.0,
        };

        let good = fix.is_some();
        if let Some(alignment) = fix {
            let gain = self.tuning.visual_gain;
            let measured = alignment.transform;
            let predicted_position = nav.position;
            nav.position = predicted_position.lerp(&measured.translation.vector, gain);
            nav.rotation = nav
                .rotation
                .try_slerp(&measured.rotation, gain, 1e-9)
                .unwrap_or(measured.rotation);
            if dt > 0.0 {
                let visual_velocity = (nav.position - previous_position) / dt;
                nav.velocity = nav.velocity.lerp(&visual_velocity, gain);
            }
            self.nav = Some(nav);
            self.add_landmarks(frame, &nav.isometry());
        } else {
            self.nav = Some(nav);
            if !self.initialized {
                // Initialization never converged on this map; re-seed it here.
                self.reseed_landmarks(frame, &nav.isometry());
            }
        }

        self.update_status(good);

        Some(TickOutput {
            pose: geometry::pose_from_isometry(
                &nav.isometry(),
                FramePair::SOS_DEVICE,
                frame.timestamp_us,
                self.status,
                confidence,
            ),
            status: self.status,
            tick: self.tick,
            epoch: self.epoch,
        })
    }

    fn bootstrap(&mut self, frame: &CameraFrame) -> TickOutput {
        let nav = NavState::origin();
        self.nav = Some(nav);
        self.imu_since_frame = false;
        self.reseed_landmarks(frame, &nav.isometry());
        self.status = TrackingStatus::Initializing;
        self.initialized = false;
        self.good_streak = 0;
        self.bad_streak = 0;
        log::info!(
            "Tracking bootstrapped with {} landmarks at {} us",
            self.landmarks.len(),
            frame.timestamp_us
        );
        TickOutput {
            pose: geometry::pose_from_isometry(
                &nav.isometry(),
                FramePair::SOS_DEVICE,
                frame.timestamp_us,
                self.status,
                0.0,
            ),
            status: self.status,
            tick: self.tick,
            epoch: self.epoch,
        }
    }

    fn update_status(&mut self, good: bool) {
        if good {
            self.good_streak += 1;
            self.bad_streak = 0;
        } else {
            self.bad_streak += 1;
            self.good_streak = 0;
        }

        let next = if !self.initialized {
            if self.good_streak >= self.tuning.init_frames {
                self.initialized = true;
                TrackingStatus::Valid
            } else {
                TrackingStatus::Initializing
            }
        } else if good {
            TrackingStatus::Valid
        } else if self.bad_streak >= self.tuning.lost_frames {
            if self.auto_recovery {
                self.needs_reset = true;
            }
            TrackingStatus::Invalid
        } else {
            self.status
        };

        if next != self.status {
            log::info!("Tracking status {} -> {}", self.status, next);
        }
        self.status = next;
    }

    fn reseed_landmarks(&mut self, frame: &CameraFrame, sos_t_device: &Isometry3<f64>) {
        self.landmarks.clear();
        self.landmark_order.clear();
        self.add_landmarks(frame, sos_t_device);
    }

    fn add_landmarks(&mut self, frame: &CameraFrame, sos_t_device: &Isometry3<f64>) {
        for f in &frame.features {
            if self.landmarks.contains_key(&f.descriptor) {
                continue;
            }
            let world = (sos_t_device * Point3::from(geometry::vec3(f.position))).coords;
            self.landmarks.insert(f.descriptor, world);
            self.landmark_order.push_back(f.descriptor);
        }
        while self.landmarks.len() > self.tuning.max_landmarks {
            match self.landmark_order.pop_front() {
                Some(oldest) => {
                    self.landmarks.remove(&oldest);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::Feature;

    /// A fixed set of landmarks spread around the origin.
    pub(crate) fn scene(offset: u64) -> Vec<(u64, Vector3<f64>)> {
        (0..12)
            .map(|i| {
                let a = i as f64 * 0.7;
                (
                    offset + i,
                    Vector3::new(2.0 * a.cos(), 2.0 * a.sin(), 0.5 * (i % 3) as f64 + 1.0),
                )
            })
            .collect()
    }

    /// What a device at `device_in_world` sees of `landmarks`.
    pub(crate) fn observe(
        ts: u64,
        device_in_world: &Isometry3<f64>,
        landmarks: &[(u64, Vector3<f64>)],
    ) -> CameraFrame {
        let inv = device_in_world.inverse();
        CameraFrame {
            timestamp_us: ts,
            features: landmarks
                .iter()
                .map(|(d, p)| {
                    let local = inv * Point3::from(*p);
                    Feature {
                        descriptor: *d,
                        position: [local.x, local.y, local.z],
                    }
                })
                .collect(),
        }
    }

    fn estimator(auto_recovery: bool) -> PoseEstimator {
        PoseEstimator::new(TrackerTuning::default(), auto_recovery)
    }

    #[test]
    fn test_initializing_precedes_valid() {
        let mut est = estimator(false);
        let world = scene(0);
        let mut statuses = Vec::new();
        for i in 0..6 {
            let out = est
                .process_frame(&observe(1_000 + i * 33_000, &Isometry3::identity(), &world))
                .unwrap();
            statuses.push(out.status);
        }
        assert_eq!(statuses[0], TrackingStatus::Initializing);
        let first_valid = statuses
            .iter()
            .position(|s| *s == TrackingStatus::Valid)
            .unwrap();
        assert_eq!(first_valid, 3);
        assert!(statuses[first_valid..].iter().all(|s| *s == TrackingStatus::Valid));
    }

    #[test]
    fn test_tracks_translation() {
        let mut est = estimator(false);
        let world = scene(0);
        let mut last = None;
        for i in 0..40u64 {
            let device = Isometry3::translation(0.01 * i as f64, 0.0, 0.0);
            last = est.process_frame(&observe(1 + i * 33_000, &device, &world));
        }
        let pose = last.unwrap().pose;
        assert!((pose.translation[0] - 0.39).abs() < 0.01);
        assert!(pose.translation[1].abs() < 0.01);
        assert!((pose.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_tracks_rotation() {
        let mut est = estimator(false);
        let world = scene(0);
        let mut last = None;
        for i in 0..30u64 {
            let device = Isometry3::new(Vector3::zeros(), Vector3::new(0.0, 0.0, 0.02 * i as f64));
            last = est.process_frame(&observe(1 + i * 33_000, &device, &world));
        }
        let pose = last.unwrap().pose;
        let yaw = pose.euler_deg()[2];
        assert!((yaw - (0.58f64).to_degrees()).abs() < 1.0, "yaw {}", yaw);
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let mut est = estimator(false);
        let world = scene(0);
        assert!(est.process_frame(&observe(100, &Isometry3::identity(), &world)).is_some());
        assert!(est.process_frame(&observe(100, &Isometry3::identity(), &world)).is_none());
        assert!(est.process_frame(&observe(50, &Isometry3::identity(), &world)).is_none());
        let out = est.process_frame(&observe(200, &Isometry3::identity(), &world)).unwrap();
        assert_eq!(out.pose.timestamp_us, 200);
        assert_eq!(out.tick, 2);
    }

    #[test]
    fn test_timeout_degrades_to_invalid() {
        let mut est = estimator(false);
        let world = scene(0);
        for i in 0..5 {
            est.process_frame(&observe(1 + i * 33_000, &Isometry3::identity(), &world));
        }
        assert_eq!(est.status(), TrackingStatus::Valid);
        assert_eq!(est.process_timeout(), TrackingStatus::Invalid);
        let out = est
            .process_frame(&observe(1_000_000, &Isometry3::identity(), &world))
            .unwrap();
        assert_eq!(out.status, TrackingStatus::Valid);
    }

    #[test]
    fn test_lost_without_recovery_stays_invalid() {
        let mut est = estimator(false);
        let world = scene(0);
        let unknown = scene(1_000);
        let mut ts = 1;
        for _ in 0..5 {
            est.process_frame(&observe(ts, &Isometry3::identity(), &world));
            ts += 33_000;
        }
        for _ in 0..10 {
            est.process_frame(&observe(ts, &Isometry3::identity(), &unknown));
            ts += 33_000;
        }
        assert_eq!(est.status(), TrackingStatus::Invalid);
        assert_eq!(est.epoch(), 0);
        // Known landmarks come back into view.
        let out = est.process_frame(&observe(ts, &Isometry3::identity(), &world)).unwrap();
        assert_eq!(out.status, TrackingStatus::Valid);
    }

    #[test]
    fn test_lost_with_recovery_reinitializes() {
        let mut est = estimator(true);
        let world = scene(0);
        let unknown = scene(1_000);
        let mut ts = 1;
        for _ in 0..5 {
            est.process_frame(&observe(ts, &Isometry3::identity(), &world));
            ts += 33_000;
        }
        let mut statuses = Vec::new();
        for _ in 0..9 {
            let out = est.process_frame(&observe(ts, &Isometry3::identity(), &unknown)).unwrap();
            statuses.push(out.status);
            ts += 33_000;
        }
        assert_eq!(statuses[4], TrackingStatus::Invalid);
        assert_eq!(statuses[5], TrackingStatus::Initializing);
        assert_eq!(est.epoch(), 1);
        assert_eq!(est.status(), TrackingStatus::Valid);
    }

    #[test]
    fn test_static_imu_keeps_pose() {
        let mut est = estimator(false);
        let world = scene(0);
        est.process_frame(&observe(1, &Isometry3::identity(), &world));
        for k in 1..=10u64 {
            est.process_imu(ImuSample {
                timestamp_us: 1 + k * 3_000,
                accelerometer: [0.0, 0.0, 9.81],
                gyroscope: [0.0; 3],
            });
        }
        let out = est.process_frame(&observe(33_001, &Isometry3::identity(), &world)).unwrap();
        let t = out.pose.translation;
        assert!(t.iter().all(|v| v.abs() < 1e-9));
    }

    #[test]
    fn test_landmark_bound() {
        let tuning = TrackerTuning {
            max_landmarks: 8,
            ..TrackerTuning::default()
        };
        let mut est = PoseEstimator::new(tuning, false);
        est.process_frame(&observe(1, &Isometry3::identity(), &scene(0)));
        assert_eq!(est.landmark_count(), 8);
    }
}
