//! Relocalization against an area description.
//!
//! The engine owns the area map (loaded from an ADF and/or being learned)
//! and estimates `adf_T_sos`, the transform from the live start-of-service
//! frame into the area-description frame. Once any fix succeeds the
//! relocalized flag latches for the rest of the session.

use crate::area_map::{AreaMap, MapLandmark};
use crate::config::TrackerTuning;
use crate::estimator::TickOutput;
use crate::geometry::{self, Correspondence};
use crate::types::{CameraFrame, TrackingStatus};
use nalgebra::{Isometry3, Point3};
use parking_lot::RwLock;
use std::sync::Arc;

/// What one relocalization step produced.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelocUpdate {
    pub adf_t_sos: Option<Isometry3<f64>>,
    /// True only on the tick the latch flipped.
    pub newly_relocalized: bool,
    pub landmarks_added: usize,
}

pub struct RelocalizationEngine {
    tuning: TrackerTuning,
    learning: bool,
    loaded_uuid: Option<String>,
    map: Arc<RwLock<AreaMap>>,
    adf_t_sos: Option<Isometry3<f64>>,
    epoch: Option<u64>,
    relocalized: bool,
}

impl RelocalizationEngine {
    /// Engine with no loaded area description.
    pub fn new(tuning: TrackerTuning, learning: bool) -> Self {
        Self {
            tuning,
            learning,
            loaded_uuid: None,
            map: Arc::new(RwLock::new(AreaMap::new())),
            adf_t_sos: None,
            epoch: None,
            relocalized: false,
        }
    }

    /// Engine seeded with a previously saved map.
    pub fn with_loaded(tuning: TrackerTuning, learning: bool, uuid: String, map: AreaMap) -> Self {
        log::info!("Loaded area description {} ({} landmarks)", uuid, map.len());
        Self {
            loaded_uuid: Some(uuid),
            map: Arc::new(RwLock::new(map)),
            ..Self::new(tuning, learning)
        }
    }

    /// Latches true on the first successful fix; never resets within a session.
    pub fn is_relocalized(&self) -> bool {
        self.relocalized
    }

    pub fn current_adf_uuid(&self) -> Option<String> {
        self.loaded_uuid.clone()
    }

    pub fn adf_t_sos(&self) -> Option<Isometry3<f64>> {
        self.adf_t_sos
    }

    pub fn learning(&self) -> bool {
        self.learning
    }

    /// Handle on the map for the save worker.
    pub fn shared_map(&self) -> Arc<RwLock<AreaMap>> {
        self.map.clone()
    }

    /// Copy of the current map, for saving.
    pub fn snapshot(&self) -> AreaMap {
        self.map.read().clone()
    }

    /// Process one tracking tick.
    pub fn process(&mut self, tick: &TickOutput, frame: &CameraFrame) -> RelocUpdate {
        if self.epoch != Some(tick.epoch) {
            if self.epoch.is_some() {
                log::info!("Start-of-service frame re-anchored; dropping area alignment");
            }
            self.epoch = Some(tick.epoch);
            self.adf_t_sos = None;
        }

        let mut update = RelocUpdate::default();
        if tick.status != TrackingStatus::Valid {
            update.adf_t_sos = self.adf_t_sos;
            return update;
        }

        let sos_t_device = geometry::isometry_from_pose(&tick.pose);

        // A fresh learning session defines the area frame as the first
        // start-of-service frame.
        if self.learning && self.loaded_uuid.is_none() && self.map.read().is_empty() {
            self.adf_t_sos = Some(Isometry3::identity());
        }

        if let Some(adf_t_device) = self.localize(tick.tick, frame) {
            self.adf_t_sos = Some(adf_t_device * sos_t_device.inverse());
            if !self.relocalized {
                self.relocalized = true;
                update.newly_relocalized = true;
                log::info!("Relocalized at tick {} (t={} us)", tick.tick, tick.pose.timestamp_us);
            }
        }

        if self.learning {
            if let Some(adf_t_sos) = self.adf_t_sos {
                update.landmarks_added = self.extend(tick.tick, frame, &(adf_t_sos * sos_t_device));
            }
        }

        update.adf_t_sos = self.adf_t_sos;
        update
    }

    fn eligible(&self, landmark: &MapLandmark, tick: u64) -> bool {
        match landmark.first_seen_tick {
            None => true,
            Some(seen) => tick.saturating_sub(seen) >= self.tuning.revisit_ticks,
        }
    }

    /// Area-frame pose of the device, if the frame matches the map well enough.
    fn localize(&self, tick: u64, frame: &CameraFrame) -> Option<Isometry3<f64>> {
        let pairs: Vec<Correspondence> = {
            let map = self.map.read();
            frame
                .features
                .iter()
                .filter_map(|f| {
                    map.get(f.descriptor)
                        .filter(|l| self.eligible(l, tick))
                        .map(|l| Correspondence {
                            local: geometry::vec3(f.position),
                            map: l.vector(),
                        })
                })
                .collect()
        };

        if pairs.len() < self.tuning.reloc_min_inliers {
            return None;
        }

        let alignment = geometry::robust_align(&pairs, 3.0 * self.tuning.reloc_max_rms_m)?;
        if alignment.inliers < self.tuning.reloc_min_inliers
            || alignment.rms > self.tuning.reloc_max_rms_m
        {
            log::debug!(
                "Relocalization candidate rejected: {} inliers, rms {:.4} m",
                alignment.inliers,
                alignment.rms
            );
            return None;
        }
        Some(alignment.transform)
    }

    fn extend(&mut self, tick: u64, frame: &CameraFrame, adf_t_device: &Isometry3<f64>) -> usize {
        let mut map = self.map.write();
        let mut added = 0;
        for f in &frame.features {
            let p = adf_t_device * Point3::from(geometry::vec3(f.position));
            if map.insert_if_absent(f.descriptor, p.coords, tick) {
                added += 1;
            }
        }
        added
    }
}
