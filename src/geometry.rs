//! Rigid-body helpers shared by the estimator and relocalization.

use crate::types::{FramePair, Pose, TrackingStatus};
use nalgebra::{Isometry3, Matrix3, Point3, Rotation3, Translation3, UnitQuaternion, Vector3};

/// A device-frame point paired with the same point in a map frame.
#[derive(Debug, Clone, Copy)]
pub struct Correspondence {
    pub local: Vector3<f64>,
    pub map: Vector3<f64>,
}

/// Result of a robust rigid alignment.
#[derive(Debug, Clone, Copy)]
pub struct Alignment {
    /// Maps local points into the map frame.
    pub transform: Isometry3<f64>,
    pub inliers: usize,
    pub rms: f64,
}

pub fn vec3(a: [f64; 3]) -> Vector3<f64> {
    Vector3::new(a[0], a[1], a[2])
}

pub fn isometry_from_pose(pose: &Pose) -> Isometry3<f64> {
    let [x, y, z, w] = pose.quaternion;
    let q = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(w, x, y, z));
    Isometry3::from_parts(Translation3::from(vec3(pose.translation)), q)
}

pub fn pose_from_isometry(
    iso: &Isometry3<f64>,
    frames: FramePair,
    timestamp_us: u64,
    status: TrackingStatus,
    confidence: f64,
) -> Pose {
    let t = iso.translation.vector;
    let q = iso.rotation.quaternion();
    Pose {
        frames,
        translation: [t.x, t.y, t.z],
        quaternion: [q.i, q.j, q.k, q.w],
        timestamp_us,
        status,
        confidence,
    }
}

/// Least-squares rigid transform mapping `local` onto `map` (Kabsch).
///
/// Returns `None` for fewer than three pairs or a (near) collinear set.
pub fn rigid_align(pairs: &[Correspondence]) -> Option<Isometry3<f64>> {
    if pairs.len() < 3 {
        return None;
    }
    let n = pairs.len() as f64;
    let c_local = pairs.iter().fold(Vector3::zeros(), |acc, p| acc + p.local) / n;
    let c_map = pairs.iter().fold(Vector3::zeros(), |acc, p| acc + p.map) / n;

    let mut h = Matrix3::zeros();
    for p in pairs {
        h += (p.local - c_local) * (p.map - c_map).transpose();
    }

    let svd = h.svd(true, true);
    // Rank < 2 means the points do not pin down a rotation.
    let mut sv: Vec<f64> = svd.singular_values.iter().copied().collect();
    sv.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    if sv[1] < 1e-9 * sv[0].max(1e-12) || sv[0] < 1e-12 {
        return None;
    }

    let u = svd.u?;
    let v = svd.v_t?.transpose();
    let mut d = Matrix3::identity();
    if (v * u.transpose()).determinant() < 0.0 {
        d[(2, 2)] = -1.0;
    }
    let r = v * d * u.transpose();
    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r));
    let translation = c_map - rotation * c_local;
    Some(Isometry3::from_parts(Translation3::from(translation), rotation))
}

pub fn residual(transform: &Isometry3<f64>, pair: &Correspondence) -> f64 {
    (transform * Point3::from(pair.local) - Point3::from(pair.map)).norm()
}

fn rms(transform: &Isometry3<f64>, pairs: &[Correspondence]) -> f64 {
    if pairs.is_empty() {
        return 0.0;
    }
    let sum: f64 = pairs.iter().map(|p| residual(transform, p).powi(2)).sum();
    (sum / pairs.len() as f64).sqrt()
}

/// Kabsch with one round of outlier rejection.
///
/// Pairs whose residual under the first estimate exceeds `inlier_threshold`
/// are dropped and the transform is re-estimated from the rest.
pub fn robust_align(pairs: &[Correspondence], inlier_threshold: f64) -> Option<Alignment> {
    let first = rigid_align(pairs)?;
    let inliers: Vec<Correspondence> = pairs
        .iter()
        .copied()
        .filter(|p| residual(&first, p) <= inlier_threshold)
        .collect();

    if inliers.len() == pairs.len() {
        return Some(Alignment {
            transform: first,
            inliers: inliers.len(),
            rms: rms(&first, &inliers),
        });
    }

    let refined = rigid_align(&inliers)?;
    Some(Alignment {
        transform: refined,
        inliers: inliers.len(),
        rms: rms(&refined, &inliers),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloud() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 2.0, 0.0),
            Vector3::new(0.0, 0.0, 3.0),
            Vector3::new(1.0, 1.0, 1.0),
            Vector3::new(-1.0, 0.5, 2.0),
        ]
    }

    #[test]
    fn test_rigid_align_recovers_transform() {
        let truth = Isometry3::new(Vector3::new(0.3, -1.2, 2.0), Vector3::new(0.1, 0.4, -0.2));
        let pairs: Vec<_> = cloud()
            .into_iter()
            .map(|p| Correspondence {
                local: p,
                map: (truth * Point3::from(p)).coords,
            })
            .collect();
        let est = rigid_align(&pairs).unwrap();
        assert!((est.translation.vector - truth.translation.vector).norm() < 1e-9);
        assert!(est.rotation.angle_to(&truth.rotation) < 1e-9);
    }

    #[test]
    fn test_collinear_points_rejected() {
        let pairs: Vec<_> = (0..5)
            .map(|i| {
                let p = Vector3::new(i as f64, 0.0, 0.0);
                Correspondence { local: p, map: p }
            })
            .collect();
        assert!(rigid_align(&pairs).is_none());
    }

    #[test]
    fn test_robust_align_drops_outlier() {
        let mut pairs = Vec::new();
        for x in -1..=1 {
            for y in -1..=1 {
                for z in -1..=1 {
                    let p = Vector3::new(x as f64, y as f64, z as f64);
                    pairs.push(Correspondence {
                        local: p,
                        map: p + Vector3::new(0.5, 0.0, 0.0),
                    });
                }
            }
        }
        pairs.push(Correspondence {
            local: Vector3::new(1.0, 1.0, 1.0),
            map: Vector3::new(1.5, 1.0, 2.5),
        });
        let a = robust_align(&pairs, 0.5).unwrap();
        assert_eq!(a.inliers, 27);
        assert!(a.rms < 1e-9);
        assert!((a.transform.translation.vector.x - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_pose_isometry_conversion() {
        let iso = Isometry3::new(Vector3::new(1.0, 2.0, 3.0), Vector3::new(0.0, 0.0, 0.5));
        let pose = pose_from_isometry(&iso, FramePair::SOS_DEVICE, 10, TrackingStatus::Valid, 1.0);
        let back = isometry_from_pose(&pose);
        assert!((back.translation.vector - iso.translation.vector).norm() < 1e-12);
        assert!(back.rotation.angle_to(&iso.rotation) < 1e-12);
    }
}
