use nalgebra::{linalg::SVD, Matrix3, Vector3};
use std::collections::HashMap;

use localization_types::{AnchorConfig, NodeId, Vec3};

use crate::config::AnchoringMode;
use crate::error::AnchoringError;

const SCALE_EPS: f64 = 1e-6;

fn to_vector3(v: Vec3) -> Vector3<f64> {
    Vector3::new(v.x, v.y, v.z)
}

fn to_vec3(v: Vector3<f64>) -> Vec3 {
    Vec3::new(v.x, v.y, v.z)
}

fn required(
    positions: &HashMap<NodeId, Vec3>,
    node: NodeId,
) -> Result<Vector3<f64>, AnchoringError> {
    positions
        .get(&node)
        .copied()
        .map(to_vector3)
        .ok_or(AnchoringError::MissingNode(node))
}

/// Applies the gauge-fixing similarity transform and snaps known anchors to
/// exact ground truth. Dispatches on `mode` — the two-anchor variant is the
/// spec-compatible default; the Kabsch variant is the generalized
/// least-squares alignment over all four known anchors.
pub fn align(
    positions: &mut HashMap<NodeId, Vec3>,
    anchor_config: &AnchorConfig,
    mode: AnchoringMode,
) -> Result<(), AnchoringError> {
    let (rotation, scale, translation) = match mode {
        AnchoringMode::TwoAnchor => two_anchor_transform(positions, anchor_config)?,
        AnchoringMode::KabschFourAnchor => kabsch_transform(positions, anchor_config)?,
    };

    for pos in positions.values_mut() {
        let transformed = rotation * (scale * to_vector3(*pos)) + translation;
        *pos = to_vec3(transformed);
    }

    // Erase residual numerical drift: known anchors land exactly on
    // ground truth regardless of how well the transform above fit them.
    for anchor_id in anchor_config.anchor_ids() {
        if let Some(gt) = anchor_config.position(anchor_id) {
            if let Some(slot) = positions.get_mut(&NodeId::Anchor(anchor_id)) {
                *slot = gt;
            }
        }
    }

    Ok(())
}

/// Translate solved `anchor_3` onto ground truth, scale by the
/// `anchor_3`-`anchor_0` distance ratio, rotate the `anchor_3 -> anchor_0`
/// direction onto its ground-truth counterpart. Returns `(R, scale, t)` such
/// that `p' = R * (scale * p) + t`.
fn two_anchor_transform(
    positions: &HashMap<NodeId, Vec3>,
    anchor_config: &AnchorConfig,
) -> Result<(Matrix3<f64>, f64, Vector3<f64>), AnchoringError> {
    let solved_a3 = required(positions, NodeId::Anchor(3))?;
    let solved_a0 = required(positions, NodeId::Anchor(0))?;
    let gt_a3 = to_vector3(
        anchor_config
            .position(3)
            .ok_or(AnchoringError::MissingNode(NodeId::Anchor(3)))?,
    );
    let gt_a0 = to_vector3(
        anchor_config
            .position(0)
            .ok_or(AnchoringError::MissingNode(NodeId::Anchor(0)))?,
    );

    let solved_dir = solved_a0 - solved_a3;
    let gt_dir = gt_a0 - gt_a3;
    let solved_dist = solved_dir.norm();
    let gt_dist = gt_dir.norm();

    let scale = if solved_dist < SCALE_EPS {
        1.0
    } else {
        gt_dist / solved_dist
    };

    let rotation = rotation_between(solved_dir, gt_dir);

    // p' = R*(scale*p) + t, with t chosen so solved_a3 maps exactly to gt_a3.
    let translation = gt_a3 - rotation * (scale * solved_a3);

    Ok((rotation, scale, translation))
}

/// Rotation mapping `from` onto `to`. Planar case (both near-zero z) uses a
/// 2D yaw in the XY plane; general case uses the axis-angle rotation from
/// the cross product, falling back to identity (parallel) or a 180°
/// rotation about an arbitrary perpendicular axis (antiparallel).
fn rotation_between(from: Vector3<f64>, to: Vector3<f64>) -> Matrix3<f64> {
    const PLANAR_EPS: f64 = 1e-6;

    if from.z.abs() < PLANAR_EPS && to.z.abs() < PLANAR_EPS {
        let yaw = to.y.atan2(to.x) - from.y.atan2(from.x);
        let (s, c) = yaw.sin_cos();
        return Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0);
    }

    let from_unit = from.normalize();
    let to_unit = to.normalize();
    let axis = from_unit.cross(&to_unit);
    let axis_norm = axis.norm();
    let cos_angle = from_unit.dot(&to_unit).clamp(-1.0, 1.0);

    if axis_norm < PLANAR_EPS {
        if cos_angle > 0.0 {
            return Matrix3::identity();
        }
        // Antiparallel: pick any axis perpendicular to `from_unit`.
        let fallback_axis = if from_unit.x.abs() < 0.9 {
            Vector3::x()
        } else {
            Vector3::y()
        };
        let perp = from_unit.cross(&fallback_axis).normalize();
        return axis_angle_rotation(perp, std::f64::consts::PI);
    }

    let angle = cos_angle.acos();
    axis_angle_rotation(axis / axis_norm, angle)
}

fn axis_angle_rotation(axis: Vector3<f64>, angle: f64) -> Matrix3<f64> {
    let (s, c) = angle.sin_cos();
    let k = Matrix3::new(
        0.0, -axis.z, axis.y, //
        axis.z, 0.0, -axis.x, //
        -axis.y, axis.x, 0.0,
    );
    Matrix3::identity() + s * k + (1.0 - c) * (k * k)
}

/// Generalized least-squares similarity alignment (Umeyama's method) over
/// all four known anchors, rather than just anchors 3 and 0.
fn kabsch_transform(
    positions: &HashMap<NodeId, Vec3>,
    anchor_config: &AnchorConfig,
) -> Result<(Matrix3<f64>, f64, Vector3<f64>), AnchoringError> {
    let mut ids: Vec<u8> = anchor_config.anchor_ids().collect();
    ids.sort_unstable();

    let mut solved = Vec::with_capacity(ids.len());
    let mut truth = Vec::with_capacity(ids.len());
    for id in &ids {
        solved.push(required(positions, NodeId::Anchor(*id))?);
        truth.push(to_vector3(
            anchor_config
                .position(*id)
                .ok_or(AnchoringError::MissingNode(NodeId::Anchor(*id)))?,
        ));
    }

    let n = solved.len() as f64;
    let mu_solved = solved.iter().fold(Vector3::zeros(), |a, b| a + b) / n;
    let mu_truth = truth.iter().fold(Vector3::zeros(), |a, b| a + b) / n;

    let variance_solved: f64 = solved
        .iter()
        .map(|p| (p - mu_solved).norm_squared())
        .sum::<f64>()
        / n;

    let mut sigma = Matrix3::zeros();
    for (p, q) in solved.iter().zip(truth.iter()) {
        sigma += (q - mu_truth) * (p - mu_solved).transpose();
    }
    sigma /= n;

    let svd = SVD::new(sigma, true, true);
    let u = svd.u.expect("SVD::new(_, true, true) computes u");
    let v_t = svd.v_t.expect("SVD::new(_, true, true) computes v_t");
    let singular_values = svd.singular_values;

    let d_sign = if sigma.determinant() >= 0.0 { 1.0 } else { -1.0 };
    let d = Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, d_sign);

    let rotation = u * d * v_t;

    let scale = if variance_solved < SCALE_EPS {
        1.0
    } else {
        (singular_values[0] + singular_values[1] + d_sign * singular_values[2]) / variance_solved
    };

    let translation = mu_truth - rotation * (scale * mu_solved);

    Ok((rotation, scale, translation))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn near_zero_solved_distance_defaults_scale_to_one_without_nan() {
        let mut positions = HashMap::new();
        positions.insert(NodeId::Anchor(3), Vec3::new(10.0, 10.0, 0.0));
        positions.insert(NodeId::Anchor(0), Vec3::new(10.0, 10.0, 0.0));
        positions.insert(NodeId::Anchor(1), Vec3::new(5.0, 5.0, 0.0));
        positions.insert(NodeId::Anchor(2), Vec3::new(6.0, 6.0, 0.0));
        positions.insert(NodeId::Phone(0), Vec3::new(1.0, 2.0, 3.0));

        let cfg = AnchorConfig::canonical();
        align(&mut positions, &cfg, AnchoringMode::TwoAnchor).unwrap();

        for (_, p) in positions.iter() {
            assert!(p.is_finite());
        }
    }

    #[test]
    fn missing_anchoring_node_is_an_error() {
        let mut positions = HashMap::new();
        positions.insert(NodeId::Anchor(3), Vec3::new(0.0, 0.0, 0.0));
        let cfg = AnchorConfig::canonical();
        let result = align(&mut positions, &cfg, AnchoringMode::TwoAnchor);
        assert!(result.is_err());
    }

    #[test]
    fn two_anchor_alignment_snaps_known_anchors_to_ground_truth() {
        let cfg = AnchorConfig::canonical();
        // Solved graph rotated 90 degrees and scaled 1.5x from ground truth.
        let rotate_90 = |v: Vec3| Vec3::new(-v.y, v.x, v.z);
        let mut positions = HashMap::new();
        for id in 0u8..4 {
            let gt = cfg.position(id).unwrap();
            let scaled = Vec3::new(gt.x * 1.5, gt.y * 1.5, gt.z * 1.5);
            positions.insert(NodeId::Anchor(id), rotate_90(scaled));
        }
        positions.insert(NodeId::Phone(0), rotate_90(Vec3::new(360.0, 450.0, 0.0)));

        align(&mut positions, &cfg, AnchoringMode::TwoAnchor).unwrap();

        for id in 0u8..4 {
            let gt = cfg.position(id).unwrap();
            let solved = positions[&NodeId::Anchor(id)];
            assert!((solved.x - gt.x).abs() < 1e-6);
            assert!((solved.y - gt.y).abs() < 1e-6);
            assert!((solved.z - gt.z).abs() < 1e-6);
        }
    }

    #[test]
    fn kabsch_alignment_also_recovers_ground_truth_anchors() {
        let cfg = AnchorConfig::canonical();
        let rotate_90 = |v: Vec3| Vec3::new(-v.y, v.x, v.z);
        let mut positions = HashMap::new();
        for id in 0u8..4 {
            let gt = cfg.position(id).unwrap();
            positions.insert(NodeId::Anchor(id), rotate_90(gt));
        }
        positions.insert(NodeId::Phone(0), rotate_90(Vec3::new(360.0, 450.0, 0.0)));

        align(&mut positions, &cfg, AnchoringMode::KabschFourAnchor).unwrap();

        for id in 0u8..4 {
            let gt = cfg.position(id).unwrap();
            let solved = positions[&NodeId::Anchor(id)];
            assert!((solved.x - gt.x).abs() < 1e-6);
            assert!((solved.y - gt.y).abs() < 1e-6);
        }
    }
}
