use nalgebra::{Matrix3, Vector3};
use std::collections::HashMap;

use localization_types::{AnchorConfig, BinnedData, Edge, NodeId, Vec3};

use crate::error::CoreError;

/// Per-anchor yaw (degrees) for the canonical four-corner mounting. Each
/// anchor board is additionally pitched 45° downward toward the room
/// center; the yaw alone distinguishes which corner it sits in.
fn anchor_yaw_deg(anchor_id: u8) -> Option<f64> {
    match anchor_id {
        0 => Some(225.0),
        1 => Some(315.0),
        2 => Some(135.0),
        3 => Some(45.0),
        _ => None,
    }
}

fn rotation_z(deg: f64) -> Matrix3<f64> {
    let r = deg.to_radians();
    let (s, c) = r.sin_cos();
    Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0)
}

fn rotation_y(deg: f64) -> Matrix3<f64> {
    let r = deg.to_radians();
    let (s, c) = r.sin_cos();
    Matrix3::new(c, 0.0, s, 0.0, 1.0, 0.0, -s, 0.0, c)
}

/// `R_i = R_z(yaw_i) * R_y(45°)`, the anchor's body-to-global rotation.
pub fn anchor_rotation(anchor_id: u8) -> Result<Matrix3<f64>, CoreError> {
    let yaw = anchor_yaw_deg(anchor_id).ok_or(CoreError::UnknownAnchor(anchor_id))?;
    Ok(rotation_z(yaw) * rotation_y(45.0))
}

fn to_vector3(v: Vec3) -> Vector3<f64> {
    Vector3::new(v.x, v.y, v.z)
}

fn to_vec3(v: Vector3<f64>) -> Vec3 {
    Vec3::new(v.x, v.y, v.z)
}

/// Anchor-anchor edges precomputed from surveyed ground truth: exact,
/// bidirectional, zero measurement noise. These rigidify the graph so
/// scale/rotation/translation are determined even with a single anchor
/// seeing the phone.
pub fn anchor_anchor_edges(anchor_config: &AnchorConfig) -> Vec<Edge> {
    let mut ids: Vec<u8> = anchor_config.anchor_ids().collect();
    ids.sort_unstable();

    let mut edges = Vec::new();
    for (idx, &i) in ids.iter().enumerate() {
        for &j in &ids[idx + 1..] {
            let pos_i = anchor_config.position(i).expect("id came from this config");
            let pos_j = anchor_config.position(j).expect("id came from this config");
            let displacement = pos_j - pos_i;
            edges.push(Edge::new(NodeId::Anchor(i), NodeId::Anchor(j), displacement));
            edges.push(Edge::new(
                NodeId::Anchor(j),
                NodeId::Anchor(i),
                Vec3::new(-displacement.x, -displacement.y, -displacement.z),
            ));
        }
    }
    edges
}

/// Builds one phone edge per anchor that saw the phone in this bin: the
/// component-wise mean of its vectors, rotated from body frame into the
/// global frame. An anchor with no vectors in the bin simply contributes no
/// edge. An anchor ID that isn't in the yaw table is a hard configuration
/// error, not a data-quality issue.
pub fn phone_edges(binned: &BinnedData) -> Result<Vec<Edge>, CoreError> {
    let mut edges = Vec::new();
    for (&anchor_id, vectors) in binned.measurements.iter() {
        if vectors.is_empty() {
            continue;
        }
        let sum = vectors
            .iter()
            .fold(Vec3::default(), |acc, v| acc + *v);
        let mean = sum / vectors.len() as f64;

        let rotation = anchor_rotation(anchor_id)?;
        let rotated = to_vec3(rotation * to_vector3(mean));

        edges.push(Edge::new(
            NodeId::Anchor(anchor_id),
            NodeId::Phone(binned.phone_node_id),
            rotated,
        ));
    }
    Ok(edges)
}

/// All edges for a solve: precomputed anchor-anchor edges plus this bin's
/// phone edges.
pub fn build_edges(binned: &BinnedData, anchor_config: &AnchorConfig) -> Result<Vec<Edge>, CoreError> {
    let mut edges = anchor_anchor_edges(anchor_config);
    edges.extend(phone_edges(binned)?);
    Ok(edges)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_is_orthonormal() {
        for id in 0u8..4 {
            let r = anchor_rotation(id).unwrap();
            let should_be_identity = r * r.transpose();
            for i in 0..3 {
                for j in 0..3 {
                    let expected = if i == j { 1.0 } else { 0.0 };
                    assert!((should_be_identity[(i, j)] - expected).abs() < 1e-9);
                }
            }
        }
    }

    #[test]
    fn unknown_anchor_id_is_hard_error() {
        assert!(anchor_rotation(9).is_err());
    }

    #[test]
    fn anchor_anchor_edges_are_bidirectional_and_exact() {
        let cfg = AnchorConfig::canonical();
        let edges = anchor_anchor_edges(&cfg);
        // 4 anchors -> C(4,2) = 6 unordered pairs -> 12 directed edges
        assert_eq!(edges.len(), 12);
        let forward = edges
            .iter()
            .find(|e| matches!((e.from, e.to), (NodeId::Anchor(3), NodeId::Anchor(0))))
            .unwrap();
        let reverse = edges
            .iter()
            .find(|e| matches!((e.from, e.to), (NodeId::Anchor(0), NodeId::Anchor(3))))
            .unwrap();
        assert!((forward.displacement.x + reverse.displacement.x).abs() < 1e-9);
    }

    #[test]
    fn phone_edge_omitted_when_anchor_has_no_vectors() {
        let binned = BinnedData {
            bin_start_time: 0.0,
            bin_end_time: 1.0,
            phone_node_id: 0,
            measurements: HashMap::new(),
        };
        let edges = phone_edges(&binned).unwrap();
        assert!(edges.is_empty());
    }
}
