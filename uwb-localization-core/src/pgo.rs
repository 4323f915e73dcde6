use std::collections::HashMap;

use localization_types::{AnchorConfig, BinnedData, NodeId, PGOResult};

use crate::config::SolverConfig;
use crate::error::CoreError;
use crate::{anchoring, edges, solver};

/// Runs edge construction, the free solve, and anchoring in sequence for one
/// bin. This is the public entry point the processor thread calls each
/// pass; `solver::solve` and `anchoring::align` remain independently usable
/// (and independently testable) for the two halves of the contract.
pub fn solve_bin(
    binned: &BinnedData,
    anchor_config: &AnchorConfig,
    config: SolverConfig,
) -> Result<PGOResult, CoreError> {
    let edge_list = edges::build_edges(binned, anchor_config)?;

    let mut nodes: HashMap<NodeId, Option<localization_types::Vec3>> = HashMap::new();
    for anchor_id in anchor_config.anchor_ids() {
        nodes.insert(NodeId::Anchor(anchor_id), anchor_config.position(anchor_id));
    }
    nodes.insert(NodeId::Phone(binned.phone_node_id), None);

    let mut result = solver::solve(&nodes, &edge_list, config)?;
    anchoring::align(&mut result.positions, anchor_config, config.anchoring_mode)?;

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use localization_types::Vec3;

    fn inverse_rotated_local_vector(anchor_id: u8, anchor_pos: Vec3, phone_pos: Vec3) -> Vec3 {
        let rotation = crate::edges::anchor_rotation(anchor_id).unwrap();
        let global = phone_pos - anchor_pos;
        let local = rotation.transpose()
            * nalgebra::Vector3::new(global.x, global.y, global.z);
        Vec3::new(local.x, local.y, local.z)
    }

    #[test]
    fn four_noiseless_anchors_solve_within_one_cm() {
        let cfg = AnchorConfig::canonical();
        let phone_truth = Vec3::new(240.0, 300.0, 0.0);

        let mut measurements = std::collections::HashMap::new();
        for anchor_id in 0u8..4 {
            let anchor_pos = cfg.position(anchor_id).unwrap();
            let local = inverse_rotated_local_vector(anchor_id, anchor_pos, phone_truth);
            measurements.insert(anchor_id, vec![local]);
        }

        let binned = BinnedData {
            bin_start_time: 0.0,
            bin_end_time: 0.1,
            phone_node_id: 0,
            measurements,
        };

        let result = solve_bin(&binned, &cfg, SolverConfig::default()).unwrap();
        let phone = result.position_of(NodeId::Phone(0)).unwrap();
        assert!((phone.x - 240.0).abs() < 1.0, "x = {}", phone.x);
        assert!((phone.y - 300.0).abs() < 1.0, "y = {}", phone.y);
        assert!((phone.z - 0.0).abs() < 1.0, "z = {}", phone.z);
        assert!(result.cost < 1e-3);
    }

    #[test]
    fn single_anchor_visible_still_determines_phone_uniquely() {
        let cfg = AnchorConfig::canonical();
        let phone_truth = Vec3::new(240.0, 300.0, 0.0);
        let anchor_pos = cfg.position(0).unwrap();
        let local = inverse_rotated_local_vector(0, anchor_pos, phone_truth);

        let mut measurements = std::collections::HashMap::new();
        measurements.insert(0u8, vec![local; 5]);

        let binned = BinnedData {
            bin_start_time: 0.0,
            bin_end_time: 0.1,
            phone_node_id: 0,
            measurements,
        };

        let result = solve_bin(&binned, &cfg, SolverConfig::default()).unwrap();
        let phone = result.position_of(NodeId::Phone(0)).unwrap();
        assert!((phone.x - 240.0).abs() < 1.0, "x = {}", phone.x);
        assert!((phone.y - 300.0).abs() < 1.0, "y = {}", phone.y);
    }

    #[test]
    fn unknown_anchor_id_in_binned_data_is_hard_error() {
        let cfg = AnchorConfig::canonical();
        let mut measurements = std::collections::HashMap::new();
        measurements.insert(9u8, vec![Vec3::new(1.0, 1.0, 1.0)]);
        let binned = BinnedData {
            bin_start_time: 0.0,
            bin_end_time: 0.1,
            phone_node_id: 0,
            measurements,
        };
        let result = solve_bin(&binned, &cfg, SolverConfig::default());
        assert!(result.is_err());
    }
}
