use nalgebra::{DMatrix, DVector};
use std::collections::HashMap;

use localization_types::{Edge, NodeId, PGOResult, Vec3};

use crate::config::SolverConfig;
use crate::error::SolverError;

/// Free (gauge-unfixed) nonlinear least-squares solve: minimizes
/// `Σ ‖(X_b - X_a) - d‖²` over every node touched by `edges`, jointly. The
/// residual is affine in the unknowns (each edge's Jacobian block is a
/// constant ±I₃), so the Gauss-Newton normal equations are assembled
/// directly per edge rather than through a general sparse Jacobian —
/// cheap at the node counts this pipeline ever sees.
///
/// `nodes` gives an optional initial position per node name; `None` means
/// unknown, resolved here via neighbor-averaging before iterating.
pub fn solve(
    nodes: &HashMap<NodeId, Option<Vec3>>,
    edges: &[Edge],
    config: SolverConfig,
) -> Result<PGOResult, SolverError> {
    let mut node_order: Vec<NodeId> = nodes.keys().copied().collect();
    for edge in edges {
        if !node_order.contains(&edge.from) {
            node_order.push(edge.from);
        }
        if !node_order.contains(&edge.to) {
            node_order.push(edge.to);
        }
    }
    node_order.sort_unstable();
    let index: HashMap<NodeId, usize> = node_order
        .iter()
        .enumerate()
        .map(|(i, n)| (*n, i))
        .collect();
    let n = node_order.len();

    let x0 = initialize(&node_order, nodes, edges);
    let mut x = DVector::from_fn(3 * n, |i, _| {
        let node_idx = i / 3;
        match i % 3 {
            0 => x0[node_idx].x,
            1 => x0[node_idx].y,
            _ => x0[node_idx].z,
        }
    });

    let mut lambda = 1e-3;
    let mut cost = compute_cost(&x, edges, &index);
    if !cost.is_finite() {
        return Err(SolverError::NonFinite);
    }

    let mut iterations = 0u32;
    loop {
        if iterations >= config.max_iterations {
            return Err(SolverError::NotConverged {
                max_iterations: config.max_iterations,
                final_cost: cost,
            });
        }
        iterations += 1;

        let (h, g) = normal_equations(&x, edges, &index, n);

        let mut accepted = false;
        for _ in 0..16 {
            let mut damped = h.clone();
            for i in 0..3 * n {
                damped[(i, i)] += lambda * h[(i, i)].max(1e-9);
            }
            let rhs = -&g;
            let delta = match damped.clone().lu().solve(&rhs) {
                Some(d) => d,
                None => {
                    lambda *= 10.0;
                    continue;
                }
            };
            if !delta.iter().all(|v| v.is_finite()) {
                return Err(SolverError::NonFinite);
            }

            let candidate = &x + &delta;
            let candidate_cost = compute_cost(&candidate, edges, &index);
            if !candidate_cost.is_finite() {
                return Err(SolverError::NonFinite);
            }

            if candidate_cost < cost {
                let improvement = cost - candidate_cost;
                x = candidate;
                cost = candidate_cost;
                lambda = (lambda / 10.0).max(1e-12);
                accepted = true;
                if improvement < config.ftol {
                    return Ok(build_result(&node_order, &x, true, iterations, cost));
                }
                break;
            } else {
                lambda *= 10.0;
            }
        }

        if !accepted && lambda > 1e12 {
            return Err(SolverError::NotConverged {
                max_iterations: config.max_iterations,
                final_cost: cost,
            });
        }
    }
}

fn initialize(
    node_order: &[NodeId],
    nodes: &HashMap<NodeId, Option<Vec3>>,
    edges: &[Edge],
) -> HashMap<NodeId, Vec3> {
    let mut known: HashMap<NodeId, Vec3> = HashMap::new();
    for node in node_order {
        if let Some(Some(pos)) = nodes.get(node) {
            known.insert(*node, *pos);
        }
    }

    // Walk edges repeatedly (the graphs here are small) until no unknown
    // node gains a neighbor-averaged estimate, then default the rest to
    // the origin.
    loop {
        let mut accum: HashMap<NodeId, Vec<Vec3>> = HashMap::new();
        for edge in edges {
            if !known.contains_key(&edge.to) {
                if let Some(pos_a) = known.get(&edge.from) {
                    accum.entry(edge.to).or_default().push(*pos_a + edge.displacement);
                }
            }
            if !known.contains_key(&edge.from) {
                if let Some(pos_b) = known.get(&edge.to) {
                    accum.entry(edge.from).or_default().push(*pos_b - edge.displacement);
                }
            }
        }
        if accum.is_empty() {
            break;
        }
        let mut progressed = false;
        for (node, candidates) in accum {
            if !known.contains_key(&node) {
                let count = candidates.len() as f64;
                let sum = candidates
                    .into_iter()
                    .fold(Vec3::default(), |acc, v| acc + v);
                known.insert(node, sum / count);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    for node in node_order {
        known.entry(*node).or_insert(Vec3::new(0.0, 0.0, 0.0));
    }
    known
}

fn position_of(x: &DVector<f64>, idx: usize) -> nalgebra::Vector3<f64> {
    nalgebra::Vector3::new(x[3 * idx], x[3 * idx + 1], x[3 * idx + 2])
}

fn compute_cost(x: &DVector<f64>, edges: &[Edge], index: &HashMap<NodeId, usize>) -> f64 {
    let mut cost = 0.0;
    for edge in edges {
        let a = position_of(x, index[&edge.from]);
        let b = position_of(x, index[&edge.to]);
        let d = nalgebra::Vector3::new(
            edge.displacement.x,
            edge.displacement.y,
            edge.displacement.z,
        );
        let r = (b - a) - d;
        cost += r.norm_squared();
    }
    cost
}

/// Builds `J^T J` and `J^T r` directly: each edge's Jacobian block is a
/// constant ±I₃, so its contribution to the normal equations is closed-form.
fn normal_equations(
    x: &DVector<f64>,
    edges: &[Edge],
    index: &HashMap<NodeId, usize>,
    n: usize,
) -> (DMatrix<f64>, DVector<f64>) {
    let mut h = DMatrix::zeros(3 * n, 3 * n);
    let mut g = DVector::zeros(3 * n);

    for edge in edges {
        let ia = index[&edge.from];
        let ib = index[&edge.to];
        let a = position_of(x, ia);
        let b = position_of(x, ib);
        let d = nalgebra::Vector3::new(
            edge.displacement.x,
            edge.displacement.y,
            edge.displacement.z,
        );
        let r = (b - a) - d;

        for k in 0..3 {
            g[3 * ia + k] += -r[k];
            g[3 * ib + k] += r[k];
            h[(3 * ia + k, 3 * ia + k)] += 1.0;
            h[(3 * ib + k, 3 * ib + k)] += 1.0;
            h[(3 * ia + k, 3 * ib + k)] += -1.0;
            h[(3 * ib + k, 3 * ia + k)] += -1.0;
        }
    }

    (h, g)
}

fn build_result(
    node_order: &[NodeId],
    x: &DVector<f64>,
    success: bool,
    iterations: u32,
    cost: f64,
) -> PGOResult {
    let mut positions = HashMap::new();
    for (idx, node) in node_order.iter().enumerate() {
        let p = position_of(x, idx);
        positions.insert(*node, Vec3::new(p.x, p.y, p.z));
    }
    PGOResult {
        positions,
        success,
        iterations,
        cost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_node_single_edge_solves_exactly() {
        let mut nodes = HashMap::new();
        nodes.insert(NodeId::Anchor(0), Some(Vec3::new(0.0, 0.0, 0.0)));
        nodes.insert(NodeId::Phone(0), None);
        let edges = vec![Edge::new(
            NodeId::Anchor(0),
            NodeId::Phone(0),
            Vec3::new(10.0, 5.0, 0.0),
        )];

        let result = solve(&nodes, &edges, SolverConfig::default()).unwrap();
        let phone = result.position_of(NodeId::Phone(0)).unwrap();
        assert!((phone.x - 10.0).abs() < 1e-4);
        assert!((phone.y - 5.0).abs() < 1e-4);
        assert!(result.cost < 1e-6);
    }

    #[test]
    fn redundant_consistent_edges_converge_to_same_point() {
        let mut nodes = HashMap::new();
        nodes.insert(NodeId::Anchor(0), Some(Vec3::new(0.0, 0.0, 0.0)));
        nodes.insert(NodeId::Anchor(1), Some(Vec3::new(100.0, 0.0, 0.0)));
        nodes.insert(NodeId::Phone(0), None);
        let edges = vec![
            Edge::new(NodeId::Anchor(0), NodeId::Phone(0), Vec3::new(50.0, 50.0, 0.0)),
            Edge::new(NodeId::Anchor(1), NodeId::Phone(0), Vec3::new(-50.0, 50.0, 0.0)),
        ];

        let result = solve(&nodes, &edges, SolverConfig::default()).unwrap();
        let phone = result.position_of(NodeId::Phone(0)).unwrap();
        assert!((phone.x - 50.0).abs() < 1e-3);
        assert!((phone.y - 50.0).abs() < 1e-3);
    }
}
