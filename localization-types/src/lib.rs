//! # localization-types
//!
//! Shared data model for the UWB indoor localization pipeline.
//!
//! These types cross the boundaries between the ingress adapter, the
//! sliding-window binner, the edge builder, and the pose-graph solver. None
//! of them depend on the transport (MQTT) or the solver's numerics crate —
//! keeping this crate free of those dependencies is what lets it sit at the
//! bottom of the dependency graph.
//!
//! ## Coordinate conventions
//!
//! - **Anchor body frame**: +x forward out of the board face, +y left, +z up.
//! - **Global (room) frame**: shared Cartesian frame anchors are surveyed in.
//! - Units are centimeters throughout, matching the wire format and the
//!   canonical anchor layout.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ── Node identity ─────────────────────────────────────────────────────────

/// Identifies a node in the pose graph: either a fixed anchor or the mobile
/// phone being localized. Kept as a small closed enum rather than a string so
/// the solver and edge builder can't typo a node name; `Display` reproduces
/// the `anchor_i` / `phone_j` naming used on the wire and in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeId {
    Anchor(u8),
    Phone(u8),
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Anchor(id) => write!(f, "anchor_{id}"),
            NodeId::Phone(id) => write!(f, "phone_{id}"),
        }
    }
}

// ── Vectors ───────────────────────────────────────────────────────────────

/// 3D vector, centimeters. This is the wire/storage representation; the
/// solver converts to `nalgebra::Vector3<f64>` internally.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl std::ops::Add for Vec3 {
    type Output = Vec3;
    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl std::ops::Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl std::ops::Div<f64> for Vec3 {
    type Output = Vec3;
    fn div(self, rhs: f64) -> Vec3 {
        Vec3::new(self.x / rhs, self.y / rhs, self.z / rhs)
    }
}

// ── Measurement ───────────────────────────────────────────────────────────

/// A single anchor-to-phone reading, produced by the ingress adapter and
/// consumed by the binner. Immutable once constructed.
///
/// Invariant: `local_vector` is finite; `anchor_id` corresponds to a
/// configured anchor (checked by the binner against `AnchorConfig`, not by
/// this type — `Measurement` itself carries no reference to the config).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Seconds since epoch, monotonic per anchor.
    pub timestamp: f64,
    pub anchor_id: u8,
    /// Always `0` in the single-phone deployment.
    pub phone_node_id: u8,
    pub local_vector: Vec3,
}

impl Measurement {
    pub fn new(timestamp: f64, anchor_id: u8, phone_node_id: u8, local_vector: Vec3) -> Self {
        Self {
            timestamp,
            anchor_id,
            phone_node_id,
            local_vector,
        }
    }
}

// ── AnchorConfig ──────────────────────────────────────────────────────────

/// Process-wide, read-only-after-init mapping of anchor IDs to surveyed
/// global positions. Constructed once at startup; never mutated at runtime,
/// so it needs no lock once shared (typically behind an `Arc`).
#[derive(Debug, Clone)]
pub struct AnchorConfig {
    positions: HashMap<u8, Vec3>,
}

impl AnchorConfig {
    pub fn new(positions: HashMap<u8, Vec3>) -> Self {
        Self { positions }
    }

    /// The canonical four-corner layout from the external-interface spec:
    /// anchors at (480,600,0), (0,600,0), (480,0,0), (0,0,0) cm.
    pub fn canonical() -> Self {
        let mut positions = HashMap::new();
        positions.insert(0, Vec3::new(480.0, 600.0, 0.0));
        positions.insert(1, Vec3::new(0.0, 600.0, 0.0));
        positions.insert(2, Vec3::new(480.0, 0.0, 0.0));
        positions.insert(3, Vec3::new(0.0, 0.0, 0.0));
        Self::new(positions)
    }

    pub fn position(&self, anchor_id: u8) -> Option<Vec3> {
        self.positions.get(&anchor_id).copied()
    }

    pub fn contains(&self, anchor_id: u8) -> bool {
        self.positions.contains_key(&anchor_id)
    }

    pub fn anchor_ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.positions.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

// ── BinnedData ────────────────────────────────────────────────────────────

/// Immutable snapshot emitted by the binner: all surviving measurements for
/// one phone over one window, grouped by anchor. Shared read-only between
/// the edge builder and diagnostic sinks.
#[derive(Debug, Clone)]
pub struct BinnedData {
    pub bin_start_time: f64,
    pub bin_end_time: f64,
    pub phone_node_id: u8,
    pub measurements: HashMap<u8, Vec<Vec3>>,
}

// ── Edge ──────────────────────────────────────────────────────────────────

/// A measured or known relative displacement between two nodes: the vector
/// from `from` to `to`, in the global frame, centimeters.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub displacement: Vec3,
}

impl Edge {
    pub fn new(from: NodeId, to: NodeId, displacement: Vec3) -> Self {
        Self {
            from,
            to,
            displacement,
        }
    }
}

// ── PGOResult ─────────────────────────────────────────────────────────────

/// Output of a pose-graph solve: a position per node, plus solver
/// diagnostics.
#[derive(Debug, Clone)]
pub struct PGOResult {
    pub positions: HashMap<NodeId, Vec3>,
    pub success: bool,
    pub iterations: u32,
    pub cost: f64,
}

impl PGOResult {
    pub fn position_of(&self, node: NodeId) -> Option<Vec3> {
        self.positions.get(&node).copied()
    }
}

// ── RejectionReason ───────────────────────────────────────────────────────

/// Machine-readable tag attached to every data-quality rejection, used for
/// metric aggregation. `Display` mirrors the short tag shape the reference
/// implementation produces (e.g. `anchor_variance_too_high`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RejectionReason {
    LateDrop,
    StatisticalOutlier { anchor_id: u8, deviation_cm: f64 },
    AnchorVarianceTooHigh { anchor_id: u8 },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::LateDrop => write!(f, "late_drop"),
            RejectionReason::StatisticalOutlier {
                anchor_id,
                deviation_cm,
            } => write!(
                f,
                "outlier_anchor_{anchor_id}_dev_{deviation_cm:.2}cm"
            ),
            RejectionReason::AnchorVarianceTooHigh { anchor_id } => {
                write!(f, "anchor_variance_too_high_anchor_{anchor_id}")
            }
        }
    }
}

// ── BinningMetrics ────────────────────────────────────────────────────────

/// Running counters for one binner. Mutable, updated in place on every
/// admission decision.
#[derive(Debug, Clone, Default)]
pub struct BinningMetrics {
    pub late_drops: u64,
    pub rejected_measurements: u64,
    pub total_measurements: u64,
    pub measurements_per_anchor: HashMap<u8, u64>,
    pub rejection_reasons: HashMap<String, u64>,
    pub window_span_sec: f64,
}

impl BinningMetrics {
    pub fn new(window_span_sec: f64) -> Self {
        Self {
            window_span_sec,
            ..Default::default()
        }
    }

    pub fn record_accept(&mut self, anchor_id: u8) {
        self.total_measurements += 1;
        *self.measurements_per_anchor.entry(anchor_id).or_insert(0) += 1;
    }

    pub fn record_reject(&mut self, reason: RejectionReason) {
        if matches!(reason, RejectionReason::LateDrop) {
            self.late_drops += 1;
        } else {
            self.rejected_measurements += 1;
        }
        *self
            .rejection_reasons
            .entry(reason.to_string())
            .or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_display_matches_wire_naming() {
        assert_eq!(NodeId::Anchor(3).to_string(), "anchor_3");
        assert_eq!(NodeId::Phone(0).to_string(), "phone_0");
    }

    #[test]
    fn rejection_reason_tags_contain_expected_substrings() {
        let outlier = RejectionReason::StatisticalOutlier {
            anchor_id: 1,
            deviation_cm: 3600.0,
        };
        assert!(outlier.to_string().contains("outlier"));

        let variance = RejectionReason::AnchorVarianceTooHigh { anchor_id: 2 };
        assert!(variance.to_string().contains("anchor_variance_too_high"));
    }

    #[test]
    fn canonical_anchor_config_matches_spec_layout() {
        let cfg = AnchorConfig::canonical();
        assert_eq!(cfg.position(0), Some(Vec3::new(480.0, 600.0, 0.0)));
        assert_eq!(cfg.position(3), Some(Vec3::new(0.0, 0.0, 0.0)));
        assert_eq!(cfg.len(), 4);
    }

    #[test]
    fn metrics_split_late_drops_from_other_rejections() {
        let mut m = BinningMetrics::new(1.0);
        m.record_reject(RejectionReason::LateDrop);
        m.record_reject(RejectionReason::AnchorVarianceTooHigh { anchor_id: 2 });
        assert_eq!(m.late_drops, 1);
        assert_eq!(m.rejected_measurements, 1);
    }
}
