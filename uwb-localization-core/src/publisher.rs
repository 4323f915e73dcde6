use std::sync::Mutex;

use localization_types::{BinningMetrics, NodeId, PGOResult, Vec3};
use tracing::info;

/// One published estimate: the latest solved phone position plus the
/// diagnostics a consumer needs to judge its quality.
#[derive(Debug, Clone, Copy)]
pub struct PublishedPosition {
    pub phone_id: u8,
    pub position: Vec3,
    pub residual_cost: f64,
    pub n_edges: usize,
    pub n_phone_edges: usize,
    pub n_anchor_edges: usize,
}

/// Thread-safe single-writer store for the latest phone position. Readers
/// copy out under the lock; there is no queue or history here, matching the
/// "no persisted state" external-interface contract.
#[derive(Default)]
pub struct PositionPublisher {
    latest: Mutex<Option<PublishedPosition>>,
}

impl PositionPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful solve and emits the `position_updated`
    /// structured log line.
    pub fn publish(
        &self,
        phone_id: u8,
        result: &PGOResult,
        n_phone_edges: usize,
        n_anchor_edges: usize,
    ) -> Option<PublishedPosition> {
        let position = result.position_of(NodeId::Phone(phone_id))?;
        let published = PublishedPosition {
            phone_id,
            position,
            residual_cost: result.cost,
            n_edges: n_phone_edges + n_anchor_edges,
            n_phone_edges,
            n_anchor_edges,
        };

        info!(
            event = "position_updated",
            phone_id = phone_id,
            x_cm = position.x,
            y_cm = position.y,
            z_cm = position.z,
            error = result.cost,
            n_edges = published.n_edges,
            n_phone_edges = published.n_phone_edges,
            n_anchor_edges = published.n_anchor_edges,
        );

        *self.latest.lock().expect("publisher mutex poisoned") = Some(published);
        Some(published)
    }

    pub fn current(&self) -> Option<PublishedPosition> {
        *self.latest.lock().expect("publisher mutex poisoned")
    }
}

/// Emits the full `BinningMetrics` snapshot as a structured diagnostics log
/// line. Called by the processor every 100 processed measurements per phone.
pub fn log_diagnostics(phone_id: u8, metrics: &BinningMetrics) {
    info!(
        event = "binning_diagnostics",
        phone_id = phone_id,
        late_drops = metrics.late_drops,
        rejected_measurements = metrics.rejected_measurements,
        total_measurements = metrics.total_measurements,
        window_span_sec = metrics.window_span_sec,
        rejection_reasons = ?metrics.rejection_reasons,
        measurements_per_anchor = ?metrics.measurements_per_anchor,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn publish_then_read_round_trips_position() {
        let publisher = PositionPublisher::new();
        assert!(publisher.current().is_none());

        let mut positions = HashMap::new();
        positions.insert(NodeId::Phone(0), Vec3::new(1.0, 2.0, 3.0));
        let result = PGOResult {
            positions,
            success: true,
            iterations: 4,
            cost: 0.01,
        };

        publisher.publish(0, &result, 3, 12);
        let current = publisher.current().unwrap();
        assert_eq!(current.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(current.n_edges, 15);
    }

    #[test]
    fn publish_without_phone_in_result_leaves_store_unchanged() {
        let publisher = PositionPublisher::new();
        let result = PGOResult {
            positions: HashMap::new(),
            success: true,
            iterations: 0,
            cost: 0.0,
        };
        assert!(publisher.publish(0, &result, 0, 0).is_none());
        assert!(publisher.current().is_none());
    }
}
