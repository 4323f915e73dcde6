use std::collections::VecDeque;

use localization_types::{BinnedData, BinningMetrics, Measurement, RejectionReason};

use crate::config::BinnerConfig;

/// Sliding-window binner for one phone. Owns the accepted-measurement
/// buffer and the running metrics exclusively; nothing else writes to
/// either. One instance exists per `phone_node_id`.
pub struct Binner {
    phone_node_id: u8,
    config: BinnerConfig,
    buffer: VecDeque<Measurement>,
    metrics: BinningMetrics,
}

impl Binner {
    pub fn new(phone_node_id: u8, config: BinnerConfig) -> Self {
        Self {
            phone_node_id,
            metrics: BinningMetrics::new(config.window_size_seconds),
            config,
            buffer: VecDeque::new(),
        }
    }

    pub fn metrics(&self) -> &BinningMetrics {
        &self.metrics
    }

    pub fn phone_node_id(&self) -> u8 {
        self.phone_node_id
    }

    /// Runs the four-step admission protocol (recency, statistical outlier,
    /// variance, append+evict) against the current window. Returns `Ok(())`
    /// on admission, `Err(reason)` on rejection — rejections are return
    /// values, never errors (see `error::CoreError` docs).
    pub fn add_measurement(&mut self, m: Measurement, now: f64) -> Result<(), RejectionReason> {
        // 1. Recency gate. Half-open on the past: exactly `now - window` is admitted.
        if m.timestamp < now - self.config.window_size_seconds {
            let reason = RejectionReason::LateDrop;
            self.metrics.record_reject(reason);
            return Err(reason);
        }

        let new_distance = m.local_vector.norm();
        let same_anchor_distances: Vec<f64> = self
            .buffer
            .iter()
            .filter(|x| x.anchor_id == m.anchor_id && x.phone_node_id == m.phone_node_id)
            .map(|x| x.local_vector.norm())
            .collect();

        // 2. Statistical outlier gate — only once enough history exists.
        if same_anchor_distances.len() >= self.config.min_samples_for_outlier_detection {
            let n = same_anchor_distances.len() as f64;
            let mean = same_anchor_distances.iter().sum::<f64>() / n;
            let variance = same_anchor_distances
                .iter()
                .map(|d| (d - mean).powi(2))
                .sum::<f64>()
                / n;
            let std = variance.sqrt();
            let deviation = (new_distance - mean).abs();

            let is_outlier = if std < 1e-6 {
                // Tight cluster: fall back to an absolute 50 cm threshold
                // since a z-score is meaningless against ~zero spread.
                deviation > 50.0
            } else {
                deviation / std > self.config.outlier_threshold_sigma
            };

            if is_outlier {
                let reason = RejectionReason::StatisticalOutlier {
                    anchor_id: m.anchor_id,
                    deviation_cm: deviation,
                };
                self.metrics.record_reject(reason);
                return Err(reason);
            }
        }

        // 3. Variance gate — would admitting `m` push the anchor's variance
        // over the cap? Only meaningful with at least 2 samples total.
        if !same_anchor_distances.is_empty() {
            let mut with_new = same_anchor_distances.clone();
            with_new.push(new_distance);
            let n = with_new.len() as f64;
            let mean = with_new.iter().sum::<f64>() / n;
            let variance = with_new.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n;
            if variance > self.config.max_anchor_variance {
                let reason = RejectionReason::AnchorVarianceTooHigh {
                    anchor_id: m.anchor_id,
                };
                self.metrics.record_reject(reason);
                return Err(reason);
            }
        }

        // 4. Admit, then evict anything that fell out of the window.
        self.metrics.record_accept(m.anchor_id);
        self.buffer.push_back(m);
        let cutoff = now - self.config.window_size_seconds;
        while let Some(front) = self.buffer.front() {
            if front.timestamp < cutoff {
                self.buffer.pop_front();
            } else {
                break;
            }
        }

        Ok(())
    }

    /// Groups surviving measurements for `phone_node_id` by anchor. Returns
    /// `None` if the buffer holds nothing for that phone. The returned bin
    /// is a snapshot, independent of later mutation of this binner.
    pub fn create_binned_data(&self, phone_node_id: u8) -> Option<BinnedData> {
        let relevant: Vec<&Measurement> = self
            .buffer
            .iter()
            .filter(|m| m.phone_node_id == phone_node_id)
            .collect();

        if relevant.is_empty() {
            return None;
        }

        let bin_start_time = relevant
            .iter()
            .map(|m| m.timestamp)
            .fold(f64::INFINITY, f64::min);
        let bin_end_time = relevant
            .iter()
            .map(|m| m.timestamp)
            .fold(f64::NEG_INFINITY, f64::max);

        let mut measurements = std::collections::HashMap::new();
        for m in relevant {
            measurements
                .entry(m.anchor_id)
                .or_insert_with(Vec::new)
                .push(m.local_vector);
        }

        Some(BinnedData {
            bin_start_time,
            bin_end_time,
            phone_node_id,
            measurements,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localization_types::Vec3;

    fn meas(ts: f64, anchor_id: u8, distance: f64) -> Measurement {
        Measurement::new(ts, anchor_id, 0, Vec3::new(distance, 0.0, 0.0))
    }

    #[test]
    fn late_measurement_is_dropped_not_rejected_as_outlier() {
        let mut binner = Binner::new(0, BinnerConfig::default());
        let now = 100.0;
        let result = binner.add_measurement(meas(now - 5.0, 0, 400.0), now);
        assert_eq!(result, Err(RejectionReason::LateDrop));
        assert_eq!(binner.metrics().late_drops, 1);
        assert_eq!(binner.buffer.len(), 0);
    }

    #[test]
    fn measurement_exactly_at_window_edge_is_admitted() {
        let mut binner = Binner::new(0, BinnerConfig::default());
        let now = 100.0;
        let result = binner.add_measurement(meas(now - 1.0, 0, 400.0), now);
        assert!(result.is_ok());
    }

    #[test]
    fn outlier_rejected_after_consistent_history() {
        let mut binner = Binner::new(0, BinnerConfig::default());
        let now = 10.0;
        for i in 0..10 {
            let ts = now - 0.05 * i as f64;
            let result = binner.add_measurement(meas(ts, 1, 400.0), now);
            assert!(result.is_ok(), "expected sample {i} to be admitted");
        }
        let result = binner.add_measurement(meas(now, 1, 4000.0), now);
        match result {
            Err(reason) => assert!(reason.to_string().contains("outlier")),
            Ok(()) => panic!("expected outlier rejection"),
        }
        assert_eq!(binner.metrics().rejected_measurements, 1);
    }

    #[test]
    fn variance_gate_rejects_destabilizing_measurement() {
        let mut binner = Binner::new(2, BinnerConfig::default());
        let now = 10.0;
        for (i, d) in [100.0, 110.0, 90.0, 105.0, 95.0].into_iter().enumerate() {
            let ts = now - 0.01 * i as f64;
            let result = binner.add_measurement(meas(ts, 2, d), now);
            assert!(result.is_ok());
        }
        let result = binner.add_measurement(meas(now, 2, 700.0), now);
        match result {
            Err(reason) => assert!(reason.to_string().contains("anchor_variance_too_high")),
            Ok(()) => panic!("expected variance rejection"),
        }
    }

    #[test]
    fn fewer_than_min_samples_skips_outlier_gate() {
        let mut binner = Binner::new(0, BinnerConfig::default());
        let now = 10.0;
        for i in 0..4 {
            let ts = now - 0.01 * i as f64;
            assert!(binner.add_measurement(meas(ts, 0, 400.0), now).is_ok());
        }
        // Fifth sample pushes the count to the threshold; gate has not yet
        // activated against it, so a wild value is still admitted.
        let result = binner.add_measurement(meas(now, 0, 5000.0), now);
        assert!(result.is_ok());
    }

    #[test]
    fn create_binned_data_groups_by_anchor_and_respects_window_bound() {
        let mut binner = Binner::new(0, BinnerConfig::default());
        let now = 10.0;
        binner.add_measurement(meas(now - 0.5, 0, 400.0), now).unwrap();
        binner.add_measurement(meas(now - 0.2, 1, 300.0), now).unwrap();
        let bin = binner.create_binned_data(0).unwrap();
        assert!(bin.bin_end_time - bin.bin_start_time <= 1.0);
        assert_eq!(bin.measurements.len(), 2);
    }

    #[test]
    fn create_binned_data_returns_none_for_empty_buffer() {
        let binner = Binner::new(0, BinnerConfig::default());
        assert!(binner.create_binned_data(0).is_none());
    }
}
