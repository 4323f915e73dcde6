//! Core localization pipeline: MQTT ingress, sliding-window binning, edge
//! construction, pose-graph solving, gauge-fixing anchoring, and the
//! position publisher. The binary crate wires these together on two
//! worker threads; everything here is usable and independently testable
//! without either thread running.

pub mod anchoring;
pub mod binner;
pub mod config;
pub mod edges;
pub mod error;
pub mod ingress;
pub mod pgo;
pub mod publisher;
pub mod solver;

pub use binner::Binner;
pub use error::CoreError;
pub use publisher::{PositionPublisher, PublishedPosition};
