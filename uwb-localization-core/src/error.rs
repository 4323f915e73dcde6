use localization_types::NodeId;
use thiserror::Error;

/// Logic errors: surfaced as typed values, not exceptions. Data-quality
/// rejections never become one of these — they are `RejectionReason`
/// return values from the binner instead.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to parse measurement payload: {0}")]
    Parse(#[from] ParseError),

    #[error("unexpected topic shape: {0}")]
    Topic(#[from] TopicError),

    #[error("unknown anchor id {0} (configuration bug)")]
    UnknownAnchor(u8),

    #[error(transparent)]
    Solver(#[from] SolverError),

    #[error(transparent)]
    Anchoring(#[from] AnchoringError),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broker connection lost: {0}")]
    Disconnected(String),
    #[error("failed to subscribe to {topic}: {source}")]
    Subscribe {
        topic: String,
        source: rumqttc::ClientError,
    },
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("vector component is not finite")]
    NonFinite,
}

#[derive(Debug, Error)]
pub enum TopicError {
    #[error("topic '{0}' does not match uwb/anchor/{{id}}/vector")]
    Malformed(String),
    #[error("topic '{0}' has non-integer anchor id segment")]
    InvalidAnchorId(String),
}

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("solver did not converge within {max_iterations} iterations (final cost {final_cost})")]
    NotConverged {
        max_iterations: u32,
        final_cost: f64,
    },
    #[error("non-finite value encountered during solve")]
    NonFinite,
}

#[derive(Debug, Error)]
pub enum AnchoringError {
    #[error("required anchoring node {0} missing from solved graph")]
    MissingNode(NodeId),
}
