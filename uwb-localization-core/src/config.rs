use std::env;
use std::time::Duration;

/// Tunables for the sliding-window binner. Defaults match the reference
/// admission protocol; override via `BinnerConfig::from_env` for deployments
/// with different anchor noise characteristics.
#[derive(Debug, Clone, Copy)]
pub struct BinnerConfig {
    pub window_size_seconds: f64,
    pub outlier_threshold_sigma: f64,
    pub min_samples_for_outlier_detection: usize,
    pub max_anchor_variance: f64,
}

impl Default for BinnerConfig {
    fn default() -> Self {
        Self {
            window_size_seconds: 1.0,
            outlier_threshold_sigma: 2.0,
            min_samples_for_outlier_detection: 5,
            max_anchor_variance: 10_000.0,
        }
    }
}

impl BinnerConfig {
    /// Same defaults, with any of `UWB_WINDOW_SECONDS`, `UWB_OUTLIER_SIGMA`,
    /// `UWB_MIN_OUTLIER_SAMPLES`, `UWB_MAX_ANCHOR_VARIANCE` overriding a
    /// field when set and parseable — mirrors the env-var-with-fallback
    /// pattern the UDP ingestion hub uses for its own tunables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            window_size_seconds: env_parsed("UWB_WINDOW_SECONDS", defaults.window_size_seconds),
            outlier_threshold_sigma: env_parsed(
                "UWB_OUTLIER_SIGMA",
                defaults.outlier_threshold_sigma,
            ),
            min_samples_for_outlier_detection: env_parsed(
                "UWB_MIN_OUTLIER_SAMPLES",
                defaults.min_samples_for_outlier_detection,
            ),
            max_anchor_variance: env_parsed(
                "UWB_MAX_ANCHOR_VARIANCE",
                defaults.max_anchor_variance,
            ),
        }
    }
}

/// Which anchoring alignment the solver applies after the free optimum is
/// found. `TwoAnchor` is the default (anchors 3 and 0 alone determine scale
/// and rotation); `KabschFourAnchor` is the generalized least-squares
/// variant over all four known anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchoringMode {
    TwoAnchor,
    KabschFourAnchor,
}

#[derive(Debug, Clone, Copy)]
pub struct SolverConfig {
    pub max_iterations: u32,
    pub ftol: f64,
    pub anchoring_mode: AnchoringMode,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            ftol: 1e-6,
            anchoring_mode: AnchoringMode::TwoAnchor,
        }
    }
}

/// MQTT broker connection parameters.
#[derive(Debug, Clone)]
pub struct IngressConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id_prefix: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            broker_host: env::var("UWB_MQTT_HOST").unwrap_or_else(|_| "localhost".to_string()),
            broker_port: env_parsed("UWB_MQTT_PORT", 1883u16),
            client_id_prefix: "uwb-localization".to_string(),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
