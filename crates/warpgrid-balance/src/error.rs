//! Error types for the balancing core.

use thiserror::Error;

/// Result type alias for balance model construction.
pub type ModelResult<T> = Result<T, ModelError>;

/// Result type alias for settings loading and validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Inconsistencies in the cluster or workload snapshot.
///
/// Upstream collaborators validate snapshots before handing them over, so
/// any of these means a programming or configuration error. The builder
/// never returns a partially built model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("service {service}: replica on node {node} reports {actual} loads for {expected} metrics")]
    LoadCountMismatch {
        service: String,
        node: usize,
        expected: usize,
        actual: usize,
    },

    #[error("service {service}: node index {node} out of bounds ({node_count} nodes)")]
    NodeIndexOutOfBounds {
        service: String,
        node: usize,
        node_count: usize,
    },

    #[error("metric {metric}: reservation load {load} is negative")]
    NegativeReservation { metric: String, load: i64 },

    #[error("metric {metric}: duplicate metric in service {service}")]
    DuplicateMetric { service: String, metric: String },

    #[error("invalid settings: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised while loading or validating [`Settings`](crate::config::Settings).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("metric {metric}: balancing threshold {value} must be 0 or at least 1.0")]
    InvalidBalancingThreshold { metric: String, value: f64 },

    #[error("{name} must be within [0, 1], got {value}")]
    OutOfUnitRange { name: String, value: f64 },

    #[error("{name} must not be negative, got {value}")]
    Negative { name: String, value: f64 },
}
