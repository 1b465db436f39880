//! Balancing settings.
//!
//! `Settings` is read once per scheduling pass and handed by reference to
//! the builder and the score. Every per-metric lookup goes through the
//! helpers here so that override rules live in one place.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Metric name of the resource-governed CPU metric. Its loads are reported
/// in fixed point, so thresholds configured in cores are scaled up.
pub const CPU_CORES_METRIC: &str = "servicefabric:/_CpuCores";

/// Fixed-point factor applied to the activity threshold of [`CPU_CORES_METRIC`].
pub const CPU_CORES_CORRECTION_FACTOR: i64 = 10_000;

/// How a metric's load should be laid out across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStrategy {
    Balancing,
    ReservationAndBalance,
    Reservation,
    ReservationAndPack,
    Defragmentation,
}

/// Whether emptied nodes must be spread across fault/upgrade domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefragDistribution {
    #[default]
    SpreadAcrossFdsUds,
    NumberOfEmptyNodes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Rank defrag candidates by their emptiness across all scoped metrics.
    pub nodes_with_reserved_load_overlap: bool,
    pub local_balancing_threshold: f64,
    pub local_domain_weight: f64,
    pub defragmentation_nodes_std_dev_factor: f64,
    pub defragmentation_fds_std_dev_factor: f64,
    pub defragmentation_uds_std_dev_factor: f64,
    pub move_cost_offset: f64,
    pub ignore_cost_in_scoring: bool,
    /// Cluster-wide max node load at or below which a metric counts as
    /// balanced regardless of spread.
    pub metric_activity_thresholds: HashMap<String, i64>,
    /// max/min node load ratio above which a metric needs balancing.
    pub metric_balancing_thresholds: HashMap<String, f64>,
    /// Deprecated in favour of `reserved_load_per_node`.
    pub metric_empty_node_thresholds: HashMap<String, i64>,
    pub reserved_load_per_node: HashMap<String, i64>,
    pub global_metric_weights: HashMap<String, f64>,
    pub balancing_by_percentage: HashMap<String, bool>,
    /// Legacy defrag switch; overridden by `placement_strategy`.
    pub defragmentation_metrics: HashMap<String, bool>,
    /// Fraction of nodes in `[0, 1)` or a node count `>= 1`.
    pub defragmentation_empty_node_targets: HashMap<String, f64>,
    pub defragmentation_empty_node_distribution_policy: HashMap<String, DefragDistribution>,
    /// Legacy scoped defrag switch; overridden by `placement_strategy`.
    pub defragmentation_scoped_algorithm_enabled: HashMap<String, bool>,
    pub placement_strategy: HashMap<String, PlacementStrategy>,
    pub defragmentation_empty_node_weight: HashMap<String, f64>,
    pub defragmentation_non_empty_node_weight: HashMap<String, f64>,
    /// Share of node capacity kept free as a failover buffer.
    pub node_buffer_percentage: HashMap<String, f64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            metric_activity_thresholds: HashMap::new(),
            metric_balancing_thresholds: HashMap::new(),
            metric_empty_node_thresholds: HashMap::new(),
            reserved_load_per_node: HashMap::new(),
            global_metric_weights: HashMap::new(),
            balancing_by_percentage: HashMap::new(),
            defragmentation_metrics: HashMap::new(),
            defragmentation_empty_node_targets: HashMap::new(),
            defragmentation_empty_node_distribution_policy: HashMap::new(),
            defragmentation_scoped_algorithm_enabled: HashMap::new(),
            placement_strategy: HashMap::new(),
            defragmentation_empty_node_weight: HashMap::new(),
            defragmentation_non_empty_node_weight: HashMap::new(),
            node_buffer_percentage: HashMap::new(),
            nodes_with_reserved_load_overlap: false,
            local_balancing_threshold: 0.0,
            local_domain_weight: 0.25,
            defragmentation_nodes_std_dev_factor: 1.0,
            defragmentation_fds_std_dev_factor: 0.01,
            defragmentation_uds_std_dev_factor: 0.01,
            move_cost_offset: 1000.0,
            ignore_cost_in_scoring: false,
        }
    }
}

impl Settings {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every value against its allowed range.
    pub fn validate(&self) -> ConfigResult<()> {
        for (metric, &value) in &self.metric_balancing_thresholds {
            check_balancing_threshold(metric, value)?;
        }
        check_balancing_threshold("<local domains>", self.local_balancing_threshold)?;

        check_unit("local_domain_weight", self.local_domain_weight)?;
        for (metric, &value) in &self.node_buffer_percentage {
            check_unit(&format!("node_buffer_percentage[{metric}]"), value)?;
        }
        for (metric, &value) in &self.defragmentation_empty_node_weight {
            check_unit(&format!("defragmentation_empty_node_weight[{metric}]"), value)?;
        }
        for (metric, &value) in &self.defragmentation_non_empty_node_weight {
            check_unit(&format!("defragmentation_non_empty_node_weight[{metric}]"), value)?;
        }
        for (metric, &value) in &self.defragmentation_empty_node_targets {
            check_non_negative(&format!("defragmentation_empty_node_targets[{metric}]"), value)?;
        }
        for (metric, &value) in &self.global_metric_weights {
            check_non_negative(&format!("global_metric_weights[{metric}]"), value)?;
        }
        check_non_negative("move_cost_offset", self.move_cost_offset)?;
        Ok(())
    }

    /// Resolves whether `metric` is a defragmentation metric. An explicit
    /// placement strategy always wins over the legacy flag.
    pub fn is_defragmentation_metric(&self, metric: &str) -> bool {
        match self.placement_strategy.get(metric) {
            Some(strategy) => *strategy != PlacementStrategy::Balancing,
            None => self.defragmentation_metrics.get(metric).copied().unwrap_or(false),
        }
    }

    /// Resolves whether the scoped (reservation based) defrag algorithm is
    /// enabled for `metric`. Independent of [`Self::is_defragmentation_metric`]:
    /// with an explicit strategy only the reservation strategies are scoped
    /// and the legacy flags are ignored.
    pub fn is_scoped_defragmentation_enabled(&self, metric: &str) -> bool {
        match self.placement_strategy.get(metric) {
            Some(strategy) => matches!(
                strategy,
                PlacementStrategy::Reservation
                    | PlacementStrategy::ReservationAndBalance
                    | PlacementStrategy::ReservationAndPack
            ),
            None => self
                .defragmentation_scoped_algorithm_enabled
                .get(metric)
                .copied()
                .unwrap_or(false),
        }
    }

    /// Strategy used for scoring; derived from the legacy flag when no
    /// explicit strategy is configured.
    pub fn effective_placement_strategy(&self, metric: &str) -> PlacementStrategy {
        match self.placement_strategy.get(metric) {
            Some(strategy) => *strategy,
            None if self.is_defragmentation_metric(metric) => PlacementStrategy::Defragmentation,
            None => PlacementStrategy::Balancing,
        }
    }

    pub fn activity_threshold(&self, metric: &str) -> i64 {
        let threshold = self.metric_activity_thresholds.get(metric).copied().unwrap_or(0);
        if metric == CPU_CORES_METRIC {
            threshold.saturating_mul(CPU_CORES_CORRECTION_FACTOR)
        } else {
            threshold
        }
    }

    pub fn balancing_threshold(&self, metric: &str) -> f64 {
        self.metric_balancing_thresholds.get(metric).copied().unwrap_or(1.0)
    }

    pub fn balancing_by_percentage(&self, metric: &str) -> bool {
        self.balancing_by_percentage.get(metric).copied().unwrap_or(false)
    }

    pub fn defrag_distribution(&self, metric: &str) -> DefragDistribution {
        self.defragmentation_empty_node_distribution_policy
            .get(metric)
            .copied()
            .unwrap_or_default()
    }

    pub fn empty_node_weight(&self, metric: &str) -> f64 {
        self.defragmentation_empty_node_weight.get(metric).copied().unwrap_or(1.0)
    }

    pub fn non_empty_node_weight(&self, metric: &str) -> f64 {
        self.defragmentation_non_empty_node_weight.get(metric).copied().unwrap_or(1.0)
    }

    pub fn node_buffer_percentage(&self, metric: &str) -> f64 {
        self.node_buffer_percentage.get(metric).copied().unwrap_or(0.0)
    }
}

fn check_balancing_threshold(metric: &str, value: f64) -> ConfigResult<()> {
    if value == 0.0 || value >= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidBalancingThreshold {
            metric: metric.to_string(),
            value,
        })
    }
}

fn check_unit(name: &str, value: f64) -> ConfigResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfUnitRange {
            name: name.to_string(),
            value,
        })
    }
}

fn check_non_negative(name: &str, value: f64) -> ConfigResult<()> {
    if value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Negative {
            name: name.to_string(),
            value,
        })
    }
}
