//! Tracked metrics and load-balancing domains.

use crate::config::{DefragDistribution, PlacementStrategy};

/// One tracked resource dimension inside a load-balancing domain.
///
/// Built once per scheduling pass. Only `is_balanced` changes afterwards,
/// and only on the score's own copy of the domain list.
#[derive(Debug, Clone)]
pub struct Metric {
    pub name: String,
    pub weight: f64,
    /// `0.0` never balances; otherwise at least `1.0`.
    pub balancing_threshold: f64,
    pub activity_threshold: i64,
    pub cluster_total_capacity: i64,
    pub cluster_buffered_capacity: i64,
    pub cluster_load: i64,
    /// Indexed by node; `true` when the node may not carry this metric.
    pub blocked_nodes: Vec<bool>,
    pub is_defrag: bool,
    /// The reservation based ("scoped") defrag algorithm is enabled.
    pub scoped_defrag: bool,
    /// Nodes to keep empty; `-1` when unset.
    pub defrag_empty_node_count: i64,
    /// Load reserved per emptied node.
    pub reservation_load: i64,
    pub defrag_distribution: DefragDistribution,
    pub placement_strategy: PlacementStrategy,
    pub empty_node_weight: f64,
    pub non_empty_node_weight: f64,
    pub balancing_by_percentage: bool,
    pub index_in_domain: usize,
    pub total_index: usize,
    /// Position of the metric with the same name in the global domain, used
    /// for node capacity lookups.
    pub index_in_global_domain: usize,
    pub is_balanced: bool,
}

impl Metric {
    /// Panics when the metric violates a construction-time invariant.
    pub fn check_invariants(&self) {
        assert!(
            self.balancing_threshold == 0.0 || self.balancing_threshold >= 1.0,
            "metric {}: balancing threshold {} must be 0 or >= 1",
            self.name,
            self.balancing_threshold
        );
        assert!(self.weight >= 0.0, "metric {}: negative weight", self.name);
        assert!(self.reservation_load >= 0, "metric {}: negative reservation", self.name);
    }

    pub fn is_valid_node(&self, node_index: usize) -> bool {
        !self.blocked_nodes.get(node_index).copied().unwrap_or(false)
    }

    pub fn is_scoped_defrag(&self) -> bool {
        self.is_defrag && self.scoped_defrag
    }

    /// Number of nodes the scoped defrag algorithm tries to keep empty.
    pub fn defrag_target(&self) -> usize {
        self.defrag_empty_node_count.max(0) as usize
    }
}

/// A group of metrics scored together: one per non-singleton service plus
/// the global domain, which is always last.
#[derive(Debug, Clone)]
pub struct LoadBalancingDomain {
    pub metrics: Vec<Metric>,
    pub metric_weight_sum: f64,
    /// Total index of the first metric of this domain.
    pub metric_start_index: usize,
    /// Owning service; `None` for the global domain.
    pub service_index: Option<usize>,
}

impl LoadBalancingDomain {
    pub fn is_global(&self) -> bool {
        self.service_index.is_none()
    }

    pub fn metric_count(&self) -> usize {
        self.metrics.len()
    }

    pub fn total_index(&self, index_in_domain: usize) -> usize {
        self.metric_start_index + index_in_domain
    }

    pub fn metric(&self, name: &str) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.name == name)
    }
}

#[cfg(test)]
pub(crate) fn test_metric(name: &str, total_index: usize, node_count: usize) -> Metric {
    Metric {
        name: name.to_string(),
        weight: 1.0,
        balancing_threshold: 1.0,
        activity_threshold: 0,
        cluster_total_capacity: 0,
        cluster_buffered_capacity: 0,
        cluster_load: 0,
        blocked_nodes: vec![false; node_count],
        is_defrag: false,
        scoped_defrag: false,
        defrag_empty_node_count: -1,
        reservation_load: 0,
        defrag_distribution: DefragDistribution::SpreadAcrossFdsUds,
        placement_strategy: PlacementStrategy::Balancing,
        empty_node_weight: 1.0,
        non_empty_node_weight: 1.0,
        balancing_by_percentage: false,
        index_in_domain: total_index,
        total_index,
        index_in_global_domain: total_index,
        is_balanced: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "balancing threshold")]
    fn fractional_threshold_panics() {
        let mut metric = test_metric("Memory", 0, 2);
        metric.balancing_threshold = 0.5;
        metric.check_invariants();
    }

    #[test]
    fn blocked_nodes_are_invalid() {
        let mut metric = test_metric("Memory", 0, 3);
        metric.blocked_nodes[1] = true;
        assert!(metric.is_valid_node(0));
        assert!(!metric.is_valid_node(1));
        assert!(metric.is_valid_node(7));
    }

    #[test]
    fn scoped_requires_defrag() {
        let mut metric = test_metric("Memory", 0, 1);
        metric.scoped_defrag = true;
        assert!(!metric.is_scoped_defrag());
        metric.is_defrag = true;
        assert!(metric.is_scoped_defrag());
        assert_eq!(metric.defrag_target(), 0);
    }
}
