//! Energy of a cluster state.
//!
//! A `Score` owns per-node and per-domain load accumulators copied from the
//! balance model. The search loop folds tentative load deltas in with
//! [`Score::update_metric_scores`] and recomputes the energy with
//! [`Score::calculate`]; lower energy means a better balanced (or better
//! defragmented) cluster at an acceptable move cost.

use std::collections::BTreeMap;

use tracing::trace;

use crate::builder::BalanceModel;
use crate::config::{PlacementStrategy, Settings};
use crate::domain_tree::{DomainData, DomainTree, TreeNodeIndex};
use crate::load::{normalized_std_dev, LoadEntry, LoadStat};
use crate::metric::{LoadBalancingDomain, Metric};
use crate::node_load_set::DynamicNodeLoadSet;

/// Per-node load deltas, indexed by total metric index.
pub type NodeLoadChanges = BTreeMap<usize, LoadEntry>;

const EPSILON: f64 = 1e-9;

/// Offset keeping the energy sign stable around a perfect balance.
const ENERGY_OFFSET: f64 = 0.001;

#[derive(Debug, Clone, Copy)]
struct ScoringParams {
    local_domain_weight: f64,
    nodes_std_dev_factor: f64,
    fds_std_dev_factor: f64,
    uds_std_dev_factor: f64,
    move_cost_offset: f64,
    ignore_cost: bool,
}

impl ScoringParams {
    fn from_settings(settings: &Settings) -> Self {
        Self {
            local_domain_weight: settings.local_domain_weight,
            nodes_std_dev_factor: settings.defragmentation_nodes_std_dev_factor,
            fds_std_dev_factor: settings.defragmentation_fds_std_dev_factor,
            uds_std_dev_factor: settings.defragmentation_uds_std_dev_factor,
            move_cost_offset: settings.move_cost_offset,
            ignore_cost: settings.ignore_cost_in_scoring,
        }
    }
}

/// How node loads of one metric enter the statistics.
#[derive(Debug, Clone)]
struct MetricColumn {
    /// Up and not blocked.
    counted: Vec<bool>,
    /// Divisor applied to the raw load.
    scale: Vec<f64>,
    /// Loads are scaled by node capacity.
    percentage: bool,
}

#[derive(Debug, Clone, Copy)]
struct MetricOutcome {
    score: f64,
    balanced: bool,
    target_achieved: bool,
}

#[derive(Debug, Clone)]
pub struct Score {
    domains: Vec<LoadBalancingDomain>,
    stats: Vec<LoadStat>,
    columns: Vec<MetricColumn>,
    node_loads: Vec<LoadEntry>,
    fault_domain_loads: Option<DomainTree<LoadEntry>>,
    upgrade_domain_loads: Option<DomainTree<LoadEntry>>,
    fault_domain_keys: Vec<Option<TreeNodeIndex>>,
    upgrade_domain_keys: Vec<Option<TreeNodeIndex>>,
    metric_scores: Vec<f64>,
    params: ScoringParams,
    total_replica_count: usize,
    exist_scoped_defrag_metric: bool,
    avg_std_dev: f64,
    energy: f64,
    defrag_target_empty_nodes_achieved: bool,
}

impl Score {
    pub fn new(model: &BalanceModel, settings: &Settings) -> Self {
        let total = model.total_metric_count;
        let node_loads: Vec<LoadEntry> = model.nodes.iter().map(|n| n.loads.clone()).collect();

        let mut columns = Vec::with_capacity(total);
        let mut stats = Vec::with_capacity(total);
        for t in 0..total {
            let metric = model.metric_by_total_index(t);
            let counted: Vec<bool> = model
                .nodes
                .iter()
                .map(|n| n.is_up && metric.is_valid_node(n.index))
                .collect();
            let capacities: Vec<i64> = (0..model.nodes.len())
                .map(|n| model.node_capacity(n, t))
                .collect();
            let percentage = metric.balancing_by_percentage
                && counted.iter().any(|&c| c)
                && counted.iter().zip(&capacities).all(|(&c, &cap)| !c || cap > 0);
            let scale: Vec<f64> = (0..model.nodes.len())
                .map(|n| {
                    if percentage {
                        capacities[n] as f64
                    } else {
                        model.node_capacity_ratio(n, t) as f64
                    }
                })
                .collect();

            let mut stat = LoadStat::new();
            for n in (0..model.nodes.len()).filter(|&n| counted[n]) {
                let load = node_loads[n].get(t);
                stat.add_node(load, load as f64 / scale[n], capacities[n]);
            }
            stats.push(stat);
            columns.push(MetricColumn {
                counted,
                scale,
                percentage,
            });
        }

        let accumulate = |tree: &DomainTree<DomainData>, keys: &[Option<TreeNodeIndex>]| {
            let mut loads = tree.map(|_| LoadEntry::zeros(total));
            for (node, key) in keys.iter().enumerate() {
                if let Some(key) = key {
                    loads.for_each_on_path_mut(key, |entry| *entry += &node_loads[node]);
                }
            }
            loads
        };
        let fault_domain_keys: Vec<_> = model.nodes.iter().map(|n| n.fault_domain_index.clone()).collect();
        let upgrade_domain_keys: Vec<_> = model.nodes.iter().map(|n| n.upgrade_domain_index.clone()).collect();
        let fault_domain_loads = model
            .fault_domains
            .as_ref()
            .map(|tree| accumulate(tree, &fault_domain_keys));
        let upgrade_domain_loads = model
            .upgrade_domains
            .as_ref()
            .map(|tree| accumulate(tree, &upgrade_domain_keys));

        Self {
            domains: model.domains.clone(),
            stats,
            columns,
            node_loads,
            fault_domain_loads,
            upgrade_domain_loads,
            fault_domain_keys,
            upgrade_domain_keys,
            metric_scores: vec![0.0; total],
            params: ScoringParams::from_settings(settings),
            total_replica_count: model.total_replica_count,
            exist_scoped_defrag_metric: model.exist_scoped_defrag_metric,
            avg_std_dev: 0.0,
            energy: 0.0,
            defrag_target_empty_nodes_achieved: false,
        }
    }

    pub fn energy(&self) -> f64 {
        self.energy
    }

    pub fn avg_std_dev(&self) -> f64 {
        self.avg_std_dev
    }

    pub fn defrag_target_empty_nodes_achieved(&self) -> bool {
        self.defrag_target_empty_nodes_achieved
    }

    /// Domains with the `is_balanced` flags of the last calculation.
    pub fn domains(&self) -> &[LoadBalancingDomain] {
        &self.domains
    }

    pub fn stat(&self, total_index: usize) -> &LoadStat {
        &self.stats[total_index]
    }

    pub fn node_load(&self, node: usize, total_index: usize) -> i64 {
        self.node_loads[node].get(total_index)
    }

    /// Sub-score of the last calculation for `total_index`.
    pub fn metric_score(&self, total_index: usize) -> f64 {
        self.metric_scores[total_index]
    }

    /// Average sub-score of `name` across every domain holding it.
    pub fn std_dev_for_metric(&self, name: &str) -> Option<f64> {
        let scores: Vec<f64> = self
            .domains
            .iter()
            .filter_map(|d| d.metric(name))
            .map(|m| self.metric_scores[m.total_index])
            .collect();
        (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64)
    }

    /// Relative deviation of a node's scaled load from the metric average.
    /// Positive for nodes above the average.
    pub fn node_deviation(&self, node: usize, total_index: usize) -> f64 {
        let column = &self.columns[total_index];
        let average = self.stats[total_index].average();
        if !column.counted[node] || average <= 0.0 {
            return 0.0;
        }
        let scaled = self.node_loads[node].get(total_index) as f64 / column.scale[node];
        (scaled - average) / average
    }

    // ── Incremental updates ────────────────────────────────────────

    /// Fold per-node deltas into the accumulators. With `previous`, the
    /// changes replace that earlier, already applied, set of changes.
    pub fn update_metric_scores(&mut self, changes: &NodeLoadChanges, previous: Option<&NodeLoadChanges>) {
        let mut net = changes.clone();
        if let Some(previous) = previous {
            for (&node, delta) in previous {
                let entry = net.entry(node).or_insert_with(|| LoadEntry::zeros(delta.len()));
                *entry -= delta;
            }
        }
        for (node, delta) in &net {
            self.apply_delta(*node, delta);
        }
    }

    fn apply_delta(&mut self, node: usize, delta: &LoadEntry) {
        for (t, change) in delta.non_zero() {
            let old = self.node_loads[node].get(t);
            let new = old + change;
            self.node_loads[node].set(t, new);

            let column = &self.columns[t];
            if column.counted[node] {
                let scale = column.scale[node];
                self.stats[t].update_node(old, new, old as f64 / scale, new as f64 / scale);
            }
        }

        if let (Some(tree), Some(key)) = (&mut self.fault_domain_loads, &self.fault_domain_keys[node]) {
            tree.for_each_on_path_mut(key, |entry| *entry += delta);
        }
        if let (Some(tree), Some(key)) = (&mut self.upgrade_domain_loads, &self.upgrade_domain_keys[node]) {
            tree.for_each_on_path_mut(key, |entry| *entry += delta);
        }
    }

    fn refresh_extremes(&mut self, t: usize) {
        let column = &self.columns[t];
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for (node, loads) in self.node_loads.iter().enumerate() {
            if column.counted[node] {
                let scaled = loads.get(t) as f64 / column.scale[node];
                min = min.min(scaled);
                max = max.max(scaled);
            }
        }
        self.stats[t].set_extremes(min, max);
    }

    // ── Calculation ────────────────────────────────────────────────

    /// Recompute the energy for a state reached at `cost`.
    pub fn calculate(&mut self, cost: f64, set: &mut DynamicNodeLoadSet) {
        self.defrag_target_empty_nodes_achieved = self.exist_scoped_defrag_metric;
        for t in 0..self.stats.len() {
            if self.stats[t].extremes_stale() {
                self.refresh_extremes(t);
            }
        }

        let mut local_sum = 0.0;
        let mut local_count = 0;
        let mut global = 0.0;
        for d in 0..self.domains.len() {
            let outcomes: Vec<MetricOutcome> = self.domains[d]
                .metrics
                .iter()
                .map(|metric| self.metric_outcome(metric, set))
                .collect();

            let domain = &mut self.domains[d];
            let mut weighted = 0.0;
            for (metric, outcome) in domain.metrics.iter_mut().zip(&outcomes) {
                metric.is_balanced = outcome.balanced;
                self.metric_scores[metric.total_index] = outcome.score;
                if !outcome.target_achieved {
                    self.defrag_target_empty_nodes_achieved = false;
                }
                if metric.weight > 0.0 {
                    weighted += metric.weight * outcome.score;
                }
            }
            let score = if domain.metric_weight_sum > 0.0 {
                weighted / domain.metric_weight_sum
            } else {
                0.0
            };

            if domain.is_global() {
                global = score;
            } else {
                local_sum += score;
                local_count += 1;
            }
        }

        self.avg_std_dev = if local_count == 0 {
            global
        } else {
            let weight = self.params.local_domain_weight;
            weight * (local_sum / local_count as f64) + (1.0 - weight) * global
        };

        self.energy = if self.total_replica_count == 0 || self.params.ignore_cost {
            self.avg_std_dev
        } else {
            let shifted = self.avg_std_dev + ENERGY_OFFSET;
            shifted * (shifted.signum() * cost + self.total_replica_count as f64 + self.params.move_cost_offset)
        };

        trace!(
            avg_std_dev = self.avg_std_dev,
            energy = self.energy,
            cost,
            target_achieved = self.defrag_target_empty_nodes_achieved,
            "score calculated"
        );
    }

    fn metric_outcome(&self, metric: &Metric, set: &mut DynamicNodeLoadSet) -> MetricOutcome {
        let t = metric.total_index;
        if metric.is_scoped_defrag() && set.tracks_metric(t) {
            return self.scoped_defrag_outcome(metric, set);
        }

        let never_balance = metric.balancing_threshold == 0.0;
        if metric.is_defrag {
            let score = self.legacy_defrag_term(t);
            return MetricOutcome {
                score,
                balanced: never_balance || self.is_defragmented(metric),
                target_achieved: true,
            };
        }

        MetricOutcome {
            score: self.balance_term(t, &[]),
            balanced: never_balance || self.is_plain_balanced(metric),
            target_achieved: true,
        }
    }

    fn scoped_defrag_outcome(&self, metric: &Metric, set: &mut DynamicNodeLoadSet) -> MetricOutcome {
        let target = metric.defrag_target();
        let mut selected = Vec::with_capacity(target);
        let mut free = 0.0;
        set.for_each_candidate_node(
            metric.total_index,
            target,
            metric.defrag_distribution,
            |node, fraction| {
                selected.push(node);
                free += (1.0 - fraction).powi(2);
                if fraction <= EPSILON {
                    free += 1.0;
                }
            },
            false,
        );
        let free_term = 2.0 * target as f64 - free;
        let target_achieved = free_term <= EPSILON;

        let balance_term = match metric.placement_strategy {
            PlacementStrategy::ReservationAndBalance => Some(self.balance_term(metric.total_index, &selected)),
            PlacementStrategy::ReservationAndPack => Some(self.legacy_defrag_term(metric.total_index)),
            PlacementStrategy::Reservation | PlacementStrategy::Defragmentation | PlacementStrategy::Balancing => None,
        };
        let score = match balance_term {
            Some(balance) => metric.non_empty_node_weight * balance + metric.empty_node_weight * free_term,
            None => metric.empty_node_weight * free_term,
        };

        MetricOutcome {
            score,
            balanced: metric.balancing_threshold == 0.0 || target_achieved,
            target_achieved,
        }
    }

    /// Normalized std dev of the metric over counted nodes, leaving out
    /// `excluded`.
    fn balance_term(&self, t: usize, excluded: &[usize]) -> f64 {
        let column = &self.columns[t];
        let stat = if excluded.is_empty() {
            self.stats[t].clone()
        } else {
            let mut stat = LoadStat::new();
            for (node, loads) in self.node_loads.iter().enumerate() {
                if column.counted[node] && !excluded.contains(&node) {
                    let load = loads.get(t);
                    let capacity = if column.percentage { column.scale[node] as i64 } else { 0 };
                    stat.add_node(load, load as f64 / column.scale[node], capacity);
                }
            }
            stat
        };

        if column.percentage && stat.capacity_complete && stat.capacity_sum > 0.0 {
            stat.normalized_std_dev_around(stat.absolute_sum / stat.capacity_sum)
        } else {
            stat.normalized_std_dev()
        }
    }

    /// Rewards uneven node loads and penalizes concentration in one
    /// fault or upgrade domain.
    fn legacy_defrag_term(&self, t: usize) -> f64 {
        let node = self.stats[t].normalized_std_dev();
        let fd = leaf_std_dev(self.fault_domain_loads.as_ref(), t);
        let ud = leaf_std_dev(self.upgrade_domain_loads.as_ref(), t);
        self.params.nodes_std_dev_factor * (1.0 - node)
            + self.params.fds_std_dev_factor * fd
            + self.params.uds_std_dev_factor * ud
    }

    fn is_plain_balanced(&self, metric: &Metric) -> bool {
        let stat = &self.stats[metric.total_index];
        if stat.count == 0 || stat.max <= metric.activity_threshold as f64 {
            return true;
        }
        if stat.min <= 0.0 {
            return false;
        }
        stat.max / stat.min <= metric.balancing_threshold
    }

    /// Every domain level spreads its load at least `balancing_threshold`
    /// times unevenly. Falls back to node loads without domain trees.
    fn is_defragmented(&self, metric: &Metric) -> bool {
        let t = metric.total_index;
        let trees = [self.fault_domain_loads.as_ref(), self.upgrade_domain_loads.as_ref()];
        let mut ratios: Vec<f64> = trees
            .into_iter()
            .flatten()
            .map(|tree| {
                let leaves: Vec<f64> = tree.leaves().into_iter().map(|(_, e)| e.get(t) as f64).collect();
                spread_ratio(&leaves)
            })
            .collect();
        if ratios.is_empty() {
            let stat = &self.stats[t];
            ratios.push(spread_ratio(&[stat.min, stat.max]));
        }
        ratios.into_iter().all(|ratio| ratio >= metric.balancing_threshold)
    }
}

fn leaf_std_dev(tree: Option<&DomainTree<LoadEntry>>, t: usize) -> f64 {
    tree.map_or(0.0, |tree| {
        let leaves: Vec<f64> = tree.leaves().into_iter().map(|(_, e)| e.get(t) as f64).collect();
        normalized_std_dev(&leaves)
    })
}

/// `max / min`; infinite when some value is empty and another is not.
fn spread_ratio(values: &[f64]) -> f64 {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if values.is_empty() || max <= 0.0 {
        1.0
    } else if min <= 0.0 {
        f64::INFINITY
    } else {
        max / min
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BalanceModelBuilder;
    use crate::snapshot::{ClusterSnapshot, NodeDescription, ServiceDescription};

    /// One non-singleton service with one replica per node.
    fn cluster(loads: &[i64]) -> ClusterSnapshot {
        let nodes = (0..loads.len())
            .map(|i| NodeDescription::new(format!("n{i}"), format!("fd:/dc{i}"), format!("ud{i}")).with_capacity("Memory", 100))
            .collect();
        let mut service = ServiceDescription::new("svc", &[("Memory", 1.0)]);
        for (node, &load) in loads.iter().enumerate() {
            service = service.with_replica(node, &[load]);
        }
        ClusterSnapshot {
            nodes,
            services: vec![service],
            ..Default::default()
        }
    }

    fn setup(settings: &Settings, snapshot: &ClusterSnapshot) -> (BalanceModel, Score, DynamicNodeLoadSet) {
        let model = BalanceModelBuilder::new(settings).build(snapshot).unwrap();
        let score = Score::new(&model, settings);
        let set = DynamicNodeLoadSet::new(&model, false);
        (model, score, set)
    }

    fn delta(total: usize, entries: &[(usize, i64)]) -> LoadEntry {
        let mut entry = LoadEntry::zeros(total);
        for &(index, value) in entries {
            entry.set(index, value);
        }
        entry
    }

    #[test]
    fn uniform_loads_score_zero() {
        let mut settings = Settings::default();
        settings.ignore_cost_in_scoring = true;
        let (_, mut score, mut set) = setup(&settings, &cluster(&[50, 50, 50]));
        score.calculate(0.0, &mut set);
        assert_eq!(score.avg_std_dev(), 0.0);
        assert_eq!(score.energy(), 0.0);
        assert!(!score.defrag_target_empty_nodes_achieved());
    }

    #[test]
    fn blends_local_and_global_domains() {
        let settings = Settings::default();
        let (model, mut score, mut set) = setup(&settings, &cluster(&[10, 50, 90]));
        score.calculate(0.0, &mut set);

        let local = score.metric_score(0);
        let global = score.metric_score(model.global_total_index("Memory").unwrap());
        assert!(local > 0.0);
        assert_eq!(local, global);
        let expected = 0.25 * local + 0.75 * global;
        assert!((score.avg_std_dev() - expected).abs() < 1e-12);
        assert_eq!(score.std_dev_for_metric("Memory"), Some(local));
        assert_eq!(score.std_dev_for_metric("Cpu"), None);
    }

    #[test]
    fn energy_couples_cost_and_balance() {
        let settings = Settings::default();
        let (_, mut score, mut set) = setup(&settings, &cluster(&[10, 50, 90]));
        score.calculate(5.0, &mut set);
        let shifted = score.avg_std_dev() + ENERGY_OFFSET;
        let expected = shifted * (5.0 + 3.0 + 1000.0);
        assert!((score.energy() - expected).abs() < 1e-9);

        let cheap = score.energy();
        score.calculate(50.0, &mut set);
        assert!(score.energy() > cheap);
    }

    #[test]
    fn no_replicas_means_energy_is_balance() {
        let settings = Settings::default();
        let snapshot = ClusterSnapshot {
            nodes: cluster(&[0, 0]).nodes,
            ..Default::default()
        };
        let (_, mut score, mut set) = setup(&settings, &snapshot);
        score.calculate(10.0, &mut set);
        assert_eq!(score.energy(), score.avg_std_dev());
    }

    #[test]
    fn replacing_changes_applies_the_difference() {
        let settings = Settings::default();
        let (model, mut score, _) = setup(&settings, &cluster(&[10, 50, 90]));
        let total = model.total_metric_count;
        let global = model.global_total_index("Memory").unwrap();

        let first: NodeLoadChanges = [(0, delta(total, &[(0, 20), (global, 20)]))].into();
        score.update_metric_scores(&first, None);
        assert_eq!(score.node_load(0, 0), 30);

        let second: NodeLoadChanges = [(1, delta(total, &[(0, 5), (global, 5)]))].into();
        score.update_metric_scores(&second, Some(&first));
        assert_eq!(score.node_load(0, 0), 10);
        assert_eq!(score.node_load(1, global), 55);
        assert_eq!(score.stat(global).absolute_sum, 155.0);
    }

    #[test]
    fn plain_balance_respects_threshold_and_activity() {
        let mut settings = Settings::default();
        settings.metric_balancing_thresholds.insert("Memory".to_string(), 2.0);
        let (model, mut score, mut set) = setup(&settings, &cluster(&[20, 30, 39]));
        let global = model.global_total_index("Memory").unwrap();
        score.calculate(0.0, &mut set);
        assert!(score.domains().last().unwrap().metrics[0].is_balanced);

        let spike: NodeLoadChanges = [(2, delta(model.total_metric_count, &[(0, 40), (global, 40)]))].into();
        score.update_metric_scores(&spike, None);
        score.calculate(0.0, &mut set);
        assert!(!score.domains().last().unwrap().metrics[0].is_balanced);

        settings.metric_activity_thresholds.insert("Memory".to_string(), 100);
        let (_, mut score, mut set) = setup(&settings, &cluster(&[0, 30, 79]));
        score.calculate(0.0, &mut set);
        assert!(score.domains().last().unwrap().metrics[0].is_balanced);
    }

    #[test]
    fn stale_extremes_are_rescanned() {
        let mut settings = Settings::default();
        settings.metric_balancing_thresholds.insert("Memory".to_string(), 2.0);
        let (model, mut score, mut set) = setup(&settings, &cluster(&[10, 50, 90]));
        let global = model.global_total_index("Memory").unwrap();

        let even: NodeLoadChanges = [
            (0, delta(model.total_metric_count, &[(0, 40), (global, 40)])),
            (2, delta(model.total_metric_count, &[(0, -40), (global, -40)])),
        ]
        .into();
        score.update_metric_scores(&even, None);
        score.calculate(0.0, &mut set);
        assert_eq!(score.stat(global).max, 50.0);
        assert_eq!(score.stat(global).min, 50.0);
        assert!(score.domains().last().unwrap().metrics[0].is_balanced);
    }

    #[test]
    fn legacy_defrag_rewards_uneven_nodes() {
        let mut settings = Settings::default();
        settings.defragmentation_metrics.insert("Memory".to_string(), true);
        settings.ignore_cost_in_scoring = true;

        let (_, mut packed, mut set) = setup(&settings, &cluster(&[0, 0, 90]));
        packed.calculate(0.0, &mut set);
        let (_, mut spread, mut set) = setup(&settings, &cluster(&[30, 30, 30]));
        spread.calculate(0.0, &mut set);

        assert!(packed.energy() < spread.energy());
        assert!(packed.domains().last().unwrap().metrics[0].is_balanced);
    }

    #[test]
    fn scoped_defrag_latches_target() {
        let mut settings = Settings::default();
        settings
            .placement_strategy
            .insert("Memory".to_string(), PlacementStrategy::Reservation);
        settings
            .defragmentation_empty_node_targets
            .insert("Memory".to_string(), 1.0);
        let (model, mut score, mut set) = setup(&settings, &cluster(&[0, 50, 50]));
        score.calculate(0.0, &mut set);
        assert!(score.defrag_target_empty_nodes_achieved());
        assert_eq!(score.metric_score(model.global_total_index("Memory").unwrap()), 0.0);

        let (_, mut score, mut set) = setup(&settings, &cluster(&[25, 50, 50]));
        score.calculate(0.0, &mut set);
        assert!(!score.defrag_target_empty_nodes_achieved());
        assert!((score.metric_score(0) - (2.0 - 0.75f64.powi(2))).abs() < 1e-9);
    }

    #[test]
    fn reservation_and_pack_blends_weighted_terms() {
        let mut settings = Settings::default();
        settings
            .placement_strategy
            .insert("Memory".to_string(), PlacementStrategy::ReservationAndPack);
        settings
            .defragmentation_empty_node_targets
            .insert("Memory".to_string(), 1.0);
        settings
            .defragmentation_empty_node_weight
            .insert("Memory".to_string(), 2.0);
        settings
            .defragmentation_non_empty_node_weight
            .insert("Memory".to_string(), 0.5);
        let (_, mut score, mut set) = setup(&settings, &cluster(&[25, 50, 50]));
        score.calculate(0.0, &mut set);

        // Every node sits in its own FD and UD, so all three spreads agree.
        let spread = normalized_std_dev(&[25.0, 50.0, 50.0]);
        let pack = (1.0 - spread) + 0.01 * spread + 0.01 * spread;
        let free = 2.0 - 0.75f64.powi(2);
        let expected = 0.5 * pack + 2.0 * free;
        assert!((score.metric_score(0) - expected).abs() < 1e-9);
        assert!(!score.defrag_target_empty_nodes_achieved());
    }

    #[test]
    fn reservation_and_balance_ignores_emptied_nodes() {
        let mut settings = Settings::default();
        settings
            .placement_strategy
            .insert("Memory".to_string(), PlacementStrategy::ReservationAndBalance);
        settings
            .defragmentation_empty_node_targets
            .insert("Memory".to_string(), 1.0);
        let (_, mut score, mut set) = setup(&settings, &cluster(&[0, 50, 50]));
        score.calculate(0.0, &mut set);
        assert_eq!(score.metric_score(0), 0.0);
        assert!(score.defrag_target_empty_nodes_achieved());
    }

    #[test]
    fn percentage_balancing_uses_capacity() {
        let mut settings = Settings::default();
        settings.balancing_by_percentage.insert("Memory".to_string(), true);
        let mut snapshot = cluster(&[50, 100]);
        snapshot.nodes[1].capacities.insert("Memory".to_string(), 200);
        let (_, mut score, mut set) = setup(&settings, &snapshot);
        score.calculate(0.0, &mut set);
        assert!(score.avg_std_dev().abs() < 1e-12);
    }

    #[test]
    fn deviation_ranks_heaviest_node_last() {
        let (_, score, _) = setup(&Settings::default(), &cluster(&[10, 50, 90]));
        let worst = (0..3)
            .max_by(|&a, &b| score.node_deviation(a, 0).total_cmp(&score.node_deviation(b, 0)))
            .unwrap();
        assert_eq!(worst, 2);
    }
}
