//! Builds the immutable [`BalanceModel`] for one scheduling pass.
//!
//! The builder resolves per-metric settings, lays out the total metric
//! index space (local domain metrics first, global metrics last), flattens
//! replica loads per node and classifies nodes into fault and upgrade
//! domain trees. Construction is all-or-nothing: any inconsistency in the
//! snapshot is returned as a [`ModelError`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::domain_tree::{split_domain_path, DomainData, DomainTree, TreeNodeIndex};
use crate::error::{ModelError, ModelResult};
use crate::load::LoadEntry;
use crate::metric::{LoadBalancingDomain, Metric};
use crate::snapshot::{ClusterSnapshot, DeactivationState, NodeDescription, ServiceDescription};

// ── Node ───────────────────────────────────────────────────────────

/// Per-node view of the snapshot, flattened over metric indices.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub node_id: String,
    pub index: usize,
    pub node_type: Option<String>,
    pub is_up: bool,
    pub deactivation: DeactivationState,
    /// Current load, indexed by total metric index.
    pub loads: LoadEntry,
    /// Load of replicas that are about to leave, indexed by total metric index.
    pub should_disappear_loads: LoadEntry,
    /// Indexed by global metric index; `-1` means unlimited.
    pub total_capacities: Vec<i64>,
    pub buffered_capacities: Vec<i64>,
    pub capacity_ratios: Vec<u32>,
    pub fault_domain_index: Option<TreeNodeIndex>,
    pub upgrade_domain_index: Option<TreeNodeIndex>,
    /// Up and accepting new replicas.
    pub is_valid: bool,
    pub in_upgraded_ud: bool,
}

impl NodeEntry {
    pub fn load(&self, total_index: usize) -> i64 {
        self.loads.get(total_index)
    }

    pub fn load_with_disappearing(&self, total_index: usize) -> i64 {
        self.loads.get(total_index) + self.should_disappear_loads.get(total_index)
    }

    pub fn capacity(&self, global_index: usize) -> Option<i64> {
        let capacity = self.total_capacities[global_index];
        (capacity >= 0).then_some(capacity)
    }

    pub fn is_deactivated(&self) -> bool {
        self.deactivation != DeactivationState::Active
    }
}

// ── Model ──────────────────────────────────────────────────────────

/// Result of one build. Cloned for each independent search.
#[derive(Debug, Clone)]
pub struct BalanceModel {
    pub nodes: Vec<NodeEntry>,
    /// Local domains followed by the global domain.
    pub domains: Vec<LoadBalancingDomain>,
    pub fault_domains: Option<DomainTree<DomainData>>,
    pub upgrade_domains: Option<DomainTree<DomainData>>,
    pub total_metric_count: usize,
    pub global_metric_count: usize,
    pub total_replica_count: usize,
    pub exist_defrag_metric: bool,
    pub exist_scoped_defrag_metric: bool,
    pub down_nodes: Vec<usize>,
    pub deactivated_placement_allowed_nodes: Vec<usize>,
    pub deactivated_every_node_allowed_nodes: Vec<usize>,
    pub deactivated_nodes: Vec<usize>,
    metric_locations: Vec<(usize, usize)>,
    global_metric_indices: HashMap<String, usize>,
}

impl BalanceModel {
    pub fn global_domain(&self) -> &LoadBalancingDomain {
        &self.domains[self.domains.len() - 1]
    }

    pub fn local_domains(&self) -> &[LoadBalancingDomain] {
        &self.domains[..self.domains.len() - 1]
    }

    /// Panics on an unknown index.
    pub fn metric_by_total_index(&self, total_index: usize) -> &Metric {
        let (domain, local) = self.metric_locations[total_index];
        &self.domains[domain].metrics[local]
    }

    pub fn global_metric_index(&self, name: &str) -> Option<usize> {
        self.global_metric_indices.get(name).copied()
    }

    /// Total index of the global metric called `name`.
    pub fn global_total_index(&self, name: &str) -> Option<usize> {
        self.global_metric_index(name)
            .map(|g| self.global_domain().total_index(g))
    }

    pub fn node_capacity(&self, node: usize, total_index: usize) -> i64 {
        let global = self.metric_by_total_index(total_index).index_in_global_domain;
        self.nodes[node].total_capacities[global]
    }

    pub fn node_capacity_ratio(&self, node: usize, total_index: usize) -> u32 {
        let global = self.metric_by_total_index(total_index).index_in_global_domain;
        self.nodes[node].capacity_ratios[global]
    }

    /// Total indices of metrics using the scoped defrag algorithm.
    pub fn scoped_defrag_metric_indices(&self) -> Vec<usize> {
        self.domains
            .iter()
            .flat_map(|d| d.metrics.iter())
            .filter(|m| m.is_scoped_defrag())
            .map(|m| m.total_index)
            .collect()
    }

    pub fn up_node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_up).count()
    }
}

// ── Builder ────────────────────────────────────────────────────────

pub struct BalanceModelBuilder<'a> {
    settings: &'a Settings,
}

/// Placement of one metric in the index space.
struct MetricSlot<'s> {
    name: &'s str,
    weight: f64,
    balancing_threshold: f64,
    blocked: Vec<bool>,
    index_in_domain: usize,
    total_index: usize,
    index_in_global_domain: usize,
}

impl<'a> BalanceModelBuilder<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self { settings }
    }

    pub fn build(&self, snapshot: &ClusterSnapshot) -> ModelResult<BalanceModel> {
        self.settings.validate()?;
        validate_snapshot(snapshot)?;

        let node_count = snapshot.nodes.len();
        let (fault_domains, fd_indices) =
            classify_domains(&snapshot.nodes, |node| split_domain_path(&node.fault_domain));
        let (upgrade_domains, ud_indices) =
            classify_domains(&snapshot.nodes, |node| upgrade_domain_path(&node.upgrade_domain));

        let global_metrics = self.global_metrics(snapshot);
        let global_metric_indices: HashMap<String, usize> = global_metrics
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (name.clone(), i))
            .collect();

        let mut nodes: Vec<NodeEntry> = snapshot
            .nodes
            .iter()
            .enumerate()
            .map(|(index, node)| {
                self.node_entry(
                    index,
                    node,
                    &global_metrics,
                    fd_indices[index].clone(),
                    ud_indices[index].clone(),
                    &snapshot.upgrade_completed_uds,
                )
            })
            .collect();

        // Local domains.
        let mut domains = Vec::new();
        let mut local_starts: HashMap<usize, usize> = HashMap::new();
        let mut next_index = 0;
        for (service_index, service) in snapshot.services.iter().enumerate() {
            if service.is_singleton {
                continue;
            }
            let weight_sum: f64 = service.metrics.iter().map(|m| m.weight).sum();
            if weight_sum <= 0.0 {
                continue;
            }

            let blocked = blocked_bitset(service, node_count);
            let mut metrics = Vec::with_capacity(service.metrics.len());
            for (i, service_metric) in service.metrics.iter().enumerate() {
                let balancing_threshold = self
                    .settings
                    .metric_balancing_thresholds
                    .get(&service_metric.name)
                    .copied()
                    .unwrap_or(self.settings.local_balancing_threshold);
                metrics.push(self.metric(
                    MetricSlot {
                        name: &service_metric.name,
                        weight: service_metric.weight,
                        balancing_threshold,
                        blocked: blocked.clone(),
                        index_in_domain: i,
                        total_index: next_index + i,
                        index_in_global_domain: global_metric_indices[&service_metric.name],
                    },
                    &nodes,
                )?);
            }

            debug!(
                service = %service.name,
                metrics = metrics.len(),
                start = next_index,
                "local balancing domain"
            );
            local_starts.insert(service_index, next_index);
            next_index += metrics.len();
            domains.push(LoadBalancingDomain {
                metrics,
                metric_weight_sum: weight_sum,
                metric_start_index: local_starts[&service_index],
                service_index: Some(service_index),
            });
        }

        // Global domain, always last.
        let global_start = next_index;
        let mut global = Vec::with_capacity(global_metrics.len());
        for (g, (name, weight)) in global_metrics.iter().enumerate() {
            global.push(self.metric(
                MetricSlot {
                    name,
                    weight: *weight,
                    balancing_threshold: self.settings.balancing_threshold(name),
                    blocked: vec![false; node_count],
                    index_in_domain: g,
                    total_index: global_start + g,
                    index_in_global_domain: g,
                },
                &nodes,
            )?);
        }
        domains.push(LoadBalancingDomain {
            metric_weight_sum: global.iter().map(|m| m.weight).sum(),
            metrics: global,
            metric_start_index: global_start,
            service_index: None,
        });

        let total_metric_count = global_start + global_metrics.len();
        let total_replica_count = flatten_loads(
            snapshot,
            &mut nodes,
            &local_starts,
            &global_metric_indices,
            global_start,
            total_metric_count,
        );

        let mut metric_locations = Vec::with_capacity(total_metric_count);
        for (d, domain) in domains.iter_mut().enumerate() {
            for (m, metric) in domain.metrics.iter_mut().enumerate() {
                metric.cluster_load = nodes
                    .iter()
                    .filter(|n| n.is_up && metric.is_valid_node(n.index))
                    .map(|n| n.load(metric.total_index))
                    .sum();
                metric_locations.push((d, m));
            }
        }

        let mut down_nodes = Vec::new();
        let mut deactivated_placement_allowed_nodes = Vec::new();
        let mut deactivated_every_node_allowed_nodes = Vec::new();
        let mut deactivated_nodes = Vec::new();
        for node in &nodes {
            if !node.is_up {
                down_nodes.push(node.index);
                continue;
            }
            match node.deactivation {
                DeactivationState::Active => {}
                DeactivationState::PlacementAllowed => deactivated_placement_allowed_nodes.push(node.index),
                DeactivationState::EveryNodeServiceAllowed => {
                    deactivated_every_node_allowed_nodes.push(node.index)
                }
                DeactivationState::Deactivated => deactivated_nodes.push(node.index),
            }
        }

        let metrics: Vec<&Metric> = domains.iter().flat_map(|d| d.metrics.iter()).collect();
        let exist_defrag_metric = metrics.iter().any(|m| m.is_defrag);
        let exist_scoped_defrag_metric = metrics.iter().any(|m| m.is_scoped_defrag());

        info!(
            nodes = node_count,
            down = down_nodes.len(),
            local_domains = domains.len() - 1,
            global_metrics = global_metrics.len(),
            replicas = total_replica_count,
            fault_domain_tree = fault_domains.is_some(),
            upgrade_domain_tree = upgrade_domains.is_some(),
            "balance model built"
        );

        Ok(BalanceModel {
            nodes,
            domains,
            fault_domains,
            upgrade_domains,
            total_metric_count,
            global_metric_count: global_metrics.len(),
            total_replica_count,
            exist_defrag_metric,
            exist_scoped_defrag_metric,
            down_nodes,
            deactivated_placement_allowed_nodes,
            deactivated_every_node_allowed_nodes,
            deactivated_nodes,
            metric_locations,
            global_metric_indices,
        })
    }

    /// Every metric known to the cluster, in name order, with its weight.
    fn global_metrics(&self, snapshot: &ClusterSnapshot) -> Vec<(String, f64)> {
        let mut observed: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
        for metric in snapshot.services.iter().flat_map(|s| &s.metrics) {
            let entry = observed.entry(&metric.name).or_insert((0.0, 0));
            entry.0 += metric.weight;
            entry.1 += 1;
        }

        let mut averages: BTreeMap<String, f64> = observed
            .into_iter()
            .map(|(name, (sum, count))| (name.to_string(), sum / count as f64))
            .collect();
        for metric in &snapshot.domain_metrics {
            averages.insert(metric.name.clone(), metric.average_weight);
        }

        averages
            .into_iter()
            .map(|(name, average)| {
                let weight = self
                    .settings
                    .global_metric_weights
                    .get(&name)
                    .copied()
                    .unwrap_or(average);
                (name, weight)
            })
            .collect()
    }

    fn node_entry(
        &self,
        index: usize,
        node: &NodeDescription,
        global_metrics: &[(String, f64)],
        fault_domain_index: Option<TreeNodeIndex>,
        upgrade_domain_index: Option<TreeNodeIndex>,
        upgrade_completed_uds: &BTreeSet<String>,
    ) -> NodeEntry {
        let mut total_capacities = Vec::with_capacity(global_metrics.len());
        let mut buffered_capacities = Vec::with_capacity(global_metrics.len());
        let mut capacity_ratios = Vec::with_capacity(global_metrics.len());
        for (name, _) in global_metrics {
            let capacity = node.capacities.get(name).copied().unwrap_or(-1);
            let buffered = if capacity >= 0 {
                let free = 1.0 - self.settings.node_buffer_percentage(name);
                (capacity as f64 * free) as i64
            } else {
                -1
            };
            total_capacities.push(capacity);
            buffered_capacities.push(buffered);
            capacity_ratios.push(node.capacity_ratios.get(name).copied().unwrap_or(1).max(1));
        }

        NodeEntry {
            node_id: node.node_id.clone(),
            index,
            node_type: node.node_type_name().map(str::to_string),
            is_up: node.is_up,
            deactivation: node.deactivation,
            loads: LoadEntry::default(),
            should_disappear_loads: LoadEntry::default(),
            total_capacities,
            buffered_capacities,
            capacity_ratios,
            fault_domain_index,
            upgrade_domain_index,
            is_valid: node.is_up
                && matches!(
                    node.deactivation,
                    DeactivationState::Active | DeactivationState::PlacementAllowed
                ),
            in_upgraded_ud: upgrade_completed_uds.contains(&node.upgrade_domain),
        }
    }

    fn metric(&self, slot: MetricSlot<'_>, nodes: &[NodeEntry]) -> ModelResult<Metric> {
        let settings = self.settings;
        let name = slot.name;
        let g = slot.index_in_global_domain;

        let available: Vec<&NodeEntry> = nodes
            .iter()
            .filter(|n| n.is_valid && !slot.blocked[n.index])
            .collect();
        let counted = nodes.iter().filter(|n| n.is_up && !slot.blocked[n.index]);
        let (mut cluster_total_capacity, mut cluster_buffered_capacity) = (0, 0);
        for node in counted {
            if node.total_capacities[g] >= 0 {
                cluster_total_capacity += node.total_capacities[g];
                cluster_buffered_capacity += node.buffered_capacities[g];
            }
        }

        let max_capacity = available
            .iter()
            .map(|n| n.total_capacities[g])
            .filter(|&c| c >= 0)
            .max();
        let reservation_load = match settings.reserved_load_per_node.get(name) {
            Some(&load) if load < 0 => {
                return Err(ModelError::NegativeReservation {
                    metric: name.to_string(),
                    load,
                });
            }
            Some(&load) => load,
            None => match (settings.metric_empty_node_thresholds.get(name), max_capacity) {
                (Some(&threshold), Some(capacity)) => capacity - threshold,
                (None, Some(capacity)) => capacity,
                (_, None) => 0,
            },
        }
        .max(0);

        let is_defrag = settings.is_defragmentation_metric(name);
        let scoped_defrag = settings.is_scoped_defragmentation_enabled(name);
        let defrag_empty_node_count =
            defrag_empty_node_count(settings, name, is_defrag && scoped_defrag, available.len());

        let metric = Metric {
            name: name.to_string(),
            weight: slot.weight,
            balancing_threshold: slot.balancing_threshold,
            activity_threshold: settings.activity_threshold(name),
            cluster_total_capacity,
            cluster_buffered_capacity,
            cluster_load: 0,
            blocked_nodes: slot.blocked,
            is_defrag,
            scoped_defrag,
            defrag_empty_node_count,
            reservation_load,
            defrag_distribution: settings.defrag_distribution(name),
            placement_strategy: settings.effective_placement_strategy(name),
            empty_node_weight: settings.empty_node_weight(name),
            non_empty_node_weight: settings.non_empty_node_weight(name),
            balancing_by_percentage: settings.balancing_by_percentage(name),
            index_in_domain: slot.index_in_domain,
            total_index: slot.total_index,
            index_in_global_domain: g,
            is_balanced: false,
        };
        metric.check_invariants();
        Ok(metric)
    }
}

fn defrag_empty_node_count(settings: &Settings, metric: &str, scoped: bool, available: usize) -> i64 {
    let count = match settings.defragmentation_empty_node_targets.get(metric) {
        Some(&value) if value >= 1.0 => value.floor() as i64,
        Some(&fraction) => (fraction * available as f64).ceil() as i64,
        None if scoped => 0,
        None => -1,
    };
    if count > available as i64 {
        warn!(
            metric,
            requested = count,
            available,
            "defrag empty node target exceeds available nodes, clamping"
        );
        available as i64
    } else {
        count
    }
}

fn validate_snapshot(snapshot: &ClusterSnapshot) -> ModelResult<()> {
    let node_count = snapshot.nodes.len();
    for service in &snapshot.services {
        let mut seen = HashSet::new();
        for metric in &service.metrics {
            if !seen.insert(metric.name.as_str()) {
                return Err(ModelError::DuplicateMetric {
                    service: service.name.clone(),
                    metric: metric.name.clone(),
                });
            }
        }

        let out_of_bounds = |node: usize| ModelError::NodeIndexOutOfBounds {
            service: service.name.clone(),
            node,
            node_count,
        };
        if let Some(&node) = service.blocked_nodes.iter().find(|&&n| n >= node_count) {
            return Err(out_of_bounds(node));
        }
        for replica in &service.replicas {
            if replica.node_index >= node_count {
                return Err(out_of_bounds(replica.node_index));
            }
            if replica.loads.len() != service.metrics.len() {
                return Err(ModelError::LoadCountMismatch {
                    service: service.name.clone(),
                    node: replica.node_index,
                    expected: service.metrics.len(),
                    actual: replica.loads.len(),
                });
            }
        }
    }
    Ok(())
}

fn blocked_bitset(service: &ServiceDescription, node_count: usize) -> Vec<bool> {
    let mut blocked = vec![false; node_count];
    for &node in &service.blocked_nodes {
        blocked[node] = true;
    }
    blocked
}

fn upgrade_domain_path(upgrade_domain: &str) -> Vec<String> {
    if upgrade_domain.is_empty() {
        Vec::new()
    } else {
        vec![upgrade_domain.to_string()]
    }
}

/// Build a domain tree over up nodes. Returns `None` when the up nodes do
/// not span more than one top-level domain.
fn classify_domains(
    nodes: &[NodeDescription],
    path_of: impl Fn(&NodeDescription) -> Vec<String>,
) -> (Option<DomainTree<DomainData>>, Vec<Option<TreeNodeIndex>>) {
    let up: Vec<(usize, Vec<String>)> = nodes
        .iter()
        .enumerate()
        .filter(|(_, node)| node.is_up)
        .map(|(i, node)| (i, path_of(node)))
        .collect();

    let mut indices = vec![None; nodes.len()];
    let top_level: HashSet<Option<&str>> = up
        .iter()
        .map(|(_, path)| path.first().map(String::as_str))
        .collect();
    if top_level.len() <= 1 {
        return (None, indices);
    }

    let paths: Vec<Vec<String>> = up.iter().map(|(_, path)| path.clone()).collect();
    let (tree, tree_indices) = DomainTree::from_paths(&paths);
    for ((node, _), index) in up.iter().zip(tree_indices) {
        indices[*node] = Some(index);
    }
    (Some(tree), indices)
}

/// Sum replica loads into the per-node entries. Returns the replica count.
fn flatten_loads(
    snapshot: &ClusterSnapshot,
    nodes: &mut [NodeEntry],
    local_starts: &HashMap<usize, usize>,
    global_metric_indices: &HashMap<String, usize>,
    global_start: usize,
    total_metric_count: usize,
) -> usize {
    for node in nodes.iter_mut() {
        node.loads = LoadEntry::zeros(total_metric_count);
        node.should_disappear_loads = LoadEntry::zeros(total_metric_count);
    }

    let mut replica_count = 0;
    for (service_index, service) in snapshot.services.iter().enumerate() {
        let local_start = local_starts.get(&service_index).copied();
        for replica in &service.replicas {
            replica_count += 1;
            let node = &mut nodes[replica.node_index];
            let entry = if replica.should_disappear {
                &mut node.should_disappear_loads
            } else {
                &mut node.loads
            };
            for (i, (metric, &load)) in service.metrics.iter().zip(&replica.loads).enumerate() {
                entry.add(global_start + global_metric_indices[&metric.name], load);
                if let Some(start) = local_start {
                    entry.add(start + i, load);
                }
            }
        }
    }
    replica_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlacementStrategy;
    use crate::snapshot::DomainMetric;

    fn three_nodes() -> Vec<NodeDescription> {
        vec![
            NodeDescription::new("n0", "fd:/dc1/r1", "ud0").with_capacity("Memory", 100),
            NodeDescription::new("n1", "fd:/dc1/r2", "ud1").with_capacity("Memory", 200),
            NodeDescription::new("n2", "fd:/dc2/r1", "ud2").with_capacity("Memory", 100),
        ]
    }

    fn snapshot() -> ClusterSnapshot {
        ClusterSnapshot {
            nodes: three_nodes(),
            services: vec![
                ServiceDescription::new("web", &[("Memory", 1.0), ("Cpu", 3.0)])
                    .with_replica(0, &[10, 1])
                    .with_replica(1, &[20, 2]),
                ServiceDescription::new("db", &[("Memory", 2.0)]).with_replica(2, &[40]),
            ],
            ..Default::default()
        }
    }

    fn build(settings: &Settings, snapshot: &ClusterSnapshot) -> BalanceModel {
        BalanceModelBuilder::new(settings).build(snapshot).unwrap()
    }

    #[test]
    fn lays_out_local_metrics_before_global() {
        let model = build(&Settings::default(), &snapshot());

        assert_eq!(model.domains.len(), 3);
        assert_eq!(model.total_metric_count, 5);
        assert_eq!(model.global_metric_count, 2);
        assert_eq!(model.total_replica_count, 3);
        assert_eq!(model.global_domain().metric_start_index, 3);
        assert!(model.global_domain().is_global());

        // Global metrics are ordered by name.
        assert_eq!(model.global_domain().metrics[0].name, "Cpu");
        assert_eq!(model.global_domain().metrics[1].name, "Memory");
        assert_eq!(model.metric_by_total_index(1).name, "Cpu");
        assert_eq!(model.metric_by_total_index(1).index_in_global_domain, 0);
        assert_eq!(model.global_total_index("Memory"), Some(4));
    }

    #[test]
    fn flattens_loads_into_local_and_global_slots() {
        let model = build(&Settings::default(), &snapshot());
        assert_eq!(model.nodes[0].loads.values(), &[10, 1, 0, 1, 10]);
        assert_eq!(model.nodes[2].loads.values(), &[0, 0, 40, 0, 40]);
        assert_eq!(model.global_domain().metrics[1].cluster_load, 70);
    }

    #[test]
    fn global_weight_defaults_to_average() {
        let mut settings = Settings::default();
        settings.global_metric_weights.insert("Cpu".to_string(), 0.5);
        let model = build(&settings, &snapshot());

        let global = model.global_domain();
        assert_eq!(global.metric("Cpu").unwrap().weight, 0.5);
        assert_eq!(global.metric("Memory").unwrap().weight, 1.5);
        assert_eq!(global.metric_weight_sum, 2.0);
    }

    #[test]
    fn domain_metrics_join_the_global_domain() {
        let mut snapshot = snapshot();
        snapshot.domain_metrics.push(DomainMetric {
            name: "Disk".to_string(),
            average_weight: 0.2,
        });
        let model = build(&Settings::default(), &snapshot);
        assert_eq!(model.global_metric_count, 3);
        assert_eq!(model.global_domain().metrics[1].name, "Disk");
        assert_eq!(model.nodes[0].total_capacities[1], -1);
    }

    #[test]
    fn skips_singletons_and_weightless_services() {
        let mut snapshot = snapshot();
        snapshot.services[0].is_singleton = true;
        snapshot.services.push(ServiceDescription::new("idle", &[("Memory", 0.0)]));
        let model = build(&Settings::default(), &snapshot);
        assert_eq!(model.local_domains().len(), 1);
        assert_eq!(model.local_domains()[0].service_index, Some(1));
    }

    #[test]
    fn reservation_load_policies() {
        let mut settings = Settings::default();
        let model = build(&settings, &snapshot());
        assert_eq!(model.global_domain().metric("Memory").unwrap().reservation_load, 200);
        assert_eq!(model.global_domain().metric("Cpu").unwrap().reservation_load, 0);

        settings.metric_empty_node_thresholds.insert("Memory".to_string(), 50);
        let model = build(&settings, &snapshot());
        assert_eq!(model.global_domain().metric("Memory").unwrap().reservation_load, 150);

        settings.reserved_load_per_node.insert("Memory".to_string(), 80);
        let model = build(&settings, &snapshot());
        assert_eq!(model.global_domain().metric("Memory").unwrap().reservation_load, 80);
    }

    #[test]
    fn negative_reservation_is_rejected() {
        let mut settings = Settings::default();
        settings.reserved_load_per_node.insert("Memory".to_string(), -1);
        let err = BalanceModelBuilder::new(&settings).build(&snapshot()).unwrap_err();
        assert!(matches!(err, ModelError::NegativeReservation { load: -1, .. }));
    }

    #[test]
    fn defrag_target_fraction_and_clamp() {
        let mut settings = Settings::default();
        settings
            .placement_strategy
            .insert("Memory".to_string(), PlacementStrategy::Reservation);
        let model = build(&settings, &snapshot());
        assert_eq!(model.global_domain().metric("Memory").unwrap().defrag_empty_node_count, 0);
        assert_eq!(model.global_domain().metric("Cpu").unwrap().defrag_empty_node_count, -1);
        assert!(model.exist_scoped_defrag_metric);

        settings
            .defragmentation_empty_node_targets
            .insert("Memory".to_string(), 0.5);
        let model = build(&settings, &snapshot());
        assert_eq!(model.global_domain().metric("Memory").unwrap().defrag_empty_node_count, 2);

        settings
            .defragmentation_empty_node_targets
            .insert("Memory".to_string(), 7.0);
        let model = build(&settings, &snapshot());
        assert_eq!(model.global_domain().metric("Memory").unwrap().defrag_empty_node_count, 3);
    }

    #[test]
    fn buffered_capacity_and_ratio() {
        let mut settings = Settings::default();
        settings.node_buffer_percentage.insert("Memory".to_string(), 0.25);
        let mut snapshot = snapshot();
        snapshot.nodes[1].capacity_ratios.insert("Memory".to_string(), 2);
        let model = build(&settings, &snapshot);

        let memory = model.global_metric_index("Memory").unwrap();
        assert_eq!(model.nodes[1].total_capacities[memory], 200);
        assert_eq!(model.nodes[1].buffered_capacities[memory], 150);
        assert_eq!(model.nodes[1].capacity_ratios[memory], 2);
        assert_eq!(model.nodes[0].capacity_ratios[memory], 1);
        assert_eq!(model.global_domain().metric("Memory").unwrap().cluster_buffered_capacity, 300);
    }

    #[test]
    fn classifies_node_states() {
        let mut snapshot = snapshot();
        snapshot.nodes.push(NodeDescription::new("n3", "fd:/dc2/r2", "ud3").down());
        snapshot.nodes[0].deactivation = DeactivationState::PlacementAllowed;
        snapshot.nodes[1].deactivation = DeactivationState::Deactivated;
        snapshot.upgrade_completed_uds.insert("ud2".to_string());
        let model = build(&Settings::default(), &snapshot);

        assert_eq!(model.down_nodes, vec![3]);
        assert_eq!(model.deactivated_placement_allowed_nodes, vec![0]);
        assert!(model.deactivated_every_node_allowed_nodes.is_empty());
        assert_eq!(model.deactivated_nodes, vec![1]);
        assert!(model.nodes[0].is_valid);
        assert!(!model.nodes[1].is_valid);
        assert!(model.nodes[2].in_upgraded_ud);
        assert!(model.nodes[3].fault_domain_index.is_none());
    }

    #[test]
    fn single_top_level_domain_builds_no_tree() {
        let mut snapshot = snapshot();
        for node in &mut snapshot.nodes {
            node.fault_domain = "fd:/dc1".to_string();
        }
        let model = build(&Settings::default(), &snapshot);
        assert!(model.fault_domains.is_none());
        assert!(model.upgrade_domains.is_some());
        assert!(model.nodes.iter().all(|n| n.fault_domain_index.is_none()));
    }

    #[test]
    fn rejects_inconsistent_replicas() {
        let mut bad = snapshot();
        bad.services[0].replicas[0].loads.pop();
        let err = BalanceModelBuilder::new(&Settings::default()).build(&bad).unwrap_err();
        assert!(matches!(err, ModelError::LoadCountMismatch { expected: 2, actual: 1, .. }));

        let mut bad = snapshot();
        bad.services[1].replicas[0].node_index = 9;
        let err = BalanceModelBuilder::new(&Settings::default()).build(&bad).unwrap_err();
        assert!(matches!(err, ModelError::NodeIndexOutOfBounds { node: 9, .. }));
    }

    #[test]
    fn blocked_nodes_are_excluded_from_cluster_totals() {
        let mut snapshot = snapshot();
        snapshot.services[1].blocked_nodes = vec![1];
        let model = build(&Settings::default(), &snapshot);
        let db = &model.local_domains()[1].metrics[0];
        assert!(!db.is_valid_node(1));
        assert_eq!(db.cluster_total_capacity, 200);
    }

    #[test]
    fn cpu_activity_threshold_is_scaled() {
        let mut settings = Settings::default();
        settings
            .metric_activity_thresholds
            .insert(crate::config::CPU_CORES_METRIC.to_string(), 2);
        let snapshot = ClusterSnapshot {
            nodes: three_nodes(),
            services: vec![ServiceDescription::new("svc", &[(crate::config::CPU_CORES_METRIC, 1.0)])],
            ..Default::default()
        };
        let model = build(&settings, &snapshot);
        assert_eq!(model.global_domain().metrics[0].activity_threshold, 20_000);
    }
}
