//! Incremental candidate selection for scoped defragmentation.
//!
//! `DynamicNodeLoadSet` keeps, for every scoped defrag metric, the nodes
//! ordered by how much of the reserved load they currently occupy (the
//! "load fraction"). Two synthetic orders rank nodes by move cost and by
//! overlapping load across all scoped metrics. Candidate queries walk an
//! order and pick the emptiest nodes, preferring nodes whose fault and
//! upgrade domains have not contributed a node yet.
//!
//! Selection results are memoized as version marks: a node is beneficial
//! for a metric when its mark equals the current version, so advancing the
//! version invalidates every mark at once.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::debug;

use crate::builder::BalanceModel;
use crate::config::DefragDistribution;
use crate::domain_tree::TreeNodeIndex;
use crate::load::LoadEntry;

/// Last usable version before marks are cleared.
pub const MAX_VERSION: u32 = i32::MAX as u32 - 1;

const EPSILON: f64 = 1e-9;

/// Accepts a node given whether its fault and upgrade domains are unused.
type DomainPass = fn(bool, bool) -> bool;

const SPREAD_PASSES: [DomainPass; 3] = [both_unused, either_unused, any_node];
const COUNT_ONLY_PASSES: [DomainPass; 1] = [any_node];

fn both_unused(fd: bool, ud: bool) -> bool {
    fd && ud
}

fn either_unused(fd: bool, ud: bool) -> bool {
    fd || ud
}

fn any_node(_: bool, _: bool) -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// Position of a node inside one order. Unavailable nodes sort last.
#[derive(Debug, Clone, Copy)]
struct CandidateKey {
    unavailable: bool,
    key: f64,
    node: usize,
}

impl Ord for CandidateKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.unavailable
            .cmp(&other.unavailable)
            .then_with(|| self.key.total_cmp(&other.key))
            .then_with(|| self.node.cmp(&other.node))
    }
}

impl PartialOrd for CandidateKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for CandidateKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CandidateKey {}

#[derive(Debug, Clone)]
enum OrderKind {
    Metric {
        total_index: usize,
        reservation_load: i64,
        /// Node capacity for the metric; `-1` when unlimited.
        capacities: Vec<i64>,
        blocked: Vec<bool>,
    },
    MoveCost,
    Overlapping,
}

#[derive(Debug, Clone)]
struct CandidateOrder {
    kind: OrderKind,
    entries: BTreeSet<CandidateKey>,
    /// Key currently stored in `entries`, per node.
    keys: Vec<CandidateKey>,
    beneficial: Vec<u32>,
    fd_used: HashMap<TreeNodeIndex, u32>,
    ud_used: HashMap<TreeNodeIndex, u32>,
}

impl CandidateOrder {
    fn new(kind: OrderKind, node_count: usize) -> Self {
        Self {
            kind,
            entries: BTreeSet::new(),
            keys: Vec::with_capacity(node_count),
            beneficial: vec![0; node_count],
            fd_used: HashMap::new(),
            ud_used: HashMap::new(),
        }
    }

    fn clear_marks(&mut self) {
        self.beneficial.iter_mut().for_each(|mark| *mark = 0);
        self.fd_used.clear();
        self.ud_used.clear();
    }
}

/// Share of the reserved load a node occupies, in `[0, 1]`.
///
/// The reservation sits at the top of the node: only load above
/// `capacity − reservation` eats into it.
pub fn load_fraction(load: i64, capacity: i64, reservation: i64) -> f64 {
    if reservation <= 0 {
        return if load <= 0 { 0.0 } else { 1.0 };
    }
    let capacity = if capacity < 0 { reservation } else { capacity };
    let occupied = (load - (capacity - reservation)).clamp(0, reservation);
    occupied as f64 / reservation as f64
}

#[derive(Debug, Clone)]
pub struct DynamicNodeLoadSet {
    node_count: usize,
    total_metric_count: usize,
    overlapping: bool,
    loads: Vec<LoadEntry>,
    backup_loads: Vec<LoadEntry>,
    overlapping_loads: Vec<f64>,
    move_costs: Vec<i64>,
    is_up: Vec<bool>,
    is_available: Vec<bool>,
    fault_domains: Vec<Option<TreeNodeIndex>>,
    upgrade_domains: Vec<Option<TreeNodeIndex>>,
    orders: Vec<CandidateOrder>,
    /// Total metric index → order position.
    metric_orders: HashMap<usize, usize>,
    move_cost_order: usize,
    overlapping_order: usize,
    version: u32,
    version_limit: u32,
}

impl DynamicNodeLoadSet {
    /// Track every scoped defrag metric of `model`. With `overlapping`,
    /// candidate walks rank nodes by their combined emptiness across all
    /// scoped metrics.
    pub fn new(model: &BalanceModel, overlapping: bool) -> Self {
        let node_count = model.nodes.len();
        let mut orders = Vec::new();
        let mut metric_orders = HashMap::new();

        for total_index in model.scoped_defrag_metric_indices() {
            let metric = model.metric_by_total_index(total_index);
            let capacities = (0..node_count)
                .map(|node| model.node_capacity(node, total_index))
                .collect();
            metric_orders.insert(total_index, orders.len());
            orders.push(CandidateOrder::new(
                OrderKind::Metric {
                    total_index,
                    reservation_load: metric.reservation_load,
                    capacities,
                    blocked: metric.blocked_nodes.clone(),
                },
                node_count,
            ));
        }
        let move_cost_order = orders.len();
        orders.push(CandidateOrder::new(OrderKind::MoveCost, node_count));
        let overlapping_order = orders.len();
        orders.push(CandidateOrder::new(OrderKind::Overlapping, node_count));

        let loads: Vec<LoadEntry> = model.nodes.iter().map(|n| n.loads.clone()).collect();
        let mut set = Self {
            node_count,
            total_metric_count: model.total_metric_count,
            overlapping,
            backup_loads: loads.clone(),
            loads,
            overlapping_loads: vec![0.0; node_count],
            move_costs: vec![0; node_count],
            is_up: model.nodes.iter().map(|n| n.is_up).collect(),
            is_available: model.nodes.iter().map(|n| n.is_valid).collect(),
            fault_domains: model.nodes.iter().map(|n| n.fault_domain_index.clone()).collect(),
            upgrade_domains: model.nodes.iter().map(|n| n.upgrade_domain_index.clone()).collect(),
            orders,
            metric_orders,
            move_cost_order,
            overlapping_order,
            version: 1,
            version_limit: MAX_VERSION,
        };
        set.rebuild_orders();

        debug!(
            nodes = node_count,
            scoped_metrics = set.metric_orders.len(),
            overlapping,
            "dynamic node load set created"
        );
        set
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn node_load(&self, node: usize, metric_index: usize) -> i64 {
        self.loads[node].get(metric_index)
    }

    pub fn move_cost(&self, node: usize) -> i64 {
        self.move_costs[node]
    }

    pub fn overlapping_load(&self, node: usize) -> f64 {
        self.overlapping_loads[node]
    }

    /// Whether `metric_index` has its own candidate order.
    pub fn tracks_metric(&self, metric_index: usize) -> bool {
        self.metric_orders.contains_key(&metric_index)
    }

    /// Load fraction of `node` for a scoped defrag metric.
    pub fn load_fraction(&self, node: usize, metric_index: usize) -> f64 {
        self.fraction_in(self.metric_order(metric_index), node)
    }

    /// Number of entries in the candidate order of `metric_index`.
    pub fn candidate_count(&self, metric_index: usize) -> usize {
        self.orders[self.metric_order(metric_index)].entries.len()
    }

    // ── Updates ────────────────────────────────────────────────────

    pub fn update_node_load(&mut self, node: usize, new_load: i64, metric_index: usize) {
        assert!(
            metric_index < self.total_metric_count,
            "metric index {metric_index} out of range ({} metrics)",
            self.total_metric_count
        );
        let mut affected = Vec::with_capacity(2);
        if let Some(&order) = self.metric_orders.get(&metric_index) {
            affected.push(order);
            if self.overlapping {
                affected.push(self.overlapping_order);
            }
        }
        self.update_and_reorder(node, &affected, |set| {
            set.loads[node].set(metric_index, new_load);
            if set.overlapping {
                set.overlapping_loads[node] = set.compute_overlapping_load(node);
            }
        });
    }

    pub fn update_move_cost(&mut self, node: usize, cost: i64) {
        let affected = [self.move_cost_order];
        self.update_and_reorder(node, &affected, |set| set.move_costs[node] = cost);
    }

    /// Restore the loads the set was created with, zero move costs and
    /// rebuild every order.
    pub fn reset_loads(&mut self) {
        self.loads.clone_from(&self.backup_loads);
        self.move_costs.iter_mut().for_each(|cost| *cost = 0);
        self.rebuild_orders();
        self.advance_version();
    }

    /// Erase `node` from `affected`, apply `mutate`, then reinsert it with
    /// its new key.
    fn update_and_reorder(&mut self, node: usize, affected: &[usize], mutate: impl FnOnce(&mut Self)) {
        for &order in affected {
            let key = self.orders[order].keys[node];
            assert!(
                self.orders[order].entries.remove(&key),
                "node {node} missing from candidate order {order}"
            );
        }

        mutate(self);

        for &order in affected {
            let key = self.candidate_key(order, node);
            self.orders[order].keys[node] = key;
            assert!(
                self.orders[order].entries.insert(key),
                "node {node} duplicated in candidate order {order}"
            );
            assert_eq!(
                self.orders[order].entries.len(),
                self.node_count,
                "candidate order {order} lost entries"
            );
        }
    }

    fn rebuild_orders(&mut self) {
        for node in 0..self.node_count {
            self.overlapping_loads[node] = if self.overlapping {
                self.compute_overlapping_load(node)
            } else {
                0.0
            };
        }
        for order in 0..self.orders.len() {
            let keys: Vec<CandidateKey> = (0..self.node_count)
                .map(|node| self.candidate_key(order, node))
                .collect();
            let candidate_order = &mut self.orders[order];
            candidate_order.entries = keys.iter().copied().collect();
            candidate_order.keys = keys;
            assert_eq!(candidate_order.entries.len(), self.node_count);
        }
    }

    fn candidate_key(&self, order: usize, node: usize) -> CandidateKey {
        let unavailable = !self.is_available[node];
        match &self.orders[order].kind {
            OrderKind::Metric { blocked, .. } => CandidateKey {
                unavailable: unavailable || blocked[node],
                key: self.fraction_in(order, node),
                node,
            },
            OrderKind::MoveCost => CandidateKey {
                unavailable,
                key: self.move_costs[node] as f64,
                node,
            },
            OrderKind::Overlapping => CandidateKey {
                unavailable,
                key: self.overlapping_loads[node],
                node,
            },
        }
    }

    fn fraction_in(&self, order: usize, node: usize) -> f64 {
        match &self.orders[order].kind {
            OrderKind::Metric {
                total_index,
                reservation_load,
                capacities,
                ..
            } => load_fraction(
                self.loads[node].get(*total_index),
                capacities[node],
                *reservation_load,
            ),
            OrderKind::MoveCost | OrderKind::Overlapping => 0.0,
        }
    }

    fn is_blocked(&self, order: usize, node: usize) -> bool {
        match &self.orders[order].kind {
            OrderKind::Metric { blocked, .. } => blocked[node],
            OrderKind::MoveCost | OrderKind::Overlapping => false,
        }
    }

    fn compute_overlapping_load(&self, node: usize) -> f64 {
        (0..self.move_cost_order)
            .map(|order| self.fraction_in(order, node).powi(2))
            .sum()
    }

    fn metric_order(&self, metric_index: usize) -> usize {
        match self.metric_orders.get(&metric_index) {
            Some(&order) => order,
            None => panic!("metric index {metric_index} is not a scoped defrag metric"),
        }
    }

    // ── Versions ───────────────────────────────────────────────────

    /// Invalidate every beneficial and domain mark.
    pub fn advance_version(&mut self) {
        if self.version >= self.version_limit {
            debug!(version = self.version, "candidate version limit reached, clearing marks");
            for order in &mut self.orders {
                order.clear_marks();
            }
            self.version = 0;
        }
        self.version += 1;
    }

    #[cfg(test)]
    pub(crate) fn set_version_limit(&mut self, limit: u32) {
        self.version_limit = limit;
    }

    // ── Candidate queries ──────────────────────────────────────────

    /// Visit up to `target` of the emptiest available nodes for
    /// `metric_index` with their load fraction, then mark them beneficial.
    ///
    /// Unless `marking_only`, the version is advanced first so earlier
    /// marks do not count. In marking-only mode nodes already marked at the
    /// current version count towards `target`.
    pub fn for_each_candidate_node(
        &mut self,
        metric_index: usize,
        target: usize,
        distribution: DefragDistribution,
        mut visitor: impl FnMut(usize, f64),
        marking_only: bool,
    ) {
        let mark = self.metric_order(metric_index);
        if !marking_only {
            self.advance_version();
        }
        let walk = if self.overlapping { self.overlapping_order } else { mark };
        let selected = self.select(walk, mark, target, distribution, marking_only);
        for &node in &selected {
            visitor(node, self.fraction_in(mark, node));
        }
        self.mark_selected(mark, &selected);
    }

    /// Mark the `target` emptiest candidates for `metric_index` in
    /// marking-only mode.
    ///
    /// The version is not advanced, so marks from an earlier call at the same
    /// version still count. Call [`Self::advance_version`] after load updates
    /// before preparing again, otherwise the stale marks are kept.
    pub fn prepare_beneficial_nodes(&mut self, metric_index: usize, target: usize, distribution: DefragDistribution) {
        self.for_each_candidate_node(metric_index, target, distribution, |_, _| {}, true);
    }

    /// Move-cost counterpart of [`Self::prepare_beneficial_nodes`], with the
    /// same versioning rules.
    pub fn prepare_move_cost_beneficial_nodes(&mut self, target: usize, distribution: DefragDistribution) {
        let order = self.move_cost_order;
        let selected = self.select(order, order, target, distribution, true);
        self.mark_selected(order, &selected);
    }

    pub fn is_beneficial_node(&self, node: usize, metric_index: usize) -> bool {
        self.orders[self.metric_order(metric_index)].beneficial[node] == self.version
    }

    pub fn is_beneficial_node_by_move_cost(&self, node: usize) -> bool {
        self.orders[self.move_cost_order].beneficial[node] == self.version
    }

    /// Whether the `target` emptiest candidates are collectively empty
    /// enough to hold the reservation. Leaves every mark untouched.
    pub fn is_enough_load_reserved(&self, metric_index: usize, target: usize, distribution: DefragDistribution) -> bool {
        let mark = self.metric_order(metric_index);
        let walk = if self.overlapping { self.overlapping_order } else { mark };
        let free: f64 = self
            .select(walk, mark, target, distribution, false)
            .into_iter()
            .map(|node| (1.0 - self.fraction_in(mark, node)).powi(2))
            .sum();
        target as f64 - free <= EPSILON
    }

    /// Visit available nodes in load order for `metric_index`.
    pub fn for_each_node_ordered(&self, metric_index: usize, order: Order, mut visitor: impl FnMut(usize, i64)) {
        let entries = &self.orders[self.metric_order(metric_index)].entries;
        let mut visit = |key: &CandidateKey| {
            if !key.unavailable {
                visitor(key.node, self.loads[key.node].get(metric_index));
            }
        };
        match order {
            Order::Ascending => entries.iter().for_each(&mut visit),
            Order::Descending => entries.iter().rev().for_each(&mut visit),
        }
    }

    /// Pick up to `target` nodes from `walk` in three passes: both domains
    /// unused, either domain unused, anything. Count-only distribution goes
    /// straight to the last pass. Nodes blocked for the metric of `mark` are
    /// skipped whatever order is walked. When `seeded`, nodes and domains
    /// marked in `mark` at the current version are taken as already selected.
    fn select(
        &self,
        walk: usize,
        mark: usize,
        target: usize,
        distribution: DefragDistribution,
        seeded: bool,
    ) -> Vec<usize> {
        let mut visited = HashSet::new();
        let mut used_fds: HashSet<&TreeNodeIndex> = HashSet::new();
        let mut used_uds: HashSet<&TreeNodeIndex> = HashSet::new();
        let mut count = 0;

        if seeded {
            let marks = &self.orders[mark];
            for (node, &version) in marks.beneficial.iter().enumerate() {
                if version == self.version {
                    visited.insert(node);
                    count += 1;
                }
            }
            used_fds.extend(marks.fd_used.iter().filter(|(_, v)| **v == self.version).map(|(k, _)| k));
            used_uds.extend(marks.ud_used.iter().filter(|(_, v)| **v == self.version).map(|(k, _)| k));
        }

        let mut selected = Vec::new();
        if count >= target {
            return selected;
        }

        let passes: &[DomainPass] = match distribution {
            DefragDistribution::SpreadAcrossFdsUds => &SPREAD_PASSES,
            DefragDistribution::NumberOfEmptyNodes => &COUNT_ONLY_PASSES,
        };
        for pass in passes {
            for key in &self.orders[walk].entries {
                if key.unavailable {
                    break;
                }
                let node = key.node;
                if !self.is_up[node] || self.is_blocked(mark, node) || visited.contains(&node) {
                    continue;
                }
                let fd = self.fault_domains[node].as_ref();
                let ud = self.upgrade_domains[node].as_ref();
                let fd_unused = fd.is_none_or(|k| !used_fds.contains(k));
                let ud_unused = ud.is_none_or(|k| !used_uds.contains(k));
                if !pass(fd_unused, ud_unused) {
                    continue;
                }

                visited.insert(node);
                used_fds.extend(fd);
                used_uds.extend(ud);
                selected.push(node);
                count += 1;
                if count >= target {
                    return selected;
                }
            }
        }
        selected
    }

    fn mark_selected(&mut self, order: usize, selected: &[usize]) {
        let version = self.version;
        let marks = &mut self.orders[order];
        for &node in selected {
            marks.beneficial[node] = version;
            if let Some(fd) = &self.fault_domains[node] {
                marks.fd_used.insert(fd.clone(), version);
            }
            if let Some(ud) = &self.upgrade_domains[node] {
                marks.ud_used.insert(ud.clone(), version);
            }
        }
    }
}
