//! Cluster and workload snapshot types consumed by the builder.
//!
//! Snapshots are produced by the cluster layer and are already validated
//! for referential integrity there; the builder still rejects inconsistent
//! input instead of producing a half-initialized model.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// Node property holding the node type name (used for diagnostics only).
pub const NODE_TYPE_PROPERTY: &str = "NodeTypeName";

/// Deactivation state of a node as seen by the balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationState {
    #[default]
    Active,
    /// Deactivation in progress; new replicas may still be placed.
    PlacementAllowed,
    /// Deactivated, but services that run on every node may still be placed.
    EveryNodeServiceAllowed,
    Deactivated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeDescription {
    pub node_id: String,
    pub is_up: bool,
    #[serde(default)]
    pub deactivation: DeactivationState,
    /// Fault domain path, e.g. `fd:/dc1/rack2`.
    #[serde(default)]
    pub fault_domain: String,
    #[serde(default)]
    pub upgrade_domain: String,
    /// Metric name → capacity. Missing metrics have unlimited capacity.
    #[serde(default)]
    pub capacities: HashMap<String, i64>,
    /// Metric name → relative node size. Defaults to 1.
    #[serde(default)]
    pub capacity_ratios: HashMap<String, u32>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl NodeDescription {
    pub fn new(node_id: impl Into<String>, fault_domain: impl Into<String>, upgrade_domain: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            is_up: true,
            deactivation: DeactivationState::Active,
            fault_domain: fault_domain.into(),
            upgrade_domain: upgrade_domain.into(),
            capacities: HashMap::new(),
            capacity_ratios: HashMap::new(),
            properties: HashMap::new(),
        }
    }

    pub fn with_capacity(mut self, metric: &str, capacity: i64) -> Self {
        self.capacities.insert(metric.to_string(), capacity);
        self
    }

    pub fn down(mut self) -> Self {
        self.is_up = false;
        self
    }

    pub fn node_type_name(&self) -> Option<&str> {
        self.properties.get(NODE_TYPE_PROPERTY).map(String::as_str)
    }
}

/// A metric reported by a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceMetric {
    pub name: String,
    pub weight: f64,
}

/// Load of one replica on one node, one value per service metric.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicaLoad {
    pub node_index: usize,
    pub loads: Vec<i64>,
    /// The replica is being moved away or dropped.
    #[serde(default)]
    pub should_disappear: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceDescription {
    pub name: String,
    /// A single replica service; never gets its own balancing domain.
    #[serde(default)]
    pub is_singleton: bool,
    pub metrics: Vec<ServiceMetric>,
    /// Node indices this service may not use.
    #[serde(default)]
    pub blocked_nodes: Vec<usize>,
    #[serde(default)]
    pub replicas: Vec<ReplicaLoad>,
}

impl ServiceDescription {
    pub fn new(name: impl Into<String>, metrics: &[(&str, f64)]) -> Self {
        Self {
            name: name.into(),
            is_singleton: false,
            metrics: metrics
                .iter()
                .map(|(name, weight)| ServiceMetric {
                    name: name.to_string(),
                    weight: *weight,
                })
                .collect(),
            blocked_nodes: Vec::new(),
            replicas: Vec::new(),
        }
    }

    pub fn with_replica(mut self, node_index: usize, loads: &[i64]) -> Self {
        self.replicas.push(ReplicaLoad {
            node_index,
            loads: loads.to_vec(),
            should_disappear: false,
        });
        self
    }
}

/// A metric known to the service domain with its cluster-wide average weight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainMetric {
    pub name: String,
    pub average_weight: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterSnapshot {
    pub nodes: Vec<NodeDescription>,
    #[serde(default)]
    pub services: Vec<ServiceDescription>,
    #[serde(default)]
    pub domain_metrics: Vec<DomainMetric>,
    #[serde(default)]
    pub upgrade_completed_uds: BTreeSet<String>,
}

impl ClusterSnapshot {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
