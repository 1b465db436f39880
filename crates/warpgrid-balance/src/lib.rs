//! WarpGrid balancing core: balance model, candidate node sets and energy.
//!
//! One scheduling pass builds a [`BalanceModel`] from a cluster snapshot,
//! then the search loop owns a [`DynamicNodeLoadSet`] and a [`Score`]
//! created from it. Tentative moves are applied as load updates to both and
//! judged by [`Score::energy`].
//!
//! # Components
//!
//! - **`builder`**: Balance model construction (domains, metrics, node loads)
//! - **`node_load_set`**: Ordered candidate nodes for scoped defragmentation
//! - **`score`**: Energy function (balance, defrag and move cost)
//! - **`domain_tree`**: Fault and upgrade domain trees
//! - **`config`**: Balancing settings loaded from TOML

pub mod builder;
pub mod config;
pub mod domain_tree;
pub mod error;
pub mod load;
pub mod metric;
pub mod node_load_set;
pub mod score;
pub mod snapshot;

pub use builder::{BalanceModel, BalanceModelBuilder, NodeEntry};
pub use config::{DefragDistribution, PlacementStrategy, Settings};
pub use domain_tree::{DomainData, DomainTree, TreeNodeIndex};
pub use error::{ConfigError, ConfigResult, ModelError, ModelResult};
pub use load::{LoadEntry, LoadStat};
pub use metric::{LoadBalancingDomain, Metric};
pub use node_load_set::{DynamicNodeLoadSet, Order};
pub use score::{NodeLoadChanges, Score};
pub use snapshot::{ClusterSnapshot, DeactivationState, DomainMetric, NodeDescription, ReplicaLoad, ServiceDescription, ServiceMetric};
