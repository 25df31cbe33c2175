//! One cluster's configuration: nodes, links, system section.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::link::SocketLinkConfig;
use super::node::NodeConfig;
use super::system::SystemConfig;
use crate::error::{IcError, IcResult};
use crate::registry::Registry;
use crate::types::{ClusterId, NodeId, NodeKind, IC_MAX_NODE_ID, NODE_KINDS};

/// Base port used when a synthesized link needs a server port.
const DEF_LINK_BASE_PORT: u32 = 11_870;

/// Identity of a cluster inside the grid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub cluster_name: String,
    pub cluster_id: ClusterId,
    pub password: String,
}

/// Unordered pair of node ids keying the communication hash.
///
/// Construction sorts the ids, so `{a, b}` and `{b, a}` are the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePair {
    first: NodeId,
    second: NodeId,
}

impl NodePair {
    #[must_use]
    pub fn new(a: NodeId, b: NodeId) -> NodePair {
        if a <= b {
            NodePair { first: a, second: b }
        } else {
            NodePair { first: b, second: a }
        }
    }

    #[must_use]
    pub fn first(self) -> NodeId {
        self.first
    }

    #[must_use]
    pub fn second(self) -> NodeId {
        self.second
    }
}

impl Hash for NodePair {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Symmetric by construction; xor keeps it symmetric even if an
        // unsorted pair ever slips through.
        state.write_u32(self.first ^ self.second);
    }
}

/// A complete cluster configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    pub info: ClusterInfo,
    pub system: SystemConfig,
    /// Indexed by node id; `None` for unused ids.
    nodes: Vec<Option<NodeConfig>>,
    comms: HashMap<NodePair, SocketLinkConfig>,
    /// Node counts indexed by `NodeKind::wire_value()`.
    counts: [u32; 8],
    max_node_id: NodeId,
}

impl ClusterConfig {
    #[must_use]
    pub fn new(info: ClusterInfo) -> ClusterConfig {
        ClusterConfig {
            info,
            system: SystemConfig::default(),
            nodes: Vec::new(),
            comms: HashMap::new(),
            counts: [0; 8],
            max_node_id: 0,
        }
    }

    /// Installs a node under its own node id.
    ///
    /// # Errors
    ///
    /// `ConflictingIds` when the id is already taken, `NoSuchNode` when
    /// the id is zero or above the fixed maximum.
    pub fn add_node(&mut self, node: NodeConfig) -> IcResult<()> {
        let node_id = node.node_id();
        if node_id == 0 || node_id > IC_MAX_NODE_ID {
            return Err(IcError::NoSuchNode {
                cluster_id: self.info.cluster_id,
                node_id,
            });
        }
        let index = node_id as usize;
        if self.nodes.len() <= index {
            self.nodes.resize(index + 1, None);
        }
        if self.nodes[index].is_some() {
            return Err(IcError::ConflictingIds { node_id });
        }
        self.counts[node.kind().wire_value() as usize] += 1;
        self.max_node_id = self.max_node_id.max(node_id);
        self.nodes[index] = Some(node);
        Ok(())
    }

    #[must_use]
    pub fn node(&self, node_id: NodeId) -> Option<&NodeConfig> {
        self.nodes.get(node_id as usize).and_then(Option::as_ref)
    }

    pub fn node_mut(&mut self, node_id: NodeId) -> Option<&mut NodeConfig> {
        self.nodes.get_mut(node_id as usize).and_then(Option::as_mut)
    }

    #[must_use]
    pub fn node_kind(&self, node_id: NodeId) -> Option<NodeKind> {
        self.node(node_id).map(NodeConfig::kind)
    }

    /// Present node ids in ascending order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(id, n)| n.as_ref().map(|_| id as NodeId))
    }

    /// Present nodes in ascending node-id order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeConfig> {
        self.nodes.iter().filter_map(Option::as_ref)
    }

    #[must_use]
    pub fn num_nodes(&self) -> u32 {
        self.counts.iter().sum()
    }

    #[must_use]
    pub fn count(&self, kind: NodeKind) -> u32 {
        self.counts[kind.wire_value() as usize]
    }

    #[must_use]
    pub fn max_node_id(&self) -> NodeId {
        self.max_node_id
    }

    #[must_use]
    pub fn comm(&self, pair: NodePair) -> Option<&SocketLinkConfig> {
        self.comms.get(&pair)
    }

    pub fn comm_mut(&mut self, pair: NodePair) -> Option<&mut SocketLinkConfig> {
        self.comms.get_mut(&pair)
    }

    /// Installs a link under its unordered node pair.
    pub fn insert_comm(&mut self, link: SocketLinkConfig) {
        let pair = NodePair::new(link.first_node_id, link.second_node_id);
        self.comms.insert(pair, link);
    }

    #[must_use]
    pub fn num_comms(&self) -> usize {
        self.comms.len()
    }

    /// All link pairs sorted by (first, second); encoding and link
    /// synthesis iterate this order so output is deterministic.
    #[must_use]
    pub fn sorted_pairs(&self) -> Vec<NodePair> {
        let mut pairs: Vec<NodePair> = self.comms.keys().copied().collect();
        pairs.sort_by_key(|p| (p.first, p.second));
        pairs
    }

    /// Which end of a link acts as the TCP server: a data server always
    /// does; between two nodes of other kinds the higher id serves.
    #[must_use]
    pub fn server_side_of(&self, a: NodeId, b: NodeId) -> NodeId {
        let a_is_ds = self.node_kind(a) == Some(NodeKind::DataServer);
        let b_is_ds = self.node_kind(b) == Some(NodeKind::DataServer);
        match (a_is_ds, b_is_ds) {
            (true, false) => a,
            (false, true) => b,
            _ => a.max(b),
        }
    }

    /// Builds a default link between two present nodes: endpoints copied
    /// from the node hostnames, server side per [`Self::server_side_of`].
    #[must_use]
    pub fn default_link_for(&self, a: NodeId, b: NodeId) -> SocketLinkConfig {
        let pair = NodePair::new(a, b);
        let mut link = SocketLinkConfig::with_defaults();
        link.first_node_id = pair.first;
        link.second_node_id = pair.second;
        if let Some(node) = self.node(pair.first) {
            link.first_hostname = node.common().hostname.clone();
        }
        if let Some(node) = self.node(pair.second) {
            link.second_hostname = node.common().hostname.clone();
        }
        link.server_node_id = self.server_side_of(a, b);
        link.server_port_number = DEF_LINK_BASE_PORT + pair.first + pair.second;
        link
    }

    /// Materialises a default link for every unordered pair of present
    /// nodes that has none, establishing the fully-connected policy.
    pub fn synthesize_missing_links(&mut self) {
        let ids: Vec<NodeId> = self.node_ids().collect();
        for (i, &a) in ids.iter().enumerate() {
            for &b in &ids[i + 1..] {
                let pair = NodePair::new(a, b);
                if !self.comms.contains_key(&pair) {
                    let link = self.default_link_for(a, b);
                    self.comms.insert(pair, link);
                }
            }
        }
    }

    /// Fills in derived fields a decoded or loaded link may have left at
    /// their zero defaults.
    pub fn complete_link_defaults(&mut self) {
        let pairs = self.sorted_pairs();
        for pair in pairs {
            let first_host = self
                .node(pair.first)
                .map(|n| n.common().hostname.clone())
                .unwrap_or_default();
            let second_host = self
                .node(pair.second)
                .map(|n| n.common().hostname.clone())
                .unwrap_or_default();
            let server_side = self.server_side_of(pair.first, pair.second);
            if let Some(link) = self.comms.get_mut(&pair) {
                if link.first_hostname.is_empty() {
                    link.first_hostname = first_host;
                }
                if link.second_hostname.is_empty() {
                    link.second_hostname = second_host;
                }
                if link.server_node_id == 0 {
                    link.server_node_id = server_side;
                }
            }
        }
    }

    /// Checks the mandatory-mask law for every node and the full
    /// connectivity of the link table.
    pub fn verify(&self) -> IcResult<()> {
        let registry = Registry::global();
        if self.num_nodes() == 0 {
            return Err(IcError::NoNodesFound);
        }
        for node in self.nodes() {
            let kind = node.kind();
            let expected = registry.mandatory_mask(kind);
            let got = node.common().mandatory_bits;
            if got != expected {
                let missing = registry
                    .missing_mandatory_names(kind, got)
                    .join(", ");
                return Err(IcError::MissingMandatory {
                    node_id: node.node_id(),
                    missing,
                });
            }
        }
        let ids: Vec<NodeId> = self.node_ids().collect();
        let expected_links = ids.len() * (ids.len() - 1) / 2;
        if self.comms.len() != expected_links {
            return Err(IcError::InconsistentData {
                detail: "link table is not fully connected",
            });
        }
        Ok(())
    }

    /// A serialisable summary used by the configuration client's JSON
    /// output.
    #[must_use]
    pub fn to_summary(&self) -> ClusterSummary {
        let mut links: Vec<SocketLinkConfig> = Vec::with_capacity(self.comms.len());
        for pair in self.sorted_pairs() {
            if let Some(link) = self.comms.get(&pair) {
                links.push(link.clone());
            }
        }
        ClusterSummary {
            info: self.info.clone(),
            system: self.system.clone(),
            nodes: self.nodes().cloned().collect(),
            links,
        }
    }

    /// Per-kind counts as (kind, count) for the kinds that are present.
    #[must_use]
    pub fn kind_counts(&self) -> Vec<(NodeKind, u32)> {
        NODE_KINDS
            .iter()
            .filter_map(|&k| {
                let c = self.count(k);
                (c > 0).then_some((k, c))
            })
            .collect()
    }
}

/// Flattened, serialisable view of a cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub info: ClusterInfo,
    pub system: SystemConfig,
    pub nodes: Vec<NodeConfig>,
    pub links: Vec<SocketLinkConfig>,
}
