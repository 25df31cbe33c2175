//! Shared domain types: node kinds, id limits, version words.

use serde::{Deserialize, Serialize};

/// Node ids inside a cluster are dense small integers.
pub type NodeId = u32;

/// Cluster ids inside a grid.
pub type ClusterId = u32;

/// Highest node id allowed in a cluster.
pub const IC_MAX_NODE_ID: NodeId = 255;

/// Highest cluster id allowed in a grid.
pub const IC_MAX_CLUSTER_ID: ClusterId = 255;

/// Default port a cluster server listens on.
pub const IC_DEF_CLUSTER_SERVER_PORT: u16 = 1186;

/// Base version of the classic data-server protocol we speak.
pub const NDB_VERSION: u32 = 0x0005_0122;

/// MySQL version advertised in registration messages.
pub const MYSQL_VERSION: u32 = 0x0005_0145;

/// Extended (iClaustron) version shifted above the base version bits.
pub const IC_VERSION: u32 = 1;

/// Bit position where the extended version starts inside a version word.
pub const IC_VERSION_SHIFT: u32 = 20;

/// Mask covering the base version bits of a version word.
pub const IC_BASE_VERSION_MASK: u32 = (1 << IC_VERSION_SHIFT) - 1;

/// Packs a base and an extended version into one version word.
#[must_use]
pub fn pack_version(base: u32, extended: u32) -> u32 {
    (extended << IC_VERSION_SHIFT) | (base & IC_BASE_VERSION_MASK)
}

/// The base (classic) part of a version word.
#[must_use]
pub fn base_version(version: u32) -> u32 {
    version & IC_BASE_VERSION_MASK
}

/// The extended (iClaustron) part of a version word. Zero for classic peers.
#[must_use]
pub fn extended_version(version: u32) -> u32 {
    version >> IC_VERSION_SHIFT
}

/// True when the peer speaks the iClaustron extensions.
#[must_use]
pub fn is_iclaustron_version(version: u32) -> bool {
    extended_version(version) != 0
}

/// The kinds of nodes a cluster configuration can contain, plus the two
/// synthetic section kinds used only inside configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    DataServer,
    Client,
    ClusterServer,
    SqlServer,
    RepServer,
    FileServer,
    Restore,
    ClusterManager,
    /// Communication link sections.
    Comm,
    /// The per-cluster system section.
    System,
}

/// The real node kinds, excluding the synthetic `Comm` and `System`.
pub const NODE_KINDS: [NodeKind; 8] = [
    NodeKind::DataServer,
    NodeKind::Client,
    NodeKind::ClusterServer,
    NodeKind::SqlServer,
    NodeKind::RepServer,
    NodeKind::FileServer,
    NodeKind::Restore,
    NodeKind::ClusterManager,
];

impl NodeKind {
    /// Wire value carried in the node-type key of a config section.
    #[must_use]
    pub fn wire_value(self) -> u32 {
        match self {
            NodeKind::DataServer => 0,
            NodeKind::Client => 1,
            NodeKind::ClusterServer => 2,
            NodeKind::SqlServer => 3,
            NodeKind::RepServer => 4,
            NodeKind::FileServer => 5,
            NodeKind::Restore => 6,
            NodeKind::ClusterManager => 7,
            NodeKind::Comm => 8,
            NodeKind::System => 9,
        }
    }

    /// Inverse of [`NodeKind::wire_value`] for real node kinds.
    #[must_use]
    pub fn from_wire_value(value: u32) -> Option<NodeKind> {
        match value {
            0 => Some(NodeKind::DataServer),
            1 => Some(NodeKind::Client),
            2 => Some(NodeKind::ClusterServer),
            3 => Some(NodeKind::SqlServer),
            4 => Some(NodeKind::RepServer),
            5 => Some(NodeKind::FileServer),
            6 => Some(NodeKind::Restore),
            7 => Some(NodeKind::ClusterManager),
            _ => None,
        }
    }

    /// Bit used in parameter applicability masks.
    #[must_use]
    pub fn mask_bit(self) -> u32 {
        1 << self.wire_value()
    }

    /// Section name in a cluster configuration file.
    #[must_use]
    pub fn section_name(self) -> &'static str {
        match self {
            NodeKind::DataServer => "data server",
            NodeKind::Client => "client",
            NodeKind::ClusterServer => "cluster server",
            NodeKind::SqlServer => "sql server",
            NodeKind::RepServer => "replication server",
            NodeKind::FileServer => "file server",
            NodeKind::Restore => "restore",
            NodeKind::ClusterManager => "cluster manager",
            NodeKind::Comm => "socket",
            NodeKind::System => "system",
        }
    }

    /// Maps a configuration-file section name to a kind.
    #[must_use]
    pub fn from_section_name(name: &str) -> Option<NodeKind> {
        let all = [
            NodeKind::DataServer,
            NodeKind::Client,
            NodeKind::ClusterServer,
            NodeKind::SqlServer,
            NodeKind::RepServer,
            NodeKind::FileServer,
            NodeKind::Restore,
            NodeKind::ClusterManager,
            NodeKind::Comm,
            NodeKind::System,
        ];
        all.into_iter().find(|k| k.section_name() == name)
    }
}

/// Applicability mask helpers for parameter entries.
pub mod kind_mask {
    use super::NodeKind;

    /// All eight real node kinds.
    pub const ALL_NODES: u32 = 0xFF;
    /// Communication link sections only.
    pub const COMM: u32 = 1 << 8;
    /// The system section only.
    pub const SYSTEM: u32 = 1 << 9;

    /// Mask for a single kind.
    #[must_use]
    pub fn only(kind: NodeKind) -> u32 {
        kind.mask_bit()
    }
}
