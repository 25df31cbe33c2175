//! Per-kind node configuration structs.

use serde::{Deserialize, Serialize};

use super::{value_as_num, value_as_str, ParamTarget};
use crate::error::{IcError, IcResult};
use crate::registry::{ids, ParamDefault, ParamEntry, ParamValue, Registry};
use crate::types::{NodeId, NodeKind};

/// Fields shared by every node kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommonNodeConfig {
    pub node_id: NodeId,
    pub hostname: String,
    pub node_data_path: String,
    pub node_name: String,
    pub pcntrl_hostname: String,
    pub pcntrl_port: u16,
    /// Bits of the mandatory parameters assigned so far.
    #[serde(skip)]
    pub mandatory_bits: u64,
}

/// Equality compares configuration values only; the mandatory-bit
/// bookkeeping reflects how the struct was loaded, not what it holds.
impl PartialEq for CommonNodeConfig {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
            && self.hostname == other.hostname
            && self.node_data_path == other.node_data_path
            && self.node_name == other.node_name
            && self.pcntrl_hostname == other.pcntrl_hostname
            && self.pcntrl_port == other.pcntrl_port
    }
}

impl CommonNodeConfig {
    /// Handles the common parameter ids; returns false when the id is not
    /// a common parameter so the kind-specific part gets a chance.
    fn set_common(&mut self, entry: &ParamEntry, value: &ParamValue) -> IcResult<bool> {
        match entry.wire_id {
            ids::NODE_ID => self.node_id = u32::try_from(value_as_num(value)?).unwrap_or(0),
            ids::HOSTNAME => self.hostname = value_as_str(value)?.to_string(),
            7 => self.node_data_path = value_as_str(value)?.to_string(),
            14 => self.node_name = value_as_str(value)?.to_string(),
            24 => self.pcntrl_hostname = value_as_str(value)?.to_string(),
            25 => self.pcntrl_port = u16::try_from(value_as_num(value)?).unwrap_or(0),
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn get_common(&self, entry: &ParamEntry) -> Option<ParamValue> {
        match entry.wire_id {
            ids::NODE_ID => Some(ParamValue::Num(u64::from(self.node_id))),
            ids::HOSTNAME => Some(ParamValue::Str(self.hostname.clone())),
            7 => Some(ParamValue::Str(self.node_data_path.clone())),
            14 => Some(ParamValue::Str(self.node_name.clone())),
            24 => Some(ParamValue::Str(self.pcntrl_hostname.clone())),
            25 => Some(ParamValue::Num(u64::from(self.pcntrl_port))),
            _ => None,
        }
    }

    /// Applies the derived defaults that depend on other fields of the
    /// same node. Called at section completion, after explicit values.
    pub fn apply_derived_defaults(&mut self) {
        if self.pcntrl_hostname.is_empty() {
            self.pcntrl_hostname = self.hostname.clone();
        }
        if self.node_name.is_empty() {
            self.node_name = format!("node_{}", self.node_id);
        }
    }
}

/// Data server node configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataServerConfig {
    #[serde(flatten)]
    pub common: CommonNodeConfig,
    pub filesystem_path: String,
    pub checkpoint_path: String,
    pub memory_size: u64,
    pub max_threads: u32,
    pub local_checkpoint_timer: u32,
    pub heartbeat_timer: u32,
    pub redo_log_memory: u64,
    pub volatile_mode: bool,
}

impl DataServerConfig {
    /// Derived defaults: the filesystem path falls back to the node data
    /// path and the checkpoint path to the filesystem path.
    pub fn apply_derived_defaults(&mut self) {
        self.common.apply_derived_defaults();
        if self.filesystem_path.is_empty() {
            self.filesystem_path = self.common.node_data_path.clone();
        }
        if self.checkpoint_path.is_empty() {
            self.checkpoint_path = self.filesystem_path.clone();
        }
    }
}

/// Client node configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(flatten)]
    pub common: CommonNodeConfig,
    pub batch_size: u32,
    pub batch_byte_size: u32,
}

/// Cluster server node configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterServerConfig {
    #[serde(flatten)]
    pub common: CommonNodeConfig,
    pub port_number: u16,
    pub event_log: String,
}

/// SQL server node configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SqlServerConfig {
    #[serde(flatten)]
    pub common: CommonNodeConfig,
    pub port_number: u16,
}

/// Replication server node configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepServerConfig {
    #[serde(flatten)]
    pub common: CommonNodeConfig,
    pub port_number: u16,
}

/// File server node configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileServerConfig {
    #[serde(flatten)]
    pub common: CommonNodeConfig,
    pub port_number: u16,
}

/// Restore node configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreConfig {
    #[serde(flatten)]
    pub common: CommonNodeConfig,
    pub parallelism: u32,
}

/// Cluster manager node configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterManagerConfig {
    #[serde(flatten)]
    pub common: CommonNodeConfig,
    pub port_number: u16,
}

/// A node of any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum NodeConfig {
    DataServer(DataServerConfig),
    Client(ClientConfig),
    ClusterServer(ClusterServerConfig),
    SqlServer(SqlServerConfig),
    RepServer(RepServerConfig),
    FileServer(FileServerConfig),
    Restore(RestoreConfig),
    ClusterManager(ClusterManagerConfig),
}

impl NodeConfig {
    /// An empty node of `kind` with every applicable parameter set to its
    /// registry default. Mandatory bits start cleared: defaults do not
    /// satisfy mandatory parameters.
    #[must_use]
    pub fn with_defaults(kind: NodeKind) -> NodeConfig {
        let mut node = match kind {
            NodeKind::DataServer => NodeConfig::DataServer(DataServerConfig::default()),
            NodeKind::Client => NodeConfig::Client(ClientConfig::default()),
            NodeKind::ClusterServer => NodeConfig::ClusterServer(ClusterServerConfig::default()),
            NodeKind::SqlServer => NodeConfig::SqlServer(SqlServerConfig::default()),
            NodeKind::RepServer => NodeConfig::RepServer(RepServerConfig::default()),
            NodeKind::FileServer => NodeConfig::FileServer(FileServerConfig::default()),
            NodeKind::Restore => NodeConfig::Restore(RestoreConfig::default()),
            NodeKind::ClusterManager => {
                NodeConfig::ClusterManager(ClusterManagerConfig::default())
            }
            NodeKind::Comm | NodeKind::System => {
                unreachable!("link and system sections are not nodes")
            }
        };
        let registry = Registry::global();
        for entry in registry.iter() {
            if !entry.applies_to_kind(kind) || entry.deprecated {
                continue;
            }
            let value = match entry.default {
                ParamDefault::Num(n) => ParamValue::Num(n),
                ParamDefault::Str(s) => ParamValue::Str(s.to_string()),
            };
            // Defaults target known fields only; failure here is a table bug.
            let _ = node.set_param(entry, &value);
        }
        node.common_mut().mandatory_bits = 0;
        node
    }

    /// The kind of this node.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeConfig::DataServer(_) => NodeKind::DataServer,
            NodeConfig::Client(_) => NodeKind::Client,
            NodeConfig::ClusterServer(_) => NodeKind::ClusterServer,
            NodeConfig::SqlServer(_) => NodeKind::SqlServer,
            NodeConfig::RepServer(_) => NodeKind::RepServer,
            NodeConfig::FileServer(_) => NodeKind::FileServer,
            NodeConfig::Restore(_) => NodeKind::Restore,
            NodeConfig::ClusterManager(_) => NodeKind::ClusterManager,
        }
    }

    /// Shared part of the node.
    #[must_use]
    pub fn common(&self) -> &CommonNodeConfig {
        match self {
            NodeConfig::DataServer(n) => &n.common,
            NodeConfig::Client(n) => &n.common,
            NodeConfig::ClusterServer(n) => &n.common,
            NodeConfig::SqlServer(n) => &n.common,
            NodeConfig::RepServer(n) => &n.common,
            NodeConfig::FileServer(n) => &n.common,
            NodeConfig::Restore(n) => &n.common,
            NodeConfig::ClusterManager(n) => &n.common,
        }
    }

    /// Mutable shared part of the node.
    pub fn common_mut(&mut self) -> &mut CommonNodeConfig {
        match self {
            NodeConfig::DataServer(n) => &mut n.common,
            NodeConfig::Client(n) => &mut n.common,
            NodeConfig::ClusterServer(n) => &mut n.common,
            NodeConfig::SqlServer(n) => &mut n.common,
            NodeConfig::RepServer(n) => &mut n.common,
            NodeConfig::FileServer(n) => &mut n.common,
            NodeConfig::Restore(n) => &mut n.common,
            NodeConfig::ClusterManager(n) => &mut n.common,
        }
    }

    /// The node id of this node.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.common().node_id
    }

    /// Applies derived defaults at section completion.
    pub fn apply_derived_defaults(&mut self) {
        match self {
            NodeConfig::DataServer(n) => n.apply_derived_defaults(),
            NodeConfig::Client(n) => n.common.apply_derived_defaults(),
            NodeConfig::ClusterServer(n) => n.common.apply_derived_defaults(),
            NodeConfig::SqlServer(n) => n.common.apply_derived_defaults(),
            NodeConfig::RepServer(n) => n.common.apply_derived_defaults(),
            NodeConfig::FileServer(n) => n.common.apply_derived_defaults(),
            NodeConfig::Restore(n) => n.common.apply_derived_defaults(),
            NodeConfig::ClusterManager(n) => n.common.apply_derived_defaults(),
        }
    }
}

impl ParamTarget for NodeConfig {
    fn set_param(&mut self, entry: &ParamEntry, value: &ParamValue) -> IcResult<()> {
        let handled = self.common_mut().set_common(entry, value)?;
        if !handled {
            match self {
                NodeConfig::DataServer(n) => match entry.wire_id {
                    101 => n.filesystem_path = value_as_str(value)?.to_string(),
                    102 => n.checkpoint_path = value_as_str(value)?.to_string(),
                    103 => n.memory_size = value_as_num(value)?,
                    104 => n.max_threads = value_as_num(value)? as u32,
                    105 => n.local_checkpoint_timer = value_as_num(value)? as u32,
                    106 => n.heartbeat_timer = value_as_num(value)? as u32,
                    107 => n.redo_log_memory = value_as_num(value)?,
                    108 => n.volatile_mode = value_as_num(value)? != 0,
                    id => return Err(unknown_field(id)),
                },
                NodeConfig::Client(n) => match entry.wire_id {
                    201 => n.batch_size = value_as_num(value)? as u32,
                    202 => n.batch_byte_size = value_as_num(value)? as u32,
                    id => return Err(unknown_field(id)),
                },
                NodeConfig::ClusterServer(n) => match entry.wire_id {
                    301 => n.port_number = value_as_num(value)? as u16,
                    302 => n.event_log = value_as_str(value)?.to_string(),
                    id => return Err(unknown_field(id)),
                },
                NodeConfig::SqlServer(n) => match entry.wire_id {
                    321 => n.port_number = value_as_num(value)? as u16,
                    id => return Err(unknown_field(id)),
                },
                NodeConfig::RepServer(n) => match entry.wire_id {
                    341 => n.port_number = value_as_num(value)? as u16,
                    id => return Err(unknown_field(id)),
                },
                NodeConfig::FileServer(n) => match entry.wire_id {
                    361 => n.port_number = value_as_num(value)? as u16,
                    id => return Err(unknown_field(id)),
                },
                NodeConfig::Restore(n) => match entry.wire_id {
                    381 => n.parallelism = value_as_num(value)? as u32,
                    id => return Err(unknown_field(id)),
                },
                NodeConfig::ClusterManager(n) => match entry.wire_id {
                    501 => n.port_number = value_as_num(value)? as u16,
                    id => return Err(unknown_field(id)),
                },
            }
        }
        if entry.mandatory {
            self.common_mut().mandatory_bits |= 1u64 << entry.mandatory_bit;
        }
        Ok(())
    }

    fn get_param(&self, entry: &ParamEntry) -> Option<ParamValue> {
        if let Some(value) = self.common().get_common(entry) {
            return Some(value);
        }
        let num = |n: u64| Some(ParamValue::Num(n));
        let s = |v: &String| Some(ParamValue::Str(v.clone()));
        match self {
            NodeConfig::DataServer(n) => match entry.wire_id {
                101 => s(&n.filesystem_path),
                102 => s(&n.checkpoint_path),
                103 => num(n.memory_size),
                104 => num(u64::from(n.max_threads)),
                105 => num(u64::from(n.local_checkpoint_timer)),
                106 => num(u64::from(n.heartbeat_timer)),
                107 => num(n.redo_log_memory),
                108 => num(u64::from(n.volatile_mode)),
                _ => None,
            },
            NodeConfig::Client(n) => match entry.wire_id {
                201 => num(u64::from(n.batch_size)),
                202 => num(u64::from(n.batch_byte_size)),
                _ => None,
            },
            NodeConfig::ClusterServer(n) => match entry.wire_id {
                301 => num(u64::from(n.port_number)),
                302 => s(&n.event_log),
                _ => None,
            },
            NodeConfig::SqlServer(n) => match entry.wire_id {
                321 => num(u64::from(n.port_number)),
                _ => None,
            },
            NodeConfig::RepServer(n) => match entry.wire_id {
                341 => num(u64::from(n.port_number)),
                _ => None,
            },
            NodeConfig::FileServer(n) => match entry.wire_id {
                361 => num(u64::from(n.port_number)),
                _ => None,
            },
            NodeConfig::Restore(n) => match entry.wire_id {
                381 => num(u64::from(n.parallelism)),
                _ => None,
            },
            NodeConfig::ClusterManager(n) => match entry.wire_id {
                501 => num(u64::from(n.port_number)),
                _ => None,
            },
        }
    }

    fn mandatory_bits(&self) -> u64 {
        self.common().mandatory_bits
    }
}

fn unknown_field(wire_id: u32) -> IcError {
    IcError::UnknownParameter {
        ident: wire_id.to_string(),
    }
}
