//! Communication link configuration.

use serde::{Deserialize, Serialize};

use super::{value_as_num, value_as_str, ParamTarget};
use crate::error::{IcError, IcResult};
use crate::registry::{ids, ParamDefault, ParamEntry, ParamValue, Registry};
use crate::types::{NodeId, NodeKind};

/// One socket link between two nodes.
///
/// `first_node_id` is always the smaller id; the server side of the link
/// is `server_node_id`, chosen by the rule in
/// [`crate::config::ClusterConfig::server_side_of`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SocketLinkConfig {
    pub first_node_id: NodeId,
    pub second_node_id: NodeId,
    pub use_message_id: bool,
    pub use_checksum: bool,
    pub first_hostname: String,
    pub second_hostname: String,
    pub server_port_number: u32,
    pub server_node_id: NodeId,
    pub write_buffer_size: u32,
    pub read_buffer_size: u32,
    pub max_wait_in_nanos: u32,
    pub overload_limit: u32,
    #[serde(skip)]
    pub mandatory_bits: u64,
}

/// Equality compares configuration values only; the mandatory-bit
/// bookkeeping reflects how the struct was loaded, not what it holds.
impl PartialEq for SocketLinkConfig {
    fn eq(&self, other: &Self) -> bool {
        self.first_node_id == other.first_node_id
            && self.second_node_id == other.second_node_id
            && self.use_message_id == other.use_message_id
            && self.use_checksum == other.use_checksum
            && self.first_hostname == other.first_hostname
            && self.second_hostname == other.second_hostname
            && self.server_port_number == other.server_port_number
            && self.server_node_id == other.server_node_id
            && self.write_buffer_size == other.write_buffer_size
            && self.read_buffer_size == other.read_buffer_size
            && self.max_wait_in_nanos == other.max_wait_in_nanos
            && self.overload_limit == other.overload_limit
    }
}

impl SocketLinkConfig {
    /// A link with every parameter at its registry default and cleared
    /// mandatory bits.
    #[must_use]
    pub fn with_defaults() -> SocketLinkConfig {
        let mut link = SocketLinkConfig::default();
        for entry in Registry::global().iter() {
            if !entry.applies_to_kind(NodeKind::Comm) || entry.deprecated {
                continue;
            }
            let value = match entry.default {
                ParamDefault::Num(n) => ParamValue::Num(n),
                ParamDefault::Str(s) => ParamValue::Str(s.to_string()),
            };
            let _ = link.set_param(entry, &value);
        }
        link.mandatory_bits = 0;
        link
    }

    /// The peer of `node_id` on this link.
    #[must_use]
    pub fn other_end(&self, node_id: NodeId) -> NodeId {
        if node_id == self.first_node_id {
            self.second_node_id
        } else {
            self.first_node_id
        }
    }

    /// Hostname of the given end of the link.
    #[must_use]
    pub fn hostname_of(&self, node_id: NodeId) -> &str {
        if node_id == self.first_node_id {
            &self.first_hostname
        } else {
            &self.second_hostname
        }
    }
}

impl ParamTarget for SocketLinkConfig {
    fn set_param(&mut self, entry: &ParamEntry, value: &ParamValue) -> IcResult<()> {
        match entry.wire_id {
            ids::FIRST_NODE_ID => self.first_node_id = value_as_num(value)? as u32,
            ids::SECOND_NODE_ID => self.second_node_id = value_as_num(value)? as u32,
            402 => self.use_message_id = value_as_num(value)? != 0,
            403 => self.use_checksum = value_as_num(value)? != 0,
            404 => self.first_hostname = value_as_str(value)?.to_string(),
            405 => self.second_hostname = value_as_str(value)?.to_string(),
            ids::SERVER_PORT_NUMBER => self.server_port_number = value_as_num(value)? as u32,
            407 => self.server_node_id = value_as_num(value)? as u32,
            408 => self.write_buffer_size = value_as_num(value)? as u32,
            409 => self.read_buffer_size = value_as_num(value)? as u32,
            410 => self.max_wait_in_nanos = value_as_num(value)? as u32,
            413 => self.overload_limit = value_as_num(value)? as u32,
            id => {
                return Err(IcError::UnknownParameter {
                    ident: id.to_string(),
                })
            }
        }
        if entry.mandatory {
            self.mandatory_bits |= 1u64 << entry.mandatory_bit;
        }
        Ok(())
    }

    fn get_param(&self, entry: &ParamEntry) -> Option<ParamValue> {
        let num = |n: u64| Some(ParamValue::Num(n));
        match entry.wire_id {
            ids::FIRST_NODE_ID => num(u64::from(self.first_node_id)),
            ids::SECOND_NODE_ID => num(u64::from(self.second_node_id)),
            402 => num(u64::from(self.use_message_id)),
            403 => num(u64::from(self.use_checksum)),
            404 => Some(ParamValue::Str(self.first_hostname.clone())),
            405 => Some(ParamValue::Str(self.second_hostname.clone())),
            ids::SERVER_PORT_NUMBER => num(u64::from(self.server_port_number)),
            407 => num(u64::from(self.server_node_id)),
            408 => num(u64::from(self.write_buffer_size)),
            409 => num(u64::from(self.read_buffer_size)),
            410 => num(u64::from(self.max_wait_in_nanos)),
            413 => num(u64::from(self.overload_limit)),
            _ => None,
        }
    }

    fn mandatory_bits(&self) -> u64 {
        self.mandatory_bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_buffer_sizes() {
        let link = SocketLinkConfig::with_defaults();
        assert_eq!(link.write_buffer_size, 262_144);
        assert_eq!(link.read_buffer_size, 65_536);
        assert_eq!(link.max_wait_in_nanos, 50_000);
        assert!(!link.use_message_id);
        assert!(!link.use_checksum);
        assert_eq!(link.mandatory_bits, 0);
    }

    #[test]
    fn endpoint_helpers() {
        let link = SocketLinkConfig {
            first_node_id: 3,
            second_node_id: 7,
            first_hostname: "a".to_string(),
            second_hostname: "b".to_string(),
            ..SocketLinkConfig::with_defaults()
        };
        assert_eq!(link.other_end(3), 7);
        assert_eq!(link.other_end(7), 3);
        assert_eq!(link.hostname_of(3), "a");
        assert_eq!(link.hostname_of(7), "b");
    }

    #[test]
    fn mandatory_bits_accumulate() {
        let registry = Registry::global();
        let mut link = SocketLinkConfig::with_defaults();
        for name in ["first_node_id", "second_node_id", "server_port_number"] {
            let entry = registry.lookup_by_name(name).unwrap();
            link.set_param(entry, &ParamValue::Num(3)).unwrap();
        }
        assert_eq!(
            link.mandatory_bits(),
            registry.mandatory_mask(NodeKind::Comm)
        );
    }
}
