//! Per-cluster configuration files `<name>.ini.N`.
//!
//! A cluster file holds one section per node plus `[socket]` sections for
//! explicitly configured links. `<kind> default` sections seed the
//! defaults every following section of that kind starts from.

use std::collections::HashMap;
use std::path::Path;

use iclaustron_core::config::{
    ClusterConfig, ClusterInfo, NodeConfig, ParamTarget, SocketLinkConfig,
};
use iclaustron_core::error::{IcError, IcResult};
use iclaustron_core::registry::{ParamDefault, ParamEntry, ParamType, ParamValue, Registry};
use iclaustron_core::types::{NodeKind, NODE_KINDS};

use super::ini::{parse_ini_file, IniHandler, PASS_FILL};

/// The section currently being populated.
enum Current {
    NodeDefault(NodeKind),
    Node(NodeKind, Box<NodeConfig>, u32),
    SocketDefault,
    Socket(Box<SocketLinkConfig>, u32),
}

struct ClusterFileHandler {
    cluster: ClusterConfig,
    node_defaults: HashMap<NodeKind, NodeConfig>,
    socket_default: SocketLinkConfig,
    current: Option<Current>,
}

impl ClusterFileHandler {
    fn new(info: ClusterInfo) -> ClusterFileHandler {
        let mut node_defaults = HashMap::new();
        for kind in NODE_KINDS {
            node_defaults.insert(kind, NodeConfig::with_defaults(kind));
        }
        ClusterFileHandler {
            cluster: ClusterConfig::new(info),
            node_defaults,
            socket_default: SocketLinkConfig::with_defaults(),
            current: None,
        }
    }

    fn complete_current(&mut self) -> IcResult<()> {
        let registry = Registry::global();
        match self.current.take() {
            Some(Current::Node(kind, mut node, line)) => {
                node.apply_derived_defaults();
                let expected = registry.mandatory_mask(kind);
                if node.mandatory_bits() != expected {
                    let missing = registry
                        .missing_mandatory_names(kind, node.mandatory_bits())
                        .join(", ");
                    return Err(IcError::MissingMandatory {
                        node_id: node.node_id(),
                        missing,
                    });
                }
                let node_id = node.node_id();
                self.cluster.add_node(*node).map_err(|err| match err {
                    IcError::ConflictingIds { .. } => {
                        IcError::NodeAlreadyDefined { node_id, line }
                    }
                    other => other,
                })?;
            }
            Some(Current::Socket(link, _line)) => {
                let expected = registry.mandatory_mask(NodeKind::Comm);
                if link.mandatory_bits() != expected {
                    let missing = registry
                        .missing_mandatory_names(NodeKind::Comm, link.mandatory_bits())
                        .join(", ");
                    return Err(IcError::MissingMandatory {
                        node_id: link.first_node_id,
                        missing,
                    });
                }
                self.cluster.insert_comm(*link);
            }
            Some(Current::NodeDefault(_) | Current::SocketDefault) | None => {}
        }
        Ok(())
    }

    fn parse_value(
        param: &ParamEntry,
        value: &str,
        key: &str,
        line: u32,
    ) -> IcResult<ParamValue> {
        match param.param_type {
            ParamType::Str => Ok(ParamValue::Str(value.to_string())),
            ParamType::Bool => match value {
                "true" | "1" => Ok(ParamValue::Num(1)),
                "false" | "0" => Ok(ParamValue::Num(0)),
                _ => Err(IcError::NoBooleanValue {
                    key: key.to_string(),
                    line,
                }),
            },
            _ => {
                let number = iclaustron_core::protocol::parse_number(value).ok_or_else(|| {
                    IcError::WrongConfigNumber {
                        key: key.to_string(),
                        line,
                    }
                })?;
                if !param.in_bounds(number) {
                    return Err(IcError::ConfigValueOutOfBounds {
                        key: key.to_string(),
                        value: number,
                        line,
                    });
                }
                Ok(ParamValue::Num(number))
            }
        }
    }
}

impl IniHandler for ClusterFileHandler {
    fn add_section(&mut self, name: &str, pass: u32, line: u32) -> IcResult<()> {
        if pass != PASS_FILL {
            // Sizing falls out of Vec growth; pass 0 only validates names.
            let base = name.strip_suffix(" default").unwrap_or(name);
            let kind = NodeKind::from_section_name(base);
            if kind.is_none() || kind == Some(NodeKind::System) {
                return Err(IcError::ProtocolError { line });
            }
            return Ok(());
        }
        self.complete_current()?;
        if let Some(base) = name.strip_suffix(" default") {
            self.current = match NodeKind::from_section_name(base) {
                Some(NodeKind::Comm) => Some(Current::SocketDefault),
                Some(kind) if kind != NodeKind::System => Some(Current::NodeDefault(kind)),
                _ => return Err(IcError::ProtocolError { line }),
            };
            return Ok(());
        }
        self.current = match NodeKind::from_section_name(name) {
            Some(NodeKind::Comm) => {
                Some(Current::Socket(Box::new(self.socket_default.clone()), line))
            }
            Some(kind) if kind != NodeKind::System => {
                let seed = self.node_defaults[&kind].clone();
                Some(Current::Node(kind, Box::new(seed), line))
            }
            _ => return Err(IcError::ProtocolError { line }),
        };
        Ok(())
    }

    fn add_key(&mut self, key: &str, value: &str, pass: u32, line: u32) -> IcResult<()> {
        if pass != PASS_FILL {
            return Ok(());
        }
        let registry = Registry::global();
        let (target, kind): (&mut dyn ParamTarget, NodeKind) = match self.current.as_mut() {
            None => return Err(IcError::NoSectionDefinedYet { line }),
            Some(Current::NodeDefault(kind)) => {
                let kind = *kind;
                let target =
                    self.node_defaults
                        .get_mut(&kind)
                        .ok_or(IcError::InconsistentData {
                            detail: "node kind defaults not seeded",
                        })?;
                (target, kind)
            }
            Some(Current::Node(kind, node, _)) => (node.as_mut(), *kind),
            Some(Current::SocketDefault) => (&mut self.socket_default, NodeKind::Comm),
            Some(Current::Socket(link, _)) => (link.as_mut(), NodeKind::Comm),
        };

        let param = registry
            .lookup_by_name(key)
            .map_err(|_| IcError::NoSuchConfigKey {
                key: key.to_string(),
                line,
            })?;
        if !param.applies_to_kind(kind) {
            return Err(IcError::CorrectConfigInWrongSection {
                key: key.to_string(),
                line,
            });
        }
        if param.deprecated || param.not_configurable {
            tracing::debug!(key, line, "ignoring unconfigurable parameter");
            return Ok(());
        }
        let parsed = Self::parse_value(param, value, key, line)?;
        target.set_param(param, &parsed)
    }

    fn verify(&mut self, pass: u32) -> IcResult<()> {
        if pass == PASS_FILL {
            self.complete_current()?;
        }
        Ok(())
    }

    fn end(&mut self) -> IcResult<()> {
        if self.cluster.num_nodes() == 0 {
            return Err(IcError::NoNodesFound);
        }
        // Every explicit link must join two defined nodes.
        for pair in self.cluster.sorted_pairs() {
            for node_id in [pair.first(), pair.second()] {
                if self.cluster.node(node_id).is_none() {
                    return Err(IcError::NoSuchNode {
                        cluster_id: self.cluster.info.cluster_id,
                        node_id,
                    });
                }
            }
        }
        self.cluster.synthesize_missing_links();
        self.cluster.complete_link_defaults();
        Ok(())
    }
}

/// Loads one cluster's configuration file, stamping the system section
/// from the grid entry and the committed generation.
pub fn load_cluster(path: &Path, info: ClusterInfo, version: u32) -> IcResult<ClusterConfig> {
    let mut handler = ClusterFileHandler::new(info);
    parse_ini_file(path, &mut handler)?;
    let mut cluster = handler.cluster;
    cluster.system.system_name = cluster.info.cluster_name.clone();
    cluster.system.configuration_number = version;
    let primary_cs_node = cluster
        .nodes()
        .find(|n| n.kind() == NodeKind::ClusterServer)
        .map(NodeConfig::node_id)
        .unwrap_or(0);
    cluster.system.primary_cs_node = primary_cs_node;
    cluster.system.mandatory_bits =
        Registry::global().mandatory_mask(NodeKind::System);
    Ok(cluster)
}

fn format_value(param: &ParamEntry, value: &ParamValue) -> Option<String> {
    match value {
        ParamValue::Str(s) if s.is_empty() => None,
        ParamValue::Str(s) => Some(s.clone()),
        ParamValue::Num(n) if param.param_type == ParamType::Bool => {
            Some(if *n != 0 { "true" } else { "false" }.to_string())
        }
        ParamValue::Num(n) => Some(n.to_string()),
    }
}

/// True when the value is worth writing: mandatory parameters always,
/// everything else only when it differs from the registry default.
fn should_write(param: &ParamEntry, value: &ParamValue) -> bool {
    if param.mandatory {
        return true;
    }
    match (&param.default, value) {
        (ParamDefault::Num(d), ParamValue::Num(v)) => d != v,
        (ParamDefault::Str(d), ParamValue::Str(v)) => d != v,
        _ => true,
    }
}

fn write_section(
    out: &mut String,
    header: &str,
    target: &dyn ParamTarget,
    kind: NodeKind,
) {
    let registry = Registry::global();
    out.push('[');
    out.push_str(header);
    out.push_str("]\n");
    for param in registry.iter() {
        if !param.applies_to_kind(kind) || param.deprecated || param.not_configurable {
            continue;
        }
        let Some(value) = target.get_param(param) else {
            continue;
        };
        if !should_write(param, &value) {
            continue;
        }
        if let Some(rendered) = format_value(param, &value) {
            out.push_str(&format!("{} = {}\n", param.name, rendered));
        }
    }
    out.push('\n');
}

/// Writes one cluster's configuration file.
pub fn write_cluster_file(path: &Path, cluster: &ClusterConfig) -> IcResult<()> {
    let mut out = String::new();
    for node in cluster.nodes() {
        write_section(&mut out, node.kind().section_name(), node, node.kind());
    }
    for pair in cluster.sorted_pairs() {
        if let Some(link) = cluster.comm(pair) {
            write_section(
                &mut out,
                NodeKind::Comm.section_name(),
                link,
                NodeKind::Comm,
            );
        }
    }
    std::fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use iclaustron_core::config::NodePair;

    const SAMPLE: &str = "\
[data server default]
node_data_path = /var/lib/ic
data_server_max_threads = 8

[data server]
node_id = 1
hostname = ds1

[data server]
node_id = 2
hostname = ds2
data_server_max_threads = 16

[client]
node_id = 3
hostname = api1

[cluster server]
node_id = 4
hostname = cs1
cluster_server_port_number = 1186

[socket]
first_node_id = 3
second_node_id = 4
server_port_number = 12345
use_checksum = true
";

    fn info() -> ClusterInfo {
        ClusterInfo {
            cluster_name: "kalle".to_string(),
            cluster_id: 0,
            password: "p".to_string(),
        }
    }

    fn load_sample(content: &str) -> IcResult<ClusterConfig> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kalle.ini.1");
        std::fs::write(&path, content).unwrap();
        load_cluster(&path, info(), 1)
    }

    #[test]
    fn defaults_seed_following_sections() {
        let cluster = load_sample(SAMPLE).unwrap();
        let ds1 = cluster.node(1).unwrap();
        let NodeConfig::DataServer(ds) = ds1 else {
            panic!("wrong kind");
        };
        // Seeded from the default section, then derived.
        assert_eq!(ds.common.node_data_path, "/var/lib/ic");
        assert_eq!(ds.max_threads, 8);
        assert_eq!(ds.filesystem_path, "/var/lib/ic");
        assert_eq!(ds.checkpoint_path, "/var/lib/ic");
        assert_eq!(ds.common.node_name, "node_1");
        assert_eq!(ds.common.pcntrl_hostname, "ds1");

        // Explicit values win over the default section.
        let NodeConfig::DataServer(ds2) = cluster.node(2).unwrap() else {
            panic!("wrong kind");
        };
        assert_eq!(ds2.max_threads, 16);
    }

    #[test]
    fn explicit_socket_kept_and_missing_links_synthesized() {
        let cluster = load_sample(SAMPLE).unwrap();
        // 4 nodes -> 6 links in the fully connected table.
        assert_eq!(cluster.num_comms(), 6);
        let explicit = cluster.comm(NodePair::new(3, 4)).unwrap();
        assert_eq!(explicit.server_port_number, 12_345);
        assert!(explicit.use_checksum);
        assert_eq!(explicit.first_hostname, "api1");
        assert_eq!(explicit.server_node_id, 4);
        // Synthesized link picks the data server as server side.
        let synth = cluster.comm(NodePair::new(1, 3)).unwrap();
        assert_eq!(synth.server_node_id, 1);
    }

    #[test]
    fn system_section_is_stamped_from_grid_entry() {
        let cluster = load_sample(SAMPLE).unwrap();
        assert_eq!(cluster.system.system_name, "kalle");
        assert_eq!(cluster.system.configuration_number, 1);
        assert_eq!(cluster.system.primary_cs_node, 4);
    }

    #[test]
    fn mandatory_mask_law_holds_after_load() {
        let registry = Registry::global();
        let cluster = load_sample(SAMPLE).unwrap();
        for node in cluster.nodes() {
            assert_eq!(
                node.mandatory_bits(),
                registry.mandatory_mask(node.kind()),
                "node {}",
                node.node_id()
            );
        }
        cluster.verify().unwrap();
    }

    #[test]
    fn missing_mandatory_lists_parameter_names() {
        let err = load_sample("[client]\nnode_id = 3\n").unwrap_err();
        match err {
            IcError::MissingMandatory { node_id, missing } => {
                assert_eq!(node_id, 3);
                assert!(missing.contains("hostname"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn duplicate_node_reports_already_defined() {
        let content = "\
[client]
node_id = 3
hostname = a

[client]
node_id = 3
hostname = b
";
        let err = load_sample(content).unwrap_err();
        assert!(matches!(
            err,
            IcError::NodeAlreadyDefined { node_id: 3, .. }
        ));
    }

    #[test]
    fn wrong_section_parameter_is_flagged() {
        let content = "[client]\nnode_id = 3\nhostname = a\nfilesystem_path = /x\n";
        let err = load_sample(content).unwrap_err();
        assert!(matches!(
            err,
            IcError::CorrectConfigInWrongSection { line: 4, .. }
        ));
    }

    #[test]
    fn bad_boolean_and_bad_number_are_flagged() {
        let content = "[socket]\nfirst_node_id = 1\nuse_checksum = maybe\n";
        assert!(matches!(
            load_sample(content).unwrap_err(),
            IcError::NoBooleanValue { line: 3, .. }
        ));

        let content = "[client]\nnode_id = many\n";
        assert!(matches!(
            load_sample(content).unwrap_err(),
            IcError::WrongConfigNumber { line: 2, .. }
        ));
    }

    #[test]
    fn out_of_bounds_value_is_flagged() {
        let content = "[client]\nnode_id = 3\nhostname = a\nclient_batch_size = 99999\n";
        assert!(matches!(
            load_sample(content).unwrap_err(),
            IcError::ConfigValueOutOfBounds { value: 99_999, .. }
        ));
    }

    #[test]
    fn empty_file_has_no_nodes() {
        assert!(matches!(load_sample(""), Err(IcError::NoNodesFound)));
    }

    #[test]
    fn write_then_load_round_trips() {
        let cluster = load_sample(SAMPLE).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kalle.ini.2");
        write_cluster_file(&path, &cluster).unwrap();
        let reloaded = load_cluster(&path, info(), 1).unwrap();
        assert_eq!(reloaded, cluster);
    }
}
