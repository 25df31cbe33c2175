//! Wire-to-configuration decoding.
//!
//! Two passes over the key-value stream: the first discovers the section
//! structure (which sections are nodes, links, system) and tallies string
//! memory; the second validates every entry against the registry and
//! assigns it into the configuration structs.

use super::keys::{
    self, bytes_to_words, decode_base64, unpack_key, xor_words, KeyType, CONFIG_MAGIC,
    NODE_META_SECTION, NODE_TYPE_KEY, PARENT_ID_KEY, SECTION0_COMM_KEY, SECTION0_NODE_KEY,
    SECTION0_SYSTEM_KEY,
};
use crate::config::{
    ClusterConfig, ClusterInfo, NodeConfig, ParamTarget, SocketLinkConfig, SystemConfig,
};
use crate::error::{IcError, IcResult};
use crate::registry::{ids, ParamType, ParamValue, Registry};
use crate::types::{NodeId, NodeKind};

/// Where a configuration byte array came from.
///
/// Disk caches may predate full link synthesis, so missing links are
/// materialised from node defaults; wire input always carries the full
/// link table and synthesising would mask a peer bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecSource {
    Wire,
    Disk,
}

/// One decoded key-value entry.
#[derive(Debug, Clone, PartialEq)]
enum RawValue {
    I32(u32),
    I64(u64),
    Ref(u32),
    Str(String),
}

#[derive(Debug, Clone)]
struct RawEntry {
    config_id: u32,
    value: RawValue,
}

/// Decodes a base64 configuration body into a cluster configuration.
pub fn decode_config(
    body: &str,
    info: ClusterInfo,
    source: CodecSource,
) -> IcResult<ClusterConfig> {
    if body.len() % 4 != 0 {
        return Err(IcError::protocol(line!()));
    }
    let bytes = decode_base64(body)?;
    decode_config_bytes(&bytes, info, source)
}

/// Decodes a raw configuration byte array (magic + stream + checksum).
pub fn decode_config_bytes(
    bytes: &[u8],
    info: ClusterInfo,
    source: CodecSource,
) -> IcResult<ClusterConfig> {
    if bytes.len() % 4 != 0 || bytes.len() <= 12 {
        return Err(IcError::protocol(line!()));
    }
    if &bytes[..8] != CONFIG_MAGIC {
        return Err(IcError::protocol(line!()));
    }
    if xor_words(bytes) != 0 {
        return Err(IcError::protocol(line!()));
    }
    // Strip the verification string and the trailing checksum word.
    let words = bytes_to_words(&bytes[8..bytes.len() - 4], line!())?;

    let sections = parse_sections(&words)?;
    let structure = discover_structure(&sections)?;
    assign_sections(&sections, &structure, info, source)
}

/// Splits the word stream into per-section entry lists.
///
/// Section ids must ascend; skipped ids are legal and denote sections
/// with no entries (a grid without links has an empty communication
/// meta-section). Going backwards is a protocol error.
fn parse_sections(words: &[u32]) -> IcResult<Vec<Vec<RawEntry>>> {
    let mut sections: Vec<Vec<RawEntry>> = Vec::new();
    let mut pos = 0usize;

    while pos < words.len() {
        let (key_type, section_id, config_id) = unpack_key(words[pos], line!())?;
        pos += 1;

        if section_id >= sections.len() as u32 {
            sections.resize((section_id + 1) as usize, Vec::new());
        } else if section_id + 1 != sections.len() as u32 {
            // Neither the current section nor a later one.
            return Err(IcError::protocol(line!()));
        }

        let value = match key_type {
            KeyType::Int32 => {
                let v = *words.get(pos).ok_or_else(|| IcError::protocol(line!()))?;
                pos += 1;
                RawValue::I32(v)
            }
            KeyType::SectionRef => {
                let v = *words.get(pos).ok_or_else(|| IcError::protocol(line!()))?;
                pos += 1;
                RawValue::Ref(v)
            }
            KeyType::Int64 => {
                let high = *words.get(pos).ok_or_else(|| IcError::protocol(line!()))?;
                let low = *words.get(pos + 1).ok_or_else(|| IcError::protocol(line!()))?;
                pos += 2;
                RawValue::I64((u64::from(high) << 32) | u64::from(low))
            }
            KeyType::Str => {
                let len_word = *words.get(pos).ok_or_else(|| IcError::protocol(line!()))?;
                pos += 1;
                if len_word == 0 {
                    return Err(IcError::protocol(line!()));
                }
                let content_len = (len_word - 1) as usize;
                let word_count = keys::string_word_count(content_len);
                if pos + word_count > words.len() {
                    return Err(IcError::protocol(line!()));
                }
                let str_bytes = keys::words_to_bytes(&words[pos..pos + word_count]);
                pos += word_count;
                // The length word must agree with the content: terminating
                // zero in place, no interior zero byte.
                if str_bytes[content_len] != 0 {
                    return Err(IcError::protocol(line!()));
                }
                if str_bytes[..content_len].contains(&0) {
                    return Err(IcError::protocol(line!()));
                }
                let text = std::str::from_utf8(&str_bytes[..content_len])
                    .map_err(|_| IcError::protocol(line!()))?;
                RawValue::Str(text.to_string())
            }
        };

        sections
            .last_mut()
            .ok_or_else(|| IcError::protocol(line!()))?
            .push(RawEntry { config_id, value });
    }

    if sections.len() < 2 {
        return Err(IcError::protocol(line!()));
    }
    Ok(sections)
}

/// Structure discovered by the first pass.
#[derive(Debug)]
struct Structure {
    sys_meta: u32,
    sys_section: u32,
    comm_meta: u32,
    first_comm: u32,
    num_comms: u32,
    /// Node section indexes in the order listed by the node meta section.
    node_sections: Vec<u32>,
    node_kinds: Vec<NodeKind>,
    node_ids: Vec<NodeId>,
}

fn section0_ref(sections: &[Vec<RawEntry>], key: u32) -> IcResult<u32> {
    sections[0]
        .iter()
        .find(|e| e.config_id == key)
        .and_then(|e| match e.value {
            RawValue::Ref(v) => Some(v),
            _ => None,
        })
        .ok_or_else(|| IcError::protocol(line!()))
}

fn discover_structure(sections: &[Vec<RawEntry>]) -> IcResult<Structure> {
    let num_sections = sections.len() as u32;

    let sys_meta = section0_ref(sections, SECTION0_SYSTEM_KEY)?;
    let node_meta = section0_ref(sections, SECTION0_NODE_KEY)?;
    let comm_meta = section0_ref(sections, SECTION0_COMM_KEY)?;
    if node_meta != NODE_META_SECTION {
        return Err(IcError::protocol(line!()));
    }
    if sys_meta < 2 || comm_meta != sys_meta + 2 || comm_meta > num_sections {
        return Err(IcError::protocol(line!()));
    }
    let sys_section = sys_meta + 1;
    let first_comm = sys_meta + 3;
    let num_api = sys_meta - 2;

    // The node meta section lists every node section.
    let mut node_sections = Vec::new();
    let mut node_kinds = Vec::new();
    let mut node_ids = Vec::new();
    let mut first_ds_section: Option<u32> = None;

    for entry in &sections[NODE_META_SECTION as usize] {
        let RawValue::I32(section_index) = entry.value else {
            return Err(IcError::protocol(line!()));
        };
        if section_index >= num_sections {
            return Err(IcError::protocol(line!()));
        }
        let is_api = section_index >= 2 && section_index < 2 + num_api;
        let is_ds = section_index >= first_comm;
        if !is_api && !is_ds {
            return Err(IcError::protocol(line!()));
        }
        if is_ds && first_ds_section.is_none() {
            first_ds_section = Some(section_index);
        }

        let (kind, node_id) = read_node_identity(&sections[section_index as usize])?;
        if is_ds != (kind == NodeKind::DataServer) {
            return Err(IcError::protocol(line!()));
        }
        node_sections.push(section_index);
        node_kinds.push(kind);
        node_ids.push(node_id);
    }

    let num_comms = match first_ds_section {
        Some(first_ds) => first_ds - first_comm,
        None => num_sections.saturating_sub(first_comm),
    };

    let string_memory: usize = sections
        .iter()
        .flatten()
        .map(|e| match &e.value {
            RawValue::Str(s) => s.len() + 1,
            _ => 0,
        })
        .sum();
    tracing::debug!(
        sections = num_sections,
        nodes = node_sections.len(),
        comms = num_comms,
        string_memory,
        "configuration structure discovered"
    );

    Ok(Structure {
        sys_meta,
        sys_section,
        comm_meta,
        first_comm,
        num_comms,
        node_sections,
        node_kinds,
        node_ids,
    })
}

/// Reads the node-type and node-id keys out of a node section.
fn read_node_identity(entries: &[RawEntry]) -> IcResult<(NodeKind, NodeId)> {
    let mut kind = None;
    let mut node_id = None;
    for entry in entries {
        match (entry.config_id, &entry.value) {
            (NODE_TYPE_KEY, RawValue::I32(v)) => {
                kind = Some(
                    NodeKind::from_wire_value(*v).ok_or_else(|| IcError::protocol(line!()))?,
                );
            }
            (ids::NODE_ID, RawValue::I32(v)) => node_id = Some(*v),
            _ => {}
        }
    }
    match (kind, node_id) {
        (Some(kind), Some(node_id)) => Ok((kind, node_id)),
        _ => Err(IcError::protocol(line!())),
    }
}

/// Second pass: validates every entry and assigns values.
fn assign_sections(
    sections: &[Vec<RawEntry>],
    structure: &Structure,
    info: ClusterInfo,
    source: CodecSource,
) -> IcResult<ClusterConfig> {
    let cluster_id = info.cluster_id;
    let mut cluster = ClusterConfig::new(info);

    // The system meta section holds exactly one pointer to the system
    // section; the comm meta section points at each link section in order.
    validate_meta_section(
        &sections[structure.sys_meta as usize],
        &[structure.sys_section],
    )?;
    let comm_sections: Vec<u32> = (0..structure.num_comms)
        .map(|i| structure.first_comm + i)
        .collect();
    // An empty communication meta-section may sit at (or past) the end
    // of the parsed stream.
    let comm_meta_entries = sections
        .get(structure.comm_meta as usize)
        .map_or(&[][..], Vec::as_slice);
    validate_meta_section(comm_meta_entries, &comm_sections)?;

    // Node sections.
    for (slot, &section_index) in structure.node_sections.iter().enumerate() {
        let kind = structure.node_kinds[slot];
        let mut node = NodeConfig::with_defaults(kind);
        assign_target(
            &sections[section_index as usize],
            &mut node,
            kind,
        )?;
        if node.node_id() != structure.node_ids[slot] {
            return Err(IcError::protocol(line!()));
        }
        // Reindex from dense section order into the node-id indexed array.
        cluster.add_node(node)?;
    }

    // System section.
    let mut system = SystemConfig::default();
    assign_target(
        &sections[structure.sys_section as usize],
        &mut system,
        NodeKind::System,
    )?;
    cluster.system = system;

    // Communication sections.
    for &section_index in &comm_sections {
        let mut link = SocketLinkConfig::with_defaults();
        assign_target(
            &sections[section_index as usize],
            &mut link,
            NodeKind::Comm,
        )?;
        if cluster.node(link.first_node_id).is_none() || cluster.node(link.second_node_id).is_none()
        {
            return Err(IcError::NoSuchNode {
                cluster_id,
                node_id: link.first_node_id,
            });
        }
        cluster.insert_comm(link);
    }

    if source == CodecSource::Disk {
        cluster.synthesize_missing_links();
        cluster.complete_link_defaults();
    }
    Ok(cluster)
}

/// A meta section must reference exactly the expected section ids, in
/// order, under ascending entry config ids.
fn validate_meta_section(entries: &[RawEntry], expected: &[u32]) -> IcResult<()> {
    if entries.len() != expected.len() {
        return Err(IcError::protocol(line!()));
    }
    for (index, (entry, &section)) in entries.iter().zip(expected).enumerate() {
        if entry.config_id != index as u32 {
            return Err(IcError::protocol(line!()));
        }
        match entry.value {
            RawValue::I32(v) if v == section => {}
            _ => return Err(IcError::protocol(line!())),
        }
    }
    Ok(())
}

/// Assigns one section's entries into a parameter target.
fn assign_target<T: ParamTarget>(
    entries: &[RawEntry],
    target: &mut T,
    kind: NodeKind,
) -> IcResult<()> {
    let registry = Registry::global();
    for entry in entries {
        match entry.config_id {
            NODE_TYPE_KEY => {
                // Validated during discovery for node sections; link and
                // system sections carry their synthetic kind value.
                continue;
            }
            PARENT_ID_KEY => match entry.value {
                RawValue::I32(0) => continue,
                _ => return Err(IcError::protocol(line!())),
            },
            _ => {}
        }

        let Ok(param) = registry.lookup_by_wire_id(entry.config_id) else {
            return Err(IcError::protocol(line!()));
        };
        if param.deprecated || param.not_configurable {
            continue;
        }
        if !param.applies_to_kind(kind) {
            return Err(IcError::protocol(line!()));
        }

        let value = match (&entry.value, param.param_type) {
            (RawValue::Str(s), ParamType::Str) => ParamValue::Str(s.clone()),
            (RawValue::I64(v), ParamType::U64) => ParamValue::Num(*v),
            (RawValue::I32(v), ty) if ty.is_numeric() && ty != ParamType::U64 => {
                ParamValue::Num(u64::from(*v))
            }
            _ => return Err(IcError::protocol(line!())),
        };
        if let ParamValue::Num(n) = value {
            if !param.in_bounds(n) {
                return Err(IcError::protocol(line!()));
            }
        }
        target.set_param(param, &value)?;
    }
    Ok(())
}
