//! Configuration-to-wire encoding.
//!
//! Sections are enumerated in a fixed order so the output is
//! byte-identical across invocations: section 0, the node meta section
//! (API nodes before data servers), the API node sections, the system
//! meta and system sections, the communication meta and link sections,
//! and finally the data-server node sections.

use super::keys::{
    encode_base64, pack_key, string_word_count, words_to_bytes, xor_words, KeyType,
    CONFIG_MAGIC, NODE_META_SECTION, NODE_TYPE_KEY, PARENT_ID_KEY, SECTION0_COMM_KEY,
    SECTION0_NODE_KEY, SECTION0_SYSTEM_KEY,
};
use crate::config::{ClusterConfig, NodeConfig, ParamTarget, SocketLinkConfig};
use crate::error::IcResult;
use crate::registry::{ParamEntry, ParamType, ParamValue, Registry};
use crate::types::{is_iclaustron_version, NodeKind};

/// Encodes a cluster configuration for a peer at `version`, returning the
/// base64 body (unwrapped; the protocol layer chops it into wire lines).
pub fn encode_config(cluster: &ClusterConfig, version: u32) -> IcResult<String> {
    Ok(encode_base64(&encode_config_bytes(cluster, version)?))
}

/// Encodes to the raw byte array: magic, key-value stream, checksum.
pub fn encode_config_bytes(cluster: &ClusterConfig, version: u32) -> IcResult<Vec<u8>> {
    let registry = Registry::global();

    let api_nodes: Vec<&NodeConfig> = cluster
        .nodes()
        .filter(|n| n.kind() != NodeKind::DataServer)
        .collect();
    let ds_nodes: Vec<&NodeConfig> = cluster
        .nodes()
        .filter(|n| n.kind() == NodeKind::DataServer)
        .collect();

    // Every unordered pair of present nodes carries a link; pairs without
    // a configured record get a synthesized default.
    let node_ids: Vec<u32> = cluster.node_ids().collect();
    let mut links: Vec<SocketLinkConfig> = Vec::new();
    for (i, &a) in node_ids.iter().enumerate() {
        for &b in &node_ids[i + 1..] {
            let pair = crate::config::NodePair::new(a, b);
            match cluster.comm(pair) {
                Some(link) => links.push(link.clone()),
                None => links.push(cluster.default_link_for(a, b)),
            }
        }
    }

    let num_api = api_nodes.len() as u32;
    let num_comms = links.len() as u32;
    let sys_meta = 2 + num_api;
    let sys_section = sys_meta + 1;
    let comm_meta = sys_meta + 2;
    let first_comm = sys_meta + 3;
    let first_ds = first_comm + num_comms;

    let expected_len = expected_word_count(
        registry,
        cluster,
        &api_nodes,
        &ds_nodes,
        &links,
        version,
    );
    let mut words: Vec<u32> = Vec::with_capacity(expected_len);

    // Section 0: the three structural references.
    words.push(pack_key(KeyType::SectionRef, 0, SECTION0_SYSTEM_KEY));
    words.push(sys_meta);
    words.push(pack_key(KeyType::SectionRef, 0, SECTION0_NODE_KEY));
    words.push(NODE_META_SECTION);
    words.push(pack_key(KeyType::SectionRef, 0, SECTION0_COMM_KEY));
    words.push(comm_meta);

    // Node meta section: API nodes first, data servers after.
    for (i, _) in api_nodes.iter().enumerate() {
        words.push(pack_key(KeyType::Int32, NODE_META_SECTION, i as u32));
        words.push(2 + i as u32);
    }
    for (j, _) in ds_nodes.iter().enumerate() {
        words.push(pack_key(
            KeyType::Int32,
            NODE_META_SECTION,
            num_api + j as u32,
        ));
        words.push(first_ds + j as u32);
    }

    // API node sections.
    for (i, node) in api_nodes.iter().enumerate() {
        emit_section(
            &mut words,
            registry,
            2 + i as u32,
            *node,
            node.kind(),
            version,
        );
    }

    // System meta and system sections.
    words.push(pack_key(KeyType::Int32, sys_meta, 0));
    words.push(sys_section);
    emit_section(
        &mut words,
        registry,
        sys_section,
        &cluster.system,
        NodeKind::System,
        version,
    );

    // Communication meta and link sections.
    for i in 0..num_comms {
        words.push(pack_key(KeyType::Int32, comm_meta, i));
        words.push(first_comm + i);
    }
    for (i, link) in links.iter().enumerate() {
        emit_section(
            &mut words,
            registry,
            first_comm + i as u32,
            link,
            NodeKind::Comm,
            version,
        );
    }

    // Data-server node sections.
    for (j, node) in ds_nodes.iter().enumerate() {
        emit_section(
            &mut words,
            registry,
            first_ds + j as u32,
            *node,
            node.kind(),
            version,
        );
    }

    debug_assert_eq!(words.len(), expected_len);

    let mut bytes = Vec::with_capacity(8 + words.len() * 4 + 4);
    bytes.extend_from_slice(CONFIG_MAGIC);
    bytes.extend_from_slice(&words_to_bytes(&words));
    // XOR with the checksum slot at zero, so the full array XORs to zero.
    let checksum = xor_words(&bytes);
    bytes.extend_from_slice(&checksum.to_be_bytes());
    Ok(bytes)
}

/// True when the parameter is emitted for this kind at this version.
fn emitted(registry: &Registry, entry: &ParamEntry, kind: NodeKind, version: u32) -> bool {
    registry.applicable_to(entry, kind, version) && !entry.not_sent && !entry.deprecated
}

/// Node-type value placed in a section: classic peers without the
/// iClaustron extensions only know data servers, clients, and cluster
/// servers, so the extended kinds downgrade to the client type.
fn wire_kind_value(kind: NodeKind, version: u32) -> u32 {
    if is_iclaustron_version(version) {
        return kind.wire_value();
    }
    match kind {
        NodeKind::DataServer | NodeKind::Client | NodeKind::ClusterServer => kind.wire_value(),
        NodeKind::Comm | NodeKind::System => kind.wire_value(),
        _ => NodeKind::Client.wire_value(),
    }
}

/// Emits one section: every applicable parameter, then the parent-id and
/// node-type entries.
fn emit_section<T: ParamTarget + ?Sized>(
    words: &mut Vec<u32>,
    registry: &Registry,
    section_id: u32,
    target: &T,
    kind: NodeKind,
    version: u32,
) {
    for entry in registry.iter() {
        if !emitted(registry, entry, kind, version) {
            continue;
        }
        let Some(value) = target.get_param(entry) else {
            continue;
        };
        match value {
            ParamValue::Num(n) if entry.param_type == ParamType::U64 => {
                words.push(pack_key(KeyType::Int64, section_id, entry.wire_id));
                words.push((n >> 32) as u32);
                words.push(n as u32);
            }
            ParamValue::Num(n) => {
                words.push(pack_key(KeyType::Int32, section_id, entry.wire_id));
                words.push(n as u32);
            }
            ParamValue::Str(s) => emit_string(words, section_id, entry.wire_id, &s),
        }
    }
    words.push(pack_key(KeyType::Int32, section_id, PARENT_ID_KEY));
    words.push(0);
    words.push(pack_key(KeyType::Int32, section_id, NODE_TYPE_KEY));
    words.push(wire_kind_value(kind, version));
}

/// Emits a string entry: key, length word (content plus terminating
/// zero), then the zero-padded content words.
fn emit_string(words: &mut Vec<u32>, section_id: u32, config_id: u32, text: &str) {
    let content = text.as_bytes();
    words.push(pack_key(KeyType::Str, section_id, config_id));
    words.push(content.len() as u32 + 1);
    let word_count = string_word_count(content.len());
    let mut buf = vec![0u8; word_count * 4];
    buf[..content.len()].copy_from_slice(content);
    for chunk in buf.chunks_exact(4) {
        words.push(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
}

/// Words one section contributes: two per parameter plus one extra for
/// 64-bit values and the content words for strings, plus the two fixed
/// parent-id and node-type entries.
fn section_word_count<T: ParamTarget + ?Sized>(
    registry: &Registry,
    target: &T,
    kind: NodeKind,
    version: u32,
) -> usize {
    let mut count = 4;
    for entry in registry.iter() {
        if !emitted(registry, entry, kind, version) {
            continue;
        }
        let Some(value) = target.get_param(entry) else {
            continue;
        };
        count += 2;
        match value {
            ParamValue::Num(_) if entry.param_type == ParamType::U64 => count += 1,
            ParamValue::Num(_) => {}
            ParamValue::Str(s) => count += string_word_count(s.len()),
        }
    }
    count
}

fn expected_word_count(
    registry: &Registry,
    cluster: &ClusterConfig,
    api_nodes: &[&NodeConfig],
    ds_nodes: &[&NodeConfig],
    links: &[SocketLinkConfig],
    version: u32,
) -> usize {
    let mut count = 6; // section 0
    count += (api_nodes.len() + ds_nodes.len()) * 2; // node meta
    count += 2; // system meta
    count += links.len() * 2; // comm meta
    for node in api_nodes.iter().chain(ds_nodes) {
        count += section_word_count(registry, *node, node.kind(), version);
    }
    count += section_word_count(registry, &cluster.system, NodeKind::System, version);
    for link in links {
        count += section_word_count(registry, link, NodeKind::Comm, version);
    }
    count
}
