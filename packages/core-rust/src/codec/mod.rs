//! The configuration wire codec.
//!
//! Converts between the in-memory cluster configuration and the base64
//! byte array exchanged over the configuration protocol: an 8-byte
//! verification string, a length-prefixed 32-bit key-value stream in
//! network byte order, and a trailing XOR checksum word.

mod decode;
mod encode;
pub mod keys;

pub use decode::{decode_config, decode_config_bytes, CodecSource};
pub use encode::{encode_config, encode_config_bytes};

#[cfg(test)]
mod tests {
    use super::keys::{
        pack_key, words_to_bytes, xor_words, KeyType, CONFIG_MAGIC, NODE_TYPE_KEY,
        PARENT_ID_KEY, SECTION0_COMM_KEY, SECTION0_NODE_KEY, SECTION0_SYSTEM_KEY,
    };
    use super::*;
    use crate::config::{
        ClusterConfig, ClusterInfo, NodeConfig, NodePair, ParamTarget, SystemConfig,
    };
    use crate::error::IcError;
    use crate::registry::{ParamValue, Registry};
    use crate::types::{pack_version, NodeKind, NDB_VERSION};
    use proptest::prelude::*;

    fn set(target: &mut dyn ParamTarget, name: &str, value: ParamValue) {
        let entry = Registry::global().lookup_by_name(name).unwrap();
        target.set_param(entry, &value).unwrap();
    }

    fn make_node(kind: NodeKind, node_id: u32, hostname: &str) -> NodeConfig {
        let mut node = NodeConfig::with_defaults(kind);
        set(&mut node, "node_id", ParamValue::Num(u64::from(node_id)));
        set(&mut node, "hostname", ParamValue::Str(hostname.to_string()));
        if kind == NodeKind::ClusterServer {
            set(&mut node, "cluster_server_port_number", ParamValue::Num(1186));
        }
        node
    }

    fn make_system(name: &str, generation: u32, primary: u32) -> SystemConfig {
        let mut system = SystemConfig::default();
        set(&mut system, "system_name", ParamValue::Str(name.to_string()));
        set(
            &mut system,
            "system_configuration_number",
            ParamValue::Num(u64::from(generation)),
        );
        set(
            &mut system,
            "system_primary_cs_node",
            ParamValue::Num(u64::from(primary)),
        );
        system
    }

    /// Two data servers, one client: the three-node round-trip cluster.
    fn three_node_cluster() -> ClusterConfig {
        let mut cluster = ClusterConfig::new(ClusterInfo {
            cluster_name: "kalle".to_string(),
            cluster_id: 0,
            password: "secret".to_string(),
        });
        cluster.add_node(make_node(NodeKind::DataServer, 1, "ds1")).unwrap();
        cluster.add_node(make_node(NodeKind::DataServer, 2, "ds2")).unwrap();
        cluster.add_node(make_node(NodeKind::Client, 3, "api1")).unwrap();
        cluster.system = make_system("kalle", 1, 0);
        cluster.synthesize_missing_links();
        cluster
    }

    fn ic_version() -> u32 {
        pack_version(NDB_VERSION, 1)
    }

    fn string_entry(words: &mut Vec<u32>, section: u32, id: u32, text: &str) {
        words.push(pack_key(KeyType::Str, section, id));
        words.push(text.len() as u32 + 1);
        let count = super::keys::string_word_count(text.len());
        let mut buf = vec![0u8; count * 4];
        buf[..text.len()].copy_from_slice(text.as_bytes());
        for chunk in buf.chunks_exact(4) {
            words.push(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
    }

    fn int_entry(words: &mut Vec<u32>, section: u32, id: u32, value: u32) {
        words.push(pack_key(KeyType::Int32, section, id));
        words.push(value);
    }

    fn close_section(words: &mut Vec<u32>, section: u32, kind: NodeKind) {
        int_entry(words, section, PARENT_ID_KEY, 0);
        int_entry(words, section, NODE_TYPE_KEY, kind.wire_value());
    }

    fn seal(words: Vec<u32>) -> Vec<u8> {
        let mut bytes = CONFIG_MAGIC.to_vec();
        bytes.extend_from_slice(&words_to_bytes(&words));
        let checksum = xor_words(&bytes);
        bytes.extend_from_slice(&checksum.to_be_bytes());
        bytes
    }

    #[test]
    fn round_trip_three_node_cluster() {
        let cluster = three_node_cluster();
        let body = encode_config(&cluster, ic_version()).unwrap();
        let decoded =
            decode_config(&body, cluster.info.clone(), CodecSource::Wire).unwrap();
        assert_eq!(decoded, cluster);
    }

    #[test]
    fn round_trip_with_classic_version() {
        // Classic peers get the same structure minus iClaustron-only
        // parameters; data servers and clients survive unchanged.
        let cluster = three_node_cluster();
        let classic = NDB_VERSION & crate::types::IC_BASE_VERSION_MASK;
        let body = encode_config(&cluster, classic).unwrap();
        let decoded =
            decode_config(&body, cluster.info.clone(), CodecSource::Wire).unwrap();
        assert_eq!(decoded.num_nodes(), 3);
        assert_eq!(decoded.num_comms(), 3);
    }

    #[test]
    fn encode_is_deterministic() {
        let cluster = three_node_cluster();
        let first = encode_config(&cluster, ic_version()).unwrap();
        let second = encode_config(&cluster, ic_version()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn re_encode_of_decode_is_byte_identical() {
        let cluster = three_node_cluster();
        let body = encode_config(&cluster, ic_version()).unwrap();
        let decoded = decode_config(&body, cluster.info.clone(), CodecSource::Wire).unwrap();
        let body2 = encode_config(&decoded, ic_version()).unwrap();
        assert_eq!(body, body2);
    }

    #[test]
    fn encoded_body_length_divisible_by_four() {
        let cluster = three_node_cluster();
        let body = encode_config(&cluster, ic_version()).unwrap();
        assert_eq!(body.len() % 4, 0);
    }

    #[test]
    fn single_bit_flips_are_rejected() {
        let cluster = three_node_cluster();
        let mut bytes = encode_config_bytes(&cluster, ic_version()).unwrap();
        // Flip one bit at a spread of positions; every corruption must be
        // caught by the magic check, the checksum, or the entry walk.
        let step = bytes.len() / 17 + 1;
        for position in (0..bytes.len()).step_by(step) {
            bytes[position] ^= 0x10;
            let result = decode_config_bytes(
                &bytes,
                cluster.info.clone(),
                CodecSource::Wire,
            );
            assert!(result.is_err(), "bit flip at byte {position} accepted");
            bytes[position] ^= 0x10;
        }
    }

    #[test]
    fn truncated_input_is_rejected() {
        let cluster = three_node_cluster();
        let bytes = encode_config_bytes(&cluster, ic_version()).unwrap();
        for len in [0, 4, 12, bytes.len() - 4] {
            let result =
                decode_config_bytes(&bytes[..len], cluster.info.clone(), CodecSource::Wire);
            assert!(matches!(result, Err(IcError::ProtocolError { .. })));
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let cluster = three_node_cluster();
        let mut bytes = encode_config_bytes(&cluster, ic_version()).unwrap();
        bytes[0] = b'X';
        assert!(decode_config_bytes(&bytes, cluster.info.clone(), CodecSource::Wire).is_err());
    }

    #[test]
    fn encode_synthesizes_links_for_uncovered_pairs() {
        // The link table is empty; the wire still carries one section
        // per unordered pair, per the fully-connected policy.
        let mut cluster = ClusterConfig::new(ClusterInfo::default());
        cluster.add_node(make_node(NodeKind::DataServer, 1, "a")).unwrap();
        cluster.add_node(make_node(NodeKind::Client, 2, "b")).unwrap();
        cluster.system = make_system("c", 1, 0);
        let body = encode_config(&cluster, ic_version()).unwrap();

        let wire = decode_config(&body, ClusterInfo::default(), CodecSource::Wire).unwrap();
        assert_eq!(wire.num_comms(), 1);
        let link = wire.comm(NodePair::new(1, 2)).unwrap();
        assert_eq!(link.first_hostname, "a");
        assert_eq!(link.second_hostname, "b");
        assert_eq!(link.server_node_id, 1);
    }

    /// A disk cache predating link synthesis: two nodes, an empty
    /// communication meta-section, no link sections.
    fn linkless_stream() -> Vec<u8> {
        let mut words = Vec::new();
        // Section 0: system meta at 3, comm meta at 5 (which is empty).
        words.push(pack_key(KeyType::SectionRef, 0, SECTION0_SYSTEM_KEY));
        words.push(3);
        words.push(pack_key(KeyType::SectionRef, 0, SECTION0_NODE_KEY));
        words.push(1);
        words.push(pack_key(KeyType::SectionRef, 0, SECTION0_COMM_KEY));
        words.push(5);
        // Section 1: node meta listing client section 2 and data server
        // section 6.
        int_entry(&mut words, 1, 0, 2);
        int_entry(&mut words, 1, 1, 6);
        // Section 2: client node 3.
        int_entry(&mut words, 2, 3, 3);
        string_entry(&mut words, 2, 5, "b");
        close_section(&mut words, 2, NodeKind::Client);
        // Sections 3 and 4: system meta and system.
        int_entry(&mut words, 3, 0, 4);
        string_entry(&mut words, 4, 1101, "c");
        close_section(&mut words, 4, NodeKind::System);
        // Section 5 (comm meta) has no entries. Section 6: data server 1.
        int_entry(&mut words, 6, 3, 1);
        string_entry(&mut words, 6, 5, "a");
        close_section(&mut words, 6, NodeKind::DataServer);
        seal(words)
    }

    #[test]
    fn disk_source_synthesizes_missing_links() {
        let bytes = linkless_stream();

        let wire =
            decode_config_bytes(&bytes, ClusterInfo::default(), CodecSource::Wire).unwrap();
        assert_eq!(wire.num_comms(), 0);

        let disk =
            decode_config_bytes(&bytes, ClusterInfo::default(), CodecSource::Disk).unwrap();
        assert_eq!(disk.num_comms(), 1);
        let link = disk.comm(NodePair::new(1, 3)).unwrap();
        assert_eq!(link.first_hostname, "a");
        assert_eq!(link.second_hostname, "b");
        assert_eq!(link.server_node_id, 1);
    }

    /// Hand-assembled minimal stream: one client (3), one cluster server
    /// (4), one data server (1), one link {3,4}.
    #[test]
    fn decode_minimal_hand_built_config() {
        let mut words: Vec<u32> = Vec::new();
        // Section 0: system meta at 4, node meta sentinel, comm meta at 6.
        words.push(pack_key(KeyType::SectionRef, 0, SECTION0_SYSTEM_KEY));
        words.push(4);
        words.push(pack_key(KeyType::SectionRef, 0, SECTION0_NODE_KEY));
        words.push(1);
        words.push(pack_key(KeyType::SectionRef, 0, SECTION0_COMM_KEY));
        words.push(6);
        // Section 1: node meta listing sections 2, 3, 8.
        int_entry(&mut words, 1, 0, 2);
        int_entry(&mut words, 1, 1, 3);
        int_entry(&mut words, 1, 2, 8);
        // Section 2: client node 3.
        int_entry(&mut words, 2, 3, 3);
        string_entry(&mut words, 2, 5, "h1");
        close_section(&mut words, 2, NodeKind::Client);
        // Section 3: cluster server node 4.
        int_entry(&mut words, 3, 3, 4);
        string_entry(&mut words, 3, 5, "h2");
        int_entry(&mut words, 3, 301, 1186);
        close_section(&mut words, 3, NodeKind::ClusterServer);
        // Section 4: system meta pointing at 5.
        int_entry(&mut words, 4, 0, 5);
        // Section 5: system section.
        string_entry(&mut words, 5, 1101, "c");
        int_entry(&mut words, 5, 1102, 1);
        int_entry(&mut words, 5, 1103, 4);
        close_section(&mut words, 5, NodeKind::System);
        // Section 6: comm meta pointing at 7.
        int_entry(&mut words, 6, 0, 7);
        // Section 7: link between 3 and 4.
        int_entry(&mut words, 7, 400, 3);
        int_entry(&mut words, 7, 401, 4);
        int_entry(&mut words, 7, 406, 11_877);
        close_section(&mut words, 7, NodeKind::Comm);
        // Section 8: data server node 1.
        int_entry(&mut words, 8, 3, 1);
        string_entry(&mut words, 8, 5, "h3");
        close_section(&mut words, 8, NodeKind::DataServer);

        let bytes = seal(words);

        let cluster =
            decode_config_bytes(&bytes, ClusterInfo::default(), CodecSource::Wire).unwrap();
        assert_eq!(cluster.max_node_id(), 4);
        assert_eq!(cluster.node_kind(3), Some(NodeKind::Client));
        assert_eq!(cluster.node_kind(4), Some(NodeKind::ClusterServer));
        assert_eq!(cluster.node_kind(1), Some(NodeKind::DataServer));
        assert_eq!(cluster.num_comms(), 1);
        assert!(cluster.comm(NodePair::new(3, 4)).is_some());
        assert_eq!(cluster.system.system_name, "c");
        assert_eq!(cluster.system.configuration_number, 1);
        assert_eq!(cluster.system.primary_cs_node, 4);
    }

    #[test]
    fn duplicate_node_ids_conflict() {
        let mut cluster = ClusterConfig::new(ClusterInfo::default());
        cluster.add_node(make_node(NodeKind::Client, 3, "a")).unwrap();
        cluster.add_node(make_node(NodeKind::Client, 4, "b")).unwrap();
        cluster.system = make_system("c", 1, 0);
        let mut bytes = encode_config_bytes(&cluster, ic_version()).unwrap();

        // Rewrite node 4's id entry to 3 and fix up the checksum, which
        // produces a structurally valid stream with a duplicate id.
        let target = pack_key(KeyType::Int32, 3, 3);
        let mut patched = false;
        let len = bytes.len();
        for offset in (8..len - 4).step_by(4) {
            let word = u32::from_be_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ]);
            if word == target {
                bytes[offset + 4..offset + 8].copy_from_slice(&3u32.to_be_bytes());
                patched = true;
                break;
            }
        }
        assert!(patched);
        let checksum = xor_words(&bytes[..len - 4]);
        bytes[len - 4..].copy_from_slice(&checksum.to_be_bytes());

        let result = decode_config_bytes(&bytes, ClusterInfo::default(), CodecSource::Wire);
        assert!(matches!(result, Err(IcError::ConflictingIds { node_id: 3 })));
    }

    #[test]
    fn out_of_bounds_value_is_rejected() {
        let mut cluster = ClusterConfig::new(ClusterInfo::default());
        cluster.add_node(make_node(NodeKind::Client, 3, "a")).unwrap();
        cluster.system = make_system("c", 1, 0);
        let mut bytes = encode_config_bytes(&cluster, ic_version()).unwrap();

        // client_batch_size has bounds 1..=992; rewrite it to 100000.
        let target = pack_key(KeyType::Int32, 2, 201);
        let len = bytes.len();
        let mut patched = false;
        for offset in (8..len - 4).step_by(4) {
            let word = u32::from_be_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ]);
            if word == target {
                bytes[offset + 4..offset + 8].copy_from_slice(&100_000u32.to_be_bytes());
                patched = true;
                break;
            }
        }
        assert!(patched);
        let checksum = xor_words(&bytes[..len - 4]);
        bytes[len - 4..].copy_from_slice(&checksum.to_be_bytes());

        let result = decode_config_bytes(&bytes, ClusterInfo::default(), CodecSource::Wire);
        assert!(matches!(result, Err(IcError::ProtocolError { .. })));
    }

    #[test]
    fn round_trip_with_string_heavy_cluster() {
        // Hostnames crossing every word-padding boundary.
        let mut cluster = ClusterConfig::new(ClusterInfo {
            cluster_name: "strings".to_string(),
            cluster_id: 0,
            password: String::new(),
        });
        for (slot, len) in [1usize, 2, 3, 4, 5, 7, 8, 33].iter().enumerate() {
            let hostname = "h".repeat(*len);
            let node = make_node(NodeKind::Client, slot as u32 + 1, &hostname);
            cluster.add_node(node).unwrap();
        }
        cluster.system = make_system("strings", 9, 0);
        cluster.synthesize_missing_links();

        let body = encode_config(&cluster, ic_version()).unwrap();
        let decoded = decode_config(&body, cluster.info.clone(), CodecSource::Wire).unwrap();
        assert_eq!(decoded, cluster);
        assert_eq!(
            decoded.node(8).unwrap().common().hostname,
            "h".repeat(33)
        );
    }

    #[test]
    fn classic_encoding_omits_iclaustron_parameters() {
        let mut cluster = three_node_cluster();
        // A non-default value for an iClaustron-only link parameter.
        let pair = NodePair::new(1, 2);
        cluster.comm_mut(pair).unwrap().max_wait_in_nanos = 123_456;

        let ic_body = encode_config(&cluster, ic_version()).unwrap();
        let classic = crate::types::NDB_VERSION & crate::types::IC_BASE_VERSION_MASK;
        let classic_body = encode_config(&cluster, classic).unwrap();
        // The classic stream is strictly shorter: the gated parameters
        // are absent from every link section.
        assert!(classic_body.len() < ic_body.len());

        let from_ic =
            decode_config(&ic_body, cluster.info.clone(), CodecSource::Wire).unwrap();
        assert_eq!(from_ic.comm(pair).unwrap().max_wait_in_nanos, 123_456);

        let from_classic =
            decode_config(&classic_body, cluster.info.clone(), CodecSource::Wire).unwrap();
        // Not sent, so the decoder keeps the registry default.
        assert_eq!(from_classic.comm(pair).unwrap().max_wait_in_nanos, 50_000);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Round-trip over arbitrary node populations.
        #[test]
        fn round_trip_arbitrary_clusters(
            ids in proptest::collection::btree_set(1u32..40, 2..8),
            kind_seed in proptest::collection::vec(0u32..8, 8),
            generation in 1u32..100,
        ) {
            let mut cluster = ClusterConfig::new(ClusterInfo {
                cluster_name: "prop".to_string(),
                cluster_id: 0,
                password: String::new(),
            });
            for (slot, node_id) in ids.iter().enumerate() {
                let kind = NodeKind::from_wire_value(kind_seed[slot % kind_seed.len()])
                    .unwrap_or(NodeKind::Client);
                let node = make_node(kind, *node_id, &format!("host-{node_id}"));
                cluster.add_node(node).unwrap();
            }
            cluster.system = make_system("prop", generation, 0);
            cluster.synthesize_missing_links();

            let body = encode_config(&cluster, ic_version()).unwrap();
            let decoded = decode_config(&body, cluster.info.clone(), CodecSource::Wire).unwrap();
            prop_assert_eq!(decoded, cluster);
        }
    }
}
