//! The installed parameter set.
//!
//! One function returns every parameter record the process knows about.
//! Wire ids are sparse and stable; they are part of the wire format and
//! must never be reused for a different meaning.

use super::entry::{ChangeClass, ParamEntry, ParamType};
use crate::types::{kind_mask, NodeKind};

/// Wire ids referenced from code outside the registry.
pub mod ids {
    /// Node id key, present in every node and link section.
    pub const NODE_ID: u32 = 3;
    /// Hostname of a node.
    pub const HOSTNAME: u32 = 5;
    /// Link server port, the parameter updated by dynamic-port reporting.
    pub const SERVER_PORT_NUMBER: u32 = 406;
    /// First node id of a link.
    pub const FIRST_NODE_ID: u32 = 400;
    /// Second node id of a link.
    pub const SECOND_NODE_ID: u32 = 401;
    /// Cluster name in the system section.
    pub const SYSTEM_NAME: u32 = 1101;
    /// Configuration generation in the system section.
    pub const SYSTEM_CONFIGURATION_NUMBER: u32 = 1102;
    /// Primary cluster server in the system section.
    pub const SYSTEM_PRIMARY_CS_NODE: u32 = 1103;
}

/// Every parameter record, in dense index order.
///
/// Grouping mirrors the struct the parameter lands in: the common node
/// part first, then one block per node kind, then links, then the system
/// section.
#[allow(clippy::too_many_lines)]
pub(super) fn install_entries() -> Vec<ParamEntry> {
    use kind_mask::{only, ALL_NODES, COMM, SYSTEM};

    let mut entries = Vec::with_capacity(64);

    // Common node parameters.
    entries.push(
        ParamEntry::num("node_id", ids::NODE_ID, ParamType::U32, ALL_NODES, 0)
            .range(1, u64::from(crate::types::IC_MAX_NODE_ID))
            .mandatory(0)
            .key_member()
            .change(ChangeClass::NotChangeable),
    );
    entries.push(
        ParamEntry::string("hostname", ids::HOSTNAME, ALL_NODES, "")
            .mandatory(1)
            .change(ChangeClass::NodeRestart),
    );
    entries.push(ParamEntry::string("node_data_path", 7, ALL_NODES, ""));
    entries.push(
        ParamEntry::string("node_name", 14, ALL_NODES, "")
            .derived()
            .change(ChangeClass::Online),
    );
    entries.push(ParamEntry::string("pcntrl_hostname", 24, ALL_NODES, "").derived());
    entries.push(
        ParamEntry::num("pcntrl_port", 25, ParamType::U16, ALL_NODES, 11860).min_value(1),
    );

    // Data server parameters.
    let ds = only(NodeKind::DataServer);
    entries.push(ParamEntry::string("filesystem_path", 101, ds, "").derived());
    entries.push(
        ParamEntry::string("data_server_checkpoint_path", 102, ds, "").derived(),
    );
    entries.push(
        ParamEntry::num(
            "data_server_memory_size",
            103,
            ParamType::U64,
            ds,
            256 * 1024 * 1024,
        )
        .range(32 * 1024 * 1024, 1 << 40)
        .change(ChangeClass::RollingUpgrade),
    );
    entries.push(
        ParamEntry::num("data_server_max_threads", 104, ParamType::U32, ds, 4).range(1, 64),
    );
    entries.push(
        ParamEntry::num(
            "data_server_local_checkpoint_timer",
            105,
            ParamType::U32,
            ds,
            20_000,
        )
        .range(100, 3_600_000)
        .change(ChangeClass::Online),
    );
    entries.push(
        ParamEntry::num("data_server_heartbeat_timer", 106, ParamType::U32, ds, 3000)
            .range(100, 60_000)
            .change(ChangeClass::RollingUpgradeSpecial),
    );
    entries.push(
        ParamEntry::num(
            "data_server_redo_log_memory",
            107,
            ParamType::U64,
            ds,
            64 * 1024 * 1024,
        )
        .min_value(1024 * 1024)
        .change(ChangeClass::ClusterRestart),
    );
    entries.push(
        ParamEntry::boolean("data_server_volatile_mode", 108, ds, false)
            .change(ChangeClass::InitialNodeRestart),
    );

    // Client parameters.
    let cl = only(NodeKind::Client);
    entries.push(
        ParamEntry::num("client_batch_size", 201, ParamType::U32, cl, 64).range(1, 992),
    );
    entries.push(
        ParamEntry::num("client_batch_byte_size", 202, ParamType::U32, cl, 16_384)
            .range(128, 1 << 20),
    );

    // Cluster server parameters.
    let cs = only(NodeKind::ClusterServer);
    entries.push(
        ParamEntry::num(
            "cluster_server_port_number",
            301,
            ParamType::U16,
            cs,
            u64::from(crate::types::IC_DEF_CLUSTER_SERVER_PORT),
        )
        .min_value(1)
        .mandatory(2),
    );
    entries.push(ParamEntry::string("cluster_server_event_log", 302, cs, ""));

    // One port parameter per remaining server kind.
    entries.push(
        ParamEntry::num(
            "sql_server_port_number",
            321,
            ParamType::U16,
            only(NodeKind::SqlServer),
            3306,
        )
        .min_value(1),
    );
    entries.push(
        ParamEntry::num(
            "rep_server_port_number",
            341,
            ParamType::U16,
            only(NodeKind::RepServer),
            12_004,
        )
        .min_value(1),
    );
    entries.push(
        ParamEntry::num(
            "file_server_port_number",
            361,
            ParamType::U16,
            only(NodeKind::FileServer),
            12_005,
        )
        .min_value(1),
    );
    entries.push(
        ParamEntry::num(
            "restore_parallelism",
            381,
            ParamType::U32,
            only(NodeKind::Restore),
            1,
        )
        .range(1, 64),
    );
    entries.push(
        ParamEntry::num(
            "cluster_manager_port_number",
            501,
            ParamType::U16,
            only(NodeKind::ClusterManager),
            12_003,
        )
        .min_value(1),
    );

    // Communication link parameters.
    entries.push(
        ParamEntry::num("first_node_id", ids::FIRST_NODE_ID, ParamType::U32, COMM, 0)
            .range(1, u64::from(crate::types::IC_MAX_NODE_ID))
            .mandatory(0)
            .key_member()
            .change(ChangeClass::NotChangeable),
    );
    entries.push(
        ParamEntry::num("second_node_id", ids::SECOND_NODE_ID, ParamType::U32, COMM, 0)
            .range(1, u64::from(crate::types::IC_MAX_NODE_ID))
            .mandatory(1)
            .key_member()
            .change(ChangeClass::NotChangeable),
    );
    entries.push(
        ParamEntry::boolean("use_message_id", 402, COMM, false)
            .change(ChangeClass::RollingUpgrade),
    );
    entries.push(
        ParamEntry::boolean("use_checksum", 403, COMM, false)
            .change(ChangeClass::RollingUpgrade),
    );
    entries.push(ParamEntry::string("first_hostname", 404, COMM, "").derived());
    entries.push(ParamEntry::string("second_hostname", 405, COMM, "").derived());
    entries.push(
        ParamEntry::num(
            "server_port_number",
            ids::SERVER_PORT_NUMBER,
            ParamType::U32,
            COMM,
            0,
        )
        .range(1, 65_535)
        .mandatory(2)
        .change(ChangeClass::Online),
    );
    entries.push(
        ParamEntry::num("server_node_id", 407, ParamType::U32, COMM, 0).derived(),
    );
    entries.push(
        ParamEntry::num("socket_write_buffer_size", 408, ParamType::U32, COMM, 262_144)
            .min_value(16_384),
    );
    entries.push(
        ParamEntry::num("socket_read_buffer_size", 409, ParamType::U32, COMM, 65_536)
            .min_value(16_384),
    );
    entries.push(
        ParamEntry::num("socket_max_wait_in_nanos", 410, ParamType::U32, COMM, 50_000)
            .range(0, 10_000_000)
            .iclaustron_only()
            .change(ChangeClass::Online),
    );
    // Superseded by per-address binding in the process controller; kept so
    // old configurations still decode.
    entries.push(ParamEntry::string("socket_bind_address", 412, COMM, "").deprecated());
    entries.push(
        ParamEntry::num("socket_overload_limit", 413, ParamType::U32, COMM, 0)
            .not_configurable()
            .not_sent(),
    );

    // System section parameters.
    entries.push(ParamEntry::string("system_name", ids::SYSTEM_NAME, SYSTEM, "").mandatory(0));
    entries.push(
        ParamEntry::num(
            "system_configuration_number",
            ids::SYSTEM_CONFIGURATION_NUMBER,
            ParamType::U32,
            SYSTEM,
            0,
        )
        .change(ChangeClass::Online),
    );
    entries.push(
        ParamEntry::num(
            "system_primary_cs_node",
            ids::SYSTEM_PRIMARY_CS_NODE,
            ParamType::U32,
            SYSTEM,
            0,
        )
        .change(ChangeClass::Online),
    );

    entries
}
