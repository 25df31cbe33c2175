//! iClaustron Core -- parameter registry, cluster configuration model,
//! and wire codecs.
//!
//! This crate is the pure data layer of the iClaustron configuration and
//! transport substrate:
//!
//! - **Registry** ([`registry`]): the process-wide table of configuration
//!   parameters with id/name maps and per-kind mandatory masks
//! - **Config** ([`config`]): cluster and grid value model with the
//!   communication link table
//! - **Codec** ([`codec`]): base64 / 32-bit key-value wire format with
//!   verification string and XOR checksum
//! - **Frame** ([`frame`]): NDB message framing with byte-order
//!   normalisation and optional message-id and checksum words
//! - **Protocol** ([`protocol`]): the CR-terminated line vocabulary
//! - **Error** ([`error`]): the process-wide error taxonomy

pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod query;
pub mod registry;
pub mod types;

// Error
pub use error::{IcError, IcResult};

// Types
pub use types::{ClusterId, NodeId, NodeKind, IC_MAX_CLUSTER_ID, IC_MAX_NODE_ID};

// Registry
pub use registry::{ParamEntry, ParamType, ParamValue, Registry};

// Config
pub use config::{
    ClusterConfig, ClusterInfo, CsEndpoint, GridConfig, NodeConfig, NodePair, ParamTarget,
    SocketLinkConfig, SystemConfig,
};

// Codec
pub use codec::{decode_config, encode_config, CodecSource};

// Query shapes
pub use query::{ApidQuery, QueryKind, RangeCondition, WhereCondition};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
