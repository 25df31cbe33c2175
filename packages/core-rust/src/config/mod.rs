//! The cluster configuration value model.
//!
//! Plain data describing one grid of clusters: per-kind node structs, the
//! communication link table keyed by unordered node pair, and the system
//! section. Everything here is immutable once a configuration has been
//! loaded or decoded; readers share it without synchronisation.

mod cluster;
mod grid;
mod link;
mod node;
mod system;

pub use cluster::{ClusterConfig, ClusterInfo, NodePair};
pub use grid::{CsEndpoint, GridConfig};
pub use link::SocketLinkConfig;
pub use node::{
    ClientConfig, ClusterManagerConfig, ClusterServerConfig, CommonNodeConfig,
    DataServerConfig, FileServerConfig, NodeConfig, RepServerConfig, RestoreConfig,
    SqlServerConfig,
};
pub use system::SystemConfig;

use crate::error::IcResult;
use crate::registry::{ParamEntry, ParamValue};

/// A struct that parameters can be written into and read back from by
/// wire config id.
///
/// Replaces the storage-offset scheme of the classic implementation: the
/// registry stays pure metadata and each config struct dispatches on the
/// id itself.
pub trait ParamTarget {
    /// Writes `value` into the field belonging to `entry`, recording the
    /// mandatory bit when the parameter is mandatory.
    ///
    /// The caller is responsible for type and bounds validation; this
    /// method only fails when the entry does not belong to this struct.
    fn set_param(&mut self, entry: &ParamEntry, value: &ParamValue) -> IcResult<()>;

    /// Reads the current value of the field belonging to `entry`, or
    /// `None` when the entry has no field in this struct.
    fn get_param(&self, entry: &ParamEntry) -> Option<ParamValue>;

    /// Mandatory bits assigned so far.
    fn mandatory_bits(&self) -> u64;
}

pub(crate) fn value_as_num(value: &ParamValue) -> IcResult<u64> {
    match value {
        ParamValue::Num(n) => Ok(*n),
        ParamValue::Str(_) => Err(crate::error::IcError::InconsistentData {
            detail: "numeric parameter given a string value",
        }),
    }
}

pub(crate) fn value_as_str(value: &ParamValue) -> IcResult<&str> {
    match value {
        ParamValue::Str(s) => Ok(s),
        ParamValue::Num(_) => Err(crate::error::IcError::InconsistentData {
            detail: "string parameter given a numeric value",
        }),
    }
}
