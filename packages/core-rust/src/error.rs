//! Process-wide error taxonomy.
//!
//! Every layer of the system reports through [`IcError`]. Variants carry
//! the diagnostic detail that ends up in the final human-readable message:
//! parser line numbers, offending key names, node and cluster ids.

use std::io;

/// Errors surfaced by the configuration and transport core.
#[derive(Debug, thiserror::Error)]
pub enum IcError {
    /// An allocation or pool reservation failed.
    #[error("memory allocation failed")]
    MemAlloc,

    /// Malformed wire input, either line text or a binary frame.
    ///
    /// `line` is the source line of the check that failed, captured for
    /// diagnostics the way the protocol drivers report it.
    #[error("protocol error (detected at source line {line})")]
    ProtocolError { line: u32 },

    /// The NDB transporter login exchange was rejected.
    #[error("authentication failed during transporter login")]
    AuthenticateError,

    /// The peer node is not up.
    #[error("node {node_id} in cluster {cluster_id} is down")]
    NodeDown { cluster_id: u32, node_id: u32 },

    /// No node with this id exists in the cluster.
    #[error("no node {node_id} in cluster {cluster_id}")]
    NoSuchNode { cluster_id: u32, node_id: u32 },

    /// No cluster with this id exists in the grid.
    #[error("no cluster with id {cluster_id}")]
    NoSuchCluster { cluster_id: u32 },

    /// No cluster server could be reached by the client driver.
    #[error("could not fetch configuration from any cluster server")]
    GetConfigByClusterServer,

    /// Two clusters resolved to the same cluster id.
    #[error("conflicting cluster ids: {cluster_id} appears more than once")]
    ConflictingClusterIds { cluster_id: u32 },

    /// A node id appeared more than once inside one cluster.
    #[error("conflicting node ids: {node_id} defined more than once")]
    ConflictingIds { node_id: u32 },

    /// A node section re-defined an already-defined node.
    #[error("node {node_id} already defined (line {line})")]
    NodeAlreadyDefined { node_id: u32, line: u32 },

    /// A cluster file defined no nodes at all.
    #[error("no nodes found in cluster configuration file")]
    NoNodesFound,

    /// A key that is not a configuration parameter name.
    #[error("no such configuration key `{key}` (line {line})")]
    NoSuchConfigKey { key: String, line: u32 },

    /// A real parameter used in a section of the wrong kind.
    #[error("key `{key}` is valid but not in this section kind (line {line})")]
    CorrectConfigInWrongSection { key: String, line: u32 },

    /// A numeric value failed to parse.
    #[error("value for `{key}` is not a valid number (line {line})")]
    WrongConfigNumber { key: String, line: u32 },

    /// A boolean parameter given a non-boolean value.
    #[error("value for `{key}` is not a boolean (line {line})")]
    NoBooleanValue { key: String, line: u32 },

    /// A value outside the parameter's min/max window.
    #[error("value {value} for `{key}` out of bounds (line {line})")]
    ConfigValueOutOfBounds { key: String, value: u64, line: u32 },

    /// A key line seen before any section header.
    #[error("configuration key before any section (line {line})")]
    NoSectionDefinedYet { line: u32 },

    /// A node section completed without all mandatory parameters.
    #[error("node {node_id} is missing mandatory parameters: {missing}")]
    MissingMandatory { node_id: u32, missing: String },

    /// The ownership file is held by a live process.
    #[error("configuration is locked by live process {pid}")]
    CouldNotLockConfiguration { pid: u64 },

    /// The process-liveness check itself could not be performed.
    #[error("unable to check process liveness")]
    CheckProcessScript,

    /// The recorded owner process is not alive.
    #[error("recorded owner process {pid} is not alive")]
    ProcessNotAlive { pid: u64 },

    /// A file open failed.
    #[error("failed to open file {path}")]
    FailedToOpenFile { path: String },

    /// On-disk or in-memory state failed an internal consistency check.
    #[error("inconsistent data: {detail}")]
    InconsistentData { detail: &'static str },

    /// A framed message failed its checksum.
    #[error("message checksum mismatch")]
    MessageChecksum,

    /// A registry translation index was out of range.
    #[error("translation index out of bound")]
    TranslationIndexOutOfBound,

    /// Cooperative cancellation was ordered.
    #[error("stop ordered")]
    StopOrdered,

    /// A wire config id or parameter name unknown to the registry.
    #[error("unknown configuration parameter `{ident}`")]
    UnknownParameter { ident: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl IcError {
    /// Protocol error tagged with the caller's source line.
    ///
    /// Used as `IcError::protocol(line!())` at every wire-format check so
    /// a malformed conversation points at the exact check that failed.
    #[must_use]
    pub fn protocol(line: u32) -> Self {
        IcError::ProtocolError { line }
    }

    /// True for errors that abort only the current connection or session,
    /// leaving the process able to continue serving others.
    #[must_use]
    pub fn is_session_local(&self) -> bool {
        matches!(
            self,
            IcError::ProtocolError { .. }
                | IcError::AuthenticateError
                | IcError::NodeDown { .. }
                | IcError::MessageChecksum
        )
    }

    /// Composes the final user-visible message, mirroring what the
    /// binaries print before exiting with a non-zero code.
    #[must_use]
    pub fn fill_error_buffer(&self) -> String {
        format!("iClaustron error: {self}")
    }

    /// Maps the error kind to a process exit code.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            IcError::MemAlloc => 2,
            IcError::ProtocolError { .. } => 3,
            IcError::AuthenticateError => 4,
            IcError::CouldNotLockConfiguration { .. }
            | IcError::CheckProcessScript
            | IcError::ProcessNotAlive { .. } => 5,
            IcError::StopOrdered => 0,
            _ => 1,
        }
    }
}

/// Shorthand result type used throughout both crates.
pub type IcResult<T> = Result<T, IcError>;
