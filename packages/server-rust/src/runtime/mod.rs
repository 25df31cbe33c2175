//! The cluster-server runtime.

pub mod cluster_server;

pub use cluster_server::{ClusterServer, CsOptions, CsState};
