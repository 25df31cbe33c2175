//! The grid: every cluster managed by one group of cluster servers.

use serde::{Deserialize, Serialize};

use super::cluster::ClusterConfig;
use crate::error::{IcError, IcResult};
use crate::types::{ClusterId, IC_MAX_CLUSTER_ID};

/// One cluster-server endpoint a client may fetch configuration from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsEndpoint {
    pub hostname: String,
    pub port: u16,
}

/// All clusters of one grid plus the cluster-server peers serving them.
#[derive(Debug, Clone, Default)]
pub struct GridConfig {
    /// Indexed by cluster id; `None` for unused ids.
    clusters: Vec<Option<ClusterConfig>>,
    pub cluster_servers: Vec<CsEndpoint>,
}

impl GridConfig {
    #[must_use]
    pub fn new() -> GridConfig {
        GridConfig::default()
    }

    /// Installs a cluster under its own cluster id.
    ///
    /// # Errors
    ///
    /// `ConflictingClusterIds` when the id is already taken,
    /// `NoSuchCluster` when the id is above the fixed maximum.
    pub fn add_cluster(&mut self, cluster: ClusterConfig) -> IcResult<()> {
        let cluster_id = cluster.info.cluster_id;
        if cluster_id > IC_MAX_CLUSTER_ID {
            return Err(IcError::NoSuchCluster { cluster_id });
        }
        let index = cluster_id as usize;
        if self.clusters.len() <= index {
            self.clusters.resize(index + 1, None);
        }
        if self.clusters[index].is_some() {
            return Err(IcError::ConflictingClusterIds { cluster_id });
        }
        self.clusters[index] = Some(cluster);
        Ok(())
    }

    #[must_use]
    pub fn cluster(&self, cluster_id: ClusterId) -> Option<&ClusterConfig> {
        self.clusters
            .get(cluster_id as usize)
            .and_then(Option::as_ref)
    }

    pub fn cluster_mut(&mut self, cluster_id: ClusterId) -> Option<&mut ClusterConfig> {
        self.clusters
            .get_mut(cluster_id as usize)
            .and_then(Option::as_mut)
    }

    /// Present cluster ids in ascending order.
    pub fn cluster_ids(&self) -> impl Iterator<Item = ClusterId> + '_ {
        self.clusters
            .iter()
            .enumerate()
            .filter_map(|(id, c)| c.as_ref().map(|_| id as ClusterId))
    }

    /// Present clusters in ascending cluster-id order.
    pub fn clusters(&self) -> impl Iterator<Item = &ClusterConfig> {
        self.clusters.iter().filter_map(Option::as_ref)
    }

    #[must_use]
    pub fn num_clusters(&self) -> usize {
        self.clusters.iter().flatten().count()
    }

    #[must_use]
    pub fn max_cluster_id(&self) -> ClusterId {
        self.cluster_ids().last().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterInfo;

    fn cluster(id: ClusterId) -> ClusterConfig {
        ClusterConfig::new(ClusterInfo {
            cluster_name: format!("c{id}"),
            cluster_id: id,
            password: String::new(),
        })
    }

    #[test]
    fn add_and_lookup() {
        let mut grid = GridConfig::new();
        grid.add_cluster(cluster(0)).unwrap();
        grid.add_cluster(cluster(3)).unwrap();
        assert_eq!(grid.num_clusters(), 2);
        assert_eq!(grid.max_cluster_id(), 3);
        assert!(grid.cluster(0).is_some());
        assert!(grid.cluster(1).is_none());
        assert_eq!(grid.cluster_ids().collect::<Vec<_>>(), vec![0, 3]);
    }

    #[test]
    fn duplicate_cluster_id_conflicts() {
        let mut grid = GridConfig::new();
        grid.add_cluster(cluster(2)).unwrap();
        assert!(matches!(
            grid.add_cluster(cluster(2)),
            Err(IcError::ConflictingClusterIds { cluster_id: 2 })
        ));
    }

    #[test]
    fn cluster_id_bound_enforced() {
        let mut grid = GridConfig::new();
        assert!(matches!(
            grid.add_cluster(cluster(IC_MAX_CLUSTER_ID + 1)),
            Err(IcError::NoSuchCluster { .. })
        ));
    }
}
