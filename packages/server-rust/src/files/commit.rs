//! Transactional generation commit and the configuration ownership lock.

use std::path::Path;

use iclaustron_core::config::{ClusterInfo, GridConfig};
use iclaustron_core::error::{IcError, IcResult};

use super::cluster_file::{load_cluster, write_cluster_file};
use super::grid_file::{cluster_file_path, grid_file_path, load_grid, write_grid_file};
use super::process::ProcessCheck;
use super::version::{read_version, write_version, ConfigState, VersionInfo, VERSION_FILE_NAME};
use iclaustron_core::config::ClusterConfig;

/// Removes one generation's files. Missing files are ignored: a crashed
/// prior commit may have removed some of them already.
pub fn delete_generation_files(dir: &Path, version: u32, clusters: &[ClusterInfo]) {
    for info in clusters {
        let _ = std::fs::remove_file(cluster_file_path(dir, &info.cluster_name, version));
    }
    let _ = std::fs::remove_file(grid_file_path(dir, version));
}

/// Commits a new configuration generation.
///
/// 1. Sweep leftovers of generation `old - 1` from a crashed prior commit.
/// 2. Write every cluster file and the grid file at `old + 1`.
/// 3. Rewrite `config.version` -- the commit point.
/// 4. Remove generation `old`.
///
/// On a failure during step 2 the new generation's files are removed; if
/// no generation existed yet, the version file is removed too.
pub fn commit_new_generation(
    dir: &Path,
    clusters: &[ClusterConfig],
    old_version: u32,
) -> IcResult<u32> {
    commit_new_generation_with(dir, clusters, old_version, || Ok(()))
}

/// [`commit_new_generation`] with a hook between the file writes and the
/// version-file commit point, where a multi-server quorum round slots in.
pub fn commit_new_generation_with(
    dir: &Path,
    clusters: &[ClusterConfig],
    old_version: u32,
    pre_commit: impl FnOnce() -> IcResult<()>,
) -> IcResult<u32> {
    let new_version = old_version + 1;
    let infos: Vec<ClusterInfo> = clusters.iter().map(|c| c.info.clone()).collect();

    if old_version >= 2 {
        delete_generation_files(dir, old_version - 1, &infos);
    }

    let write_all = || -> IcResult<()> {
        for cluster in clusters {
            let path = cluster_file_path(dir, &cluster.info.cluster_name, new_version);
            write_cluster_file(&path, cluster)?;
        }
        write_grid_file(dir, new_version, &infos)?;
        pre_commit()
    };
    if let Err(err) = write_all() {
        delete_generation_files(dir, new_version, &infos);
        if old_version == 0 {
            let _ = std::fs::remove_file(dir.join(VERSION_FILE_NAME));
        }
        return Err(err);
    }

    write_version(
        dir,
        VersionInfo {
            version: new_version,
            state: ConfigState::Busy,
            pid: u64::from(std::process::id()),
        },
    )?;
    tracing::info!(old_version, new_version, "configuration generation committed");

    if old_version >= 1 {
        delete_generation_files(dir, old_version, &infos);
    }
    Ok(new_version)
}

/// Loads one committed generation from disk into a grid.
pub fn load_generation(dir: &Path, version: u32) -> IcResult<GridConfig> {
    let infos = load_grid(dir, version)?;
    let mut grid = GridConfig::new();
    for info in infos {
        let path = cluster_file_path(dir, &info.cluster_name, version);
        let cluster = load_cluster(&path, info, version)?;
        cluster.verify()?;
        grid.add_cluster(cluster)?;
    }
    Ok(grid)
}

/// Takes the configuration ownership lock and loads the current
/// generation.
///
/// Idle directories are claimed directly. A busy state whose recorded
/// owner is no longer alive (under the recorded process name) is
/// reclaimed the same way; a live owner means the configuration belongs
/// to someone else.
///
/// Returns the committed version (zero for a directory that has never
/// held a configuration, with an empty grid) and the loaded grid.
pub fn lock_and_load(
    dir: &Path,
    process_name: &str,
    check: &dyn ProcessCheck,
) -> IcResult<(u32, GridConfig)> {
    let info = read_version(dir)?;
    let own_pid = u64::from(std::process::id());

    match info.state {
        ConfigState::Idle => {}
        ConfigState::Busy | ConfigState::UpdateClusterConfig | ConfigState::UpdateConfigs => {
            if info.pid != own_pid && check.is_alive(info.pid, process_name)? {
                return Err(IcError::CouldNotLockConfiguration { pid: info.pid });
            }
            tracing::info!(
                pid = info.pid,
                "reclaiming configuration lock from dead owner"
            );
        }
    }

    if info.version == 0 {
        // Nothing committed yet; the caller bootstraps generation 1, and
        // the commit itself writes the first version file.
        return Ok((0, GridConfig::new()));
    }

    write_version(
        dir,
        VersionInfo {
            version: info.version,
            state: ConfigState::Busy,
            pid: own_pid,
        },
    )?;
    let grid = load_generation(dir, info.version)?;
    Ok((info.version, grid))
}

/// Releases the ownership lock at shutdown: state back to idle, pid
/// cleared, version kept.
pub fn unlock(dir: &Path) -> IcResult<()> {
    let info = read_version(dir)?;
    write_version(
        dir,
        VersionInfo {
            version: info.version,
            state: ConfigState::Idle,
            pid: 0,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::process::StaticProcessCheck;
    use iclaustron_core::config::{NodeConfig, ParamTarget};
    use iclaustron_core::registry::{ParamValue, Registry};
    use iclaustron_core::types::NodeKind;

    fn set(target: &mut dyn ParamTarget, name: &str, value: ParamValue) {
        let entry = Registry::global().lookup_by_name(name).unwrap();
        target.set_param(entry, &value).unwrap();
    }

    fn sample_cluster(name: &str, cluster_id: u32) -> ClusterConfig {
        let mut cluster = ClusterConfig::new(ClusterInfo {
            cluster_name: name.to_string(),
            cluster_id,
            password: "p".to_string(),
        });
        let mut ds = NodeConfig::with_defaults(NodeKind::DataServer);
        set(&mut ds, "node_id", ParamValue::Num(1));
        set(&mut ds, "hostname", ParamValue::Str("ds1".to_string()));
        cluster.add_node(ds).unwrap();
        let mut cs = NodeConfig::with_defaults(NodeKind::ClusterServer);
        set(&mut cs, "node_id", ParamValue::Num(4));
        set(&mut cs, "hostname", ParamValue::Str("cs1".to_string()));
        set(&mut cs, "cluster_server_port_number", ParamValue::Num(1186));
        cluster.add_node(cs).unwrap();
        cluster.synthesize_missing_links();
        cluster
    }

    #[test]
    fn bootstrap_commit_produces_generation_one() {
        let dir = tempfile::tempdir().unwrap();
        let clusters = vec![sample_cluster("kalle", 0)];
        let version = commit_new_generation(dir.path(), &clusters, 0).unwrap();
        assert_eq!(version, 1);

        let info = read_version(dir.path()).unwrap();
        assert_eq!(info.version, 1);
        assert_eq!(info.state, ConfigState::Busy);
        assert_eq!(info.pid, u64::from(std::process::id()));

        assert!(grid_file_path(dir.path(), 1).exists());
        assert!(cluster_file_path(dir.path(), "kalle", 1).exists());
        assert!(!grid_file_path(dir.path(), 0).exists());
    }

    #[test]
    fn version_monotone_and_old_generation_removed() {
        let dir = tempfile::tempdir().unwrap();
        let clusters = vec![sample_cluster("kalle", 0)];
        let v1 = commit_new_generation(dir.path(), &clusters, 0).unwrap();
        let v2 = commit_new_generation(dir.path(), &clusters, v1).unwrap();
        assert_eq!(v2, v1 + 1);
        assert!(!grid_file_path(dir.path(), v1).exists());
        assert!(grid_file_path(dir.path(), v2).exists());
    }

    #[test]
    fn crashed_commit_leftovers_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let clusters = vec![sample_cluster("kalle", 0)];
        // Committed generation 3 with stray generation-2 files left by a
        // crash between its steps 3 and 4.
        for old in [0u32, 1, 2] {
            commit_new_generation(dir.path(), &clusters, old).unwrap();
        }
        std::fs::write(grid_file_path(dir.path(), 2), "[cluster]\n").unwrap();
        std::fs::write(cluster_file_path(dir.path(), "kalle", 2), "junk").unwrap();

        let v4 = commit_new_generation(dir.path(), &clusters, 3).unwrap();
        assert_eq!(v4, 4);
        assert!(!grid_file_path(dir.path(), 2).exists());
        assert!(!cluster_file_path(dir.path(), "kalle", 2).exists());
        assert!(!grid_file_path(dir.path(), 3).exists());
        assert!(grid_file_path(dir.path(), 4).exists());
    }

    #[test]
    fn lock_and_load_round_trips_committed_grid() {
        let dir = tempfile::tempdir().unwrap();
        let clusters = vec![sample_cluster("kalle", 0), sample_cluster("olle", 1)];
        commit_new_generation(dir.path(), &clusters, 0).unwrap();

        let check = StaticProcessCheck { alive: false };
        let (version, grid) = lock_and_load(dir.path(), "ic_csd", &check).unwrap();
        assert_eq!(version, 1);
        assert_eq!(grid.num_clusters(), 2);
        let kalle = grid.cluster(0).unwrap();
        assert_eq!(kalle.num_nodes(), 2);
        assert_eq!(kalle.system.configuration_number, 1);
        kalle.verify().unwrap();
    }

    #[test]
    fn live_owner_blocks_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        commit_new_generation(dir.path(), &[sample_cluster("kalle", 0)], 0).unwrap();
        // Pretend someone else holds it.
        write_version(
            dir.path(),
            VersionInfo {
                version: 1,
                state: ConfigState::Busy,
                pid: 999_999,
            },
        )
        .unwrap();

        let alive = StaticProcessCheck { alive: true };
        assert!(matches!(
            lock_and_load(dir.path(), "ic_csd", &alive),
            Err(IcError::CouldNotLockConfiguration { pid: 999_999 })
        ));

        let dead = StaticProcessCheck { alive: false };
        let (version, _) = lock_and_load(dir.path(), "ic_csd", &dead).unwrap();
        assert_eq!(version, 1);
        assert_eq!(
            read_version(dir.path()).unwrap().pid,
            u64::from(std::process::id())
        );
    }

    #[test]
    fn unlock_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        commit_new_generation(dir.path(), &[sample_cluster("kalle", 0)], 0).unwrap();
        unlock(dir.path()).unwrap();
        let info = read_version(dir.path()).unwrap();
        assert_eq!(info.state, ConfigState::Idle);
        assert_eq!(info.pid, 0);
        assert_eq!(info.version, 1);
    }

    #[test]
    fn empty_directory_locks_at_version_zero() {
        let dir = tempfile::tempdir().unwrap();
        let check = StaticProcessCheck { alive: false };
        let (version, grid) = lock_and_load(dir.path(), "ic_csd", &check).unwrap();
        assert_eq!(version, 0);
        assert_eq!(grid.num_clusters(), 0);
    }

    #[test]
    fn failed_bootstrap_commit_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let clusters = vec![sample_cluster("kalle", 0)];
        let err = commit_new_generation_with(dir.path(), &clusters, 0, || {
            Err(IcError::StopOrdered)
        })
        .unwrap_err();
        assert!(matches!(err, IcError::StopOrdered));
        assert!(!grid_file_path(dir.path(), 1).exists());
        assert!(!cluster_file_path(dir.path(), "kalle", 1).exists());
        assert!(!dir.path().join(VERSION_FILE_NAME).exists());
    }
}
