//! The grid file `config.ini.N`: one `[cluster]` section per cluster
//! with its name, id, and password.

use std::path::{Path, PathBuf};

use iclaustron_core::config::ClusterInfo;
use iclaustron_core::error::{IcError, IcResult};

use super::ini::{parse_ini_file, IniHandler, PASS_FILL, PASS_SIZE};

/// Path of the grid file for a generation.
#[must_use]
pub fn grid_file_path(dir: &Path, version: u32) -> PathBuf {
    dir.join(format!("config.ini.{version}"))
}

/// Path of one cluster's file for a generation.
#[must_use]
pub fn cluster_file_path(dir: &Path, cluster_name: &str, version: u32) -> PathBuf {
    dir.join(format!("{cluster_name}.ini.{version}"))
}

#[derive(Default)]
struct GridFileHandler {
    num_sections: usize,
    clusters: Vec<ClusterInfo>,
    current: Option<ClusterInfo>,
}

impl GridFileHandler {
    fn complete_current(&mut self, line: u32) -> IcResult<()> {
        if let Some(info) = self.current.take() {
            if info.cluster_name.is_empty() {
                return Err(IcError::NoSuchConfigKey {
                    key: "cluster_name".to_string(),
                    line,
                });
            }
            self.clusters.push(info);
        }
        Ok(())
    }
}

impl IniHandler for GridFileHandler {
    fn init(&mut self, pass: u32) -> IcResult<()> {
        if pass == PASS_FILL {
            self.clusters = Vec::with_capacity(self.num_sections);
        }
        Ok(())
    }

    fn add_section(&mut self, name: &str, pass: u32, line: u32) -> IcResult<()> {
        if name != "cluster" {
            return Err(IcError::ProtocolError { line });
        }
        if pass == PASS_SIZE {
            self.num_sections += 1;
        } else {
            self.complete_current(line)?;
            self.current = Some(ClusterInfo::default());
        }
        Ok(())
    }

    fn add_key(&mut self, key: &str, value: &str, pass: u32, line: u32) -> IcResult<()> {
        if pass == PASS_SIZE {
            return Ok(());
        }
        let Some(current) = self.current.as_mut() else {
            return Err(IcError::NoSectionDefinedYet { line });
        };
        match key {
            "cluster_name" => current.cluster_name = value.to_string(),
            "cluster_id" => {
                current.cluster_id = iclaustron_core::protocol::parse_number(value)
                    .ok_or_else(|| IcError::WrongConfigNumber {
                        key: key.to_string(),
                        line,
                    })? as u32;
            }
            "password" => current.password = value.to_string(),
            _ => {
                return Err(IcError::NoSuchConfigKey {
                    key: key.to_string(),
                    line,
                })
            }
        }
        Ok(())
    }

    fn verify(&mut self, pass: u32) -> IcResult<()> {
        if pass == PASS_FILL {
            self.complete_current(0)?;
        }
        Ok(())
    }
}

/// Loads the grid file of a generation.
pub fn load_grid(dir: &Path, version: u32) -> IcResult<Vec<ClusterInfo>> {
    load_grid_file(&grid_file_path(dir, version))
}

/// Loads a grid file by explicit path (used at bootstrap, before any
/// generation exists).
pub fn load_grid_file(path: &Path) -> IcResult<Vec<ClusterInfo>> {
    let mut handler = GridFileHandler::default();
    parse_ini_file(path, &mut handler)?;
    if handler.clusters.is_empty() {
        return Err(IcError::NoNodesFound);
    }
    Ok(handler.clusters)
}

/// Writes the grid file of a generation.
pub fn write_grid_file(dir: &Path, version: u32, clusters: &[ClusterInfo]) -> IcResult<()> {
    let mut content = String::new();
    for info in clusters {
        content.push_str("[cluster]\n");
        content.push_str(&format!("cluster_name = {}\n", info.cluster_name));
        content.push_str(&format!("cluster_id = {}\n", info.cluster_id));
        content.push_str(&format!("password = {}\n", info.password));
        content.push('\n');
    }
    std::fs::write(grid_file_path(dir, version), content)?;
    Ok(())
}
