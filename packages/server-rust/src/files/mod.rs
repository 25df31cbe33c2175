//! The on-disk configuration store.
//!
//! Versioned INI files (`config.ini.N`, `<cluster>.ini.N`) plus the
//! `config.version` ownership file with transactional multi-file commit.

pub mod cluster_file;
pub mod commit;
pub mod grid_file;
pub mod ini;
pub mod process;
pub mod version;

pub use cluster_file::{load_cluster, write_cluster_file};
pub use commit::{
    commit_new_generation, commit_new_generation_with, delete_generation_files, load_generation,
    lock_and_load, unlock,
};
pub use grid_file::{cluster_file_path, grid_file_path, load_grid, load_grid_file, write_grid_file};
pub use ini::{parse_ini_file, parse_ini_str, IniHandler};
pub use process::{ProcProcessCheck, ProcessCheck, StaticProcessCheck};
pub use version::{read_version, write_version, ConfigState, VersionInfo};
