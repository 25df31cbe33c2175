//! The `config.version` ownership and generation file.
//!
//! Three CR-terminated ASCII lines, each `<keyword>: <base-10 integer>`:
//! the committed generation, the writer state, and the owning pid. The
//! file itself is the configuration lock; every write is verified by an
//! immediate read-back so a concurrent writer is detected.

use std::io::Write;
use std::path::{Path, PathBuf};

use iclaustron_core::error::{IcError, IcResult};

/// Name of the version file inside the configuration directory.
pub const VERSION_FILE_NAME: &str = "config.version";

/// Writer state recorded in the version file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigState {
    Idle,
    Busy,
    UpdateClusterConfig,
    UpdateConfigs,
}

impl ConfigState {
    #[must_use]
    pub fn as_code(self) -> u32 {
        match self {
            ConfigState::Idle => 0,
            ConfigState::Busy => 1,
            ConfigState::UpdateClusterConfig => 2,
            ConfigState::UpdateConfigs => 3,
        }
    }

    #[must_use]
    pub fn from_code(code: u32) -> Option<ConfigState> {
        match code {
            0 => Some(ConfigState::Idle),
            1 => Some(ConfigState::Busy),
            2 => Some(ConfigState::UpdateClusterConfig),
            3 => Some(ConfigState::UpdateConfigs),
            _ => None,
        }
    }
}

/// Contents of the version file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: u32,
    pub state: ConfigState,
    pub pid: u64,
}

impl VersionInfo {
    /// The state of a directory that has never held a configuration.
    #[must_use]
    pub fn initial() -> VersionInfo {
        VersionInfo {
            version: 0,
            state: ConfigState::Idle,
            pid: 0,
        }
    }
}

fn version_path(dir: &Path) -> PathBuf {
    dir.join(VERSION_FILE_NAME)
}

fn render(info: VersionInfo) -> String {
    format!(
        "version: {}\rstate: {}\rpid: {}\r",
        info.version,
        info.state.as_code(),
        info.pid
    )
}

fn parse_line(line: &str, keyword: &str) -> IcResult<u64> {
    let value = iclaustron_core::protocol::match_key(line, keyword)
        .ok_or(IcError::ProtocolError { line: line!() })?;
    iclaustron_core::protocol::parse_number(value)
        .ok_or(IcError::ProtocolError { line: line!() })
}

fn parse(content: &str) -> IcResult<VersionInfo> {
    let mut lines = content.split('\r');
    let version = parse_line(
        lines.next().ok_or(IcError::ProtocolError { line: line!() })?,
        "version",
    )?;
    let state_code = parse_line(
        lines.next().ok_or(IcError::ProtocolError { line: line!() })?,
        "state",
    )?;
    let pid = parse_line(
        lines.next().ok_or(IcError::ProtocolError { line: line!() })?,
        "pid",
    )?;
    // Only the final terminator may follow.
    if lines.next().is_some_and(|tail| !tail.is_empty()) {
        return Err(IcError::ProtocolError { line: line!() });
    }
    let state = ConfigState::from_code(state_code as u32)
        .ok_or(IcError::ProtocolError { line: line!() })?;
    Ok(VersionInfo {
        version: version as u32,
        state,
        pid,
    })
}

/// Reads the version file; an absent file reads as generation zero, idle.
pub fn read_version(dir: &Path) -> IcResult<VersionInfo> {
    let path = version_path(dir);
    match std::fs::read_to_string(&path) {
        Ok(content) => parse(&content),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(VersionInfo::initial()),
        Err(err) => Err(err.into()),
    }
}

/// Writes the version file synchronously, then reads it back and compares.
///
/// A mismatch means another writer overtook us between the write and the
/// read; the caller must treat the lock as lost.
pub fn write_version(dir: &Path, info: VersionInfo) -> IcResult<()> {
    let path = version_path(dir);
    let rendered = render(info);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .map_err(|_| IcError::FailedToOpenFile {
            path: path.display().to_string(),
        })?;
    file.write_all(rendered.as_bytes())?;
    file.sync_all()?;
    drop(file);

    let reread = read_version(dir)?;
    if reread != info {
        tracing::warn!(?info, ?reread, "version file changed under us");
        return Err(IcError::InconsistentData {
            detail: "version file changed between write and read-back",
        });
    }
    Ok(())
}
