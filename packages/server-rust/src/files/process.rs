//! Process liveness for the configuration ownership lock.

use std::path::Path;

use iclaustron_core::error::{IcError, IcResult};

/// Answers whether the process recorded in the version file is alive.
pub trait ProcessCheck: Send + Sync {
    /// True when a process with this pid exists and runs under the given
    /// process name.
    fn is_alive(&self, pid: u64, process_name: &str) -> IcResult<bool>;
}

/// Liveness via the proc filesystem: a pid directory whose `comm` matches
/// the recorded process name counts as alive. A pid reused by an
/// unrelated program does not.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcProcessCheck;

impl ProcessCheck for ProcProcessCheck {
    fn is_alive(&self, pid: u64, process_name: &str) -> IcResult<bool> {
        if !Path::new("/proc").is_dir() {
            return Err(IcError::CheckProcessScript);
        }
        let comm_path = format!("/proc/{pid}/comm");
        match std::fs::read_to_string(&comm_path) {
            Ok(comm) => Ok(comm.trim_end() == process_name),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(_) => Err(IcError::CheckProcessScript),
        }
    }
}

/// Fixed-answer check for tests and for platforms without procfs.
#[derive(Debug, Clone, Copy)]
pub struct StaticProcessCheck {
    pub alive: bool,
}

impl ProcessCheck for StaticProcessCheck {
    fn is_alive(&self, _pid: u64, _process_name: &str) -> IcResult<bool> {
        Ok(self.alive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive_under_its_own_name() {
        let check = ProcProcessCheck;
        let pid = u64::from(std::process::id());
        let comm = std::fs::read_to_string(format!("/proc/{pid}/comm"));
        let Ok(comm) = comm else {
            // No procfs on this platform; nothing to assert.
            return;
        };
        assert!(check.is_alive(pid, comm.trim_end()).unwrap());
        assert!(!check.is_alive(pid, "definitely-not-this").unwrap());
    }

    #[test]
    fn dead_pid_is_not_alive() {
        if !Path::new("/proc").is_dir() {
            return;
        }
        // Pid numbers near the u32 ceiling are not in use on test hosts.
        let check = ProcProcessCheck;
        assert!(!check.is_alive(4_294_900_000, "anything").unwrap());
    }
}
