use parking_lot::Mutex;
use std::path::PathBuf;
#[cfg(not(unix))]
use sysinfo::Pid;
use sysinfo::{ProcessesToUpdate, System};
use thiserror::Error;

/// One entry of the host process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub name: String,
    pub exe: Option<PathBuf>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TerminateError {
    /// Exited before it could be killed
    #[error("process {0} no longer exists")]
    Gone(u32),

    #[error("access denied terminating process {0}")]
    AccessDenied(u32),

    #[error("failed to terminate process {pid}: {message}")]
    Failed { pid: u32, message: String },
}

/// Enumerate and kill host processes
pub trait ProcessTable: Send + Sync {
    fn processes(&self) -> Vec<ProcessInfo>;

    fn terminate(&self, pid: u32) -> Result<(), TerminateError>;
}

/// Live process table backed by `sysinfo`
pub struct SysinfoProcessTable {
    system: Mutex<System>,
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoProcessTable {
    fn processes(&self) -> Vec<ProcessInfo> {
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::All, true);

        system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                parent_pid: process.parent().map(|p| p.as_u32()),
                name: process.name().to_string_lossy().into_owned(),
                exe: process.exe().map(|p| p.to_path_buf()),
            })
            .collect()
    }

    fn terminate(&self, pid: u32) -> Result<(), TerminateError> {
        #[cfg(unix)]
        {
            kill_unix(pid)
        }

        #[cfg(not(unix))]
        {
            let system = self.system.lock();
            match system.process(Pid::from_u32(pid)) {
                None => Err(TerminateError::Gone(pid)),
                Some(process) if process.kill() => Ok(()),
                Some(_) => Err(TerminateError::AccessDenied(pid)),
            }
        }
    }
}

#[cfg(unix)]
fn kill_unix(pid: u32) -> Result<(), TerminateError> {
    // pid 0 and negative values address process groups
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return Err(TerminateError::Failed {
            pid,
            message: "pid out of range".to_string(),
        });
    };
    if raw <= 0 {
        return Err(TerminateError::AccessDenied(pid));
    }

    let ret = unsafe { libc::kill(raw, libc::SIGKILL) };
    if ret == 0 {
        return Ok(());
    }

    let error = std::io::Error::last_os_error();
    match error.raw_os_error() {
        Some(libc::ESRCH) => Err(TerminateError::Gone(pid)),
        Some(libc::EPERM) => Err(TerminateError::AccessDenied(pid)),
        _ => Err(TerminateError::Failed {
            pid,
            message: error.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysinfo_lists_own_process() {
        let table = SysinfoProcessTable::new();
        let own = std::process::id();

        let processes = table.processes();
        assert!(processes.iter().any(|p| p.pid == own));
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_spawned_child() {
        let mut child = std::process::Command::new("/bin/sh")
            .args(["-c", "sleep 30"])
            .spawn()
            .unwrap();

        let table = SysinfoProcessTable::new();
        table.terminate(child.id()).unwrap();

        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
