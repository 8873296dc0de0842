use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::kiosk::policy::{PolicyError, PolicyKey, PolicyStore};
use crate::platform::common::{atomic_write, set_owner_only};

/// Lockdown switches kept in a JSON document
///
/// Linux has no policy registry; the kiosk shell session reads this file
/// (`{"task_manager": 1, ...}`) to decide which escape hatches to disable.
/// A missing file means every switch is absent.
pub struct FilePolicyStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FilePolicyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self, key: PolicyKey) -> Result<BTreeMap<PolicyKey, u32>, PolicyError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents =
            std::fs::read_to_string(&self.path).map_err(|e| PolicyError::from_io(key, &e))?;
        serde_json::from_str(&contents).map_err(|e| PolicyError::Backend {
            key,
            message: format!("{} is corrupt: {}", self.path.display(), e),
        })
    }

    fn update<F>(&self, key: PolicyKey, change: F) -> Result<(), PolicyError>
    where
        F: FnOnce(&mut BTreeMap<PolicyKey, u32>),
    {
        let _guard = self.write_lock.lock();
        let mut values = self.read(key)?;
        change(&mut values);

        let json = serde_json::to_string_pretty(&values).map_err(|e| PolicyError::Backend {
            key,
            message: e.to_string(),
        })?;
        atomic_write(&self.path, json.as_bytes())
            .and_then(|()| set_owner_only(&self.path))
            .map_err(|e| PolicyError::Backend {
                key,
                message: format!("{e:#}"),
            })
    }
}

impl PolicyStore for FilePolicyStore {
    fn get(&self, key: PolicyKey) -> Result<Option<u32>, PolicyError> {
        Ok(self.read(key)?.get(&key).copied())
    }

    fn set(&self, key: PolicyKey, value: u32) -> Result<(), PolicyError> {
        self.update(key, |values| {
            values.insert(key, value);
        })
    }

    fn remove(&self, key: PolicyKey) -> Result<(), PolicyError> {
        self.update(key, |values| {
            values.remove(&key);
        })
    }
}

/// Lock the session, trying the common desktop mechanisms in turn
pub fn lock_workstation() -> Result<()> {
    let candidates: [(&str, &[&str]); 4] = [
        ("loginctl", &["lock-session"]),
        ("xdg-screensaver", &["lock"]),
        ("gnome-screensaver-command", &["--lock"]),
        ("xscreensaver-command", &["-lock"]),
    ];

    for (cmd, args) in candidates {
        if try_command(cmd, args).is_ok() {
            return Ok(());
        }
    }
    anyhow::bail!("No supported screen lock mechanism found on this Linux system")
}

pub fn shutdown_computer() -> Result<()> {
    if try_command("systemctl", &["poweroff"]).is_ok() {
        return Ok(());
    }
    try_command("shutdown", &["-h", "now"])
        .context("No supported shutdown mechanism found on this Linux system")
}

fn try_command(cmd: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(cmd).args(args).output()?;

    if output.status.success() {
        Ok(())
    } else {
        anyhow::bail!("Command failed: {} {:?}", cmd, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = FilePolicyStore::new(dir.path().join("lockdown.json"));

        assert_eq!(store.get(PolicyKey::AltTab).unwrap(), None);

        store.set(PolicyKey::AltTab, 1).unwrap();
        store.set(PolicyKey::WindowsKey, 0).unwrap();
        assert_eq!(store.get(PolicyKey::AltTab).unwrap(), Some(1));
        assert_eq!(store.get(PolicyKey::WindowsKey).unwrap(), Some(0));

        store.remove(PolicyKey::AltTab).unwrap();
        store.remove(PolicyKey::AltTab).unwrap();
        assert_eq!(store.get(PolicyKey::AltTab).unwrap(), None);

        let on_disk = std::fs::read_to_string(store.path()).unwrap();
        assert!(on_disk.contains("\"windows_key\": 0"));
    }

    #[test]
    fn test_corrupt_file_is_a_backend_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lockdown.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = FilePolicyStore::new(path);
        assert!(matches!(
            store.get(PolicyKey::TaskManager),
            Err(PolicyError::Backend { key: PolicyKey::TaskManager, .. })
        ));
    }

    #[test]
    fn test_try_command_with_invalid_command() {
        assert!(try_command("nonexistent_command_xyz", &[]).is_err());
    }
}
