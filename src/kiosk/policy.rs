//! Operating-system lockdown settings and their backups.
//!
//! A [`PolicyStore`] is the persistent key/value store holding the five
//! lockdown switches (the per-user policy registry hive on Windows). Before a
//! switch is changed its prior value is captured into a [`PolicyBackup`] so
//! that disabling kiosk mode can put the machine back exactly as it was,
//! including deleting values that did not exist before.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// One lockdown switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKey {
    TaskManager,
    CommandPrompt,
    RegistryTools,
    AltTab,
    WindowsKey,
}

impl PolicyKey {
    pub const ALL: [PolicyKey; 5] = [
        PolicyKey::TaskManager,
        PolicyKey::CommandPrompt,
        PolicyKey::RegistryTools,
        PolicyKey::AltTab,
        PolicyKey::WindowsKey,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKey::TaskManager => "task_manager",
            PolicyKey::CommandPrompt => "command_prompt",
            PolicyKey::RegistryTools => "registry_tools",
            PolicyKey::AltTab => "alt_tab",
            PolicyKey::WindowsKey => "windows_key",
        }
    }

    /// Value written while kiosk mode is enabled
    pub fn lockdown_value(&self) -> u32 {
        1
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PolicyKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PolicyKey::ALL
            .into_iter()
            .find(|key| key.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown policy key '{s}'"))
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("insufficient privileges to change {0}")]
    PermissionDenied(PolicyKey),

    #[error("policy store failed on {key}: {message}")]
    Backend { key: PolicyKey, message: String },
}

impl PolicyError {
    pub fn key(&self) -> PolicyKey {
        match self {
            PolicyError::PermissionDenied(key) => *key,
            PolicyError::Backend { key, .. } => *key,
        }
    }

    pub fn from_io(key: PolicyKey, error: &std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::PermissionDenied {
            PolicyError::PermissionDenied(key)
        } else {
            PolicyError::Backend {
                key,
                message: error.to_string(),
            }
        }
    }
}

/// Persistent store of lockdown switches
pub trait PolicyStore: Send + Sync {
    /// Current value, `None` when the value does not exist
    fn get(&self, key: PolicyKey) -> Result<Option<u32>, PolicyError>;

    fn set(&self, key: PolicyKey, value: u32) -> Result<(), PolicyError>;

    /// Delete the value. Removing an absent value succeeds.
    fn remove(&self, key: PolicyKey) -> Result<(), PolicyError>;

    /// Put back a value captured earlier, deleting it if it was absent
    fn restore(&self, key: PolicyKey, prior: Option<u32>) -> Result<(), PolicyError> {
        match prior {
            Some(value) => self.set(key, value),
            None => self.remove(key),
        }
    }
}

/// Prior values captured before lockdown, keyed by switch.
///
/// A key missing from the backup was never captured and must be left alone
/// on restore; a key mapped to `None` was absent and must be deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyBackup {
    entries: BTreeMap<PolicyKey, Option<u32>>,
}

impl PolicyBackup {
    /// Capture the current value of every key, failing before anything is
    /// modified
    pub fn capture(store: &dyn PolicyStore, keys: &[PolicyKey]) -> Result<Self, PolicyError> {
        let mut entries = BTreeMap::new();
        for &key in keys {
            entries.insert(key, store.get(key)?);
        }
        Ok(Self { entries })
    }

    pub fn prior(&self, key: PolicyKey) -> Option<Option<u32>> {
        self.entries.get(&key).copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = PolicyKey> + '_ {
        self.entries.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Restore the given keys, skipping any without a captured value.
    /// Every key is attempted; the failures are returned.
    pub fn restore_keys(
        &self,
        store: &dyn PolicyStore,
        keys: impl IntoIterator<Item = PolicyKey>,
    ) -> Vec<PolicyError> {
        keys.into_iter()
            .filter_map(|key| {
                let prior = self.prior(key)?;
                store.restore(key, prior).err()
            })
            .collect()
    }

    pub fn restore_all(&self, store: &dyn PolicyStore) -> Vec<PolicyError> {
        self.restore_keys(store, self.keys().collect::<Vec<_>>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryPolicyStore;

    #[test]
    fn test_policy_key_parse() {
        assert_eq!("alt_tab".parse::<PolicyKey>().unwrap(), PolicyKey::AltTab);
        assert_eq!(" Task_Manager ".parse::<PolicyKey>().unwrap(), PolicyKey::TaskManager);
        assert!("screen_saver".parse::<PolicyKey>().is_err());
    }

    #[test]
    fn test_capture_distinguishes_absent_from_zero() {
        let store = MemoryPolicyStore::default();
        store.set(PolicyKey::TaskManager, 0).unwrap();

        let backup = PolicyBackup::capture(&store, &[PolicyKey::TaskManager, PolicyKey::AltTab]).unwrap();

        assert_eq!(backup.prior(PolicyKey::TaskManager), Some(Some(0)));
        assert_eq!(backup.prior(PolicyKey::AltTab), Some(None));
        assert_eq!(backup.prior(PolicyKey::WindowsKey), None);
    }

    #[test]
    fn test_restore_round_trips_prior_state() {
        let store = MemoryPolicyStore::default();
        store.set(PolicyKey::RegistryTools, 7).unwrap();
        let before = store.snapshot();

        let backup = PolicyBackup::capture(&store, &PolicyKey::ALL).unwrap();
        for key in PolicyKey::ALL {
            store.set(key, key.lockdown_value()).unwrap();
        }
        assert!(backup.restore_all(&store).is_empty());

        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_restore_leaves_uncaptured_keys_alone() {
        let store = MemoryPolicyStore::default();
        let backup = PolicyBackup::capture(&store, &[PolicyKey::AltTab]).unwrap();
        store.set(PolicyKey::AltTab, 1).unwrap();
        store.set(PolicyKey::WindowsKey, 1).unwrap();

        backup.restore_keys(&store, [PolicyKey::AltTab, PolicyKey::WindowsKey]);

        assert_eq!(store.get(PolicyKey::AltTab).unwrap(), None);
        assert_eq!(store.get(PolicyKey::WindowsKey).unwrap(), Some(1));
    }

    #[test]
    fn test_backup_serializes_with_key_names() {
        let store = MemoryPolicyStore::default();
        let backup = PolicyBackup::capture(&store, &[PolicyKey::CommandPrompt]).unwrap();
        let json = serde_json::to_string(&backup).unwrap();

        assert_eq!(json, r#"{"entries":{"command_prompt":null}}"#);
        assert_eq!(serde_json::from_str::<PolicyBackup>(&json).unwrap(), backup);
    }
}
