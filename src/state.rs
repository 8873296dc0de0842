use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

use crate::kiosk::{BackupJournal, PolicyBackup};
use crate::platform::common::{atomic_write, set_owner_only};

/// Current state version
const STATE_VERSION: &str = "1.0";

/// Agent state persisted between runs
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AgentState {
    pub version: String,

    /// Unique identifier for this machine
    pub machine_id: String,

    /// Lockdown switches as they were before kiosk mode was entered.
    /// Present only while the machine is (or may still be) locked down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_backup: Option<PolicyBackup>,

    /// Last time the backup was recorded or cleared
    #[serde(default)]
    pub last_kiosk_transition: Option<DateTime<Utc>>,
}

impl AgentState {
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            machine_id: Uuid::new_v4().to_string(),
            policy_backup: None,
            last_kiosk_transition: None,
        }
    }

    /// Load state, returning `None` when the file is missing or from an
    /// incompatible version
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;

        let state: AgentState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;

        if state.version != STATE_VERSION {
            warn!(
                "State file version mismatch (expected {}, got {}). Treating as new state.",
                STATE_VERSION, state.version
            );
            return Ok(None);
        }

        Ok(Some(state))
    }

    pub fn load_or_new(path: &Path) -> Result<Self> {
        Ok(Self::load(path)?.unwrap_or_default())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize state")?;

        atomic_write(path, content.as_bytes())
            .with_context(|| format!("Failed to write state file: {}", path.display()))?;
        set_owner_only(path)?;

        Ok(())
    }

    pub fn set_backup(&mut self, backup: Option<PolicyBackup>) {
        self.policy_backup = backup;
        self.last_kiosk_transition = Some(Utc::now());
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}

/// Records the policy backup in the agent state file
pub struct StateFileJournal {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StateFileJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Backup left behind by a run that never restored it
    pub fn pending(&self) -> Result<Option<PolicyBackup>> {
        Ok(AgentState::load(&self.path)?.and_then(|state| state.policy_backup))
    }

    fn update(&self, backup: Option<PolicyBackup>) -> Result<()> {
        let _guard = self.lock.lock();
        let mut state = AgentState::load_or_new(&self.path)?;
        state.set_backup(backup);
        state.save(&self.path)
    }
}

impl BackupJournal for StateFileJournal {
    fn record(&self, backup: &PolicyBackup) -> Result<()> {
        self.update(Some(backup.clone()))
    }

    fn clear(&self) -> Result<()> {
        self.update(None)
    }
}
