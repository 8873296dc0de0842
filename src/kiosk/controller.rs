//! Kiosk lockdown state machine.
//!
//! `Disabled -> Transitioning -> Enabled -> Transitioning -> Disabled`.
//! The transitional phase is internal: [`KioskController::mode`] reports the
//! last stable mode, and a second enable or disable issued while one is in
//! flight is refused with [`KioskError::Busy`].
//!
//! All methods block (registry writes, process kills, bounded waits) and are
//! meant to be driven from `spawn_blocking` by async callers.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::apps::{AllowedApp, LaunchError, RunningApp};
use super::enforcement::{AllowList, Verdict};
use super::policy::{PolicyBackup, PolicyError, PolicyKey, PolicyStore};
use super::process::{ProcessTable, TerminateError};
use crate::events::{AgentEvent, EventSender, emit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KioskMode {
    Disabled,
    Enabled,
}

impl fmt::Display for KioskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KioskMode::Disabled => f.write_str("disabled"),
            KioskMode::Enabled => f.write_str("enabled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stable(KioskMode),
    Transitioning { from: KioskMode },
}

#[derive(Debug, Error)]
pub enum KioskError {
    #[error("administrator privileges are required to change lockdown settings")]
    AdminRequired,

    #[error("a kiosk mode change is already in progress")]
    Busy,

    #[error("could not apply lockdown settings: {0}")]
    Policy(#[from] PolicyError),

    #[error("could not persist the policy backup: {0}")]
    Journal(String),

    #[error("could not restore lockdown settings: {}", format_keys(.0))]
    RestoreIncomplete(Vec<PolicyKey>),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

fn format_keys(keys: &[PolicyKey]) -> String {
    keys.iter()
        .map(PolicyKey::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Durable record of the policy backup, so a crash while locked down can
/// be undone on the next start
pub trait BackupJournal: Send + Sync {
    fn record(&self, backup: &PolicyBackup) -> anyhow::Result<()>;

    fn clear(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct KioskSettings {
    pub policy_keys: Vec<PolicyKey>,
    pub system_processes: Vec<String>,
    /// System processes whose children are not exempt
    pub shell_processes: Vec<String>,
    pub reserved_pid_threshold: u32,
    pub exempt_system_children: bool,
    /// How long to wait for a launched app to exit on disable
    pub terminate_timeout: Duration,
    pub require_admin: bool,
    pub own_pid: u32,
}

impl Default for KioskSettings {
    fn default() -> Self {
        Self {
            policy_keys: PolicyKey::ALL.to_vec(),
            system_processes: Vec::new(),
            shell_processes: Vec::new(),
            reserved_pid_threshold: 10,
            exempt_system_children: true,
            terminate_timeout: Duration::from_secs(3),
            require_admin: true,
            own_pid: std::process::id(),
        }
    }
}

/// Outcome of one enforcement sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub blocked: Vec<String>,
    pub denied: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct KioskStatus {
    pub mode: KioskMode,
    pub allowed_apps: Vec<String>,
    pub running_apps: Vec<String>,
    pub backup_held: bool,
}

struct Inner {
    phase: Phase,
    apps: Vec<AllowedApp>,
    /// Held while any lockdown value may still be applied, including after a
    /// restore that did not complete
    backup: Option<PolicyBackup>,
    running: Vec<RunningApp>,
    /// (pid, lowercased name) pairs already judged allowed
    allowed_cache: HashSet<(u32, String)>,
}

pub struct KioskController {
    settings: KioskSettings,
    policy: Arc<dyn PolicyStore>,
    processes: Arc<dyn ProcessTable>,
    journal: Option<Arc<dyn BackupJournal>>,
    events: EventSender,
    inner: Mutex<Inner>,
    /// Serializes sweeps so one process is never reported twice
    sweep_lock: Mutex<()>,
}

impl KioskController {
    pub fn new(
        settings: KioskSettings,
        policy: Arc<dyn PolicyStore>,
        processes: Arc<dyn ProcessTable>,
        apps: Vec<AllowedApp>,
        events: EventSender,
    ) -> Self {
        Self {
            settings,
            policy,
            processes,
            journal: None,
            events,
            inner: Mutex::new(Inner {
                phase: Phase::Stable(KioskMode::Disabled),
                apps,
                backup: None,
                running: Vec::new(),
                allowed_cache: HashSet::new(),
            }),
            sweep_lock: Mutex::new(()),
        }
    }

    pub fn with_journal(mut self, journal: Arc<dyn BackupJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Last stable mode; never reports the transitional phase
    pub fn mode(&self) -> KioskMode {
        match self.inner.lock().phase {
            Phase::Stable(mode) => mode,
            Phase::Transitioning { from } => from,
        }
    }

    pub fn allowed_apps(&self) -> Vec<AllowedApp> {
        self.inner.lock().apps.clone()
    }

    pub fn is_app_allowed(&self, name: &str) -> bool {
        self.inner.lock().apps.iter().any(|app| app.matches(name))
    }

    pub fn status(&self) -> KioskStatus {
        let mode = self.mode();
        let mut inner = self.inner.lock();
        inner.running.retain_mut(|app| app.is_running());
        KioskStatus {
            mode,
            allowed_apps: inner.apps.iter().map(|a| a.name.clone()).collect(),
            running_apps: inner.running.iter().map(|a| a.name.clone()).collect(),
            backup_held: inner.backup.is_some(),
        }
    }

    /// Lock the machine down. Enabling while already enabled is a no-op.
    ///
    /// Prior values are captured and journaled before anything is written.
    /// If any write fails the keys already written are restored and the
    /// controller stays disabled. A backup that could not be fully restored
    /// is reused rather than recaptured.
    pub fn enable(&self) -> Result<(), KioskError> {
        self.check_privileges()?;
        if !self.begin_transition(KioskMode::Enabled)? {
            return Ok(());
        }

        info!("Enabling kiosk mode");
        match self.lock_down() {
            Ok(()) => {
                self.sweep_unchecked();
                self.autostart();
                self.finish_transition(KioskMode::Enabled);
                info!("Kiosk mode enabled");
                Ok(())
            }
            Err(e) => {
                error!("Failed to enable kiosk mode: {}", e);
                self.finish_transition(KioskMode::Disabled);
                Err(e)
            }
        }
    }

    /// Undo the lockdown and stop launched apps. Disabling while already
    /// disabled is a no-op unless a backup is still held, in which case the
    /// restore is retried. The controller always ends up disabled; keys that
    /// could not be restored are reported and the backup is kept, in memory
    /// and in the journal, for a later retry.
    pub fn disable(&self) -> Result<(), KioskError> {
        self.check_privileges()?;
        if !self.begin_transition(KioskMode::Disabled)? {
            return Ok(());
        }

        info!("Disabling kiosk mode");
        let (running, backup) = {
            let mut inner = self.inner.lock();
            (std::mem::take(&mut inner.running), inner.backup.take())
        };

        for mut app in running {
            if !app.terminate(self.settings.terminate_timeout) {
                warn!("Abandoning {} ({}) which did not exit", app.name, app.pid());
            }
        }

        let failures = match &backup {
            Some(backup) => backup.restore_all(self.policy.as_ref()),
            None => {
                warn!("No policy backup held, leaving lockdown settings untouched");
                Vec::new()
            }
        };

        for failure in &failures {
            error!("Failed to restore {}: {}", failure.key(), failure);
        }
        if failures.is_empty() {
            self.clear_journal();
        }
        {
            let mut inner = self.inner.lock();
            if !failures.is_empty() {
                inner.backup = backup;
            }
            inner.allowed_cache.clear();
        }
        self.finish_transition(KioskMode::Disabled);
        info!("Kiosk mode disabled");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(KioskError::RestoreIncomplete(
                failures.iter().map(PolicyError::key).collect(),
            ))
        }
    }

    /// Restore a backup left behind by a previous run that never disabled
    pub fn recover(&self, backup: &PolicyBackup) -> Result<(), KioskError> {
        warn!("Restoring lockdown settings left over from a previous run");
        let failures = backup.restore_all(self.policy.as_ref());
        if failures.is_empty() {
            self.clear_journal();
            Ok(())
        } else {
            Err(KioskError::RestoreIncomplete(
                failures.iter().map(PolicyError::key).collect(),
            ))
        }
    }

    /// Start an allowed application, or return the pid of the instance
    /// already running
    pub fn launch_app(&self, name: &str) -> Result<u32, KioskError> {
        let app = {
            let mut inner = self.inner.lock();
            inner.running.retain_mut(|app| app.is_running());
            if let Some(running) = inner.running.iter().find(|r| r.name.eq_ignore_ascii_case(name)) {
                debug!("{} is already running", running.name);
                return Ok(running.pid());
            }
            inner.apps.iter().find(|a| a.matches(name)).cloned()
        };

        let launched = app
            .ok_or_else(|| LaunchError::NotAllowed(name.to_string()))
            .and_then(|app| RunningApp::launch(&app));

        match launched {
            Ok(running) => {
                let pid = running.pid();
                self.inner.lock().running.push(running);
                Ok(pid)
            }
            Err(e) => {
                warn!("Failed to launch {}: {}", name, e);
                emit(
                    &self.events,
                    AgentEvent::AppLaunchFailed {
                        name: name.to_string(),
                        reason: e.to_string(),
                    },
                );
                Err(e.into())
            }
        }
    }

    /// Replace the allowed applications. While enabled the new list is
    /// enforced immediately.
    pub fn update_allowed_apps(&self, apps: Vec<AllowedApp>) -> SweepReport {
        let enabled = {
            let mut inner = self.inner.lock();
            info!("Allowed applications updated ({} entries)", apps.len());
            inner.apps = apps;
            inner.allowed_cache.clear();
            inner.phase == Phase::Stable(KioskMode::Enabled)
        };

        if enabled {
            self.sweep_unchecked()
        } else {
            SweepReport::default()
        }
    }

    /// Terminate every process not covered by an allow rule. Only acts while
    /// enabled.
    pub fn sweep(&self) -> SweepReport {
        if self.inner.lock().phase != Phase::Stable(KioskMode::Enabled) {
            return SweepReport::default();
        }
        self.sweep_unchecked()
    }

    fn sweep_unchecked(&self) -> SweepReport {
        let _sweeping = self.sweep_lock.lock();

        let (allow_list, cache, launched) = {
            let inner = self.inner.lock();
            (
                AllowList::new(
                    &self.settings.system_processes,
                    &self.settings.shell_processes,
                    &inner.apps,
                    self.settings.reserved_pid_threshold,
                    self.settings.exempt_system_children,
                    self.settings.own_pid,
                ),
                inner.allowed_cache.clone(),
                inner.running.iter().map(RunningApp::pid).collect::<HashSet<_>>(),
            )
        };

        let snapshot = self.processes.processes();
        let mut report = SweepReport::default();
        let mut allowed = Vec::new();

        for (process, verdict) in allow_list.judge_all(&snapshot) {
            let key = (process.pid, process.name.to_lowercase());
            if cache.contains(&key) || launched.contains(&process.pid) {
                continue;
            }

            match verdict {
                Verdict::Allow(_) => allowed.push(key),
                Verdict::Block => match self.processes.terminate(process.pid) {
                    Ok(()) => {
                        info!("Blocked process {} ({})", process.name, process.pid);
                        emit(
                            &self.events,
                            AgentEvent::ProcessBlocked {
                                name: process.name.clone(),
                            },
                        );
                        report.blocked.push(process.name.clone());
                    }
                    Err(TerminateError::Gone(_)) => {
                        debug!("{} ({}) exited before it could be blocked", process.name, process.pid);
                    }
                    Err(TerminateError::AccessDenied(_)) => {
                        debug!("Access denied blocking {} ({})", process.name, process.pid);
                        report.denied += 1;
                    }
                    Err(e) => {
                        warn!("{}", e);
                        report.failed += 1;
                    }
                },
            }
        }

        let live: HashSet<(u32, String)> = snapshot
            .iter()
            .map(|p| (p.pid, p.name.to_lowercase()))
            .collect();
        let mut inner = self.inner.lock();
        inner.allowed_cache.retain(|key| live.contains(key));
        inner.allowed_cache.extend(allowed);

        report
    }

    fn lock_down(&self) -> Result<(), KioskError> {
        let keys = &self.settings.policy_keys;
        let held = self.inner.lock().backup.take();
        let reused = held.is_some();
        let backup = match held {
            Some(backup) => {
                warn!("Reusing policy backup from an incomplete restore");
                backup
            }
            None => PolicyBackup::capture(self.policy.as_ref(), keys)?,
        };

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record(&backup) {
                if reused {
                    self.inner.lock().backup = Some(backup);
                }
                return Err(KioskError::Journal(format!("{e:#}")));
            }
        }

        let mut applied = Vec::with_capacity(keys.len());
        for &key in keys {
            if let Err(e) = self.policy.set(key, key.lockdown_value()) {
                error!("Failed to apply {}: {}", key, e);
                let failures = backup.restore_keys(self.policy.as_ref(), applied.iter().copied());
                for failure in &failures {
                    error!("Rollback of {} failed: {}", failure.key(), failure);
                }
                if failures.is_empty() && !reused {
                    self.clear_journal();
                } else {
                    self.inner.lock().backup = Some(backup);
                }
                return Err(e.into());
            }
            debug!("Applied {}", key);
            applied.push(key);
        }

        self.inner.lock().backup = Some(backup);
        Ok(())
    }

    fn autostart(&self) {
        let names: Vec<String> = self
            .inner
            .lock()
            .apps
            .iter()
            .filter(|a| a.autostart)
            .map(|a| a.name.clone())
            .collect();

        for name in names {
            // Failures are reported through AppLaunchFailed
            let _ = self.launch_app(&name);
        }
    }

    fn check_privileges(&self) -> Result<(), KioskError> {
        if self.settings.require_admin && !crate::platform::common::is_elevated() {
            return Err(KioskError::AdminRequired);
        }
        Ok(())
    }

    /// Returns false when already in `target`. Disabled with a held backup
    /// still counts as a transition so the restore is retried.
    fn begin_transition(&self, target: KioskMode) -> Result<bool, KioskError> {
        let mut inner = self.inner.lock();
        let pending_restore = target == KioskMode::Disabled && inner.backup.is_some();
        match inner.phase {
            Phase::Transitioning { .. } => Err(KioskError::Busy),
            Phase::Stable(mode) if mode == target && !pending_restore => Ok(false),
            Phase::Stable(mode) => {
                inner.phase = Phase::Transitioning { from: mode };
                Ok(true)
            }
        }
    }

    fn finish_transition(&self, mode: KioskMode) {
        let changed = {
            let mut inner = self.inner.lock();
            let from = match inner.phase {
                Phase::Stable(previous) | Phase::Transitioning { from: previous } => previous,
            };
            inner.phase = Phase::Stable(mode);
            from != mode
        };

        if changed {
            emit(
                &self.events,
                AgentEvent::KioskModeChanged {
                    enabled: mode == KioskMode::Enabled,
                },
            );
        }
    }

    fn clear_journal(&self) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.clear() {
                warn!("Failed to clear policy backup journal: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventReceiver, event_channel};
    use crate::testing::{FakeProcessTable, MemoryJournal, MemoryPolicyStore};

    struct Fixture {
        store: Arc<MemoryPolicyStore>,
        table: Arc<FakeProcessTable>,
        journal: Arc<MemoryJournal>,
        controller: KioskController,
        events: EventReceiver,
    }

    fn settings(keys: &[PolicyKey]) -> KioskSettings {
        KioskSettings {
            policy_keys: keys.to_vec(),
            system_processes: vec!["explorer.exe".to_string(), "svchost.exe".to_string()],
            shell_processes: vec!["explorer.exe".to_string()],
            reserved_pid_threshold: 8,
            exempt_system_children: false,
            terminate_timeout: Duration::from_secs(1),
            require_admin: false,
            own_pid: 1000,
        }
    }

    fn fixture_with(store: MemoryPolicyStore, keys: &[PolicyKey]) -> Fixture {
        let store = Arc::new(store);
        let table = Arc::new(FakeProcessTable::default());
        let journal = Arc::new(MemoryJournal::default());
        let (tx, events) = event_channel();
        let controller = KioskController::new(
            settings(keys),
            store.clone(),
            table.clone(),
            vec![AllowedApp::new("chrome.exe", r"C:\Chrome\chrome.exe")],
            tx,
        )
        .with_journal(journal.clone());

        Fixture {
            store,
            table,
            journal,
            controller,
            events,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MemoryPolicyStore::default(), &PolicyKey::ALL)
    }

    fn drain(events: &mut EventReceiver) -> Vec<AgentEvent> {
        std::iter::from_fn(|| events.try_recv().ok()).collect()
    }

    #[test]
    fn test_enable_sets_every_key_and_disable_restores() {
        let fx = fixture_with(
            MemoryPolicyStore::with_values(&[(PolicyKey::TaskManager, 0), (PolicyKey::AltTab, 2)]),
            &PolicyKey::ALL,
        );
        let before = fx.store.snapshot();

        fx.controller.enable().unwrap();
        assert_eq!(fx.controller.mode(), KioskMode::Enabled);
        for key in PolicyKey::ALL {
            assert_eq!(fx.store.get(key).unwrap(), Some(1), "{key}");
        }
        assert!(fx.journal.current.lock().is_some());

        fx.controller.disable().unwrap();
        assert_eq!(fx.controller.mode(), KioskMode::Disabled);
        assert_eq!(fx.store.snapshot(), before);
        assert!(fx.journal.current.lock().is_none());
    }

    #[test]
    fn test_failed_write_rolls_back_and_stays_disabled() {
        let keys = [PolicyKey::TaskManager, PolicyKey::CommandPrompt, PolicyKey::RegistryTools];
        let store = MemoryPolicyStore::with_values(&[(PolicyKey::TaskManager, 0)]);
        store.fail_writes_to(PolicyKey::CommandPrompt);
        let mut fx = fixture_with(store, &keys);
        let before = fx.store.snapshot();

        let result = fx.controller.enable();

        assert!(matches!(result, Err(KioskError::Policy(_))));
        assert_eq!(fx.controller.mode(), KioskMode::Disabled);
        assert_eq!(fx.store.snapshot(), before);
        assert_eq!(fx.store.get(PolicyKey::RegistryTools).unwrap(), None);
        assert!(fx.journal.current.lock().is_none());
        assert!(!drain(&mut fx.events).contains(&AgentEvent::KioskModeChanged { enabled: true }));
    }

    #[test]
    fn test_enable_and_disable_are_idempotent() {
        let fx = fixture();

        fx.controller.disable().unwrap();
        assert!(fx.store.writes().is_empty());

        fx.controller.enable().unwrap();
        let writes = fx.store.writes().len();
        fx.controller.enable().unwrap();
        assert_eq!(fx.store.writes().len(), writes);
        assert_eq!(*fx.journal.records.lock(), 1);
    }

    #[test]
    fn test_sweep_blocks_unlisted_process_once() {
        let mut fx = fixture();
        fx.table.spawn(4, None, "System");
        fx.table.spawn(500, None, "explorer.exe");
        fx.table.spawn(600, Some(500), "chrome.exe");
        fx.controller.enable().unwrap();
        drain(&mut fx.events);

        fx.table.spawn(700, Some(500), "cmd.exe");
        let report = fx.controller.sweep();
        let second = fx.controller.sweep();

        assert_eq!(report.blocked, vec!["cmd.exe".to_string()]);
        assert!(second.blocked.is_empty());
        assert_eq!(fx.table.killed(), vec![700]);
        assert!(fx.table.is_alive(600));

        let blocked: Vec<AgentEvent> = drain(&mut fx.events)
            .into_iter()
            .filter(|e| matches!(e, AgentEvent::ProcessBlocked { .. }))
            .collect();
        assert_eq!(
            blocked,
            vec![AgentEvent::ProcessBlocked {
                name: "cmd.exe".to_string()
            }]
        );
    }

    #[test]
    fn test_enable_terminates_existing_processes() {
        let fx = fixture();
        fx.table.spawn(700, None, "regedit.exe");
        fx.table.spawn(1000, None, "kiosk-agent.exe");

        fx.controller.enable().unwrap();

        assert_eq!(fx.table.killed(), vec![700]);
    }

    #[test]
    fn test_sweep_is_inert_while_disabled() {
        let fx = fixture();
        fx.table.spawn(700, None, "cmd.exe");

        assert_eq!(fx.controller.sweep(), SweepReport::default());
        assert!(fx.table.is_alive(700));
    }

    #[test]
    fn test_access_denied_is_not_reported_as_blocked() {
        let mut fx = fixture();
        fx.table.spawn(800, None, "antivirus.exe");
        fx.table.protect(800);

        fx.controller.enable().unwrap();
        let report = fx.controller.sweep();

        assert_eq!(report.denied, 1);
        assert!(report.blocked.is_empty());
        assert!(
            !drain(&mut fx.events)
                .iter()
                .any(|e| matches!(e, AgentEvent::ProcessBlocked { .. }))
        );
    }

    #[test]
    fn test_updated_allow_list_applies_immediately() {
        let fx = fixture();
        fx.table.spawn(600, None, "chrome.exe");
        fx.table.spawn(601, None, "steam.exe");
        fx.controller.enable().unwrap();
        assert!(fx.table.is_alive(600));
        assert!(!fx.table.is_alive(601));

        fx.table.spawn(602, None, "steam.exe");
        let report = fx
            .controller
            .update_allowed_apps(vec![AllowedApp::new("steam.exe", r"C:\Steam\steam.exe")]);

        assert_eq!(report.blocked, vec!["chrome.exe".to_string()]);
        assert!(fx.table.is_alive(602));
        assert!(fx.controller.is_app_allowed("STEAM.exe"));
        assert!(!fx.controller.is_app_allowed("chrome.exe"));
    }

    #[test]
    fn test_disable_without_backup_leaves_keys_alone() {
        let fx = fixture();
        fx.controller.enable().unwrap();
        fx.controller.inner.lock().backup = None;

        fx.controller.disable().unwrap();

        assert_eq!(fx.store.get(PolicyKey::AltTab).unwrap(), Some(1));
    }

    #[test]
    fn test_restore_failure_still_ends_disabled() {
        let fx = fixture();
        fx.controller.enable().unwrap();
        fx.store.fail_writes_to(PolicyKey::WindowsKey);

        let result = fx.controller.disable();

        match result {
            Err(KioskError::RestoreIncomplete(keys)) => assert_eq!(keys, vec![PolicyKey::WindowsKey]),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(fx.controller.mode(), KioskMode::Disabled);
        assert!(fx.journal.current.lock().is_some());
        assert_eq!(fx.store.get(PolicyKey::TaskManager).unwrap(), None);
    }

    #[test]
    fn test_failed_rollback_keeps_backup_for_retry() {
        let keys = [PolicyKey::TaskManager, PolicyKey::CommandPrompt];
        let store = MemoryPolicyStore::default();
        store.fail_writes_to(PolicyKey::CommandPrompt);
        store.fail_removes();
        let fx = fixture_with(store, &keys);

        assert!(matches!(fx.controller.enable(), Err(KioskError::Policy(_))));
        assert_eq!(fx.controller.mode(), KioskMode::Disabled);
        assert_eq!(fx.store.get(PolicyKey::TaskManager).unwrap(), Some(1));
        assert!(fx.journal.current.lock().is_some());
        assert!(fx.controller.status().backup_held);

        fx.store.heal();
        fx.controller.disable().unwrap();

        assert!(fx.store.snapshot().is_empty());
        assert!(fx.journal.current.lock().is_none());
        assert!(!fx.controller.status().backup_held);
    }

    #[test]
    fn test_enable_after_incomplete_restore_reuses_backup() {
        let fx = fixture_with(
            MemoryPolicyStore::with_values(&[(PolicyKey::AltTab, 2)]),
            &[PolicyKey::AltTab, PolicyKey::TaskManager],
        );
        fx.controller.enable().unwrap();
        fx.store.fail_writes_to(PolicyKey::AltTab);
        assert!(fx.controller.disable().is_err());
        assert_eq!(fx.store.get(PolicyKey::AltTab).unwrap(), Some(1));

        fx.store.heal();
        fx.controller.enable().unwrap();
        fx.controller.disable().unwrap();

        assert_eq!(fx.store.get(PolicyKey::AltTab).unwrap(), Some(2));
        assert_eq!(fx.store.get(PolicyKey::TaskManager).unwrap(), None);
    }

    #[test]
    fn test_launching_unlisted_app_reports_failure() {
        let mut fx = fixture();

        let result = fx.controller.launch_app("notepad.exe");

        assert!(matches!(result, Err(KioskError::Launch(LaunchError::NotAllowed(_)))));
        assert!(drain(&mut fx.events).iter().any(|e| matches!(
            e,
            AgentEvent::AppLaunchFailed { name, .. } if name == "notepad.exe"
        )));
    }

    #[test]
    fn test_recover_restores_leftover_backup() {
        let fx = fixture();
        let backup = PolicyBackup::capture(fx.store.as_ref(), &PolicyKey::ALL).unwrap();
        for key in PolicyKey::ALL {
            fx.store.set(key, 1).unwrap();
        }

        fx.controller.recover(&backup).unwrap();

        assert!(fx.store.snapshot().is_empty());
    }

    struct GatedStore {
        inner: MemoryPolicyStore,
        entered: Mutex<Option<std::sync::mpsc::Sender<()>>>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl PolicyStore for GatedStore {
        fn get(&self, key: PolicyKey) -> Result<Option<u32>, PolicyError> {
            self.inner.get(key)
        }

        fn set(&self, key: PolicyKey, value: u32) -> Result<(), PolicyError> {
            if let Some(entered) = self.entered.lock().take() {
                let _ = entered.send(());
                let _ = self.release.lock().recv();
            }
            self.inner.set(key, value)
        }

        fn remove(&self, key: PolicyKey) -> Result<(), PolicyError> {
            self.inner.remove(key)
        }
    }

    #[test]
    fn test_transition_is_never_observable_and_refuses_overlap() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let store = Arc::new(GatedStore {
            inner: MemoryPolicyStore::default(),
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(release_rx),
        });
        let (tx, _rx) = event_channel();
        let controller = Arc::new(KioskController::new(
            settings(&PolicyKey::ALL),
            store,
            Arc::new(FakeProcessTable::default()),
            Vec::new(),
            tx,
        ));

        let worker = {
            let controller = controller.clone();
            std::thread::spawn(move || controller.enable())
        };
        entered_rx.recv().unwrap();

        assert_eq!(controller.mode(), KioskMode::Disabled);
        assert!(matches!(controller.enable(), Err(KioskError::Busy)));
        assert!(matches!(controller.disable(), Err(KioskError::Busy)));

        release_tx.send(()).unwrap();
        worker.join().unwrap().unwrap();
        assert_eq!(controller.mode(), KioskMode::Enabled);
    }
}
