//! In-memory stand-ins for the host-facing traits, shared by unit tests

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::time::Instant;

use crate::kiosk::controller::BackupJournal;
use crate::kiosk::policy::{PolicyBackup, PolicyError, PolicyKey, PolicyStore};
use crate::kiosk::process::{ProcessInfo, ProcessTable, TerminateError};
use crate::protocol::transport::{BoxedReader, BoxedWriter, Transport};
use crate::session::actions::HostActions;
use crate::session::clock::Clock;

#[derive(Default)]
pub struct MemoryPolicyStore {
    values: Mutex<BTreeMap<PolicyKey, u32>>,
    failing: Mutex<HashSet<PolicyKey>>,
    failing_removes: Mutex<bool>,
    writes: Mutex<Vec<(PolicyKey, Option<u32>)>>,
}

impl MemoryPolicyStore {
    pub fn with_values(values: &[(PolicyKey, u32)]) -> Self {
        let store = Self::default();
        store.values.lock().extend(values.iter().copied());
        store
    }

    /// Make every write to `key` fail with a backend error
    pub fn fail_writes_to(&self, key: PolicyKey) {
        self.failing.lock().insert(key);
    }

    /// Make every remove fail with a backend error
    pub fn fail_removes(&self) {
        *self.failing_removes.lock() = true;
    }

    /// Stop injecting failures
    pub fn heal(&self) {
        self.failing.lock().clear();
        *self.failing_removes.lock() = false;
    }

    pub fn snapshot(&self) -> BTreeMap<PolicyKey, u32> {
        self.values.lock().clone()
    }

    /// Every successful set (`Some`) and remove (`None`), in order
    pub fn writes(&self) -> Vec<(PolicyKey, Option<u32>)> {
        self.writes.lock().clone()
    }

    fn check(&self, key: PolicyKey) -> Result<(), PolicyError> {
        if self.failing.lock().contains(&key) {
            return Err(PolicyError::Backend {
                key,
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

impl PolicyStore for MemoryPolicyStore {
    fn get(&self, key: PolicyKey) -> Result<Option<u32>, PolicyError> {
        Ok(self.values.lock().get(&key).copied())
    }

    fn set(&self, key: PolicyKey, value: u32) -> Result<(), PolicyError> {
        self.check(key)?;
        self.values.lock().insert(key, value);
        self.writes.lock().push((key, Some(value)));
        Ok(())
    }

    fn remove(&self, key: PolicyKey) -> Result<(), PolicyError> {
        self.check(key)?;
        if *self.failing_removes.lock() {
            return Err(PolicyError::Backend {
                key,
                message: "injected remove failure".to_string(),
            });
        }
        self.values.lock().remove(&key);
        self.writes.lock().push((key, None));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeProcessTable {
    processes: Mutex<Vec<ProcessInfo>>,
    protected: Mutex<HashSet<u32>>,
    killed: Mutex<Vec<u32>>,
}

impl FakeProcessTable {
    pub fn spawn(&self, pid: u32, parent_pid: Option<u32>, name: &str) {
        self.processes.lock().push(ProcessInfo {
            pid,
            parent_pid,
            name: name.to_string(),
            exe: None,
        });
    }

    /// Terminating `pid` will fail with access denied
    pub fn protect(&self, pid: u32) {
        self.protected.lock().insert(pid);
    }

    pub fn killed(&self) -> Vec<u32> {
        self.killed.lock().clone()
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.processes.lock().iter().any(|p| p.pid == pid)
    }
}

impl ProcessTable for FakeProcessTable {
    fn processes(&self) -> Vec<ProcessInfo> {
        self.processes.lock().clone()
    }

    fn terminate(&self, pid: u32) -> Result<(), TerminateError> {
        if self.protected.lock().contains(&pid) {
            return Err(TerminateError::AccessDenied(pid));
        }
        let mut processes = self.processes.lock();
        let before = processes.len();
        processes.retain(|p| p.pid != pid);
        if processes.len() == before {
            return Err(TerminateError::Gone(pid));
        }
        self.killed.lock().push(pid);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryJournal {
    pub current: Mutex<Option<PolicyBackup>>,
    pub records: Mutex<usize>,
}

impl BackupJournal for MemoryJournal {
    fn record(&self, backup: &PolicyBackup) -> anyhow::Result<()> {
        *self.current.lock() = Some(backup.clone());
        *self.records.lock() += 1;
        Ok(())
    }

    fn clear(&self) -> anyhow::Result<()> {
        *self.current.lock() = None;
        Ok(())
    }
}

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAction {
    Lock,
    Shutdown,
}

#[derive(Default)]
pub struct RecordingHostActions {
    performed: Mutex<Vec<HostAction>>,
}

impl RecordingHostActions {
    pub fn performed(&self) -> Vec<HostAction> {
        self.performed.lock().clone()
    }
}

impl HostActions for RecordingHostActions {
    fn lock_workstation(&self) -> anyhow::Result<()> {
        self.performed.lock().push(HostAction::Lock);
        Ok(())
    }

    fn shutdown(&self) -> anyhow::Result<()> {
        self.performed.lock().push(HostAction::Shutdown);
        Ok(())
    }
}

/// Transport whose connection outcomes are queued by the test
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Option<DuplexStream>>>,
    opened_at: Mutex<Vec<Instant>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a successful connection and return the controller's end of it
    pub fn push_stream(&self) -> DuplexStream {
        let (agent, controller) = tokio::io::duplex(64 * 1024);
        self.script.lock().push_back(Some(agent));
        controller
    }

    /// Queue a refused connection. An empty queue also refuses.
    pub fn push_failure(&self) {
        self.script.lock().push_back(None);
    }

    /// When each open was attempted
    pub fn opened_at(&self) -> Vec<Instant> {
        self.opened_at.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, _host: &str, _port: u16) -> io::Result<(BoxedReader, BoxedWriter)> {
        self.opened_at.lock().push(Instant::now());
        match self.script.lock().pop_front().flatten() {
            Some(stream) => {
                let (reader, writer) = tokio::io::split(stream);
                Ok((Box::new(reader), Box::new(writer)))
            }
            None => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "scripted refusal",
            )),
        }
    }
}
