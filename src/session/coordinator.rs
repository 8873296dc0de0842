//! Turns controller commands and the countdown into kiosk and host actions.
//!
//! Session bookkeeping lives behind a short-lived lock; every kiosk change
//! runs on the blocking pool after that lock is released, so the receive
//! loop and the countdown never wait on registry writes or process kills.

use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::actions::HostActions;
use super::clock::Clock;
use super::state::{self, SessionState};
use crate::auth::{AdminGate, AuthError};
use crate::events::{AgentEvent, EventSender, emit};
use crate::kiosk::apps::{AllowedApp, AllowedAppsFile};
use crate::kiosk::controller::{KioskController, KioskError, KioskMode, SweepReport};
use crate::protocol::{InboundMessage, OutboundMessage, ProtocolClient};

/// Whether the machine accepts sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    Normal,
    /// Out of service until an attendant clears it locally
    Maintenance,
    /// Decommissioned by the controller
    Removed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("computer is not accepting sessions ({0:?})")]
    Unavailable(OperatingMode),

    #[error(transparent)]
    Kiosk(#[from] KioskError),

    #[error("session length of {0} hours is out of range")]
    InvalidLength(f64),

    #[error("cannot leave kiosk mode while a session is running")]
    SessionActive,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("host action failed: {0}")]
    Host(String),

    #[error("background task failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    Expired,
    Ordered { forced: bool },
    AdminOverride,
    OutOfService,
}

impl EndReason {
    fn forced(self) -> bool {
        match self {
            EndReason::Expired | EndReason::Ordered { forced: false } => false,
            EndReason::Ordered { forced: true } | EndReason::AdminOverride | EndReason::OutOfService => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostCommand {
    Lock,
    Shutdown,
}

/// Point-in-time view for the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub active: bool,
    pub session_id: Option<String>,
    pub paused: bool,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    pub remaining_secs: Option<i64>,
    pub kiosk_mode: KioskMode,
    pub operating_mode: OperatingMode,
    pub connected: bool,
}

pub struct SessionCoordinator {
    session: Mutex<SessionState>,
    mode: Mutex<OperatingMode>,
    apps_digest: Mutex<Option<[u8; 32]>>,
    kiosk: Arc<KioskController>,
    client: ProtocolClient,
    actions: Arc<dyn HostActions>,
    clock: Arc<dyn Clock>,
    admin: Arc<AdminGate>,
    apps_file: Option<PathBuf>,
    events: EventSender,
}

impl SessionCoordinator {
    pub fn new(
        kiosk: Arc<KioskController>,
        client: ProtocolClient,
        actions: Arc<dyn HostActions>,
        clock: Arc<dyn Clock>,
        events: EventSender,
    ) -> Self {
        Self {
            session: Mutex::new(SessionState::default()),
            mode: Mutex::new(OperatingMode::Normal),
            apps_digest: Mutex::new(None),
            kiosk,
            client,
            actions,
            clock,
            admin: Arc::new(AdminGate::new(None)),
            apps_file: None,
            events,
        }
    }

    pub fn with_admin(mut self, admin: AdminGate) -> Self {
        self.admin = Arc::new(admin);
        self
    }

    /// Persist controller-pushed allowed-app lists to this file
    pub fn with_apps_file(mut self, path: PathBuf) -> Self {
        self.apps_file = Some(path);
        self
    }

    pub fn operating_mode(&self) -> OperatingMode {
        *self.mode.lock()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let now = self.clock.now();
        let session = self.session.lock().clone();
        SessionSnapshot {
            active: session.active,
            session_id: session.session_id.clone(),
            paused: session.paused,
            end_time: session.end_time.filter(|_| !session.paused),
            remaining_secs: session.remaining(now).map(|r| r.num_seconds()),
            kiosk_mode: self.kiosk.mode(),
            operating_mode: self.operating_mode(),
            connected: self.client.is_connected(),
        }
    }

    /// Apply one controller command
    pub async fn handle(&self, message: InboundMessage) -> Result<(), SessionError> {
        match message {
            InboundMessage::StartSession {
                session_id,
                duration_hours,
            } => self.start_session(session_id, duration_hours).await,
            InboundMessage::EndSession { force_end } => {
                self.end_session(EndReason::Ordered { forced: force_end }).await;
                Ok(())
            }
            InboundMessage::ExtendSession { minutes } => {
                self.extend_session(minutes);
                Ok(())
            }
            InboundMessage::PauseSession => {
                self.pause_session();
                Ok(())
            }
            InboundMessage::ResumeSession => {
                self.resume_session();
                Ok(())
            }
            InboundMessage::LockComputer => self.host_command(HostCommand::Lock).await,
            InboundMessage::ShutdownComputer => self.host_command(HostCommand::Shutdown).await,
            InboundMessage::MaintenanceMode => {
                self.take_out_of_service(OperatingMode::Maintenance).await;
                Ok(())
            }
            InboundMessage::ComputerRemoved => {
                self.take_out_of_service(OperatingMode::Removed).await;
                Ok(())
            }
            InboundMessage::AllowedAppsUpdate { apps } => {
                self.update_allowed_apps(apps).await.map(|_| ())
            }
        }
    }

    async fn start_session(&self, session_id: String, duration_hours: f64) -> Result<(), SessionError> {
        let mode = self.operating_mode();
        if mode != OperatingMode::Normal {
            warn!("Refusing session {} while {:?}", session_id, mode);
            return Err(SessionError::Unavailable(mode));
        }

        let now = self.clock.now();
        let started = state::hours(duration_hours)
            .is_some_and(|length| self.session.lock().start(session_id.clone(), length, now));
        if !started {
            warn!("Refusing session {} of {} hours", session_id, duration_hours);
            return Err(SessionError::InvalidLength(duration_hours));
        }
        info!("Session {} started for {} hours", session_id, duration_hours);
        emit(
            &self.events,
            AgentEvent::SessionStarted {
                session_id,
                duration_hours,
            },
        );

        self.kiosk_call(|kiosk| kiosk.enable()).await.map_err(|e| {
            self.report_kiosk_failure(&e);
            e
        })
    }

    async fn end_session(&self, reason: EndReason) {
        let ended = self.session.lock().end(self.clock.now());
        let Some(ended) = ended else {
            debug!("No active session to end ({:?})", reason);
            return;
        };

        info!(
            "Session {} ended ({:?}) after {:.2} hours",
            ended.session_id,
            reason,
            ended.used_hours()
        );
        emit(
            &self.events,
            AgentEvent::SessionEnded {
                session_id: ended.session_id.clone(),
                forced: reason.forced(),
            },
        );

        if reason == EndReason::Expired {
            let report = OutboundMessage::SessionEnd {
                session_id: ended.session_id.clone(),
                duration_hours: ended.used_hours(),
            };
            if let Err(e) = self.client.send(report).await {
                warn!("Could not report end of session {}: {}", ended.session_id, e);
            }
        }

        if let Err(e) = self.kiosk_call(|kiosk| kiosk.disable()).await {
            self.report_kiosk_failure(&e);
        }
    }

    fn extend_session(&self, minutes: f64) -> bool {
        if minutes <= 0.0 || !minutes.is_finite() {
            debug!("Ignoring extension of {} minutes", minutes);
            return false;
        }

        let Some(by) = state::minutes(minutes) else {
            warn!("Ignoring out-of-range extension of {} minutes", minutes);
            return false;
        };
        let extended = self.session.lock().extend(by);
        if extended {
            info!("Session extended by {} minutes", minutes);
            emit(&self.events, AgentEvent::SessionExtended { minutes });
        } else {
            debug!("Extension of {} minutes not applied", minutes);
        }
        extended
    }

    fn pause_session(&self) -> bool {
        let now = self.clock.now();
        let remaining = {
            let mut session = self.session.lock();
            session.pause(now).then(|| session.remaining(now)).flatten()
        };

        match remaining {
            Some(remaining) => {
                info!("Session paused with {}s remaining", remaining.num_seconds());
                emit(
                    &self.events,
                    AgentEvent::SessionPaused {
                        remaining_secs: remaining.num_seconds(),
                    },
                );
                true
            }
            None => {
                debug!("Pause ignored, no running session");
                false
            }
        }
    }

    fn resume_session(&self) -> bool {
        let now = self.clock.now();
        let remaining = {
            let mut session = self.session.lock();
            session.resume(now).then(|| session.remaining(now)).flatten()
        };

        match remaining {
            Some(remaining) => {
                info!("Session resumed with {}s remaining", remaining.num_seconds());
                emit(
                    &self.events,
                    AgentEvent::SessionResumed {
                        remaining_secs: remaining.num_seconds(),
                    },
                );
                true
            }
            None => {
                debug!("Resume ignored, no paused session");
                false
            }
        }
    }

    async fn host_command(&self, command: HostCommand) -> Result<(), SessionError> {
        info!("Controller requested {:?}", command);
        let actions = self.actions.clone();
        tokio::task::spawn_blocking(move || match command {
            HostCommand::Lock => actions.lock_workstation(),
            HostCommand::Shutdown => actions.shutdown(),
        })
        .await
        .map_err(|e| SessionError::Worker(e.to_string()))?
        .map_err(|e| {
            error!("{:?} failed: {:#}", command, e);
            SessionError::Host(format!("{e:#}"))
        })?;

        if command == HostCommand::Lock {
            emit(&self.events, AgentEvent::ComputerLocked);
        }
        Ok(())
    }

    async fn take_out_of_service(&self, mode: OperatingMode) {
        warn!("Controller placed this computer in {:?} mode", mode);
        self.end_session(EndReason::OutOfService).await;
        *self.mode.lock() = mode;

        emit(
            &self.events,
            match mode {
                OperatingMode::Removed => AgentEvent::ComputerRemoved,
                _ => AgentEvent::MaintenanceMode,
            },
        );

        if let Err(e) = self.host_command(HostCommand::Lock).await {
            warn!("Could not lock the workstation: {}", e);
        }
    }

    /// Replace the allowed applications unless the list is unchanged
    pub async fn update_allowed_apps(&self, apps: Vec<AllowedApp>) -> Result<SweepReport, SessionError> {
        let digest = apps_digest(&apps);
        {
            let mut current = self.apps_digest.lock();
            if current.as_ref() == Some(&digest) {
                debug!("Allowed applications unchanged");
                return Ok(SweepReport::default());
            }
            *current = Some(digest);
        }

        let apps_file = self.apps_file.clone();
        let report = self
            .kiosk_call(move |kiosk| {
                if let Some(path) = &apps_file {
                    if let Err(e) = AllowedAppsFile::from_apps(&apps).save(path) {
                        warn!("Could not persist allowed applications: {:#}", e);
                    }
                }
                Ok(kiosk.update_allowed_apps(apps))
            })
            .await?;

        if !report.blocked.is_empty() {
            info!("Allowed list update closed {} processes", report.blocked.len());
        }
        Ok(report)
    }

    /// Countdown tick: end the session once its time is up
    pub async fn tick(&self) {
        let expired = self.session.lock().is_expired(self.clock.now());
        if expired {
            info!("Session time expired");
            self.end_session(EndReason::Expired).await;
        }
    }

    /// Announce readiness after every (re)connect
    pub async fn on_connected(&self) {
        let (end_time, is_paused) = {
            let session = self.session.lock();
            let running_end = session.end_time.filter(|_| session.active && !session.paused);
            (running_end, session.paused)
        };

        let announcements = [
            OutboundMessage::StatusUpdate { online: true },
            OutboundMessage::ClientReady { end_time, is_paused },
        ];
        for message in announcements {
            if let Err(e) = self.client.send(message).await {
                warn!("Could not announce readiness: {}", e);
                return;
            }
        }
    }

    /// Tell the controller this machine is going offline
    pub async fn announce_offline(&self) {
        if self.client.is_connected() {
            if let Err(e) = self.client.send(OutboundMessage::StatusUpdate { online: false }).await {
                debug!("Could not announce shutdown: {}", e);
            }
        }
    }

    /// Start an allowed application on behalf of the customer
    pub async fn launch_app(&self, name: String) -> Result<u32, SessionError> {
        self.kiosk_call(move |kiosk| kiosk.launch_app(&name)).await
    }

    /// Flip kiosk mode from the local UI. Leaving kiosk mode is refused
    /// while a session runs; use the admin override for that.
    pub async fn toggle_kiosk(&self) -> Result<KioskMode, SessionError> {
        match self.kiosk.mode() {
            KioskMode::Enabled => {
                if self.session.lock().active {
                    return Err(SessionError::SessionActive);
                }
                self.kiosk_call(|kiosk| kiosk.disable()).await?;
                Ok(KioskMode::Disabled)
            }
            KioskMode::Disabled => {
                self.kiosk_call(|kiosk| kiosk.enable()).await?;
                Ok(KioskMode::Enabled)
            }
        }
    }

    /// Attendant override: end any session, lift the lockdown and return
    /// to normal operation
    pub async fn admin_unlock(&self, password: String) -> Result<(), SessionError> {
        let admin = self.admin.clone();
        tokio::task::spawn_blocking(move || admin.verify(&password))
            .await
            .map_err(|e| SessionError::Worker(e.to_string()))??;

        info!("Admin override accepted");
        self.end_session(EndReason::AdminOverride).await;
        self.kiosk_call(|kiosk| kiosk.disable()).await?;
        *self.mode.lock() = OperatingMode::Normal;
        emit(&self.events, AgentEvent::AdminUnlocked);
        Ok(())
    }

    async fn kiosk_call<T, F>(&self, call: F) -> Result<T, SessionError>
    where
        F: FnOnce(&KioskController) -> Result<T, KioskError> + Send + 'static,
        T: Send + 'static,
    {
        let kiosk = self.kiosk.clone();
        tokio::task::spawn_blocking(move || call(&kiosk))
            .await
            .map_err(|e| SessionError::Worker(e.to_string()))?
            .map_err(SessionError::from)
    }

    fn report_kiosk_failure(&self, error: &SessionError) {
        error!("Kiosk operation failed: {}", error);
        emit(
            &self.events,
            AgentEvent::KioskFailure {
                message: error.to_string(),
            },
        );
    }
}

fn apps_digest(apps: &[AllowedApp]) -> [u8; 32] {
    let mut sorted: Vec<&AllowedApp> = apps.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut hasher = Sha256::new();
    for app in sorted {
        // serde_json of a plain struct cannot fail
        if let Ok(bytes) = serde_json::to_vec(app) {
            hasher.update(&bytes);
        }
        hasher.update(b"\n");
    }
    hasher.finalize().into()
}
