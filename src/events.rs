//! In-process notifications between the agent core and the presentation layer.
//!
//! Status flows out as [`AgentEvent`] on a broadcast channel; user commands
//! flow in as [`UiCommand`] on an mpsc channel. Nothing is exchanged through
//! files or child processes.

use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of the event bus; slow consumers observe `Lagged` rather than
/// blocking the agent.
pub const EVENT_CAPACITY: usize = 256;

pub type EventSender = broadcast::Sender<AgentEvent>;
pub type EventReceiver = broadcast::Receiver<AgentEvent>;

/// Status notification consumed by the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    Connected,
    Disconnected,
    ConnectionStatusChanged { connected: bool },
    /// A connect or reconnect attempt is scheduled after `delay_secs`
    Reconnecting { attempt: u32, delay_secs: u64 },
    /// Reconnection gave up; operator action is required
    ConnectionFailed { message: String },
    MessageReceived { message_type: String },
    SessionStarted { session_id: String, duration_hours: f64 },
    SessionEnded { session_id: String, forced: bool },
    SessionPaused { remaining_secs: i64 },
    SessionResumed { remaining_secs: i64 },
    SessionExtended { minutes: f64 },
    ProcessBlocked { name: String },
    KioskModeChanged { enabled: bool },
    KioskFailure { message: String },
    AppLaunchFailed { name: String, reason: String },
    ComputerLocked,
    MaintenanceMode,
    ComputerRemoved,
    AdminUnlocked,
}

/// Command issued by the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiCommand {
    Connect { host: String, port: u16 },
    LaunchApp { name: String },
    ToggleKiosk,
    AdminUnlock { password: String },
}

/// Create the agent event bus
pub fn event_channel() -> (EventSender, EventReceiver) {
    broadcast::channel(EVENT_CAPACITY)
}

/// Publish an event; having no subscribers is not an error
pub fn emit(events: &EventSender, event: AgentEvent) {
    let _ = events.send(event);
}
