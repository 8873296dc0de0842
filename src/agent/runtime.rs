//! Long-running tasks of the agent.
//!
//! The protocol client delivers controller messages on its receive task;
//! handlers only forward them into a queue so the receive loop never waits
//! on session or kiosk work. A single consumer drains that queue in order.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::events::{AgentEvent, EventReceiver, EventSender, UiCommand, emit};
use crate::kiosk::KioskController;
use crate::protocol::message::INBOUND_TYPES;
use crate::protocol::{InboundMessage, Message, ProtocolClient};
use crate::session::SessionCoordinator;

const COUNTDOWN_TICK: Duration = Duration::from_secs(1);
const SHUTDOWN_RESTORE_LIMIT: Duration = Duration::from_secs(15);
const UI_QUEUE: usize = 32;

type ConnectorSlot = Arc<Mutex<Option<JoinHandle<()>>>>;

pub struct AgentRuntime {
    config: AgentConfig,
    config_path: Option<PathBuf>,
    client: ProtocolClient,
    kiosk: Arc<KioskController>,
    coordinator: Arc<SessionCoordinator>,
    events: EventSender,
}

/// Handle to a started agent
pub struct RunningAgent {
    commands: mpsc::Sender<UiCommand>,
    events: EventSender,
    client: ProtocolClient,
    kiosk: Arc<KioskController>,
    coordinator: Arc<SessionCoordinator>,
    connector: ConnectorSlot,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentRuntime {
    pub fn new(
        config: AgentConfig,
        client: ProtocolClient,
        kiosk: Arc<KioskController>,
        coordinator: Arc<SessionCoordinator>,
        events: EventSender,
    ) -> Self {
        Self {
            config,
            config_path: None,
            client,
            kiosk,
            coordinator,
            events,
        }
    }

    /// Persist controller address changes requested by the UI here
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    /// Spawn every agent task and begin connecting to the controller
    pub fn start(self) -> RunningAgent {
        let Self {
            config,
            config_path,
            client,
            kiosk,
            coordinator,
            events,
        } = self;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Message>();
        for kind in INBOUND_TYPES {
            let tx = inbound_tx.clone();
            client.register_handler(kind, move |message: &Message| {
                let _ = tx.send(message.clone());
            });
        }

        let (commands, ui_rx) = mpsc::channel(UI_QUEUE);
        let connector: ConnectorSlot = Arc::new(Mutex::new(None));
        let retry = Duration::from_secs(config.connection.initial_retry_interval);

        let mut tasks = vec![
            tokio::spawn(dispatch_inbound(inbound_rx, coordinator.clone())),
            tokio::spawn(announce_on_connect(events.subscribe(), coordinator.clone())),
            tokio::spawn(countdown(coordinator.clone())),
            tokio::spawn(enforce(kiosk.clone(), config.kiosk.sweep_every())),
        ];

        spawn_connector(
            &connector,
            client.clone(),
            config.connection.host.clone(),
            config.connection.port,
            retry,
            events.clone(),
        );

        tasks.push(tokio::spawn(process_ui_commands(
            ui_rx,
            UiContext {
                config,
                config_path,
                client: client.clone(),
                coordinator: coordinator.clone(),
                connector: connector.clone(),
                events: events.clone(),
            },
        )));

        RunningAgent {
            commands,
            events,
            client,
            kiosk,
            coordinator,
            connector,
            tasks,
        }
    }
}

impl RunningAgent {
    /// Channel for presentation-layer commands
    pub fn commands(&self) -> mpsc::Sender<UiCommand> {
        self.commands.clone()
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    /// Stop every task, tell the controller we are leaving and lift the
    /// lockdown
    pub async fn shutdown(self) {
        info!("Shutting down agent");

        if let Some(handle) = self.connector.lock().take() {
            handle.abort();
        }
        for task in &self.tasks {
            task.abort();
        }

        self.coordinator.announce_offline().await;
        self.client.disconnect().await;

        let kiosk = self.kiosk.clone();
        let restore = tokio::task::spawn_blocking(move || kiosk.disable());
        match tokio::time::timeout(SHUTDOWN_RESTORE_LIMIT, restore).await {
            Ok(Ok(Ok(()))) => info!("Kiosk mode lifted"),
            Ok(Ok(Err(e))) => warn!("Could not lift kiosk mode cleanly: {}", e),
            Ok(Err(e)) => warn!("Kiosk restore task failed: {}", e),
            Err(_) => warn!(
                "Kiosk restore did not finish within {}s",
                SHUTDOWN_RESTORE_LIMIT.as_secs()
            ),
        }
    }
}

async fn dispatch_inbound(
    mut inbound: mpsc::UnboundedReceiver<Message>,
    coordinator: Arc<SessionCoordinator>,
) {
    while let Some(message) = inbound.recv().await {
        match InboundMessage::from_message(&message) {
            Ok(Some(command)) => {
                if let Err(e) = coordinator.handle(command).await {
                    warn!("Could not apply {}: {}", message.kind, e);
                }
            }
            Ok(None) => debug!("No handling for {}", message.kind),
            Err(e) => warn!("Dropping invalid {} message: {}", message.kind, e),
        }
    }
}

async fn announce_on_connect(mut events: EventReceiver, coordinator: Arc<SessionCoordinator>) {
    loop {
        match events.recv().await {
            Ok(AgentEvent::Connected) => coordinator.on_connected().await,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event watcher missed {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn countdown(coordinator: Arc<SessionCoordinator>) {
    let mut ticker = tokio::time::interval(COUNTDOWN_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        coordinator.tick().await;
    }
}

async fn enforce(kiosk: Arc<KioskController>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let kiosk = kiosk.clone();
        match tokio::task::spawn_blocking(move || kiosk.sweep()).await {
            Ok(report) if !report.blocked.is_empty() => {
                debug!("Sweep blocked {:?}", report.blocked);
            }
            Ok(_) => {}
            Err(e) => warn!("Enforcement sweep failed: {}", e),
        }
    }
}

/// Keep trying to reach the controller until the first connect succeeds.
/// Later drops are handled by the client's own reconnect schedule.
async fn connect_until_up(
    client: ProtocolClient,
    host: String,
    port: u16,
    retry: Duration,
    events: EventSender,
) {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match client.connect(&host, port).await {
            Ok(()) => {
                info!("Connected to controller at {}:{}", host, port);
                return;
            }
            Err(e) => {
                warn!(
                    "Controller {}:{} unreachable ({}), retrying in {}s",
                    host,
                    port,
                    e,
                    retry.as_secs()
                );
                emit(
                    &events,
                    AgentEvent::Reconnecting {
                        attempt,
                        delay_secs: retry.as_secs(),
                    },
                );
                tokio::time::sleep(retry).await;
            }
        }
    }
}

fn spawn_connector(
    slot: &ConnectorSlot,
    client: ProtocolClient,
    host: String,
    port: u16,
    retry: Duration,
    events: EventSender,
) {
    let handle = tokio::spawn(connect_until_up(client, host, port, retry, events));
    if let Some(previous) = slot.lock().replace(handle) {
        previous.abort();
    }
}

struct UiContext {
    config: AgentConfig,
    config_path: Option<PathBuf>,
    client: ProtocolClient,
    coordinator: Arc<SessionCoordinator>,
    connector: ConnectorSlot,
    events: EventSender,
}

async fn process_ui_commands(mut commands: mpsc::Receiver<UiCommand>, mut ctx: UiContext) {
    while let Some(command) = commands.recv().await {
        match command {
            UiCommand::Connect { host, port } => {
                info!("Switching controller to {}:{}", host, port);
                ctx.config.connection.host = host.clone();
                ctx.config.connection.port = port;
                if let Some(path) = &ctx.config_path {
                    if let Err(e) = ctx.config.save(path) {
                        warn!("Could not save connection settings: {:#}", e);
                    }
                }

                ctx.client.disconnect().await;
                spawn_connector(
                    &ctx.connector,
                    ctx.client.clone(),
                    host,
                    port,
                    Duration::from_secs(ctx.config.connection.initial_retry_interval),
                    ctx.events.clone(),
                );
            }
            UiCommand::LaunchApp { name } => {
                if let Err(e) = ctx.coordinator.launch_app(name.clone()).await {
                    warn!("Could not launch {}: {}", name, e);
                }
            }
            UiCommand::ToggleKiosk => match ctx.coordinator.toggle_kiosk().await {
                Ok(mode) => info!("Kiosk mode toggled to {}", mode),
                Err(e) => warn!("Could not toggle kiosk mode: {}", e),
            },
            UiCommand::AdminUnlock { password } => {
                if let Err(e) = ctx.coordinator.admin_unlock(password).await {
                    warn!("Admin override rejected: {}", e);
                }
            }
        }
    }
}
