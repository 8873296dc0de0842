//! Reconnecting controller client.
//!
//! One receive task and one heartbeat task run per live connection. Each
//! connection carries a generation number so that a loop belonging to a
//! connection that has already been torn down can never trigger loss handling
//! for its successor. Writes are serialized through the writer mutex.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::backoff::ReconnectPolicy;
use super::message::{Message, OutboundMessage};
use super::transport::{BoxedReader, BoxedWriter, Transport};
use super::ProtocolError;
use crate::events::{AgentEvent, EventSender, emit};

/// Callback invoked on the receive task for each message of a registered type
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Timing knobs of the controller link
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// How often the heartbeat task checks whether a heartbeat is due
    pub heartbeat_check: Duration,
    /// Upper bound on waiting for a loop to exit during disconnect
    pub join_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_check: Duration::from_secs(1),
            join_timeout: Duration::from_secs(1),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Observable link status
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionState {
    pub connected: bool,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub last_heartbeat_at: Option<Instant>,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub base_reconnect_delay: Duration,
}

struct Link {
    generation: u64,
    shutdown: watch::Sender<bool>,
    receive: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

struct Shared {
    settings: ConnectionSettings,
    transport: Arc<dyn Transport>,
    state: Mutex<ConnectionState>,
    /// Bumped for every established connection and on manual disconnect
    generation: AtomicU64,
    /// Bumped on manual disconnect; pending reconnect loops compare against it
    epoch: AtomicU64,
    reconnect_enabled: AtomicBool,
    writer: AsyncMutex<Option<BoxedWriter>>,
    handlers: RwLock<HashMap<String, Handler>>,
    link: Mutex<Option<Link>>,
    connect_lock: AsyncMutex<()>,
    events: EventSender,
}

/// Client side of the controller protocol
#[derive(Clone)]
pub struct ProtocolClient {
    shared: Arc<Shared>,
}

impl ProtocolClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
        events: EventSender,
    ) -> Self {
        let state = ConnectionState {
            max_reconnect_attempts: settings.reconnect.max_attempts,
            base_reconnect_delay: settings.reconnect.base,
            ..ConnectionState::default()
        };

        Self {
            shared: Arc::new(Shared {
                settings,
                transport,
                state: Mutex::new(state),
                generation: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                reconnect_enabled: AtomicBool::new(false),
                writer: AsyncMutex::new(None),
                handlers: RwLock::new(HashMap::new()),
                link: Mutex::new(None),
                connect_lock: AsyncMutex::new(()),
                events,
            }),
        }
    }

    /// Open the link and start the receive and heartbeat loops.
    ///
    /// Calling this while already connected logs a warning and succeeds.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), ProtocolError> {
        Shared::connect(&self.shared, host, port).await
    }

    /// Tear the link down without scheduling a reconnect. Safe to call when
    /// already disconnected.
    pub async fn disconnect(&self) {
        self.shared.disconnect().await
    }

    pub async fn send(&self, message: OutboundMessage) -> Result<(), ProtocolError> {
        self.shared.send(&message.into_message()).await
    }

    /// Send an arbitrary envelope
    pub async fn send_message(&self, message: &Message) -> Result<(), ProtocolError> {
        self.shared.send(message).await
    }

    /// Register the handler for one message type, replacing any previous one
    pub fn register_handler<F>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .insert(kind.into(), Arc::new(handler));
    }

    pub fn unregister_handler(&self, kind: &str) {
        self.shared.handlers.write().remove(kind);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().clone()
    }
}

impl Shared {
    async fn connect(shared: &Arc<Self>, host: &str, port: u16) -> Result<(), ProtocolError> {
        let _serialized = shared.connect_lock.lock().await;

        if shared.state.lock().connected {
            warn!("Already connected to controller, ignoring connect request");
            return Ok(());
        }

        info!("Connecting to controller at {}:{}", host, port);
        let timeout = shared.settings.connect_timeout;
        let (reader, writer) = match time::timeout(timeout, shared.transport.open(host, port)).await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!("Connection to {}:{} failed: {}", host, port, e);
                return Err(ProtocolError::Io(e));
            }
            Err(_) => {
                warn!("Connection to {}:{} timed out", host, port);
                return Err(ProtocolError::ConnectTimeout {
                    host: host.to_string(),
                    port,
                    timeout,
                });
            }
        };

        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *shared.writer.lock().await = Some(writer);

        {
            let mut state = shared.state.lock();
            state.connected = true;
            state.host = Some(host.to_string());
            state.port = Some(port);
            state.last_heartbeat_at = Some(Instant::now());
            state.reconnect_attempts = 0;
        }
        shared.reconnect_enabled.store(true, Ordering::SeqCst);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let receive = spawn_receive_loop(shared.clone(), generation, reader, shutdown_rx.clone());
        let heartbeat = spawn_heartbeat_loop(shared.clone(), generation, shutdown_rx);

        let previous = shared.link.lock().replace(Link {
            generation,
            shutdown,
            receive,
            heartbeat,
        });
        if let Some(stale) = previous {
            let _ = stale.shutdown.send(true);
        }

        info!("Connected to controller at {}:{}", host, port);
        emit(&shared.events, AgentEvent::Connected);
        emit(
            &shared.events,
            AgentEvent::ConnectionStatusChanged { connected: true },
        );
        Ok(())
    }

    async fn disconnect(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.reconnect_enabled.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);

        let was_connected = {
            let mut state = self.state.lock();
            let was_connected = state.connected;
            state.connected = false;
            state.host = None;
            state.port = None;
            state.last_heartbeat_at = None;
            state.reconnect_attempts = 0;
            was_connected
        };

        let link = self.link.lock().take();
        if let Some(link) = link {
            let _ = link.shutdown.send(true);
            join_bounded(link.receive, self.settings.join_timeout, "receive").await;
            join_bounded(link.heartbeat, self.settings.join_timeout, "heartbeat").await;
        }

        self.close_writer().await;

        if was_connected {
            info!("Disconnected from controller");
            emit(&self.events, AgentEvent::Disconnected);
            emit(
                &self.events,
                AgentEvent::ConnectionStatusChanged { connected: false },
            );
        }
    }

    async fn send(self: &Arc<Self>, message: &Message) -> Result<(), ProtocolError> {
        let generation = {
            let state = self.state.lock();
            if !state.connected {
                return Err(ProtocolError::NotConnected);
            }
            self.generation.load(Ordering::SeqCst)
        };
        let payload = message.encode()?;

        let result = {
            let mut writer = self.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                return Err(ProtocolError::NotConnected);
            };
            match writer.write_all(&payload).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => {
                debug!("Sent {} message", message.kind);
                Ok(())
            }
            Err(e) => {
                error!("Failed to send {} message: {}", message.kind, e);
                self.handle_connection_lost(generation).await;
                Err(ProtocolError::Io(e))
            }
        }
    }

    fn dispatch(&self, line: &[u8]) {
        let message = match Message::decode(line) {
            Ok(message) => message,
            Err(ProtocolError::EmptyFrame) => return,
            Err(e) => {
                warn!("Discarding malformed message from controller: {}", e);
                return;
            }
        };

        debug!("Received {} message", message.kind);
        emit(
            &self.events,
            AgentEvent::MessageReceived {
                message_type: message.kind.clone(),
            },
        );

        let handler = self.handlers.read().get(&message.kind).cloned();
        match handler {
            Some(handler) => handler(&message),
            None => debug!("No handler registered for {} messages", message.kind),
        }
    }

    /// Idempotent per generation: only the first caller for the live
    /// connection tears it down and schedules reconnection.
    async fn handle_connection_lost(self: &Arc<Self>, generation: u64) {
        {
            let mut state = self.state.lock();
            if !state.connected || self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            state.connected = false;
            state.last_heartbeat_at = None;
        }
        warn!("Connection to controller lost");

        let link = {
            let mut link = self.link.lock();
            if link.as_ref().is_some_and(|l| l.generation == generation) {
                link.take()
            } else {
                None
            }
        };
        // The caller is one of these loops, so signal them instead of joining
        if let Some(link) = link {
            let _ = link.shutdown.send(true);
        }

        self.close_writer().await;

        emit(&self.events, AgentEvent::Disconnected);
        emit(
            &self.events,
            AgentEvent::ConnectionStatusChanged { connected: false },
        );

        if self.reconnect_enabled.load(Ordering::SeqCst) {
            spawn_reconnect_loop(self.clone(), self.epoch.load(Ordering::SeqCst));
        }
    }

    async fn close_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if time::timeout(self.settings.join_timeout, writer.shutdown())
                .await
                .is_err()
            {
                debug!("Timed out closing controller stream");
            }
        }
    }
}

async fn join_bounded(mut handle: JoinHandle<()>, timeout: Duration, name: &str) {
    if time::timeout(timeout, &mut handle).await.is_err() {
        warn!("{} loop did not stop within {:?}, aborting it", name, timeout);
        handle.abort();
    }
}

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

fn spawn_receive_loop(
    shared: Arc<Shared>,
    generation: u64,
    reader: BoxedReader,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let task: BoxedTask = Box::pin(receive_loop(shared, generation, reader, shutdown));
    tokio::spawn(task)
}

fn spawn_heartbeat_loop(
    shared: Arc<Shared>,
    generation: u64,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let task: BoxedTask = Box::pin(heartbeat_loop(shared, generation, shutdown));
    tokio::spawn(task)
}

fn spawn_reconnect_loop(shared: Arc<Shared>, epoch: u64) {
    let task: BoxedTask = Box::pin(reconnect_loop(shared, epoch));
    tokio::spawn(task);
}

async fn receive_loop(
    shared: Arc<Shared>,
    generation: u64,
    reader: BoxedReader,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(4096);

    loop {
        line.clear();
        let read = tokio::select! {
            _ = shutdown.changed() => {
                debug!("Receive loop stopping");
                return;
            }
            read = reader.read_until(b'\n', &mut line) => read,
        };

        match read {
            Ok(0) => {
                info!("Controller closed the connection");
                break;
            }
            // A trailing fragment without newline means the stream ended mid-frame
            Ok(_) if line.last() != Some(&b'\n') => {
                warn!("Controller closed the connection mid-message");
                break;
            }
            Ok(_) => shared.dispatch(&line),
            Err(e) => {
                error!("Error reading from controller: {}", e);
                break;
            }
        }
    }

    shared.handle_connection_lost(generation).await;
}

async fn heartbeat_loop(shared: Arc<Shared>, generation: u64, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = time::interval(shared.settings.heartbeat_check);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }

        let due = {
            let state = shared.state.lock();
            if !state.connected || shared.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            state
                .last_heartbeat_at
                .is_none_or(|at| at.elapsed() >= shared.settings.heartbeat_interval)
        };
        if !due {
            continue;
        }

        // A failed send has already run loss handling for this generation
        if shared
            .send(&OutboundMessage::Heartbeat.into_message())
            .await
            .is_err()
        {
            return;
        }
        shared.state.lock().last_heartbeat_at = Some(Instant::now());
    }
}

async fn reconnect_loop(shared: Arc<Shared>, epoch: u64) {
    let policy = shared.settings.reconnect;

    loop {
        let (attempt, host, port) = {
            let mut state = shared.state.lock();
            if state.connected {
                return;
            }
            state.reconnect_attempts += 1;
            (state.reconnect_attempts, state.host.clone(), state.port)
        };

        if policy.exhausted(attempt) {
            let message = format!(
                "Unable to reach the controller after {} reconnect attempts",
                policy.max_attempts
            );
            error!("{}", message);
            emit(&shared.events, AgentEvent::ConnectionFailed { message });
            return;
        }

        let (Some(host), Some(port)) = (host, port) else {
            warn!("No controller address recorded, not reconnecting");
            return;
        };

        let delay = policy.delay_for(attempt);
        info!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay, attempt, policy.max_attempts
        );
        emit(
            &shared.events,
            AgentEvent::Reconnecting {
                attempt,
                delay_secs: delay.as_secs(),
            },
        );

        time::sleep(delay).await;
        if shared.epoch.load(Ordering::SeqCst) != epoch {
            debug!("Reconnect cancelled by disconnect");
            return;
        }

        match Shared::connect(&shared, &host, port).await {
            Ok(()) => {
                info!("Reconnected to controller");
                return;
            }
            Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use crate::protocol::TcpTransport;
    use crate::testing::ScriptedTransport;
    use serde_json::Value;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn client_with(
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
    ) -> (ProtocolClient, crate::events::EventReceiver) {
        let (events, rx) = event_channel();
        (ProtocolClient::new(transport, settings, events), rx)
    }

    #[tokio::test]
    async fn test_receives_messages_in_order_and_skips_garbage() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(
                    b"{\"type\":\"pause_session\",\"data\":{}}\nnot json at all\n\n\
                      {\"type\":\"resume_session\",\"data\":{},\"timestamp\":1.0}\n",
                )
                .await
                .unwrap();
            socket
        });

        let (client, _rx) = client_with(Arc::new(TcpTransport), ConnectionSettings::default());
        let (tx, mut seen) = mpsc::unbounded_channel();
        for kind in ["pause_session", "resume_session"] {
            let tx = tx.clone();
            client.register_handler(kind, move |m: &Message| {
                let _ = tx.send(m.kind.clone());
            });
        }

        client.connect("127.0.0.1", port).await.unwrap();
        let _socket = server.await.unwrap();

        let first = time::timeout(Duration::from_secs(5), seen.recv()).await.unwrap();
        let second = time::timeout(Duration::from_secs(5), seen.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("pause_session"));
        assert_eq!(second.as_deref(), Some("resume_session"));
        assert!(client.is_connected());

        client.disconnect().await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_send_writes_one_json_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let (client, _rx) = client_with(Arc::new(TcpTransport), ConnectionSettings::default());
        client.connect("127.0.0.1", port).await.unwrap();
        client
            .send(OutboundMessage::StatusUpdate { online: true })
            .await
            .unwrap();

        let socket = server.await.unwrap();
        let mut line = String::new();
        BufReader::new(socket).read_line(&mut line).await.unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "status_update");
        assert_eq!(value["data"]["status"], "online");

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let (client, _rx) = client_with(ScriptedTransport::new(), ConnectionSettings::default());
        let result = client.send(OutboundMessage::Heartbeat).await;
        assert!(matches!(result, Err(ProtocolError::NotConnected)));
    }

    #[tokio::test]
    async fn test_failed_connect_emits_nothing() {
        let (client, mut rx) = client_with(ScriptedTransport::new(), ConnectionSettings::default());

        assert!(client.connect("controller", 5000).await.is_err());
        assert!(!client.is_connected());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_is_safe_when_not_connected() {
        let (client, mut rx) = client_with(ScriptedTransport::new(), ConnectionSettings::default());
        client.disconnect().await;
        client.disconnect().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sent_once_interval_elapses() {
        let transport = ScriptedTransport::new();
        let server = transport.push_stream();
        let (client, _rx) = client_with(transport, ConnectionSettings::default());

        let started = Instant::now();
        client.connect("controller", 5000).await.unwrap();

        let mut lines = BufReader::new(server).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let message = Message::decode(line.as_bytes()).unwrap();

        assert_eq!(message.kind, "heartbeat");
        assert!(started.elapsed() >= Duration::from_secs(30));

        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_then_terminal_failure() {
        let transport = ScriptedTransport::new();
        let server = transport.push_stream();
        let settings = ConnectionSettings {
            reconnect: ReconnectPolicy {
                base: Duration::from_secs(5),
                cap: Duration::from_secs(60),
                max_attempts: 6,
            },
            ..ConnectionSettings::default()
        };
        let (client, mut rx) = client_with(transport.clone(), settings);

        client.connect("controller", 5000).await.unwrap();
        drop(server);

        let mut announced = Vec::new();
        let failure = loop {
            match rx.recv().await.unwrap() {
                AgentEvent::Reconnecting { delay_secs, .. } => announced.push(delay_secs),
                AgentEvent::ConnectionFailed { message } => break message,
                _ => {}
            }
        };

        let opened = transport.opened_at();
        let gaps: Vec<u64> = opened
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs())
            .collect();

        assert_eq!(gaps, vec![5, 10, 20, 40, 60, 60]);
        assert_eq!(announced, gaps);
        assert!(failure.contains("6 reconnect attempts"));
        assert!(!client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_succeeds_and_resets_attempts() {
        let transport = ScriptedTransport::new();
        let first = transport.push_stream();
        transport.push_failure();
        let _second = transport.push_stream();
        let (client, mut rx) = client_with(transport.clone(), ConnectionSettings::default());

        client.connect("controller", 5000).await.unwrap();
        drop(first);

        let mut connects = 0;
        while connects < 2 {
            if rx.recv().await.unwrap() == AgentEvent::Connected {
                connects += 1;
            }
        }

        let state = client.state();
        assert!(state.connected);
        assert_eq!(state.reconnect_attempts, 0);
        assert_eq!(state.host.as_deref(), Some("controller"));
        assert_eq!(transport.opened_at().len(), 3);

        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_disconnect_never_reconnects() {
        let transport = ScriptedTransport::new();
        let _server = transport.push_stream();
        let (client, _rx) = client_with(transport.clone(), ConnectionSettings::default());

        client.connect("controller", 5000).await.unwrap();
        client.disconnect().await;
        time::sleep(Duration::from_secs(300)).await;

        assert_eq!(transport.opened_at().len(), 1);
        assert!(!client.is_connected());
    }
}
