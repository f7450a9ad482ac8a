use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use tradedesk_core::*;

use crate::config::{BridgeOptions, ConfigStore};
use crate::protocol::{next_correlation_id, CommandEnvelope, ResponseEnvelope};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type Reply = oneshot::Sender<Result<Value, BridgeError>>;

/// Requests from [`BridgeManager`] handles to the connection actor.
enum ActorMessage {
    Connect {
        reply: oneshot::Sender<bool>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    /// Write a command; the ack carries the receiver for its response.
    Send {
        envelope: CommandEnvelope,
        ack: oneshot::Sender<Result<oneshot::Receiver<Result<Value, BridgeError>>, BridgeError>>,
    },
    /// Drop a pending request whose caller gave up.
    Forget {
        id: String,
    },
    UpdateConfig {
        config: BridgeConfig,
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
}

/// Frames and lifecycle events from a socket's reader task.
enum SocketEvent {
    Text { generation: u64, text: String },
    Closed { generation: u64, reason: String },
}

struct PendingRequest {
    command: String,
    issued_at: Instant,
    deadline: Instant,
    reply: Reply,
}

/// Handle to the MT5 bridge connection.
///
/// A single actor task owns the socket, the pending-request table and the
/// connection state. Handles are cheap to clone and talk to it over a
/// channel; when the last handle is dropped the actor closes the socket
/// and exits.
#[derive(Clone)]
pub struct BridgeManager {
    commands: mpsc::Sender<ActorMessage>,
    /// Bumped before `disconnect`/`update_config` so an in-flight `connect()` stops retrying.
    interrupt: Arc<watch::Sender<u64>>,
    status: watch::Receiver<BridgeStatus>,
    config: watch::Receiver<BridgeConfig>,
    options: BridgeOptions,
}

impl BridgeManager {
    /// Spawn a manager for `config` without persistence. Must be called
    /// from within a tokio runtime.
    pub fn new(config: BridgeConfig, options: BridgeOptions) -> Self {
        Self::spawn(config, None, options)
    }

    /// Load the connection record from `store` once and spawn a manager
    /// that writes config updates back to it.
    pub fn from_store(store: ConfigStore, options: BridgeOptions) -> Result<Self, BridgeError> {
        let config = store.load()?;
        Ok(Self::spawn(config, Some(store), options))
    }

    fn spawn(config: BridgeConfig, store: Option<ConfigStore>, options: BridgeOptions) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(BridgeStatus::new(&config));
        let (config_tx, config_rx) = watch::channel(config.clone());
        let (interrupt_tx, interrupt_rx) = watch::channel(0u64);

        let actor = BridgeActor {
            config,
            store,
            options: options.clone(),
            events_tx,
            sink: None,
            reader: None,
            generation: 0,
            pending: HashMap::new(),
            interrupts: interrupt_rx,
            status_tx,
            config_tx,
        };
        tokio::spawn(actor.run(commands_rx, events_rx));

        Self {
            commands: commands_tx,
            interrupt: Arc::new(interrupt_tx),
            status: status_rx,
            config: config_rx,
            options,
        }
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    /// Establish the socket, retrying per [`BridgeOptions`]. Resolves `false`
    /// once every attempt has failed; never errors.
    pub async fn connect(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(ActorMessage::Connect { reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn disconnect(&self) {
        self.interrupt_connect();
        let (reply, rx) = oneshot::channel();
        if self.commands.send(ActorMessage::Disconnect { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Send `command` and wait for the response with the same correlation id.
    ///
    /// If the socket is down, one `connect()` is attempted first. The request
    /// timeout starts once the command has been written.
    pub async fn send(&self, command: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        let envelope = CommandEnvelope::new(next_correlation_id(), command, args);
        let id = envelope.id.clone();

        let (ack, ack_rx) = oneshot::channel();
        self.commands
            .send(ActorMessage::Send { envelope, ack })
            .await
            .map_err(|_| manager_stopped())?;
        let response = ack_rx.await.map_err(|_| manager_stopped())??;

        match tokio::time::timeout(self.options.request_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(manager_stopped()),
            Err(_) => {
                warn!(id = %id, command, "Bridge command timed out");
                let _ = self.commands.send(ActorMessage::Forget { id }).await;
                Err(BridgeError::Timeout {
                    command: command.to_string(),
                    timeout: self.options.request_timeout,
                })
            }
        }
    }

    pub fn status(&self) -> BridgeStatus {
        self.status.borrow().clone()
    }

    /// Subscribe to status changes.
    pub fn watch_status(&self) -> watch::Receiver<BridgeStatus> {
        self.status.clone()
    }

    pub fn config(&self) -> BridgeConfig {
        self.config.borrow().clone()
    }

    pub async fn update_config(&self, config: BridgeConfig) -> Result<(), BridgeError> {
        self.interrupt_connect();
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ActorMessage::UpdateConfig { config, reply })
            .await
            .map_err(|_| manager_stopped())?;
        rx.await.map_err(|_| manager_stopped())?
    }

    fn interrupt_connect(&self) {
        self.interrupt.send_modify(|n| *n = n.wrapping_add(1));
    }
}

/// How often the actor scans for abandoned or overdue requests.
fn sweep_period(request_timeout: Duration) -> Duration {
    (request_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1))
}

fn manager_stopped() -> BridgeError {
    BridgeError::ConnectionClosed("bridge manager stopped".to_string())
}

#[async_trait]
impl BridgeChannel for BridgeManager {
    async fn connect(&self) -> bool {
        BridgeManager::connect(self).await
    }

    async fn disconnect(&self) {
        BridgeManager::disconnect(self).await
    }

    async fn call(&self, command: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        self.send(command, args).await
    }

    fn status(&self) -> BridgeStatus {
        BridgeManager::status(self)
    }

    fn config(&self) -> BridgeConfig {
        BridgeManager::config(self)
    }

    async fn update_config(&self, config: BridgeConfig) -> Result<(), BridgeError> {
        BridgeManager::update_config(self, config).await
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct BridgeActor {
    config: BridgeConfig,
    store: Option<ConfigStore>,
    options: BridgeOptions,
    events_tx: mpsc::UnboundedSender<SocketEvent>,
    sink: Option<WsSink>,
    reader: Option<JoinHandle<()>>,
    /// Bumped per socket so events from a superseded reader are discarded.
    generation: u64,
    pending: HashMap<String, PendingRequest>,
    interrupts: watch::Receiver<u64>,
    status_tx: watch::Sender<BridgeStatus>,
    config_tx: watch::Sender<BridgeConfig>,
}

impl BridgeActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ActorMessage>,
        mut events: mpsc::UnboundedReceiver<SocketEvent>,
    ) {
        let mut sweep = tokio::time::interval(sweep_period(self.options.request_timeout));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = commands.recv() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = sweep.tick() => self.expire_pending(),
            }
        }

        self.close_socket("bridge manager stopped").await;
        debug!("Bridge manager stopped");
    }

    async fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Connect { reply } => {
                let connected = self.connect().await;
                let _ = reply.send(connected);
            }
            ActorMessage::Disconnect { reply } => {
                self.close_socket("disconnected by user").await;
                info!(endpoint = %self.config.endpoint(), "Disconnected from MT5 bridge");
                let _ = reply.send(());
            }
            ActorMessage::Send { envelope, ack } => {
                let _ = ack.send(self.dispatch(envelope).await);
            }
            ActorMessage::Forget { id } => {
                if self.pending.remove(&id).is_some() {
                    debug!(id = %id, "Dropped pending bridge request");
                    self.publish_pending();
                }
            }
            ActorMessage::UpdateConfig { config, reply } => {
                let _ = reply.send(self.update_config(config).await);
            }
        }
    }

    fn handle_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Text { generation, text } if generation == self.generation => {
                self.route(&text);
            }
            SocketEvent::Closed { generation, reason }
                if generation == self.generation && self.sink.is_some() =>
            {
                warn!(endpoint = %self.config.endpoint(), reason = %reason, "MT5 bridge connection lost");
                self.drop_socket(&reason);
                self.status_tx.send_modify(|s| {
                    s.state = ConnectionState::Disconnected;
                    s.connected_since = None;
                    s.last_error = Some(reason);
                });
            }
            _ => debug!("Ignoring event from stale bridge socket"),
        }
    }

    /// Open the socket, retrying with a fixed delay.
    async fn connect(&mut self) -> bool {
        if self.sink.is_some() {
            return true;
        }
        if !self.config.enabled {
            debug!(endpoint = %self.config.endpoint(), "Bridge disabled, not connecting");
            self.status_tx.send_modify(|s| {
                s.state = ConnectionState::Disconnected;
                s.last_error = Some(BridgeError::Disabled.to_string());
            });
            return false;
        }
        let url = match self.config.ws_url() {
            Ok(url) => url,
            Err(e) => {
                error!(error = %e, "Cannot connect to MT5 bridge");
                self.status_tx.send_modify(|s| {
                    s.state = ConnectionState::Error;
                    s.last_error = Some(e.to_string());
                });
                return false;
            }
        };

        let mut interrupts = self.interrupts.clone();
        interrupts.borrow_and_update();
        self.status_tx.send_modify(|s| s.state = ConnectionState::Connecting);
        let max_attempts = self.options.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            info!(url = %url, attempt, max_attempts, "Connecting to MT5 bridge");
            let outcome = tokio::select! {
                result = self.open(&url) => Some(result),
                _ = interrupts.changed() => None,
            };
            let Some(outcome) = outcome else {
                return self.abandon_connect(&url);
            };
            match outcome {
                Ok(stream) => {
                    self.install(stream);
                    info!(url = %url, attempt, "Connected to MT5 bridge");
                    return true;
                }
                Err(e) => {
                    warn!(url = %url, attempt, max_attempts, error = %e, "Bridge connection attempt failed");
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        let interrupted = tokio::select! {
                            _ = tokio::time::sleep(self.options.retry_delay) => false,
                            _ = interrupts.changed() => true,
                        };
                        if interrupted {
                            return self.abandon_connect(&url);
                        }
                    }
                }
            }
        }

        error!(url = %url, max_attempts, "Giving up on MT5 bridge connection");
        self.status_tx.send_modify(|s| {
            s.state = ConnectionState::Disconnected;
            s.last_error = Some(last_error);
        });
        false
    }

    /// A disconnect or config change arrived while retrying.
    fn abandon_connect(&mut self, url: &str) -> bool {
        info!(url = %url, "Bridge connection attempt interrupted");
        self.status_tx.send_modify(|s| {
            s.state = ConnectionState::Disconnected;
            s.last_error = Some("connection attempt interrupted".to_string());
        });
        false
    }

    /// One connection attempt. The timeout, a refused socket and a failed
    /// handshake all resolve here exactly once.
    async fn open(&self, url: &str) -> Result<WsStream, BridgeError> {
        match tokio::time::timeout(self.options.connect_timeout, connect_async(url)).await {
            Ok(Ok((stream, _response))) => Ok(stream),
            Ok(Err(e)) => Err(BridgeError::ConnectionFailed(e.to_string())),
            Err(_) => Err(BridgeError::ConnectionFailed(format!(
                "timed out after {:?}",
                self.options.connect_timeout
            ))),
        }
    }

    fn install(&mut self, stream: WsStream) {
        let (sink, mut source) = stream.split();
        self.generation += 1;
        let generation = self.generation;
        let events = self.events_tx.clone();

        let reader = tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(SocketEvent::Text { generation, text }).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => {
                            if events.send(SocketEvent::Text { generation, text }).is_err() {
                                return;
                            }
                        }
                        Err(_) => debug!("Ignoring non-UTF-8 binary frame from bridge"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| format!("closed by bridge: {}", f.reason))
                            .unwrap_or_else(|| "closed by bridge".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            let _ = events.send(SocketEvent::Closed { generation, reason });
        });

        self.sink = Some(sink);
        self.reader = Some(reader);
        self.status_tx.send_modify(|s| {
            s.state = ConnectionState::Connected;
            s.connected_since = Some(Utc::now());
            s.last_error = None;
        });
    }

    /// Write a command, reconnecting first if the socket is down.
    async fn dispatch(
        &mut self,
        envelope: CommandEnvelope,
    ) -> Result<oneshot::Receiver<Result<Value, BridgeError>>, BridgeError> {
        if self.sink.is_none() {
            info!(command = %envelope.command, "Bridge not connected, reconnecting before send");
            if !self.connect().await {
                return Err(BridgeError::NotConnected(self.config.endpoint()));
            }
        }
        let Some(sink) = self.sink.as_mut() else {
            return Err(BridgeError::NotConnected(self.config.endpoint()));
        };

        let write_timeout = self.options.request_timeout;
        let frame = Message::Text(envelope.to_text());
        let written = match tokio::time::timeout(write_timeout, sink.send(frame)).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", write_timeout)),
        };
        if let Err(e) = written {
            let reason = format!("write failed: {}", e);
            warn!(command = %envelope.command, error = %e, "Failed to send bridge command");
            self.drop_socket(&reason);
            self.status_tx.send_modify(|s| {
                s.state = ConnectionState::Disconnected;
                s.connected_since = None;
                s.last_error = Some(reason.clone());
            });
            return Err(BridgeError::ConnectionClosed(reason));
        }

        debug!(id = %envelope.id, command = %envelope.command, "Sent bridge command");
        let (reply, rx) = oneshot::channel();
        let issued_at = Instant::now();
        self.pending.insert(
            envelope.id,
            PendingRequest {
                command: envelope.command,
                issued_at,
                deadline: issued_at + self.options.request_timeout,
                reply,
            },
        );
        self.publish_pending();
        Ok(rx)
    }

    /// Deliver an inbound frame to the request with the same id.
    fn route(&mut self, text: &str) {
        let Some(envelope) = ResponseEnvelope::parse(text) else {
            debug!(len = text.len(), "Ignoring malformed bridge message");
            return;
        };
        let Some(pending) = envelope.id.as_deref().and_then(|id| self.pending.remove(id)) else {
            debug!(id = ?envelope.id, "Ignoring bridge message with no pending request");
            return;
        };

        debug!(
            id = ?envelope.id,
            command = %pending.command,
            elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
            "Bridge response received"
        );
        let _ = pending.reply.send(envelope.into_result());
        self.publish_pending();
    }

    /// Evict requests whose caller went away or whose deadline passed.
    fn expire_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.reply.is_closed() || now >= p.deadline)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            let Some(pending) = self.pending.remove(&id) else {
                continue;
            };
            if pending.reply.is_closed() {
                debug!(id = %id, command = %pending.command, "Dropped bridge request abandoned by caller");
            } else {
                warn!(id = %id, command = %pending.command, "Bridge command expired");
                let _ = pending.reply.send(Err(BridgeError::Timeout {
                    command: pending.command,
                    timeout: self.options.request_timeout,
                }));
            }
        }
        self.publish_pending();
    }

    async fn update_config(&mut self, config: BridgeConfig) -> Result<(), BridgeError> {
        if let Some(store) = &self.store {
            store.save(&config).await?;
        }
        self.close_socket("bridge configuration changed").await;
        info!(endpoint = %config.endpoint(), enabled = config.enabled, "Bridge config updated");

        self.status_tx.send_modify(|s| {
            s.endpoint = config.endpoint();
            s.enabled = config.enabled;
            s.state = ConnectionState::Disconnected;
            s.last_error = None;
        });
        self.config_tx.send_replace(config.clone());
        self.config = config;
        Ok(())
    }

    /// Close the socket gracefully, then forget it.
    async fn close_socket(&mut self, reason: &str) {
        if let Some(mut sink) = self.sink.take() {
            match tokio::time::timeout(self.options.connect_timeout, sink.close()).await {
                Ok(Err(e)) => debug!(error = %e, "Error closing bridge socket"),
                Err(_) => debug!("Timed out closing bridge socket"),
                Ok(Ok(())) => {}
            }
        }
        self.drop_socket(reason);
        self.status_tx.send_modify(|s| {
            if s.state != ConnectionState::Error {
                s.state = ConnectionState::Disconnected;
            }
            s.connected_since = None;
        });
    }

    /// Forget the socket and fail everything still waiting on it.
    fn drop_socket(&mut self, reason: &str) {
        self.sink = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.generation += 1;

        if !self.pending.is_empty() {
            warn!(count = self.pending.len(), reason, "Failing pending bridge requests");
            for (_, pending) in self.pending.drain() {
                let _ = pending
                    .reply
                    .send(Err(BridgeError::ConnectionClosed(reason.to_string())));
            }
        }
        self.publish_pending();
    }

    fn publish_pending(&self) {
        let count = self.pending.len();
        self.status_tx.send_if_modified(|s| {
            let changed = s.pending_requests != count;
            s.pending_requests = count;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    enum MockReply {
        Text(String),
        Delayed(Duration, String),
        Close,
    }

    fn ok(request: &Value, result: Value) -> MockReply {
        MockReply::Text(json!({"id": request["id"], "success": true, "result": result}).to_string())
    }

    /// In-process bridge: every text frame is parsed and passed to `handler`.
    async fn spawn_bridge<F>(handler: F) -> (u16, Arc<AtomicUsize>)
    where
        F: Fn(&Value) -> Vec<MockReply> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(handler);

        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let handler = handler.clone();
                tokio::spawn(async move {
                    let Ok(ws) = accept_async(stream).await else {
                        return;
                    };
                    let (mut sink, mut source) = ws.split();
                    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Option<String>>();
                    tokio::spawn(async move {
                        while let Some(frame) = out_rx.recv().await {
                            match frame {
                                Some(text) => {
                                    if sink.send(Message::Text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                None => {
                                    let _ = sink.close().await;
                                    break;
                                }
                            }
                        }
                    });
                    while let Some(Ok(Message::Text(text))) = source.next().await {
                        let Ok(request) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        for reply in handler(&request) {
                            let out = out_tx.clone();
                            match reply {
                                MockReply::Text(t) => {
                                    let _ = out.send(Some(t));
                                }
                                MockReply::Delayed(delay, t) => {
                                    tokio::spawn(async move {
                                        tokio::time::sleep(delay).await;
                                        let _ = out.send(Some(t));
                                    });
                                }
                                MockReply::Close => {
                                    let _ = out.send(None);
                                }
                            }
                        }
                    }
                });
            }
        });

        (port, accepted)
    }

    /// Accepts TCP and hangs up before the WebSocket handshake.
    async fn spawn_refusing_bridge() -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });
        (port, accepted)
    }

    /// Accepts TCP and holds the stream without ever answering the handshake.
    async fn spawn_silent_bridge() -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });
        (port, accepted)
    }

    fn config(port: u16) -> BridgeConfig {
        BridgeConfig {
            host: "127.0.0.1".to_string(),
            port,
            enabled: true,
        }
    }

    fn fast_options() -> BridgeOptions {
        BridgeOptions {
            max_retries: 1,
            retry_delay: Duration::from_millis(20),
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
        }
    }

    async fn wait_for<F>(manager: &BridgeManager, pred: F)
    where
        F: Fn(&BridgeStatus) -> bool,
    {
        let mut rx = manager.watch_status();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| pred(s)))
            .await
            .expect("status condition not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_and_send() {
        let (port, accepted) = spawn_bridge(|req| {
            vec![ok(req, json!({"success": true, "echo": req["command"], "args": req["args"]}))]
        })
        .await;
        let manager = BridgeManager::new(config(port), fast_options());

        assert!(manager.connect().await);
        assert!(manager.connect().await);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert!(status.connected_since.is_some());

        let result = manager.send("get_tick", vec![json!("EURUSD")]).await.unwrap();
        assert_eq!(result["echo"], "get_tick");
        assert_eq!(result["args"], json!(["EURUSD"]));
        assert_eq!(manager.status().pending_requests, 0);
    }

    #[tokio::test]
    async fn test_remote_failure_is_rejected() {
        let (port, _) = spawn_bridge(|req| {
            vec![MockReply::Text(
                json!({
                    "id": req["id"],
                    "success": false,
                    "result": {"success": false, "error": "Login failed, error code = -6"}
                })
                .to_string(),
            )]
        })
        .await;
        let manager = BridgeManager::new(config(port), fast_options());

        let err = manager
            .send("connect_with_credentials", vec![json!("1"), json!("pw"), json!("Demo")])
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Remote(ref m) if m.contains("Login failed")));
        assert_eq!(manager.status().pending_requests, 0);
    }

    #[tokio::test]
    async fn test_request_times_out_and_is_forgotten() {
        let (port, _) = spawn_bridge(|_| Vec::new()).await;
        let options = BridgeOptions {
            request_timeout: Duration::from_millis(150),
            ..fast_options()
        };
        let manager = BridgeManager::new(config(port), options);

        let started = Instant::now();
        let err = manager.send("get_positions", Vec::new()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { ref command, .. } if command == "get_positions"));
        assert!(started.elapsed() >= Duration::from_millis(150));

        wait_for(&manager, |s| s.pending_requests == 0).await;
        assert!(manager.status().is_connected());
    }

    #[tokio::test]
    async fn test_unmatched_and_malformed_frames_are_ignored() {
        let (port, _) = spawn_bridge(|req| {
            vec![
                MockReply::Text("not json at all".to_string()),
                MockReply::Text(json!({"id": null, "success": false, "error": "Invalid JSON format"}).to_string()),
                MockReply::Text(json!({"id": "0-0", "success": true, "result": "stray"}).to_string()),
                ok(req, json!("mine")),
            ]
        })
        .await;
        let manager = BridgeManager::new(config(port), fast_options());

        let result = manager.send("get_symbols", Vec::new()).await.unwrap();
        assert_eq!(result, json!("mine"));
        assert!(manager.status().is_connected());
        assert_eq!(manager.status().pending_requests, 0);
    }

    #[tokio::test]
    async fn test_concurrent_commands_never_cross() {
        // Replies come back in reverse order of the delay encoded in args[0].
        let (port, _) = spawn_bridge(|req| {
            let n = req["args"][0].as_u64().unwrap_or(0);
            let body = json!({"id": req["id"], "success": true, "result": n}).to_string();
            vec![MockReply::Delayed(Duration::from_millis(10 * (10 - n)), body)]
        })
        .await;
        let manager = BridgeManager::new(config(port), fast_options());
        assert!(manager.connect().await);

        let calls = (0..10u64).map(|n| {
            let manager = manager.clone();
            async move { (n, manager.send("echo", vec![json!(n)]).await) }
        });
        for (n, result) in futures_util::future::join_all(calls).await {
            assert_eq!(result.unwrap(), json!(n));
        }
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_retries() {
        let (port, accepted) = spawn_refusing_bridge().await;
        let options = BridgeOptions {
            max_retries: 3,
            retry_delay: Duration::from_millis(30),
            ..fast_options()
        };
        let deadline = options.connect_deadline();
        let manager = BridgeManager::new(config(port), options);

        let started = Instant::now();
        assert!(!manager.connect().await);
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(90));
        assert!(elapsed <= deadline);
        assert_eq!(accepted.load(Ordering::SeqCst), 4);

        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_connect_attempts_time_out_on_stalled_handshake() {
        let (port, accepted) = spawn_silent_bridge().await;
        let options = BridgeOptions {
            max_retries: 2,
            retry_delay: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(100),
            ..fast_options()
        };
        let deadline = options.connect_deadline();
        let manager = BridgeManager::new(config(port), options);

        let started = Instant::now();
        assert!(!manager.connect().await);
        let elapsed = started.elapsed();

        // Three 100ms attempts with two 50ms pauses between them.
        assert!(elapsed >= Duration::from_millis(400));
        assert!(elapsed <= deadline + Duration::from_millis(200));
        assert_eq!(accepted.load(Ordering::SeqCst), 3);

        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_abandoned_request_is_evicted() {
        let (port, _) = spawn_bridge(|_| Vec::new()).await;
        let manager = BridgeManager::new(config(port), fast_options());
        assert!(manager.connect().await);

        let caller = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.send("get_positions", Vec::new()).await })
        };
        wait_for(&manager, |s| s.pending_requests == 1).await;

        caller.abort();
        let _ = caller.await;
        // Evicted by the actor well before the 2s request timeout.
        wait_for(&manager, |s| s.pending_requests == 0).await;
        assert!(manager.status().is_connected());
    }

    #[tokio::test]
    async fn test_config_update_interrupts_connect_retries() {
        let (port, _) = spawn_silent_bridge().await;
        let options = BridgeOptions {
            max_retries: 3,
            retry_delay: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(2),
        };
        let manager = BridgeManager::new(config(port), options);

        let connecting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect().await })
        };
        wait_for(&manager, |s| s.state == ConnectionState::Connecting).await;

        let started = Instant::now();
        let mut updated = config(port);
        updated.enabled = false;
        manager.update_config(updated).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        assert!(!connecting.await.unwrap());
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(!status.enabled);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_reconnects_once() {
        let (port, accepted) = spawn_refusing_bridge().await;
        let manager = BridgeManager::new(config(port), fast_options());

        let err = manager.send("get_positions", Vec::new()).await.unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected(_)));
        // One connect() with max_retries = 1 is two attempts.
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lazy_reconnect_after_drop() {
        let (port, accepted) = spawn_bridge(|req| match req["command"].as_str() {
            Some("drop") => vec![MockReply::Close],
            _ => vec![ok(req, json!("pong"))],
        })
        .await;
        let manager = BridgeManager::new(config(port), fast_options());

        let err = manager.send("drop", Vec::new()).await.unwrap_err();
        assert!(matches!(err, BridgeError::ConnectionClosed(_)));
        wait_for(&manager, |s| s.state == ConnectionState::Disconnected).await;

        let result = manager.send("ping", Vec::new()).await.unwrap();
        assert_eq!(result, json!("pong"));
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disabled_bridge_does_not_dial() {
        let (port, accepted) = spawn_refusing_bridge().await;
        let mut cfg = config(port);
        cfg.enabled = false;
        let manager = BridgeManager::new(cfg, fast_options());

        assert!(!manager.connect().await);
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
        assert_eq!(manager.status().last_error.as_deref(), Some("Bridge is disabled"));
    }

    #[tokio::test]
    async fn test_invalid_endpoint_enters_error_state() {
        let manager = BridgeManager::new(
            BridgeConfig {
                host: String::new(),
                port: 8765,
                enabled: true,
            },
            fast_options(),
        );

        assert!(!manager.connect().await);
        assert_eq!(manager.status().state, ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_disconnect_then_update_config_persists() {
        let (port, _) = spawn_bridge(|req| vec![ok(req, json!(null))]).await;
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("mt5_bridge.json"));
        store.save(&config(port)).await.unwrap();

        let manager = BridgeManager::from_store(store.clone(), fast_options()).unwrap();
        assert!(manager.connect().await);

        manager.disconnect().await;
        assert_eq!(manager.status().state, ConnectionState::Disconnected);

        assert!(manager.connect().await);
        let updated = BridgeConfig {
            host: "192.168.1.20".to_string(),
            port: 9999,
            enabled: false,
        };
        manager.update_config(updated.clone()).await.unwrap();

        assert_eq!(manager.config(), updated);
        assert_eq!(store.load().unwrap(), updated);
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.endpoint, "192.168.1.20:9999");
        assert!(!status.enabled);
    }
}
