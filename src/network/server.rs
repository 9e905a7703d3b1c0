//! WebSocket Scale Server
//!
//! Async WebSocket server for the game clients. Each connection gets a
//! writer task fed by an mpsc channel; the hub and the weight broadcast
//! push into the same channel, so a client sees its messages in order.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::network::hub::{ConnectionId, HubError, RealtimeHub};
use crate::network::protocol::{ClientMessage, ErrorCode, ScaleResult, ServerMessage};
use crate::sensor::{CalibrationStep, SensorDriver, SensorError};
use crate::session::{RegistryError, SessionRegistry};

/// Outbound queue depth per connection.
const OUTBOUND_CAPACITY: usize = 64;

/// How long a closing connection may take to flush its queue.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ScaleServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// GATEWAY
// =============================================================================

/// Routes client messages to the hub, the session registry and the sensor.
#[derive(Clone)]
pub struct Gateway {
    hub: Arc<RealtimeHub>,
    registry: Arc<SessionRegistry>,
    sensor: Arc<SensorDriver>,
}

impl Gateway {
    /// Wire up the three subsystems.
    pub fn new(hub: Arc<RealtimeHub>, registry: Arc<SessionRegistry>, sensor: Arc<SensorDriver>) -> Self {
        Self { hub, registry, sensor }
    }

    /// Realtime hub.
    pub fn hub(&self) -> &Arc<RealtimeHub> {
        &self.hub
    }

    /// Durable session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Weight sensor.
    pub fn sensor(&self) -> &Arc<SensorDriver> {
        &self.sensor
    }

    /// Handle one client message.
    ///
    /// Returns the direct reply, if any. Room acknowledgments, state
    /// broadcasts and weight updates travel through the hub instead.
    pub async fn dispatch(&self, conn: ConnectionId, msg: ClientMessage) -> Option<ServerMessage> {
        match msg {
            ClientMessage::CreateSession(r) => self.hub.create_room(&r.session_id, conn).await.err().map(hub_error),
            ClientMessage::JoinSession(r) => self.hub.join(&r.session_id, conn).await.err().map(hub_error),
            ClientMessage::LeaveSession(r) => Some(match self.hub.leave(&r.session_id, conn).await {
                Ok(_) => ServerMessage::SessionLeft(r),
                Err(e) => hub_error(e),
            }),
            ClientMessage::UpdateState(u) => self
                .hub
                .update_state(&u.session_id, conn, &u.update)
                .await
                .err()
                .map(hub_error),

            ClientMessage::CreateRecord(req) => Some(record_reply(self.registry.create(req).await)),
            ClientMessage::GetRecord(r) => Some(record_reply(self.registry.get(&r.id).await)),
            ClientMessage::UpdateRecord(req) => {
                let (id, update) = req.into_parts();
                Some(record_reply(self.registry.update(&id, update).await))
            }
            ClientMessage::DeleteRecord(r) => {
                let deleted = self.registry.delete(&r.id).await;
                Some(ServerMessage::RecordDeleted { id: r.id, deleted })
            }
            ClientMessage::ListRecords => Some(ServerMessage::Records {
                sessions: self.registry.list().await,
            }),

            ClientMessage::ReadWeight => self.broadcast_weight().await,
            ClientMessage::Tare => Some(match self.sensor.tare().await {
                Ok(()) => ServerMessage::Scale(ScaleResult {
                    message: "Tare complete".to_string(),
                    step: None,
                    profile: Some(self.sensor.calibration().await),
                }),
                Err(e) => sensor_error(e),
            }),
            ClientMessage::Calibrate(req) => Some(
                match self.sensor.calibration_step(req.step, req.known_weight).await {
                    Ok(step) => {
                        let profile = match step {
                            CalibrationStep::Calibrated(p) => Some(p),
                            _ => None,
                        };
                        ServerMessage::Scale(ScaleResult {
                            message: step.message().to_string(),
                            step: Some(req.step),
                            profile,
                        })
                    }
                    Err(e) => sensor_error(e),
                },
            ),
            ClientMessage::ResetCalibration => Some(match self.sensor.reset_calibration().await {
                Ok(profile) => ServerMessage::Scale(ScaleResult {
                    message: "Calibration reset to default".to_string(),
                    step: None,
                    profile: Some(profile),
                }),
                Err(e) => sensor_error(e),
            }),

            ClientMessage::Ping { timestamp } => Some(ServerMessage::Pong {
                timestamp,
                server_time: now_millis(),
            }),
        }
    }

    /// Read the scale and push the result to every connection.
    async fn broadcast_weight(&self) -> Option<ServerMessage> {
        match self.sensor.read_weight().await {
            Ok(reading) => {
                let delivered = self.hub.broadcast_all(&ServerMessage::WeightUpdate(reading)).await;
                debug!("Weight {} sent to {} connections", reading.value, delivered);
                None
            }
            Err(e) => Some(sensor_error(e)),
        }
    }
}

fn hub_error(e: HubError) -> ServerMessage {
    let code = match e {
        HubError::NotFound(_) => ErrorCode::NotFound,
        HubError::DuplicateSession(_) => ErrorCode::DuplicateSession,
        HubError::NotHost(_) => ErrorCode::NotHost,
        HubError::NotMember(_) => ErrorCode::NotMember,
    };
    ServerMessage::error(code, e.to_string())
}

fn record_reply(result: Result<crate::session::Session, RegistryError>) -> ServerMessage {
    match result {
        Ok(session) => ServerMessage::Record(session),
        Err(e) => {
            let code = match e {
                RegistryError::NotFound(_) => ErrorCode::NotFound,
                RegistryError::DuplicateSession(_) => ErrorCode::DuplicateSession,
                RegistryError::UnknownPreset(_) => ErrorCode::InvalidInput,
            };
            ServerMessage::error(code, e.to_string())
        }
    }
}

fn sensor_error(e: SensorError) -> ServerMessage {
    let code = match &e {
        SensorError::Fault(_) | SensorError::NoReading { .. } => ErrorCode::SensorFault,
        SensorError::Calibration(_) => ErrorCode::CalibrationFailed,
        SensorError::Storage { .. } => ErrorCode::StorageFailed,
        SensorError::InvalidStep(_) => ErrorCode::InvalidInput,
    };
    if e.is_fault() {
        warn!("Sensor request failed: {}", e);
    }
    ServerMessage::error(code, e.to_string())
}

// =============================================================================
// SERVER
// =============================================================================

/// The scale server.
pub struct ScaleServer {
    config: ServerConfig,
    gateway: Gateway,
    shutdown_tx: broadcast::Sender<()>,
}

impl ScaleServer {
    /// Create a server around an already initialized sensor.
    pub fn new(config: ServerConfig, sensor: Arc<SensorDriver>) -> Self {
        Self::with_parts(config, Arc::new(SessionRegistry::new()), sensor)
    }

    /// Create a server with a caller-supplied registry.
    pub fn with_parts(config: ServerConfig, registry: Arc<SessionRegistry>, sensor: Arc<SensorDriver>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            gateway: Gateway::new(Arc::new(RealtimeHub::new()), registry, sensor),
            shutdown_tx,
        }
    }

    /// Message router.
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Bind the configured address and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), ScaleServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Scale server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve on an existing listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ScaleServerError> {
        let registry = self.gateway.registry.clone();
        let prune_every = self.config.prune_interval;
        let prune_handle = tokio::spawn(async move {
            Self::run_prune_loop(registry, prune_every).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let count = self.gateway.hub.connection_count().await;
                            if count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                Self::reject_overloaded(stream, addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        prune_handle.abort();
        Ok(())
    }

    /// Complete the handshake only to say why the connection is refused.
    fn reject_overloaded(stream: TcpStream, addr: std::net::SocketAddr) {
        tokio::spawn(async move {
            let mut ws = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    debug!("Handshake with rejected {} failed: {}", addr, e);
                    return;
                }
            };

            let refusal = ServerMessage::error(ErrorCode::ServerOverloaded, "connection limit reached");
            if let Ok(json) = refusal.to_json() {
                if let Err(e) = ws.send(Message::Text(json)).await {
                    debug!("Could not tell {} it was rejected: {}", addr, e);
                }
            }
            let _ = tokio::time::timeout(FLUSH_TIMEOUT, ws.close(None)).await;
        });
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: std::net::SocketAddr) {
        let gateway = self.gateway.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let conn = ConnectionId::new();
            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);
            gateway.hub.connect(conn, msg_tx.clone()).await;
            debug!("{} is connection {}", addr, conn);

            let mut sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let reply = match ClientMessage::from_json(&text) {
                                    Ok(client_msg) => gateway.dispatch(conn, client_msg).await,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        Some(ServerMessage::error(
                                            ErrorCode::InvalidInput,
                                            format!("Invalid message format: {e}"),
                                        ))
                                    }
                                };
                                if let Some(reply) = reply {
                                    if msg_tx.send(reply).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(_))) => {
                                let _ = msg_tx.send(ServerMessage::Pong {
                                    timestamp: 0,
                                    server_time: now_millis(),
                                }).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Leaving rooms may notify others; the hub drops our sender last.
            let rooms = gateway.hub.disconnect(conn).await;
            drop(msg_tx);
            if tokio::time::timeout(FLUSH_TIMEOUT, &mut sender_task).await.is_err() {
                sender_task.abort();
            }

            info!("Client {} cleaned up ({} rooms left)", addr, rooms.len());
        });
    }

    /// Prune expired sessions on a fixed tick.
    async fn run_prune_loop(registry: Arc<SessionRegistry>, every: Duration) {
        let mut ticker = interval(every);
        loop {
            ticker.tick().await;
            let pruned = registry.prune_expired().await;
            if pruned > 0 {
                debug!("Prune tick removed {} sessions", pruned);
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Handle for signalling shutdown from another task.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.gateway.hub.connection_count().await
    }

    /// Get open room count.
    pub async fn room_count(&self) -> usize {
        self.gateway.hub.room_count().await
    }
}
