//! Realtime Hub
//!
//! Live rooms keyed by session id. A room has one host (its creator) and a
//! set of member connections; only the host may change the game state, and
//! every change is fanned out to all members, host included.
//!
//! ```text
//!   connection ──► hub.update_state ──► room lock ──► merge ──► fan-out
//!                                                          │
//!                           members' mpsc senders ◄────────┘
//! ```
//!
//! The rooms map lock is never held while a room lock is awaited: callers
//! clone the room's `Arc` out of the map first. The connections map is a
//! leaf lock, only read briefly while a room lock is held. Nothing awaits
//! a member's channel under any lock; delivery uses `try_send`, and a
//! member whose queue is full is dropped from the room so one stalled
//! reader cannot hold up its room or any other.
//!
//! A room that lost its host is marked `closed` before it leaves the map,
//! so a join racing the teardown fails with `NotFound` instead of landing
//! in a dead room.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::network::protocol::{RoomJoined, RoomState, ServerMessage, SessionRef};
use crate::session::{GameState, GameStatePatch};

/// Identifies one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hub errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// No live room with that id.
    #[error("session {0} not found")]
    NotFound(String),

    /// A live room with that id already exists.
    #[error("session {0} already exists")]
    DuplicateSession(String),

    /// Only the host may update the game state.
    #[error("only the host may update session {0}")]
    NotHost(String),

    /// Connection is not in that room.
    #[error("not a member of session {0}")]
    NotMember(String),
}

/// What happened when a connection left a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// A regular member left; the room lives on.
    Left,
    /// The host left; the room was closed and its members notified.
    Closed {
        /// Members that received the end notice.
        notified: usize,
    },
}

/// Result of handing one message to a connection's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    /// Queue full; the reader has stopped draining it.
    Lagging,
    /// Unknown or closed connection.
    Gone,
}

/// One live room.
#[derive(Debug)]
struct LiveRoom {
    session_id: String,
    host: ConnectionId,
    players: BTreeSet<ConnectionId>,
    game_state: Option<GameState>,
    closed: bool,
}

/// Connection registry plus live rooms.
#[derive(Default)]
pub struct RealtimeHub {
    connections: RwLock<BTreeMap<ConnectionId, mpsc::Sender<ServerMessage>>>,
    rooms: RwLock<BTreeMap<String, Arc<Mutex<LiveRoom>>>>,
}

impl RealtimeHub {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    // ===== CONNECTIONS =====

    /// Register a connection's outbound channel.
    pub async fn connect(&self, conn: ConnectionId, sender: mpsc::Sender<ServerMessage>) {
        self.connections.write().await.insert(conn, sender);
        debug!("Connection {} registered", conn);
    }

    /// Leave every room the connection is in, then forget it.
    ///
    /// Returns the ids of the rooms it left.
    pub async fn disconnect(&self, conn: ConnectionId) -> Vec<String> {
        let rooms: Vec<(String, Arc<Mutex<LiveRoom>>)> = self
            .rooms
            .read()
            .await
            .iter()
            .map(|(id, room)| (id.clone(), Arc::clone(room)))
            .collect();

        let mut left = Vec::new();
        for (id, room) in rooms {
            if self.leave_room(&room, conn).await.is_ok() {
                left.push(id);
            }
        }

        self.connections.write().await.remove(&conn);
        debug!("Connection {} unregistered ({} rooms left)", conn, left.len());
        left
    }

    async fn send_to(&self, conn: ConnectionId, msg: ServerMessage) -> Delivery {
        let connections = self.connections.read().await;
        match connections.get(&conn) {
            Some(tx) => match tx.try_send(msg) {
                Ok(()) => Delivery::Sent,
                Err(TrySendError::Full(_)) => Delivery::Lagging,
                Err(TrySendError::Closed(_)) => Delivery::Gone,
            },
            None => Delivery::Gone,
        }
    }

    /// Fan out to every member. Members that cannot take the message are
    /// dropped from the room; the host only loses the message.
    async fn broadcast_room(&self, room: &mut LiveRoom, msg: &ServerMessage) -> usize {
        let mut delivered = 0;
        let mut dropped = Vec::new();
        for &player in &room.players {
            match self.send_to(player, msg.clone()).await {
                Delivery::Sent => delivered += 1,
                outcome => {
                    warn!("{:?} member {} in session {}, message dropped", outcome, player, room.session_id);
                    if player != room.host {
                        dropped.push(player);
                    }
                }
            }
        }
        for player in dropped {
            room.players.remove(&player);
            info!("{} removed from session {}", player, room.session_id);
        }
        delivered
    }

    /// Send to every registered connection. Returns how many accepted it.
    ///
    /// Connections with a full queue miss this message.
    pub async fn broadcast_all(&self, msg: &ServerMessage) -> usize {
        let connections = self.connections.read().await;
        let mut delivered = 0;
        for (conn, tx) in connections.iter() {
            match tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => debug!("Connection {} lagging, broadcast skipped", conn),
                Err(TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    async fn room(&self, session_id: &str) -> Result<Arc<Mutex<LiveRoom>>, HubError> {
        self.rooms
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| HubError::NotFound(session_id.to_string()))
    }

    // ===== ROOMS =====

    /// Open a room hosted by `conn` and acknowledge with `session_created`.
    ///
    /// An id held by a closed room that has not left the map yet is free.
    pub async fn create_room(&self, session_id: &str, conn: ConnectionId) -> Result<(), HubError> {
        loop {
            let seen = self.rooms.read().await.get(session_id).cloned();
            if let Some(existing) = &seen {
                if !existing.lock().await.closed {
                    return Err(HubError::DuplicateSession(session_id.to_string()));
                }
            }

            let mut rooms = self.rooms.write().await;
            let unchanged = match (rooms.get(session_id), &seen) {
                (None, None) => true,
                (Some(current), Some(seen)) => Arc::ptr_eq(current, seen),
                _ => false,
            };
            if !unchanged {
                // Map changed between the check and the write lock.
                continue;
            }

            let room = LiveRoom {
                session_id: session_id.to_string(),
                host: conn,
                players: BTreeSet::from([conn]),
                game_state: None,
                closed: false,
            };
            rooms.insert(session_id.to_string(), Arc::new(Mutex::new(room)));
            break;
        }

        info!("Session {} opened by {}", session_id, conn);
        self.send_to(
            conn,
            ServerMessage::SessionCreated(RoomJoined {
                session_id: session_id.to_string(),
                is_host: true,
                game_state: None,
            }),
        )
        .await;
        Ok(())
    }

    /// Add `conn` to a room and send it the current state.
    ///
    /// Joining twice is harmless. The acknowledgment is sent while the room
    /// is locked, so it always precedes any later state broadcast.
    pub async fn join(&self, session_id: &str, conn: ConnectionId) -> Result<RoomJoined, HubError> {
        let room = self.room(session_id).await?;
        let mut room = room.lock().await;
        if room.closed {
            return Err(HubError::NotFound(session_id.to_string()));
        }

        room.players.insert(conn);
        let joined = RoomJoined {
            session_id: room.session_id.clone(),
            is_host: room.host == conn,
            game_state: room.game_state.clone(),
        };
        debug!("{} joined session {} ({} players)", conn, session_id, room.players.len());

        if self.send_to(conn, ServerMessage::SessionJoined(joined.clone())).await != Delivery::Sent {
            warn!("Join acknowledgment to {} for session {} dropped", conn, session_id);
        }
        Ok(joined)
    }

    /// Merge a host's patch into the room state and broadcast the result.
    pub async fn update_state(
        &self,
        session_id: &str,
        conn: ConnectionId,
        patch: &GameStatePatch,
    ) -> Result<GameState, HubError> {
        let room = self.room(session_id).await?;
        let mut room = room.lock().await;
        if room.closed {
            return Err(HubError::NotFound(session_id.to_string()));
        }
        if room.host != conn {
            return Err(HubError::NotHost(session_id.to_string()));
        }

        let state = room.game_state.get_or_insert_with(GameState::default);
        state.apply(patch);
        let state = state.clone();

        let msg = ServerMessage::SessionState(RoomState {
            session_id: room.session_id.clone(),
            game_state: state.clone(),
        });
        let delivered = self.broadcast_room(&mut room, &msg).await;
        debug!("Session {} state broadcast to {} players", session_id, delivered);
        Ok(state)
    }

    /// Remove `conn` from a room. A departing host closes the room.
    pub async fn leave(&self, session_id: &str, conn: ConnectionId) -> Result<LeaveOutcome, HubError> {
        let room = self.room(session_id).await?;
        self.leave_room(&room, conn).await
    }

    async fn leave_room(&self, room_ref: &Arc<Mutex<LiveRoom>>, conn: ConnectionId) -> Result<LeaveOutcome, HubError> {
        let mut room = room_ref.lock().await;
        if room.closed {
            return Err(HubError::NotFound(room.session_id.clone()));
        }
        if !room.players.remove(&conn) {
            return Err(HubError::NotMember(room.session_id.clone()));
        }

        if room.host != conn {
            debug!("{} left session {}", conn, room.session_id);
            return Ok(LeaveOutcome::Left);
        }

        room.closed = true;
        let msg = ServerMessage::SessionEnded(SessionRef {
            session_id: room.session_id.clone(),
        });
        let notified = self.broadcast_room(&mut room, &msg).await;
        let session_id = room.session_id.clone();
        drop(room);

        let mut rooms = self.rooms.write().await;
        if rooms.get(&session_id).is_some_and(|r| Arc::ptr_eq(r, room_ref)) {
            rooms.remove(&session_id);
        }

        info!("Session {} closed, host left ({} notified)", session_id, notified);
        Ok(LeaveOutcome::Closed { notified })
    }

    // ===== DIAGNOSTICS =====

    /// Registered connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Open rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Members of an open room.
    pub async fn room_members(&self, session_id: &str) -> Option<Vec<ConnectionId>> {
        let room = self.room(session_id).await.ok()?;
        let room = room.lock().await;
        (!room.closed).then(|| room.players.iter().copied().collect())
    }

    /// Current state of an open room (`Some(None)` before the first update).
    pub async fn room_state(&self, session_id: &str) -> Option<Option<GameState>> {
        let room = self.room(session_id).await.ok()?;
        let room = room.lock().await;
        (!room.closed).then(|| room.game_state.clone())
    }
}
