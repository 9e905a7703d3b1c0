//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket. Every frame
//! is a JSON object tagged by `type`:
//!
//! ```json
//! {"type": "join_session", "sessionId": "table-1"}
//! {"type": "session_state", "sessionId": "table-1", "gameState": {...}}
//! ```

use serde::{Deserialize, Serialize};

use crate::sensor::{CalibrationProfile, WeightReading};
use crate::session::{GameSettings, GameState, GameStatePatch, NewSession, Session, SessionUpdate};

/// Known weight used by calibration step 2 when the client omits one.
pub const DEFAULT_KNOWN_WEIGHT: f64 = 100.0;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a live room and become its host.
    CreateSession(SessionRef),

    /// Join an existing live room.
    JoinSession(SessionRef),

    /// Leave a live room.
    LeaveSession(SessionRef),

    /// Host pushes a partial game-state update.
    UpdateState(StateUpdate),

    /// Create a durable session record.
    CreateRecord(NewSession),

    /// Fetch a session record.
    GetRecord(RecordRef),

    /// Replace settings and/or state of a record.
    UpdateRecord(RecordUpdate),

    /// Delete a session record.
    DeleteRecord(RecordRef),

    /// List live session records.
    ListRecords,

    /// Take a weight reading (broadcast to everyone).
    ReadWeight,

    /// Zero the scale.
    Tare,

    /// Run one calibration workflow step.
    Calibrate(CalibrateRequest),

    /// Restore the hardware default calibration.
    ResetCalibration,

    /// Ping for latency measurement.
    Ping { timestamp: u64 },
}

/// Reference to a live room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    /// Room id.
    pub session_id: String,
}

/// Reference to a durable record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRef {
    /// Record id.
    pub id: String,
}

/// Host game-state update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    /// Room id.
    pub session_id: String,
    /// Fields to overwrite.
    pub update: GameStatePatch,
}

/// Record replacement request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordUpdate {
    /// Record id.
    pub id: String,
    /// Replacement settings.
    #[serde(default)]
    pub settings: Option<GameSettings>,
    /// Replacement game state.
    #[serde(default)]
    pub game_state: Option<GameState>,
}

impl RecordUpdate {
    /// Split into id and changes.
    pub fn into_parts(self) -> (String, SessionUpdate) {
        (
            self.id,
            SessionUpdate {
                settings: self.settings,
                game_state: self.game_state,
            },
        )
    }
}

/// Calibration workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrateRequest {
    /// 1 = tare empty, 2 = measure known weight, 3 = tare again.
    pub step: u8,
    /// Weight on the platform during step 2.
    #[serde(default = "default_known_weight")]
    pub known_weight: f64,
}

fn default_known_weight() -> f64 {
    DEFAULT_KNOWN_WEIGHT
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Room opened; the receiver is its host.
    SessionCreated(RoomJoined),

    /// Receiver joined a room.
    SessionJoined(RoomJoined),

    /// Receiver left a room.
    SessionLeft(SessionRef),

    /// New game state for a room.
    SessionState(RoomState),

    /// Room closed because the host left.
    SessionEnded(SessionRef),

    /// A session record.
    Record(Session),

    /// Record deletion result.
    RecordDeleted {
        /// Record id.
        id: String,
        /// Whether the record existed.
        deleted: bool,
    },

    /// Live session records.
    Records {
        /// Oldest first.
        sessions: Vec<Session>,
    },

    /// Fresh weight reading.
    WeightUpdate(WeightReading),

    /// Scale operation finished.
    Scale(ScaleResult),

    /// Pong response.
    Pong { timestamp: u64, server_time: u64 },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown { reason: String },
}

/// Room membership acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoined {
    /// Room id.
    pub session_id: String,
    /// Whether the receiver hosts the room.
    pub is_host: bool,
    /// Current game state, when the room has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_state: Option<GameState>,
}

/// Room game state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    /// Room id.
    pub session_id: String,
    /// Merged state.
    pub game_state: GameState,
}

/// Result of a tare, calibration step or reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleResult {
    /// Operator-facing message.
    pub message: String,
    /// Calibration step that ran, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u8>,
    /// Profile now in effect, when it changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<CalibrationProfile>,
}

/// Server error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed or invalid request.
    InvalidInput,
    /// Session or record not found.
    NotFound,
    /// Id already in use.
    DuplicateSession,
    /// Only the host may do that.
    NotHost,
    /// Not a member of the room.
    NotMember,
    /// Scale hardware fault.
    SensorFault,
    /// Calibration could not be computed.
    CalibrationFailed,
    /// Calibration could not be saved.
    StorageFailed,
    /// Connection limit reached; the socket is closed after this frame.
    ServerOverloaded,
}

impl ServerMessage {
    /// Shorthand for an error frame.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError {
            code,
            message: message.into(),
        })
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
