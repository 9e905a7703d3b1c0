//! Durable game sessions.

pub mod model;
pub mod registry;

pub use model::{
    GamePhase, GameSettings, GameState, GameStatePatch, NewSession, ScoringRules, Session,
    SessionUpdate,
};
pub use registry::{Clock, ManualClock, RegistryError, SessionRegistry, SystemClock, SESSION_TTL_SECS};
