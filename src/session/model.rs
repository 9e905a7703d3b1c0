//! Session Data Model
//!
//! Wire shapes follow the game clients: the session envelope uses
//! snake_case keys, settings and game state use camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// SETTINGS
// =============================================================================

/// Score table consumed by the (client-side) scoring rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringRules {
    /// Points for an exact hit.
    pub perfect_score: i32,
    /// Points lost per unit outside the margin.
    pub margin_penalty: i32,
    /// Points lost for a failed attempt.
    pub failure_penalty: i32,
    /// Floor for a round score.
    pub min_score: i32,
}

impl Default for ScoringRules {
    fn default() -> Self {
        Self {
            perfect_score: 1000,
            margin_penalty: 100,
            failure_penalty: 200,
            min_score: -500,
        }
    }
}

/// Per-session game settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GameSettings {
    /// Allowed distance from the target weight.
    pub margin: i32,
    /// Attempts per turn.
    pub max_retries: i32,
    /// Turn order.
    pub players: Vec<String>,
    /// Score table.
    pub scoring: ScoringRules,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self::standard()
    }
}

impl GameSettings {
    /// Larger margin and more retries.
    pub fn beginner() -> Self {
        Self {
            margin: 8,
            max_retries: 3,
            players: Vec::new(),
            scoring: ScoringRules {
                perfect_score: 1000,
                margin_penalty: 50,
                failure_penalty: 100,
                min_score: -200,
            },
        }
    }

    /// Balanced settings for casual play.
    pub fn standard() -> Self {
        Self {
            margin: 5,
            max_retries: 2,
            players: Vec::new(),
            scoring: ScoringRules::default(),
        }
    }

    /// Smaller margin and fewer retries.
    pub fn expert() -> Self {
        Self {
            margin: 3,
            max_retries: 1,
            players: Vec::new(),
            scoring: ScoringRules {
                perfect_score: 2000,
                margin_penalty: 200,
                failure_penalty: 400,
                min_score: -1000,
            },
        }
    }

    /// Look up a named preset (`beginner`, `standard`, `expert`).
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "beginner" => Some(Self::beginner()),
            "standard" => Some(Self::standard()),
            "expert" => Some(Self::expert()),
            _ => None,
        }
    }

    /// Replace the turn order.
    pub fn with_players<I, S>(mut self, players: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.players = players.into_iter().map(Into::into).collect();
        self
    }
}

// =============================================================================
// GAME STATE
// =============================================================================

/// Round phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    /// Players being seated.
    #[default]
    Setup,
    /// Dice being rolled.
    Rolling,
    /// Player pouring / drinking towards the target.
    Drinking,
    /// Glass on the scale.
    Measuring,
    /// Reading being taken.
    Weighing,
    /// Round being scored.
    Scoring,
}

/// Shared game state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GameState {
    /// Index into the settings' player list.
    pub current_player_index: u32,
    /// First die.
    pub dice1: u32,
    /// Second die.
    pub dice2: u32,
    /// Weight the current player is aiming for.
    pub target_weight: f64,
    /// Round phase.
    pub phase: GamePhase,
    /// Attempts used this turn.
    pub attempts: u32,
}

/// Partial game-state update sent by a host.
///
/// Only the fields of [`GameState`] are accepted; anything else fails to
/// deserialize.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GameStatePatch {
    /// New current player.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_player_index: Option<u32>,
    /// New first die.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dice1: Option<u32>,
    /// New second die.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dice2: Option<u32>,
    /// New target weight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_weight: Option<f64>,
    /// New phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<GamePhase>,
    /// New attempt count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl GameStatePatch {
    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl GameState {
    /// Overwrite the fields present in `patch`, field by field.
    pub fn apply(&mut self, patch: &GameStatePatch) {
        if let Some(v) = patch.current_player_index {
            self.current_player_index = v;
        }
        if let Some(v) = patch.dice1 {
            self.dice1 = v;
        }
        if let Some(v) = patch.dice2 {
            self.dice2 = v;
        }
        if let Some(v) = patch.target_weight {
            self.target_weight = v;
        }
        if let Some(v) = patch.phase {
            self.phase = v;
        }
        if let Some(v) = patch.attempts {
            self.attempts = v;
        }
    }
}

// =============================================================================
// SESSION RECORD
// =============================================================================

/// A durable game session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Who created it.
    pub owner: String,
    /// Creation time (epoch seconds on the wire).
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    /// Last modification time (epoch seconds on the wire).
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_updated: DateTime<Utc>,
    /// Game settings.
    pub settings: GameSettings,
    /// Game state snapshot.
    pub game_state: GameState,
}

/// Request to create a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSession {
    /// Explicit id; a UUID is generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Display name.
    pub name: String,
    /// Creator.
    pub owner: String,
    /// Initial settings (standard preset when absent).
    #[serde(default)]
    pub settings: Option<GameSettings>,
    /// Named preset (`beginner`, `standard`, `expert`), used when
    /// `settings` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    /// Initial state (setup phase when absent).
    #[serde(default)]
    pub game_state: Option<GameState>,
}

impl NewSession {
    /// Session with default settings and state.
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            ..Default::default()
        }
    }

    /// Use an explicit id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Use explicit settings.
    pub fn with_settings(mut self, settings: GameSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Start from a named settings preset.
    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = Some(preset.into());
        self
    }

    /// Use an explicit initial state.
    pub fn with_game_state(mut self, game_state: GameState) -> Self {
        self.game_state = Some(game_state);
        self
    }
}

/// Wholesale replacement of settings and/or state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdate {
    /// Replacement settings.
    #[serde(default)]
    pub settings: Option<GameSettings>,
    /// Replacement game state.
    #[serde(default)]
    pub game_state: Option<GameState>,
}
