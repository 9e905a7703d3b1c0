//! Durable Session Registry
//!
//! In-memory store of game sessions keyed by id. Sessions older than
//! [`SESSION_TTL_SECS`] are pruned on every listing and by the server's
//! periodic prune tick; nothing else removes them except an explicit delete.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::model::{GameSettings, NewSession, Session, SessionUpdate};

/// Sessions are retained while `now - created_at <= SESSION_TTL_SECS`.
pub const SESSION_TTL_SECS: i64 = 6 * 60 * 60;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No session with that id.
    #[error("session {0} not found")]
    NotFound(String),

    /// Explicit id already in use.
    #[error("session {0} already exists")]
    DuplicateSession(String),

    /// No settings preset by that name.
    #[error("unknown settings preset {0}")]
    UnknownPreset(String),
}

// =============================================================================
// CLOCK
// =============================================================================

/// Wall-clock source.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// System time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for driving expiry by hand.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Jump to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }

    /// Move forward by `secs` seconds.
    pub fn advance_secs(&self, secs: i64) {
        if let Ok(mut now) = self.now.lock() {
            *now += Duration::seconds(secs);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Session store.
pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<String, Session>>,
    clock: Arc<dyn Clock>,
}

impl SessionRegistry {
    /// Registry on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Registry on a caller-supplied clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            clock,
        }
    }

    fn is_live(session: &Session, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(session.created_at) <= Duration::seconds(SESSION_TTL_SECS)
    }

    /// Create a session. An explicit id that is already taken is rejected.
    ///
    /// Explicit settings win over a named preset; with neither, the
    /// standard preset applies.
    pub async fn create(&self, request: NewSession) -> Result<Session, RegistryError> {
        let settings = match (request.settings, request.preset) {
            (Some(settings), _) => settings,
            (None, Some(name)) => GameSettings::preset(&name).ok_or(RegistryError::UnknownPreset(name))?,
            (None, None) => GameSettings::default(),
        };

        let now = self.clock.now();
        let mut sessions = self.sessions.write().await;

        let id = match request.id {
            Some(id) if sessions.contains_key(&id) => {
                return Err(RegistryError::DuplicateSession(id));
            }
            Some(id) => id,
            None => loop {
                let id = Uuid::new_v4().to_string();
                if !sessions.contains_key(&id) {
                    break id;
                }
            },
        };

        let session = Session {
            id: id.clone(),
            name: request.name,
            owner: request.owner,
            created_at: now,
            last_updated: now,
            settings,
            game_state: request.game_state.unwrap_or_default(),
        };
        sessions.insert(id, session.clone());

        info!("Created session {} ({})", session.id, session.name);
        Ok(session)
    }

    /// Fetch a session.
    pub async fn get(&self, id: &str) -> Result<Session, RegistryError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Replace settings and/or state, bumping `last_updated`.
    pub async fn update(&self, id: &str, update: SessionUpdate) -> Result<Session, RegistryError> {
        let now = self.clock.now();
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if let Some(settings) = update.settings {
            session.settings = settings;
        }
        if let Some(game_state) = update.game_state {
            session.game_state = game_state;
        }
        session.last_updated = now;

        debug!("Updated session {}", id);
        Ok(session.clone())
    }

    /// Remove a session. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            info!("Deleted session {}", id);
        }
        removed
    }

    /// Prune expired sessions, then return the survivors oldest first.
    pub async fn list(&self) -> Vec<Session> {
        let now = self.clock.now();
        let mut sessions = self.sessions.write().await;
        Self::prune_locked(&mut sessions, now);

        let mut live: Vec<Session> = sessions.values().cloned().collect();
        live.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        live
    }

    /// Drop expired sessions. Returns how many were removed.
    pub async fn prune_expired(&self) -> usize {
        let now = self.clock.now();
        let mut sessions = self.sessions.write().await;
        Self::prune_locked(&mut sessions, now)
    }

    fn prune_locked(sessions: &mut BTreeMap<String, Session>, now: DateTime<Utc>) -> usize {
        let before = sessions.len();
        sessions.retain(|_, s| Self::is_live(s, now));
        let pruned = before - sessions.len();
        if pruned > 0 {
            info!("Pruned {} expired sessions", pruned);
        }
        pruned
    }

    /// Stored sessions, expired or not.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::{GamePhase, GameSettings, GameState};
    use chrono::TimeZone;

    fn fixed_clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 14, 18, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_create_generates_unique_ids() {
        let registry = SessionRegistry::new();

        let a = registry.create(NewSession::new("a", "ana")).await.unwrap();
        let b = registry.create(NewSession::new("b", "ben")).await.unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.settings, GameSettings::standard());
        assert_eq!(a.game_state.phase, GamePhase::Setup);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_explicit_id_collision() {
        let registry = SessionRegistry::new();
        registry
            .create(NewSession::new("first", "ana").with_id("table-1"))
            .await
            .unwrap();

        let err = registry
            .create(NewSession::new("second", "ben").with_id("table-1"))
            .await
            .unwrap_err();

        assert_eq!(err, RegistryError::DuplicateSession("table-1".into()));
        assert_eq!(registry.get("table-1").await.unwrap().name, "first");
    }

    #[tokio::test]
    async fn test_update_replaces_and_touches() {
        let clock = fixed_clock();
        let registry = SessionRegistry::with_clock(Arc::new(clock.clone()));
        let created = registry.create(NewSession::new("a", "ana")).await.unwrap();

        clock.advance_secs(30);
        let state = GameState {
            dice1: 2,
            dice2: 6,
            phase: GamePhase::Drinking,
            ..Default::default()
        };
        let updated = registry
            .update(
                &created.id,
                SessionUpdate {
                    settings: None,
                    game_state: Some(state.clone()),
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.game_state, state);
        assert_eq!(updated.settings, created.settings);
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!((updated.last_updated - created.last_updated).num_seconds(), 30);
    }

    #[tokio::test]
    async fn test_missing_session() {
        let registry = SessionRegistry::new();

        assert_eq!(registry.get("nope").await, Err(RegistryError::NotFound("nope".into())));
        assert!(registry.update("nope", SessionUpdate::default()).await.is_err());
        assert!(!registry.delete("nope").await);
    }

    #[tokio::test]
    async fn test_delete() {
        let registry = SessionRegistry::new();
        let s = registry.create(NewSession::new("a", "ana")).await.unwrap();

        assert!(registry.delete(&s.id).await);
        assert!(!registry.delete(&s.id).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_list_prunes_at_six_hours() {
        let clock = fixed_clock();
        let registry = SessionRegistry::with_clock(Arc::new(clock.clone()));

        registry.create(NewSession::new("old", "ana").with_id("old")).await.unwrap();
        clock.advance_secs(2);
        registry.create(NewSession::new("young", "ben").with_id("young")).await.unwrap();

        // old is now 21601s, young 21599s
        clock.advance_secs(SESSION_TTL_SECS - 1);
        let live = registry.list().await;

        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "young");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_exact_ttl_is_retained() {
        let clock = fixed_clock();
        let registry = SessionRegistry::with_clock(Arc::new(clock.clone()));
        registry.create(NewSession::new("edge", "ana")).await.unwrap();

        clock.advance_secs(SESSION_TTL_SECS);
        assert_eq!(registry.prune_expired().await, 0);

        clock.advance_secs(1);
        assert_eq!(registry.prune_expired().await, 1);
    }

    #[tokio::test]
    async fn test_list_is_oldest_first() {
        let clock = fixed_clock();
        let registry = SessionRegistry::with_clock(Arc::new(clock.clone()));

        for name in ["first", "second", "third"] {
            registry.create(NewSession::new(name, "ana")).await.unwrap();
            clock.advance_secs(60);
        }

        let names: Vec<String> = registry.list().await.into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_create_from_preset() {
        let registry = SessionRegistry::new();

        let expert = registry
            .create(NewSession::new("hard", "ana").with_preset("expert"))
            .await
            .unwrap();
        assert_eq!(expert.settings, GameSettings::expert());

        let explicit = registry
            .create(NewSession::new("mine", "ben").with_preset("expert").with_settings(GameSettings::beginner()))
            .await
            .unwrap();
        assert_eq!(explicit.settings, GameSettings::beginner());

        let err = registry
            .create(NewSession::new("odd", "cy").with_id("odd").with_preset("legendary"))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::UnknownPreset("legendary".into()));
        assert_eq!(registry.get("odd").await, Err(RegistryError::NotFound("odd".into())));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_create_same_id() {
        let registry = Arc::new(SessionRegistry::new());

        let attempts: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .create(NewSession::new(format!("table {i}"), "ana").with_id("x"))
                        .await
                })
            })
            .collect();

        let mut created = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert_eq!(e, RegistryError::DuplicateSession("x".into())),
            }
        }

        assert_eq!(created, 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_update_racing_prune_never_revives() {
        let clock = fixed_clock();
        let registry = Arc::new(SessionRegistry::with_clock(Arc::new(clock.clone())));
        for i in 0..8 {
            registry
                .create(NewSession::new("old", "ana").with_id(format!("s{i}")))
                .await
                .unwrap();
        }
        clock.advance_secs(SESSION_TTL_SECS + 1);

        let update = SessionUpdate {
            game_state: Some(GameState {
                attempts: 2,
                ..Default::default()
            }),
            ..Default::default()
        };

        let updates: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                let update = update.clone();
                tokio::spawn(async move { registry.update(&format!("s{i}"), update).await })
            })
            .collect();
        let listing = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.list().await })
        };

        assert!(listing.await.unwrap().is_empty());
        for handle in updates {
            // Either the update landed before the prune or it saw the id gone.
            if let Err(e) = handle.await.unwrap() {
                assert!(matches!(e, RegistryError::NotFound(_)));
            }
        }

        assert!(registry.is_empty().await);
        for i in 0..8 {
            let id = format!("s{i}");
            assert_eq!(registry.update(&id, update.clone()).await, Err(RegistryError::NotFound(id)));
        }
        assert!(registry.list().await.is_empty());
    }
}
