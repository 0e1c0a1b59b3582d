//! Session State
//!
//! One two-player game and the store that owns all of them.
//!
//! Every mutation of a [`Session`] happens under its own `RwLock`. The
//! [`SessionStore`] has a separate lock for its id table and its
//! player-to-session index; callers never hold both across an await that
//! performs I/O.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::game::clock::{format_clock, GameClock};
use crate::network::protocol::{GameStartInfo, TimeUpdate};
use crate::network::registry::Connection;
use crate::INITIAL_POSITION;

/// Session identifier. Shares one namespace with invitation ids.
pub type SessionId = String;

// =============================================================================
// SIDES, PLAYERS, MOVES
// =============================================================================

/// Board side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Moves first. Played by the challenger.
    White,
    /// Played by the challenged user.
    Black,
}

impl Side {
    /// The other side.
    pub fn opposite(self) -> Side {
        match self {
            Side::White => Side::Black,
            Side::Black => Side::White,
        }
    }

    /// Side to move given a wire turn flag.
    pub fn from_whites_turn(is_whites_turn: bool) -> Side {
        if is_whites_turn {
            Side::White
        } else {
            Side::Black
        }
    }

    /// Parse a client-reported side name.
    pub fn parse(s: &str) -> Option<Side> {
        match s.to_ascii_lowercase().as_str() {
            "white" => Some(Side::White),
            "black" => Some(Side::Black),
            _ => None,
        }
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Side::White => "white",
            Side::Black => "black",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    /// User id from the directory.
    pub id: String,
    /// Username.
    pub username: String,
}

impl Player {
    /// Create a player.
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}

/// A relayed move. Never validated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    /// Origin square.
    #[serde(default)]
    pub from: String,
    /// Destination square.
    #[serde(default)]
    pub to: String,
    /// Piece moved.
    #[serde(default)]
    pub piece: String,
}

/// Remaining seconds per side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SideTimes {
    /// White seconds.
    pub white: u32,
    /// Black seconds.
    pub black: u32,
}

impl SideTimes {
    /// Both sides with the same budget.
    pub fn even(seconds: u32) -> Self {
        Self {
            white: seconds,
            black: seconds,
        }
    }

    /// Seconds for one side.
    pub fn get(&self, side: Side) -> u32 {
        match side {
            Side::White => self.white,
            Side::Black => self.black,
        }
    }

    fn get_mut(&mut self, side: Side) -> &mut u32 {
        match side {
            Side::White => &mut self.white,
            Side::Black => &mut self.black,
        }
    }
}

// =============================================================================
// STATUS
// =============================================================================

/// Why a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinishReason {
    /// Client-reported terminal condition, trusted verbatim.
    Reported(String),
    /// A side ran out of time.
    Timeout,
    /// A participant left or disconnected.
    OpponentLeft,
    /// Never started because a participant did not turn up.
    Abandoned,
}

impl FinishReason {
    /// Wire name.
    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Reported(reason) => reason,
            FinishReason::Timeout => "timeout",
            FinishReason::OpponentLeft => "opponent_left",
            FinishReason::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle. `Finished` is terminal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// Created, waiting for both connections.
    Pending,
    /// Game running.
    InGame,
    /// Game over.
    Finished {
        /// Winning side, if one could be determined.
        winner: Option<Side>,
        /// Why it ended.
        reason: FinishReason,
    },
}

impl SessionStatus {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::InGame => "in_game",
            SessionStatus::Finished { .. } => "finished",
        }
    }

    /// Whether the status is terminal.
    pub fn is_finished(&self) -> bool {
        matches!(self, SessionStatus::Finished { .. })
    }
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No session with that id.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// User does not play in the session.
    #[error("{username} is not a player in session {session_id}")]
    NotInSession {
        /// Offending user.
        username: String,
        /// Session looked at.
        session_id: SessionId,
    },

    /// Submitted turn flag disagrees with the recorded turn.
    #[error("turn violation: it is {expected}'s turn, move claimed {claimed}")]
    TurnViolation {
        /// Side that may move.
        expected: Side,
        /// Side the client claimed.
        claimed: Side,
    },

    /// Session has not started.
    #[error("game has not started")]
    NotStarted,

    /// Session already ended.
    #[error("game is already over")]
    AlreadyFinished,

    /// Transition not allowed from the current status.
    #[error("invalid session state")]
    InvalidState,

    /// Id already used by a session or invitation.
    #[error("id {0} is already in use")]
    DuplicateId(SessionId),

    /// User already plays in another active session.
    #[error("{0} is already in a game")]
    PlayerBusy(String),
}

// =============================================================================
// SESSION
// =============================================================================

/// One two-player game.
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    white: Player,
    black: Player,
    status: SessionStatus,
    turn: Side,
    position: String,
    moves: Vec<Move>,
    remaining: SideTimes,
    connections: BTreeMap<String, Arc<Connection>>,
    clock: Arc<GameClock>,
    created_at: DateTime<Utc>,
}

impl Session {
    /// Create a pending session. The challenger plays white.
    pub fn new(id: impl Into<SessionId>, white: Player, black: Player, seconds_per_side: u32) -> Self {
        Self {
            id: id.into(),
            white,
            black,
            status: SessionStatus::Pending,
            turn: Side::White,
            position: INITIAL_POSITION.to_string(),
            moves: Vec::new(),
            remaining: SideTimes::even(seconds_per_side),
            connections: BTreeMap::new(),
            clock: Arc::new(GameClock::new()),
            created_at: Utc::now(),
        }
    }

    /// Player on a side.
    pub fn player(&self, side: Side) -> &Player {
        match side {
            Side::White => &self.white,
            Side::Black => &self.black,
        }
    }

    /// Both players, white first.
    pub fn players(&self) -> [&Player; 2] {
        [&self.white, &self.black]
    }

    /// Side played by `username`.
    pub fn side_of(&self, username: &str) -> Option<Side> {
        if self.white.username == username {
            Some(Side::White)
        } else if self.black.username == username {
            Some(Side::Black)
        } else {
            None
        }
    }

    /// Opponent of `username`.
    pub fn opponent_of(&self, username: &str) -> Option<&Player> {
        self.side_of(username).map(|side| self.player(side.opposite()))
    }

    /// Current status.
    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// Whether the session ended.
    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    /// Side to move.
    pub fn turn(&self) -> Side {
        self.turn
    }

    /// Current position payload.
    pub fn position(&self) -> &str {
        &self.position
    }

    /// Move log.
    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    /// Remaining seconds per side.
    pub fn remaining(&self) -> SideTimes {
        self.remaining
    }

    /// This session's clock.
    pub fn clock(&self) -> &Arc<GameClock> {
        &self.clock
    }

    /// When the session was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Attach a participant's connection. Returns true once both are attached.
    pub fn attach(&mut self, conn: Arc<Connection>) -> Result<bool, SessionError> {
        let username = conn.username().to_string();
        if self.side_of(&username).is_none() {
            return Err(SessionError::NotInSession {
                username,
                session_id: self.id.clone(),
            });
        }
        self.connections.insert(username, conn);
        Ok(self.all_attached())
    }

    /// Whether both participants have a live connection attached.
    pub fn all_attached(&self) -> bool {
        self.players()
            .iter()
            .all(|p| self.cached_connection(&p.username).is_some())
    }

    /// Drop a participant's cached connection.
    pub fn detach(&mut self, username: &str) {
        self.connections.remove(username);
    }

    /// Drop every cached connection.
    pub fn clear_connections(&mut self) {
        self.connections.clear();
    }

    /// Cached connection for a participant, if still live.
    pub fn cached_connection(&self, username: &str) -> Option<Arc<Connection>> {
        self.connections
            .get(username)
            .filter(|conn| conn.is_live())
            .cloned()
    }

    /// Pending to InGame.
    pub fn begin(&mut self) -> Result<(), SessionError> {
        match self.status {
            SessionStatus::Pending => {
                self.status = SessionStatus::InGame;
                Ok(())
            }
            _ => Err(SessionError::InvalidState),
        }
    }

    /// Apply a relayed move if the claimed turn matches. Returns the new turn.
    ///
    /// No field changes on error.
    pub fn apply_move(
        &mut self,
        claimed: Side,
        position: &str,
        mv: Option<Move>,
    ) -> Result<Side, SessionError> {
        match self.status {
            SessionStatus::InGame => {}
            SessionStatus::Pending => return Err(SessionError::NotStarted),
            SessionStatus::Finished { .. } => return Err(SessionError::AlreadyFinished),
        }

        if claimed != self.turn {
            return Err(SessionError::TurnViolation {
                expected: self.turn,
                claimed,
            });
        }

        self.position = position.to_string();
        if let Some(mv) = mv {
            self.moves.push(mv);
        }
        self.turn = self.turn.opposite();
        Ok(self.turn)
    }

    /// Take one second off the side to move. Returns what is left.
    ///
    /// Frozen (returns `None`) unless the session is in game.
    pub fn consume_second(&mut self) -> Option<u32> {
        if self.status != SessionStatus::InGame {
            return None;
        }
        let side = self.turn;
        let remaining = self.remaining.get_mut(side);
        *remaining = remaining.saturating_sub(1);
        Some(*remaining)
    }

    /// Enter `Finished`, stopping the clock first. Returns false if the
    /// session had already finished.
    pub fn finish(&mut self, winner: Option<Side>, reason: FinishReason) -> bool {
        if self.is_finished() {
            return false;
        }
        self.clock.stop();
        self.status = SessionStatus::Finished { winner, reason };
        true
    }

    /// Clock snapshot for `time_update`.
    pub fn time_update(&self) -> TimeUpdate {
        TimeUpdate {
            room_id: self.id.clone(),
            white_time: self.remaining.white,
            black_time: self.remaining.black,
            is_whites_turn: self.turn == Side::White,
        }
    }

    /// Personalized `game_start` content for one participant.
    pub fn game_start_for(&self, username: &str) -> Option<GameStartInfo> {
        let side = self.side_of(username)?;
        let me = self.player(side);
        let opponent = self.player(side.opposite());

        Some(GameStartInfo {
            game_id: self.id.clone(),
            game_creator_uid: self.white.id.clone(),
            position_fen: self.position.clone(),
            winner_id: String::new(),
            whites_time: format_clock(self.remaining.white),
            blacks_time: format_clock(self.remaining.black),
            is_whites_turn: self.turn == Side::White,
            is_game_over: self.is_finished(),
            moves: self.moves.clone(),
            user_id: me.id.clone(),
            opponent_username: opponent.username.clone(),
            color: side,
        })
    }
}

// =============================================================================
// SESSION STORE
// =============================================================================

#[derive(Default)]
struct StoreInner {
    sessions: BTreeMap<SessionId, Arc<RwLock<Session>>>,
    /// Players of sessions that have not finished.
    busy: BTreeMap<String, SessionId>,
}

/// Owns every session.
pub struct SessionStore {
    inner: RwLock<StoreInner>,
}

impl SessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
        }
    }

    /// Insert a session. Fails if the id is taken or either player is already
    /// in an active session.
    pub async fn insert(&self, session: Session) -> Result<Arc<RwLock<Session>>, SessionError> {
        let mut inner = self.inner.write().await;

        if inner.sessions.contains_key(&session.id) {
            return Err(SessionError::DuplicateId(session.id.clone()));
        }
        for player in session.players() {
            if inner.busy.contains_key(&player.username) {
                return Err(SessionError::PlayerBusy(player.username.clone()));
            }
        }

        let id = session.id.clone();
        for player in session.players() {
            inner.busy.insert(player.username.clone(), id.clone());
        }
        let session = Arc::new(RwLock::new(session));
        inner.sessions.insert(id, session.clone());
        Ok(session)
    }

    /// Get a session by id.
    pub async fn get(&self, id: &str) -> Option<Arc<RwLock<Session>>> {
        self.inner.read().await.sessions.get(id).cloned()
    }

    /// Whether an id is in use.
    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.sessions.contains_key(id)
    }

    /// Active session id for a player.
    pub async fn session_id_for(&self, username: &str) -> Option<SessionId> {
        self.inner.read().await.busy.get(username).cloned()
    }

    /// Active session for a player.
    pub async fn session_for(&self, username: &str) -> Option<Arc<RwLock<Session>>> {
        let inner = self.inner.read().await;
        let id = inner.busy.get(username)?;
        inner.sessions.get(id).cloned()
    }

    /// Usernames currently assigned to a Pending or InGame session.
    pub async fn busy_players(&self) -> BTreeSet<String> {
        self.inner.read().await.busy.keys().cloned().collect()
    }

    /// Free a finished session's players for new games. The session itself
    /// stays until [`SessionStore::remove`].
    pub async fn release_players(&self, id: &str) {
        let mut inner = self.inner.write().await;
        inner.busy.retain(|_, session_id| session_id != id);
    }

    /// Remove a session. Only the first caller gets it back.
    pub async fn remove(&self, id: &str) -> Option<Arc<RwLock<Session>>> {
        let mut inner = self.inner.write().await;
        let removed = inner.sessions.remove(id)?;
        inner.busy.retain(|_, session_id| session_id != id);
        Some(removed)
    }

    /// Every stored session.
    pub async fn all(&self) -> Vec<Arc<RwLock<Session>>> {
        self.inner.read().await.sessions.values().cloned().collect()
    }

    /// Number of stored sessions.
    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
