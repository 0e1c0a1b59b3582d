//! Session Coordinator
//!
//! Owns the connection registry, the session store and the pending
//! invitation store, and implements the invitation, move and disconnect
//! protocol on top of them. Invoked once per inbound message and once per
//! connection lifecycle event.
//!
//! Every operation follows the same discipline: take one arena's lock, copy
//! out or mutate, release, and only then perform I/O. The session lock is
//! never held while looking something up in the registry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::game::clock::{format_clock, ClockHooks, TICK_INTERVAL};
use crate::game::directory::{generate_id, DirectoryError, UserDirectory};
use crate::game::invitation::{
    InvitationError, PendingInvitation, PendingInvitationStore, INVITATION_TIMEOUT,
};
use crate::game::session::{
    FinishReason, Move, Player, Session, SessionError, SessionStatus, SessionStore, Side,
};
use crate::network::channel::{ChannelError, MessageSink, MessageSource};
use crate::network::protocol::{
    ClientMessage, Envelope, GameOverInfo, GameOverPayload, InvitationPayload, MoveErrorInfo,
    MovePayload, OnlineUser, ProtocolError, RoomClosedInfo, ServerMessage, TimeUpdate,
};
use crate::network::registry::{Connection, ConnectionRegistry};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Time before an unanswered invitation expires.
    pub invitation_timeout: Duration,
    /// Clock budget per side, in seconds.
    pub seconds_per_side: u32,
    /// Clock tick period.
    pub tick_interval: Duration,
    /// Delay before removing a session that ended by checkmate.
    pub checkmate_grace: Duration,
    /// Delay before removing a session that ended on time.
    pub timeout_grace: Duration,
    /// Delay before removing a session a player left.
    pub leave_grace: Duration,
    /// How long a session may wait for both players before it is abandoned.
    pub pending_grace: Duration,
    /// Move relay delivery attempts.
    pub delivery_attempts: u32,
    /// Pause between delivery attempts.
    pub delivery_backoff: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            invitation_timeout: INVITATION_TIMEOUT,
            seconds_per_side: 600,
            tick_interval: TICK_INTERVAL,
            checkmate_grace: Duration::from_secs(2),
            timeout_grace: Duration::from_millis(200),
            leave_grace: Duration::from_millis(200),
            pending_grace: Duration::from_secs(30),
            delivery_attempts: 3,
            delivery_backoff: Duration::from_millis(100),
        }
    }
}

/// Broad error category, used to decide how an error is reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed input. Logged; the connection stays open.
    Protocol,
    /// Request does not fit current state. Reported to the client where a
    /// response message exists.
    State,
    /// A write failed after retries. The state change stands.
    Delivery,
}

/// Coordinator errors.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// Inbound message could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Session state rejected the request.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Invitation state rejected the request.
    #[error(transparent)]
    Invitation(#[from] InvitationError),

    /// Directory lookup failed.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Relay could not be delivered.
    #[error("delivery to {username} failed: {source}")]
    Delivery {
        /// Intended recipient.
        username: String,
        /// Last write error.
        #[source]
        source: ChannelError,
    },
}

impl CoordinatorError {
    /// Error category.
    pub fn class(&self) -> ErrorClass {
        match self {
            CoordinatorError::Protocol(_) => ErrorClass::Protocol,
            CoordinatorError::Session(_)
            | CoordinatorError::Invitation(_)
            | CoordinatorError::Directory(_) => ErrorClass::State,
            CoordinatorError::Delivery { .. } => ErrorClass::Delivery,
        }
    }
}

struct Inner {
    config: CoordinatorConfig,
    registry: ConnectionRegistry,
    sessions: SessionStore,
    pending: PendingInvitationStore,
    directory: Arc<dyn UserDirectory>,
}

/// Root of the real-time layer. Cheap to clone.
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    /// Create a coordinator reporting presence to `directory`.
    pub fn new(directory: Arc<dyn UserDirectory>, config: CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: ConnectionRegistry::new(),
                sessions: SessionStore::new(),
                pending: PendingInvitationStore::new(),
                directory,
            }),
        }
    }

    /// Configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Connection registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Session store.
    pub fn sessions(&self) -> &SessionStore {
        &self.inner.sessions
    }

    /// Pending invitations.
    pub fn pending(&self) -> &PendingInvitationStore {
        &self.inner.pending
    }

    /// User directory.
    pub fn directory(&self) -> &Arc<dyn UserDirectory> {
        &self.inner.directory
    }

    // =========================================================================
    // CONNECTION LIFECYCLE
    // =========================================================================

    /// Register a new connection for `username`.
    ///
    /// Any previous connection for the user is replaced and closed. If the
    /// user's session is still waiting for them, the new connection is
    /// attached and the game starts once both sides are present.
    #[instrument(skip(self, sink))]
    pub async fn connect(&self, username: &str, sink: Box<dyn MessageSink>) -> Arc<Connection> {
        let (conn, replaced) = self.inner.registry.register(username, sink).await;
        if let Some(old) = replaced {
            old.close().await;
        }

        let session = self.inner.sessions.session_for(username).await;
        log_directory(
            self.inner
                .directory
                .update_online_status(username, true, session.is_some())
                .await,
        );

        if let Some(session) = session {
            let pending = session.read().await.status() == &SessionStatus::Pending;
            if pending {
                let attached = session.write().await.attach(conn.clone());
                match attached {
                    Ok(_) => {
                        if let Err(e) = self.start_if_ready(&session).await {
                            warn!("Could not start session for {}: {}", username, e);
                        }
                    }
                    Err(e) => warn!("Could not attach {}: {}", username, e),
                }
            }
        }

        info!("{} connected as {}", username, conn.id());
        self.broadcast_online_users().await;
        conn
    }

    /// Tear down after a connection's read loop ends.
    ///
    /// A connection that was already replaced by a newer one for the same
    /// user is dropped quietly; the user is still online.
    #[instrument(skip(self, conn), fields(username = conn.username(), id = conn.id()))]
    pub async fn disconnect(&self, conn: &Arc<Connection>) {
        let username = conn.username().to_string();
        if !self.inner.registry.unregister_connection(conn).await {
            debug!("Stale connection {} for {} closed", conn.id(), username);
            return;
        }
        info!("{} disconnected", username);

        if let Err(e) = self.leave_session(&username, None).await {
            debug!("No session to leave for {}: {}", username, e);
        }

        self.cancel_invitations_involving(&username, "disconnect").await;

        log_directory(
            self.inner
                .directory
                .update_online_status(&username, false, false)
                .await,
        );
        self.broadcast_online_users().await;
    }

    /// Run a connection's read loop until the peer goes away, then tear down.
    ///
    /// Teardown also runs if this future is dropped early.
    pub async fn serve_connection<S>(&self, conn: Arc<Connection>, mut source: S)
    where
        S: MessageSource,
    {
        let mut guard = DisconnectGuard {
            coordinator: self.clone(),
            conn: Some(conn.clone()),
        };

        loop {
            let envelope = match source.receive().await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(e) if e.is_recoverable() => {
                    warn!("Dropping frame from {}: {}", conn.username(), e);
                    continue;
                }
                Err(e) => {
                    warn!("Read error for {}: {}", conn.username(), e);
                    break;
                }
            };

            if !conn.is_live() {
                break;
            }

            if let Err(e) = self.handle_message(&conn, envelope).await {
                report_error(conn.username(), &e);
            }
        }

        // Teardown runs on its own task and outlives this future.
        if let Some(conn) = guard.conn.take() {
            let coordinator = self.clone();
            let teardown = tokio::spawn(async move { coordinator.disconnect(&conn).await });
            if let Err(e) = teardown.await {
                warn!("Teardown task failed: {}", e);
            }
        }
    }

    // =========================================================================
    // DISPATCH
    // =========================================================================

    /// Handle one inbound envelope from `conn`.
    pub async fn handle_message(
        &self,
        conn: &Arc<Connection>,
        envelope: Envelope,
    ) -> Result<(), CoordinatorError> {
        let message = ClientMessage::from_envelope(&envelope)?;
        debug!("{} from {}", message.kind(), conn.username());

        match message {
            ClientMessage::RequestOnlineUsers => {
                let users = self.online_users().await;
                if let Err(e) = conn.send(&ServerMessage::OnlineUsers(users)).await {
                    debug!("online_users to {} failed: {}", conn.username(), e);
                }
                Ok(())
            }
            ClientMessage::InvitationSend(payload) => {
                let result = self.send_invitation(conn.username(), &payload).await.map(|_| ());
                self.broadcast_online_users().await;
                result
            }
            ClientMessage::InvitationAccept(payload) => {
                let result = self.accept_invitation(conn.username(), &payload).await;
                self.broadcast_online_users().await;
                result
            }
            ClientMessage::InvitationReject(payload) => {
                let result = self.reject_invitation(conn.username(), &payload).await;
                self.broadcast_online_users().await;
                result
            }
            ClientMessage::InvitationCancel(payload) => {
                let result = self.cancel_invitation(conn.username(), &payload).await;
                self.broadcast_online_users().await;
                result
            }
            ClientMessage::RoomLeave(payload) => {
                self.leave_session(conn.username(), payload.room_id()).await?;
                self.broadcast_online_users().await;
                Ok(())
            }
            ClientMessage::LeaveRoom(payload) => {
                if !payload.username.is_empty() && payload.username != conn.username() {
                    debug!(
                        "leave_room for {} sent by {}; acting as sender",
                        payload.username,
                        conn.username()
                    );
                }
                self.leave_session(conn.username(), None).await?;
                self.broadcast_online_users().await;
                Ok(())
            }
            ClientMessage::GameMove { payload, raw } => {
                let result = self.relay_move(conn.username(), payload, raw).await;
                if let Err(e) = &result {
                    let reply = ServerMessage::MoveError(MoveErrorInfo {
                        error: e.to_string(),
                    });
                    if let Err(send_err) = conn.send(&reply).await {
                        debug!("move_error to {} failed: {}", conn.username(), send_err);
                    }
                }
                result
            }
            ClientMessage::GameOverCheckmate { payload, raw } => {
                self.report_checkmate(conn.username(), &payload, raw).await
            }
        }
    }

    // =========================================================================
    // INVITATIONS
    // =========================================================================

    /// Challenge another online user. Returns the invitation id.
    #[instrument(skip(self, payload))]
    pub async fn send_invitation(
        &self,
        challenger: &str,
        payload: &InvitationPayload,
    ) -> Result<String, CoordinatorError> {
        let target = payload.to_username.trim();
        if target == challenger {
            return Err(InvitationError::SelfInvite.into());
        }
        if !self.inner.registry.is_online(target).await {
            return Err(InvitationError::TargetOffline(target.to_string()).into());
        }

        let busy = self.inner.sessions.busy_players().await;
        for username in [challenger, target] {
            if busy.contains(username) {
                return Err(InvitationError::Busy(username.to_string()).into());
            }
        }

        let challenger = self.player(challenger).await?;
        let challenged = self.player(target).await?;

        let id = match payload.room_id() {
            Some(id) => id.to_string(),
            None => generate_id(),
        };
        if self.inner.sessions.contains(&id).await {
            return Err(InvitationError::DuplicateId(id).into());
        }

        let expiry = {
            let coordinator = self.clone();
            let id = id.clone();
            async move { coordinator.expire_invitation(&id).await }
        };
        self.inner
            .pending
            .create(
                id.clone(),
                challenger.clone(),
                challenged.clone(),
                self.inner.config.invitation_timeout,
                expiry,
            )
            .await?;
        info!("Invitation {} from {} to {}", id, challenger.username, challenged.username);

        let notice = InvitationPayload {
            kind: "invitation_send".to_string(),
            from_user_id: challenger.id,
            from_username: challenger.username,
            to_user_id: challenged.id,
            to_username: challenged.username.clone(),
            room_id: Some(id.clone()),
        };
        self.send_to_user(&challenged.username, &ServerMessage::Invitation(notice))
            .await;

        Ok(id)
    }

    /// Accept an invitation and start the game. Only the challenged user may
    /// accept.
    #[instrument(skip(self, payload))]
    pub async fn accept_invitation(
        &self,
        actor: &str,
        payload: &InvitationPayload,
    ) -> Result<(), CoordinatorError> {
        let id = invitation_id(payload)?;
        let invitation = self
            .inner
            .pending
            .take_if(id, |inv| {
                if inv.challenged.username == actor {
                    Ok(())
                } else {
                    Err(InvitationError::NotAllowed {
                        id: inv.id.clone(),
                        username: actor.to_string(),
                        action: "accept",
                    })
                }
            })
            .await?;
        info!("Invitation {} accepted by {}", invitation.id, actor);

        let session = Session::new(
            invitation.id.clone(),
            invitation.challenger.clone(),
            invitation.challenged.clone(),
            self.inner.config.seconds_per_side,
        );
        let session = match self.inner.sessions.insert(session).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Invitation {} could not start: {}", invitation.id, e);
                let notice = invitation_content("invitation_cancel", &invitation);
                for player in [&invitation.challenger, &invitation.challenged] {
                    self.send_to_user(
                        &player.username,
                        &ServerMessage::InvitationCancelled(notice.clone()),
                    )
                    .await;
                }
                return Err(e.into());
            }
        };

        for player in [&invitation.challenger, &invitation.challenged] {
            self.cancel_invitations_involving(&player.username, "game started")
                .await;
        }

        let mut connections = Vec::new();
        for player in [&invitation.challenger, &invitation.challenged] {
            if let Some(conn) = self.inner.registry.lookup(&player.username).await {
                connections.push(conn);
            }
        }
        {
            let mut s = session.write().await;
            for conn in connections {
                s.attach(conn)?;
            }
        }

        if !self.start_if_ready(&session).await? {
            info!("Session {} waiting for both players", invitation.id);
            self.schedule_abandon(invitation.id.clone());
        }
        Ok(())
    }

    /// Reject an invitation. Either party may reject; the other is notified.
    #[instrument(skip(self, payload))]
    pub async fn reject_invitation(
        &self,
        actor: &str,
        payload: &InvitationPayload,
    ) -> Result<(), CoordinatorError> {
        let invitation = self.withdraw(actor, payload, "reject").await?;
        info!("Invitation {} rejected by {}", invitation.id, actor);

        if let Some(other) = invitation.counterpart_of(actor) {
            let notice = invitation_content("invitation_reject", &invitation);
            self.send_to_user(&other.username, &ServerMessage::InvitationRejected(notice))
                .await;
        }
        Ok(())
    }

    /// Cancel an invitation. Either party may cancel; the other is notified.
    #[instrument(skip(self, payload))]
    pub async fn cancel_invitation(
        &self,
        actor: &str,
        payload: &InvitationPayload,
    ) -> Result<(), CoordinatorError> {
        let invitation = self.withdraw(actor, payload, "cancel").await?;
        info!("Invitation {} cancelled by {}", invitation.id, actor);

        if let Some(other) = invitation.counterpart_of(actor) {
            let notice = invitation_content("invitation_cancel", &invitation);
            self.send_to_user(&other.username, &ServerMessage::InvitationCancelled(notice))
                .await;
        }
        Ok(())
    }

    async fn withdraw(
        &self,
        actor: &str,
        payload: &InvitationPayload,
        action: &'static str,
    ) -> Result<PendingInvitation, CoordinatorError> {
        let id = invitation_id(payload)?;
        let invitation = self
            .inner
            .pending
            .take_if(id, |inv| {
                if inv.involves(actor) {
                    Ok(())
                } else {
                    Err(InvitationError::NotAllowed {
                        id: inv.id.clone(),
                        username: actor.to_string(),
                        action,
                    })
                }
            })
            .await?;
        Ok(invitation)
    }

    /// Drop every pending invitation involving `username`, telling the other
    /// party.
    async fn cancel_invitations_involving(&self, username: &str, cause: &str) {
        for invitation in self.inner.pending.take_involving(username).await {
            info!("Invitation {} cancelled by {}", invitation.id, cause);
            if let Some(other) = invitation.counterpart_of(username) {
                let notice = invitation_content("invitation_cancel", &invitation);
                self.send_to_user(&other.username, &ServerMessage::InvitationCancelled(notice))
                    .await;
            }
        }
    }

    /// Timer path. Loses quietly if the invitation was already resolved.
    async fn expire_invitation(&self, id: &str) {
        let invitation = match self.inner.pending.take(id).await {
            Ok(invitation) => invitation,
            Err(_) => return,
        };
        info!("Invitation {} expired", id);

        let notice = invitation_content("invitation_cancel", &invitation);
        for player in [&invitation.challenger, &invitation.challenged] {
            self.send_to_user(&player.username, &ServerMessage::InvitationTimeout(notice.clone()))
                .await;
        }
        self.broadcast_online_users().await;
    }

    // =========================================================================
    // SESSIONS
    // =========================================================================

    /// Move a Pending session with both players attached into play.
    /// Returns whether it started.
    async fn start_if_ready(&self, session: &Arc<RwLock<Session>>) -> Result<bool, CoordinatorError> {
        let (session_id, clock, starts) = {
            let mut s = session.write().await;
            if s.status() != &SessionStatus::Pending || !s.all_attached() {
                return Ok(false);
            }
            s.begin()?;

            let mut starts = Vec::new();
            for player in s.players() {
                let conn = s.cached_connection(&player.username);
                let info = s.game_start_for(&player.username);
                if let (Some(conn), Some(info)) = (conn, info) {
                    starts.push((player.username.clone(), conn, info));
                }
            }
            (s.id.clone(), s.clock().clone(), starts)
        };
        info!("Session {} started", session_id);

        for (username, conn, info) in starts {
            if let Err(e) = conn.send(&ServerMessage::GameStart(info)).await {
                warn!("game_start to {} failed: {}", username, e);
            }
            log_directory(self.inner.directory.update_room_status(&username, true).await);
        }

        clock.start(
            session.clone(),
            Arc::new(self.clone()),
            self.inner.config.tick_interval,
        );
        self.broadcast_online_users().await;
        Ok(true)
    }

    /// Relay a move to `recipient` after checking the claimed turn.
    ///
    /// The position and turn are committed before delivery. If every delivery
    /// attempt fails the error is returned and the move stands.
    #[instrument(skip(self, position, mv, raw))]
    pub async fn send_move(
        &self,
        session_id: &str,
        claimed: Side,
        position: &str,
        recipient: &str,
        mv: Option<Move>,
        raw: String,
    ) -> Result<(), CoordinatorError> {
        let session = self
            .inner
            .sessions
            .get(session_id)
            .await
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;

        let (cached, clock) = {
            let mut s = session.write().await;
            if s.side_of(recipient).is_none() {
                return Err(SessionError::NotInSession {
                    username: recipient.to_string(),
                    session_id: session_id.to_string(),
                }
                .into());
            }
            s.apply_move(claimed, position, mv)?;
            (s.cached_connection(recipient), s.clock().clone())
        };
        debug!("Move in {} by {}", session_id, claimed);

        let conn = match cached {
            Some(conn) => Some(conn),
            None => self.resolve_stale(&session, recipient).await,
        };
        let delivery = match conn {
            Some(conn) => {
                self.deliver(&session, recipient, conn, &ServerMessage::GameMove(raw))
                    .await
            }
            None => Err(ChannelError::Closed),
        };

        let coordinator = self.clone();
        tokio::spawn(async move {
            clock.switch_turn(&session, &coordinator).await;
        });

        delivery.map_err(|source| {
            warn!("Move relay to {} failed: {}", recipient, source);
            CoordinatorError::Delivery {
                username: recipient.to_string(),
                source,
            }
        })
    }

    async fn relay_move(
        &self,
        actor: &str,
        payload: MovePayload,
        raw: String,
    ) -> Result<(), CoordinatorError> {
        let session = self
            .inner
            .sessions
            .get(&payload.game_id)
            .await
            .ok_or_else(|| SessionError::UnknownSession(payload.game_id.clone()))?;

        let opponent = {
            let s = session.read().await;
            s.opponent_of(actor)
                .map(|p| p.username.clone())
                .ok_or_else(|| SessionError::NotInSession {
                    username: actor.to_string(),
                    session_id: payload.game_id.clone(),
                })?
        };
        if !payload.to_username.is_empty() && payload.to_username != opponent {
            return Err(SessionError::NotInSession {
                username: payload.to_username.clone(),
                session_id: payload.game_id.clone(),
            }
            .into());
        }

        self.send_move(
            &payload.game_id,
            Side::from_whites_turn(payload.is_whites_turn),
            &payload.fen,
            &opponent,
            payload.mv,
            raw,
        )
        .await
    }

    /// Client-reported checkmate. Trusted verbatim and relayed to both players.
    async fn report_checkmate(
        &self,
        actor: &str,
        payload: &GameOverPayload,
        raw: String,
    ) -> Result<(), CoordinatorError> {
        let session = self
            .inner
            .sessions
            .get(&payload.game_id)
            .await
            .ok_or_else(|| SessionError::UnknownSession(payload.game_id.clone()))?;

        let finished = {
            let mut s = session.write().await;
            if s.side_of(actor).is_none() {
                return Err(SessionError::NotInSession {
                    username: actor.to_string(),
                    session_id: payload.game_id.clone(),
                }
                .into());
            }
            let reason = if payload.reason.is_empty() {
                "checkmate".to_string()
            } else {
                payload.reason.clone()
            };
            s.finish(Side::parse(&payload.winner), FinishReason::Reported(reason))
        };
        if !finished {
            debug!("Session {} already finished", payload.game_id);
            return Ok(());
        }
        info!("Session {} finished by {} ({})", payload.game_id, payload.reason, actor);

        self.inner.sessions.release_players(&payload.game_id).await;
        let connections = self.participants(&session).await;
        self.broadcast(&connections, &ServerMessage::GameOverCheckmate(raw)).await;
        self.schedule_cleanup(payload.game_id.clone(), self.inner.config.checkmate_grace);
        Ok(())
    }

    /// End `username`'s session because they left. The opponent wins and is
    /// told the room closed. Returns false if there was nothing to end.
    pub async fn leave_session(
        &self,
        username: &str,
        room_id: Option<&str>,
    ) -> Result<bool, CoordinatorError> {
        let session = match self.inner.sessions.session_for(username).await {
            Some(session) => session,
            None => return Ok(false),
        };

        let (session_id, remaining) = {
            let mut s = session.write().await;
            if let Some(room_id) = room_id {
                if room_id != s.id {
                    return Err(SessionError::NotInSession {
                        username: username.to_string(),
                        session_id: room_id.to_string(),
                    }
                    .into());
                }
            }
            let side = match s.side_of(username) {
                Some(side) => side,
                None => return Ok(false),
            };
            let winner = side.opposite();
            if !s.finish(Some(winner), FinishReason::OpponentLeft) {
                return Ok(false);
            }
            s.detach(username);
            (s.id.clone(), s.player(winner).username.clone())
        };
        info!("{} left session {}", username, session_id);

        self.inner.sessions.release_players(&session_id).await;

        let cached = session.read().await.cached_connection(&remaining);
        let conn = match cached {
            Some(conn) => Some(conn),
            None => self.inner.registry.lookup(&remaining).await,
        };
        if let Some(conn) = conn {
            let notice = ServerMessage::RoomClosed(RoomClosedInfo {
                room_id: session_id.clone(),
                reason: FinishReason::OpponentLeft.to_string(),
            });
            if let Err(e) = conn.send(&notice).await {
                debug!("room_closed to {} failed: {}", remaining, e);
            }
        }

        self.schedule_cleanup(session_id, self.inner.config.leave_grace);
        Ok(true)
    }

    fn schedule_abandon(&self, session_id: String) {
        let coordinator = self.clone();
        let delay = self.inner.config.pending_grace;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            coordinator.abandon_if_pending(&session_id).await;
        });
    }

    /// Close a session that is still waiting for a player. Returns false if
    /// it started or ended in the meantime.
    pub async fn abandon_if_pending(&self, session_id: &str) -> bool {
        let session = match self.inner.sessions.get(session_id).await {
            Some(session) => session,
            None => return false,
        };
        {
            let mut s = session.write().await;
            if s.status() != &SessionStatus::Pending {
                return false;
            }
            s.finish(None, FinishReason::Abandoned);
        }
        warn!("Session {} abandoned before both players joined", session_id);

        self.inner.sessions.release_players(session_id).await;
        let connections = self.participants(&session).await;
        let notice = ServerMessage::RoomClosed(RoomClosedInfo {
            room_id: session_id.to_string(),
            reason: FinishReason::Abandoned.to_string(),
        });
        self.broadcast(&connections, &notice).await;

        self.schedule_cleanup(session_id.to_string(), self.inner.config.leave_grace);
        self.broadcast_online_users().await;
        true
    }

    fn schedule_cleanup(&self, session_id: String, delay: Duration) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            coordinator.remove_session(&session_id).await;
        });
    }

    /// Remove a finished session and clear its players' room status.
    /// Later calls for the same id do nothing.
    pub async fn remove_session(&self, session_id: &str) {
        let session = match self.inner.sessions.remove(session_id).await {
            Some(session) => session,
            None => {
                debug!("Session {} already removed", session_id);
                return;
            }
        };

        let (players, clock, created_at) = {
            let mut s = session.write().await;
            s.clear_connections();
            let players: Vec<String> = s.players().iter().map(|p| p.username.clone()).collect();
            (players, s.clock().clone(), s.created_at())
        };
        clock.stop();

        for username in &players {
            log_directory(self.inner.directory.update_room_status(username, false).await);
        }
        let lifetime = chrono::Utc::now().signed_duration_since(created_at);
        info!("Session {} removed after {}s", session_id, lifetime.num_seconds());
        self.broadcast_online_users().await;
    }

    // =========================================================================
    // FAN-OUT
    // =========================================================================

    /// Online users not currently assigned to a Pending or InGame session.
    pub async fn online_users(&self) -> Vec<OnlineUser> {
        let connected = self.inner.registry.snapshot().await;
        let busy = self.inner.sessions.busy_players().await;

        let mut users = Vec::new();
        for username in connected.keys().filter(|u| !busy.contains(*u)) {
            if let Some(record) = self.inner.directory.get_user(username).await {
                users.push(OnlineUser {
                    id: record.id,
                    username: record.username,
                    is_in_room: false,
                });
            }
        }
        users
    }

    /// Send the online user list to every connection.
    pub async fn broadcast_online_users(&self) {
        let users = self.online_users().await;
        let connections: Vec<Arc<Connection>> =
            self.inner.registry.snapshot().await.into_values().collect();
        self.broadcast(&connections, &ServerMessage::OnlineUsers(users)).await;
    }

    /// Best-effort write to each connection. No lock is held here.
    async fn broadcast(&self, connections: &[Arc<Connection>], message: &ServerMessage) {
        let envelope = match message.to_envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Could not encode {}: {}", message.kind(), e);
                return;
            }
        };
        for conn in connections {
            if let Err(e) = conn.send_envelope(&envelope).await {
                debug!("{} to {} failed: {}", message.kind(), conn.username(), e);
            }
        }
    }

    async fn send_to_user(&self, username: &str, message: &ServerMessage) {
        match self.inner.registry.lookup(username).await {
            Some(conn) => {
                if let Err(e) = conn.send(message).await {
                    debug!("{} to {} failed: {}", message.kind(), username, e);
                }
            }
            None => debug!("{} to {} dropped: offline", message.kind(), username),
        }
    }

    /// Write with bounded retry and fixed backoff. A connection replaced
    /// during the backoff is swapped for the recipient's current one.
    async fn deliver(
        &self,
        session: &RwLock<Session>,
        recipient: &str,
        mut conn: Arc<Connection>,
        message: &ServerMessage,
    ) -> Result<(), ChannelError> {
        let attempts = self.inner.config.delivery_attempts.max(1);
        let mut attempt = 1;
        loop {
            match conn.send(message).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    debug!(
                        "Delivery to {} failed (attempt {}/{}): {}",
                        conn.username(),
                        attempt,
                        attempts,
                        e
                    );
                    tokio::time::sleep(self.inner.config.delivery_backoff).await;
                    if !conn.is_live() {
                        if let Some(fresh) = self.resolve_stale(session, recipient).await {
                            conn = fresh;
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Session connections, re-resolving stale ones through the registry.
    async fn participants(&self, session: &RwLock<Session>) -> Vec<Arc<Connection>> {
        let (mut connections, missing) = {
            let s = session.read().await;
            let mut connections = Vec::new();
            let mut missing = Vec::new();
            for player in s.players() {
                match s.cached_connection(&player.username) {
                    Some(conn) => connections.push(conn),
                    None => missing.push(player.username.clone()),
                }
            }
            (connections, missing)
        };

        for username in missing {
            if let Some(conn) = self.resolve_stale(session, &username).await {
                connections.push(conn);
            }
        }
        connections
    }

    /// Registry lookup with the session lock released, cached back onto the
    /// session.
    async fn resolve_stale(&self, session: &RwLock<Session>, username: &str) -> Option<Arc<Connection>> {
        let conn = self.inner.registry.lookup(username).await?;
        if let Err(e) = session.write().await.attach(conn.clone()) {
            debug!("Could not cache connection for {}: {}", username, e);
        }
        Some(conn)
    }

    async fn player(&self, username: &str) -> Result<Player, DirectoryError> {
        self.inner
            .directory
            .get_user(username)
            .await
            .map(|record| Player::new(record.id, record.username))
            .ok_or_else(|| DirectoryError::NotFound(username.to_string()))
    }
}

#[async_trait]
impl ClockHooks for SessionCoordinator {
    async fn time_update(&self, session_id: &str, update: TimeUpdate) {
        if let Some(session) = self.inner.sessions.get(session_id).await {
            let connections = self.participants(&session).await;
            self.broadcast(&connections, &ServerMessage::TimeUpdate(update)).await;
        }
    }

    async fn timed_out(&self, session_id: &str, winner: Side, update: TimeUpdate) {
        let session = match self.inner.sessions.get(session_id).await {
            Some(session) => session,
            None => return,
        };
        self.inner.sessions.release_players(session_id).await;

        let info = {
            let s = session.read().await;
            GameOverInfo {
                game_id: s.id.clone(),
                winner,
                reason: FinishReason::Timeout.to_string(),
                white_time: format_clock(update.white_time),
                black_time: format_clock(update.black_time),
                winner_id: s.player(winner).id.clone(),
                is_game_over: true,
                status: s.status().as_str().to_string(),
            }
        };

        let connections = self.participants(&session).await;
        self.broadcast(&connections, &ServerMessage::TimeUpdate(update)).await;
        self.broadcast(&connections, &ServerMessage::GameOver(info)).await;
        self.schedule_cleanup(session_id.to_string(), self.inner.config.timeout_grace);
    }
}

/// Runs teardown if a read loop is dropped before it finishes.
struct DisconnectGuard {
    coordinator: SessionCoordinator,
    conn: Option<Arc<Connection>>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let coordinator = self.coordinator.clone();
                handle.spawn(async move {
                    coordinator.disconnect(&conn).await;
                });
            }
        }
    }
}

fn invitation_id(payload: &InvitationPayload) -> Result<&str, InvitationError> {
    payload
        .room_id()
        .ok_or_else(|| InvitationError::Unknown(String::new()))
}

fn invitation_content(kind: &str, invitation: &PendingInvitation) -> InvitationPayload {
    InvitationPayload {
        kind: kind.to_string(),
        from_user_id: invitation.challenger.id.clone(),
        from_username: invitation.challenger.username.clone(),
        to_user_id: invitation.challenged.id.clone(),
        to_username: invitation.challenged.username.clone(),
        room_id: Some(invitation.id.clone()),
    }
}

fn log_directory(result: Result<(), DirectoryError>) {
    if let Err(e) = result {
        warn!("Directory update failed: {}", e);
    }
}

fn report_error(username: &str, error: &CoordinatorError) {
    match error.class() {
        ErrorClass::Protocol => warn!("Protocol error from {}: {}", username, error),
        ErrorClass::State => info!("Rejected request from {}: {}", username, error),
        ErrorClass::Delivery => warn!("Delivery failure for {}: {}", username, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::directory::{InMemoryDirectory, UserRecord};
    use crate::network::channel::{local_channel, LocalPeer};
    use crate::INITIAL_POSITION;
    use serde_json::json;

    async fn setup() -> (SessionCoordinator, Arc<InMemoryDirectory>) {
        setup_with(CoordinatorConfig {
            seconds_per_side: 60,
            ..Default::default()
        })
        .await
    }

    async fn setup_with(config: CoordinatorConfig) -> (SessionCoordinator, Arc<InMemoryDirectory>) {
        let directory = Arc::new(InMemoryDirectory::new());
        for name in ["alice", "bob", "carol"] {
            directory.create_user(name).await.unwrap();
        }
        let coordinator = SessionCoordinator::new(directory.clone(), config);
        (coordinator, directory)
    }

    async fn join(coordinator: &SessionCoordinator, username: &str) -> (Arc<Connection>, LocalPeer) {
        let (sink, _source, peer) = local_channel();
        let conn = coordinator.connect(username, Box::new(sink)).await;
        (conn, peer)
    }

    fn invitation(kind: &str, from: &str, to: &str, room: &str) -> Envelope {
        let content = json!({
            "type": kind,
            "from_username": from,
            "to_username": to,
            "room_id": room,
        });
        Envelope::new(kind, content.to_string())
    }

    fn game_move(room: &str, to: &str, fen: &str, is_whites_turn: bool) -> Envelope {
        let content = json!({
            "gameId": room,
            "toUsername": to,
            "move": {"from": "e2", "to": "e4", "piece": "P"},
            "fen": fen,
            "isWhitesTurn": is_whites_turn,
        });
        Envelope::new("game_move", content.to_string())
    }

    fn content(envelope: &Envelope) -> serde_json::Value {
        serde_json::from_str(&envelope.content).unwrap()
    }

    /// alice challenges bob with room r1 and bob accepts.
    async fn start_game(
        coordinator: &SessionCoordinator,
    ) -> (Arc<Connection>, LocalPeer, Arc<Connection>, LocalPeer) {
        let (alice, mut alice_peer) = join(coordinator, "alice").await;
        let (bob, mut bob_peer) = join(coordinator, "bob").await;

        coordinator
            .handle_message(&alice, invitation("invitation_send", "alice", "bob", "r1"))
            .await
            .unwrap();
        coordinator
            .handle_message(&bob, invitation("invitation_accept", "alice", "bob", "r1"))
            .await
            .unwrap();

        alice_peer.drain();
        bob_peer.drain();
        (alice, alice_peer, bob, bob_peer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_starts_game_for_both() {
        let (coordinator, directory) = setup().await;
        let (alice, mut alice_peer) = join(&coordinator, "alice").await;
        let (bob, mut bob_peer) = join(&coordinator, "bob").await;

        coordinator
            .handle_message(&alice, invitation("invitation_send", "alice", "bob", "r1"))
            .await
            .unwrap();

        let invites = bob_peer.drain_kind("invitation");
        assert_eq!(invites.len(), 1);
        assert_eq!(content(&invites[0])["room_id"], "r1");
        assert_eq!(content(&invites[0])["from_username"], "alice");

        coordinator
            .handle_message(&bob, invitation("invitation_accept", "alice", "bob", "r1"))
            .await
            .unwrap();

        let white = alice_peer.drain_kind("game_start");
        let black = bob_peer.drain_kind("game_start");
        assert_eq!(white.len(), 1);
        assert_eq!(black.len(), 1);

        let white = content(&white[0]);
        let black = content(&black[0]);
        assert_eq!(white["gameId"], "r1");
        assert_eq!(black["gameId"], "r1");
        assert_eq!(white["positionFen"], INITIAL_POSITION);
        assert_eq!(black["positionFen"], INITIAL_POSITION);
        assert_eq!(white["isWhitesTurn"], true);
        assert_eq!(black["isWhitesTurn"], true);
        assert_eq!(white["color"], "white");
        assert_eq!(black["color"], "black");
        assert_eq!(white["opponentUsername"], "bob");

        assert!(coordinator.pending().is_empty().await);
        assert!(directory.get_user("alice").await.unwrap().is_in_room);
        assert!(directory.get_user("bob").await.unwrap().is_in_room);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invitation_expires() {
        let (coordinator, _) = setup().await;
        let (alice, mut alice_peer) = join(&coordinator, "alice").await;
        let (bob, mut bob_peer) = join(&coordinator, "bob").await;

        coordinator
            .handle_message(&alice, invitation("invitation_send", "alice", "bob", "r1"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(21)).await;

        let a = alice_peer.drain_kind("invitation_timeout");
        let b = bob_peer.drain_kind("invitation_timeout");
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(content(&a[0])["type"], "invitation_cancel");
        assert!(!coordinator.pending().contains("r1").await);

        let err = coordinator
            .handle_message(&bob, invitation("invitation_accept", "alice", "bob", "r1"))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::State);
        assert!(coordinator.sessions().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_challenged_may_accept() {
        let (coordinator, _) = setup().await;
        let (alice, _alice_peer) = join(&coordinator, "alice").await;
        let (_bob, _bob_peer) = join(&coordinator, "bob").await;

        coordinator
            .handle_message(&alice, invitation("invitation_send", "alice", "bob", "r1"))
            .await
            .unwrap();

        let err = coordinator
            .handle_message(&alice, invitation("invitation_accept", "alice", "bob", "r1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Invitation(InvitationError::NotAllowed { .. })
        ));
        assert!(coordinator.pending().contains("r1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_notifies_challenger() {
        let (coordinator, _) = setup().await;
        let (alice, mut alice_peer) = join(&coordinator, "alice").await;
        let (bob, _bob_peer) = join(&coordinator, "bob").await;

        coordinator
            .handle_message(&alice, invitation("invitation_send", "alice", "bob", "r1"))
            .await
            .unwrap();
        coordinator
            .handle_message(&bob, invitation("invitation_reject", "alice", "bob", "r1"))
            .await
            .unwrap();

        let rejected = alice_peer.drain_kind("invitation_rejected");
        assert_eq!(rejected.len(), 1);
        assert_eq!(content(&rejected[0])["room_id"], "r1");

        // Every later resolution is a no-op
        assert!(coordinator
            .handle_message(&bob, invitation("invitation_accept", "alice", "bob", "r1"))
            .await
            .is_err());
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(alice_peer.drain_kind("invitation_timeout").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_notifies_challenged() {
        let (coordinator, _) = setup().await;
        let (alice, _alice_peer) = join(&coordinator, "alice").await;
        let (_bob, mut bob_peer) = join(&coordinator, "bob").await;

        coordinator
            .handle_message(&alice, invitation("invitation_send", "alice", "bob", "r1"))
            .await
            .unwrap();
        coordinator
            .handle_message(&alice, invitation("invitation_cancel", "alice", "bob", "r1"))
            .await
            .unwrap();

        assert_eq!(bob_peer.drain_kind("invitation_cancelled").len(), 1);
        assert!(coordinator.pending().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_resolution_wins() {
        let (coordinator, _) = setup().await;
        let (alice, _alice_peer) = join(&coordinator, "alice").await;
        let (bob, _bob_peer) = join(&coordinator, "bob").await;

        coordinator
            .handle_message(&alice, invitation("invitation_send", "alice", "bob", "r1"))
            .await
            .unwrap();

        let accept = {
            let coordinator = coordinator.clone();
            let bob = bob.clone();
            tokio::spawn(async move {
                coordinator
                    .handle_message(&bob, invitation("invitation_accept", "alice", "bob", "r1"))
                    .await
                    .is_ok()
            })
        };
        let cancel = {
            let coordinator = coordinator.clone();
            let alice = alice.clone();
            tokio::spawn(async move {
                coordinator
                    .handle_message(&alice, invitation("invitation_cancel", "alice", "bob", "r1"))
                    .await
                    .is_ok()
            })
        };

        let accepted = accept.await.unwrap();
        let cancelled = cancel.await.unwrap();
        assert!(accepted ^ cancelled);
        assert_eq!(coordinator.sessions().contains("r1").await, accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invitation_preconditions() {
        let (coordinator, _) = setup().await;
        let (alice, _alice_peer) = join(&coordinator, "alice").await;

        let err = coordinator
            .handle_message(&alice, invitation("invitation_send", "alice", "bob", "r1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Invitation(InvitationError::TargetOffline(_))
        ));

        let err = coordinator
            .handle_message(&alice, invitation("invitation_send", "alice", "alice", "r1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Invitation(InvitationError::SelfInvite)));

        let (_bob, _bob_peer) = join(&coordinator, "bob").await;
        let id = coordinator
            .send_invitation(
                "alice",
                &InvitationPayload {
                    to_username: "bob".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(id.len(), 32);
        assert!(coordinator.pending().contains(&id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_players_cannot_be_invited() {
        let (coordinator, _) = setup().await;
        let (_alice, _ap, _bob, _bp) = start_game(&coordinator).await;
        let (carol, _carol_peer) = join(&coordinator, "carol").await;

        let err = coordinator
            .handle_message(&carol, invitation("invitation_send", "carol", "bob", "r2"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Invitation(InvitationError::Busy(_))));

        // Id already used by a live session
        let (_dave_conn, _dave_peer) = {
            let (sink, _source, peer) = local_channel();
            coordinator.directory().create_user("dave").await.unwrap();
            (coordinator.connect("dave", Box::new(sink)).await, peer)
        };
        let err = coordinator
            .handle_message(&carol, invitation("invitation_send", "carol", "dave", "r1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Invitation(InvitationError::DuplicateId(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_relayed_verbatim() {
        let (coordinator, _) = setup().await;
        let (alice, mut alice_peer, _bob, mut bob_peer) = start_game(&coordinator).await;

        let envelope = game_move("r1", "bob", "after-e4", true);
        let raw = envelope.content.clone();
        coordinator.handle_message(&alice, envelope).await.unwrap();

        let moves = bob_peer.drain_kind("game_move");
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].content, raw);
        assert!(alice_peer.drain_kind("move_error").is_empty());

        let session = coordinator.sessions().get("r1").await.unwrap();
        let s = session.read().await;
        assert_eq!(s.turn(), Side::Black);
        assert_eq!(s.position(), "after-e4");
        assert_eq!(s.moves().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_violation_reports_move_error() {
        let (coordinator, _) = setup().await;
        let (alice, mut alice_peer, bob, mut bob_peer) = start_game(&coordinator).await;

        let err = coordinator
            .handle_message(&bob, game_move("r1", "alice", "bogus", false))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Session(SessionError::TurnViolation { .. })
        ));
        assert_eq!(bob_peer.drain_kind("move_error").len(), 1);
        assert!(alice_peer.drain_kind("game_move").is_empty());

        let session = coordinator.sessions().get("r1").await.unwrap();
        assert_eq!(session.read().await.position(), INITIAL_POSITION);
        assert_eq!(session.read().await.turn(), Side::White);
        drop(alice);
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_switches_clock() {
        let (coordinator, _) = setup().await;
        let (alice, mut alice_peer, _bob, mut bob_peer) = start_game(&coordinator).await;

        tokio::time::sleep(Duration::from_millis(2500)).await;
        coordinator
            .handle_message(&alice, game_move("r1", "bob", "p1", true))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let session = coordinator.sessions().get("r1").await.unwrap();
        let remaining = session.read().await.remaining();
        assert_eq!(remaining.white, 58);
        assert_eq!(remaining.black, 59);

        let updates = bob_peer.drain_kind("time_update");
        assert!(updates.iter().any(|u| content(u)["isWhitesTurn"] == false));
        assert!(!alice_peer.drain_kind("time_update").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_failure_keeps_move() {
        let (coordinator, _) = setup().await;
        let (alice, mut alice_peer, _bob, bob_peer) = start_game(&coordinator).await;
        drop(bob_peer);

        let err = coordinator
            .handle_message(&alice, game_move("r1", "bob", "p1", true))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Delivery);
        assert_eq!(alice_peer.drain_kind("move_error").len(), 1);

        let session = coordinator.sessions().get("r1").await.unwrap();
        assert_eq!(session.read().await.turn(), Side::Black);
        assert_eq!(session.read().await.position(), "p1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkmate_relayed_and_cleaned_up() {
        let (coordinator, directory) = setup().await;
        let (alice, mut alice_peer, _bob, mut bob_peer) = start_game(&coordinator).await;

        let content = json!({"gameId": "r1", "winner": "white", "reason": "checkmate", "winnerId": "x"});
        let envelope = Envelope::new("game_over_checkmate", content.to_string());
        coordinator.handle_message(&alice, envelope.clone()).await.unwrap();

        assert_eq!(alice_peer.drain_kind("game_over_checkmate")[0].content, envelope.content);
        assert_eq!(bob_peer.drain_kind("game_over_checkmate").len(), 1);

        let session = coordinator.sessions().get("r1").await.unwrap();
        assert_eq!(
            session.read().await.status(),
            &SessionStatus::Finished {
                winner: Some(Side::White),
                reason: FinishReason::Reported("checkmate".into()),
            }
        );

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(coordinator.sessions().is_empty().await);
        assert!(!directory.get_user("alice").await.unwrap().is_in_room);
        assert!(!directory.get_user("bob").await.unwrap().is_in_room);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_timeout_ends_game() {
        let (coordinator, _) = setup_with(CoordinatorConfig {
            seconds_per_side: 3,
            ..Default::default()
        })
        .await;
        let (_alice, mut alice_peer, _bob, mut bob_peer) = start_game(&coordinator).await;

        tokio::time::sleep(Duration::from_millis(3100)).await;

        let over = bob_peer.drain_kind("game_over");
        assert_eq!(over.len(), 1);
        let info = content(&over[0]);
        assert_eq!(info["winner"], "black");
        assert_eq!(info["reason"], "timeout");
        assert_eq!(info["whiteTime"], "00:00");
        assert_eq!(info["isGameOver"], true);
        assert_eq!(alice_peer.drain_kind("game_over").len(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(coordinator.sessions().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_closes_room() {
        let (coordinator, directory) = setup().await;
        let (alice, _alice_peer, _bob, mut bob_peer) = start_game(&coordinator).await;

        coordinator.disconnect(&alice).await;

        let closed = bob_peer.drain_kind("room_closed");
        assert_eq!(closed.len(), 1);
        assert_eq!(content(&closed[0])["room_id"], "r1");
        assert_eq!(content(&closed[0])["reason"], "opponent_left");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(coordinator.sessions().is_empty().await);
        assert!(!directory.get_user("alice").await.unwrap().is_online);
        assert!(!directory.get_user("bob").await.unwrap().is_in_room);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_disconnects_remove_once() {
        let (coordinator, directory) = setup().await;
        let (alice, _alice_peer, bob, _bob_peer) = start_game(&coordinator).await;

        let a = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.disconnect(&alice).await })
        };
        let b = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.disconnect(&bob).await })
        };
        a.await.unwrap();
        b.await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(coordinator.sessions().is_empty().await);
        assert!(coordinator.registry().is_empty().await);
        for name in ["alice", "bob"] {
            let user = directory.get_user(name).await.unwrap();
            assert!(!user.is_online);
            assert!(!user.is_in_room);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_users_excludes_players() {
        let (coordinator, _) = setup().await;
        let (_carol, mut carol_peer) = join(&coordinator, "carol").await;
        let (_alice, _ap, _bob, _bp) = start_game(&coordinator).await;

        let lists = carol_peer.drain_kind("online_users");
        let last = content(lists.last().unwrap());
        let names: Vec<&str> = last
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["username"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["carol"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_room_finishes_for_sender() {
        let (coordinator, _) = setup().await;
        let (_alice, mut alice_peer, bob, _bob_peer) = start_game(&coordinator).await;

        let envelope = Envelope::new("leave_room", json!({"username": "bob"}).to_string());
        coordinator.handle_message(&bob, envelope).await.unwrap();

        assert_eq!(alice_peer.drain_kind("room_closed").len(), 1);
        let session = coordinator.sessions().get("r1").await.unwrap();
        assert_eq!(
            session.read().await.status(),
            &SessionStatus::Finished {
                winner: Some(Side::White),
                reason: FinishReason::OpponentLeft,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_keeps_session() {
        let (coordinator, _) = setup().await;
        let (alice, _old_peer, bob, mut bob_peer) = start_game(&coordinator).await;

        let (sink, _source, mut new_peer) = local_channel();
        let fresh = coordinator.connect("alice", Box::new(sink)).await;
        assert!(!alice.is_live());

        // The stale loop's teardown must not end the game
        coordinator.disconnect(&alice).await;
        assert!(coordinator.registry().is_online("alice").await);
        assert!(bob_peer.drain_kind("room_closed").is_empty());

        coordinator
            .handle_message(&bob, game_move("r1", "alice", "p0", false))
            .await
            .unwrap_err();
        coordinator
            .handle_message(&fresh, game_move("r1", "bob", "p1", true))
            .await
            .unwrap();
        coordinator
            .handle_message(&bob, game_move("r1", "alice", "p2", false))
            .await
            .unwrap();
        assert_eq!(new_peer.drain_kind("game_move").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_loop_survives_bad_frames() {
        let (coordinator, _) = setup().await;
        let (sink, source, peer) = local_channel();
        let LocalPeer { mut inbox, outbox } = peer;
        let conn = coordinator.connect("alice", Box::new(sink)).await;

        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.serve_connection(conn, source).await })
        };

        outbox.send(Envelope::new("no_such_type", "")).unwrap();
        outbox.send(Envelope::new("invitation_send", "{not json")).unwrap();
        outbox.send(Envelope::new("request_online_users", "")).unwrap();
        drop(outbox);
        task.await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(envelope) = inbox.try_recv() {
            kinds.push(envelope.kind);
        }
        assert_eq!(kinds.iter().filter(|k| *k == "online_users").count(), 2);
        assert!(coordinator.registry().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_starting_game_cancels_other_invitations() {
        let (coordinator, _) = setup().await;
        let (alice, mut alice_peer) = join(&coordinator, "alice").await;
        let (bob, _bob_peer) = join(&coordinator, "bob").await;
        let (carol, mut carol_peer) = join(&coordinator, "carol").await;

        coordinator
            .handle_message(&alice, invitation("invitation_send", "alice", "bob", "r1"))
            .await
            .unwrap();
        coordinator
            .handle_message(&alice, invitation("invitation_send", "alice", "carol", "r2"))
            .await
            .unwrap();
        carol_peer.drain();

        coordinator
            .handle_message(&bob, invitation("invitation_accept", "alice", "bob", "r1"))
            .await
            .unwrap();

        let cancelled = carol_peer.drain_kind("invitation_cancelled");
        assert_eq!(cancelled.len(), 1);
        assert_eq!(content(&cancelled[0])["room_id"], "r2");
        assert!(!coordinator.pending().contains("r2").await);
        assert_eq!(alice_peer.drain_kind("game_start").len(), 1);

        let err = coordinator
            .handle_message(&carol, invitation("invitation_accept", "alice", "carol", "r2"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Invitation(InvitationError::Unknown(_))));
        assert!(coordinator.sessions().get("r2").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_into_busy_player_notifies_both() {
        let (coordinator, _) = setup().await;
        let (alice, mut alice_peer) = join(&coordinator, "alice").await;
        let (bob, mut bob_peer) = join(&coordinator, "bob").await;

        coordinator
            .handle_message(&alice, invitation("invitation_send", "alice", "bob", "r1"))
            .await
            .unwrap();
        coordinator
            .sessions()
            .insert(Session::new(
                "r9",
                Player::new("c-id", "carol"),
                Player::new("b-id", "bob"),
                60,
            ))
            .await
            .unwrap();
        alice_peer.drain();
        bob_peer.drain();

        let err = coordinator
            .handle_message(&bob, invitation("invitation_accept", "alice", "bob", "r1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Session(SessionError::PlayerBusy(_))));

        for peer in [&mut alice_peer, &mut bob_peer] {
            let cancelled = peer.drain_kind("invitation_cancelled");
            assert_eq!(cancelled.len(), 1);
            assert_eq!(content(&cancelled[0])["room_id"], "r1");
        }
        assert!(coordinator.sessions().get("r1").await.is_none());
    }

    /// alice goes missing between sending r1 and bob accepting it.
    async fn accept_while_challenger_missing(
        coordinator: &SessionCoordinator,
    ) -> (Arc<Connection>, LocalPeer) {
        let (alice, _alice_peer) = join(coordinator, "alice").await;
        let (bob, mut bob_peer) = join(coordinator, "bob").await;

        coordinator
            .handle_message(&alice, invitation("invitation_send", "alice", "bob", "r1"))
            .await
            .unwrap();
        assert!(coordinator.registry().unregister_connection(&alice).await);

        coordinator
            .handle_message(&bob, invitation("invitation_accept", "alice", "bob", "r1"))
            .await
            .unwrap();
        assert!(bob_peer.drain_kind("game_start").is_empty());

        let session = coordinator.sessions().get("r1").await.unwrap();
        assert_eq!(session.read().await.status(), &SessionStatus::Pending);
        (bob, bob_peer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_session_starts_on_reconnect() {
        let (coordinator, _) = setup().await;
        let (_bob, mut bob_peer) = accept_while_challenger_missing(&coordinator).await;

        let (_alice, mut alice_peer) = join(&coordinator, "alice").await;

        let alice_start = alice_peer.drain_kind("game_start");
        assert_eq!(alice_start.len(), 1);
        assert_eq!(content(&alice_start[0])["gameId"], "r1");
        assert_eq!(bob_peer.drain_kind("game_start").len(), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let session = coordinator.sessions().get("r1").await.unwrap();
        assert_eq!(session.read().await.status(), &SessionStatus::InGame);
        assert_eq!(session.read().await.remaining().white, 59);

        // The abandon timer finds a running game and leaves it alone
        tokio::time::sleep(coordinator.config().pending_grace).await;
        assert_eq!(session.read().await.status(), &SessionStatus::InGame);
        assert!(bob_peer.drain_kind("room_closed").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_session_abandoned_after_grace() {
        let (coordinator, _) = setup().await;
        let (bob, mut bob_peer) = accept_while_challenger_missing(&coordinator).await;
        let (carol, _carol_peer) = join(&coordinator, "carol").await;

        tokio::time::sleep(coordinator.config().pending_grace + Duration::from_secs(1)).await;

        let closed = bob_peer.drain_kind("room_closed");
        assert_eq!(closed.len(), 1);
        assert_eq!(content(&closed[0])["reason"], "abandoned");
        assert!(coordinator.sessions().is_empty().await);
        assert!(coordinator.sessions().busy_players().await.is_empty());

        let online = coordinator.online_users().await;
        assert!(online.iter().any(|u| u.username == "bob"));

        let payload = InvitationPayload {
            kind: "invitation_send".into(),
            from_user_id: String::new(),
            from_username: "carol".into(),
            to_user_id: String::new(),
            to_username: bob.username().to_string(),
            room_id: Some("r2".into()),
        };
        coordinator.send_invitation(carol.username(), &payload).await.unwrap();
        assert!(!coordinator.abandon_if_pending("r1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_retry_follows_reconnect() {
        let (coordinator, _) = setup().await;
        let (alice, _alice_peer, _bob, bob_peer) = start_game(&coordinator).await;
        drop(bob_peer);

        let relay = {
            let coordinator = coordinator.clone();
            let alice = alice.clone();
            tokio::spawn(async move {
                coordinator
                    .handle_message(&alice, game_move("r1", "bob", "p1", true))
                    .await
            })
        };

        // Reconnect while the first failed attempt is backing off
        tokio::time::sleep(coordinator.config().delivery_backoff / 2).await;
        let (_fresh, mut fresh_peer) = join(&coordinator, "bob").await;

        relay.await.unwrap().unwrap();
        assert_eq!(fresh_peer.drain_kind("game_move").len(), 1);
    }

    /// Directory whose offline update takes a second.
    struct SlowOfflineDirectory(InMemoryDirectory);

    #[async_trait]
    impl UserDirectory for SlowOfflineDirectory {
        async fn get_user(&self, username: &str) -> Option<UserRecord> {
            self.0.get_user(username).await
        }

        async fn update_online_status(
            &self,
            username: &str,
            is_online: bool,
            is_in_room: bool,
        ) -> Result<(), DirectoryError> {
            if !is_online {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            self.0.update_online_status(username, is_online, is_in_room).await
        }

        async fn update_room_status(&self, username: &str, is_in_room: bool) -> Result<(), DirectoryError> {
            self.0.update_room_status(username, is_in_room).await
        }

        async fn create_user(&self, username: &str) -> Result<UserRecord, DirectoryError> {
            self.0.create_user(username).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_finishes_after_read_loop_dropped() {
        let directory = Arc::new(SlowOfflineDirectory(InMemoryDirectory::new()));
        directory.create_user("alice").await.unwrap();
        let coordinator = SessionCoordinator::new(directory.clone(), CoordinatorConfig::default());

        let (sink, source, peer) = local_channel();
        let LocalPeer { inbox: _inbox, outbox } = peer;
        let conn = coordinator.connect("alice", Box::new(sink)).await;
        drop(outbox);

        let served = tokio::time::timeout(
            Duration::from_millis(100),
            coordinator.serve_connection(conn, source),
        )
        .await;
        assert!(served.is_err());
        assert!(directory.get_user("alice").await.unwrap().is_online);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!directory.get_user("alice").await.unwrap().is_online);
        assert!(coordinator.registry().is_empty().await);
    }
}
