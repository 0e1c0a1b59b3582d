//! Pending Invitations
//!
//! A challenge from one user to another, alive until accepted, rejected,
//! cancelled or expired. Every resolution goes through a single atomic
//! take on [`PendingInvitationStore`], so exactly one of them wins.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::game::session::Player;

/// Default time before an unanswered invitation expires.
pub const INVITATION_TIMEOUT: Duration = Duration::from_secs(crate::INVITATION_TIMEOUT_SECS);

/// Invitation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvitationError {
    /// No pending invitation with that id. Also returned to every loser of a
    /// resolution race.
    #[error("no pending invitation {0}")]
    Unknown(String),

    /// The actor may not resolve this invitation that way.
    #[error("{username} may not {action} invitation {id}")]
    NotAllowed {
        /// Invitation id.
        id: String,
        /// Acting user.
        username: String,
        /// Attempted action.
        action: &'static str,
    },

    /// Id already used by an invitation or session.
    #[error("id {0} is already in use")]
    DuplicateId(String),

    /// A user cannot challenge themselves.
    #[error("cannot invite yourself")]
    SelfInvite,

    /// Target user is not connected.
    #[error("{0} is not online")]
    TargetOffline(String),

    /// One of the users is already playing.
    #[error("{0} is already in a game")]
    Busy(String),
}

/// Cancellable one-shot expiry timer.
#[derive(Debug, Clone, Default)]
pub struct InvitationTimer {
    cancel: CancellationToken,
}

impl InvitationTimer {
    /// Create an unarmed timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `on_expire` after `timeout` unless stopped first.
    pub fn start<F>(&self, timeout: Duration, on_expire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => on_expire.await,
            }
        });
    }

    /// Stop the timer. Safe to call more than once.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the timer was stopped.
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A challenge waiting for an answer.
#[derive(Debug, Clone)]
pub struct PendingInvitation {
    /// Invitation id. Becomes the session id on accept.
    pub id: String,
    /// Inviting user. Plays white.
    pub challenger: Player,
    /// Invited user. Plays black.
    pub challenged: Player,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry timer.
    pub timer: InvitationTimer,
}

impl PendingInvitation {
    /// Whether `username` is one of the two parties.
    pub fn involves(&self, username: &str) -> bool {
        self.challenger.username == username || self.challenged.username == username
    }

    /// The party that is not `username`.
    pub fn counterpart_of(&self, username: &str) -> Option<&Player> {
        if self.challenger.username == username {
            Some(&self.challenged)
        } else if self.challenged.username == username {
            Some(&self.challenger)
        } else {
            None
        }
    }
}

/// Pending invitations by id.
#[derive(Default)]
pub struct PendingInvitationStore {
    pending: Mutex<BTreeMap<String, PendingInvitation>>,
}

impl PendingInvitationStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an invitation and arm its timer.
    ///
    /// The timer is started while the store lock is held, so `on_expire` can
    /// never observe the store before the entry exists.
    pub async fn create<F>(
        &self,
        id: String,
        challenger: Player,
        challenged: Player,
        timeout: Duration,
        on_expire: F,
    ) -> Result<(), InvitationError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.pending.lock().await;
        if pending.contains_key(&id) {
            return Err(InvitationError::DuplicateId(id));
        }

        let timer = InvitationTimer::new();
        timer.start(timeout, on_expire);
        debug!("Invitation {} from {} to {}", id, challenger.username, challenged.username);

        pending.insert(
            id.clone(),
            PendingInvitation {
                id,
                challenger,
                challenged,
                created_at: Utc::now(),
                timer,
            },
        );
        Ok(())
    }

    /// Remove and return an invitation, stopping its timer.
    pub async fn take(&self, id: &str) -> Result<PendingInvitation, InvitationError> {
        self.take_if(id, |_| Ok(())).await
    }

    /// Remove an invitation only if `check` accepts it. A rejected check
    /// leaves the entry in place.
    pub async fn take_if<C>(&self, id: &str, check: C) -> Result<PendingInvitation, InvitationError>
    where
        C: FnOnce(&PendingInvitation) -> Result<(), InvitationError>,
    {
        let mut pending = self.pending.lock().await;
        let invitation = pending
            .get(id)
            .ok_or_else(|| InvitationError::Unknown(id.to_string()))?;
        check(invitation)?;

        let invitation = pending
            .remove(id)
            .ok_or_else(|| InvitationError::Unknown(id.to_string()))?;
        invitation.timer.stop();
        Ok(invitation)
    }

    /// Remove every invitation involving `username`, stopping their timers.
    pub async fn take_involving(&self, username: &str) -> Vec<PendingInvitation> {
        let mut pending = self.pending.lock().await;
        let ids: Vec<String> = pending
            .values()
            .filter(|inv| inv.involves(username))
            .map(|inv| inv.id.clone())
            .collect();

        ids.iter()
            .filter_map(|id| pending.remove(id))
            .inspect(|inv| inv.timer.stop())
            .collect()
    }

    /// Whether an id is pending.
    pub async fn contains(&self, id: &str) -> bool {
        self.pending.lock().await.contains_key(id)
    }

    /// Copy of a pending invitation.
    pub async fn get(&self, id: &str) -> Option<PendingInvitation> {
        self.pending.lock().await.get(id).cloned()
    }

    /// Number of pending invitations.
    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Whether nothing is pending.
    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}
