//! Room State
//!
//! Everything a room owns: the session itself, its clock, the invitations
//! that lead to it, and the directory of users that play in it.
//!
//! ## Module Structure
//!
//! - `session`: Session state machine, players, moves, session store
//! - `clock`: Per-session countdown and its hooks
//! - `invitation`: Pending invitations and their expiry timers
//! - `directory`: User directory interface and in-memory implementation

pub mod clock;
pub mod directory;
pub mod invitation;
pub mod session;

// Re-export key types
pub use clock::{ClockHooks, ClockState, GameClock};
pub use directory::{DirectoryError, InMemoryDirectory, UserDirectory, UserRecord};
pub use invitation::{InvitationError, InvitationTimer, PendingInvitation, PendingInvitationStore};
pub use session::{
    FinishReason, Move, Player, Session, SessionError, SessionId, SessionStatus, SessionStore, Side,
};
